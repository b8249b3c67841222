use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::path::PathLimits;
use crate::storage::kv::KvStore;

// ── Worker CLI ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "folio-disk", about = "Virtual disk worker speaking JSON-RPC over stdio")]
pub struct CliArgs {
    /// Directory holding persisted disks (key-value file, database files,
    /// directory namespaces). Without it everything lives in memory or in
    /// the system temp directory.
    #[arg(long, env = "FOLIO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Disk type to host: MemDisk, LocalStorageDisk, OpFsDisk, IndexedDbDisk, NullDisk
    #[arg(long, default_value = "MemDisk", env = "FOLIO_DISK_TYPE")]
    pub disk_type: String,

    /// Disk guid. A fresh one is generated when omitted.
    #[arg(long, env = "FOLIO_DISK_GUID")]
    pub guid: Option<String>,

    /// Snapshot JSON file to restore the disk from. Overrides --disk-type
    /// and --guid.
    #[arg(long, env = "FOLIO_DISK_SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// Delete the backend namespace when the disk is destroyed
    #[arg(long, env = "FOLIO_DELETE_ON_TEARDOWN")]
    pub delete_on_teardown: bool,

    /// Maximum path length in bytes
    #[arg(long, default_value = "4096")]
    pub max_path_length: usize,

    /// Maximum length of a single path segment
    #[arg(long, default_value = "255")]
    pub max_name_length: usize,

    /// Maximum path depth
    #[arg(long, default_value = "64")]
    pub max_path_depth: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FOLIO_LOG_LEVEL")]
    pub log_level: String,
}

impl CliArgs {
    pub fn context(&self) -> DiskContext {
        let limits = PathLimits {
            max_path_length: self.max_path_length,
            max_name_length: self.max_name_length,
            max_path_depth: self.max_path_depth,
        };
        let ctx = match &self.data_dir {
            Some(dir) => DiskContext::with_data_dir(dir),
            None => DiskContext::ephemeral(),
        };
        ctx.limits(limits).delete_on_teardown(self.delete_on_teardown)
    }
}

// ── Application context ─────────────────────────────────────────────────────

const KV_FILE: &str = "localstorage.json";
const DIRECTORY_ROOT: &str = "opfs";
const DATABASE_ROOT: &str = "idb";

/// Everything a disk needs from its surroundings. Built once per
/// application and handed to the factory.
#[derive(Debug, Clone)]
pub struct DiskContext {
    data_dir: Option<PathBuf>,
    limits: PathLimits,
    delete_on_teardown: bool,
    kv: Arc<KvStore>,
}

impl DiskContext {
    /// Key-value data stays in memory; directory and database disks use the
    /// system temp directory.
    pub fn ephemeral() -> Self {
        Self {
            data_dir: None,
            limits: PathLimits::default(),
            delete_on_teardown: false,
            kv: KvStore::ephemeral(),
        }
    }

    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            kv: KvStore::persistent(dir.join(KV_FILE)),
            data_dir: Some(dir),
            limits: PathLimits::default(),
            delete_on_teardown: false,
        }
    }

    pub fn limits(mut self, limits: PathLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn delete_on_teardown(mut self, delete: bool) -> Self {
        self.delete_on_teardown = delete;
        self
    }

    pub fn path_limits(&self) -> &PathLimits {
        &self.limits
    }

    pub fn deletes_on_teardown(&self) -> bool {
        self.delete_on_teardown
    }

    pub fn data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }

    pub fn kv_store(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    fn storage_root(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("folio-disk"))
    }

    /// Host directory backing the directory disk `guid`.
    pub fn directory_root(&self, guid: &str) -> PathBuf {
        self.storage_root().join(DIRECTORY_ROOT).join(guid)
    }

    /// Database file backing the database disk `guid`.
    pub fn database_file(&self, guid: &str) -> PathBuf {
        self.storage_root()
            .join(DATABASE_ROOT)
            .join(format!("{}.db.gz", guid))
    }
}

impl Default for DiskContext {
    fn default() -> Self {
        Self::ephemeral()
    }
}
