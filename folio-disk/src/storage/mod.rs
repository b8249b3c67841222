// ---------------------------------------------------------------------------
// Storage backend adapters
// ---------------------------------------------------------------------------
//
// One adapter per substrate. Every adapter speaks normalized absolute paths
// and reports failures as `StorageError`, so the layers above never see a
// backend-specific error shape.
// ---------------------------------------------------------------------------

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StorageError;
use crate::path::AbsPath;
use crate::tree::NodeKind;

pub mod database;
pub mod directory;
pub mod kv;
pub mod memory;
mod records;

pub use database::DatabaseStorage;
pub use directory::DirectoryStorage;
pub use kv::KvStorage;
pub use memory::MemoryStorage;

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
	pub is_directory: bool,
	/// Size in bytes, 0 for directories.
	pub size: u64,
	/// Last modification, milliseconds since the Unix epoch.
	pub mtime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
	pub name: String,
	/// Kind of the entry, or of its target when it is a symlink.
	pub kind: NodeKind,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub is_link: bool,
}

/// What a backend can do beyond the required primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
	pub symlinks: bool,
	pub atomic_rename: bool,
}

pub(crate) fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Primitive file operations over one storage substrate.
///
/// Paths are always normalized and absolute; `/` is the backend's root.
/// Implementations do not serialize concurrent mutations themselves, the
/// owning disk does that through its lock.
#[async_trait]
pub trait StorageBackend: Send + Sync {
	/// Short identifier used in logs and `Unsupported` errors.
	fn name(&self) -> &'static str;

	fn capabilities(&self) -> Capabilities;

	/// Open the underlying substrate (load the database file, create the
	/// namespace directory, ...). Called once before any other operation.
	async fn init(&self) -> Result<(), StorageError> {
		Ok(())
	}

	/// Release resources. With `delete_namespace`, also remove everything
	/// this backend persisted.
	async fn teardown(&self, delete_namespace: bool) -> Result<(), StorageError> {
		let _ = delete_namespace;
		Ok(())
	}

	async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError>;

	/// Create or replace a file. The parent directory must exist.
	async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError>;

	async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError>;

	/// Create a directory. With `recursive`, missing parents are created
	/// and an existing directory is not an error.
	async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError>;

	async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError>;

	/// Direct children sorted by name.
	async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError>;

	/// Move a file or directory. Fails if `new` exists.
	async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError>;

	async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError>;

	async fn exists(&self, path: &AbsPath) -> Result<bool, StorageError> {
		match self.stat(path).await {
			Ok(_) => Ok(true),
			Err(e) if e.is_not_found() => Ok(false),
			Err(e) => Err(e),
		}
	}

	async fn symlink(&self, target: &AbsPath, path: &AbsPath) -> Result<(), StorageError> {
		let _ = (target, path);
		Err(StorageError::Unsupported {
			operation: "symlink",
			backend: self.name(),
		})
	}

	async fn readlink(&self, path: &AbsPath) -> Result<AbsPath, StorageError> {
		let _ = path;
		Err(StorageError::Unsupported {
			operation: "readlink",
			backend: self.name(),
		})
	}
}
