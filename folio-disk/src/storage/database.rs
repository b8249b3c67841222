// ---------------------------------------------------------------------------
// Database backend: an object store of path records in one gzipped file
// ---------------------------------------------------------------------------
//
// File format: gzipped JSON `{ "version": 1, "records": { "/path": {...} } }`
// where file records carry their bytes as base64. The whole store is loaded
// by `init` and rewritten after every mutation.
// ---------------------------------------------------------------------------

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::records::RecordMap;
use super::{Capabilities, DirEntry, Metadata, StorageBackend};
use crate::error::StorageError;
use crate::path::AbsPath;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct DatabaseFile {
	version: u32,
	records: RecordMap,
}

// ---------------------------------------------------------------------------
// Gzip helpers
// ---------------------------------------------------------------------------

fn compress(data: &[u8]) -> Result<Vec<u8>, StorageError> {
	let mut encoder = GzEncoder::new(data, Compression::new(6));
	let mut out = Vec::new();
	encoder.read_to_end(&mut out)?;
	Ok(out)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, StorageError> {
	let mut decoder = GzDecoder::new(data);
	let mut out = Vec::new();
	decoder
		.read_to_end(&mut out)
		.map_err(|e| StorageError::Corrupt(format!("gzip: {}", e)))?;
	Ok(out)
}

fn is_gzipped(data: &[u8]) -> bool {
	data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

// ---------------------------------------------------------------------------
// DatabaseStorage
// ---------------------------------------------------------------------------

pub struct DatabaseStorage {
	file: PathBuf,
	records: RwLock<RecordMap>,
	persist: tokio::sync::Mutex<()>,
}

impl DatabaseStorage {
	pub fn new(file: impl Into<PathBuf>) -> Self {
		Self {
			file: file.into(),
			records: RwLock::new(RecordMap::new()),
			persist: tokio::sync::Mutex::new(()),
		}
	}

	pub fn file(&self) -> &Path {
		&self.file
	}

	fn read(&self) -> RwLockReadGuard<'_, RecordMap> {
		self.records.read().unwrap_or_else(|e| e.into_inner())
	}

	fn write(&self) -> RwLockWriteGuard<'_, RecordMap> {
		self.records.write().unwrap_or_else(|e| e.into_inner())
	}

	async fn load(&self) -> Result<RecordMap, StorageError> {
		let raw = match tokio::fs::read(&self.file).await {
			Ok(raw) => raw,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecordMap::new()),
			Err(e) => return Err(StorageError::Io(e)),
		};
		let json = if is_gzipped(&raw) { decompress(&raw)? } else { raw };
		let parsed: DatabaseFile = serde_json::from_slice(&json)
			.map_err(|e| StorageError::Corrupt(format!("{}: {}", self.file.display(), e)))?;
		if parsed.version != FORMAT_VERSION {
			return Err(StorageError::Corrupt(format!(
				"unsupported database version {}",
				parsed.version
			)));
		}
		parsed.records.verify()?;
		Ok(parsed.records)
	}

	/// Rewrite the database file from the current records. Writes go to a
	/// sibling temp file first so a crash never leaves a truncated store.
	async fn persist(&self) -> Result<(), StorageError> {
		let _guard = self.persist.lock().await;
		let body = {
			let records = self.read();
			serde_json::to_vec(&DatabaseFile {
				version: FORMAT_VERSION,
				records: records.clone(),
			})
			.map_err(|e| StorageError::Corrupt(e.to_string()))?
		};
		let compressed = compress(&body)?;
		if let Some(parent) = self.file.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let tmp = self.file.with_extension("tmp");
		tokio::fs::write(&tmp, &compressed).await?;
		tokio::fs::rename(&tmp, &self.file).await?;
		Ok(())
	}

	/// Apply a mutation and persist it when it succeeds.
	async fn mutate<F>(&self, op: F) -> Result<(), StorageError>
	where
		F: FnOnce(&mut RecordMap) -> Result<(), StorageError> + Send,
	{
		op(&mut self.write())?;
		self.persist().await
	}
}

impl std::fmt::Debug for DatabaseStorage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DatabaseStorage")
			.field("file", &self.file)
			.field("records", &self.read().len())
			.finish()
	}
}

#[async_trait]
impl StorageBackend for DatabaseStorage {
	fn name(&self) -> &'static str {
		"database"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			symlinks: true,
			atomic_rename: true,
		}
	}

	async fn init(&self) -> Result<(), StorageError> {
		let loaded = self.load().await?;
		tracing::debug!(file = %self.file.display(), records = loaded.len(), "database opened");
		*self.write() = loaded;
		Ok(())
	}

	async fn teardown(&self, delete_namespace: bool) -> Result<(), StorageError> {
		if !delete_namespace {
			return Ok(());
		}
		let _guard = self.persist.lock().await;
		*self.write() = RecordMap::new();
		match tokio::fs::remove_file(&self.file).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Io(e)),
		}
	}

	async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		self.read().read(path)
	}

	async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		self.mutate(|r| r.write(path, data)).await
	}

	async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError> {
		self.mutate(|r| r.remove_file(path)).await
	}

	async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.mutate(|r| r.mkdir(path, recursive)).await
	}

	async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.mutate(|r| r.rmdir(path, recursive)).await
	}

	async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		self.read().readdir(path)
	}

	async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		self.mutate(|r| r.rename(old, new)).await
	}

	async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		self.read().stat(path)
	}

	async fn symlink(&self, target: &AbsPath, path: &AbsPath) -> Result<(), StorageError> {
		self.mutate(|r| r.symlink(target, path)).await
	}

	async fn readlink(&self, path: &AbsPath) -> Result<AbsPath, StorageError> {
		self.read().readlink(path)
	}
}
