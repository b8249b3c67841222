//! In-memory backend. All data is lost when the backend is dropped.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::records::RecordMap;
use super::{Capabilities, DirEntry, Metadata, StorageBackend};
use crate::error::StorageError;
use crate::path::AbsPath;

/// Ephemeral storage, thread-safe via an internal `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
	records: RwLock<RecordMap>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	fn read(&self) -> RwLockReadGuard<'_, RecordMap> {
		self.records.read().unwrap_or_else(|e| e.into_inner())
	}

	fn write(&self) -> RwLockWriteGuard<'_, RecordMap> {
		self.records.write().unwrap_or_else(|e| e.into_inner())
	}
}

#[async_trait]
impl StorageBackend for MemoryStorage {
	fn name(&self) -> &'static str {
		"memory"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			symlinks: true,
			atomic_rename: true,
		}
	}

	async fn teardown(&self, delete_namespace: bool) -> Result<(), StorageError> {
		if delete_namespace {
			*self.write() = RecordMap::new();
		}
		Ok(())
	}

	async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		self.read().read(path)
	}

	async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		self.write().write(path, data)
	}

	async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError> {
		self.write().remove_file(path)
	}

	async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.write().mkdir(path, recursive)
	}

	async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.write().rmdir(path, recursive)
	}

	async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		self.read().readdir(path)
	}

	async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		self.write().rename(old, new)
	}

	async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		self.read().stat(path)
	}

	async fn symlink(&self, target: &AbsPath, path: &AbsPath) -> Result<(), StorageError> {
		self.write().symlink(target, path)
	}

	async fn readlink(&self, path: &AbsPath) -> Result<AbsPath, StorageError> {
		self.read().readlink(path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::path::normalize;
	use crate::tree::NodeKind;

	fn p(s: &str) -> AbsPath {
		normalize(s).unwrap()
	}

	#[tokio::test]
	async fn write_and_read() {
		let fs = MemoryStorage::new();
		fs.write_file(&p("/test.md"), b"hello").await.unwrap();
		assert_eq!(fs.read_file(&p("/test.md")).await.unwrap(), b"hello");
		let meta = fs.stat(&p("/test.md")).await.unwrap();
		assert!(!meta.is_directory);
		assert_eq!(meta.size, 5);
	}

	#[tokio::test]
	async fn read_missing_is_not_found() {
		let fs = MemoryStorage::new();
		assert!(fs.read_file(&p("/nope")).await.unwrap_err().is_not_found());
		assert!(!fs.exists(&p("/nope")).await.unwrap());
	}

	#[tokio::test]
	async fn readdir_is_sorted_and_typed() {
		let fs = MemoryStorage::new();
		fs.mkdir(&p("/dir/sub"), true).await.unwrap();
		fs.write_file(&p("/dir/b.md"), b"").await.unwrap();
		fs.write_file(&p("/dir/a.md"), b"").await.unwrap();
		let entries = fs.readdir(&p("/dir")).await.unwrap();
		let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
		assert_eq!(names, vec!["a.md", "b.md", "sub"]);
		assert_eq!(entries[2].kind, NodeKind::Directory);
	}

	#[tokio::test]
	async fn mkdir_non_recursive_conflicts() {
		let fs = MemoryStorage::new();
		fs.mkdir(&p("/a"), false).await.unwrap();
		assert!(matches!(
			fs.mkdir(&p("/a"), false).await,
			Err(StorageError::AlreadyExists(_))
		));
		fs.mkdir(&p("/a"), true).await.unwrap();
		assert!(matches!(
			fs.mkdir(&p("/x/y"), false).await,
			Err(StorageError::ParentMissing(_))
		));
	}

	#[tokio::test]
	async fn rmdir_respects_recursive_flag() {
		let fs = MemoryStorage::new();
		fs.mkdir(&p("/a/b"), true).await.unwrap();
		assert!(matches!(
			fs.rmdir(&p("/a"), false).await,
			Err(StorageError::DirectoryNotEmpty(_))
		));
		fs.rmdir(&p("/a"), true).await.unwrap();
		assert!(!fs.exists(&p("/a/b")).await.unwrap());
	}

	#[tokio::test]
	async fn rename_refuses_existing_destination() {
		let fs = MemoryStorage::new();
		fs.write_file(&p("/a"), b"1").await.unwrap();
		fs.write_file(&p("/b"), b"2").await.unwrap();
		assert!(matches!(
			fs.rename(&p("/a"), &p("/b")).await,
			Err(StorageError::DestinationExists(_))
		));
	}

	#[tokio::test]
	async fn teardown_with_delete_clears_everything() {
		let fs = MemoryStorage::new();
		fs.write_file(&p("/a"), b"1").await.unwrap();
		fs.teardown(true).await.unwrap();
		assert!(fs.readdir(&p("/")).await.unwrap().is_empty());
	}
}
