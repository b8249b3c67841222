//! Storage decorator that serializes mutations through the owning disk's
//! lock.
//!
//! Single mutating calls lock for their own duration. Composite operations
//! call [`MutexFs::begin`] and run every primitive through the returned
//! [`FsGuard`], which holds the lock until it is dropped. Reads never lock.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StorageError;
use crate::path::AbsPath;
use crate::storage::{Capabilities, DirEntry, Metadata, StorageBackend};

/// The per-disk mutual-exclusion lock. Owned by the disk and shared with
/// its `MutexFs`.
pub type DiskLock = Arc<Mutex<()>>;

pub fn new_lock() -> DiskLock {
	Arc::new(Mutex::new(()))
}

#[derive(Clone)]
pub struct MutexFs {
	backend: Arc<dyn StorageBackend>,
	lock: DiskLock,
}

impl MutexFs {
	pub fn new(backend: Arc<dyn StorageBackend>, lock: DiskLock) -> Self {
		Self { backend, lock }
	}

	pub fn backend(&self) -> &Arc<dyn StorageBackend> {
		&self.backend
	}

	pub fn capabilities(&self) -> Capabilities {
		self.backend.capabilities()
	}

	pub fn is_locked(&self) -> bool {
		self.lock.try_lock().is_err()
	}

	/// Acquire the lock for a composite operation.
	pub async fn begin(&self) -> FsGuard {
		let guard = self.lock.clone().lock_owned().await;
		FsGuard {
			_guard: guard,
			backend: self.backend.clone(),
		}
	}

	// -- Reads (lock-free) ------------------------------------------------

	pub async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		self.backend.read_file(path).await
	}

	pub async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		self.backend.readdir(path).await
	}

	pub async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		self.backend.stat(path).await
	}

	pub async fn exists(&self, path: &AbsPath) -> Result<bool, StorageError> {
		self.backend.exists(path).await
	}

	pub async fn readlink(&self, path: &AbsPath) -> Result<AbsPath, StorageError> {
		self.backend.readlink(path).await
	}

	// -- Mutations (locked) -----------------------------------------------

	pub async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		self.begin().await.write_file(path, data).await
	}

	pub async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError> {
		self.begin().await.remove_file(path).await
	}

	pub async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.begin().await.mkdir(path, recursive).await
	}

	pub async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.begin().await.rmdir(path, recursive).await
	}

	pub async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		self.begin().await.rename(old, new).await
	}

	pub async fn symlink(&self, target: &AbsPath, path: &AbsPath) -> Result<(), StorageError> {
		self.begin().await.symlink(target, path).await
	}
}

impl std::fmt::Debug for MutexFs {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MutexFs")
			.field("backend", &self.backend.name())
			.field("locked", &self.is_locked())
			.finish()
	}
}

/// Exclusive access to the backend for the lifetime of the guard.
pub struct FsGuard {
	_guard: OwnedMutexGuard<()>,
	backend: Arc<dyn StorageBackend>,
}

impl FsGuard {
	pub async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		self.backend.read_file(path).await
	}

	pub async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		self.backend.readdir(path).await
	}

	pub async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		self.backend.stat(path).await
	}

	pub async fn exists(&self, path: &AbsPath) -> Result<bool, StorageError> {
		self.backend.exists(path).await
	}

	pub async fn readlink(&self, path: &AbsPath) -> Result<AbsPath, StorageError> {
		self.backend.readlink(path).await
	}

	pub async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		tracing::trace!(path = %path, bytes = data.len(), "write_file");
		self.backend.write_file(path, data).await
	}

	pub async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError> {
		tracing::trace!(path = %path, "remove_file");
		self.backend.remove_file(path).await
	}

	pub async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		tracing::trace!(path = %path, recursive, "mkdir");
		self.backend.mkdir(path, recursive).await
	}

	pub async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		tracing::trace!(path = %path, recursive, "rmdir");
		self.backend.rmdir(path, recursive).await
	}

	pub async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		tracing::trace!(old = %old, new = %new, "rename");
		self.backend.rename(old, new).await
	}

	pub async fn symlink(&self, target: &AbsPath, path: &AbsPath) -> Result<(), StorageError> {
		tracing::trace!(target = %target, path = %path, "symlink");
		self.backend.symlink(target, path).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::path::normalize;
	use crate::storage::MemoryStorage;

	fn p(s: &str) -> AbsPath {
		normalize(s).unwrap()
	}

	#[tokio::test]
	async fn guard_holds_lock_until_dropped() {
		let fs = MutexFs::new(Arc::new(MemoryStorage::new()), new_lock());
		{
			let guard = fs.begin().await;
			assert!(fs.is_locked());
			guard.mkdir(&p("/a"), false).await.unwrap();
			guard.write_file(&p("/a/b.md"), b"b").await.unwrap();
			// Reads bypass the lock.
			assert_eq!(fs.read_file(&p("/a/b.md")).await.unwrap(), b"b");
		}
		assert!(!fs.is_locked());
	}

	#[tokio::test]
	async fn guard_releases_on_error() {
		let fs = MutexFs::new(Arc::new(MemoryStorage::new()), new_lock());
		assert!(fs.write_file(&p("/missing/a"), b"").await.is_err());
		assert!(!fs.is_locked());
	}

	#[tokio::test]
	async fn single_mutation_waits_for_composite() {
		let fs = MutexFs::new(Arc::new(MemoryStorage::new()), new_lock());
		let guard = fs.begin().await;
		let other = fs.clone();
		let pending = tokio::spawn(async move { other.mkdir(&p("/late"), false).await });
		tokio::task::yield_now().await;
		assert!(!fs.exists(&p("/late")).await.unwrap());
		drop(guard);
		pending.await.unwrap().unwrap();
		assert!(fs.exists(&p("/late")).await.unwrap());
	}
}
