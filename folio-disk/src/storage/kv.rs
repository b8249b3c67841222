// ---------------------------------------------------------------------------
// Key-value backend: a flat string store shared by every disk of a context
// ---------------------------------------------------------------------------
//
// Key layout: `folio:<namespace>:<path>`. Values are strings:
//   `dir:<mtime>`               directory marker
//   `file:<mtime>:<base64>`     file contents
// The root directory is implicit. Renames are emulated by copying every key
// under the old path and deleting the originals, so they are not atomic.
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{Mutex, OnceCell};

use super::{now_millis, Capabilities, DirEntry, Metadata, StorageBackend};
use crate::error::StorageError;
use crate::path::AbsPath;
use crate::tree::NodeKind;

const KEY_PREFIX: &str = "folio";

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Flat string map, optionally mirrored to a JSON file. One store is shared
/// by all key-value disks of a context; each disk owns a key namespace.
#[derive(Debug, Default)]
pub struct KvStore {
	file: Option<PathBuf>,
	entries: RwLock<BTreeMap<String, String>>,
	loaded: OnceCell<()>,
	persist: Mutex<()>,
}

impl KvStore {
	/// A store that lives only in memory.
	pub fn ephemeral() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// A store mirrored to `file`, loaded lazily on first use.
	pub fn persistent(file: impl Into<PathBuf>) -> Arc<Self> {
		Arc::new(Self {
			file: Some(file.into()),
			..Self::default()
		})
	}

	fn entries(&self) -> RwLockReadGuard<'_, BTreeMap<String, String>> {
		self.entries.read().unwrap_or_else(|e| e.into_inner())
	}

	fn entries_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, String>> {
		self.entries.write().unwrap_or_else(|e| e.into_inner())
	}

	async fn ensure_loaded(&self) -> Result<(), StorageError> {
		self.loaded
			.get_or_try_init(|| async {
				let Some(file) = &self.file else {
					return Ok(());
				};
				let raw = match tokio::fs::read(file).await {
					Ok(raw) => raw,
					Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
					Err(e) => return Err(StorageError::Io(e)),
				};
				let parsed: BTreeMap<String, String> = serde_json::from_slice(&raw)
					.map_err(|e| StorageError::Corrupt(format!("{}: {}", file.display(), e)))?;
				tracing::debug!(file = %file.display(), keys = parsed.len(), "key-value store loaded");
				*self.entries_mut() = parsed;
				Ok(())
			})
			.await
			.map(|_| ())
	}

	pub fn get(&self, key: &str) -> Option<String> {
		self.entries().get(key).cloned()
	}

	pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
		self.entries_mut().insert(key.into(), value.into());
	}

	pub fn remove(&self, key: &str) -> Option<String> {
		self.entries_mut().remove(key)
	}

	pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
		self.entries()
			.range(prefix.to_string()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.map(|(k, _)| k.clone())
			.collect()
	}

	pub fn len(&self) -> usize {
		self.entries().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries().is_empty()
	}

	/// Write the map to its file, if it has one.
	pub async fn flush(&self) -> Result<(), StorageError> {
		let Some(file) = &self.file else {
			return Ok(());
		};
		let _guard = self.persist.lock().await;
		let body = serde_json::to_vec_pretty(&*self.entries())
			.map_err(|e| StorageError::Corrupt(e.to_string()))?;
		if let Some(parent) = file.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let tmp = file.with_extension("tmp");
		tokio::fs::write(&tmp, body).await?;
		tokio::fs::rename(&tmp, file).await?;
		Ok(())
	}
}

// ---------------------------------------------------------------------------
// Value encoding
// ---------------------------------------------------------------------------

enum KvValue {
	Dir { mtime: u64 },
	File { mtime: u64, data: Vec<u8> },
}

impl KvValue {
	fn encode_file(data: &[u8]) -> String {
		format!("file:{}:{}", now_millis(), BASE64.encode(data))
	}

	fn encode_dir() -> String {
		format!("dir:{}", now_millis())
	}

	fn parse(key: &str, raw: &str) -> Result<Self, StorageError> {
		let corrupt = || StorageError::Corrupt(format!("malformed value for key {}", key));
		if let Some(rest) = raw.strip_prefix("dir:") {
			let mtime = rest.parse().map_err(|_| corrupt())?;
			return Ok(Self::Dir { mtime });
		}
		let rest = raw.strip_prefix("file:").ok_or_else(corrupt)?;
		let (mtime, encoded) = rest.split_once(':').ok_or_else(corrupt)?;
		Ok(Self::File {
			mtime: mtime.parse().map_err(|_| corrupt())?,
			data: BASE64.decode(encoded).map_err(|_| corrupt())?,
		})
	}
}

// ---------------------------------------------------------------------------
// KvStorage
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct KvStorage {
	store: Arc<KvStore>,
	namespace: String,
}

impl KvStorage {
	pub fn new(store: Arc<KvStore>, namespace: impl Into<String>) -> Self {
		Self {
			store,
			namespace: namespace.into(),
		}
	}

	fn key(&self, path: &AbsPath) -> String {
		format!("{}:{}:{}", KEY_PREFIX, self.namespace, path)
	}

	fn namespace_prefix(&self) -> String {
		format!("{}:{}:", KEY_PREFIX, self.namespace)
	}

	/// Prefix matching every key strictly below `path`.
	fn child_prefix(&self, path: &AbsPath) -> String {
		if path.is_root() {
			self.key(path)
		} else {
			format!("{}/", self.key(path))
		}
	}

	fn lookup(&self, path: &AbsPath) -> Result<Option<KvValue>, StorageError> {
		if path.is_root() {
			return Ok(Some(KvValue::Dir { mtime: 0 }));
		}
		let key = self.key(path);
		self.store
			.get(&key)
			.map(|raw| KvValue::parse(&key, &raw))
			.transpose()
	}

	fn require_parent_dir(&self, path: &AbsPath) -> Result<(), StorageError> {
		let Some(parent) = path.parent() else {
			return Ok(());
		};
		match self.lookup(&parent)? {
			Some(KvValue::Dir { .. }) => Ok(()),
			Some(KvValue::File { .. }) => Err(StorageError::NotADirectory(parent.to_string())),
			None => Err(StorageError::ParentMissing(path.to_string())),
		}
	}
}

#[async_trait]
impl StorageBackend for KvStorage {
	fn name(&self) -> &'static str {
		"key-value"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			symlinks: false,
			atomic_rename: false,
		}
	}

	async fn init(&self) -> Result<(), StorageError> {
		self.store.ensure_loaded().await
	}

	async fn teardown(&self, delete_namespace: bool) -> Result<(), StorageError> {
		if !delete_namespace {
			return Ok(());
		}
		for key in self.store.keys_with_prefix(&self.namespace_prefix()) {
			self.store.remove(&key);
		}
		self.store.flush().await
	}

	async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		match self.lookup(path)? {
			Some(KvValue::File { data, .. }) => Ok(data),
			Some(KvValue::Dir { .. }) => Err(StorageError::IsADirectory(path.to_string())),
			None => Err(StorageError::NotFound(path.to_string())),
		}
	}

	async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		if let Some(KvValue::Dir { .. }) = self.lookup(path)? {
			return Err(StorageError::IsADirectory(path.to_string()));
		}
		self.require_parent_dir(path)?;
		self.store.set(self.key(path), KvValue::encode_file(data));
		self.store.flush().await
	}

	async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError> {
		match self.lookup(path)? {
			Some(KvValue::File { .. }) => {
				self.store.remove(&self.key(path));
				self.store.flush().await
			}
			Some(KvValue::Dir { .. }) => Err(StorageError::IsADirectory(path.to_string())),
			None => Err(StorageError::NotFound(path.to_string())),
		}
	}

	async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		match self.lookup(path)? {
			Some(KvValue::Dir { .. }) if recursive => return Ok(()),
			Some(_) => return Err(StorageError::AlreadyExists(path.to_string())),
			None => {}
		}
		if recursive {
			for ancestor in path.ancestors() {
				match self.lookup(&ancestor)? {
					Some(KvValue::Dir { .. }) => {}
					Some(KvValue::File { .. }) => {
						return Err(StorageError::NotADirectory(ancestor.to_string()));
					}
					None => self.store.set(self.key(&ancestor), KvValue::encode_dir()),
				}
			}
		} else {
			self.require_parent_dir(path)?;
		}
		self.store.set(self.key(path), KvValue::encode_dir());
		self.store.flush().await
	}

	async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		match self.lookup(path)? {
			Some(KvValue::Dir { .. }) => {}
			Some(KvValue::File { .. }) => return Err(StorageError::NotADirectory(path.to_string())),
			None => return Err(StorageError::NotFound(path.to_string())),
		}
		let below = self.store.keys_with_prefix(&self.child_prefix(path));
		if !below.is_empty() && !recursive {
			return Err(StorageError::DirectoryNotEmpty(path.to_string()));
		}
		for key in below {
			self.store.remove(&key);
		}
		if !path.is_root() {
			self.store.remove(&self.key(path));
		}
		self.store.flush().await
	}

	async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		match self.lookup(path)? {
			Some(KvValue::Dir { .. }) => {}
			Some(KvValue::File { .. }) => return Err(StorageError::NotADirectory(path.to_string())),
			None => return Err(StorageError::NotFound(path.to_string())),
		}
		let prefix = self.child_prefix(path);
		let mut entries = Vec::new();
		for key in self.store.keys_with_prefix(&prefix) {
			let name = &key[prefix.len()..];
			if name.is_empty() || name.contains('/') {
				continue;
			}
			let kind = match self.store.get(&key).map(|raw| KvValue::parse(&key, &raw)) {
				Some(Ok(KvValue::Dir { .. })) => NodeKind::Directory,
				Some(Ok(KvValue::File { .. })) => NodeKind::File,
				Some(Err(e)) => return Err(e),
				None => continue,
			};
			entries.push(DirEntry {
				name: name.to_string(),
				kind,
				is_link: false,
			});
		}
		entries.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(entries)
	}

	async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		if self.lookup(old)?.is_none() || old.is_root() {
			return Err(StorageError::NotFound(old.to_string()));
		}
		if old == new {
			return Ok(());
		}
		if old.is_ancestor_of(new) {
			return Err(StorageError::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidInput,
				format!("cannot move {} into itself", old),
			)));
		}
		if self.lookup(new)?.is_some() {
			return Err(StorageError::DestinationExists(new.to_string()));
		}
		self.require_parent_dir(new)?;

		let old_key = self.key(old);
		let mut keys = vec![old_key.clone()];
		keys.extend(self.store.keys_with_prefix(&self.child_prefix(old)));
		let new_key = self.key(new);
		for key in keys {
			if let Some(value) = self.store.get(&key) {
				let moved = format!("{}{}", new_key, &key[old_key.len()..]);
				self.store.set(moved, value);
				self.store.remove(&key);
			}
		}
		self.store.flush().await
	}

	async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		match self.lookup(path)? {
			Some(KvValue::Dir { mtime }) => Ok(Metadata {
				is_directory: true,
				size: 0,
				mtime,
			}),
			Some(KvValue::File { mtime, data }) => Ok(Metadata {
				is_directory: false,
				size: data.len() as u64,
				mtime,
			}),
			None => Err(StorageError::NotFound(path.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::path::normalize;

	fn p(s: &str) -> AbsPath {
		normalize(s).unwrap()
	}

	#[tokio::test]
	async fn namespaces_are_isolated() {
		let store = KvStore::ephemeral();
		let a = KvStorage::new(store.clone(), "a");
		let b = KvStorage::new(store.clone(), "b");
		a.write_file(&p("/x.md"), b"from a").await.unwrap();
		assert!(b.read_file(&p("/x.md")).await.unwrap_err().is_not_found());
		a.teardown(true).await.unwrap();
		assert!(store.is_empty());
	}

	#[tokio::test]
	async fn rename_moves_every_key_below() {
		let store = KvStore::ephemeral();
		let kv = KvStorage::new(store.clone(), "n");
		kv.mkdir(&p("/a/b"), true).await.unwrap();
		kv.write_file(&p("/a/b/c.md"), b"c").await.unwrap();
		kv.write_file(&p("/ab.md"), b"sibling").await.unwrap();
		kv.rename(&p("/a"), &p("/z")).await.unwrap();
		assert_eq!(kv.read_file(&p("/z/b/c.md")).await.unwrap(), b"c");
		// `/ab.md` shares a string prefix with `/a` but is not under it.
		assert_eq!(kv.read_file(&p("/ab.md")).await.unwrap(), b"sibling");
		assert!(!kv.exists(&p("/a")).await.unwrap());
	}

	#[tokio::test]
	async fn readdir_lists_direct_children_only() {
		let kv = KvStorage::new(KvStore::ephemeral(), "n");
		kv.mkdir(&p("/d/e"), true).await.unwrap();
		kv.write_file(&p("/d/e/f.md"), b"").await.unwrap();
		kv.write_file(&p("/top.md"), b"").await.unwrap();
		let names: Vec<String> = kv
			.readdir(&p("/"))
			.await
			.unwrap()
			.into_iter()
			.map(|e| e.name)
			.collect();
		assert_eq!(names, vec!["d", "top.md"]);
	}

	#[tokio::test]
	async fn symlinks_are_unsupported() {
		let kv = KvStorage::new(KvStore::ephemeral(), "n");
		assert!(matches!(
			kv.symlink(&p("/a"), &p("/b")).await,
			Err(StorageError::Unsupported { operation: "symlink", .. })
		));
	}

	#[tokio::test]
	async fn persistent_store_reloads() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("kv.json");
		let kv = KvStorage::new(KvStore::persistent(&file), "n");
		kv.init().await.unwrap();
		kv.write_file(&p("/keep.md"), b"kept").await.unwrap();

		let kv = KvStorage::new(KvStore::persistent(&file), "n");
		kv.init().await.unwrap();
		assert_eq!(kv.read_file(&p("/keep.md")).await.unwrap(), b"kept");
	}
}
