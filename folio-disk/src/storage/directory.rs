//! Directory backend: files live under a private namespace directory on the
//! host filesystem.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;

use super::{Capabilities, DirEntry, Metadata, StorageBackend};
use crate::error::StorageError;
use crate::path::AbsPath;
use crate::tree::NodeKind;

/// Backend rooted at a host directory. `/` maps to `root`; nothing outside
/// `root` is ever touched.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
	root: PathBuf,
}

impl DirectoryStorage {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Map a disk path onto the host, refusing anything that resolves
	/// outside the root through a host symlink.
	async fn resolve(&self, path: &AbsPath) -> Result<PathBuf, StorageError> {
		let full = path
			.segments()
			.fold(self.root.clone(), |acc, seg| acc.join(seg));

		let canonical_root = fs::canonicalize(&self.root)
			.await
			.unwrap_or_else(|_| self.root.clone());
		let probe = match fs::canonicalize(&full).await {
			Ok(p) => Some(p),
			Err(_) => match full.parent() {
				Some(parent) => fs::canonicalize(parent).await.ok(),
				None => None,
			},
		};
		if let Some(probe) = probe {
			if !probe.starts_with(&canonical_root) {
				return Err(StorageError::Io(std::io::Error::new(
					std::io::ErrorKind::PermissionDenied,
					format!("path escapes storage root: {}", path),
				)));
			}
		}
		Ok(full)
	}

	async fn metadata(&self, path: &AbsPath) -> Result<Option<std::fs::Metadata>, StorageError> {
		let full = self.resolve(path).await?;
		match fs::metadata(&full).await {
			Ok(m) => Ok(Some(m)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(StorageError::from_io(e, path.as_str())),
		}
	}

	async fn require_parent_dir(&self, path: &AbsPath) -> Result<(), StorageError> {
		let Some(parent) = path.parent() else {
			return Ok(());
		};
		match self.metadata(&parent).await? {
			Some(m) if m.is_dir() => Ok(()),
			Some(_) => Err(StorageError::NotADirectory(parent.to_string())),
			None => Err(StorageError::ParentMissing(path.to_string())),
		}
	}
}

#[async_trait]
impl StorageBackend for DirectoryStorage {
	fn name(&self) -> &'static str {
		"directory"
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			symlinks: false,
			atomic_rename: true,
		}
	}

	async fn init(&self) -> Result<(), StorageError> {
		fs::create_dir_all(&self.root)
			.await
			.map_err(|e| StorageError::from_io(e, &self.root.display().to_string()))?;
		tracing::debug!(root = %self.root.display(), "directory storage opened");
		Ok(())
	}

	async fn teardown(&self, delete_namespace: bool) -> Result<(), StorageError> {
		if !delete_namespace {
			return Ok(());
		}
		match fs::remove_dir_all(&self.root).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Io(e)),
		}
	}

	async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		let full = self.resolve(path).await?;
		match self.metadata(path).await? {
			Some(m) if m.is_dir() => Err(StorageError::IsADirectory(path.to_string())),
			Some(_) => fs::read(&full)
				.await
				.map_err(|e| StorageError::from_io(e, path.as_str())),
			None => Err(StorageError::NotFound(path.to_string())),
		}
	}

	async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		if let Some(m) = self.metadata(path).await? {
			if m.is_dir() {
				return Err(StorageError::IsADirectory(path.to_string()));
			}
		}
		self.require_parent_dir(path).await?;
		let full = self.resolve(path).await?;
		fs::write(&full, data)
			.await
			.map_err(|e| StorageError::from_io(e, path.as_str()))
	}

	async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError> {
		match self.metadata(path).await? {
			Some(m) if m.is_dir() => Err(StorageError::IsADirectory(path.to_string())),
			Some(_) => {
				let full = self.resolve(path).await?;
				fs::remove_file(&full)
					.await
					.map_err(|e| StorageError::from_io(e, path.as_str()))
			}
			None => Err(StorageError::NotFound(path.to_string())),
		}
	}

	async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		match self.metadata(path).await? {
			Some(m) if m.is_dir() && recursive => return Ok(()),
			Some(_) => return Err(StorageError::AlreadyExists(path.to_string())),
			None => {}
		}
		let full = self.resolve(path).await?;
		let result = if recursive {
			fs::create_dir_all(&full).await
		} else {
			self.require_parent_dir(path).await?;
			fs::create_dir(&full).await
		};
		result.map_err(|e| StorageError::from_io(e, path.as_str()))
	}

	async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		match self.metadata(path).await? {
			Some(m) if m.is_dir() => {}
			Some(_) => return Err(StorageError::NotADirectory(path.to_string())),
			None => return Err(StorageError::NotFound(path.to_string())),
		}
		let full = self.resolve(path).await?;
		if path.is_root() {
			if !recursive && !self.readdir(path).await?.is_empty() {
				return Err(StorageError::DirectoryNotEmpty(path.to_string()));
			}
			for entry in self.readdir(path).await? {
				let child = full.join(&entry.name);
				let removed = match entry.kind {
					NodeKind::Directory => fs::remove_dir_all(&child).await,
					NodeKind::File => fs::remove_file(&child).await,
				};
				removed.map_err(|e| StorageError::from_io(e, path.as_str()))?;
			}
			return Ok(());
		}
		let removed = if recursive {
			fs::remove_dir_all(&full).await
		} else {
			fs::remove_dir(&full).await
		};
		removed.map_err(|e| StorageError::from_io(e, path.as_str()))
	}

	async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		match self.metadata(path).await? {
			Some(m) if m.is_dir() => {}
			Some(_) => return Err(StorageError::NotADirectory(path.to_string())),
			None => return Err(StorageError::NotFound(path.to_string())),
		}
		let full = self.resolve(path).await?;
		let mut dir = fs::read_dir(&full)
			.await
			.map_err(|e| StorageError::from_io(e, path.as_str()))?;
		let mut entries = Vec::new();
		while let Some(entry) = dir
			.next_entry()
			.await
			.map_err(|e| StorageError::from_io(e, path.as_str()))?
		{
			let Ok(name) = entry.file_name().into_string() else {
				tracing::warn!(dir = %path, "skipping entry with non-UTF-8 name");
				continue;
			};
			let file_type = entry
				.file_type()
				.await
				.map_err(|e| StorageError::from_io(e, path.as_str()))?;
			let kind = if file_type.is_dir() {
				NodeKind::Directory
			} else {
				NodeKind::File
			};
			entries.push(DirEntry {
				name,
				kind,
				is_link: false,
			});
		}
		entries.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(entries)
	}

	async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		if old.is_root() || self.metadata(old).await?.is_none() {
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
		if self.metadata(new).await?.is_some() {
			return Err(StorageError::DestinationExists(new.to_string()));
		}
		self.require_parent_dir(new).await?;
		let from = self.resolve(old).await?;
		let to = self.resolve(new).await?;
		fs::rename(&from, &to)
			.await
			.map_err(|e| StorageError::from_io(e, old.as_str()))
	}

	async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		let meta = self
			.metadata(path)
			.await?
			.ok_or_else(|| StorageError::NotFound(path.to_string()))?;
		let mtime = meta
			.modified()
			.ok()
			.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0);
		Ok(Metadata {
			is_directory: meta.is_dir(),
			size: if meta.is_dir() { 0 } else { meta.len() },
			mtime,
		})
	}
}
