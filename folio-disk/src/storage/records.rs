// ---------------------------------------------------------------------------
// Path-keyed record map shared by the memory and database backends
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};

use super::{now_millis, DirEntry, Metadata};
use crate::error::StorageError;
use crate::path::AbsPath;
use crate::tree::NodeKind;

const MAX_LINK_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum Record {
	File {
		#[serde(with = "base64_bytes")]
		data: Vec<u8>,
		mtime: u64,
	},
	Directory {
		mtime: u64,
	},
	Symlink {
		target: AbsPath,
		mtime: u64,
	},
}

mod base64_bytes {
	use base64::engine::general_purpose::STANDARD;
	use base64::Engine as _;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&STANDARD.encode(data))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
		let encoded = String::deserialize(d)?;
		STANDARD.decode(encoded).map_err(serde::de::Error::custom)
	}
}

fn invalid(msg: String) -> StorageError {
	StorageError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

/// Flat map from absolute path to record. The root directory is always
/// present; every other record's parent is a directory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecordMap {
	records: BTreeMap<AbsPath, Record>,
}

impl Default for RecordMap {
	fn default() -> Self {
		let mut records = BTreeMap::new();
		records.insert(AbsPath::root(), Record::Directory { mtime: now_millis() });
		Self { records }
	}
}

impl RecordMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	/// Check the structural invariants after loading from disk.
	pub fn verify(&self) -> Result<(), StorageError> {
		if !matches!(self.records.get(&AbsPath::root()), Some(Record::Directory { .. })) {
			return Err(StorageError::Corrupt("missing root directory".into()));
		}
		for path in self.records.keys() {
			if let Some(parent) = path.parent() {
				if !matches!(self.records.get(&parent), Some(Record::Directory { .. })) {
					return Err(StorageError::Corrupt(format!("orphaned record {}", path)));
				}
			}
		}
		Ok(())
	}

	// -- Helpers (private) ------------------------------------------------

	/// Follow symlinks on the final component.
	fn resolve(&self, path: &AbsPath) -> Result<AbsPath, StorageError> {
		let mut cur = path.clone();
		for _ in 0..MAX_LINK_HOPS {
			match self.records.get(&cur) {
				Some(Record::Symlink { target, .. }) => cur = target.clone(),
				Some(_) => return Ok(cur),
				None => return Err(StorageError::NotFound(path.to_string())),
			}
		}
		Err(invalid(format!("too many levels of symbolic links: {}", path)))
	}

	fn require_parent_dir(&self, path: &AbsPath) -> Result<(), StorageError> {
		let Some(parent) = path.parent() else {
			return Ok(());
		};
		match self.records.get(&parent) {
			Some(Record::Directory { .. }) => Ok(()),
			Some(_) => Err(StorageError::NotADirectory(parent.to_string())),
			None => Err(StorageError::ParentMissing(path.to_string())),
		}
	}

	fn descendants(&self, path: &AbsPath) -> Vec<AbsPath> {
		self.records
			.keys()
			.filter(|k| path.is_ancestor_of(k))
			.cloned()
			.collect()
	}

	fn entry_kind(&self, path: &AbsPath, record: &Record) -> NodeKind {
		match record {
			Record::Directory { .. } => NodeKind::Directory,
			Record::File { .. } => NodeKind::File,
			Record::Symlink { .. } => match self.resolve(path).ok().and_then(|p| self.records.get(&p)) {
				Some(Record::Directory { .. }) => NodeKind::Directory,
				_ => NodeKind::File,
			},
		}
	}

	// -- Primitives -------------------------------------------------------

	pub fn read(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		let resolved = self.resolve(path)?;
		match self.records.get(&resolved) {
			Some(Record::File { data, .. }) => Ok(data.clone()),
			Some(_) => Err(StorageError::IsADirectory(path.to_string())),
			None => Err(StorageError::NotFound(path.to_string())),
		}
	}

	pub fn write(&mut self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		let target = match self.resolve(path) {
			Ok(p) => p,
			Err(e) if e.is_not_found() => path.clone(),
			Err(e) => return Err(e),
		};
		if matches!(self.records.get(&target), Some(Record::Directory { .. })) {
			return Err(StorageError::IsADirectory(path.to_string()));
		}
		self.require_parent_dir(&target)?;
		self.records.insert(
			target,
			Record::File {
				data: data.to_vec(),
				mtime: now_millis(),
			},
		);
		Ok(())
	}

	pub fn remove_file(&mut self, path: &AbsPath) -> Result<(), StorageError> {
		match self.records.get(path) {
			Some(Record::Directory { .. }) => Err(StorageError::IsADirectory(path.to_string())),
			Some(_) => {
				self.records.remove(path);
				Ok(())
			}
			None => Err(StorageError::NotFound(path.to_string())),
		}
	}

	pub fn mkdir(&mut self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		match self.records.get(path) {
			Some(Record::Directory { .. }) if recursive => return Ok(()),
			Some(_) => return Err(StorageError::AlreadyExists(path.to_string())),
			None => {}
		}
		if recursive {
			for ancestor in path.ancestors() {
				match self.records.get(&ancestor) {
					Some(Record::Directory { .. }) => {}
					Some(_) => return Err(StorageError::NotADirectory(ancestor.to_string())),
					None => {
						self.records
							.insert(ancestor, Record::Directory { mtime: now_millis() });
					}
				}
			}
		} else {
			self.require_parent_dir(path)?;
		}
		self.records
			.insert(path.clone(), Record::Directory { mtime: now_millis() });
		Ok(())
	}

	pub fn rmdir(&mut self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		match self.records.get(path) {
			Some(Record::Directory { .. }) => {}
			Some(_) => return Err(StorageError::NotADirectory(path.to_string())),
			None => return Err(StorageError::NotFound(path.to_string())),
		}
		let descendants = self.descendants(path);
		if !descendants.is_empty() && !recursive {
			return Err(StorageError::DirectoryNotEmpty(path.to_string()));
		}
		for d in descendants {
			self.records.remove(&d);
		}
		if !path.is_root() {
			self.records.remove(path);
		}
		Ok(())
	}

	pub fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		let resolved = self.resolve(path)?;
		match self.records.get(&resolved) {
			Some(Record::Directory { .. }) => {}
			Some(_) => return Err(StorageError::NotADirectory(path.to_string())),
			None => return Err(StorageError::NotFound(path.to_string())),
		}
		// BTreeMap order keeps siblings sorted by name.
		Ok(self
			.records
			.iter()
			.filter(|(k, _)| k.parent().as_ref() == Some(&resolved))
			.map(|(k, record)| DirEntry {
				name: k.name().to_string(),
				kind: self.entry_kind(k, record),
				is_link: matches!(record, Record::Symlink { .. }),
			})
			.collect())
	}

	pub fn rename(&mut self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		if old.is_root() {
			return Err(invalid("cannot rename the root".to_string()));
		}
		if !self.records.contains_key(old) {
			return Err(StorageError::NotFound(old.to_string()));
		}
		if old == new {
			return Ok(());
		}
		if old.is_ancestor_of(new) {
			return Err(invalid(format!("cannot move {} into itself", old)));
		}
		if self.records.contains_key(new) {
			return Err(StorageError::DestinationExists(new.to_string()));
		}
		self.require_parent_dir(new)?;

		let mut moved = self.descendants(old);
		moved.push(old.clone());
		for from in moved {
			if let (Some(record), Some(to)) = (self.records.remove(&from), from.rebase(old, new)) {
				self.records.insert(to, record);
			}
		}
		Ok(())
	}

	pub fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		let resolved = self.resolve(path)?;
		match self.records.get(&resolved) {
			Some(Record::File { data, mtime }) => Ok(Metadata {
				is_directory: false,
				size: data.len() as u64,
				mtime: *mtime,
			}),
			Some(Record::Directory { mtime }) => Ok(Metadata {
				is_directory: true,
				size: 0,
				mtime: *mtime,
			}),
			_ => Err(StorageError::NotFound(path.to_string())),
		}
	}

	pub fn symlink(&mut self, target: &AbsPath, path: &AbsPath) -> Result<(), StorageError> {
		if self.records.contains_key(path) {
			return Err(StorageError::AlreadyExists(path.to_string()));
		}
		self.require_parent_dir(path)?;
		self.records.insert(
			path.clone(),
			Record::Symlink {
				target: target.clone(),
				mtime: now_millis(),
			},
		);
		Ok(())
	}

	pub fn readlink(&self, path: &AbsPath) -> Result<AbsPath, StorageError> {
		match self.records.get(path) {
			Some(Record::Symlink { target, .. }) => Ok(target.clone()),
			Some(_) => Err(invalid(format!("not a symbolic link: {}", path))),
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

	#[test]
	fn write_requires_parent() {
		let mut map = RecordMap::new();
		assert!(matches!(
			map.write(&p("/a/b.md"), b"x"),
			Err(StorageError::ParentMissing(_))
		));
		map.mkdir(&p("/a"), false).unwrap();
		map.write(&p("/a/b.md"), b"x").unwrap();
		assert_eq!(map.read(&p("/a/b.md")).unwrap(), b"x");
	}

	#[test]
	fn rename_moves_descendants() {
		let mut map = RecordMap::new();
		map.mkdir(&p("/a/b"), true).unwrap();
		map.write(&p("/a/b/c.md"), b"c").unwrap();
		map.rename(&p("/a"), &p("/z")).unwrap();
		assert_eq!(map.read(&p("/z/b/c.md")).unwrap(), b"c");
		assert!(map.stat(&p("/a")).unwrap_err().is_not_found());
		map.verify().unwrap();
	}

	#[test]
	fn symlinks_resolve_for_reads() {
		let mut map = RecordMap::new();
		map.write(&p("/real.md"), b"hello").unwrap();
		map.symlink(&p("/real.md"), &p("/link.md")).unwrap();
		assert_eq!(map.read(&p("/link.md")).unwrap(), b"hello");
		assert_eq!(map.readlink(&p("/link.md")).unwrap(), p("/real.md"));
		map.symlink(&p("/loop-b"), &p("/loop-a")).unwrap();
		map.symlink(&p("/loop-a"), &p("/loop-b")).unwrap();
		assert!(matches!(map.read(&p("/loop-a")), Err(StorageError::Io(_))));
	}

	#[test]
	fn serde_round_trip_keeps_bytes() {
		let mut map = RecordMap::new();
		map.write(&p("/bin"), &[0, 159, 146, 150]).unwrap();
		let json = serde_json::to_string(&map).unwrap();
		let back: RecordMap = serde_json::from_str(&json).unwrap();
		back.verify().unwrap();
		assert_eq!(back.read(&p("/bin")).unwrap(), vec![0, 159, 146, 150]);
	}
}
