// ---------------------------------------------------------------------------
// Disk factory: disk type tags, persisted records, backend selection
// ---------------------------------------------------------------------------

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::DiskContext;
use crate::disk::Disk;
use crate::error::DiskError;
use crate::storage::{DatabaseStorage, DirectoryStorage, KvStorage, MemoryStorage, StorageBackend};
use crate::tree::TreeSnapshot;

/// Closed set of disk kinds. The string tags are the persisted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DiskType {
	MemDisk,
	LocalStorageDisk,
	OpFsDisk,
	IndexedDbDisk,
	NullDisk,
}

impl DiskType {
	pub const ALL: [DiskType; 5] = [
		DiskType::MemDisk,
		DiskType::LocalStorageDisk,
		DiskType::OpFsDisk,
		DiskType::IndexedDbDisk,
		DiskType::NullDisk,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::MemDisk => "MemDisk",
			Self::LocalStorageDisk => "LocalStorageDisk",
			Self::OpFsDisk => "OpFsDisk",
			Self::IndexedDbDisk => "IndexedDbDisk",
			Self::NullDisk => "NullDisk",
		}
	}

	/// Whether disks of this type survive a process restart.
	pub fn is_persistent(&self) -> bool {
		matches!(self, Self::LocalStorageDisk | Self::OpFsDisk | Self::IndexedDbDisk)
	}
}

impl fmt::Display for DiskType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for DiskType {
	type Err = DiskError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|t| t.as_str() == s)
			.ok_or_else(|| DiskError::InvalidDiskType(s.to_string()))
	}
}

impl TryFrom<String> for DiskType {
	type Error = DiskError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<DiskType> for String {
	fn from(t: DiskType) -> String {
		t.as_str().to_string()
	}
}

/// Persisted description of a disk: `{guid, type, indexCache?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSnapshot {
	pub guid: String,
	#[serde(rename = "type")]
	pub disk_type: DiskType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub index_cache: Option<TreeSnapshot>,
}

/// A record handed to the factory is the same shape as a snapshot; the
/// index cache is simply absent for fresh disks.
pub type DiskRecord = DiskSnapshot;

impl DiskSnapshot {
	pub fn new(guid: impl Into<String>, disk_type: DiskType) -> Self {
		Self {
			guid: guid.into(),
			disk_type,
			index_cache: None,
		}
	}
}

/// Wraps the backend chosen for a disk before the disk takes ownership of
/// it. Used for instrumentation and access control layers.
pub type FsTransform = Box<dyn FnOnce(Arc<dyn StorageBackend>) -> Arc<dyn StorageBackend> + Send>;

/// Builds disks from records and snapshots. Holds the context every disk
/// it creates shares.
#[derive(Debug, Clone, Default)]
pub struct DiskFactory {
	ctx: DiskContext,
}

impl DiskFactory {
	pub fn new(ctx: DiskContext) -> Self {
		Self { ctx }
	}

	pub fn context(&self) -> &DiskContext {
		&self.ctx
	}

	/// Guids name host files and directories, so they are restricted to a
	/// conservative character set.
	fn check_guid(guid: &str) -> Result<(), DiskError> {
		let valid = !guid.is_empty()
			&& guid != "."
			&& guid != ".."
			&& guid
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
		if valid {
			Ok(())
		} else {
			Err(DiskError::InvalidOperation(format!("invalid disk guid: {:?}", guid)))
		}
	}

	fn backend_for(&self, disk_type: DiskType, guid: &str) -> Option<Arc<dyn StorageBackend>> {
		let backend: Arc<dyn StorageBackend> = match disk_type {
			DiskType::MemDisk => Arc::new(MemoryStorage::new()),
			DiskType::LocalStorageDisk => Arc::new(KvStorage::new(self.ctx.kv_store(), guid)),
			DiskType::OpFsDisk => Arc::new(DirectoryStorage::new(self.ctx.directory_root(guid))),
			DiskType::IndexedDbDisk => Arc::new(DatabaseStorage::new(self.ctx.database_file(guid))),
			DiskType::NullDisk => return None,
		};
		Some(backend)
	}

	/// Build a disk for `record`. The disk still has to be made ready with
	/// [`Disk::ready`] before use.
	pub fn create(&self, record: &DiskRecord, transform: Option<FsTransform>) -> Result<Disk, DiskError> {
		Self::check_guid(&record.guid)?;
		let backend = self
			.backend_for(record.disk_type, &record.guid)
			.map(|backend| match transform {
				Some(wrap) => wrap(backend),
				None => backend,
			});
		tracing::debug!(
			guid = %record.guid,
			disk_type = %record.disk_type,
			cached_index = record.index_cache.is_some(),
			"creating disk"
		);
		Disk::new(
			record.guid.clone(),
			record.disk_type,
			backend,
			record.index_cache.as_ref(),
			&self.ctx,
		)
	}

	/// Fresh disk of `disk_type` under a newly generated guid.
	pub fn create_new(&self, disk_type: DiskType) -> Result<Disk, DiskError> {
		let guid = uuid::Uuid::new_v4().to_string();
		self.create(&DiskRecord::new(guid, disk_type), None)
	}

	pub fn from_snapshot(&self, snapshot: &DiskSnapshot) -> Result<Disk, DiskError> {
		self.create(snapshot, None)
	}

	/// Parse a snapshot value. An unknown `type` tag is reported as
	/// `InvalidDiskType` rather than as a JSON error.
	pub fn from_value(&self, value: &serde_json::Value) -> Result<Disk, DiskError> {
		match value.get("type") {
			Some(serde_json::Value::String(tag)) => {
				tag.parse::<DiskType>()?;
			}
			Some(other) => return Err(DiskError::InvalidDiskType(other.to_string())),
			None => return Err(DiskError::InvalidDiskType(String::new())),
		}
		let snapshot: DiskSnapshot = serde_json::from_value(value.clone())?;
		self.from_snapshot(&snapshot)
	}

	pub fn from_json(&self, json: &str) -> Result<Disk, DiskError> {
		let value: serde_json::Value = serde_json::from_str(json)?;
		self.from_value(&value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::disk::DiskState;

	#[test]
	fn type_tags_round_trip() {
		for t in DiskType::ALL {
			assert_eq!(t.as_str().parse::<DiskType>().unwrap(), t);
		}
		let err = "bogus".parse::<DiskType>().unwrap_err();
		assert_eq!(err.to_string(), "invalid disk type: bogus");
	}

	#[test]
	fn unknown_type_in_json_is_invalid_disk_type() {
		let factory = DiskFactory::default();
		let err = factory
			.from_json(r#"{"guid": "g", "type": "bogus"}"#)
			.unwrap_err();
		assert!(matches!(err, DiskError::InvalidDiskType(ref t) if t == "bogus"));
		assert_eq!(err.to_string(), "invalid disk type: bogus");
	}

	#[test]
	fn snapshot_json_shape() {
		let snap = DiskSnapshot::new("g1", DiskType::IndexedDbDisk);
		assert_eq!(
			serde_json::to_value(&snap).unwrap(),
			serde_json::json!({"guid": "g1", "type": "IndexedDbDisk"})
		);
	}

	#[test]
	fn guids_must_be_path_safe() {
		let factory = DiskFactory::default();
		for guid in ["", "..", "a/b", "a b"] {
			let record = DiskRecord::new(guid, DiskType::MemDisk);
			assert!(factory.create(&record, None).is_err(), "{guid:?}");
		}
	}

	#[tokio::test]
	async fn null_disk_is_unavailable() {
		let factory = DiskFactory::default();
		let disk = factory
			.create(&DiskRecord::new("n", DiskType::NullDisk), None)
			.unwrap();
		assert_eq!(disk.state(), DiskState::Unavailable);
		assert!(matches!(disk.ready().await, Err(DiskError::Unavailable)));
		assert!(matches!(disk.read_file("/a").await, Err(DiskError::Unavailable)));
		disk.destroy().await.unwrap();
		assert_eq!(disk.state(), DiskState::Unavailable);
	}

	#[tokio::test]
	async fn create_new_generates_guid() {
		let factory = DiskFactory::default();
		let a = factory.create_new(DiskType::MemDisk).unwrap();
		let b = factory.create_new(DiskType::MemDisk).unwrap();
		assert_ne!(a.guid(), b.guid());
		assert_eq!(a.disk_type(), DiskType::MemDisk);
	}
}
