// ---------------------------------------------------------------------------
// Disk behaviour across backends, driven through the factory
// ---------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use folio_disk::storage::{Capabilities, DirEntry, Metadata};
use folio_disk::{
	AbsPath, DiskContext, DiskError, DiskEvent, DiskFactory, DiskRecord, DiskType, MoveOptions,
	StorageBackend, StorageError,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Instrumented backend
// ---------------------------------------------------------------------------

/// Wraps a backend, counting calls and recording how many mutations were
/// in flight at once.
#[derive(Default)]
struct Probe {
	calls: AtomicUsize,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
	reject_writes: AtomicBool,
	gate: ReadGate,
}

/// Once armed, holds the next `read_file` after the backend has answered,
/// until released.
#[derive(Default)]
struct ReadGate {
	armed: AtomicBool,
	parked: Notify,
	release: Notify,
}

struct Instrumented {
	inner: Arc<dyn StorageBackend>,
	probe: Arc<Probe>,
}

impl Instrumented {
	async fn mutation<T>(
		&self,
		op: impl std::future::Future<Output = Result<T, StorageError>>,
	) -> Result<T, StorageError> {
		self.probe.calls.fetch_add(1, Ordering::SeqCst);
		let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(2)).await;
		let result = op.await;
		self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
		result
	}

	fn read(&self) {
		self.probe.calls.fetch_add(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl StorageBackend for Instrumented {
	fn name(&self) -> &'static str {
		self.inner.name()
	}

	fn capabilities(&self) -> Capabilities {
		self.inner.capabilities()
	}

	async fn init(&self) -> Result<(), StorageError> {
		self.inner.init().await
	}

	async fn read_file(&self, path: &AbsPath) -> Result<Vec<u8>, StorageError> {
		self.read();
		let result = self.inner.read_file(path).await;
		let gate = &self.probe.gate;
		if gate.armed.swap(false, Ordering::SeqCst) {
			gate.parked.notify_one();
			gate.release.notified().await;
		}
		result
	}

	async fn write_file(&self, path: &AbsPath, data: &[u8]) -> Result<(), StorageError> {
		if self.probe.reject_writes.load(Ordering::SeqCst) {
			return Err(StorageError::Io(std::io::Error::other("writes rejected")));
		}
		self.mutation(self.inner.write_file(path, data)).await
	}

	async fn remove_file(&self, path: &AbsPath) -> Result<(), StorageError> {
		self.mutation(self.inner.remove_file(path)).await
	}

	async fn mkdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.mutation(self.inner.mkdir(path, recursive)).await
	}

	async fn rmdir(&self, path: &AbsPath, recursive: bool) -> Result<(), StorageError> {
		self.mutation(self.inner.rmdir(path, recursive)).await
	}

	async fn readdir(&self, path: &AbsPath) -> Result<Vec<DirEntry>, StorageError> {
		self.read();
		self.inner.readdir(path).await
	}

	async fn rename(&self, old: &AbsPath, new: &AbsPath) -> Result<(), StorageError> {
		self.mutation(self.inner.rename(old, new)).await
	}

	async fn stat(&self, path: &AbsPath) -> Result<Metadata, StorageError> {
		self.read();
		self.inner.stat(path).await
	}
}

fn instrumented(probe: &Arc<Probe>) -> folio_disk::FsTransform {
	let probe = probe.clone();
	Box::new(move |inner| Arc::new(Instrumented { inner, probe }))
}

fn factory() -> DiskFactory {
	DiskFactory::new(DiskContext::ephemeral())
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutations_never_overlap() {
	let probe = Arc::new(Probe::default());
	let disk = factory()
		.create(&DiskRecord::new("m", DiskType::MemDisk), Some(instrumented(&probe)))
		.unwrap();
	disk.ready().await.unwrap();
	let disk = Arc::new(disk);

	let mut tasks = Vec::new();
	for i in 0..16 {
		let disk = disk.clone();
		tasks.push(tokio::spawn(async move {
			let path = format!("/dir{}/sub/file.md", i % 4);
			disk.write_file_recursive(&path, format!("{i}").as_bytes())
				.await
				.unwrap();
			let _ = disk.remove_single(&path).await;
		}));
	}
	for task in tasks {
		task.await.unwrap();
	}
	assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
	assert!(!disk.is_busy());
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_read_does_not_drop_a_concurrent_write() {
	let probe = Arc::new(Probe::default());
	let disk = factory()
		.create(&DiskRecord::new("race", DiskType::MemDisk), Some(instrumented(&probe)))
		.unwrap();
	disk.ready().await.unwrap();
	disk.hydrate_index().await.unwrap();
	let disk = Arc::new(disk);

	probe.gate.armed.store(true, Ordering::SeqCst);
	let reader = tokio::spawn({
		let disk = disk.clone();
		async move { disk.read_file("/race.md").await }
	});
	probe.gate.parked.notified().await;

	disk.write_file("/race.md", b"data").await.unwrap();
	probe.gate.release.notify_one();

	assert!(matches!(reader.await.unwrap(), Err(DiskError::NotFound(_))));
	assert!(disk.path_exists("/race.md").await.unwrap());
	assert!(disk.node_from_path("/race.md").unwrap().is_some());
	assert_eq!(disk.read_file("/race.md").await.unwrap(), b"data");
}

#[tokio::test]
async fn failed_recursive_write_still_indexes_created_parents() {
	let probe = Arc::new(Probe::default());
	let disk = factory()
		.create(&DiskRecord::new("parents", DiskType::MemDisk), Some(instrumented(&probe)))
		.unwrap();
	disk.ready().await.unwrap();
	disk.hydrate_index().await.unwrap();

	probe.reject_writes.store(true, Ordering::SeqCst);
	let err = disk.write_file_recursive("/a/b/c.md", b"c").await.unwrap_err();
	assert!(matches!(err, DiskError::Storage(_)));

	assert!(disk.path_exists("/a/b").await.unwrap());
	assert!(disk.node_from_path("/a/b").unwrap().is_some());
	assert!(disk.node_from_path("/a/b/c.md").unwrap().is_none());
	assert_eq!(disk.readdir("/a").await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn snapshot_lookups_make_no_backend_calls() {
	let source = factory().create_new(DiskType::MemDisk).unwrap();
	source.ready().await.unwrap();
	source.write_file_recursive("/x/y.md", b"y").await.unwrap();
	source.hydrate_index().await.unwrap();
	let json = source.to_json().unwrap();

	let probe = Arc::new(Probe::default());
	let snapshot: DiskRecord = serde_json::from_value(json).unwrap();
	let restored = factory()
		.create(&snapshot, Some(instrumented(&probe)))
		.unwrap();
	restored.ready().await.unwrap();

	assert!(restored.is_hydrated());
	let node = restored.node_from_path("/x/y.md").unwrap().unwrap();
	assert!(node.is_file());
	assert!(restored.path_exists("/x").await.unwrap());
	assert!(!restored.path_exists("/nope").await.unwrap());
	assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bogus_type_is_rejected() {
	let err = factory()
		.from_json(r#"{"guid": "g", "type": "bogus", "indexCache": null}"#)
		.unwrap_err();
	assert_eq!(err.to_string(), "invalid disk type: bogus");
}

#[tokio::test]
async fn corrupt_index_cache_is_rejected() {
	let err = factory()
		.from_json(r#"{"guid": "g", "type": "MemDisk", "indexCache": {"../x": null}}"#)
		.unwrap_err();
	assert!(matches!(err, DiskError::Index(_)));
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_copy_keeps_successes() {
	let disk = factory().create_new(DiskType::MemDisk).unwrap();
	disk.ready().await.unwrap();
	disk.write_file("/a.md", b"a").await.unwrap();
	disk.write_file("/b.md", b"b").await.unwrap();
	disk.write_file("/taken.md", b"t").await.unwrap();

	let pairs = vec![
		("/a.md".to_string(), "/copy/a.md".to_string()),
		("/missing.md".to_string(), "/copy/m.md".to_string()),
		("/b.md".to_string(), "/taken.md".to_string()),
	];
	let err = disk
		.copy_multiple_files(&pairs, &CancellationToken::new())
		.await
		.unwrap_err();
	let DiskError::Batch(report) = err else {
		panic!("expected batch error, got {err:?}");
	};
	assert_eq!(report.succeeded, vec!["/a.md"]);
	assert_eq!(report.failed_paths(), vec!["/missing.md", "/b.md"]);
	assert!(report.failures[1].error.to_string().contains("/taken.md"));

	// The successful copy stays applied.
	assert_eq!(disk.read_file("/copy/a.md").await.unwrap(), b"a");
	assert_eq!(disk.read_file("/taken.md").await.unwrap(), b"t");
}

#[tokio::test]
async fn cancelled_batch_reports_completed_items() {
	let disk = Arc::new(factory().create_new(DiskType::MemDisk).unwrap());
	disk.ready().await.unwrap();
	for i in 0..3 {
		disk.write_file(&format!("/f{i}.md"), b"x").await.unwrap();
	}

	let cancel = CancellationToken::new();
	let trigger = cancel.clone();
	let done = Arc::new(AtomicUsize::new(0));
	let counter = done.clone();
	// Cancel as soon as the first copy lands.
	let _sub = disk.on_create(move |_| {
		if counter.fetch_add(1, Ordering::SeqCst) == 0 {
			trigger.cancel();
		}
	});

	let pairs: Vec<(String, String)> = (0..3)
		.map(|i| (format!("/f{i}.md"), format!("/out/f{i}.md")))
		.collect();
	let err = disk.copy_multiple_files(&pairs, &cancel).await.unwrap_err();
	match err {
		DiskError::Cancelled { completed } => assert!(completed.len() < 3),
		other => panic!("expected cancellation, got {other:?}"),
	}
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
	let disk = factory().create_new(DiskType::MemDisk).unwrap();
	disk.ready().await.unwrap();
	disk.write_file("/a.md", b"a").await.unwrap();
	let cancel = CancellationToken::new();
	cancel.cancel();
	let pairs = vec![("/a.md".to_string(), "/b.md".to_string())];
	let err = disk.copy_multiple_files(&pairs, &cancel).await.unwrap_err();
	assert!(matches!(err, DiskError::Cancelled { ref completed } if completed.is_empty()));
	assert!(!disk.path_exists("/b.md").await.unwrap());
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listeners_can_call_back_into_the_disk() {
	let disk = Arc::new(factory().create_new(DiskType::MemDisk).unwrap());
	disk.ready().await.unwrap();
	let seen = Arc::new(Mutex::new(Vec::new()));

	let sink = seen.clone();
	let inner = disk.clone();
	let sub = disk.on_event(move |event| {
		// The lock is released before listeners run.
		assert!(!inner.is_busy());
		sink.lock().unwrap().push(event.clone());
	});

	disk.write_file("/a.md", b"").await.unwrap();
	disk.rename("/a.md", "/b.md").await.unwrap();
	disk.remove("/b.md", folio_disk::RemoveOptions { permanent: true })
		.await
		.unwrap();
	sub.unsubscribe();
	disk.write_file("/c.md", b"").await.unwrap();

	let seen = seen.lock().unwrap();
	let kinds: Vec<_> = seen.iter().map(DiskEvent::kind).collect();
	assert_eq!(
		kinds,
		vec![
			folio_disk::EventKind::Create,
			folio_disk::EventKind::Rename,
			folio_disk::EventKind::Delete
		]
	);
}

// ---------------------------------------------------------------------------
// Persistent backends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn database_disk_reopens_with_content() {
	let dir = tempfile::tempdir().unwrap();
	let factory = DiskFactory::new(DiskContext::with_data_dir(dir.path()));
	let record = DiskRecord::new("db", DiskType::IndexedDbDisk);

	let disk = factory.create(&record, None).unwrap();
	disk.ready().await.unwrap();
	disk.write_file_recursive("/notes/a.md", b"persisted").await.unwrap();
	disk.destroy().await.unwrap();

	let reopened = factory.create(&record, None).unwrap();
	reopened.ready().await.unwrap();
	assert_eq!(reopened.read_file("/notes/a.md").await.unwrap(), b"persisted");
	assert_eq!(
		reopened.glob(&["**/*.md".to_string()]).await.unwrap(),
		vec![folio_disk::path::normalize("/notes/a.md").unwrap()]
	);
}

#[tokio::test]
async fn key_value_disks_share_a_store_but_not_a_namespace() {
	let dir = tempfile::tempdir().unwrap();
	let ctx = DiskContext::with_data_dir(dir.path()).delete_on_teardown(true);
	let factory = DiskFactory::new(ctx);

	let one = factory
		.create(&DiskRecord::new("one", DiskType::LocalStorageDisk), None)
		.unwrap();
	let two = factory
		.create(&DiskRecord::new("two", DiskType::LocalStorageDisk), None)
		.unwrap();
	one.ready().await.unwrap();
	two.ready().await.unwrap();
	one.write_file("/a.md", b"1").await.unwrap();
	assert!(!two.path_exists("/a.md").await.unwrap());

	// A second factory over the same data dir sees the persisted keys.
	let again = DiskFactory::new(DiskContext::with_data_dir(dir.path()))
		.create(&DiskRecord::new("one", DiskType::LocalStorageDisk), None)
		.unwrap();
	again.ready().await.unwrap();
	assert_eq!(again.read_file("/a.md").await.unwrap(), b"1");

	// Teardown with deletion drops the namespace from the shared store.
	one.destroy().await.unwrap();
	let recreated = factory
		.create(&DiskRecord::new("one", DiskType::LocalStorageDisk), None)
		.unwrap();
	recreated.ready().await.unwrap();
	assert!(recreated.read_file("/a.md").await.unwrap_err().is_not_found());
	assert_eq!(two.readdir("/").await.unwrap(), Vec::<String>::new());
}

#[tokio::test]
async fn directory_disk_moves_and_rejects_symlinks() {
	let dir = tempfile::tempdir().unwrap();
	let factory = DiskFactory::new(DiskContext::with_data_dir(dir.path()));
	let disk = factory
		.create(&DiskRecord::new("opfs", DiskType::OpFsDisk), None)
		.unwrap();
	disk.ready().await.unwrap();

	disk.write_file_recursive("/a/b.md", b"b").await.unwrap();
	disk.move_path("/a", "/c", MoveOptions::default()).await.unwrap();
	assert_eq!(disk.read_file("/c/b.md").await.unwrap(), b"b");
	assert!(dir.path().join("opfs").join("opfs").join("c").join("b.md").exists());

	let err = disk.symlink("/c/b.md", "/link.md").await.unwrap_err();
	assert!(matches!(err, DiskError::Unsupported(_)));
	assert!(disk.node_from_path("/link.md").unwrap().is_none());
}

#[tokio::test]
async fn memory_disk_supports_symlinks() {
	let disk = factory().create_new(DiskType::MemDisk).unwrap();
	disk.ready().await.unwrap();
	disk.write_file("/target.md", b"t").await.unwrap();
	disk.symlink("/target.md", "/link.md").await.unwrap();
	assert_eq!(disk.read_file("/link.md").await.unwrap(), b"t");
	assert_eq!(disk.readlink("/link.md").await.unwrap().as_str(), "/target.md");
}

#[tokio::test]
async fn linked_directories_are_indexed_but_not_followed() {
	let disk = factory().create_new(DiskType::MemDisk).unwrap();
	disk.ready().await.unwrap();
	disk.write_file_recursive("/real/sub/x.md", b"x").await.unwrap();
	disk.symlink("/real", "/alias").await.unwrap();
	// A link back to its own ancestor must not send the walk in circles.
	disk.symlink("/real", "/real/sub/up").await.unwrap();

	let count = disk.hydrate_index().await.unwrap();
	assert_eq!(count, 5);
	assert!(disk.node_from_path("/alias").unwrap().is_some());
	assert!(disk.node_from_path("/alias/sub").unwrap().is_none());

	let hits = disk.search("x.md").await.unwrap();
	assert_eq!(hits.len(), 1);
	assert_eq!(hits[0].path.as_str(), "/real/sub/x.md");

	let files = disk.list_files(Default::default()).await.unwrap();
	assert!(files.iter().any(|p| p.as_str() == "/real/sub/x.md"));

	disk.copy_dir("/real", "/copy", MoveOptions::default()).await.unwrap();
	assert_eq!(disk.readlink("/copy/sub/up").await.unwrap().as_str(), "/real");
	assert_eq!(disk.read_file("/copy/sub/x.md").await.unwrap(), b"x");
}
