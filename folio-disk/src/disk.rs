// ---------------------------------------------------------------------------
// Disk: storage backend + lock + tree index under one guid
// ---------------------------------------------------------------------------
//
// Every mutating operation takes the disk lock once, runs its backend
// primitives, updates the index while still holding the lock, and emits
// change events after the lock is released. The index is a structural cache
// and is only touched after the backend call it mirrors has succeeded.
// ---------------------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::DiskContext;
use crate::error::{BatchError, BatchFailure, DiskError, StorageError};
use crate::events::{DiskEvent, EventBus, EventKind, RenameDetail, Unsubscribe};
use crate::factory::{DiskSnapshot, DiskType};
use crate::mutex_fs::{new_lock, DiskLock, FsGuard, MutexFs};
use crate::path::{
	is_in_trash, is_special, normalize, numbered, reduce_paths, trash_path_for, untrash_path_for,
	validate, AbsPath, PathLimits, SpecialDir,
};
use crate::storage::{Capabilities, DirEntry, Metadata, StorageBackend};
use crate::tree::{FileTree, NodeKind, TreeNode, TreeSnapshot};

/// Upper bound on `name-N.ext` candidates tried when picking a free name.
const MAX_UNIQUE_ATTEMPTS: usize = 10_000;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskState {
	Constructing,
	Ready,
	TornDown,
	/// No backend behind this disk. Never becomes ready.
	Unavailable,
}

/// Options for moves and copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOptions {
	/// Replace whatever exists at the destination.
	pub overwrite: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
	/// Delete instead of moving to the trash.
	pub permanent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
	/// Restrict the listing to this subtree.
	pub under: Option<String>,
	pub include_special: bool,
	pub include_dirs: bool,
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

/// Index changes produced by one operation, turned into events once the
/// lock is released.
#[derive(Debug, Default)]
struct Changes {
	deleted: Vec<AbsPath>,
	renamed: Vec<RenameDetail>,
	created: Vec<AbsPath>,
}

impl Changes {
	fn created(created: Vec<AbsPath>) -> Self {
		Self {
			created,
			..Self::default()
		}
	}
}

#[derive(Debug, Default)]
struct Moved {
	/// Paths that were replaced at the destination.
	replaced: Vec<AbsPath>,
	/// The moved subtree, by its old paths.
	old_paths: Vec<AbsPath>,
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

pub struct Disk {
	guid: String,
	disk_type: DiskType,
	lock: DiskLock,
	fs: Option<MutexFs>,
	tree: RwLock<FileTree>,
	hydrated: AtomicBool,
	state: RwLock<DiskState>,
	init: OnceCell<()>,
	events: EventBus,
	limits: PathLimits,
	delete_on_teardown: bool,
}

impl Disk {
	// -- Constructors -----------------------------------------------------

	/// Build a disk over `backend`. With an index snapshot the tree is
	/// trusted as hydrated; without one it is built lazily from the backend.
	pub(crate) fn new(
		guid: String,
		disk_type: DiskType,
		backend: Option<Arc<dyn StorageBackend>>,
		index: Option<&TreeSnapshot>,
		ctx: &DiskContext,
	) -> Result<Self, DiskError> {
		let tree = match index {
			Some(snapshot) => FileTree::from_snapshot(guid.clone(), snapshot)?,
			None => FileTree::new(guid.clone()),
		};
		let lock = new_lock();
		let state = if backend.is_some() {
			DiskState::Constructing
		} else {
			DiskState::Unavailable
		};
		Ok(Self {
			fs: backend.map(|b| MutexFs::new(b, lock.clone())),
			lock,
			tree: RwLock::new(tree),
			hydrated: AtomicBool::new(index.is_some()),
			state: RwLock::new(state),
			init: OnceCell::new(),
			events: EventBus::new(),
			limits: ctx.path_limits().clone(),
			delete_on_teardown: ctx.deletes_on_teardown(),
			guid,
			disk_type,
		})
	}

	// -- Accessors --------------------------------------------------------

	pub fn guid(&self) -> &str {
		&self.guid
	}

	pub fn disk_type(&self) -> DiskType {
		self.disk_type
	}

	pub fn state(&self) -> DiskState {
		*self.state.read().unwrap_or_else(|e| e.into_inner())
	}

	pub fn is_hydrated(&self) -> bool {
		self.hydrated.load(Ordering::SeqCst)
	}

	/// True while a mutation holds the disk lock.
	pub fn is_busy(&self) -> bool {
		self.lock.try_lock().is_err()
	}

	pub fn backend_name(&self) -> &'static str {
		self.fs
			.as_ref()
			.map(|fs| fs.backend().name())
			.unwrap_or("none")
	}

	pub fn capabilities(&self) -> Capabilities {
		self.fs
			.as_ref()
			.map(MutexFs::capabilities)
			.unwrap_or_default()
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	// -- Helpers (private) ------------------------------------------------

	fn set_state(&self, next: DiskState) -> DiskState {
		let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
		std::mem::replace(&mut *state, next)
	}

	fn tree_read(&self) -> RwLockReadGuard<'_, FileTree> {
		self.tree.read().unwrap_or_else(|e| e.into_inner())
	}

	fn tree_write(&self) -> RwLockWriteGuard<'_, FileTree> {
		self.tree.write().unwrap_or_else(|e| e.into_inner())
	}

	fn resolve(&self, input: &str) -> Result<AbsPath, DiskError> {
		let path = normalize(input)?;
		validate(&path, &self.limits)?;
		Ok(path)
	}

	fn check_ready(&self) -> Result<(), DiskError> {
		match self.state() {
			DiskState::Ready => Ok(()),
			DiskState::Constructing => Err(DiskError::NotReady(self.guid.clone())),
			DiskState::TornDown => Err(DiskError::TornDown(self.guid.clone())),
			DiskState::Unavailable => Err(DiskError::Unavailable),
		}
	}

	fn fs(&self) -> Result<&MutexFs, DiskError> {
		self.check_ready()?;
		self.fs.as_ref().ok_or(DiskError::Unavailable)
	}

	/// Take the disk lock for a composite operation. Readiness is checked
	/// again once the lock is held, since a teardown may have run while we
	/// were waiting.
	async fn begin(&self) -> Result<FsGuard, DiskError> {
		let guard = self.fs()?.begin().await;
		self.check_ready()?;
		Ok(guard)
	}

	/// Drop `path` from the index if the backend says it is gone. Only for
	/// results obtained while holding the lock.
	fn reconcile<T>(&self, path: &AbsPath, result: Result<T, StorageError>) -> Result<T, DiskError> {
		result.map_err(|err| {
			if err.is_not_found() {
				self.forget(path);
			}
			err.into()
		})
	}

	/// Reconcile a `NotFound` seen by a read that ran without the lock. A
	/// writer may have created `path` since, so the backend is asked again
	/// under the lock before anything is dropped.
	async fn reconcile_read<T>(
		&self,
		path: &AbsPath,
		result: Result<T, StorageError>,
	) -> Result<T, DiskError> {
		match result {
			Err(err) if err.is_not_found() => {
				if self.tree_read().contains(path) {
					if let Ok(guard) = self.begin().await {
						if guard.stat(path).await.is_err_and(|e| e.is_not_found()) {
							self.forget(path);
						}
					}
				}
				Err(err.into())
			}
			other => Ok(other?),
		}
	}

	fn forget(&self, path: &AbsPath) {
		let mut tree = self.tree_write();
		if tree.contains(path) && tree.remove(path, true).is_ok() {
			tracing::debug!(disk = %self.guid, path = %path, "dropped stale index entry");
		}
	}

	fn invalidate_index(&self, reason: &str) {
		if self.hydrated.swap(false, Ordering::SeqCst) {
			tracing::warn!(disk = %self.guid, reason, "index out of sync with backend, will rehydrate");
		}
	}

	/// Insert into the index, replacing entries that contradict what the
	/// backend just reported. Returns the created paths.
	fn index_insert(&self, path: &AbsPath, kind: NodeKind) -> Vec<AbsPath> {
		let mut tree = self.tree_write();
		match tree.insert(path, kind) {
			Ok(created) => created,
			Err(_) => {
				let conflict = path
					.ancestors()
					.into_iter()
					.skip(1)
					.find(|a| tree.kind_of(a) == Some(NodeKind::File))
					.unwrap_or_else(|| path.clone());
				tracing::debug!(disk = %self.guid, path = %conflict, "replacing conflicting index entry");
				let _ = tree.remove(&conflict, true);
				match tree.insert(path, kind) {
					Ok(created) => created,
					Err(err) => {
						drop(tree);
						self.invalidate_index(&err.to_string());
						vec![path.clone()]
					}
				}
			}
		}
	}

	/// Mirror a backend move in the index. Returns the old paths of the
	/// moved subtree.
	fn index_move(&self, old: &AbsPath, new: &AbsPath, kind: NodeKind) -> Vec<AbsPath> {
		let mut tree = self.tree_write();
		if tree.contains(old) {
			let old_paths = tree.walk(old).into_iter().map(|(p, _)| p).collect();
			if let Err(err) = tree.move_node(old, new, true) {
				drop(tree);
				self.invalidate_index(&err.to_string());
			}
			return old_paths;
		}
		if tree.contains(new) {
			let _ = tree.remove(new, true);
		}
		drop(tree);
		if kind == NodeKind::Directory {
			// The subtree below `old` was never indexed.
			self.invalidate_index("moved an unindexed directory");
		}
		self.index_insert(new, kind);
		vec![old.clone()]
	}

	fn emit(&self, changes: Changes) {
		if !changes.deleted.is_empty() {
			self.events.emit(DiskEvent::delete(changes.deleted));
		}
		if !changes.renamed.is_empty() {
			self.events.emit(DiskEvent::Rename(changes.renamed));
		}
		if !changes.created.is_empty() {
			self.events.emit(DiskEvent::create(changes.created));
		}
	}

	/// First free path among `candidate`, `candidate-1`, `candidate-2`, ...
	async fn unique_path(&self, guard: &FsGuard, candidate: AbsPath) -> Result<AbsPath, DiskError> {
		if !guard.exists(&candidate).await? {
			return Ok(candidate);
		}
		for n in 1..=MAX_UNIQUE_ATTEMPTS {
			let next = numbered(&candidate, n);
			validate(&next, &self.limits)?;
			if !guard.exists(&next).await? {
				return Ok(next);
			}
		}
		Err(DiskError::InvalidOperation(format!(
			"no free name available for {}",
			candidate
		)))
	}

	/// Breadth-first listing of everything below `root`, parents before
	/// children.
	async fn collect_subtree(
		&self,
		guard: &FsGuard,
		root: &AbsPath,
	) -> Result<Vec<(AbsPath, DirEntry)>, DiskError> {
		let mut out = Vec::new();
		let mut queue = VecDeque::from([root.clone()]);
		while let Some(dir) = queue.pop_front() {
			for entry in guard.readdir(&dir).await? {
				let path = dir.child(&entry.name)?;
				if path.depth() > self.limits.max_path_depth {
					tracing::warn!(disk = %self.guid, path = %path, "skipping entry beyond max depth");
					continue;
				}
				// Links are indexed but never followed.
				if entry.kind == NodeKind::Directory && !entry.is_link {
					queue.push_back(path.clone());
				}
				out.push((path, entry));
			}
		}
		Ok(out)
	}

	/// Remove `path` from backend and index. Returns the removed paths.
	async fn remove_inner(&self, guard: &FsGuard, path: &AbsPath) -> Result<Vec<AbsPath>, DiskError> {
		let meta = self.reconcile(path, guard.stat(path).await)?;
		if meta.is_directory {
			match guard.rmdir(path, true).await {
				// A link to a directory is removed like a file.
				Err(StorageError::NotADirectory(_)) => guard.remove_file(path).await?,
				other => other?,
			}
		} else {
			self.reconcile(path, guard.remove_file(path).await)?;
		}
		let mut tree = self.tree_write();
		if tree.contains(path) {
			Ok(tree
				.remove(path, true)
				.unwrap_or_else(|_| vec![path.clone()]))
		} else {
			Ok(vec![path.clone()])
		}
	}

	async fn move_inner(
		&self,
		guard: &FsGuard,
		old: &AbsPath,
		new: &AbsPath,
		overwrite: bool,
	) -> Result<Moved, DiskError> {
		if old.is_root() || new.is_root() {
			return Err(DiskError::InvalidOperation("cannot move the root".to_string()));
		}
		if old == new {
			return Ok(Moved::default());
		}
		if old.is_ancestor_of(new) {
			return Err(DiskError::InvalidOperation(format!(
				"cannot move {} into its own subtree",
				old
			)));
		}
		let source = self.reconcile(old, guard.stat(old).await)?;
		let mut replaced = Vec::new();
		if guard.exists(new).await? {
			if !overwrite {
				return Err(DiskError::DestinationExists(new.to_string()));
			}
			if new.is_ancestor_of(old) {
				return Err(DiskError::InvalidOperation(format!(
					"cannot replace {} with its own descendant {}",
					new, old
				)));
			}
			replaced = self.remove_inner(guard, new).await?;
		}
		if let Some(parent) = new.parent() {
			guard.mkdir(&parent, true).await?;
		}
		self.reconcile(old, guard.rename(old, new).await)?;
		let kind = if source.is_directory {
			NodeKind::Directory
		} else {
			NodeKind::File
		};
		let old_paths = self.index_move(old, new, kind);
		Ok(Moved {
			replaced,
			old_paths,
		})
	}

	async fn write_inner(
		&self,
		guard: &FsGuard,
		path: &AbsPath,
		data: &[u8],
		recursive: bool,
	) -> Result<Changes, DiskError> {
		if path.is_root() {
			return Err(DiskError::InvalidOperation("cannot write to the root".to_string()));
		}
		let existed = guard.exists(path).await?;
		let mut created = Vec::new();
		if recursive {
			if let Some(parent) = path.parent() {
				guard.mkdir(&parent, true).await?;
				// Indexed now so a failed write leaves no unindexed parents.
				created = self.index_insert(&parent, NodeKind::Directory);
			}
		}
		guard.write_file(path, data).await?;
		created.extend(self.index_insert(path, NodeKind::File));
		if existed {
			created.retain(|p| p != path);
		}
		Ok(Changes::created(created))
	}

	async fn copy_file_inner(
		&self,
		guard: &FsGuard,
		src: &AbsPath,
		dst: &AbsPath,
		overwrite: bool,
	) -> Result<Changes, DiskError> {
		if src == dst {
			return Err(DiskError::InvalidOperation(format!(
				"cannot copy {} onto itself",
				src
			)));
		}
		let data = self.reconcile(src, guard.read_file(src).await)?;
		if guard.exists(dst).await? {
			if !overwrite {
				return Err(DiskError::DestinationExists(dst.to_string()));
			}
			if guard.stat(dst).await?.is_directory {
				return Err(StorageError::IsADirectory(dst.to_string()).into());
			}
		}
		self.write_inner(guard, dst, &data, true).await
	}

	async fn copy_dir_inner(
		&self,
		guard: &FsGuard,
		src: &AbsPath,
		dst: &AbsPath,
		overwrite: bool,
	) -> Result<Changes, DiskError> {
		if src == dst || src.is_ancestor_of(dst) {
			return Err(DiskError::InvalidOperation(format!(
				"cannot copy {} into itself",
				src
			)));
		}
		let meta = self.reconcile(src, guard.stat(src).await)?;
		if !meta.is_directory {
			return Err(StorageError::NotADirectory(src.to_string()).into());
		}
		let entries = self.collect_subtree(guard, src).await?;

		let mut changes = Changes::default();
		if guard.exists(dst).await? {
			if !overwrite {
				return Err(DiskError::DestinationExists(dst.to_string()));
			}
			if dst.is_ancestor_of(src) {
				return Err(DiskError::InvalidOperation(format!(
					"cannot replace {} with its own descendant {}",
					dst, src
				)));
			}
			changes.deleted = self.remove_inner(guard, dst).await?;
		}
		guard.mkdir(dst, true).await?;
		changes.created = self.index_insert(dst, NodeKind::Directory);
		for (path, entry) in entries {
			let Some(target) = path.rebase(src, dst) else {
				continue;
			};
			match entry.kind {
				_ if entry.is_link => {
					let link = guard.readlink(&path).await?;
					guard.symlink(&link, &target).await?;
				}
				NodeKind::Directory => guard.mkdir(&target, true).await?,
				NodeKind::File => {
					let data = guard.read_file(&path).await?;
					guard.write_file(&target, &data).await?;
				}
			}
			changes.created.extend(self.index_insert(&target, entry.kind));
		}
		Ok(changes)
	}

	async fn copy_any(
		&self,
		guard: &FsGuard,
		src: &AbsPath,
		dst: &AbsPath,
		overwrite: bool,
	) -> Result<Changes, DiskError> {
		let meta = self.reconcile(src, guard.stat(src).await)?;
		if meta.is_directory {
			self.copy_dir_inner(guard, src, dst, overwrite).await
		} else {
			self.copy_file_inner(guard, src, dst, overwrite).await
		}
	}

	async fn remove_one(&self, path: &AbsPath, opts: RemoveOptions) -> Result<(Changes, Option<AbsPath>), DiskError> {
		if path.is_root() {
			return Err(DiskError::InvalidOperation("cannot remove the root".to_string()));
		}
		let guard = self.begin().await?;
		if opts.permanent || is_in_trash(path) {
			let deleted = self.remove_inner(&guard, path).await?;
			tracing::debug!(disk = %self.guid, path = %path, removed = deleted.len(), "removed permanently");
			return Ok((
				Changes {
					deleted,
					..Changes::default()
				},
				None,
			));
		}
		let target = self.unique_path(&guard, trash_path_for(path)).await?;
		let moved = self.move_inner(&guard, path, &target, false).await?;
		tracing::debug!(disk = %self.guid, path = %path, trash = %target, "moved to trash");
		Ok((
			Changes {
				deleted: moved.old_paths,
				..Changes::default()
			},
			Some(target),
		))
	}

	// -- Lifecycle --------------------------------------------------------

	/// Run the backend handshake. Resolves immediately once ready; the null
	/// disk fails with `Unavailable` instead of waiting forever.
	pub async fn ready(&self) -> Result<(), DiskError> {
		match self.state() {
			DiskState::Ready => return Ok(()),
			DiskState::Unavailable => return Err(DiskError::Unavailable),
			DiskState::TornDown => return Err(DiskError::TornDown(self.guid.clone())),
			DiskState::Constructing => {}
		}
		let fs = self.fs.as_ref().ok_or(DiskError::Unavailable)?;
		self.init
			.get_or_try_init(|| async { fs.backend().init().await })
			.await?;
		{
			let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
			match *state {
				DiskState::Constructing => *state = DiskState::Ready,
				DiskState::Ready => {}
				DiskState::TornDown => return Err(DiskError::TornDown(self.guid.clone())),
				DiskState::Unavailable => return Err(DiskError::Unavailable),
			}
		}
		tracing::info!(disk = %self.guid, disk_type = %self.disk_type, backend = fs.backend().name(), "disk ready");
		Ok(())
	}

	/// Tear the disk down. Waits for in-flight mutations, releases the
	/// backend and drops all listeners. Later calls fail with `TornDown`.
	pub async fn destroy(&self) -> Result<(), DiskError> {
		let Some(fs) = &self.fs else {
			return Ok(());
		};
		let _guard = fs.begin().await;
		if self.set_state(DiskState::TornDown) == DiskState::TornDown {
			return Ok(());
		}
		self.events.clear();
		self.tree_write().clear();
		self.hydrated.store(false, Ordering::SeqCst);
		fs.backend().teardown(self.delete_on_teardown).await?;
		tracing::info!(disk = %self.guid, deleted = self.delete_on_teardown, "disk torn down");
		Ok(())
	}

	/// Rebuild the index from a full backend listing. Emits no events.
	pub async fn hydrate_index(&self) -> Result<usize, DiskError> {
		let guard = self.begin().await?;
		let entries = self.collect_subtree(&guard, &AbsPath::root()).await?;
		let mut tree = FileTree::new(self.guid.clone());
		for (path, entry) in &entries {
			tree.insert(path, entry.kind)?;
		}
		let count = entries.len();
		*self.tree_write() = tree;
		self.hydrated.store(true, Ordering::SeqCst);
		drop(guard);
		tracing::debug!(disk = %self.guid, entries = count, "index hydrated");
		Ok(count)
	}

	pub async fn ensure_index(&self) -> Result<(), DiskError> {
		if !self.is_hydrated() {
			self.hydrate_index().await?;
		}
		Ok(())
	}

	// -- Reads ------------------------------------------------------------

	pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, DiskError> {
		let path = self.resolve(path)?;
		let result = self.fs()?.read_file(&path).await;
		self.reconcile_read(&path, result).await
	}

	pub async fn read_text(&self, path: &str) -> Result<String, DiskError> {
		let bytes = self.read_file(path).await?;
		String::from_utf8(bytes)
			.map_err(|_| DiskError::InvalidOperation(format!("{} is not valid UTF-8", path)))
	}

	/// Sorted child names of a directory. Special directories are hidden
	/// unless `path` is itself inside one.
	pub async fn readdir(&self, path: &str) -> Result<Vec<String>, DiskError> {
		Ok(self
			.readdir_entries(path, false)
			.await?
			.into_iter()
			.map(|e| e.name)
			.collect())
	}

	pub async fn readdir_entries(
		&self,
		path: &str,
		include_special: bool,
	) -> Result<Vec<DirEntry>, DiskError> {
		let path = self.resolve(path)?;
		let result = self.fs()?.readdir(&path).await;
		let entries = self.reconcile_read(&path, result).await?;
		if include_special || is_special(&path) {
			return Ok(entries);
		}
		Ok(entries
			.into_iter()
			.filter(|e| path.child(&e.name).map(|c| !is_special(&c)).unwrap_or(true))
			.collect())
	}

	pub async fn stat(&self, path: &str) -> Result<Metadata, DiskError> {
		let path = self.resolve(path)?;
		let result = self.fs()?.stat(&path).await;
		self.reconcile_read(&path, result).await
	}

	/// Index lookup when the index is hydrated, backend check otherwise.
	pub async fn path_exists(&self, path: &str) -> Result<bool, DiskError> {
		let path = self.resolve(path)?;
		let fs = self.fs()?;
		if self.is_hydrated() {
			return Ok(self.tree_read().contains(&path));
		}
		Ok(fs.exists(&path).await?)
	}

	/// Index-only lookup; never touches the backend. Works before `ready()`
	/// so a restored snapshot can answer straight away.
	pub fn node_from_path(&self, path: &str) -> Result<Option<TreeNode>, DiskError> {
		if self.state() == DiskState::TornDown {
			return Err(DiskError::TornDown(self.guid.clone()));
		}
		let path = self.resolve(path)?;
		Ok(self.tree_read().node_from_path(&path))
	}

	pub async fn readlink(&self, path: &str) -> Result<AbsPath, DiskError> {
		let path = self.resolve(path)?;
		Ok(self.fs()?.readlink(&path).await?)
	}

	pub async fn list_files(&self, opts: ListOptions) -> Result<Vec<AbsPath>, DiskError> {
		let under = match &opts.under {
			Some(p) => self.resolve(p)?,
			None => AbsPath::root(),
		};
		self.check_ready()?;
		self.ensure_index().await?;
		let show_special = opts.include_special || is_special(&under);
		let tree = self.tree_read();
		Ok(tree
			.walk(&under)
			.into_iter()
			.skip(1)
			.filter(|(p, kind)| {
				(opts.include_dirs || *kind == NodeKind::File) && (show_special || !is_special(p))
			})
			.map(|(p, _)| p)
			.collect())
	}

	/// Files matching any pattern (`!pattern` excludes), special
	/// directories excluded.
	pub async fn glob(&self, patterns: &[String]) -> Result<Vec<AbsPath>, DiskError> {
		self.check_ready()?;
		self.ensure_index().await?;
		Ok(self.tree_read().glob(patterns))
	}

	/// Case-insensitive name search over the index.
	pub async fn search(&self, query: &str) -> Result<Vec<TreeNode>, DiskError> {
		self.check_ready()?;
		self.ensure_index().await?;
		Ok(self.tree_read().find(query))
	}

	// -- Writes -----------------------------------------------------------

	/// Write a file whose parent directory already exists.
	pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), DiskError> {
		let path = self.resolve(path)?;
		let changes = {
			let guard = self.begin().await?;
			self.write_inner(&guard, &path, data, false).await?
		};
		self.emit(changes);
		Ok(())
	}

	/// Write a file, creating missing parent directories first.
	pub async fn write_file_recursive(&self, path: &str, data: &[u8]) -> Result<(), DiskError> {
		let path = self.resolve(path)?;
		let changes = {
			let guard = self.begin().await?;
			self.write_inner(&guard, &path, data, true).await?
		};
		self.emit(changes);
		Ok(())
	}

	pub async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), DiskError> {
		let path = self.resolve(path)?;
		let changes = {
			let guard = self.begin().await?;
			guard.mkdir(&path, recursive).await?;
			Changes::created(self.index_insert(&path, NodeKind::Directory))
		};
		self.emit(changes);
		Ok(())
	}

	pub async fn mkdir_recursive(&self, path: &str) -> Result<(), DiskError> {
		self.mkdir(path, true).await
	}

	/// Create a file named `name` in `dir`, or `name-1`, `name-2`, ... when
	/// taken. Returns the path that was used.
	pub async fn new_file(&self, dir: &str, name: &str, data: &[u8]) -> Result<AbsPath, DiskError> {
		let dir = self.resolve(dir)?;
		let candidate = dir.child(name)?;
		validate(&candidate, &self.limits)?;
		let (changes, path) = {
			let guard = self.begin().await?;
			guard.mkdir(&dir, true).await?;
			let path = self.unique_path(&guard, candidate).await?;
			(self.write_inner(&guard, &path, data, false).await?, path)
		};
		self.emit(changes);
		Ok(path)
	}

	pub async fn new_dir(&self, dir: &str, name: &str) -> Result<AbsPath, DiskError> {
		let dir = self.resolve(dir)?;
		let candidate = dir.child(name)?;
		validate(&candidate, &self.limits)?;
		let (changes, path) = {
			let guard = self.begin().await?;
			guard.mkdir(&dir, true).await?;
			let path = self.unique_path(&guard, candidate).await?;
			guard.mkdir(&path, false).await?;
			(Changes::created(self.index_insert(&path, NodeKind::Directory)), path)
		};
		self.emit(changes);
		Ok(path)
	}

	pub async fn symlink(&self, target: &str, path: &str) -> Result<(), DiskError> {
		let target = self.resolve(target)?;
		let path = self.resolve(path)?;
		let changes = {
			let guard = self.begin().await?;
			guard.symlink(&target, &path).await?;
			Changes::created(self.index_insert(&path, NodeKind::File))
		};
		self.emit(changes);
		Ok(())
	}

	// -- Moves and copies -------------------------------------------------

	/// Move without emitting events.
	pub async fn quiet_move(&self, old: &str, new: &str, opts: MoveOptions) -> Result<(), DiskError> {
		let old = self.resolve(old)?;
		let new = self.resolve(new)?;
		let guard = self.begin().await?;
		self.move_inner(&guard, &old, &new, opts.overwrite).await?;
		Ok(())
	}

	/// Move and emit a rename event (plus a delete event for anything
	/// replaced at the destination).
	pub async fn move_path(&self, old: &str, new: &str, opts: MoveOptions) -> Result<(), DiskError> {
		let old = self.resolve(old)?;
		let new = self.resolve(new)?;
		let moved = {
			let guard = self.begin().await?;
			self.move_inner(&guard, &old, &new, opts.overwrite).await?
		};
		if moved.old_paths.is_empty() {
			return Ok(());
		}
		self.emit(Changes {
			deleted: moved.replaced,
			renamed: vec![RenameDetail {
				old_path: old,
				new_path: new,
			}],
			created: Vec::new(),
		});
		Ok(())
	}

	pub async fn rename(&self, old: &str, new: &str) -> Result<(), DiskError> {
		self.move_path(old, new, MoveOptions::default()).await
	}

	pub async fn copy_file(&self, src: &str, dst: &str, opts: MoveOptions) -> Result<(), DiskError> {
		let src = self.resolve(src)?;
		let dst = self.resolve(dst)?;
		let changes = {
			let guard = self.begin().await?;
			self.copy_file_inner(&guard, &src, &dst, opts.overwrite).await?
		};
		self.emit(changes);
		Ok(())
	}

	pub async fn copy_dir(&self, src: &str, dst: &str, opts: MoveOptions) -> Result<(), DiskError> {
		let src = self.resolve(src)?;
		let dst = self.resolve(dst)?;
		let changes = {
			let guard = self.begin().await?;
			self.copy_dir_inner(&guard, &src, &dst, opts.overwrite).await?
		};
		self.emit(changes);
		Ok(())
	}

	/// Copy each `(src, dst)` pair, files or directories, never
	/// overwriting. Best effort: a failed item does not undo earlier ones.
	/// Items are identified by their source path in the error report.
	/// Each item takes the lock on its own and emits its events before the
	/// next one starts; cancellation is checked between items.
	pub async fn copy_multiple_files(
		&self,
		pairs: &[(String, String)],
		cancel: &CancellationToken,
	) -> Result<Vec<AbsPath>, DiskError> {
		let mut report = BatchError::default();
		let mut copied = Vec::new();
		let mut cancelled = false;

		for (src, dst) in pairs {
			if cancel.is_cancelled() {
				cancelled = true;
				break;
			}
			let result = async {
				let src = self.resolve(src)?;
				let dst = self.resolve(dst)?;
				let guard = self.begin().await?;
				let item = self.copy_any(&guard, &src, &dst, false).await?;
				Ok::<_, DiskError>((item, dst))
			}
			.await;
			match result {
				Ok((item, dst)) => {
					self.emit(item);
					copied.push(dst);
					report.succeeded.push(src.clone());
				}
				Err(error) => {
					tracing::debug!(disk = %self.guid, src = %src, error = %error, "copy failed");
					report.failures.push(BatchFailure {
						path: src.clone(),
						error,
					});
				}
			}
		}

		if cancelled {
			tracing::info!(disk = %self.guid, completed = report.succeeded.len(), "copy cancelled");
			return Err(DiskError::Cancelled {
				completed: report.succeeded,
			});
		}
		if report.is_empty() {
			Ok(copied)
		} else {
			Err(DiskError::Batch(report))
		}
	}

	// -- Deletes ----------------------------------------------------------

	/// Move `path` to the trash, or delete it when `permanent` is set or it
	/// already lives in the trash. Returns the trash location when moved.
	pub async fn remove(&self, path: &str, opts: RemoveOptions) -> Result<Option<AbsPath>, DiskError> {
		let path = self.resolve(path)?;
		let (changes, trashed) = self.remove_one(&path, opts).await?;
		self.emit(changes);
		Ok(trashed)
	}

	pub async fn remove_single(&self, path: &str) -> Result<Option<AbsPath>, DiskError> {
		self.remove(path, RemoveOptions::default()).await
	}

	/// Remove several paths. Paths covered by another path in the set are
	/// folded into it. Best effort, like `copy_multiple_files`.
	pub async fn remove_multiple(&self, paths: &[String], opts: RemoveOptions) -> Result<(), DiskError> {
		let mut report = BatchError::default();
		let mut resolved = Vec::new();
		for raw in paths {
			match self.resolve(raw) {
				Ok(p) => resolved.push(p),
				Err(error) => report.failures.push(BatchFailure {
					path: raw.clone(),
					error,
				}),
			}
		}
		for path in reduce_paths(&resolved) {
			match self.remove_one(&path, opts).await {
				Ok((item, _)) => {
					self.emit(item);
					report.succeeded.push(path.to_string());
				}
				Err(error) => report.failures.push(BatchFailure {
					path: path.to_string(),
					error,
				}),
			}
		}
		if report.is_empty() {
			Ok(())
		} else {
			Err(DiskError::Batch(report))
		}
	}

	/// Restore a trashed path to its original location (or a numbered
	/// sibling if that is taken). Returns where it was restored.
	pub async fn untrash_single(&self, path: &str) -> Result<AbsPath, DiskError> {
		let path = self.resolve(path)?;
		let original = untrash_path_for(&path).ok_or_else(|| {
			DiskError::InvalidOperation(format!("{} is not inside the trash", path))
		})?;
		let (changes, target) = {
			let guard = self.begin().await?;
			let target = self.unique_path(&guard, original).await?;
			self.move_inner(&guard, &path, &target, false).await?;
			let created = self
				.tree_read()
				.walk(&target)
				.into_iter()
				.map(|(p, _)| p)
				.collect();
			(Changes::created(created), target)
		};
		self.emit(changes);
		Ok(target)
	}

	/// Permanently delete everything in the trash. Returns the removed
	/// paths.
	pub async fn empty_trash(&self) -> Result<Vec<AbsPath>, DiskError> {
		let trash = SpecialDir::Trash.path();
		let deleted = {
			let guard = self.begin().await?;
			if !guard.exists(&trash).await? {
				return Ok(Vec::new());
			}
			self.remove_inner(&guard, &trash).await?
		};
		self.emit(Changes {
			deleted: deleted.clone(),
			..Changes::default()
		});
		Ok(deleted)
	}

	// -- Events -----------------------------------------------------------

	pub fn on_event<F>(&self, listener: F) -> Unsubscribe
	where
		F: Fn(&DiskEvent) + Send + Sync + 'static,
	{
		self.events.subscribe(None, listener)
	}

	pub fn on_create<F>(&self, listener: F) -> Unsubscribe
	where
		F: Fn(&DiskEvent) + Send + Sync + 'static,
	{
		self.events.subscribe(Some(EventKind::Create), listener)
	}

	pub fn on_delete<F>(&self, listener: F) -> Unsubscribe
	where
		F: Fn(&DiskEvent) + Send + Sync + 'static,
	{
		self.events.subscribe(Some(EventKind::Delete), listener)
	}

	pub fn on_rename<F>(&self, listener: F) -> Unsubscribe
	where
		F: Fn(&DiskEvent) + Send + Sync + 'static,
	{
		self.events.subscribe(Some(EventKind::Rename), listener)
	}

	// -- Snapshots --------------------------------------------------------

	/// Persistable record. The index is included only when it is trusted.
	pub fn to_snapshot(&self) -> DiskSnapshot {
		DiskSnapshot {
			guid: self.guid.clone(),
			disk_type: self.disk_type,
			index_cache: self
				.is_hydrated()
				.then(|| self.tree_read().to_snapshot()),
		}
	}

	pub fn to_json(&self) -> Result<serde_json::Value, DiskError> {
		Ok(serde_json::to_value(self.to_snapshot())?)
	}
}

impl std::fmt::Debug for Disk {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Disk")
			.field("guid", &self.guid)
			.field("type", &self.disk_type)
			.field("state", &self.state())
			.field("hydrated", &self.is_hydrated())
			.finish()
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
