// ---------------------------------------------------------------------------
// Directory-tree index mirrored from the backing store
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TreeError;
use crate::glob::{matches_any, partition_patterns};
use crate::path::{extension, is_special, AbsPath};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Arena index of a node. Only meaningful for the tree that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

const ROOT_ID: NodeId = NodeId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
	File,
	Directory,
}

impl NodeKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::File => "file",
			Self::Directory => "directory",
		}
	}
}

/// Coarse content classification, derived from the file extension once at
/// insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
	Markdown,
	Image,
	Text,
	Binary,
}

impl ContentType {
	pub fn from_path(path: &AbsPath) -> Self {
		let ext = extension(path.as_str()).to_ascii_lowercase();
		match ext.as_str() {
			".md" | ".markdown" | ".mdx" => Self::Markdown,
			".png" | ".jpg" | ".jpeg" | ".gif" | ".webp" | ".svg" | ".avif" | ".bmp" | ".ico" => {
				Self::Image
			}
			".txt" | ".json" | ".yaml" | ".yml" | ".toml" | ".css" | ".html" | ".js" | ".ts"
			| ".csv" | ".xml" | "" => Self::Text,
			_ => Self::Binary,
		}
	}
}

/// Detached view of a node, returned by lookups so callers never hold a
/// borrow of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
	pub path: AbsPath,
	pub name: String,
	pub kind: NodeKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content_type: Option<ContentType>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub children: Option<Vec<String>>,
}

impl TreeNode {
	pub fn is_file(&self) -> bool {
		self.kind == NodeKind::File
	}

	pub fn is_dir(&self) -> bool {
		self.kind == NodeKind::Directory
	}
}

/// Nested snapshot form: `{ "name": null }` is a file, `{ "name": { .. } }`
/// a directory. The root object is the children of `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeSnapshot(pub BTreeMap<String, Option<TreeSnapshot>>);

// ---------------------------------------------------------------------------
// Internal node storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Entry {
	File { content_type: ContentType },
	Directory { children: BTreeMap<String, NodeId> },
}

#[derive(Debug, Clone)]
struct Slot {
	name: String,
	parent: Option<NodeId>,
	entry: Entry,
}

impl Slot {
	fn kind(&self) -> NodeKind {
		match self.entry {
			Entry::File { .. } => NodeKind::File,
			Entry::Directory { .. } => NodeKind::Directory,
		}
	}
}

// ---------------------------------------------------------------------------
// FileTree
// ---------------------------------------------------------------------------

/// In-memory index of a disk's directory structure. Holds no file bytes.
///
/// Nodes live in an arena; parents are plain indices so moving a subtree is
/// a relink of one node, and every descendant's path follows from ancestry.
#[derive(Debug, Clone)]
pub struct FileTree {
	guid: String,
	slots: Vec<Option<Slot>>,
	free: Vec<usize>,
	len: usize,
}

impl FileTree {
	// -- Constructor ------------------------------------------------------

	pub fn new(guid: impl Into<String>) -> Self {
		Self {
			guid: guid.into(),
			slots: vec![Some(Slot {
				name: String::new(),
				parent: None,
				entry: Entry::Directory {
					children: BTreeMap::new(),
				},
			})],
			free: Vec::new(),
			len: 1,
		}
	}

	pub fn guid(&self) -> &str {
		&self.guid
	}

	/// Number of nodes, the root included.
	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 1
	}

	pub fn clear(&mut self) {
		let guid = std::mem::take(&mut self.guid);
		*self = Self::new(guid);
	}

	// -- Arena helpers (private) ------------------------------------------

	fn slot(&self, id: NodeId) -> Option<&Slot> {
		self.slots.get(id.0).and_then(|s| s.as_ref())
	}

	fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot> {
		self.slots.get_mut(id.0).and_then(|s| s.as_mut())
	}

	fn alloc(&mut self, slot: Slot) -> NodeId {
		self.len += 1;
		match self.free.pop() {
			Some(idx) => {
				self.slots[idx] = Some(slot);
				NodeId(idx)
			}
			None => {
				self.slots.push(Some(slot));
				NodeId(self.slots.len() - 1)
			}
		}
	}

	fn release(&mut self, id: NodeId) {
		if let Some(slot) = self.slots.get_mut(id.0) {
			if slot.take().is_some() {
				self.len -= 1;
				self.free.push(id.0);
			}
		}
	}

	fn children_of(&self, id: NodeId) -> Option<&BTreeMap<String, NodeId>> {
		match &self.slot(id)?.entry {
			Entry::Directory { children } => Some(children),
			Entry::File { .. } => None,
		}
	}

	fn children_of_mut(&mut self, id: NodeId) -> Option<&mut BTreeMap<String, NodeId>> {
		match &mut self.slot_mut(id)?.entry {
			Entry::Directory { children } => Some(children),
			Entry::File { .. } => None,
		}
	}

	fn lookup(&self, path: &AbsPath) -> Option<NodeId> {
		let mut cur = ROOT_ID;
		for seg in path.segments() {
			cur = *self.children_of(cur)?.get(seg)?;
		}
		Some(cur)
	}

	fn path_of(&self, id: NodeId) -> AbsPath {
		let mut names = Vec::new();
		let mut cur = Some(id);
		while let Some(node) = cur.and_then(|c| self.slot(c)) {
			if node.parent.is_some() {
				names.push(node.name.as_str());
			}
			cur = node.parent;
		}
		names.reverse();
		let mut path = AbsPath::root();
		for name in names {
			// Names were validated on the way in.
			path = match path.child(name) {
				Ok(p) => p,
				Err(_) => break,
			};
		}
		path
	}

	fn view(&self, id: NodeId) -> Option<TreeNode> {
		let slot = self.slot(id)?;
		let (content_type, children) = match &slot.entry {
			Entry::File { content_type } => (Some(*content_type), None),
			Entry::Directory { children } => (None, Some(children.keys().cloned().collect())),
		};
		Some(TreeNode {
			path: self.path_of(id),
			name: slot.name.clone(),
			kind: slot.kind(),
			content_type,
			children,
		})
	}

	/// Pre-order ids of `id`'s subtree, `id` first.
	fn subtree(&self, id: NodeId) -> Vec<NodeId> {
		let mut out = Vec::new();
		let mut stack = vec![id];
		while let Some(cur) = stack.pop() {
			out.push(cur);
			if let Some(children) = self.children_of(cur) {
				stack.extend(children.values().rev().copied());
			}
		}
		out
	}

	fn attach(&mut self, parent: NodeId, name: &str, entry: Entry) -> NodeId {
		let id = self.alloc(Slot {
			name: name.to_string(),
			parent: Some(parent),
			entry,
		});
		if let Some(children) = self.children_of_mut(parent) {
			children.insert(name.to_string(), id);
		}
		id
	}

	fn detach(&mut self, id: NodeId) {
		let (parent, name) = match self.slot(id) {
			Some(slot) => (slot.parent, slot.name.clone()),
			None => return,
		};
		if let Some(children) = parent.and_then(|p| self.children_of_mut(p)) {
			children.remove(&name);
		}
	}

	/// Fail if any existing proper ancestor of `path` is a file.
	fn check_ancestors(&self, path: &AbsPath) -> Result<(), TreeError> {
		let mut cur = ROOT_ID;
		for ancestor in path.ancestors().iter().skip(1) {
			let Some(children) = self.children_of(cur) else {
				return Err(TreeError::AlreadyExists(self.path_of(cur).to_string()));
			};
			match children.get(ancestor.name()) {
				Some(next) => cur = *next,
				None => return Ok(()),
			}
		}
		match self.children_of(cur) {
			Some(_) => Ok(()),
			None => Err(TreeError::AlreadyExists(self.path_of(cur).to_string())),
		}
	}

	/// Create missing directories along `path`'s ancestry and return the
	/// parent id plus the directories that were created.
	fn ensure_parents(&mut self, path: &AbsPath) -> Result<(NodeId, Vec<AbsPath>), TreeError> {
		self.check_ancestors(path)?;
		let mut created = Vec::new();
		let mut cur = ROOT_ID;
		for ancestor in path.ancestors().iter().skip(1) {
			let existing = self
				.children_of(cur)
				.and_then(|c| c.get(ancestor.name()).copied());
			cur = match existing {
				Some(id) => id,
				None => {
					created.push(ancestor.clone());
					self.attach(
						cur,
						ancestor.name(),
						Entry::Directory {
							children: BTreeMap::new(),
						},
					)
				}
			};
		}
		Ok((cur, created))
	}

	// -- Lookups ----------------------------------------------------------

	pub fn node_from_path(&self, path: &AbsPath) -> Option<TreeNode> {
		self.lookup(path).and_then(|id| self.view(id))
	}

	pub fn contains(&self, path: &AbsPath) -> bool {
		self.lookup(path).is_some()
	}

	pub fn kind_of(&self, path: &AbsPath) -> Option<NodeKind> {
		self.lookup(path).and_then(|id| self.slot(id)).map(Slot::kind)
	}

	/// Direct children of a directory, sorted by name.
	pub fn children(&self, path: &AbsPath) -> Option<Vec<(String, NodeKind)>> {
		let children = self.children_of(self.lookup(path)?)?;
		Some(
			children
				.iter()
				.filter_map(|(name, id)| self.slot(*id).map(|s| (name.clone(), s.kind())))
				.collect(),
		)
	}

	/// Every node under `path` (inclusive) in pre-order.
	pub fn walk(&self, path: &AbsPath) -> Vec<(AbsPath, NodeKind)> {
		let Some(start) = self.lookup(path) else {
			return Vec::new();
		};
		self.subtree(start)
			.into_iter()
			.filter_map(|id| self.slot(id).map(|s| (self.path_of(id), s.kind())))
			.collect()
	}

	/// All paths in the tree except the root, pre-order.
	pub fn all_paths(&self) -> Vec<AbsPath> {
		self.walk(&AbsPath::root())
			.into_iter()
			.skip(1)
			.map(|(p, _)| p)
			.collect()
	}

	pub fn is_descendant(&self, path: &AbsPath, ancestor: &AbsPath) -> bool {
		ancestor.is_ancestor_of(path) && self.contains(path)
	}

	/// Files outside the special directories, optionally restricted to
	/// `under`.
	pub fn files(&self, under: &AbsPath, include_special: bool) -> Vec<AbsPath> {
		self.walk(under)
			.into_iter()
			.filter(|(p, kind)| *kind == NodeKind::File && (include_special || !is_special(p)))
			.map(|(p, _)| p)
			.collect()
	}

	/// Files matching `patterns` (`!` negates), special directories excluded.
	pub fn glob(&self, patterns: &[String]) -> Vec<AbsPath> {
		let (positive, negative) = partition_patterns(patterns);
		self.files(&AbsPath::root(), false)
			.into_iter()
			.filter(|p| matches_any(p, &positive, &negative))
			.collect()
	}

	/// Case-insensitive substring match on node names, files and directories
	/// alike, special directories excluded.
	pub fn find(&self, query: &str) -> Vec<TreeNode> {
		let needle = query.to_lowercase();
		self.subtree(ROOT_ID)
			.into_iter()
			.skip(1)
			.filter_map(|id| {
				let slot = self.slot(id)?;
				if !slot.name.to_lowercase().contains(&needle) {
					return None;
				}
				let node = self.view(id)?;
				(!is_special(&node.path)).then_some(node)
			})
			.collect()
	}

	// -- Mutations --------------------------------------------------------

	/// Insert a node, creating missing intermediate directories. Returns
	/// every path that was created, intermediates first.
	pub fn insert(&mut self, path: &AbsPath, kind: NodeKind) -> Result<Vec<AbsPath>, TreeError> {
		if path.is_root() {
			return Ok(Vec::new());
		}
		if let Some(existing) = self.kind_of(path) {
			if existing == kind {
				return Ok(Vec::new());
			}
			return Err(TreeError::AlreadyExists(path.to_string()));
		}
		let (parent, mut created) = self.ensure_parents(path)?;
		let entry = match kind {
			NodeKind::File => Entry::File {
				content_type: ContentType::from_path(path),
			},
			NodeKind::Directory => Entry::Directory {
				children: BTreeMap::new(),
			},
		};
		self.attach(parent, path.name(), entry);
		created.push(path.clone());
		Ok(created)
	}

	/// Remove a node. Returns the removed paths in pre-order.
	pub fn remove(&mut self, path: &AbsPath, recursive: bool) -> Result<Vec<AbsPath>, TreeError> {
		if path.is_root() {
			return Err(TreeError::Invalid("cannot remove the root".to_string()));
		}
		let id = self
			.lookup(path)
			.ok_or_else(|| TreeError::NotFound(path.to_string()))?;
		if !recursive && self.children_of(id).is_some_and(|c| !c.is_empty()) {
			return Err(TreeError::DirectoryNotEmpty(path.to_string()));
		}
		let doomed = self.subtree(id);
		let removed = doomed.iter().map(|id| self.path_of(*id)).collect();
		self.detach(id);
		for id in doomed {
			self.release(id);
		}
		Ok(removed)
	}

	/// Move `old` (and its subtree) to `new`. With `overwrite`, an existing
	/// destination subtree is replaced and its paths are returned. The tree
	/// is unchanged when an error is returned.
	pub fn move_node(
		&mut self,
		old: &AbsPath,
		new: &AbsPath,
		overwrite: bool,
	) -> Result<Vec<AbsPath>, TreeError> {
		if old.is_root() || new.is_root() {
			return Err(TreeError::Invalid("cannot move the root".to_string()));
		}
		let id = self
			.lookup(old)
			.ok_or_else(|| TreeError::NotFound(old.to_string()))?;
		if old == new {
			return Ok(Vec::new());
		}
		if old.is_ancestor_of(new) {
			return Err(TreeError::Invalid(format!(
				"cannot move {} into its own subtree {}",
				old, new
			)));
		}
		let mut replaced = Vec::new();
		if self.contains(new) {
			if !overwrite {
				return Err(TreeError::DestinationExists(new.to_string()));
			}
			if new.is_ancestor_of(old) {
				return Err(TreeError::Invalid(format!(
					"cannot replace {} with its own descendant {}",
					new, old
				)));
			}
		}
		self.check_ancestors(new)?;

		if self.contains(new) {
			replaced = self.remove(new, true)?;
		}
		let (parent, _) = self.ensure_parents(new)?;
		self.detach(id);
		let name = new.name().to_string();
		if let Some(slot) = self.slot_mut(id) {
			slot.name = name.clone();
			slot.parent = Some(parent);
			if let Entry::File { content_type } = &mut slot.entry {
				*content_type = ContentType::from_path(new);
			}
		}
		if let Some(children) = self.children_of_mut(parent) {
			children.insert(name, id);
		}
		Ok(replaced)
	}

	// -- Snapshots --------------------------------------------------------

	pub fn to_snapshot(&self) -> TreeSnapshot {
		self.snapshot_of(ROOT_ID)
	}

	fn snapshot_of(&self, id: NodeId) -> TreeSnapshot {
		let mut out = BTreeMap::new();
		if let Some(children) = self.children_of(id) {
			for (name, child) in children {
				let value = match self.children_of(*child) {
					Some(_) => Some(self.snapshot_of(*child)),
					None => None,
				};
				out.insert(name.clone(), value);
			}
		}
		TreeSnapshot(out)
	}

	pub fn from_snapshot(guid: impl Into<String>, snapshot: &TreeSnapshot) -> Result<Self, TreeError> {
		let mut tree = Self::new(guid);
		let mut stack = vec![(AbsPath::root(), snapshot)];
		while let Some((dir, snap)) = stack.pop() {
			for (name, value) in &snap.0 {
				let path = dir
					.child(name)
					.map_err(|e| TreeError::InvalidSnapshot(e.to_string()))?;
				match value {
					None => {
						tree.insert(&path, NodeKind::File)?;
					}
					Some(sub) => {
						tree.insert(&path, NodeKind::Directory)?;
						stack.push((path, sub));
					}
				}
			}
		}
		Ok(tree)
	}

	pub fn to_json(&self) -> serde_json::Value {
		serde_json::to_value(self.to_snapshot()).unwrap_or(serde_json::Value::Null)
	}

	pub fn from_json(guid: impl Into<String>, json: &serde_json::Value) -> Result<Self, TreeError> {
		let snapshot: TreeSnapshot = serde_json::from_value(json.clone())
			.map_err(|e| TreeError::InvalidSnapshot(e.to_string()))?;
		Self::from_snapshot(guid, &snapshot)
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
