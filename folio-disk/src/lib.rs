//! Virtual disk layer: a file tree kept over interchangeable storage
//! backends (memory, key-value, host directory, database file), with a
//! mirrored in-memory index, serialized mutations, a trash, change events and
//! JSON snapshots.

pub mod config;
pub mod disk;
pub mod error;
pub mod events;
pub mod factory;
pub mod glob;
pub mod mutex_fs;
pub mod path;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transport;
pub mod tree;

pub use config::DiskContext;
pub use disk::{Disk, DiskState, ListOptions, MoveOptions, RemoveOptions};
pub use error::{BatchError, DiskError, PathError, StorageError, TreeError};
pub use events::{DiskEvent, EventKind, Unsubscribe};
pub use factory::{DiskFactory, DiskRecord, DiskSnapshot, DiskType, FsTransform};
pub use path::AbsPath;
pub use storage::StorageBackend;
pub use tree::{FileTree, NodeKind, TreeNode, TreeSnapshot};
