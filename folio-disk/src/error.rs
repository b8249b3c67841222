use thiserror::Error;

// ── Path errors ─────────────────────────────────────────────────────────────

/// Malformed path input. Raised before any storage is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Path is empty")]
    Empty,
    #[error("Path must be absolute: {0}")]
    NotAbsolute(String),
    #[error("Invalid path segment in {path}: {reason}")]
    InvalidSegment { path: String, reason: String },
    #[error("Path exceeds limit: {0}")]
    LimitExceeded(String),
    #[error("Invalid percent-encoding: {0}")]
    InvalidEncoding(String),
}

// ── Storage errors ──────────────────────────────────────────────────────────

/// Errors produced at the storage adapter boundary. Every backend maps its
/// native failures onto these kinds so the layers above never inspect
/// backend-specific shapes.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No such file or directory: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Destination already exists: {0}")]
    DestinationExists(String),
    #[error("Parent directory does not exist: {0}")]
    ParentMissing(String),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Is a directory: {0}")]
    IsADirectory(String),
    #[error("Directory is not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
    #[error("Storage corrupt: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Map an I/O error raised while operating on `path` onto the storage
    /// taxonomy.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(path.to_string()),
            ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            ErrorKind::NotADirectory => Self::NotADirectory(path.to_string()),
            ErrorKind::IsADirectory => Self::IsADirectory(path.to_string()),
            ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty(path.to_string()),
            _ => Self::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// ── Tree errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("Not found in index: {0}")]
    NotFound(String),
    #[error("Conflicting entry in index: {0}")]
    AlreadyExists(String),
    #[error("Destination already exists in index: {0}")]
    DestinationExists(String),
    #[error("Directory is not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("Invalid index operation: {0}")]
    Invalid(String),
    #[error("Invalid tree snapshot: {0}")]
    InvalidSnapshot(String),
}

// ── Batch errors ────────────────────────────────────────────────────────────

/// A single failed item of a batch operation.
#[derive(Debug)]
pub struct BatchFailure {
    pub path: String,
    pub error: DiskError,
}

/// Aggregate failure of a best-effort batch. Items listed in `succeeded`
/// were applied to both the backend and the index and stay applied.
#[derive(Debug, Default)]
pub struct BatchError {
    pub failures: Vec<BatchFailure>,
    pub succeeded: Vec<String>,
}

impl BatchError {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_paths(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.path.as_str()).collect()
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} operations failed",
            self.failures.len(),
            self.failures.len() + self.succeeded.len()
        )?;
        if let Some(first) = self.failures.first() {
            write!(f, " (first: {}: {})", first.path, first.error)?;
        }
        Ok(())
    }
}

// ── Disk errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DiskError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Destination already exists: {0}")]
    DestinationExists(String),
    #[error("Directory is not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Batch failed: {0}")]
    Batch(BatchError),
    #[error("Cancelled after {} completed operations", completed.len())]
    Cancelled { completed: Vec<String> },
    #[error("invalid disk type: {0}")]
    InvalidDiskType(String),
    #[error("Disk is not ready: {0}")]
    NotReady(String),
    #[error("Disk is unavailable: no backend is selected")]
    Unavailable,
    #[error("Disk has been torn down: {0}")]
    TornDown(String),
    #[error("Storage error: {0}")]
    Storage(StorageError),
    #[error("Index error: {0}")]
    Index(TreeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StorageError> for DiskError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(p) => Self::NotFound(p),
            StorageError::AlreadyExists(p) => Self::AlreadyExists(p),
            StorageError::DestinationExists(p) => Self::DestinationExists(p),
            StorageError::DirectoryNotEmpty(p) => Self::DirectoryNotEmpty(p),
            StorageError::Unsupported { operation, backend } => {
                Self::Unsupported(format!("{} on {} backend", operation, backend))
            }
            other => Self::Storage(other),
        }
    }
}

impl From<TreeError> for DiskError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::NotFound(p) => Self::NotFound(p),
            TreeError::AlreadyExists(p) => Self::AlreadyExists(p),
            TreeError::DestinationExists(p) => Self::DestinationExists(p),
            TreeError::DirectoryNotEmpty(p) => Self::DirectoryNotEmpty(p),
            other => Self::Index(other),
        }
    }
}

impl DiskError {
    pub fn code(&self) -> &str {
        match self {
            Self::Path(_) => "FOLIO_INVALID_PATH",
            Self::NotFound(_) => "FOLIO_NOT_FOUND",
            Self::AlreadyExists(_) => "FOLIO_ALREADY_EXISTS",
            Self::DestinationExists(_) => "FOLIO_DESTINATION_EXISTS",
            Self::DirectoryNotEmpty(_) => "FOLIO_NOT_EMPTY",
            Self::Unsupported(_) => "FOLIO_UNSUPPORTED",
            Self::InvalidOperation(_) => "FOLIO_INVALID_OPERATION",
            Self::Batch(_) => "FOLIO_BATCH_FAILED",
            Self::Cancelled { .. } => "FOLIO_CANCELLED",
            Self::InvalidDiskType(_) => "FOLIO_INVALID_DISK_TYPE",
            Self::NotReady(_) => "FOLIO_NOT_READY",
            Self::Unavailable => "FOLIO_UNAVAILABLE",
            Self::TornDown(_) => "FOLIO_TORN_DOWN",
            Self::Storage(_) => "FOLIO_STORAGE_ERROR",
            Self::Index(_) => "FOLIO_INDEX_ERROR",
            Self::Json(_) => "FOLIO_JSON_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn to_json_rpc_error(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "diskCode": self.code(),
            "message": self.to_string(),
        });
        if let Self::Batch(batch) = self {
            body["failed"] = serde_json::json!(batch.failed_paths());
            body["succeeded"] = serde_json::json!(batch.succeeded);
        }
        if let Self::Cancelled { completed } = self {
            body["completed"] = serde_json::json!(completed);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_maps_to_disk_not_found() {
        let err: DiskError = StorageError::NotFound("/a".into()).into();
        assert!(err.is_not_found());
        assert_eq!(err.code(), "FOLIO_NOT_FOUND");
    }

    #[test]
    fn unsupported_keeps_operation_name() {
        let err: DiskError = StorageError::Unsupported {
            operation: "symlink",
            backend: "directory",
        }
        .into();
        assert!(matches!(err, DiskError::Unsupported(ref m) if m.contains("symlink")));
    }

    #[test]
    fn io_errors_are_classified() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(StorageError::from_io(io, "/x").is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(StorageError::from_io(io, "/x"), StorageError::Io(_)));
    }

    #[test]
    fn batch_error_reports_failed_items() {
        let batch = BatchError {
            failures: vec![BatchFailure {
                path: "/b".into(),
                error: DiskError::NotFound("/b".into()),
            }],
            succeeded: vec!["/a".into()],
        };
        assert_eq!(batch.failed_paths(), vec!["/b"]);
        let err = DiskError::Batch(batch);
        let json = err.to_json_rpc_error();
        assert_eq!(json["diskCode"], "FOLIO_BATCH_FAILED");
        assert_eq!(json["succeeded"][0], "/a");
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn invalid_disk_type_message() {
        let err = DiskError::InvalidDiskType("bogus".into());
        assert_eq!(err.to_string(), "invalid disk type: bogus");
    }
}
