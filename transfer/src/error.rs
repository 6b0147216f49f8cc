//! Error and control-flow sentinel types shared across the engine.

/// A filesystem or logical failure raised while transferring a single item.
///
/// Every variant carries the path that failed so the host can render an
/// actionable dialog (and relocate the cursor there on `navigate`).
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("{context} {path:?}: {source}")]
    Io {
        context: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Source and destination resolve to the same file. Reported rather than
    /// silently ignored since it usually indicates a user mistake.
    #[error("source and destination are the same file: {path:?}")]
    SelfCopy { path: std::path::PathBuf },
    /// The destination lies inside the source directory; copying would not
    /// terminate and would double-count content.
    #[error("cannot copy directory {src:?} into itself ({dst:?})")]
    DirectoryIntoItself {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },
}

impl TransferError {
    #[must_use]
    pub fn io(context: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        TransferError::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    /// The path the failure should be attributed to in the UI.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            TransferError::Io { path, .. } | TransferError::SelfCopy { path } => path,
            TransferError::DirectoryIntoItself { src, .. } => src,
        }
    }

    /// Short human-readable classification for dialog titles, e.g.
    /// "permission denied" or "not found".
    #[must_use]
    pub fn classification(&self) -> &'static str {
        match self {
            TransferError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => "not found",
                std::io::ErrorKind::PermissionDenied => "permission denied",
                std::io::ErrorKind::AlreadyExists => "already exists",
                std::io::ErrorKind::StorageFull => "no space left on device",
                _ => "I/O error",
            },
            TransferError::SelfCopy { .. } => "source and destination are the same",
            TransferError::DirectoryIntoItself { .. } => "destination is inside the source",
        }
    }
}

/// Sentinel that unwinds the whole transfer back to the controller.
///
/// Distinct from [`TransferError`]: raising it is not a failure report, it is
/// the cooperative-cancellation signal checked at every suspension point. Once
/// raised, no further callbacks are invoked and no further mutation is
/// attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    #[error("transfer cancelled")]
    Cancelled,
    /// Abort and relocate the UI cursor to the carried path.
    #[error("transfer aborted, navigating to {0:?}")]
    Navigate(std::path::PathBuf),
}

/// Host decision after a failed filesystem operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Loop back to the failing step.
    Retry,
    /// Abandon the current item only.
    Skip,
    /// Abort the whole transfer.
    Cancel,
    /// Abort the whole transfer and move the cursor to the carried path.
    Navigate(std::path::PathBuf),
}

/// Pause/resume gate decision, surfaced from the host on every progress
/// callback during a streaming copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Resume in place.
    Continue,
    /// Restart the current file from scratch.
    Retry,
    /// Abandon the current file.
    Skip,
    /// Abort and relocate the UI cursor.
    Navigate(std::path::PathBuf),
    /// Abort the whole transfer.
    Cancel,
}
