use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watcher was already closed")]
    Closed,

    #[error("can only watch directories: {0}")]
    NotDirectory(PathBuf),

    #[error("event queue overflowed, cached state may be stale")]
    Overflow,

    #[error("short read from kernel event stream")]
    ShortRead,

    #[error("path not cached: {0}")]
    NotFound(PathBuf),

    #[error("{op} {path}: {source}")]
    Os {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl WatchError {
    /// Wraps a failed syscall with the operation name and the path it ran on.
    pub(crate) fn os(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Os {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(path: &Path) -> Self {
        Self::NotFound(path.to_path_buf())
    }

    /// True for "the path vanished" errors, which are routine during races
    /// against deletion and are swallowed rather than surfaced.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Os { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        let err = WatchError::not_found(Path::new("/tmp/gone"));
        assert!(err.is_not_found());

        let err = WatchError::os(
            "lstat",
            "/tmp/gone",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert!(err.is_not_found());

        let err = WatchError::os(
            "open",
            "/tmp/secret",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_not_found());
        assert!(!WatchError::Closed.is_not_found());
    }

    #[test]
    fn os_error_display_includes_op_and_path() {
        let err = WatchError::os(
            "inotify_add_watch",
            "/srv/data",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.contains("inotify_add_watch"));
        assert!(text.contains("/srv/data"));
    }
}
