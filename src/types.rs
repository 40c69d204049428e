//! Shared value types for the watcher API.

use std::fmt;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A change notification delivered to the event sink.
///
/// The set is closed: renames surface as Delete/Create pairs in the order
/// the platform reports them, and metadata-only changes surface as Modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Create,
    Modify,
    Delete,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Other,
}

impl From<fs::FileType> for FileType {
    fn from(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            Self::Directory
        } else if ft.is_file() {
            Self::File
        } else if ft.is_symlink() {
            Self::Symlink
        } else {
            Self::Other
        }
    }
}

/// Result of a traversal visitor: keep going, or prune the directory the
/// visitor was just shown.
///
/// Returning `SkipDir` for a non-directory entry is harmless; there is
/// nothing underneath to prune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    Continue,
    SkipDir,
}

/// Whether a load covers the whole subtree or only the named directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursiveMode {
    Recursive,
    NonRecursive,
}

impl RecursiveMode {
    pub fn is_recursive(self) -> bool {
        matches!(self, Self::Recursive)
    }
}

/// Tunables for the background dispatcher.
///
/// The defaults match the reference timings; most callers never touch this.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// How long the kqueue dispatcher sleeps in `kevent` before re-checking
    /// for teardown. Only meaningful on BSD/macOS.
    pub poll_interval: Duration,
    /// Size of the buffer inotify events are read into. Only meaningful on
    /// Linux.
    pub event_buffer_size: usize,
    /// How long the Windows dispatcher lets a burst of directory-change
    /// records sit in the coalescing queue before flushing it.
    pub coalesce_window: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            event_buffer_size: 64 * 1024,
            coalesce_window: Duration::from_millis(10),
        }
    }
}
