//! Cached metadata for a single observed path.
//!
//! An [`Entry`] is created by the loader on first observation, refreshed by
//! the dispatcher on modify events, and dropped when its path disappears or
//! is unloaded. Metadata refreshes take a per-entry lock so readers of other
//! entries are never blocked by one entry's update.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use bitflags::bitflags;

use crate::platform::WatchHandle;
use crate::types::FileType;

bitflags! {
    /// Bookkeeping bits attached to every cached entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct EntryFlags: u8 {
        /// The filter rejected this entry. It stays in the index to suppress
        /// re-notification but is hidden from external queries.
        const IGNORED = 1 << 0;
        /// The path was named directly in a `load` call.
        const EXPLICIT = 1 << 1;
        /// The load covering this entry was recursive.
        const RECURSE = 1 << 2;
    }
}

/// Snapshot of the metadata the watcher caches per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Metadata {
    pub(crate) fn from_fs(meta: &fs::Metadata) -> Self {
        Self {
            file_type: meta.file_type().into(),
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

/// One observed path: its cached metadata and, when the backend holds a live
/// kernel subscription for it, the watch handle.
#[derive(Debug)]
pub struct Entry {
    path: PathBuf,
    meta: RwLock<Metadata>,
    flags: Mutex<EntryFlags>,
    watch: Mutex<Option<WatchHandle>>,
}

/// Shared handle to an entry. Entries handed to callbacks and returned from
/// queries stay valid after eviction from the index.
pub type EntryRef = Arc<Entry>;

impl Entry {
    pub(crate) fn new(path: PathBuf, meta: &fs::Metadata) -> EntryRef {
        Arc::new(Self {
            path,
            meta: RwLock::new(Metadata::from_fs(meta)),
            flags: Mutex::new(EntryFlags::empty()),
            watch: Mutex::new(None),
        })
    }

    /// Absolute, lexically cleaned path of the entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, or the whole path for a filesystem root.
    pub fn name(&self) -> &OsStr {
        self.path.file_name().unwrap_or_else(|| self.path.as_os_str())
    }

    /// Cached metadata snapshot.
    pub fn metadata(&self) -> Metadata {
        *self.meta.read().expect("entry metadata lock poisoned")
    }

    pub fn file_type(&self) -> FileType {
        self.metadata().file_type
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// Last observed size in bytes.
    pub fn len(&self) -> u64 {
        self.metadata().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last observed modification time.
    pub fn modified(&self) -> Option<SystemTime> {
        self.metadata().modified
    }

    /// Whether the filter rejected this entry.
    pub fn is_ignored(&self) -> bool {
        self.flags().contains(EntryFlags::IGNORED)
    }

    /// Atomically replaces the cached metadata from a fresh lstat.
    pub(crate) fn update(&self, meta: &fs::Metadata) {
        *self.meta.write().expect("entry metadata lock poisoned") = Metadata::from_fs(meta);
    }

    pub(crate) fn flags(&self) -> EntryFlags {
        *self.flags.lock().expect("entry flags lock poisoned")
    }

    /// ORs `flags` into the entry. Duplicate loads merge their flags into
    /// the surviving entry this way.
    pub(crate) fn merge_flags(&self, flags: EntryFlags) {
        *self.flags.lock().expect("entry flags lock poisoned") |= flags;
    }

    pub(crate) fn set_watch(&self, handle: WatchHandle) {
        *self.watch.lock().expect("entry watch lock poisoned") = Some(handle);
    }

    /// Takes the watch handle out of the entry, leaving it unwatched.
    /// The handle is owned by exactly one entry, so whoever takes it is
    /// responsible for releasing the kernel subscription exactly once.
    pub(crate) fn take_watch(&self) -> Option<WatchHandle> {
        self.watch.lock().expect("entry watch lock poisoned").take()
    }

    pub(crate) fn has_watch(&self) -> bool {
        self.watch.lock().expect("entry watch lock poisoned").is_some()
    }
}
