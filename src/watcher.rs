//! Public watcher surface.
//!
//! A [`Watcher`] owns one background dispatcher that translates kernel
//! notifications into Create/Modify/Delete events against an in-memory path
//! index. Reads (`get`, `lstat`, `traverse`, `walk`) are answered from the
//! cache under a shared lock and never touch the kernel.

use std::path::Path;

use crate::callbacks::Callbacks;
use crate::entry::EntryRef;
use crate::error::{Result, WatchError};
use crate::index::clean_path;
use crate::platform::Driver;
use crate::types::{FlowControl, RecursiveMode, WatcherConfig};

pub(crate) mod inner;

/// Caches file metadata for loaded roots and watches them for changes.
///
/// ```ignore
/// use fswatch::{Callbacks, Event, RecursiveMode, Watcher};
///
/// let callbacks = Callbacks::new()
///     .on_event(|event, entry| println!("{event} {}", entry.path().display()));
/// let watcher = Watcher::new(callbacks)?;
/// watcher.load("/srv/projects", RecursiveMode::Recursive)?;
/// // ... mutations under /srv/projects now surface through the sink ...
/// watcher.close()?;
/// # Ok::<(), fswatch::WatchError>(())
/// ```
///
/// Callbacks run on the dispatcher thread and must not call back into the
/// watcher; see [`Callbacks`]. Events for a given path arrive in kernel
/// order; no ordering holds across unrelated paths beyond what the platform
/// provides (macOS in particular reports renames as Create/Delete in either
/// order).
pub struct Watcher {
    driver: Driver,
}

impl Watcher {
    /// Creates a watcher with default tunables. Allocates the kernel
    /// notification source and starts the dispatcher.
    pub fn new(callbacks: Callbacks) -> Result<Self> {
        Self::with_config(callbacks, WatcherConfig::default())
    }

    pub fn with_config(callbacks: Callbacks, config: WatcherConfig) -> Result<Self> {
        Ok(Self {
            driver: Driver::new(callbacks, config)?,
        })
    }

    /// Starts watching the directory at `path`, and with
    /// [`RecursiveMode::Recursive`] all descendant directories. The path is
    /// absolutized and lexically cleaned first.
    ///
    /// Loading under an already-watched ancestor neither duplicates cached
    /// entries nor re-emits events for them. A non-recursive load still
    /// watches the directories at the first level of `path`, so their own
    /// first-level mutations are observed; deeper ones are not.
    pub fn load(&self, path: impl AsRef<Path>, mode: RecursiveMode) -> Result<()> {
        let path = clean_path(path.as_ref());
        self.driver.load(&path, mode.is_recursive())
    }

    /// Stops watching `path` and forgets its cached subtree. With
    /// [`RecursiveMode::NonRecursive`], descendants that were loaded
    /// explicitly are re-loaded so they keep working on their own.
    pub fn unload(&self, path: impl AsRef<Path>, mode: RecursiveMode) -> Result<()> {
        let path = clean_path(path.as_ref());
        self.driver.unload(&path, mode.is_recursive())
    }

    /// Returns the cached entry at `path`, or `None` when the path is
    /// unknown or was rejected by the filter.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<EntryRef> {
        let path = clean_path(path.as_ref());
        self.driver.shared().get(&path)
    }

    /// Like [`std::fs::symlink_metadata`] but answered purely from the
    /// cache: returns the entry or a not-found error, never touching disk.
    pub fn lstat(&self, path: impl AsRef<Path>) -> Result<EntryRef> {
        let path = clean_path(path.as_ref());
        self.driver
            .shared()
            .get(&path)
            .ok_or_else(|| WatchError::not_found(&path))
    }

    /// Visits the cached entry at `root` and every non-ignored descendant
    /// in filesystem-walk order. The visitor may prune a directory with
    /// [`FlowControl::SkipDir`]. Fails with a not-found error when `root`
    /// is absent or filtered.
    ///
    /// The shared lock is held for the whole traversal: the visitor must
    /// not invoke watcher operations that write, or it will deadlock.
    pub fn traverse(
        &self,
        root: impl AsRef<Path>,
        visitor: impl FnMut(&EntryRef) -> FlowControl,
    ) -> Result<()> {
        let root = clean_path(root.as_ref());
        self.driver.shared().traverse(&root, visitor)
    }

    /// Filesystem-walk flavored traversal: the visitor receives each path
    /// with its entry. When `root` itself is not cached, the visitor is
    /// invoked exactly once with `root` and the not-found error instead.
    pub fn walk(
        &self,
        root: impl AsRef<Path>,
        mut visitor: impl FnMut(&Path, std::result::Result<&EntryRef, &WatchError>) -> FlowControl,
    ) -> Result<()> {
        let root = clean_path(root.as_ref());
        let mut visited = false;
        let outcome = self.driver.shared().traverse(&root, |entry| {
            visited = true;
            visitor(entry.path(), Ok(entry))
        });
        match outcome {
            Err(err) if !visited => {
                visitor(&root, Err(&err));
                Ok(())
            }
            other => other,
        }
    }

    /// Shuts the watcher down: releases every kernel subscription and stops
    /// the dispatcher without waiting for in-flight events. The first call
    /// succeeds; every later call (and any later load/unload) fails with
    /// [`WatchError::Closed`].
    pub fn close(&self) -> Result<()> {
        self.driver.close()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let _ = self.driver.close();
    }
}
