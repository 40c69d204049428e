//! Platform-independent watcher core: the indexed state, the loader, and
//! the dispatcher reactions every backend feeds.
//!
//! Backends plug in through the [`Backend`] trait. The index and the
//! backend's id-to-entry bookkeeping live under one readers-writer lock;
//! read APIs hold it shared, every mutation holds it exclusive. Callbacks
//! are always invoked after the lock is released.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::callbacks::Callbacks;
use crate::entry::{Entry, EntryFlags, EntryRef};
use crate::error::{Result, WatchError};
use crate::index::PathIndex;
use crate::types::{Event, FlowControl};

/// A kernel event source: installs and releases per-entry subscriptions.
///
/// Implementations own the id-to-entry map; the entry owns the handle, the
/// map holds the non-owning back-reference, and both are maintained
/// together so the bijection between live subscriptions and watched entries
/// never breaks.
pub(crate) trait Backend: Send + Sync + 'static {
    /// Platform watch mask (inotify mask, kqueue filter flags, Windows
    /// notify filter).
    type Mask: Copy + Send;

    /// The full mask used for children and re-loads.
    fn all_mask() -> Self::Mask;

    /// Whether this entry gets its own kernel subscription. Directories
    /// only where file events arrive on the parent's stream (inotify,
    /// Windows); everything where the kernel watches individual vnodes
    /// (kqueue).
    fn should_watch(&self, entry: &Entry) -> bool;

    /// Subscribes `entry` and records the handle on it.
    fn install(&mut self, entry: &EntryRef, mask: Self::Mask) -> Result<()>;

    /// Releases `entry`'s subscription, if any.
    fn detach(&mut self, entry: &Entry) -> Result<()>;

    /// Releases every outstanding subscription, collecting per-handle
    /// release errors without aborting.
    fn detach_all(&mut self, errors: &mut Vec<WatchError>);

    /// Kicks the dispatcher out of its blocking wait so teardown is
    /// noticed promptly. No-op where the dispatcher polls with a timeout.
    fn wake(&mut self) {}
}

pub(crate) struct State<B> {
    pub index: PathIndex,
    pub backend: B,
    pub closed: bool,
}

pub(crate) struct Inner<B: Backend> {
    pub state: RwLock<State<B>>,
    pub callbacks: Callbacks,
}

impl<B: Backend> Inner<B> {
    pub fn new(backend: B, callbacks: Callbacks) -> Self {
        Self {
            state: RwLock::new(State {
                index: PathIndex::new(),
                backend,
                closed: false,
            }),
            callbacks,
        }
    }

    fn emit(&self, event: Event, entry: &EntryRef) {
        (self.callbacks.on_event)(event, entry);
    }

    pub fn fail(&self, err: WatchError) {
        (self.callbacks.on_error)(err);
    }

    /// Routes an error to the sink unless it is a vanished-path error,
    /// which is a normal race against deletion.
    pub fn fail_unless_missing(&self, err: WatchError) {
        if !err.is_not_found() {
            self.fail(err);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().expect("watcher lock poisoned").closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(WatchError::Closed)
        } else {
            Ok(())
        }
    }

    /// True when the immediate parent of `path` is already cached, meaning
    /// the parent's own stream will announce this path's deletion.
    pub fn has_parent_watch(&self, path: &Path) -> bool {
        let Some(parent) = path.parent() else {
            return false;
        };
        self.state
            .read()
            .expect("watcher lock poisoned")
            .index
            .get(parent)
            .is_some()
    }

    pub fn lookup(&self, path: &Path) -> Option<EntryRef> {
        self.state
            .read()
            .expect("watcher lock poisoned")
            .index
            .get(path)
            .cloned()
    }

    // ---------------------------------------------------------------------
    // Read API
    // ---------------------------------------------------------------------

    pub fn get(&self, path: &Path) -> Option<EntryRef> {
        self.state
            .read()
            .expect("watcher lock poisoned")
            .index
            .get(path)
            .filter(|entry| !entry.is_ignored())
            .cloned()
    }

    pub fn traverse(
        &self,
        root: &Path,
        visitor: impl FnMut(&EntryRef) -> FlowControl,
    ) -> Result<()> {
        self.state
            .read()
            .expect("watcher lock poisoned")
            .index
            .walk(root, visitor)
    }

    // ---------------------------------------------------------------------
    // Load
    // ---------------------------------------------------------------------

    pub fn load(
        &self,
        path: &Path,
        recursive: bool,
        root_mask: B::Mask,
        child_mask: B::Mask,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut flags = EntryFlags::EXPLICIT;
        if recursive {
            flags |= EntryFlags::RECURSE;
        }
        tracing::debug!("load {} recursive={recursive}", path.display());
        self.load_impl(path, flags, None, root_mask, child_mask)
    }

    /// Populates the index for `root` and its subtree, installing watches
    /// along the way, then delivers the deferred synthetic events when
    /// `emit` is set: root first (only if newly cached), descendants after,
    /// in walk order.
    pub fn load_impl(
        &self,
        root: &Path,
        flags: EntryFlags,
        emit: Option<Event>,
        root_mask: B::Mask,
        child_mask: B::Mask,
    ) -> Result<()> {
        let meta =
            fs::symlink_metadata(root).map_err(|err| WatchError::os("lstat", root, err))?;
        if !meta.is_dir() && flags.contains(EntryFlags::EXPLICIT) {
            return Err(WatchError::NotDirectory(root.to_path_buf()));
        }
        let entry = Entry::new(root.to_path_buf(), &meta);
        if !(self.callbacks.filter)(&entry) {
            // A rejected root leaves no trace; the caller learns nothing
            // about this path.
            return Ok(());
        }
        entry.merge_flags(flags);

        let mut preexisting = false;
        let mut install_err = None;
        let root_entry = {
            let mut state = self.state.write().expect("watcher lock poisoned");
            match state.index.insert(entry.clone()) {
                Some(existing) => {
                    existing.merge_flags(flags);
                    preexisting = true;
                    existing
                }
                None => {
                    if state.backend.should_watch(&entry) {
                        install_err = state.backend.install(&entry, root_mask).err();
                    }
                    entry
                }
            }
        };
        if let Some(err) = install_err {
            // "Not exist" means the directory vanished between lstat and
            // watch installation; the deletion will be observed upstream.
            self.fail_unless_missing(err);
        }

        let mut created = Vec::new();
        if meta.is_dir() {
            self.scan_children(root, flags, emit.is_some(), child_mask, &mut created);
        }

        if let Some(event) = emit {
            if !preexisting {
                self.emit(event, &root_entry);
            }
            for entry in &created {
                self.emit(event, entry);
            }
        }
        Ok(())
    }

    /// Sorted recursive scan of `dir`'s children. Children are visited in
    /// byte-wise name order so cached state matches walk order; descent
    /// stops at filtered directories, already-cached directories, and, for
    /// non-recursive loads, the first level.
    fn scan_children(
        &self,
        dir: &Path,
        flags: EntryFlags,
        collect: bool,
        child_mask: B::Mask,
        created: &mut Vec<EntryRef>,
    ) {
        let reader = match fs::read_dir(dir) {
            Ok(reader) => reader,
            Err(err) => {
                self.fail_unless_missing(WatchError::os("read_dir", dir, err));
                return;
            }
        };
        let mut names: Vec<_> = reader
            .filter_map(|entry| entry.ok().map(|entry| entry.file_name()))
            .collect();
        names.sort_unstable();

        for name in names {
            let path = dir.join(&name);
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    self.fail_unless_missing(WatchError::os("lstat", &path, err));
                    continue;
                }
            };
            let is_dir = meta.is_dir();
            let entry = Entry::new(path.clone(), &meta);
            let accepted = (self.callbacks.filter)(&entry);

            let mut install_err = None;
            let descend = {
                let mut state = self.state.write().expect("watcher lock poisoned");
                if state.index.insert(entry.clone()).is_some() {
                    // Already observed; its subtree is someone else's load.
                    false
                } else if !accepted {
                    entry.merge_flags(EntryFlags::IGNORED);
                    false
                } else {
                    if state.backend.should_watch(&entry) {
                        install_err = state.backend.install(&entry, child_mask).err();
                    }
                    if collect {
                        created.push(entry.clone());
                    }
                    is_dir && flags.contains(EntryFlags::RECURSE)
                }
            };
            if let Some(err) = install_err {
                self.fail_unless_missing(err);
            }
            if descend {
                self.scan_children(&path, flags, collect, child_mask, created);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Unload
    // ---------------------------------------------------------------------

    /// Removes the watch and cached subtree at `path`. With `recursive`
    /// unset, descendants that were themselves named in a `load` call are
    /// re-loaded afterwards with their original flags so independently
    /// requested roots survive.
    pub fn unload(&self, path: &Path, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        match self.lookup(path) {
            Some(entry) if entry.has_watch() => {}
            _ => return Ok(()),
        }
        tracing::debug!("unload {} recursive={recursive}", path.display());

        let mut reload = Vec::new();
        let mut detach_errors = Vec::new();
        let mut root_err = None;
        {
            let mut state = self.state.write().expect("watcher lock poisoned");
            let State { index, backend, .. } = &mut *state;
            index.delete_subtree(path, |entry| {
                let keep = !recursive
                    && entry.flags().contains(EntryFlags::EXPLICIT)
                    && entry.path() != path;
                if keep {
                    reload.push((
                        entry.path().to_path_buf(),
                        entry.flags() & (EntryFlags::RECURSE | EntryFlags::EXPLICIT),
                    ));
                }
                if entry.has_watch() {
                    if let Err(err) = backend.detach(entry) {
                        if entry.path() == path {
                            root_err = Some(err);
                        } else {
                            detach_errors.push(err);
                        }
                    }
                }
            });
        }
        for err in detach_errors {
            self.fail(err);
        }
        for (path, flags) in reload {
            if let Err(err) = self.load_impl(&path, flags, None, B::all_mask(), B::all_mask()) {
                self.fail(err);
            }
        }
        match root_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Close
    // ---------------------------------------------------------------------

    /// Flips the closed flag. Fails with `Closed` if a previous close
    /// already ran; every later load/unload/close fails the same way.
    pub fn mark_closed(&self) -> Result<()> {
        let mut state = self.state.write().expect("watcher lock poisoned");
        if state.closed {
            return Err(WatchError::Closed);
        }
        state.closed = true;
        Ok(())
    }

    /// Releases every outstanding subscription. Per-handle release errors
    /// go to the sink; teardown never aborts.
    pub fn teardown_watches(&self) {
        let mut errors = Vec::new();
        {
            let mut state = self.state.write().expect("watcher lock poisoned");
            state.backend.detach_all(&mut errors);
        }
        for err in errors {
            self.fail(err);
        }
    }

    /// Marks the watcher closed and releases every subscription. Does not
    /// wait for the dispatcher: releasing the kernel source and the wakeup
    /// make it exit on its own.
    pub fn close(&self) -> Result<()> {
        self.mark_closed()?;
        self.teardown_watches();
        self.state
            .write()
            .expect("watcher lock poisoned")
            .backend
            .wake();
        tracing::debug!("watcher closed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Dispatcher reactions
    // ---------------------------------------------------------------------

    /// Delete: evicts the subtree at `path`, releasing watches along the
    /// way, and emits Delete for each evicted entry in walk order. Never
    /// fails; release errors go to the sink and eviction proceeds.
    pub fn on_delete(&self, path: &Path) {
        let mut removed = Vec::new();
        let mut errors = Vec::new();
        {
            let mut state = self.state.write().expect("watcher lock poisoned");
            let State { index, backend, .. } = &mut *state;
            index.delete_subtree(path, |entry| {
                if entry.has_watch() {
                    if let Err(err) = backend.detach(entry) {
                        errors.push(err);
                    }
                }
                removed.push(entry.clone());
            });
        }
        for err in errors {
            self.fail(err);
        }
        for entry in &removed {
            self.emit(Event::Delete, entry);
        }
    }

    /// Modify: refreshes the cached metadata from a fresh lstat and emits.
    /// A vanished path is ignored; the deletion event is on its way.
    pub fn on_modify(&self, entry: &EntryRef) {
        match fs::symlink_metadata(entry.path()) {
            Ok(meta) => {
                entry.update(&meta);
                self.emit(Event::Modify, entry);
            }
            Err(err) => {
                self.fail_unless_missing(WatchError::os("lstat", entry.path(), err));
            }
        }
    }

    /// Create for a path not yet cached: loads it (recursion inherited from
    /// the parent) and emits synthetic Creates for everything discovered.
    pub fn on_discover(&self, path: &Path, inherited: EntryFlags) {
        let flags = inherited & EntryFlags::RECURSE;
        if let Err(err) =
            self.load_impl(path, flags, Some(Event::Create), B::all_mask(), B::all_mask())
        {
            self.fail_unless_missing(err);
        }
    }

    /// A non-delete notification for `parent`'s child `name` (or for the
    /// watched entry itself when `name` is empty): cached paths refresh and
    /// emit Modify, unknown paths are discovered as Creates.
    pub fn on_child_event(&self, parent: &EntryRef, name: &OsStr) {
        if name.is_empty() {
            self.on_modify(parent);
            return;
        }
        let path: PathBuf = parent.path().join(name);
        match self.lookup(&path) {
            Some(entry) => self.on_modify(&entry),
            None => self.on_discover(&path, parent.flags()),
        }
    }

    /// The kernel dropped notifications; the cache is stale for unspecified
    /// paths and the application is expected to re-walk.
    pub fn on_overflow(&self) {
        self.fail(WatchError::Overflow);
    }
}
