//! Linux backend: inotify.
//!
//! One inotify instance serves the whole watcher. Directories get watch
//! descriptors; file events arrive on their parent directory's stream, so
//! files are never subscribed individually. The dispatcher blocks in
//! `poll(2)` on the inotify descriptor and a self-pipe; close writes a wake
//! byte so teardown is noticed without a synthetic filesystem event.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::callbacks::Callbacks;
use crate::entry::{Entry, EntryRef};
use crate::error::{Result, WatchError};
use crate::types::WatcherConfig;
use crate::watcher::inner::{Backend, Inner};

pub(crate) type WatchHandle = WatchDescriptor;

/// Self-pipe used to interrupt the dispatcher's blocking poll.
fn wake_pipe() -> io::Result<(File, File)> {
    let mut fds = [0i32; 2];
    // Safety: fds is a valid two-slot buffer; on success both ends are
    // fresh descriptors owned here and nowhere else.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((File::from(rx), File::from(tx)))
}

fn all_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::MOVED_TO
        | WatchMask::CLOSE_WRITE
        | WatchMask::ATTRIB
        | WatchMask::MOVED_FROM
        | WatchMask::DELETE
        | WatchMask::EXCL_UNLINK
}

fn delete_mask() -> EventMask {
    EventMask::MOVED_FROM | EventMask::DELETE | EventMask::DELETE_SELF | EventMask::IGNORED
}

pub(crate) struct InotifyBackend {
    watches: Watches,
    descriptors: HashMap<WatchDescriptor, EntryRef>,
    wake_tx: File,
}

impl InotifyBackend {
    fn entry_for(&self, wd: &WatchDescriptor) -> Option<EntryRef> {
        self.descriptors.get(wd).cloned()
    }
}

impl Backend for InotifyBackend {
    type Mask = WatchMask;

    fn all_mask() -> WatchMask {
        all_mask()
    }

    fn should_watch(&self, entry: &Entry) -> bool {
        entry.is_dir()
    }

    fn install(&mut self, entry: &EntryRef, mask: WatchMask) -> Result<()> {
        let wd = self
            .watches
            .add(entry.path(), mask)
            .map_err(|err| WatchError::os("inotify_add_watch", entry.path(), err))?;
        entry.set_watch(wd.clone());
        self.descriptors.insert(wd, entry.clone());
        Ok(())
    }

    fn detach(&mut self, entry: &Entry) -> Result<()> {
        let Some(wd) = entry.take_watch() else {
            return Ok(());
        };
        self.descriptors.remove(&wd);
        match self.watches.remove(wd) {
            Ok(()) => Ok(()),
            // The kernel already dropped the watch when the inode went
            // away; only the bookkeeping was left.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(WatchError::os("inotify_rm_watch", entry.path(), err)),
        }
    }

    fn detach_all(&mut self, errors: &mut Vec<WatchError>) {
        for (wd, entry) in std::mem::take(&mut self.descriptors) {
            entry.take_watch();
            match self.watches.remove(wd) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
                Err(err) => {
                    errors.push(WatchError::os("inotify_rm_watch", entry.path(), err));
                }
            }
        }
    }

    fn wake(&mut self) {
        let _ = self.wake_tx.write_all(&[1]);
    }
}

pub(crate) struct Driver {
    inner: Arc<Inner<InotifyBackend>>,
}

impl Driver {
    pub fn new(callbacks: Callbacks, config: WatcherConfig) -> Result<Self> {
        let mut instance = Inotify::init()
            .map_err(|err| WatchError::os("inotify_init", PathBuf::new(), err))?;
        let (wake_rx, wake_tx) =
            wake_pipe().map_err(|err| WatchError::os("pipe", PathBuf::new(), err))?;
        let backend = InotifyBackend {
            watches: instance.watches(),
            descriptors: HashMap::new(),
            wake_tx,
        };
        let inner = Arc::new(Inner::new(backend, callbacks));

        let pump_inner = inner.clone();
        let buffer_size = config.event_buffer_size.max(1024);
        thread::Builder::new()
            .name("fswatch-dispatch".into())
            .spawn(move || pump(pump_inner, instance, wake_rx, buffer_size))
            .map_err(|err| WatchError::os("spawn", PathBuf::new(), err))?;

        Ok(Self { inner })
    }

    pub fn shared(&self) -> &Inner<InotifyBackend> {
        &self.inner
    }

    pub fn load(&self, path: &Path, recursive: bool) -> Result<()> {
        let mut root_mask = all_mask();
        // The watcher learns about this root's own deletion from its parent
        // when the parent is cached; otherwise the root must announce it.
        if !self.inner.has_parent_watch(path) {
            root_mask |= WatchMask::DELETE_SELF;
        }
        self.inner.load(path, recursive, root_mask, all_mask())
    }

    pub fn unload(&self, path: &Path, recursive: bool) -> Result<()> {
        self.inner.unload(path, recursive)
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn pump(inner: Arc<Inner<InotifyBackend>>, mut instance: Inotify, wake_rx: File, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let instance_fd = instance.as_raw_fd();
        let instance_bfd = unsafe { std::os::fd::BorrowedFd::borrow_raw(instance_fd) };
        let mut fds = [
            PollFd::new(instance_bfd, PollFlags::POLLIN),
            PollFd::new(wake_rx.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => {
                inner.fail(WatchError::os(
                    "poll",
                    PathBuf::new(),
                    io::Error::from_raw_os_error(errno as i32),
                ));
                return;
            }
        }
        let events_ready = fds[0]
            .revents()
            .map(|flags| flags.intersects(PollFlags::POLLIN))
            .unwrap_or(false);
        let woken = fds[1]
            .revents()
            .map(|flags| flags.intersects(PollFlags::POLLIN))
            .unwrap_or(false);
        if woken {
            let mut drain = [0u8; 16];
            let _ = (&wake_rx).read(&mut drain);
        }
        if inner.is_closed() {
            return;
        }
        if !events_ready {
            continue;
        }
        let events = match instance.read_events(&mut buffer) {
            Ok(events) => events,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                inner.fail(WatchError::os("read", PathBuf::new(), err));
                continue;
            }
        };
        for event in events {
            if event.mask.contains(EventMask::Q_OVERFLOW) {
                inner.on_overflow();
                continue;
            }
            let entry = {
                let state = inner.state.read().expect("watcher lock poisoned");
                state.backend.entry_for(&event.wd)
            };
            // Unknown descriptors are stale events racing a detach.
            let Some(entry) = entry else { continue };
            let name = event.name.unwrap_or_default();
            if event.mask.intersects(delete_mask()) {
                let path = if name.is_empty() {
                    entry.path().to_path_buf()
                } else {
                    entry.path().join(name)
                };
                inner.on_delete(&path);
            } else {
                inner.on_child_event(&entry, name);
            }
        }
    }
}
