//! BSD/macOS backend: kqueue.
//!
//! kqueue watches individual vnodes, so every cached entry (file or
//! directory) owns an open descriptor with an `EVFILT_VNODE` filter. kqueue
//! does not name the child behind a directory write, so directory activity
//! triggers a loader re-scan that discovers new children and emits
//! synthetic Creates. The dispatcher polls with a short timeout and
//! re-checks for teardown on every wake.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};

use crate::callbacks::Callbacks;
use crate::entry::{Entry, EntryRef};
use crate::error::{Result, WatchError};
use crate::types::WatcherConfig;
use crate::watcher::inner::{Backend, Inner};

pub(crate) type WatchHandle = OwnedFd;

#[cfg(target_os = "macos")]
const OPEN_FLAGS: i32 = libc::O_EVTONLY;
#[cfg(not(target_os = "macos"))]
const OPEN_FLAGS: i32 = libc::O_NONBLOCK;

fn modify_mask() -> FilterFlag {
    FilterFlag::NOTE_WRITE | FilterFlag::NOTE_EXTEND | FilterFlag::NOTE_ATTRIB
}

fn delete_mask() -> FilterFlag {
    FilterFlag::NOTE_DELETE | FilterFlag::NOTE_RENAME | FilterFlag::NOTE_REVOKE
}

fn all_mask() -> FilterFlag {
    modify_mask() | delete_mask()
}

fn zero_timespec() -> libc::timespec {
    libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    }
}

pub(crate) struct KqueueBackend {
    /// Dropped on teardown; the pump holds the other reference, so the
    /// kqueue descriptor closes once both let go.
    queue: Option<Arc<Kqueue>>,
    descriptors: HashMap<RawFd, EntryRef>,
}

impl KqueueBackend {
    fn entry_for(&self, ident: RawFd) -> Option<EntryRef> {
        self.descriptors.get(&ident).cloned()
    }
}

impl Backend for KqueueBackend {
    type Mask = FilterFlag;

    fn all_mask() -> FilterFlag {
        all_mask()
    }

    fn should_watch(&self, _entry: &Entry) -> bool {
        // kqueue subscribes every vnode individually.
        true
    }

    fn install(&mut self, entry: &EntryRef, mask: FilterFlag) -> Result<()> {
        let queue = self.queue.as_ref().ok_or(WatchError::Closed)?;
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OPEN_FLAGS)
            .open(entry.path())
            .map_err(|err| WatchError::os("open", entry.path(), err))?;
        let fd: OwnedFd = file.into();
        let ident = fd.as_raw_fd();
        let change = [KEvent::new(
            ident as usize,
            EventFilter::EVFILT_VNODE,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            mask,
            0,
            0,
        )];
        let mut scratch: [KEvent; 0] = [];
        queue
            .kevent(&change, &mut scratch, Some(zero_timespec()))
            .map_err(|errno| {
                WatchError::os(
                    "kevent",
                    entry.path(),
                    io::Error::from_raw_os_error(errno as i32),
                )
            })?;
        entry.set_watch(fd);
        self.descriptors.insert(ident, entry.clone());
        Ok(())
    }

    fn detach(&mut self, entry: &Entry) -> Result<()> {
        let Some(fd) = entry.take_watch() else {
            return Ok(());
        };
        self.descriptors.remove(&fd.as_raw_fd());
        // Dropping the descriptor closes it exactly once; the kernel
        // removes the kevent with the vnode's last reference.
        drop(fd);
        Ok(())
    }

    fn detach_all(&mut self, _errors: &mut Vec<WatchError>) {
        for (_, entry) in std::mem::take(&mut self.descriptors) {
            entry.take_watch();
        }
        self.queue = None;
    }
}

pub(crate) struct Driver {
    inner: Arc<Inner<KqueueBackend>>,
}

impl Driver {
    pub fn new(callbacks: Callbacks, config: WatcherConfig) -> Result<Self> {
        let queue = Arc::new(Kqueue::new().map_err(|errno| {
            WatchError::os(
                "kqueue",
                PathBuf::new(),
                io::Error::from_raw_os_error(errno as i32),
            )
        })?);
        let backend = KqueueBackend {
            queue: Some(queue.clone()),
            descriptors: HashMap::new(),
        };
        let inner = Arc::new(Inner::new(backend, callbacks));

        let pump_inner = inner.clone();
        let interval = config.poll_interval;
        thread::Builder::new()
            .name("fswatch-dispatch".into())
            .spawn(move || pump(pump_inner, queue, interval))
            .map_err(|err| WatchError::os("spawn", PathBuf::new(), err))?;

        Ok(Self { inner })
    }

    pub fn shared(&self) -> &Inner<KqueueBackend> {
        &self.inner
    }

    pub fn load(&self, path: &Path, recursive: bool) -> Result<()> {
        self.inner.load(path, recursive, all_mask(), all_mask())
    }

    pub fn unload(&self, path: &Path, recursive: bool) -> Result<()> {
        self.inner.unload(path, recursive)
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn pump(inner: Arc<Inner<KqueueBackend>>, queue: Arc<Kqueue>, interval: Duration) {
    let wait = libc::timespec {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_nsec: interval.subsec_nanos() as libc::c_long,
    };
    let placeholder = KEvent::new(
        0,
        EventFilter::EVFILT_VNODE,
        EventFlag::empty(),
        FilterFlag::empty(),
        0,
        0,
    );
    let mut events = vec![placeholder; 256];
    loop {
        let count = match queue.kevent(&[], &mut events, Some(wait)) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(errno) => {
                if inner.is_closed() {
                    return;
                }
                inner.fail(WatchError::os(
                    "kevent",
                    PathBuf::new(),
                    io::Error::from_raw_os_error(errno as i32),
                ));
                continue;
            }
        };
        if inner.is_closed() {
            return;
        }
        for event in &events[..count] {
            let entry = {
                let state = inner.state.read().expect("watcher lock poisoned");
                state.backend.entry_for(event.ident() as RawFd)
            };
            // Stale idents race a detach; their events are meaningless now.
            let Some(entry) = entry else { continue };
            let flags = event.fflags();
            if flags.intersects(delete_mask()) {
                inner.on_delete(entry.path());
            } else if entry.is_dir() && flags.intersects(modify_mask()) {
                // The kernel does not say which child changed; a re-scan
                // finds the new ones and emits their Creates.
                inner.on_discover(entry.path(), entry.flags());
            } else {
                inner.on_modify(&entry);
            }
        }
    }
}
