//! Windows backend: ReadDirectoryChangesW on an I/O completion port.
//!
//! Every watched directory is opened overlapped and associated with one
//! completion port drained by a single dedicated dispatcher thread. The
//! overlapped read buffers are tied to that thread's outstanding I/O, so
//! every mutation (load, unload, teardown) is marshaled onto it through a
//! command channel plus a posted wakeup packet; caller threads never touch
//! watch state directly. Recursion is implemented by installing child
//! watches, never with `bWatchSubtree`.
//!
//! Bursts of change records are coalesced into a small queue that drops
//! same-name duplicates (unless a delete is involved) and flushes on the
//! next drain or after a short idle timeout.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_MORE_DATA, ERROR_OPERATION_ABORTED, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{
    CancelIo, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
    OVERLAPPED,
};

use crate::callbacks::Callbacks;
use crate::entry::{Entry, EntryRef};
use crate::error::{Result, WatchError};
use crate::types::WatcherConfig;
use crate::watcher::inner::{Backend, Inner};

/// Key identifying a watch slot: the address of its OVERLAPPED header.
pub(crate) type WatchHandle = usize;

const INFINITE: u32 = 0xFFFF_FFFF;
const SLOT_BUFFER: usize = 4096;
/// NextEntryOffset + Action + FileNameLength.
const RECORD_HEADER: usize = 12;

fn all_mask() -> u32 {
    FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_LAST_WRITE
        | FILE_NOTIFY_CHANGE_SIZE
}

fn is_delete(action: u32) -> bool {
    action == FILE_ACTION_REMOVED || action == FILE_ACTION_RENAMED_OLD_NAME
}

/// Per-directory overlapped read state. The OVERLAPPED header must stay the
/// first field: completion packets return its address, which is also the
/// slot's map key. Boxed so the address is stable for the kernel while the
/// read is outstanding.
#[repr(C)]
struct WatchSlot {
    overlapped: OVERLAPPED,
    handle: usize,
    filter: u32,
    entry: EntryRef,
    buffer: [u8; SLOT_BUFFER],
}

impl WatchSlot {
    fn key(&self) -> usize {
        &self.overlapped as *const OVERLAPPED as usize
    }

    /// (Re-)issues the overlapped directory read.
    fn issue(&mut self) -> io::Result<()> {
        unsafe {
            if CancelIo(self.handle as HANDLE) == 0 {
                return Err(io::Error::last_os_error());
            }
            self.overlapped = std::mem::zeroed();
            let ok = ReadDirectoryChangesW(
                self.handle as HANDLE,
                self.buffer.as_mut_ptr().cast(),
                SLOT_BUFFER as u32,
                0,
                self.filter,
                ptr::null_mut(),
                &mut self.overlapped,
                None,
            );
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

pub(crate) struct WindowsBackend {
    /// Raw completion port handle; zero once the dispatcher tore down.
    port: usize,
    slots: HashMap<usize, Box<WatchSlot>>,
    /// Detached slots whose buffers stay alive until their aborted
    /// completion drains, or until teardown.
    retired: HashMap<usize, Box<WatchSlot>>,
}

// Handles and overlapped buffers are only ever touched by the dispatcher
// thread; other threads just read the port value to post wakeups.
unsafe impl Send for WindowsBackend {}
unsafe impl Sync for WindowsBackend {}

impl WindowsBackend {
    fn post_wake(&self) -> io::Result<()> {
        if self.port == 0 {
            return Ok(());
        }
        let ok =
            unsafe { PostQueuedCompletionStatus(self.port as HANDLE, 0, 0, ptr::null()) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for WindowsBackend {
    type Mask = u32;

    fn all_mask() -> u32 {
        all_mask()
    }

    fn should_watch(&self, entry: &Entry) -> bool {
        entry.is_dir()
    }

    fn install(&mut self, entry: &EntryRef, mask: u32) -> Result<()> {
        if self.port == 0 {
            return Err(WatchError::Closed);
        }
        let wide: Vec<u16> = entry
            .path()
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(WatchError::os(
                "CreateFileW",
                entry.path(),
                io::Error::last_os_error(),
            ));
        }
        let associated =
            unsafe { CreateIoCompletionPort(handle, self.port as HANDLE, 0, 1) };
        if associated.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(WatchError::os("CreateIoCompletionPort", entry.path(), err));
        }
        let mut slot = Box::new(WatchSlot {
            overlapped: unsafe { std::mem::zeroed() },
            handle: handle as usize,
            filter: mask,
            entry: entry.clone(),
            buffer: [0; SLOT_BUFFER],
        });
        if let Err(err) = slot.issue() {
            unsafe { CloseHandle(handle) };
            return Err(WatchError::os(
                "ReadDirectoryChangesW",
                entry.path(),
                err,
            ));
        }
        let key = slot.key();
        entry.set_watch(key);
        self.slots.insert(key, slot);
        Ok(())
    }

    fn detach(&mut self, entry: &Entry) -> Result<()> {
        let Some(key) = entry.take_watch() else {
            return Ok(());
        };
        let Some(slot) = self.slots.remove(&key) else {
            return Ok(());
        };
        let handle = slot.handle as HANDLE;
        self.retired.insert(key, slot);
        unsafe {
            CancelIo(handle);
            if CloseHandle(handle) == 0 {
                return Err(WatchError::os(
                    "CloseHandle",
                    entry.path(),
                    io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }

    fn detach_all(&mut self, errors: &mut Vec<WatchError>) {
        let slots = std::mem::take(&mut self.slots);
        for (key, slot) in slots {
            slot.entry.take_watch();
            let handle = slot.handle as HANDLE;
            let path = slot.entry.path().to_path_buf();
            self.retired.insert(key, slot);
            unsafe {
                CancelIo(handle);
                if CloseHandle(handle) == 0 {
                    errors.push(WatchError::os(
                        "CloseHandle",
                        path,
                        io::Error::last_os_error(),
                    ));
                }
            }
        }
    }

    fn wake(&mut self) {
        let _ = self.post_wake();
    }
}

enum Command {
    Load {
        path: PathBuf,
        recursive: bool,
        done: Sender<Result<()>>,
    },
    Unload {
        path: PathBuf,
        recursive: bool,
        done: Sender<Result<()>>,
    },
    Teardown,
}

/// One coalesced change record awaiting delivery.
struct QueueItem {
    action: u32,
    entry: EntryRef,
    name: OsString,
}

pub(crate) struct Driver {
    inner: Arc<Inner<WindowsBackend>>,
    commands: Sender<Command>,
}

impl Driver {
    pub fn new(callbacks: Callbacks, config: WatcherConfig) -> Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(WatchError::os(
                "CreateIoCompletionPort",
                PathBuf::new(),
                io::Error::last_os_error(),
            ));
        }
        let backend = WindowsBackend {
            port: port as usize,
            slots: HashMap::new(),
            retired: HashMap::new(),
        };
        let inner = Arc::new(Inner::new(backend, callbacks));
        let (commands, command_rx) = unbounded();

        let pump_inner = inner.clone();
        let raw_port = port as usize;
        let coalesce = config.coalesce_window;
        // The overlapped reads belong to this one OS thread for the
        // watcher's whole life.
        thread::Builder::new()
            .name("fswatch-dispatch".into())
            .spawn(move || pump(pump_inner, raw_port, command_rx, coalesce))
            .map_err(|err| WatchError::os("spawn", PathBuf::new(), err))?;

        Ok(Self { inner, commands })
    }

    pub fn shared(&self) -> &Inner<WindowsBackend> {
        &self.inner
    }

    fn dispatch(&self, command: Command, done: Receiver<Result<()>>) -> Result<()> {
        self.commands.send(command).map_err(|_| WatchError::Closed)?;
        {
            let state = self.inner.state.read().expect("watcher lock poisoned");
            state.backend.post_wake().map_err(|err| {
                WatchError::os("PostQueuedCompletionStatus", PathBuf::new(), err)
            })?;
        }
        done.recv().map_err(|_| WatchError::Closed)?
    }

    pub fn load(&self, path: &Path, recursive: bool) -> Result<()> {
        if self.inner.is_closed() {
            return Err(WatchError::Closed);
        }
        let (done_tx, done_rx) = bounded(1);
        self.dispatch(
            Command::Load {
                path: path.to_path_buf(),
                recursive,
                done: done_tx,
            },
            done_rx,
        )
    }

    pub fn unload(&self, path: &Path, recursive: bool) -> Result<()> {
        if self.inner.is_closed() {
            return Err(WatchError::Closed);
        }
        let (done_tx, done_rx) = bounded(1);
        self.dispatch(
            Command::Unload {
                path: path.to_path_buf(),
                recursive,
                done: done_tx,
            },
            done_rx,
        )
    }

    /// Marks the watcher closed and hands teardown to the dispatcher.
    /// Returns without waiting for it.
    pub fn close(&self) -> Result<()> {
        self.inner.mark_closed()?;
        let _ = self.commands.send(Command::Teardown);
        let state = self.inner.state.read().expect("watcher lock poisoned");
        let _ = state.backend.post_wake();
        Ok(())
    }
}

fn pump(
    inner: Arc<Inner<WindowsBackend>>,
    port: usize,
    commands: Receiver<Command>,
    coalesce: Duration,
) {
    let coalesce_ms = (coalesce.as_millis() as u32).max(1);
    let mut queue: Vec<QueueItem> = Vec::new();
    loop {
        let timeout = if queue.is_empty() { INFINITE } else { coalesce_ms };
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(port as HANDLE, &mut bytes, &mut key, &mut overlapped, timeout)
        };
        let error_code = if ok == 0 {
            io::Error::last_os_error().raw_os_error().map(|code| code as u32)
        } else {
            None
        };

        if overlapped.is_null() {
            // A posted wakeup or the coalesce timeout: run marshaled
            // commands, then flush whatever was pending.
            let mut teardown = false;
            while let Ok(command) = commands.try_recv() {
                match command {
                    Command::Load {
                        path,
                        recursive,
                        done,
                    } => {
                        let _ = done.send(inner.load(&path, recursive, all_mask(), all_mask()));
                    }
                    Command::Unload {
                        path,
                        recursive,
                        done,
                    } => {
                        let _ = done.send(inner.unload(&path, recursive));
                    }
                    Command::Teardown => teardown = true,
                }
            }
            if teardown {
                inner.teardown_watches();
                {
                    let mut state = inner.state.write().expect("watcher lock poisoned");
                    state.backend.port = 0;
                    state.backend.retired.clear();
                }
                unsafe { CloseHandle(port as HANDLE) };
                return;
            }
            if let Some(code) = error_code {
                if code != WAIT_TIMEOUT {
                    inner.fail(WatchError::os(
                        "GetQueuedCompletionStatus",
                        PathBuf::new(),
                        io::Error::from_raw_os_error(code as i32),
                    ));
                }
            }
            flush(&inner, &mut queue);
            continue;
        }

        let slot_key = overlapped as usize;
        {
            // A completion for a retired slot just frees its buffer.
            let mut state = inner.state.write().expect("watcher lock poisoned");
            if state.backend.retired.remove(&slot_key).is_some() {
                continue;
            }
        }

        let mut packet_len = bytes as usize;
        match error_code {
            None => {}
            Some(ERROR_MORE_DATA) => packet_len = SLOT_BUFFER,
            Some(ERROR_OPERATION_ABORTED) => continue,
            Some(ERROR_ACCESS_DENIED) => {
                // The directory went unreadable underneath us, which on
                // removable media is how deletion surfaces.
                let entry = {
                    let state = inner.state.read().expect("watcher lock poisoned");
                    state.backend.slots.get(&slot_key).map(|slot| slot.entry.clone())
                };
                if let Some(entry) = entry {
                    inner.on_delete(entry.path());
                }
                continue;
            }
            Some(code) => {
                inner.fail(WatchError::os(
                    "GetQueuedCompletionStatus",
                    PathBuf::new(),
                    io::Error::from_raw_os_error(code as i32),
                ));
                continue;
            }
        }
        if packet_len == 0 {
            inner.fail(WatchError::ShortRead);
        }

        // Copy the packet out under the lock; parse and react unlocked.
        let (entry, packet) = {
            let state = inner.state.read().expect("watcher lock poisoned");
            match state.backend.slots.get(&slot_key) {
                Some(slot) => (
                    slot.entry.clone(),
                    slot.buffer[..packet_len.min(SLOT_BUFFER)].to_vec(),
                ),
                None => continue,
            }
        };

        let queued = queue.len();
        parse_records(&inner, &entry, &packet, &mut queue);

        // Items that were already pending before this burst flush now;
        // the fresh ones wait one more drain for coalescing.
        let pending: Vec<QueueItem> = queue.drain(..queued).collect();
        for item in pending {
            deliver(&inner, item);
        }

        let rearm_err = {
            let mut state = inner.state.write().expect("watcher lock poisoned");
            match state.backend.slots.get_mut(&slot_key) {
                Some(slot) => slot.issue().err(),
                None => None,
            }
        };
        if let Some(err) = rearm_err {
            if err.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
                inner.on_delete(entry.path());
            } else {
                inner.fail(WatchError::os("ReadDirectoryChangesW", entry.path(), err));
            }
        }
    }
}

/// Splits a completion packet into FILE_NOTIFY_INFORMATION records,
/// coalescing against the pending queue: identical same-name records merge
/// unless either side is a delete.
fn parse_records(
    inner: &Inner<WindowsBackend>,
    entry: &EntryRef,
    packet: &[u8],
    queue: &mut Vec<QueueItem>,
) {
    let read_u32 = |at: usize| {
        u32::from_ne_bytes([packet[at], packet[at + 1], packet[at + 2], packet[at + 3]])
    };
    let mut offset = 0usize;
    while offset + RECORD_HEADER <= packet.len() {
        let next = read_u32(offset);
        let action = read_u32(offset + 4);
        let name_bytes = read_u32(offset + 8) as usize;
        let name_start = offset + RECORD_HEADER;
        let name_end = name_start + name_bytes;
        if name_end > packet.len() {
            inner.on_overflow();
            break;
        }
        let wide: Vec<u16> = packet[name_start..name_end]
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        let name = OsString::from_wide(&wide);

        let mut duplicate = false;
        for item in queue.iter() {
            if Arc::ptr_eq(&item.entry, entry) && item.name == name {
                duplicate = !is_delete(item.action) && !is_delete(action);
                break;
            }
        }
        if !duplicate {
            queue.push(QueueItem {
                action,
                entry: entry.clone(),
                name,
            });
        }

        if next == 0 {
            break;
        }
        offset += next as usize;
        if offset > packet.len() {
            inner.on_overflow();
            break;
        }
    }
}

fn deliver(inner: &Inner<WindowsBackend>, item: QueueItem) {
    if is_delete(item.action) {
        let path = item.entry.path().join(&item.name);
        inner.on_delete(&path);
    } else {
        inner.on_child_event(&item.entry, &item.name);
    }
}

fn flush(inner: &Inner<WindowsBackend>, queue: &mut Vec<QueueItem>) {
    for item in queue.drain(..) {
        deliver(inner, item);
    }
}
