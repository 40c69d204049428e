//! Platform backend selection.
//!
//! Each backend adapts one kernel notification protocol to the dispatcher's
//! uniform event model and manages the lifecycle of its watch identifiers:
//! inotify watch descriptors on Linux, per-vnode file descriptors on
//! BSD/macOS, directory handles on a completion port on Windows.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use self::linux::{Driver, WatchHandle};

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub(crate) use self::kqueue::{Driver, WatchHandle};

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub(crate) use self::windows::{Driver, WatchHandle};
