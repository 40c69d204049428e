//! In-process filesystem observation with a cached metadata index.
//!
//! This crate watches directory trees for changes and keeps a queryable
//! cache of everything it has seen:
//! - Ordered Create/Modify/Delete notifications as the observed subtree
//!   mutates, delivered to a user-supplied sink
//! - Path lookups (`get`, `lstat`) and subtree traversals (`traverse`,
//!   `walk`) answered from the cache in filesystem-walk order, without
//!   touching the kernel
//! - Dynamic watch management: kernel subscriptions appear and disappear
//!   with the directories they observe
//!
//! ## Architecture
//!
//! One background dispatcher thread per watcher pulls kernel events,
//! updates the index, and invokes the callbacks. The platform layer unifies
//! three notification protocols behind one event model: inotify on Linux,
//! kqueue on the BSDs and macOS, and ReadDirectoryChangesW over a
//! completion port on Windows.
//!
//! ## Module Structure
//!
//! - `index` - Ordered path-to-entry store with walk-order iteration
//! - `entry` - Cached per-path metadata and watch handles
//! - `callbacks` - Filter, event sink, and error sink hooks
//! - `watcher` - Public API and the platform-independent core
//! - `platform` - inotify / kqueue / ReadDirectoryChangesW backends

mod callbacks;
mod entry;
mod error;
mod index;
mod platform;
mod types;
mod watcher;

pub use callbacks::{default_filter, Callbacks};
pub use entry::{Entry, EntryRef, Metadata};
pub use error::{Result, WatchError};
pub use types::{Event, FileType, FlowControl, RecursiveMode, WatcherConfig};
pub use watcher::Watcher;
