//! External interface of the watcher: filter predicate, event sink, and
//! error sink.
//!
//! All three run on the dispatcher thread. They MUST NOT call back into the
//! watcher: the dispatcher cannot serve an operation while it is inside a
//! callback, and a reentrant call can deadlock. Callers that need to react
//! with watcher operations should forward the event to their own queue.

use crate::entry::{Entry, EntryRef};
use crate::error::WatchError;
use crate::types::Event;

type EventSink = Box<dyn Fn(Event, &EntryRef) + Send + Sync>;
type Filter = Box<dyn Fn(&Entry) -> bool + Send + Sync>;
type ErrorSink = Box<dyn Fn(WatchError) + Send + Sync>;

/// The filter applied when none is supplied: rejects dotfiles and editor
/// backup files (names starting with `.` or ending with `~`).
pub fn default_filter(entry: &Entry) -> bool {
    let name = entry.name().to_string_lossy();
    !(name.starts_with('.') || name.ends_with('~'))
}

/// User-supplied hooks, each optional.
///
/// The filter sees every entry before it becomes visible; returning `false`
/// marks it ignored (cached to suppress re-notification, hidden from
/// queries and events). The event sink receives committed mutations in
/// delivery order. The error sink receives background failures; by default
/// it logs them.
pub struct Callbacks {
    pub(crate) on_event: EventSink,
    pub(crate) filter: Filter,
    pub(crate) on_error: ErrorSink,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            on_event: Box::new(|_, _| {}),
            filter: Box::new(default_filter),
            on_error: Box::new(|err| {
                tracing::warn!("watcher error: {err}");
            }),
        }
    }

    /// Replaces the event sink.
    pub fn on_event(mut self, sink: impl Fn(Event, &EntryRef) + Send + Sync + 'static) -> Self {
        self.on_event = Box::new(sink);
        self
    }

    /// Replaces the visibility filter. Accept everything with `|_| true`.
    pub fn filter(mut self, filter: impl Fn(&Entry) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    /// Replaces the error sink.
    pub fn on_error(mut self, sink: impl Fn(WatchError) + Send + Sync + 'static) -> Self {
        self.on_error = Box::new(sink);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn entry(path: &str) -> EntryRef {
        let temp = tempfile::tempdir().unwrap();
        let meta = fs::symlink_metadata(temp.path()).unwrap();
        Entry::new(PathBuf::from(path), &meta)
    }

    #[test]
    fn default_filter_rejects_hidden_and_backup_names() {
        assert!(default_filter(&entry("/r/src")));
        assert!(default_filter(&entry("/r/main.rs")));
        assert!(!default_filter(&entry("/r/.git")));
        assert!(!default_filter(&entry("/r/notes.txt~")));
    }

    #[test]
    fn builder_overrides_hooks() {
        let callbacks = Callbacks::new().filter(|_| true);
        assert!((callbacks.filter)(&entry("/r/.hidden")));
    }
}
