//! Ordered path index.
//!
//! A map from absolute paths to cached entries whose iteration order is the
//! order a depth-first filesystem walk would visit them: within a directory,
//! children sort byte-wise by name, and a directory precedes everything
//! underneath it. The reference achieves this with a crit-bit tree; here a
//! `BTreeMap` over remapped key bytes reproduces the same order: the path
//! separator is rewritten to `0x01` so `foo/bar` sorts before `foo.ext`,
//! exactly as a walk that descends into `foo` before visiting `foo.ext`.
//!
//! Subtree bounds are exact: the subtree of `root` is `root` itself plus
//! every path starting with `root` + separator. `rootx` is not in it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::entry::EntryRef;
use crate::error::{Result, WatchError};
use crate::types::FlowControl;

const SEPARATOR: u8 = std::path::MAIN_SEPARATOR as u8;

/// Separator stand-in that sorts below every byte a file name can contain.
const ORDER_BYTE: u8 = 0x01;

/// Builds the comparison key for a path: its OS-string bytes with the
/// separator remapped below all printable bytes.
fn path_key(path: &Path) -> Vec<u8> {
    path.as_os_str()
        .as_encoded_bytes()
        .iter()
        .map(|&b| if b == SEPARATOR { ORDER_BYTE } else { b })
        .collect()
}

/// Key range covering the strict descendants of `key`.
fn subtree_bounds(key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut start = key.to_vec();
    start.push(ORDER_BYTE);
    let mut end = key.to_vec();
    end.push(ORDER_BYTE + 1);
    (start, end)
}

/// Absolutizes and lexically cleans a path: resolves `.` and `..` segments
/// and collapses separators without touching the filesystem.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Ordered associative store over absolute paths.
#[derive(Debug, Default)]
pub(crate) struct PathIndex {
    map: BTreeMap<Vec<u8>, EntryRef>,
}

impl PathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)] // Used by tests
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Looks up the entry at exactly `path`.
    pub fn get(&self, path: &Path) -> Option<&EntryRef> {
        self.map.get(&path_key(path))
    }

    /// Inserts `entry` unless an entry already occupies its path, in which
    /// case the existing entry is returned untouched and `entry` is dropped.
    pub fn insert(&mut self, entry: EntryRef) -> Option<EntryRef> {
        match self.map.entry(path_key(entry.path())) {
            std::collections::btree_map::Entry::Occupied(slot) => Some(slot.get().clone()),
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                None
            }
        }
    }

    /// Removes the entry at `path` and, when it is a directory, every entry
    /// underneath it, invoking `visitor` for each removed entry in walk
    /// order. Does nothing if `path` is absent.
    pub fn delete_subtree(&mut self, path: &Path, mut visitor: impl FnMut(&EntryRef)) {
        let key = path_key(path);
        let Some(root) = self.map.remove(&key) else {
            return;
        };
        visitor(&root);
        if !root.is_dir() {
            return;
        }
        let (start, end) = subtree_bounds(&key);
        let descendants: Vec<Vec<u8>> = self.map.range(start..end).map(|(k, _)| k.clone()).collect();
        for key in descendants {
            if let Some(entry) = self.map.remove(&key) {
                visitor(&entry);
            }
        }
    }

    /// Visits `root` and every non-ignored descendant in walk order.
    ///
    /// The visitor may return [`FlowControl::SkipDir`] to prune the
    /// directory it was just shown. Fails with the not-found error when
    /// `root` is absent or was rejected by the filter.
    pub fn walk(
        &self,
        root: &Path,
        mut visitor: impl FnMut(&EntryRef) -> FlowControl,
    ) -> Result<()> {
        let entry = self
            .get(root)
            .filter(|entry| !entry.is_ignored())
            .ok_or_else(|| WatchError::not_found(root))?;
        if visitor(entry) == FlowControl::SkipDir || !entry.is_dir() {
            return Ok(());
        }
        let (start, end) = subtree_bounds(&path_key(root));
        // Skipped subtrees are contiguous in key order, so one live skip
        // prefix at a time is enough.
        let mut skip: Option<Vec<u8>> = None;
        for (key, entry) in self.map.range(start..end) {
            if let Some(prefix) = &skip {
                if key.starts_with(prefix) {
                    continue;
                }
                skip = None;
            }
            if entry.is_ignored() {
                continue;
            }
            if visitor(entry) == FlowControl::SkipDir && entry.is_dir() {
                let mut prefix = key.clone();
                prefix.push(ORDER_BYTE);
                skip = Some(prefix);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, EntryFlags};
    use std::fs;
    use std::sync::Arc;

    struct Fixture {
        _temp: tempfile::TempDir,
        dir_meta: fs::Metadata,
        file_meta: fs::Metadata,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let file = temp.path().join("file");
            fs::File::create(&file).unwrap();
            let dir_meta = fs::symlink_metadata(temp.path()).unwrap();
            let file_meta = fs::symlink_metadata(&file).unwrap();
            Self {
                _temp: temp,
                dir_meta,
                file_meta,
            }
        }

        fn dir(&self, path: &str) -> EntryRef {
            Entry::new(PathBuf::from(path), &self.dir_meta)
        }

        fn file(&self, path: &str) -> EntryRef {
            Entry::new(PathBuf::from(path), &self.file_meta)
        }
    }

    fn collect(index: &PathIndex, root: &str) -> Vec<String> {
        let mut paths = Vec::new();
        index
            .walk(Path::new(root), |entry| {
                paths.push(entry.path().display().to_string());
                FlowControl::Continue
            })
            .unwrap();
        paths
    }

    #[test]
    fn insert_returns_existing_without_replacing() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        let first = fx.file("/r/a");
        assert!(index.insert(first.clone()).is_none());
        let existing = index.insert(fx.file("/r/a")).unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn get_misses_on_absent_path() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.file("/r/a"));
        assert!(index.get(Path::new("/r/a")).is_some());
        assert!(index.get(Path::new("/r/b")).is_none());
        assert!(index.get(Path::new("/r")).is_none());
    }

    #[test]
    fn walk_order_descends_before_siblings() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.dir("/r"));
        index.insert(fx.dir("/r/foo"));
        index.insert(fx.file("/r/foo/bar"));
        index.insert(fx.file("/r/foo.ext"));
        index.insert(fx.file("/r/zoo"));

        // "foo" descends fully before the sibling "foo.ext" is visited,
        // even though '.' < '/' in raw byte order.
        assert_eq!(
            collect(&index, "/r"),
            vec!["/r", "/r/foo", "/r/foo/bar", "/r/foo.ext", "/r/zoo"]
        );
    }

    #[test]
    fn walk_skips_ignored_entries() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.dir("/r"));
        let hidden = fx.file("/r/.secret");
        hidden.merge_flags(EntryFlags::IGNORED);
        index.insert(hidden);
        index.insert(fx.file("/r/visible"));

        assert_eq!(collect(&index, "/r"), vec!["/r", "/r/visible"]);
    }

    #[test]
    fn walk_errors_on_absent_or_ignored_root() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        let err = index.walk(Path::new("/nope"), |_| FlowControl::Continue);
        assert!(err.unwrap_err().is_not_found());

        let root = fx.dir("/r");
        root.merge_flags(EntryFlags::IGNORED);
        index.insert(root);
        let err = index.walk(Path::new("/r"), |_| FlowControl::Continue);
        assert!(err.unwrap_err().is_not_found());
    }

    #[test]
    fn walk_honors_skip_dir() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.dir("/r"));
        index.insert(fx.dir("/r/skip"));
        index.insert(fx.file("/r/skip/inner"));
        index.insert(fx.dir("/r/skip/nested"));
        index.insert(fx.file("/r/skip/nested/deep"));
        index.insert(fx.file("/r/tail"));

        let mut paths = Vec::new();
        index
            .walk(Path::new("/r"), |entry| {
                paths.push(entry.path().display().to_string());
                if entry.path().ends_with("skip") {
                    FlowControl::SkipDir
                } else {
                    FlowControl::Continue
                }
            })
            .unwrap();
        assert_eq!(paths, vec!["/r", "/r/skip", "/r/tail"]);
    }

    #[test]
    fn skip_dir_on_root_visits_nothing_else() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.dir("/r"));
        index.insert(fx.file("/r/a"));

        let mut count = 0;
        index
            .walk(Path::new("/r"), |_| {
                count += 1;
                FlowControl::SkipDir
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn delete_subtree_is_prefix_exact() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.dir("/r"));
        index.insert(fx.dir("/r/sub"));
        index.insert(fx.file("/r/sub/x"));
        index.insert(fx.file("/r/subx"));

        let mut removed = Vec::new();
        index.delete_subtree(Path::new("/r/sub"), |entry| {
            removed.push(entry.path().display().to_string());
        });

        // `/r/subx` shares the byte prefix but is not in the subtree.
        assert_eq!(removed, vec!["/r/sub", "/r/sub/x"]);
        assert!(index.get(Path::new("/r/subx")).is_some());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn delete_subtree_on_file_removes_only_it() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.dir("/r"));
        index.insert(fx.file("/r/a"));

        let mut removed = 0;
        index.delete_subtree(Path::new("/r/a"), |_| removed += 1);
        assert_eq!(removed, 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn delete_subtree_missing_path_is_noop() {
        let mut index = PathIndex::new();
        let mut called = false;
        index.delete_subtree(Path::new("/ghost"), |_| called = true);
        assert!(!called);
    }

    #[test]
    fn insertion_order_does_not_affect_walk_order() {
        let fx = Fixture::new();
        let mut index = PathIndex::new();
        index.insert(fx.file("/r/b"));
        index.insert(fx.dir("/r"));
        index.insert(fx.file("/r/a"));

        assert_eq!(collect(&index, "/r"), vec!["/r", "/r/a", "/r/b"]);
    }

    #[test]
    fn clean_path_resolves_dots() {
        assert_eq!(
            clean_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(clean_path(Path::new("/a//b/")), PathBuf::from("/a/b"));
        assert_eq!(clean_path(Path::new("/../x")), PathBuf::from("/x"));

        let relative = clean_path(Path::new("some/dir"));
        assert!(relative.is_absolute());
    }
}
