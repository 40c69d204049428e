//! End-to-end watcher scenarios against a real temporary tree.
//!
//! Each test drives the filesystem, waits for the event stream to go
//! quiet, and compares the recorded events against the expected sequence.
//! Modify events are marked optional where platforms legitimately differ
//! on whether one fires.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use fswatch::{Callbacks, Event, RecursiveMode, WatchError, Watcher};

/// Gap between filesystem steps so event batches stay ordered.
const SETTLE: Duration = Duration::from_millis(150);
/// Silence that counts as "the stream went quiet".
const QUIET: Duration = Duration::from_millis(400);
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

struct Expected {
    event: Event,
    path: PathBuf,
    optional: bool,
}

struct TestEnv {
    watcher: Watcher,
    root: PathBuf,
    _temp: tempfile::TempDir,
    events: Receiver<(Event, PathBuf)>,
    errors: Receiver<String>,
    expect: Vec<Expected>,
}

impl TestEnv {
    fn new() -> Self {
        let temp = tempfile::Builder::new()
            .prefix("fswatch-test")
            .tempdir()
            .unwrap();
        let root = temp.path().canonicalize().unwrap();
        let (event_tx, events) = unbounded();
        let (error_tx, errors) = unbounded();
        let callbacks = Callbacks::new()
            .on_event(move |event, entry| {
                let _ = event_tx.send((event, entry.path().to_path_buf()));
            })
            .on_error(move |err| {
                let _ = error_tx.send(err.to_string());
            });
        let watcher = Watcher::new(callbacks).unwrap();
        watcher.load(&root, RecursiveMode::Recursive).unwrap();
        Self {
            watcher,
            root,
            _temp: temp,
            events,
            errors,
            expect: Vec::new(),
        }
    }

    fn settle(&self) {
        thread::sleep(SETTLE);
    }

    fn expect(&mut self, event: Event, path: &Path, optional: bool) {
        self.expect.push(Expected {
            event,
            path: path.to_path_buf(),
            optional,
        });
    }

    /// Creates a file, writes to it, syncs, closes. Expects Create plus an
    /// optional Modify (the close-write may or may not be distinct).
    fn create_write_close(&mut self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        self.write_file(&path);
        self.expect(Event::Create, &path, false);
        self.expect(Event::Modify, &path, true);
        path
    }

    /// Rewrites an existing file. Expects an optional Modify.
    fn open_write_close(&mut self, path: &Path) {
        self.write_file(path);
        self.expect(Event::Modify, path, true);
    }

    fn write_file(&self, path: &Path) {
        let mut file = File::create(path).unwrap();
        writeln!(file, "hello world").unwrap();
        file.sync_all().unwrap();
    }

    fn mkdir(&mut self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir(&path).unwrap();
        self.expect(Event::Create, &path, false);
        path
    }

    fn remove(&mut self, path: &Path) {
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
        self.expect(Event::Delete, path, false);
    }

    /// Drains events until the stream goes quiet, then matches them against
    /// the expected sequence, skipping unmatched optional entries.
    fn check(self) {
        let mut received = Vec::new();
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while let Ok(event) = self.events.recv_timeout(QUIET) {
            received.push(event);
            if Instant::now() > deadline {
                break;
            }
        }
        let errors: Vec<String> = self.errors.try_iter().collect();
        assert!(errors.is_empty(), "unexpected watcher errors: {errors:?}");

        let mut skipped = 0usize;
        for (i, expected) in self.expect.iter().enumerate() {
            match received.get(i - skipped) {
                Some((event, path)) if *event == expected.event && *path == expected.path => {}
                _ if expected.optional => skipped += 1,
                Some((event, path)) => panic!(
                    "expected {} {:?}, got {} {:?}",
                    expected.event, expected.path, event, path
                ),
                None => panic!("expected {} {:?}, got nothing", expected.event, expected.path),
            }
        }
        let consumed = self.expect.len() - skipped;
        assert!(
            received.len() <= consumed,
            "unexpected trailing events: {:?}",
            &received[consumed..]
        );
    }
}

#[test]
fn basic_lifecycle() {
    let mut env = TestEnv::new();
    let root = env.root.clone();

    let file1 = env.create_write_close(&root, "file1");
    env.settle();
    env.remove(&file1);
    env.settle();
    env.create_write_close(&root, "file1");
    env.settle();
    env.open_write_close(&file1);
    env.settle();
    env.remove(&file1);
    env.settle();

    // After unloading, tearing the tree down is invisible.
    env.watcher
        .unload(&root, RecursiveMode::NonRecursive)
        .unwrap();
    fs::remove_dir_all(&root).unwrap();
    env.settle();
    env.watcher.close().unwrap();
    env.settle();
    env.check();
}

#[test]
fn rename_directory() {
    let mut env = TestEnv::new();
    let root = env.root.clone();

    let dir = env.mkdir(&root, "foo");
    env.settle();
    let file = env.create_write_close(&dir, "file");
    env.settle();

    let newdir = root.join("bar");
    fs::rename(&dir, &newdir).unwrap();
    let newfile = newdir.join("file");
    if cfg!(any(target_os = "linux", target_os = "windows")) {
        env.expect(Event::Delete, &dir, false);
        env.expect(Event::Delete, &file, false);
        env.expect(Event::Create, &newdir, false);
        env.expect(Event::Create, &newfile, false);
    } else {
        env.expect(Event::Create, &newdir, false);
        env.expect(Event::Create, &newfile, false);
        env.expect(Event::Delete, &dir, false);
        env.expect(Event::Delete, &file, false);
    }
    env.settle();
    env.watcher.close().unwrap();
    env.settle();
    env.check();
}

#[test]
fn nested_directories() {
    let mut env = TestEnv::new();
    let root = env.root.clone();

    let dir1 = env.mkdir(&root, "dir1");
    env.settle();
    let dir2 = env.mkdir(&dir1, "dir2");
    env.settle();
    env.remove(&dir2);
    env.settle();
    env.remove(&dir1);
    env.settle();
    env.check();
}

#[test]
fn independent_subroots_survive_parent_unload() {
    let mut env = TestEnv::new();
    let root = env.root.clone();

    let dir1 = env.mkdir(&root, "dir1");
    let dir2 = env.mkdir(&root, "dir2");
    env.settle();
    env.watcher.load(&dir1, RecursiveMode::Recursive).unwrap();
    env.watcher.load(&dir2, RecursiveMode::NonRecursive).unwrap();
    env.settle();

    // Non-recursive unload of the containing root must not disarm the
    // independently loaded sub-roots.
    env.watcher
        .unload(&root, RecursiveMode::NonRecursive)
        .unwrap();
    env.settle();

    let file1 = env.create_write_close(&dir1, "file1");
    env.settle();
    let file2 = env.create_write_close(&dir2, "file2");
    env.settle();
    env.remove(&file1);
    env.remove(&file2);
    env.settle();
    env.remove(&dir1);
    env.remove(&dir2);
    env.settle();
    env.check();
}

#[test]
fn close_is_fast_and_idempotent_failing() {
    let env = TestEnv::new();
    env.watcher
        .unload(&env.root, RecursiveMode::NonRecursive)
        .unwrap();

    let start = Instant::now();
    env.watcher.close().unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "close blocked for {:?}",
        start.elapsed()
    );

    thread::sleep(SETTLE);
    match env.watcher.close() {
        Err(WatchError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    match env.watcher.load(&env.root, RecursiveMode::Recursive) {
        Err(WatchError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }
    env.check();
}

#[cfg(unix)]
#[test]
fn dangling_symlink_is_observed_not_followed() {
    let mut env = TestEnv::new();
    let root = env.root.clone();

    let link = root.join("link");
    std::os::unix::fs::symlink(root.join("none"), &link).unwrap();
    env.expect(Event::Create, &link, false);
    env.settle();
    env.check();
}

#[test]
fn load_rejects_files() {
    let env = TestEnv::new();
    let file = env.root.join("plain");
    env.write_file(&file);
    thread::sleep(SETTLE);

    match env.watcher.load(&file, RecursiveMode::Recursive) {
        Err(WatchError::NotDirectory(path)) => assert_eq!(path, file),
        other => panic!("expected NotDirectory, got {other:?}"),
    }
}

#[test]
fn filtered_paths_emit_nothing_and_stay_invisible() {
    let env = TestEnv::new();
    let hidden = env.root.join(".hidden");
    env.write_file(&hidden);
    thread::sleep(SETTLE);

    // No Create was emitted and the entry is invisible to queries.
    assert!(env.events.try_iter().next().is_none());
    assert!(env.watcher.get(&hidden).is_none());
    match env.watcher.lstat(&hidden) {
        Err(err) if err.is_not_found() => {}
        other => panic!("expected not-found, got {other:?}"),
    }
    env.check();
}

#[test]
fn get_and_lstat_answer_from_cache() {
    let env = TestEnv::new();
    let file = env.root.join("cached.txt");
    env.write_file(&file);
    thread::sleep(SETTLE);

    let entry = env.watcher.get(&file).expect("entry should be cached");
    assert!(entry.is_file());
    assert_eq!(entry.path(), file);

    let entry = env.watcher.lstat(&env.root).unwrap();
    assert!(entry.is_dir());

    // Drain the create/modify noise this test produced.
    for _ in env.events.try_iter() {}
}

#[test]
fn load_unload_round_trip_forgets_the_subtree() {
    let env = TestEnv::new();
    let root = env.root.clone();
    let sub = root.join("sub");
    fs::create_dir(&sub).unwrap();
    env.write_file(&sub.join("file"));
    thread::sleep(SETTLE);

    assert!(env.watcher.get(&sub).is_some());
    env.watcher.unload(&root, RecursiveMode::Recursive).unwrap();

    match env.watcher.traverse(&root, |_| fswatch::FlowControl::Continue) {
        Err(err) if err.is_not_found() => {}
        other => panic!("expected not-found after unload, got {other:?}"),
    }
    assert!(env.watcher.get(&sub).is_none());
    for _ in env.events.try_iter() {}
}

#[test]
fn recursive_load_is_idempotent() {
    let env = TestEnv::new();
    let root = env.root.clone();
    fs::create_dir(root.join("a")).unwrap();
    env.write_file(&root.join("a/one"));
    thread::sleep(SETTLE);
    for _ in env.events.try_iter() {}

    let count_entries = |watcher: &Watcher| {
        let mut count = 0;
        watcher
            .traverse(&root, |_| {
                count += 1;
                fswatch::FlowControl::Continue
            })
            .unwrap();
        count
    };
    let before = count_entries(&env.watcher);
    env.watcher.load(&root, RecursiveMode::Recursive).unwrap();
    thread::sleep(SETTLE);

    assert_eq!(count_entries(&env.watcher), before);
    assert!(
        env.events.try_iter().next().is_none(),
        "re-load must not re-emit events for existing content"
    );
}
