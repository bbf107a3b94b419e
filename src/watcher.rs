use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
#[allow(unused_imports)]
use log::{debug, info, warn};
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::sandbox::Sandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    AddDir,
    Change,
    Unlink,
    UnlinkDir,
    Rename,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::AddDir => "addDir",
            Self::Change => "change",
            Self::Unlink => "unlink",
            Self::UnlinkDir => "unlinkDir",
            Self::Rename => "rename",
        }
    }
}

// A change in the workspace, with the path re-expressed virtually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
}

struct WatchEntry {
    is_explicit: bool,
    file_ref_count: usize,
}

struct Registry {
    // None after close().
    watcher: Option<RecommendedWatcher>,
    entries: HashMap<PathBuf, WatchEntry>,
}

// Watches workspace directories, one non-recursive watch per directory.
// A directory stays watched while a client has it expanded (is_explicit)
// or while any of its files are open (file_ref_count). The workspace root
// is pinned and never removed.
pub struct WorkspaceWatcher {
    sandbox: Sandbox,
    registry: Mutex<Registry>,
    // Handed to the event loop on its first (only) start.
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<notify::Event>>>,
}

impl WorkspaceWatcher {
    pub fn new(sandbox: Sandbox) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        // The notify crate runs the callback on its own thread, an unbounded
        // send is the bridge into async land (the event loop drains).
        let watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => warn!("watcher backend error: {}", err),
            },
            Config::default(),
        )
        .context("creating filesystem watcher")?;

        Ok(Self {
            sandbox,
            registry: Mutex::new(Registry {
                watcher: Some(watcher),
                entries: HashMap::new(),
            }),
            events_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn watch(&self, virtual_path: &str) -> anyhow::Result<()> {
        let physical = self.sandbox.resolve(virtual_path)?;
        let mut registry = self.registry.lock();
        registry.register(&physical)?.is_explicit = true;
        Ok(())
    }

    pub fn unwatch(&self, virtual_path: &str) -> anyhow::Result<()> {
        let physical = self.sandbox.resolve(virtual_path)?;
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.entries.get_mut(&physical) {
            entry.is_explicit = false;
        }
        registry.maybe_drop(&physical, self.sandbox.base_dir());
        Ok(())
    }

    // Watching an open file means watching its parent directory.
    pub fn add_file_reference(&self, file_virtual_path: &str) -> anyhow::Result<()> {
        let parent = self.parent_of(file_virtual_path)?;
        let mut registry = self.registry.lock();
        registry.register(&parent)?.file_ref_count += 1;
        Ok(())
    }

    pub fn remove_file_reference(&self, file_virtual_path: &str) -> anyhow::Result<()> {
        let parent = self.parent_of(file_virtual_path)?;
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.entries.get_mut(&parent) {
            entry.file_ref_count = entry.file_ref_count.saturating_sub(1);
        }
        registry.maybe_drop(&parent, self.sandbox.base_dir());
        Ok(())
    }

    fn parent_of(&self, file_virtual_path: &str) -> anyhow::Result<PathBuf> {
        let physical = self.sandbox.resolve(file_virtual_path)?;
        Ok(physical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.sandbox.base_dir().to_path_buf()))
    }

    pub fn is_watched(&self, virtual_path: &str) -> bool {
        match self.sandbox.resolve(virtual_path) {
            Ok(physical) => self.registry.lock().entries.contains_key(&physical),
            Err(_) => false,
        }
    }

    // Drains the notification channel and hands each normalized event to
    // on_event. Only the first call starts anything, later calls are no-ops
    // (init can arrive again after a Bridge reconnect).
    pub fn start_event_loop(&self, on_event: impl Fn(ChangeEvent) + Send + 'static) {
        let Some(mut rx) = self.events_rx.lock().take() else {
            debug!("watcher event loop already running");
            return;
        };
        let sandbox = self.sandbox.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for change in normalize(&sandbox, event) {
                    on_event(change);
                }
            }
            debug!("watcher event loop exited");
        });
    }

    pub fn close(&self) {
        let mut registry = self.registry.lock();
        // Dropping the backend stops the notify thread, which drops the
        // channel sender, which ends the event loop.
        registry.watcher = None;
        registry.entries.clear();
    }
}

impl Registry {
    // Registers the path with the backend the first time it's seen.
    fn register(&mut self, physical: &Path) -> anyhow::Result<&mut WatchEntry> {
        if !self.entries.contains_key(physical) {
            if let Some(watcher) = self.watcher.as_mut() {
                watcher
                    .watch(physical, RecursiveMode::NonRecursive)
                    .with_context(|| format!("watching {:?}", physical))?;
            }
            self.entries.insert(
                physical.to_path_buf(),
                WatchEntry {
                    is_explicit: false,
                    file_ref_count: 0,
                },
            );
        }
        // Just inserted if missing.
        Ok(self.entries.get_mut(physical).unwrap())
    }

    fn maybe_drop(&mut self, physical: &Path, base_dir: &Path) {
        let droppable = match self.entries.get(physical) {
            Some(entry) => !entry.is_explicit && entry.file_ref_count == 0 && physical != base_dir,
            None => false,
        };
        if droppable {
            if let Some(watcher) = self.watcher.as_mut() {
                // The path may already be gone from disk, nothing to do then.
                if let Err(err) = watcher.unwatch(physical) {
                    debug!("unwatching {:?}: {}", physical, err);
                }
            }
            self.entries.remove(physical);
        }
    }
}

fn normalize(sandbox: &Sandbox, event: notify::Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(CreateKind::Folder) => ChangeKind::AddDir,
        EventKind::Create(_) => ChangeKind::Add,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => ChangeKind::Change,
        EventKind::Remove(RemoveKind::Folder) => ChangeKind::UnlinkDir,
        EventKind::Remove(_) => ChangeKind::Unlink,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .map(|path| {
            // Creates can be reported as Create(Any), fall back to a stat to
            // tell files from directories while the path still exists.
            let kind = match kind {
                ChangeKind::Add if path.is_dir() => ChangeKind::AddDir,
                other => other,
            };
            ChangeEvent {
                kind,
                path: sandbox.virtualize(path),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use googletest::prelude::*;
    use parking_lot::Mutex as SyncMutex;
    use tempfile::TempDir;

    use super::*;

    struct Fixture {
        tmp_dir: TempDir,
        watcher: WorkspaceWatcher,
    }

    fn fixture() -> Fixture {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        let watcher = WorkspaceWatcher::new(Sandbox::new(tmp_dir.path())).unwrap();
        Fixture { tmp_dir, watcher }
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn explicit_watch_then_unwatch_drops_entry() {
        let fx = fixture();
        std::fs::create_dir(fx.tmp_dir.path().join("sub")).unwrap();

        fx.watcher.watch("/workspace/sub").unwrap();
        assert!(fx.watcher.is_watched("/workspace/sub"));
        fx.watcher.unwatch("/workspace/sub").unwrap();
        assert!(!fx.watcher.is_watched("/workspace/sub"));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn file_references_keep_directory_watched() {
        let fx = fixture();
        std::fs::create_dir(fx.tmp_dir.path().join("sub")).unwrap();
        std::fs::write(fx.tmp_dir.path().join("sub/a.txt"), "x").unwrap();

        fx.watcher.watch("/workspace/sub").unwrap();
        fx.watcher.add_file_reference("/workspace/sub/a.txt").unwrap();
        fx.watcher.add_file_reference("/workspace/sub/a.txt").unwrap();

        // Still referenced twice after the explicit watch goes away.
        fx.watcher.unwatch("/workspace/sub").unwrap();
        assert!(fx.watcher.is_watched("/workspace/sub"));

        fx.watcher.remove_file_reference("/workspace/sub/a.txt").unwrap();
        assert!(fx.watcher.is_watched("/workspace/sub"));
        fx.watcher.remove_file_reference("/workspace/sub/a.txt").unwrap();
        assert!(!fx.watcher.is_watched("/workspace/sub"));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn refcount_floors_at_zero() {
        let fx = fixture();
        std::fs::write(fx.tmp_dir.path().join("a.txt"), "x").unwrap();

        fx.watcher.watch("/workspace").unwrap();
        // A stray decrement must not underflow or drop the root.
        fx.watcher.remove_file_reference("/workspace/a.txt").unwrap();
        assert!(fx.watcher.is_watched("/workspace"));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn base_dir_is_never_dropped() {
        let fx = fixture();
        fx.watcher.watch("/workspace").unwrap();
        fx.watcher.unwatch("/workspace").unwrap();
        // Cleared the explicit flag, but the root stays in the watch set.
        assert!(fx.watcher.is_watched("/workspace"));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn events_are_normalized_and_virtualized() {
        let fx = fixture();
        let seen: Arc<SyncMutex<Vec<ChangeEvent>>> = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();

        fx.watcher.watch("/workspace").unwrap();
        fx.watcher.start_event_loop(move |event| sink.lock().push(event));

        std::fs::write(fx.tmp_dir.path().join("new.txt"), "x").unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let matched = seen.lock().iter().any(|e| {
                    e.path == "/workspace/new.txt"
                        && matches!(e.kind, ChangeKind::Add | ChangeKind::Change)
                });
                if matched {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("no watch event for created file");
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn second_event_loop_start_is_a_noop() {
        let fx = fixture();
        fx.watcher.start_event_loop(|_| {});
        // Would panic on unwrap of the taken receiver if this re-spawned.
        fx.watcher.start_event_loop(|_| {});
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn close_tears_down_the_watch_set() {
        let fx = fixture();
        fx.watcher.watch("/workspace").unwrap();
        fx.watcher.close();
        assert!(!fx.watcher.is_watched("/workspace"));
    }

    #[googletest::test]
    fn change_kind_wire_names() {
        expect_that!(ChangeKind::AddDir.as_str(), eq("addDir"));
        expect_that!(ChangeKind::UnlinkDir.as_str(), eq("unlinkDir"));
        expect_that!(ChangeKind::Rename.as_str(), eq("rename"));
    }
}
