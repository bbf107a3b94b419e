use std::os::unix::fs::{DirBuilderExt as _, OpenOptionsExt as _};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
#[allow(unused_imports)]
use log::{debug, warn};

use crate::proto::{DirectoryEntry, EntryKind};
use crate::sandbox::Sandbox;
use crate::snapshot::{CommitHash, SnapshotEngine, SnapshotMode};

// CRUD over the sandboxed workspace. Every mutation that succeeds is
// snapshotted; a commit failure after a successful file operation is
// surfaced to the caller, the file change is not rolled back.
#[derive(Clone)]
pub struct FsService {
    sandbox: Sandbox,
    snapshots: Arc<SnapshotEngine>,
}

impl FsService {
    pub fn new(sandbox: Sandbox, snapshots: Arc<SnapshotEngine>) -> Self {
        Self { sandbox, snapshots }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub async fn read_folder(&self, virtual_path: &str) -> anyhow::Result<Vec<DirectoryEntry>> {
        let physical = self.sandbox.resolve(virtual_path)?;
        let mut read_dir = tokio::fs::read_dir(&physical)
            .await
            .with_context(|| format!("reading directory {:?}", virtual_path))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Snapshot metadata is an implementation detail, clients never
            // see it.
            if name == ".git" {
                continue;
            }
            let kind = if entry.file_type().await?.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(DirectoryEntry {
                kind,
                path: self.sandbox.virtualize(&entry.path()),
                name,
            });
        }
        Ok(entries)
    }

    pub async fn read_file(&self, virtual_path: &str) -> anyhow::Result<String> {
        let physical = self.sandbox.resolve(virtual_path)?;
        let bytes = tokio::fs::read(&physical)
            .await
            .with_context(|| format!("reading {:?}", virtual_path))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn create_file(
        &self,
        virtual_path: &str,
        content: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        let physical = self.sandbox.resolve(virtual_path)?;
        write_0644(&physical, content.as_bytes())
            .await
            .with_context(|| format!("creating {:?}", virtual_path))?;
        self.commit(&format!("Create {virtual_path}"), mode).await
    }

    // Hydration path: payloads arrive base64 so binary content survives the
    // JSON transport, and parent directories may not exist yet.
    pub async fn create_file_base64(
        &self,
        virtual_path: &str,
        content_base64: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        let decoded = BASE64
            .decode(content_base64)
            .with_context(|| format!("decoding base64 content for {:?}", virtual_path))?;
        let physical = self.sandbox.resolve(virtual_path)?;
        if let Some(parent) = physical.parent() {
            mkdir_all_0755(parent)
                .await
                .with_context(|| format!("creating parent directories for {:?}", virtual_path))?;
        }
        write_0644(&physical, &decoded)
            .await
            .with_context(|| format!("writing {:?}", virtual_path))?;
        self.commit(&format!("Hydrate {virtual_path}"), mode).await
    }

    pub async fn update_file(
        &self,
        virtual_path: &str,
        content: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        let physical = self.sandbox.resolve(virtual_path)?;
        write_0644(&physical, content.as_bytes())
            .await
            .with_context(|| format!("updating {:?}", virtual_path))?;
        self.commit(&format!("Update {virtual_path}"), mode).await
    }

    pub async fn create_folder(
        &self,
        virtual_path: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        let physical = self.sandbox.resolve(virtual_path)?;
        mkdir_all_0755(&physical)
            .await
            .with_context(|| format!("creating folder {:?}", virtual_path))?;
        self.commit(&format!("Create folder {virtual_path}"), mode).await
    }

    pub async fn delete_resource(
        &self,
        virtual_path: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        let physical = self.sandbox.resolve(virtual_path)?;
        if physical == self.sandbox.base_dir() {
            bail!("refusing to delete the workspace root");
        }
        let meta = tokio::fs::symlink_metadata(&physical)
            .await
            .with_context(|| format!("deleting {:?}", virtual_path))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&physical).await
        } else {
            tokio::fs::remove_file(&physical).await
        }
        .with_context(|| format!("deleting {:?}", virtual_path))?;
        self.commit(&format!("Delete {virtual_path}"), mode).await
    }

    pub async fn move_resource(
        &self,
        old_virtual: &str,
        new_virtual: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        let old_physical = self.sandbox.resolve(old_virtual)?;
        let new_physical = self.sandbox.resolve(new_virtual)?;
        if let Some(parent) = new_physical.parent() {
            mkdir_all_0755(parent)
                .await
                .with_context(|| format!("creating parent directories for {:?}", new_virtual))?;
        }
        tokio::fs::rename(&old_physical, &new_physical)
            .await
            .with_context(|| format!("moving {:?} to {:?}", old_virtual, new_virtual))?;
        self.commit(&format!("Move {old_virtual} to {new_virtual}"), mode)
            .await
    }

    async fn commit(&self, message: &str, mode: SnapshotMode) -> anyhow::Result<Option<CommitHash>> {
        self.snapshots
            .commit_changes(message, mode)
            .await
            .with_context(|| format!("snapshotting after {:?}", message))
    }
}

async fn write_0644(physical: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt as _;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o644);
    let mut file = tokio::fs::OpenOptions::from(options).open(physical).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

// tokio's DirBuilder can't be built from the std one, so the mkdir hops
// onto the blocking pool the same way tokio::fs does internally.
async fn mkdir_all_0755(physical: &Path) -> std::io::Result<()> {
    let physical = physical.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o755);
        builder.create(physical)
    })
    .await;
    match result {
        Ok(result) => result,
        Err(join_err) => Err(std::io::Error::other(join_err)),
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::snapshot::test_utils::TempWorkspace;

    struct Fixture {
        ws: TempWorkspace,
        fs: FsService,
    }

    async fn fixture() -> Fixture {
        let ws = TempWorkspace::new().await.unwrap();
        let sandbox = Sandbox::new(ws.temp_dir.path());
        let engine = Arc::new(SnapshotEngine::new(ws.temp_dir.path()));
        Fixture {
            fs: FsService::new(sandbox, engine),
            ws,
        }
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn create_then_read_roundtrip() {
        let fx = fixture().await;
        let hash = fx
            .fs
            .create_file("/workspace/a.txt", "hello\n", SnapshotMode::Recording)
            .await
            .unwrap();
        expect_that!(hash, some(anything()));
        assert_eq!(fx.fs.read_file("/workspace/a.txt").await.unwrap(), "hello\n");
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn base64_roundtrip_creates_parents() {
        let fx = fixture().await;
        let encoded = BASE64.encode("hi\n");
        assert_eq!(encoded, "aGkK");

        fx.fs
            .create_file_base64("/workspace/docs/readme.md", &encoded, SnapshotMode::Recording)
            .await
            .unwrap();
        assert_eq!(
            fx.fs.read_file("/workspace/docs/readme.md").await.unwrap(),
            "hi\n"
        );

        let listing = fx.fs.read_folder("/workspace/docs").await.unwrap();
        expect_that!(
            listing,
            contains(all!(
                field!(DirectoryEntry.name, eq("readme.md")),
                field!(DirectoryEntry.kind, eq(&EntryKind::File)),
                field!(DirectoryEntry.path, eq("/workspace/docs/readme.md")),
            ))
        );
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn listing_hides_snapshot_store() {
        let fx = fixture().await;
        fx.fs
            .create_file("/workspace/a.txt", "x", SnapshotMode::Recording)
            .await
            .unwrap();
        let listing = fx.fs.read_folder("/workspace").await.unwrap();
        expect_that!(listing, not(contains(field!(DirectoryEntry.name, eq(".git")))));
        expect_that!(listing, contains(field!(DirectoryEntry.name, eq("a.txt"))));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn move_resource_relocates_into_new_parent() {
        let fx = fixture().await;
        fx.fs
            .create_file("/workspace/a.txt", "body", SnapshotMode::Recording)
            .await
            .unwrap();
        fx.fs
            .move_resource("/workspace/a.txt", "/workspace/sub/a.txt", SnapshotMode::Recording)
            .await
            .unwrap();

        assert_eq!(fx.fs.read_file("/workspace/sub/a.txt").await.unwrap(), "body");
        expect_that!(fx.fs.read_file("/workspace/a.txt").await, err(anything()));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn delete_resource_is_recursive() {
        let fx = fixture().await;
        fx.fs
            .create_file_base64("/workspace/dir/deep/f.txt", &BASE64.encode("x"), SnapshotMode::Recording)
            .await
            .unwrap();
        fx.fs
            .delete_resource("/workspace/dir", SnapshotMode::Recording)
            .await
            .unwrap();
        expect_that!(fx.fs.read_folder("/workspace/dir").await, err(anything()));
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn mutations_in_playback_produce_no_commits() {
        let fx = fixture().await;
        let hash = fx
            .fs
            .create_file("/workspace/a.txt", "x", SnapshotMode::Playback)
            .await
            .unwrap();
        expect_that!(hash, none());
    }

    #[googletest::test]
    #[test_log::test(tokio::test)]
    async fn sandbox_escape_is_rejected_without_touching_disk() {
        let fx = fixture().await;
        expect_that!(
            fx.fs
                .create_file("/workspace/../evil.txt", "x", SnapshotMode::Recording)
                .await,
            err(anything())
        );
        assert!(!fx.ws.temp_dir.path().parent().unwrap().join("evil.txt").exists());
    }
}
