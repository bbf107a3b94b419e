use core::fmt;
use core::fmt::Display;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::str::FromStr;

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::process::Command;
use tokio::sync::Mutex;

// Whether this session records snapshots. In PLAYBACK the store is adopted
// as-is (or hydrated later) and mutations never commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Recording,
    Playback,
}

impl FromStr for SnapshotMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "RECORDING" => Ok(Self::Recording),
            "PLAYBACK" => Ok(Self::Playback),
            _ => bail!("unknown snapshot mode {:?}", s),
        }
    }
}

// An ID for referring to a commit in the snapshot store. Having one doesn't
// guarantee the commit still exists, you get error handling at use sites
// like with any mutable database.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..12]
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        OsStr::from_bytes(self.0.as_bytes())
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

trait OutputExt {
    // Fail with stderr in the message unless the command exited zero.
    fn ok(self) -> anyhow::Result<Output>;
}

impl OutputExt for Output {
    fn ok(self) -> anyhow::Result<Output> {
        if !self.status.success() {
            bail!(
                "exited with {}. stderr:\n{}\nstdout:\n{}",
                self.status,
                String::from_utf8_lossy(&self.stderr),
                String::from_utf8_lossy(&self.stdout)
            );
        }
        Ok(self)
    }
}

// Content-addressed snapshots of the workspace, stored in a plain git repo
// under <base_dir>/.git. Linear commits plus named branches, driven through
// the git binary.
#[derive(Debug)]
pub struct SnapshotEngine {
    base_dir: PathBuf,
    git_binary: PathBuf,
    // Serializes every operation that touches the store. The router handles
    // requests concurrently, and two concurrent stagings would trip over
    // git's index lock.
    op_lock: Mutex<()>,
}

impl SnapshotEngine {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            git_binary: PathBuf::from("git"),
            op_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn git<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.git_binary);
        cmd.current_dir(&self.base_dir);
        // Commits must not depend on whatever identity the host happens to
        // have configured.
        cmd.env("GIT_AUTHOR_NAME", "workroom")
            .env("GIT_AUTHOR_EMAIL", "workroom@localhost")
            .env("GIT_COMMITTER_NAME", "workroom")
            .env("GIT_COMMITTER_EMAIL", "workroom@localhost");
        cmd.args(args);
        cmd
    }

    async fn run_git<I, S>(&self, args: I) -> anyhow::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.git(args)
            .output()
            .await
            .context("spawning git")?
            .ok()
    }

    // RECORDING tears down any existing store and starts a fresh history.
    // PLAYBACK adopts an existing store if present, otherwise it is expected
    // to arrive via hydration.
    pub async fn initialize(&self, mode: SnapshotMode) -> anyhow::Result<()> {
        let _guard = self.op_lock.lock().await;
        match mode {
            SnapshotMode::Recording => {
                let git_dir = self.base_dir.join(".git");
                match tokio::fs::remove_dir_all(&git_dir).await {
                    Ok(()) => debug!("removed stale snapshot store at {:?}", git_dir),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).context("removing stale snapshot store"),
                }
                self.run_git(["init"]).await.context("'git init' failed")?;
                self.run_git(["add", "-A"]).await.context("staging workspace")?;
                // An empty workspace still gets a root commit, checkout and
                // reset need a HEAD to exist.
                self.run_git(["commit", "--allow-empty", "-m", "Initial commit"])
                    .await
                    .context("creating initial commit")?;
                info!("snapshot store initialized (RECORDING) in {:?}", self.base_dir);
            }
            SnapshotMode::Playback => {
                if tokio::fs::try_exists(self.base_dir.join(".git")).await? {
                    info!("adopting existing snapshot store in {:?}", self.base_dir);
                } else {
                    info!("no snapshot store yet in {:?}, expecting hydration", self.base_dir);
                }
            }
        }
        Ok(())
    }

    // Stages everything and commits. Returns None when the workspace hasn't
    // changed since the last snapshot, and always None in PLAYBACK.
    pub async fn commit_changes(
        &self,
        message: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        let _guard = self.op_lock.lock().await;
        self.commit_changes_locked(message, mode).await
    }

    async fn commit_changes_locked(
        &self,
        message: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<CommitHash>> {
        if mode == SnapshotMode::Playback {
            return Ok(None);
        }
        self.run_git(["add", "-A"]).await.context("staging changes")?;
        let status = self
            .run_git(["status", "--porcelain"])
            .await
            .context("checking for staged changes")?;
        if status.stdout.is_empty() {
            return Ok(None);
        }
        self.run_git(["commit", "-m", message])
            .await
            .context("'git commit' failed")?;
        self.head().await.map(Some)
    }

    pub async fn head(&self) -> anyhow::Result<CommitHash> {
        let output = self
            .run_git(["rev-parse", "HEAD"])
            .await
            .context("'git rev-parse HEAD' failed")?;
        let out_str = std::str::from_utf8(&output.stdout).context("non utf-8 rev-parse output")?;
        Ok(CommitHash::new(out_str.trim()))
    }

    // Discards uncommitted changes, then checks out the target, which can be
    // a commit hash or a branch name. Checking out the current HEAD twice is
    // a no-op after the first.
    pub async fn checkout_commit(&self, target: &str) -> anyhow::Result<()> {
        validate_ref(target)?;
        let _guard = self.op_lock.lock().await;
        self.run_git(["reset", "--hard", "HEAD"])
            .await
            .context("resetting working tree")?;
        self.run_git(["checkout", target])
            .await
            .with_context(|| format!("checking out {:?}", target))?;
        Ok(())
    }

    pub async fn create_branch_and_checkout(&self, hash: &str, name: &str) -> anyhow::Result<()> {
        validate_ref(hash)?;
        validate_ref(name)?;
        let _guard = self.op_lock.lock().await;
        self.run_git(["reset", "--hard", "HEAD"])
            .await
            .context("resetting working tree")?;
        self.run_git(["checkout", hash])
            .await
            .with_context(|| format!("checking out {:?}", hash))?;
        self.run_git(["checkout", "-b", name])
            .await
            .with_context(|| format!("creating branch {:?}", name))?;
        Ok(())
    }

    // Preserves the session tail as a named branch so a RECORDING session
    // survives the Worker going away. No-op in PLAYBACK.
    pub async fn save_branch(
        &self,
        timestamp: &str,
        mode: SnapshotMode,
    ) -> anyhow::Result<Option<String>> {
        if mode == SnapshotMode::Playback {
            return Ok(None);
        }
        let _guard = self.op_lock.lock().await;
        self.commit_changes_locked("Save branch", mode)
            .await
            .context("committing before branch save")?;
        let name = format!("save-{timestamp}");
        validate_ref(&name)?;
        self.run_git(["branch", &name])
            .await
            .with_context(|| format!("creating branch {:?}", name))?;
        Ok(Some(name))
    }
}

// Refs and branch names arrive straight from client payloads and end up on
// a git command line, where a leading dash would parse as an option. Only
// plain hash/branch shapes get through.
fn validate_ref(ref_name: &str) -> anyhow::Result<()> {
    let ok = !ref_name.is_empty()
        && !ref_name.starts_with('-')
        && ref_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if !ok {
        bail!("invalid ref name {:?}", ref_name);
    }
    Ok(())
}

#[cfg(test)]
pub mod test_utils {
    use tempfile::TempDir;

    use super::*;

    // A workspace directory with a fresh RECORDING store, torn down on drop.
    pub struct TempWorkspace {
        pub temp_dir: TempDir,
        pub engine: SnapshotEngine,
    }

    impl TempWorkspace {
        pub async fn new() -> anyhow::Result<Self> {
            let temp_dir = TempDir::with_prefix("workspace-").expect("couldn't make tempdir");
            let engine = SnapshotEngine::new(temp_dir.path());
            engine.initialize(SnapshotMode::Recording).await?;
            Ok(Self { temp_dir, engine })
        }

        pub fn write(&self, name: &str, content: &str) {
            std::fs::write(self.temp_dir.path().join(name), content).expect("couldn't write file");
        }

        pub fn read(&self, name: &str) -> String {
            std::fs::read_to_string(self.temp_dir.path().join(name)).expect("couldn't read file")
        }
    }
}
