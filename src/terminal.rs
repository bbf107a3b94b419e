use std::collections::HashMap;
use std::os::fd::{AsFd as _, AsRawFd as _, OwnedFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context as _;
#[allow(unused_imports)]
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// PTY-backed shells, keyed by a client-supplied id. Sessions die when the
// client closes them or when the reader pump sees the shell go away,
// whichever happens first.
#[derive(Clone)]
pub struct PtyManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: Mutex<HashMap<String, PtySession>>,
}

struct PtySession {
    master: Arc<AsyncFd<OwnedFd>>,
    child: Child,
    ct: CancellationToken,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    // Returns the existing session when id is already live. An empty id gets
    // a freshly minted one. Otherwise: spawn bash on a new pty pair in cwd,
    // and pump everything the master produces into on_data until the first
    // read error (EOF included), which tears the session down.
    //
    // Must run inside the tokio runtime (the shell is a tokio child process).
    pub fn create_or_get(
        &self,
        id: &str,
        cwd: &Path,
        on_data: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> anyhow::Result<String> {
        let mut sessions = self.inner.sessions.lock();
        if !id.is_empty() && sessions.contains_key(id) {
            return Ok(id.to_owned());
        }
        let id = if id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            id.to_owned()
        };

        let pty = nix::pty::openpty(None, None).context("openpty failed")?;
        // The reader and writer both go through AsyncFd, which needs the fd
        // nonblocking.
        fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("setting pty master nonblocking")?;

        let mut cmd = Command::new("bash");
        cmd.current_dir(cwd)
            .env("TERM", "xterm-256color")
            .stdin(Stdio::from(pty.slave.try_clone().context("duplicating pty slave")?))
            .stdout(Stdio::from(pty.slave.try_clone().context("duplicating pty slave")?))
            .stderr(Stdio::from(pty.slave))
            .kill_on_drop(true);
        // Make the shell a session leader with the pty slave (its fd 0) as
        // controlling terminal, otherwise job control inside it is broken.
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn().context("failed to start shell")?;

        let master = Arc::new(
            AsyncFd::with_interest(pty.master, Interest::READABLE | Interest::WRITABLE)
                .context("registering pty master")?,
        );
        let ct = CancellationToken::new();
        sessions.insert(
            id.clone(),
            PtySession {
                master: master.clone(),
                child,
                ct: ct.clone(),
            },
        );
        drop(sessions);

        let inner = self.inner.clone();
        let reader_id = id.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    guard = master.readable() => {
                        let mut guard = match guard {
                            Ok(guard) => guard,
                            Err(_) => break,
                        };
                        match nix::unistd::read(master.get_ref().as_raw_fd(), &mut buf) {
                            Ok(0) => break,
                            // The callback gets its own copy, the buffer is
                            // reused on the next read.
                            Ok(n) => on_data(buf[..n].to_vec()),
                            Err(Errno::EAGAIN) => guard.clear_ready(),
                            // EIO is how a pty reports the shell exiting.
                            Err(_) => break,
                        }
                    }
                }
            }
            debug!("terminal {} reader exited", reader_id);
            inner.close(&reader_id);
        });

        Ok(id)
    }

    pub async fn write(&self, id: &str, data: &[u8]) -> anyhow::Result<()> {
        let master = self
            .inner
            .sessions
            .lock()
            .get(id)
            .map(|session| session.master.clone())
            .with_context(|| format!("terminal not found: {id}"))?;

        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = master
                .writable()
                .await
                .context("waiting for pty writability")?;
            match nix::unistd::write(master.get_ref().as_fd(), remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(Errno::EAGAIN) => guard.clear_ready(),
                Err(e) => return Err(e).with_context(|| format!("writing to terminal {id}")),
            }
        }
        Ok(())
    }

    pub fn close(&self, id: &str) {
        self.inner.close(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.sessions.lock().contains_key(id)
    }
}

impl Inner {
    fn close(&self, id: &str) {
        if let Some(mut session) = self.sessions.lock().remove(id) {
            session.ct.cancel();
            let _ = session.child.start_kill();
            debug!("terminal {} closed", id);
        }
    }
}
