use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use log::{info, warn};
use tokio::net::TcpListener;

use workroom::fs_service::FsService;
use workroom::router::WorkerRouter;
use workroom::sandbox::Sandbox;
use workroom::snapshot::SnapshotEngine;
use workroom::terminal::PtyManager;
use workroom::watcher::WorkspaceWatcher;
use workroom::worker::{self, WorkerHub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")
        .context("bad log spec")?
        .start()
        .context("starting logger")?;

    let base_dir =
        std::env::var("WORKER_WORKSPACE_DIR").unwrap_or_else(|_| "/workspace".to_owned());
    tokio::fs::create_dir_all(&base_dir)
        .await
        .with_context(|| format!("creating workspace dir {:?}", base_dir))?;

    let sandbox = Sandbox::new(&base_dir);
    let snapshots = Arc::new(SnapshotEngine::new(&base_dir));
    let fs = FsService::new(sandbox.clone(), snapshots.clone());
    let hub = WorkerHub::new();
    let router = Arc::new(WorkerRouter::new(
        hub.clone(),
        fs,
        PtyManager::new(),
        Arc::new(WorkspaceWatcher::new(sandbox).context("creating watcher")?),
        snapshots.clone(),
    ));

    // When the pod is told to go away, park the session tail on a branch
    // first so a RECORDING session survives.
    {
        let snapshots = snapshots.clone();
        let router = router.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            match snapshots
                .save_branch(&timestamp.to_string(), router.mode())
                .await
            {
                Ok(Some(name)) => info!("saved session to branch {:?}", name),
                Ok(None) => {}
                Err(err) => warn!("saving session branch: {:#}", err),
            }
            std::process::exit(0);
        });
    }

    let listener = TcpListener::bind("0.0.0.0:3002")
        .await
        .context("binding :3002")?;
    worker::serve(listener, hub, router).await
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!("installing SIGTERM handler: {}", err);
            return std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
