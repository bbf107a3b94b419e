use std::sync::Arc;

use anyhow::Context as _;
use log::warn;
use tokio::net::TcpListener;

use workroom::bridge::{self, BridgeHub, BridgeState};
use workroom::bus::EventBus;
use workroom::hydrate::{BlobStore, FsBlobStore, Hydrator};
use workroom::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")
        .context("bad log spec")?
        .start()
        .context("starting logger")?;

    let worker_host =
        std::env::var("WORKER_HOST").unwrap_or_else(|_| "localhost:3002".to_owned());

    // Explicit construction at process start: the bus and the upstream
    // client are the process-wide singletons everything else borrows.
    let bus = Arc::new(EventBus::new());
    let upstream = UpstreamClient::start(bus.clone(), format!("ws://{worker_host}/"));

    // The deployment mounts the object store locally; without it the Bridge
    // still brokers, it just can't hydrate.
    let store: Option<Arc<dyn BlobStore>> = match std::env::var("BLOB_STORE_DIR") {
        Ok(dir) => Some(Arc::new(FsBlobStore::new(dir))),
        Err(_) => {
            warn!("BLOB_STORE_DIR not set, hydration will be skipped");
            None
        }
    };
    let hydrator = Arc::new(Hydrator::from_env(store, upstream.clone()));
    let hub = BridgeHub::start(&bus);

    let listener = TcpListener::bind("0.0.0.0:2024")
        .await
        .context("binding :2024")?;
    bridge::serve(
        listener,
        BridgeState {
            hub,
            upstream,
            hydrator,
        },
    )
    .await
}
