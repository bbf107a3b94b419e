use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
#[allow(unused_imports)]
use log::{debug, info, warn};
use serde_json::json;
use tokio::task::JoinSet;

use crate::proto::Message;
use crate::upstream::UpstreamClient;

pub const BUCKET: &str = "room";

// The object store is an external collaborator, everything the hydration
// flow needs from it fits behind this seam.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<String>>;
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>>;
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
}

// Keys as files under <root>/<bucket>/. Enough to run a Bridge against a
// local directory, and what the tests hydrate from.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<String>> {
        let bucket_root = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut stack = vec![bucket_root.clone()];
        while let Some(dir) = stack.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                // An absent bucket just lists empty.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("listing {:?}", dir)),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&bucket_root) {
                    let key = rel.to_string_lossy().into_owned();
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(bucket).join(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading object {:?}", key))
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let path = self.root.join(bucket).join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {:?}", parent))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing object {:?}", key))
    }
}

// Populates the workspace from the object store, once per Bridge process.
// Dev environments skip it entirely.
pub struct Hydrator {
    store: Option<Arc<dyn BlobStore>>,
    upstream: UpstreamClient,
    workspace_id: String,
    dev_mode: bool,
    started: AtomicBool,
}

impl Hydrator {
    pub fn new(
        store: Option<Arc<dyn BlobStore>>,
        upstream: UpstreamClient,
        workspace_id: Option<String>,
        dev_mode: bool,
    ) -> Self {
        let workspace_id = workspace_id.unwrap_or_else(|| {
            warn!("WORKSPACE_ID not set, falling back to \"demo\"");
            "demo".to_owned()
        });
        Self {
            store,
            upstream,
            workspace_id,
            dev_mode,
            started: AtomicBool::new(false),
        }
    }

    pub fn from_env(store: Option<Arc<dyn BlobStore>>, upstream: UpstreamClient) -> Self {
        let workspace_id = std::env::var("WORKSPACE_ID").ok();
        let dev_mode = std::env::var("ENV").is_ok_and(|env| env == "DEV");
        Self::new(store, upstream, workspace_id, dev_mode)
    }

    // Triggered on every frontend init, only the first call does anything.
    pub async fn run_once(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.dev_mode {
            info!("ENV=DEV, skipping hydration");
            return;
        }
        if let Err(err) = self.hydrate().await {
            warn!("hydration failed: {:#}", err);
        }
    }

    async fn hydrate(&self) -> anyhow::Result<()> {
        let Some(store) = self.store.clone() else {
            bail!("no blob store configured");
        };
        // The object store keys on the record id, the workspace id carries a
        // "ws-" deployment prefix on top of it.
        let record_id = self
            .workspace_id
            .strip_prefix("ws-")
            .unwrap_or(&self.workspace_id);
        let prefix = format!("workspaces/{record_id}");

        let keys = store
            .list(BUCKET, &prefix)
            .await
            .with_context(|| format!("listing {:?}", prefix))?;
        info!("hydrating {} objects under {:?}", keys.len(), prefix);

        let mut fetches = JoinSet::new();
        for key in keys {
            // Directory placeholders carry no content.
            if key.ends_with('/') {
                continue;
            }
            let store = store.clone();
            let upstream = self.upstream.clone();
            let prefix = prefix.clone();
            fetches.spawn(async move {
                let bytes = match store.get(BUCKET, &key).await {
                    Ok(bytes) => bytes,
                    // Per-object failure skips that object, the rest of the
                    // workspace still arrives.
                    Err(err) => {
                        warn!("fetching {:?}: {:#}", key, err);
                        return;
                    }
                };
                let suffix = key
                    .strip_prefix(&prefix)
                    .map(|s| s.trim_start_matches('/'))
                    .unwrap_or(&key);
                upstream
                    .send_fire_and_forget(Message::new(
                        "hydrate-create-file",
                        json!({
                            "targetPath": format!("/workspace/{suffix}"),
                            "contentBase64": BASE64.encode(&bytes),
                        }),
                    ))
                    .await;
            });
        }
        while fetches.join_next().await.is_some() {}

        // Completion means every object was submitted, not that the Worker
        // has persisted them all.
        self.upstream
            .send_fire_and_forget(Message::new("hydration-complete", json!({})))
            .await;
        info!("hydration complete");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_store {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryBlobStore {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl MemoryBlobStore {
        pub fn with_objects<'a>(objects: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
            Self {
                objects: Mutex::new(
                    objects
                        .into_iter()
                        .map(|(k, v)| (k.to_owned(), v.to_vec()))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn list(&self, _bucket: &str, prefix: &str) -> anyhow::Result<Vec<String>> {
            Ok(self
                .objects
                .lock()
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn get(&self, _bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
            self.objects
                .lock()
                .get(key)
                .cloned()
                .with_context(|| format!("no such object {:?}", key))
        }

        async fn put(&self, _bucket: &str, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
            self.objects.lock().insert(key.to_owned(), bytes);
            Ok(())
        }
    }
}
