use std::sync::Arc;

use anyhow::Context as _;
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::WorkspaceConfig;
use crate::fs_service::FsService;
use crate::proto::{
    CheckoutRequest, CommitRequest, CreateBranchRequest, FileRequest, HydrateFileRequest,
    InitRequest, Message, MoveRequest, TerminalInput, TerminalRequest,
};
use crate::sandbox::VIRTUAL_ROOT;
use crate::snapshot::{CommitHash, SnapshotEngine, SnapshotMode};
use crate::terminal::PtyManager;
use crate::watcher::WorkspaceWatcher;
use crate::worker::WorkerHub;

// Maps incoming events onto the Worker's services and broadcasts what the
// rest of the world needs to hear about. One instance per Worker process.
pub struct WorkerRouter {
    hub: WorkerHub,
    fs: FsService,
    terminals: PtyManager,
    watcher: Arc<WorkspaceWatcher>,
    snapshots: Arc<SnapshotEngine>,
    // Set by init. Mutations before that behave like PLAYBACK: no commits.
    mode: RwLock<Option<SnapshotMode>>,
}

impl WorkerRouter {
    pub fn new(
        hub: WorkerHub,
        fs: FsService,
        terminals: PtyManager,
        watcher: Arc<WorkspaceWatcher>,
        snapshots: Arc<SnapshotEngine>,
    ) -> Self {
        Self {
            hub,
            fs,
            terminals,
            watcher,
            snapshots,
            mode: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> SnapshotMode {
        self.mode.read().unwrap_or(SnapshotMode::Playback)
    }

    pub async fn dispatch(&self, msg: Message) {
        let ack_id = msg.ack_id().unwrap_or("").to_owned();
        let event = msg.event.clone();
        match self.route(msg, &ack_id).await {
            Ok(Some(reply)) if !ack_id.is_empty() => self.hub.send(reply),
            Ok(_) => {}
            Err(err) => {
                warn!("handling {:?}: {:#}", event, err);
                if !ack_id.is_empty() {
                    self.hub.send(Message::new(
                        event,
                        json!({"ackID": ack_id, "error": format!("{:#}", err)}),
                    ));
                }
            }
        }
    }

    async fn route(&self, msg: Message, ack_id: &str) -> anyhow::Result<Option<Message>> {
        match msg.event.as_str() {
            "init" => {
                let req: InitRequest = parse(&msg.data)?;
                let mode: SnapshotMode = req.mode.parse()?;
                self.snapshots.initialize(mode).await?;
                *self.mode.write() = Some(mode);

                let hub = self.hub.clone();
                self.watcher.start_event_loop(move |change| {
                    hub.send(Message::new(
                        "file-changed",
                        json!({"event": change.kind.as_str(), "path": change.path}),
                    ));
                });
                self.watcher.watch(VIRTUAL_ROOT)?;
                info!("workspace initialized in {:?} mode", req.mode);
                Ok(Some(Message::new("init", json!({"ackID": ack_id}))))
            }

            "create-initial-commit" => {
                let mut data = json!({"ackID": ack_id});
                if let Some(hash) = self
                    .snapshots
                    .commit_changes("Initial commit", self.mode())
                    .await?
                {
                    self.broadcast_commit(&hash, "Initial commit");
                    data["hash"] = json!(hash.to_string());
                }
                Ok(Some(Message::new("create-initial-commit", data)))
            }

            "hydrate-create-file" => {
                let req: HydrateFileRequest = parse(&msg.data)?;
                let hash = self
                    .fs
                    .create_file_base64(&req.target_path, &req.content_base64, self.mode())
                    .await?;
                if let Some(hash) = hash {
                    self.broadcast_commit(&hash, &format!("Hydrate {}", req.target_path));
                }
                self.folder_reply("hydrate-create-file", ack_id, &parent_virtual(&req.target_path))
                    .await
                    .map(Some)
            }

            "crud-read-folder" => {
                let req: FileRequest = parse(&msg.data)?;
                self.watcher.watch(&req.target_path)?;
                self.folder_reply("crud-read-folder", ack_id, &req.target_path)
                    .await
                    .map(Some)
            }

            "crud-collapse-folder" => {
                let req: FileRequest = parse(&msg.data)?;
                self.watcher.unwatch(&req.target_path)?;
                Ok(None)
            }

            "crud-read-file" => {
                let req: FileRequest = parse(&msg.data)?;
                // An open file pins its parent directory in the watch set
                // until the matching crud-close-file.
                self.watcher.add_file_reference(&req.target_path)?;
                let content = self.fs.read_file(&req.target_path).await?;
                Ok(Some(Message::new(
                    "crud-read-file",
                    json!({
                        "ackID": ack_id,
                        "targetPath": req.target_path,
                        "fileContent": content,
                    }),
                )))
            }

            "crud-close-file" => {
                let req: FileRequest = parse(&msg.data)?;
                self.watcher.remove_file_reference(&req.target_path)?;
                Ok(None)
            }

            "crud-update-file" => {
                let req: FileRequest = parse(&msg.data)?;
                let hash = self
                    .fs
                    .update_file(&req.target_path, &req.file_content, self.mode())
                    .await?;
                if let Some(hash) = hash {
                    self.broadcast_commit(&hash, &format!("Update {}", req.target_path));
                }
                Ok(Some(Message::new(
                    "crud-update-file",
                    json!({
                        "ackID": ack_id,
                        "targetPath": req.target_path,
                        "status": "updated",
                    }),
                )))
            }

            "crud-create-file" => {
                let req: FileRequest = parse(&msg.data)?;
                let hash = self
                    .fs
                    .create_file(&req.target_path, &req.file_content, self.mode())
                    .await?;
                if let Some(hash) = hash {
                    self.broadcast_commit(&hash, &format!("Create {}", req.target_path));
                }
                self.folder_reply("crud-create-file", ack_id, &parent_virtual(&req.target_path))
                    .await
                    .map(Some)
            }

            "crud-create-folder" => {
                let req: FileRequest = parse(&msg.data)?;
                let hash = self.fs.create_folder(&req.target_path, self.mode()).await?;
                if let Some(hash) = hash {
                    self.broadcast_commit(&hash, &format!("Create folder {}", req.target_path));
                }
                self.folder_reply("crud-create-folder", ack_id, &parent_virtual(&req.target_path))
                    .await
                    .map(Some)
            }

            "crud-delete-resource" => {
                let req: FileRequest = parse(&msg.data)?;
                let hash = self.fs.delete_resource(&req.target_path, self.mode()).await?;
                if let Some(hash) = hash {
                    self.broadcast_commit(&hash, &format!("Delete {}", req.target_path));
                }
                Ok(Some(Message::new(
                    "crud-delete-resource",
                    json!({
                        "ackID": ack_id,
                        "targetPath": req.target_path,
                        "status": "deleted",
                    }),
                )))
            }

            "crud-move-resource" => {
                let req: MoveRequest = parse(&msg.data)?;
                let hash = self
                    .fs
                    .move_resource(&req.target_path, &req.new_path, self.mode())
                    .await?;
                if let Some(hash) = hash {
                    self.broadcast_commit(
                        &hash,
                        &format!("Move {} to {}", req.target_path, req.new_path),
                    );
                }
                let new_parent = parent_virtual(&req.new_path);
                let contents = self.fs.read_folder(&new_parent).await?;
                Ok(Some(Message::new(
                    "crud-move-resource",
                    json!({
                        "ackID": ack_id,
                        "targetPath": new_parent,
                        "folderContents": contents,
                        "oldPath": req.target_path,
                        "newPath": req.new_path,
                    }),
                )))
            }

            "create-terminal" => {
                let req: TerminalRequest = parse(&msg.data)?;
                let id = self.spawn_terminal(&req.id)?;
                Ok(Some(Message::new(
                    "create-terminal",
                    json!({"ackID": ack_id, "id": id}),
                )))
            }

            "terminal-input" => {
                let req: TerminalInput = parse(&msg.data)?;
                self.terminals.write(&req.id, req.input.as_bytes()).await?;
                Ok(None)
            }

            "close-terminal" => {
                let req: TerminalRequest = parse(&msg.data)?;
                self.terminals.close(&req.id);
                Ok(Some(Message::new("close-terminal", json!({"ackID": ack_id}))))
            }

            "watch" => {
                let req: FileRequest = parse(&msg.data)?;
                self.watcher.watch(&req.target_path)?;
                Ok(None)
            }

            "command-preview" | "command-run" => {
                let config = WorkspaceConfig::load(self.fs.sandbox().base_dir())
                    .await
                    .context("loading workspace config")?;
                let (command, url, reply_event) = if msg.event == "command-preview" {
                    (
                        config.preview.command,
                        Some(config.preview.url),
                        "command-result-preview",
                    )
                } else {
                    (config.run.command, None, "command-result-run")
                };

                let id = self.spawn_terminal("")?;
                let mut data = json!({"ackID": ack_id, "id": id, "command": command});
                if let Some(url) = url {
                    data["url"] = json!(url);
                }
                // The result rides the out queue under its own event name,
                // it is not an inline ack.
                self.hub.send(Message::new(reply_event, data));
                self.terminals
                    .write(&id, format!("{command}\n").as_bytes())
                    .await?;
                Ok(None)
            }

            "system:checkout" => {
                let req: CheckoutRequest = parse(&msg.data)?;
                self.snapshots.checkout_commit(&req.hash).await?;
                Ok(Some(Message::new(
                    "system:checkout",
                    json!({"ackID": ack_id, "hash": req.hash, "status": "checked-out"}),
                )))
            }

            "system:create-branch" => {
                let req: CreateBranchRequest = parse(&msg.data)?;
                self.snapshots
                    .create_branch_and_checkout(&req.hash, &req.branch_name)
                    .await?;
                Ok(Some(Message::new(
                    "system:create-branch",
                    json!({
                        "ackID": ack_id,
                        "commitHash": req.hash,
                        "branchName": req.branch_name,
                        "status": "created",
                    }),
                )))
            }

            "system:commit" => {
                let req: CommitRequest = parse(&msg.data)?;
                let message = req
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Interactive changes".to_owned());
                match self.snapshots.commit_changes(&message, self.mode()).await? {
                    Some(hash) => {
                        self.broadcast_commit(&hash, &message);
                        Ok(Some(Message::new(
                            "system:commit",
                            json!({
                                "ackID": ack_id,
                                "commitHash": hash.to_string(),
                                "status": "committed",
                            }),
                        )))
                    }
                    None => Ok(Some(Message::new(
                        "system:commit",
                        json!({"ackID": ack_id, "status": "no-changes"}),
                    ))),
                }
            }

            other => {
                warn!("unknown event type: {:?}", other);
                Ok(None)
            }
        }
    }

    fn spawn_terminal(&self, requested_id: &str) -> anyhow::Result<String> {
        // The id has to exist before the output callback does, a terminal
        // created with an empty id still broadcasts under its real one.
        let id = if requested_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            requested_id.to_owned()
        };
        let hub = self.hub.clone();
        let data_id = id.clone();
        self.terminals
            .create_or_get(&id, self.fs.sandbox().base_dir(), move |data| {
                hub.send(Message::new(
                    "terminal-data",
                    json!({
                        "id": data_id,
                        "content": String::from_utf8_lossy(&data),
                    }),
                ));
            })
    }

    async fn folder_reply(
        &self,
        event: &str,
        ack_id: &str,
        folder_virtual: &str,
    ) -> anyhow::Result<Message> {
        let contents = self.fs.read_folder(folder_virtual).await?;
        Ok(Message::new(
            event,
            json!({
                "ackID": ack_id,
                "targetPath": folder_virtual,
                "folderContents": contents,
            }),
        ))
    }

    fn broadcast_commit(&self, hash: &CommitHash, message: &str) {
        self.hub.send(Message::new(
            "workspace:commit",
            json!({"hash": hash.to_string(), "message": message}),
        ));
    }
}

fn parse<T: DeserializeOwned>(data: &Value) -> anyhow::Result<T> {
    serde_json::from_value(data.clone()).context("malformed request payload")
}

// "/workspace/sub/a.txt" -> "/workspace/sub". The root is its own parent.
fn parent_virtual(virtual_path: &str) -> String {
    match virtual_path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => VIRTUAL_ROOT.to_owned(),
        Some((parent, _)) => parent.to_owned(),
    }
}
