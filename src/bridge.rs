use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt as _, StreamExt as _};
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::hydrate::Hydrator;
use crate::proto::{Ack, Message};
use crate::upstream::{UpstreamClient, WORKER_EVENTS_TOPIC};

const SEND_QUEUE_SIZE: usize = 256;
const EVENT_BUFFER: usize = 256;

// Events the frontend expects an answer to. The Bridge mints the ackID for
// the inner hop and echoes it back, whatever the frontend supplied.
const REQUEST_RESPONSE_EVENTS: &[&str] = &[
    "crud-read-file",
    "crud-read-folder",
    "create-terminal",
    "close-terminal",
    "crud-download-workspace",
    "hydrate-create-file",
    "crud-create-file",
    "crud-create-folder",
    "command-preview",
    "command-run",
    "crud-update-file",
    "crud-delete-resource",
    "crud-move-resource",
];

// Forwarded without correlation, nobody waits for these.
const FIRE_AND_FORGET_EVENTS: &[&str] = &[
    "terminal-input",
    "crud-collapse-folder",
    "crud-close-file",
    "watch",
    "create-initial-commit",
];

// Fans Worker events out to every connected frontend. Delivery is
// non-blocking: a frontend that stops draining its queue gets evicted.
#[derive(Clone)]
pub struct BridgeHub {
    clients: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Ack>>>>,
}

impl BridgeHub {
    pub fn start(bus: &EventBus) -> Self {
        let hub = Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
        };
        let mut events = bus.subscribe(WORKER_EVENTS_TOPIC, EVENT_BUFFER);
        let clients = hub.clients.clone();
        tokio::spawn(async move {
            while let Some(msg) = events.recv().await {
                let targets: Vec<(Uuid, mpsc::Sender<Ack>)> = clients
                    .lock()
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect();
                for (id, tx) in targets {
                    match tx.try_send(Ack::from(msg.clone())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("client {} stopped draining, evicting", id);
                            clients.lock().remove(&id);
                        }
                        Err(TrySendError::Closed(_)) => {
                            clients.lock().remove(&id);
                        }
                    }
                }
            }
        });
        hub
    }

    fn register(&self, id: Uuid, tx: mpsc::Sender<Ack>) {
        self.clients.lock().insert(id, tx);
        info!("client {} registered to hub", id);
    }

    fn unregister(&self, id: Uuid) {
        if self.clients.lock().remove(&id).is_some() {
            info!("client {} unregistered from hub", id);
        }
    }
}

#[derive(Clone)]
pub struct BridgeState {
    pub hub: BridgeHub,
    pub upstream: UpstreamClient,
    pub hydrator: Arc<Hydrator>,
}

pub async fn serve(listener: TcpListener, state: BridgeState) -> anyhow::Result<()> {
    let app = axum::Router::new()
        .route("/ws", get(upgrade))
        .route("/health", get(health))
        .with_state(state);
    info!("bridge listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK BRIDGE\n"
}

// Origin checking is an upstream collaborator's problem, every upgrade is
// accepted here.
async fn upgrade(State(state): State<BridgeState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BridgeState) {
    let client_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Ack>(SEND_QUEUE_SIZE);
    state.hub.register(client_id, tx.clone());

    let (mut sink, mut stream) = socket.split();

    // Sole writer for this frontend: request replies, error envelopes and
    // broadcast fan-out all come through the same queue in enqueue order.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let encoded = match serde_json::to_string(&frame) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!("encoding {:?}: {}", frame.event, err);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(encoded)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    });

    while let Some(Ok(frame)) = stream.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let msg: Message = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("unmarshaling client frame: {}", err);
                continue;
            }
        };

        if msg.event == "init" {
            // Forwarded inline so init reaches the Worker ahead of any
            // request read after it, then hydration kicks off.
            state.upstream.send_fire_and_forget(msg).await;
            let hydrator = state.hydrator.clone();
            tokio::spawn(async move { hydrator.run_once().await });
        } else if REQUEST_RESPONSE_EVENTS.contains(&msg.event.as_str()) {
            // Each request gets its own task, slow ones don't block the
            // reader and replies correlate by ackID.
            let upstream = state.upstream.clone();
            let reply_tx = tx.clone();
            tokio::spawn(async move { handle_request(upstream, reply_tx, msg).await });
        } else if FIRE_AND_FORGET_EVENTS.contains(&msg.event.as_str()) {
            state.upstream.send_fire_and_forget(msg).await;
        } else {
            warn!("unknown event type from client: {:?}", msg.event);
        }
    }

    state.hub.unregister(client_id);
    writer.abort();
}

async fn handle_request(upstream: UpstreamClient, reply_tx: mpsc::Sender<Ack>, msg: Message) {
    let ack_id = Uuid::new_v4().to_string();
    let event = msg.event.clone();
    match upstream.forward_command(msg, &ack_id).await {
        Ok(ack) => {
            let _ = reply_tx.send(ack).await;
        }
        Err(err) => {
            warn!("forwarding {:?}: {:#}", event, err);
            // Through the queue like everything else, a direct socket write
            // would race the writer task.
            let _ = reply_tx
                .send(Ack {
                    event,
                    data: json!({"ackID": ack_id}),
                    error: Some(format!("{err:#}")),
                })
                .await;
        }
    }
}
