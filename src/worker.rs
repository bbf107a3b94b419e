use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt as _, StreamExt as _};
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::proto::Message;
use crate::router::WorkerRouter;

const SEND_QUEUE_SIZE: usize = 256;

// The Worker side of the two-hop broker: exactly one upstream client (the
// Bridge) at a time, everything outbound funnels through its send queue.
#[derive(Clone, Default)]
pub struct WorkerHub {
    client: Arc<Mutex<Option<(mpsc::Sender<Message>, u64)>>>,
    next_token: Arc<AtomicU64>,
}

impl WorkerHub {
    pub fn new() -> Self {
        Self::default()
    }

    // Claims the hub for a new connection. Fails when a client is already
    // registered, the second Bridge gets refused at the transport.
    fn register(&self, tx: mpsc::Sender<Message>) -> Option<u64> {
        let mut client = self.client.lock();
        if client.is_some() {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        *client = Some((tx, token));
        info!("bridge registered");
        Some(token)
    }

    fn unregister(&self, token: u64) {
        let mut client = self.client.lock();
        if matches!(*client, Some((_, t)) if t == token) {
            *client = None;
            info!("bridge unregistered");
        }
    }

    // Lets router tests read what the Worker would have written upstream.
    #[cfg(test)]
    pub(crate) fn attach_for_test(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_SIZE);
        self.register(tx).expect("hub already has a client");
        rx
    }

    // Queues a message for the current client. A full queue means the client
    // stopped draining, it gets dropped rather than blocking the Worker.
    pub fn send(&self, msg: Message) {
        let mut client = self.client.lock();
        let Some((tx, _)) = client.as_ref() else {
            debug!("no bridge connected, dropping {:?}", msg.event);
            return;
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("bridge send queue overflowed, dropping client");
                *client = None;
            }
            Err(TrySendError::Closed(_)) => {
                *client = None;
            }
        }
    }
}

#[derive(Clone)]
struct WorkerState {
    hub: WorkerHub,
    router: Arc<WorkerRouter>,
}

pub async fn serve(
    listener: TcpListener,
    hub: WorkerHub,
    router: Arc<WorkerRouter>,
) -> anyhow::Result<()> {
    let app = axum::Router::new()
        .route("/", get(upgrade))
        .route("/health", get(health))
        .with_state(WorkerState { hub, router });
    info!("worker listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK WORKER\n"
}

async fn upgrade(State(state): State<WorkerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WorkerState) {
    let (tx, mut rx) = mpsc::channel(SEND_QUEUE_SIZE);
    let Some(token) = state.hub.register(tx) else {
        warn!("bridge already connected, refusing new connection");
        let _ = socket.close().await;
        return;
    };

    let (mut sink, mut stream) = socket.split();

    // Sole writer for this connection. Ends when the hub drops the sender
    // (overflow or replacement) or the peer goes away.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match serde_json::to_string(&msg) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("encoding {:?}: {}", msg.event, err);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(WsMessage::Close(None)).await;
    });

    while let Some(Ok(frame)) = stream.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<Message>(&text) {
            // Everything that arrives after init on the wire must see an
            // initialized workspace, so init alone is handled inline.
            Ok(msg) if msg.event == "init" => state.router.dispatch(msg).await,
            Ok(msg) => {
                // Requests are handled concurrently, replies are correlated
                // by ackID rather than order.
                let router = state.router.clone();
                tokio::spawn(async move { router.dispatch(msg).await });
            }
            Err(err) => warn!("unmarshaling frame: {}", err),
        }
    }

    state.hub.unregister(token);
    writer.abort();
}
