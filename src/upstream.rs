use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
#[allow(unused_imports)]
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::bus::EventBus;
use crate::proto::{Ack, Message};
use crate::util::ResultExt as _;

pub const WORKER_EVENTS_TOPIC: &str = "worker.events";

const SEND_QUEUE_SIZE: usize = 256;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// Worker events the Bridge republishes to every frontend.
const BROADCAST_EVENTS: &[&str] = &["file-changed", "terminal-data", "workspace:commit"];

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// The Bridge's single connection to the Worker. One of these per process:
// every frontend request funnels through its send queue, correlation is by
// ackID through the pending table, and a supervisor keeps redialing the
// Worker forever.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<UpstreamInner>,
}

struct UpstreamInner {
    send_tx: mpsc::Sender<Message>,
    pending: Mutex<HashMap<String, oneshot::Sender<Ack>>>,
    // The writer task and the supervisor swap the sink under this same lock,
    // the writer never caches it across messages.
    conn: tokio::sync::Mutex<Option<WsSink>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    bus: Arc<EventBus>,
    ack_timeout: Duration,
    reconnect_delay: Duration,
}

impl UpstreamClient {
    pub fn start(bus: Arc<EventBus>, url: String) -> Self {
        Self::start_with_timing(bus, url, ACK_TIMEOUT, RECONNECT_DELAY)
    }

    fn start_with_timing(
        bus: Arc<EventBus>,
        url: String,
        ack_timeout: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let (ready_tx, ready_rx) = watch::channel(false);
        let inner = Arc::new(UpstreamInner {
            send_tx,
            pending: Mutex::new(HashMap::new()),
            conn: tokio::sync::Mutex::new(None),
            ready_tx,
            ready_rx,
            bus,
            ack_timeout,
            reconnect_delay,
        });

        let writer = inner.clone();
        tokio::spawn(async move { writer.write_pump(send_rx).await });
        let supervisor = inner.clone();
        tokio::spawn(async move { supervisor.supervise(url).await });

        Self { inner }
    }

    // Tests don't want to sit through production backoffs.
    #[cfg(test)]
    pub(crate) fn start_for_test(
        bus: Arc<EventBus>,
        url: String,
        ack_timeout: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        Self::start_with_timing(bus, url, ack_timeout, reconnect_delay)
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready_rx.borrow()
    }

    // Registers the ackID, injects it into the payload, enqueues, and waits
    // for the matching reply. Fails fast when the Worker isn't connected,
    // times out otherwise, and in both failure cases the pending entry is
    // gone by the time this returns.
    pub async fn forward_command(&self, mut msg: Message, ack_id: &str) -> anyhow::Result<Ack> {
        if !self.is_ready() {
            bail!("connection not ready");
        }
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(ack_id.to_owned(), tx);
        msg.set_ack_id(ack_id);
        if self.inner.send_tx.send(msg).await.is_err() {
            self.inner.pending.lock().remove(ack_id);
            bail!("send queue closed");
        }
        match tokio::time::timeout(self.inner.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            // The supervisor dropped the pending table on connection reset.
            Ok(Err(_)) => bail!("connection reset while awaiting acknowledgement"),
            Err(_) => {
                self.inner.pending.lock().remove(ack_id);
                bail!("acknowledgement timeout");
            }
        }
    }

    // Best effort: silently dropped when the Worker isn't connected.
    pub async fn send_fire_and_forget(&self, msg: Message) {
        if !self.is_ready() {
            debug!("connection not ready, dropping {:?}", msg.event);
            return;
        }
        let _ = self.inner.send_tx.send(msg).await;
    }
}

impl UpstreamInner {
    // Lifelong and the only place that writes the socket, so frames never
    // interleave no matter how many tasks enqueue.
    async fn write_pump(&self, mut send_rx: mpsc::Receiver<Message>) {
        while let Some(msg) = send_rx.recv().await {
            let mut conn = self.conn.lock().await;
            let Some(sink) = conn.as_mut() else {
                warn!("no upstream connection, dropping {:?}", msg.event);
                continue;
            };
            match serde_json::to_string(&msg) {
                Ok(frame) => sink
                    .send(WsMessage::Text(frame))
                    .await
                    .or_log_error("writing upstream frame"),
                Err(err) => warn!("encoding {:?}: {}", msg.event, err),
            }
        }
    }

    async fn supervise(self: Arc<Self>, url: String) {
        loop {
            debug!("connecting to worker at {}", url);
            let ws = match connect_async(url.as_str()).await {
                Ok((ws, _)) => ws,
                Err(err) => {
                    warn!(
                        "worker connection failed: {}. Retrying in {:?}",
                        err, self.reconnect_delay
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };
            info!("connected to worker");

            let (sink, stream) = ws.split();
            *self.conn.lock().await = Some(sink);
            let reader = tokio::spawn({
                let inner = self.clone();
                async move { inner.read_pump(stream).await }
            });
            let _ = self.ready_tx.send(true);

            // Park here until the reader observes the connection dying.
            let _ = reader.await;

            let _ = self.ready_tx.send(false);
            *self.conn.lock().await = None;
            // Nobody will answer the in-flight requests now.
            self.pending.lock().clear();
            warn!("worker connection lost");
        }
    }

    async fn read_pump(&self, mut stream: WsStream) {
        while let Some(result) = stream.next().await {
            match result {
                Ok(WsMessage::Text(text)) => self.handle_frame(&text),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("reading from worker: {}", err);
                    break;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("unmarshaling worker frame: {}", err);
                return;
            }
        };
        if BROADCAST_EVENTS.contains(&msg.event.as_str()) {
            self.bus.publish(WORKER_EVENTS_TOPIC, msg.clone());
        }
        if let Some(ack_id) = msg.ack_id() {
            if let Some(reply) = self.pending.lock().remove(ack_id) {
                // The waiter may have timed out in the meantime, that's fine.
                let _ = reply.send(Ack::from(msg));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use futures::{SinkExt as _, StreamExt as _};
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::proto::Message;

    // What the fake worker does with each request it reads.
    #[derive(Clone, Copy)]
    pub enum Behavior {
        // Reply with {ackID, echoed: event}.
        EchoAcks,
        // Read and record but never reply.
        Silent,
    }

    // A stand-in worker that accepts any number of sequential connections
    // and records every message it sees.
    pub struct FakeWorker {
        pub addr: SocketAddr,
        pub received: Arc<Mutex<Vec<Message>>>,
    }

    impl FakeWorker {
        pub async fn spawn(behavior: Behavior) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));

            let record = received.clone();
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    let Ok(ws) = accept_async(tcp).await else {
                        continue;
                    };
                    let (mut sink, mut stream) = ws.split();
                    while let Some(Ok(WsMessage::Text(text))) = stream.next().await {
                        let Ok(msg) = serde_json::from_str::<Message>(&text) else {
                            continue;
                        };
                        record.lock().push(msg.clone());
                        if let (Behavior::EchoAcks, Some(ack_id)) = (behavior, msg.ack_id()) {
                            let reply = Message::new(
                                msg.event.clone(),
                                json!({"ackID": ack_id, "echoed": msg.event}),
                            );
                            let frame = serde_json::to_string(&reply).unwrap();
                            if sink.send(WsMessage::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            Self { addr, received }
        }

        pub fn url(&self) -> String {
            format!("ws://{}/", self.addr)
        }
    }
}
