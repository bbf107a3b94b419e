use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::proto::Message;

// In-process pub/sub. Publishing never blocks the caller: delivery happens
// on a detached task, so a slow subscriber stalls only its own channel.
// Subscribers are expected to drain.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Message>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, buffer: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(buffer);
        self.subscribers
            .write()
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    pub fn publish(&self, topic: &str, msg: Message) {
        let channels = match self.subscribers.read().get(topic) {
            Some(channels) => channels.clone(),
            None => return,
        };
        tokio::spawn(async move {
            for channel in channels {
                // A closed receiver just means the subscriber went away.
                let _ = channel.send(msg.clone()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use googletest::prelude::*;
    use serde_json::json;

    use super::*;

    #[googletest::test]
    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("worker.events", 8);
        let mut rx2 = bus.subscribe("worker.events", 8);

        bus.publish("worker.events", Message::new("terminal-data", json!({"id": "t1"})));

        let got1 = rx1.recv().await.unwrap();
        let got2 = rx2.recv().await.unwrap();
        expect_that!(got1.event, eq("terminal-data"));
        expect_that!(got2.event, eq("terminal-data"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn publish_to_unknown_topic_is_a_noop() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("worker.events", 1);
        bus.publish("other.topic", Message::new("x", json!({})));

        tokio::time::sleep(Duration::from_millis(20)).await;
        expect_that!(rx.try_recv(), err(anything()));
    }

    #[googletest::test]
    #[tokio::test]
    async fn dropped_subscriber_does_not_break_publish() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe("worker.events", 1);
        let mut rx2 = bus.subscribe("worker.events", 8);
        drop(rx1);

        bus.publish("worker.events", Message::new("workspace:commit", json!({})));
        let got = rx2.recv().await.unwrap();
        expect_that!(got.event, eq("workspace:commit"));
    }
}
