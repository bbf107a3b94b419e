use serde::{Deserialize, Serialize};
use serde_json::Value;

// The envelope is deliberately loose: `data` is whatever the peer sent.
// Each consumer destructures it into one of the typed requests below.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Message {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    // The correlation id, when `data` is a mapping that carries one.
    pub fn ack_id(&self) -> Option<&str> {
        self.data.get("ackID").and_then(Value::as_str)
    }

    // Overwrites any ackID already present. That's intentional, the Bridge
    // owns correlation on the inner hop.
    pub fn set_ack_id(&mut self, ack_id: &str) {
        if !self.data.is_object() {
            self.data = Value::Object(Default::default());
        }
        // Checked for objectness just above.
        let map = self.data.as_object_mut().unwrap();
        map.insert("ackID".to_owned(), Value::String(ack_id.to_owned()));
    }
}

// A reply to a correlated request. Serializes exactly like a Message when
// there is no error, so broadcasts and acks can share an outbound queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ack {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Message> for Ack {
    fn from(msg: Message) -> Self {
        Self {
            event: msg.event,
            data: msg.data,
            error: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct InitRequest {
    #[serde(default)]
    pub mode: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub target_path: String,
    #[serde(default)]
    pub file_content: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub target_path: String,
    pub new_path: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HydrateFileRequest {
    pub target_path: String,
    pub content_base64: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TerminalRequest {
    #[serde(default)]
    pub id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TerminalInput {
    pub id: String,
    pub input: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CheckoutRequest {
    pub hash: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranchRequest {
    pub hash: String,
    pub branch_name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CommitRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[googletest::test]
    fn message_roundtrip() {
        let msg = Message::new("crud-read-file", json!({"targetPath": "/workspace/a.txt"}));
        let wire = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&wire).unwrap();
        assert_eq!(msg, back);
    }

    #[googletest::test]
    fn message_without_data_parses() {
        let msg: Message = serde_json::from_str(r#"{"event": "hydration-complete"}"#).unwrap();
        expect_that!(msg.event, eq("hydration-complete"));
        assert_eq!(msg.data, Value::Null);
    }

    #[googletest::test]
    fn ack_id_extraction() {
        let msg = Message::new("x", json!({"ackID": "abc-123"}));
        expect_that!(msg.ack_id(), some(eq("abc-123")));
        let msg = Message::new("x", json!({"ackID": 7}));
        expect_that!(msg.ack_id(), none());
        let msg = Message::new("x", Value::Null);
        expect_that!(msg.ack_id(), none());
    }

    #[googletest::test]
    fn set_ack_id_overwrites_and_creates() {
        let mut msg = Message::new("x", json!({"ackID": "theirs", "targetPath": "/workspace"}));
        msg.set_ack_id("ours");
        expect_that!(msg.ack_id(), some(eq("ours")));
        expect_that!(
            msg.data.get("targetPath").and_then(Value::as_str),
            some(eq("/workspace"))
        );

        let mut msg = Message::new("x", Value::Null);
        msg.set_ack_id("fresh");
        expect_that!(msg.ack_id(), some(eq("fresh")));
    }

    #[googletest::test]
    fn ack_serializes_like_message_without_error() {
        let ack = Ack {
            event: "crud-read-file".to_owned(),
            data: json!({"ackID": "1"}),
            error: None,
        };
        let wire = serde_json::to_value(&ack).unwrap();
        assert_eq!(wire, json!({"event": "crud-read-file", "data": {"ackID": "1"}}));
    }

    #[googletest::test]
    fn directory_entry_wire_shape() {
        let entry = DirectoryEntry {
            kind: EntryKind::File,
            path: "/workspace/readme.md".to_owned(),
            name: "readme.md".to_owned(),
        };
        let wire = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            wire,
            json!({"type": "file", "path": "/workspace/readme.md", "name": "readme.md"})
        );
    }
}
