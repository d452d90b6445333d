/**
 * message.rs
 *
 * Signalling messages exchanged between peers through the relay.
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message type tag. The protocol set is closed; tags introduced by
/// newer peers land in `Other` and are routed to the peer's state
/// machine unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Start of a handshake: the sender offers its candidate endpoints.
    Init,
    /// The sender announces itself as a friend wanting a session.
    Join,
    /// The sender is gone; tear its state down.
    Quit,
    /// Restart negotiation from scratch, `data["reason"]` says why.
    Reset,
    /// Handshake confirmation carrying the sender's endpoints.
    Accept,
    /// Application payload for an established tunnel.
    Data,
    #[serde(untagged)]
    Other(String),
}

/// One signalling message: a type tag, the sending peer's name and an
/// auxiliary string-keyed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl Message {
    pub fn new(kind: MessageKind, from: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            data: HashMap::new(),
        }
    }

    /// Builder-style payload entry, mostly for tests and the relay shim.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The `reason` payload field carried by `Reset`.
    pub fn reason(&self) -> Option<&str> {
        self.data.get("reason").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_tags() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"init","from":"alice","data":{"endpoint":"1.2.3.4:9"}}"#)
                .unwrap();
        assert_eq!(msg.kind, MessageKind::Init);
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.data.get("endpoint").unwrap(), "1.2.3.4:9");
    }

    #[test]
    fn unknown_tag_becomes_other() {
        let msg: Message = serde_json::from_str(r#"{"type":"keyswap","from":"bob"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Other("keyswap".into()));
        assert!(msg.data.is_empty());
    }

    #[test]
    fn reset_reason_is_readable() {
        let msg = Message::new(MessageKind::Reset, "carol").with("reason", "timeout");
        assert_eq!(msg.reason(), Some("timeout"));
        assert_eq!(Message::new(MessageKind::Reset, "carol").reason(), None);
    }
}
