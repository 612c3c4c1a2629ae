//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Enter a room, leaving the current one if any
    Join { room_id: String },

    /// Batched input for the current tick
    Input {
        /// Latest movement intent; older ones are superseded
        #[serde(default)]
        movement: Option<Value>,
        /// Discrete actions in the order they happened
        #[serde(default)]
        actions: Vec<ClientAction>,
    },

    /// Leave the current room
    Leave,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// One discrete action inside a batched input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl ClientMsg {
    /// Expand a batched input into `(kind, payload)` actions. The movement
    /// payload, if any, becomes a single `move` action ahead of the rest.
    pub fn into_actions(self) -> Vec<(String, Value)> {
        let ClientMsg::Input { movement, actions } = self else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(actions.len() + 1);
        if let Some(movement) = movement.filter(|m| !m.is_null()) {
            out.push(("move".to_string(), movement));
        }
        out.extend(actions.into_iter().map(|a| (a.kind, a.payload)));
        out
    }
}

/// Message sent from server to client: `{"event": ..., "payload": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub event: String,
    pub payload: Value,
}

impl ServerEnvelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn welcome(client: &str, server_time: u64) -> Self {
        Self::new("welcome", json!({ "client": client, "server_time": server_time }))
    }

    pub fn notification(message: impl Into<String>) -> Self {
        Self::new("notification", json!({ "message": message.into() }))
    }

    pub fn pong(t: u64, server_time: u64) -> Self {
        Self::new("pong", json!({ "t": t, "server_time": server_time }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_input_expands_movement_first() {
        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"input","movement":{"dx":1},"actions":[{"type":"jump"},{"type":"shoot","payload":{"angle":90}}]}"#,
        )
        .unwrap();
        let actions = msg.into_actions();
        assert_eq!(
            actions,
            vec![
                ("move".to_string(), json!({"dx": 1})),
                ("jump".to_string(), Value::Null),
                ("shoot".to_string(), json!({"angle": 90})),
            ]
        );
    }

    #[test]
    fn wire_names() {
        let join: ClientMsg = serde_json::from_str(r#"{"type":"join","room_id":"lobby"}"#).unwrap();
        assert!(matches!(join, ClientMsg::Join { room_id } if room_id == "lobby"));
        let leave: ClientMsg = serde_json::from_str(r#"{"type":"leave"}"#).unwrap();
        assert!(matches!(leave, ClientMsg::Leave));

        let out = serde_json::to_value(ServerEnvelope::notification("hi")).unwrap();
        assert_eq!(out, json!({"event": "notification", "payload": {"message": "hi"}}));
    }
}
