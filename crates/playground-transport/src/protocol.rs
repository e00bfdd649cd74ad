//! Wire protocol between a browser front end and the server.

use playground_core::HostEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Run a program against a module.
    Start {
        user_code: String,
        module_code: String,
    },
    /// Payload for the running module.
    Module { contents: Value },
    /// Throw away the execution context and start a fresh one.
    Reset,
    /// Ping for keepalive.
    Ping,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Relayed host event.
    Event { event: HostEvent },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    #[must_use]
    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}
