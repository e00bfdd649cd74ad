//! Chat bot plugin.

use playground_core::PluginState;
use playground_host::{HostError, PluginHost};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Lua implementation exposing `chat`.
pub const MODULE: &str = include_str!("../lua/chat.lua");

/// Who wrote a chat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatContents {
    Text { contents: String },
    Image { uri: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub from: Author,
    pub contents: ChatContents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_options: Option<Vec<String>>,
}

/// Kind of input the bot is waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Number,
}

/// Messages the chat module sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "contents", rename_all = "camelCase")]
enum ChatEvent {
    Text {
        #[serde(rename = "messageText")]
        message_text: String,
        #[serde(default, rename = "responseOptions")]
        response_options: Option<Vec<String>>,
    },
    Image {
        #[serde(rename = "messageImageFilename")]
        filename: String,
    },
    WaitingForInput {
        #[serde(default, rename = "expectedType")]
        expected_type: InputType,
    },
    Clear,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    pub messages: Vec<ChatMessage>,
    pub expected_input: Option<InputType>,
}

impl ChatState {
    /// Whether the bot is waiting for the user.
    #[must_use]
    pub const fn expected_input(&self) -> Option<InputType> {
        self.expected_input
    }

    /// State after the user answers, plus the payload for the sandbox.
    #[must_use]
    pub fn submit(&self, input: &str) -> (Self, Value) {
        let mut next = self.clone();
        next.messages.push(ChatMessage {
            from: Author::User,
            contents: ChatContents::Text {
                contents: input.to_string(),
            },
            response_options: None,
        });
        next.expected_input = None;
        (next, json!({ "contents": "text", "text": input }))
    }

    fn bot(&mut self, contents: ChatContents, response_options: Option<Vec<String>>) {
        self.messages.push(ChatMessage {
            from: Author::Bot,
            contents,
            response_options,
        });
    }
}

impl PluginState for ChatState {
    const NAME: &'static str = "chat";

    fn reduce(&self, message: &Value) -> Self {
        let event = match ChatEvent::deserialize(message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("ignoring malformed chat message: {e}");
                return self.clone();
            }
        };

        let mut next = self.clone();
        match event {
            ChatEvent::Text {
                message_text,
                response_options,
            } => next.bot(
                ChatContents::Text {
                    contents: message_text,
                },
                response_options,
            ),
            ChatEvent::Image { filename } => next.bot(ChatContents::Image { uri: filename }, None),
            ChatEvent::WaitingForInput { expected_type } => {
                next.expected_input = Some(expected_type);
            }
            ChatEvent::Clear => next.messages.clear(),
        }
        next
    }
}

/// Record the user's answer and send it into the running program.
///
/// # Errors
/// Returns error if the plugin has no sender or the context is gone.
pub fn send_input(host: &PluginHost<ChatState>, input: &str) -> Result<(), HostError> {
    let (next, contents) = host.snapshot().submit(input);
    host.update_and_send(next, contents)
}
