//! Message envelopes exchanged between the host and an execution context.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a captured console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Debug,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    /// All levels, in the order the facade installs them.
    pub const ALL: [Self; 5] = [Self::Log, Self::Debug, Self::Info, Self::Warn, Self::Error];

    /// Method name on the sandbox `console` table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Output stream for plain-text console messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    #[default]
    Stdout,
    Stderr,
}

/// Payload of a `console` envelope.
///
/// Two wire shapes share the `console` tag: captured log calls carry a level
/// and the sanitized argument list, error reports carry a stream and text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConsoleMessage {
    /// `console.log(...)` and friends.
    Log { level: ConsoleLevel, data: Vec<Value> },
    /// Plain text written to a stream.
    Text {
        #[serde(default)]
        stream: ConsoleStream,
        #[serde(rename = "messageText")]
        message_text: String,
    },
}

impl ConsoleMessage {
    /// A stderr line, newline-terminated.
    #[must_use]
    pub fn stderr(text: impl AsRef<str>) -> Self {
        Self::Text {
            stream: ConsoleStream::Stderr,
            message_text: format!("{}\n", text.as_ref()),
        }
    }

    /// Whether this message was written to stderr.
    #[must_use]
    pub const fn is_stderr(&self) -> bool {
        matches!(
            self,
            Self::Text {
                stream: ConsoleStream::Stderr,
                ..
            }
        )
    }
}

/// Envelope passed over the host/sandbox channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Host -> sandbox: begin a session.
    Start {
        #[serde(rename = "userCode")]
        user_code: String,
        #[serde(rename = "moduleCode")]
        module_code: String,
    },
    /// Either direction: opaque module payload.
    Module { contents: Value },
    /// Sandbox -> host: console output.
    Console(ConsoleMessage),
    /// Sandbox -> host: `console.clear()`.
    ClearConsole,
    /// Sandbox -> host: the session reached quiescence.
    Finished,
}

impl Envelope {
    /// Build a `start` envelope.
    #[must_use]
    pub fn start(user_code: impl Into<String>, module_code: impl Into<String>) -> Self {
        Self::Start {
            user_code: user_code.into(),
            module_code: module_code.into(),
        }
    }

    /// Build a `module` envelope.
    #[must_use]
    pub const fn module(contents: Value) -> Self {
        Self::Module { contents }
    }

    /// Wire tag, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Module { .. } => "module",
            Self::Console(_) => "console",
            Self::ClearConsole => "clearConsole",
            Self::Finished => "finished",
        }
    }
}

/// What a host controller hands to its single `on_message` callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEvent {
    /// Emitted synchronously by `start_execution`, before dispatch.
    Start,
    /// A `module` payload from the sandbox.
    Message { message: Value },
    Console(ConsoleMessage),
    ClearConsole,
    Finished,
}

impl HostEvent {
    /// Wire tag, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Message { .. } => "message",
            Self::Console(_) => "console",
            Self::ClearConsole => "clearConsole",
            Self::Finished => "finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_start_wire_shape() {
        let env = Envelope::start("double(21)", "return function() end");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "start",
                "userCode": "double(21)",
                "moduleCode": "return function() end"
            })
        );
    }

    #[test]
    fn test_console_log_shape() {
        let env = Envelope::Console(ConsoleMessage::Log {
            level: ConsoleLevel::Warn,
            data: vec![json!("careful"), json!(3)],
        });
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({ "type": "console", "level": "warn", "data": ["careful", 3] })
        );
    }

    #[test]
    fn test_console_stderr_shape() {
        let env = Envelope::Console(ConsoleMessage::stderr("CompileError: oops"));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "console",
                "stream": "stderr",
                "messageText": "CompileError: oops\n"
            })
        );
    }

    #[test]
    fn test_parse_console_variants() {
        let log: Envelope =
            serde_json::from_str(r#"{"type":"console","level":"info","data":[1]}"#).unwrap();
        assert!(matches!(
            log,
            Envelope::Console(ConsoleMessage::Log {
                level: ConsoleLevel::Info,
                ..
            })
        ));

        let text: Envelope =
            serde_json::from_str(r#"{"type":"console","messageText":"Loaded!"}"#).unwrap();
        match text {
            Envelope::Console(message @ ConsoleMessage::Text { .. }) => {
                assert!(!message.is_stderr());
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(
            serde_json::to_string(&Envelope::ClearConsole).unwrap(),
            r#"{"type":"clearConsole"}"#
        );
        let finished: Envelope = serde_json::from_str(r#"{"type":"finished"}"#).unwrap();
        assert_eq!(finished, Envelope::Finished);
    }

    #[test]
    fn test_host_event_message_shape() {
        let event = HostEvent::Message { message: json!(42) };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({ "type": "message", "message": 42 }));
        assert_eq!(event.kind(), "message");
    }
}
