//! Session error taxonomy.

use thiserror::Error;

use crate::envelope::ConsoleMessage;

/// A failure inside one execution session.
///
/// None of these are fatal to the context: each is reported on stderr and
/// completion detection carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Module text failed to load or evaluate.
    #[error("LoadError: {0}")]
    Load(String),
    /// The module factory raised an error or returned garbage.
    #[error("InitError: {0}")]
    Init(String),
    /// User code failed to compile against the capability names.
    #[error("CompileError: {0}")]
    Compile(String),
    /// User code, a scheduled callback or a subscriber raised an error.
    #[error("RuntimeError: {0}")]
    Runtime(String),
    /// An interpreter value could not be converted to a host structure.
    #[error("MarshalError: {0}")]
    Marshal(String),
}

impl SessionError {
    /// Kind name shown to the user.
    ///
    /// Marshal failures happen while user code runs and are shown as runtime
    /// errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "LoadError",
            Self::Init(_) => "InitError",
            Self::Compile(_) => "CompileError",
            Self::Runtime(_) | Self::Marshal(_) => "RuntimeError",
        }
    }

    /// Underlying message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Load(m) | Self::Init(m) | Self::Compile(m) | Self::Runtime(m) | Self::Marshal(m) => m,
        }
    }

    /// The stderr console payload reporting this error.
    #[must_use]
    pub fn to_console(&self) -> ConsoleMessage {
        ConsoleMessage::stderr(format!("{}: {}", self.kind(), self.message()))
    }
}
