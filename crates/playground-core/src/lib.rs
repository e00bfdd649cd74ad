//! Core building blocks for the lesson playground sandbox.
//!
//! This crate provides the pieces shared by the runtime, the host and the
//! transport:
//! - `Envelope` / `HostEvent` - Wire messages between host and sandbox
//! - `SubscriberRegistry` - Handle-keyed callback registry
//! - `OutputHub` - Host-side fan-out with pre-subscription buffering
//! - `SandboxConfig` - Context configuration
//! - `SessionError` - Per-session error taxonomy
//! - `PluginState` - Reducer trait for plugin state

pub mod config;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod subscribers;
pub mod traits;

pub use config::{ContextVariant, SandboxConfig};
pub use envelope::{ConsoleLevel, ConsoleMessage, ConsoleStream, Envelope, HostEvent};
pub use error::SessionError;
pub use hub::OutputHub;
pub use subscribers::{SubscriberRegistry, SubscriptionId};
pub use traits::PluginState;
