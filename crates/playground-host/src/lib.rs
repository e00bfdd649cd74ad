//! Host side of the lesson playground sandbox.
//!
//! Provides:
//! - `HostController` - Own an execution context and relay its output
//! - `ExecutionSender` - Reset-proof handle for sending into the sandbox
//! - `PluginHost` - Reducer-driven plugin state with change notification

pub mod controller;
pub mod plugin;

pub use controller::{ExecutionSender, HostController, HostError};
pub use plugin::PluginHost;
