//! Sandboxed execution of lesson code.
//!
//! Provides:
//! - `ContextHandle` - Isolated execution context on its own thread
//! - `CallbackRegistry` - Outstanding timers, the basis of completion detection
//! - Module loading and user-code compilation
//! - Value sanitizing and strict marshalling

pub mod context;
pub mod error;
mod facade;
pub mod loader;
pub mod marshal;
mod outbox;
pub mod registry;
pub mod sanitize;
mod session;

pub use context::ContextHandle;
pub use error::{ContextError, MarshalError};
pub use loader::CapabilitySet;
pub use registry::{CallbackRegistry, TimerId, TimerKind};
pub use sanitize::{sanitize, sanitize_all};
