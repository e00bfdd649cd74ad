//! Transport layer for browser front ends.
//!
//! Provides:
//! - Wire protocol (JSON, tagged by `type`)
//! - WebSocket transport (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{ClientMessage, ServerMessage};

#[cfg(feature = "websocket")]
pub use websocket::create_ws_router;
