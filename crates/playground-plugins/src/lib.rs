//! Reference plugins for the lesson playground.
//!
//! Each plugin pairs a [`playground_core::PluginState`] reducer with the Lua
//! module implementation that user code runs against.

pub mod chat;
pub mod music;
pub mod planets;

pub use chat::ChatState;
pub use music::MusicState;
pub use planets::PlanetsState;
