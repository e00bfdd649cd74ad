//! Music plugin: user code plays notes through `song.playNote`.

use playground_core::PluginState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lua implementation exposing `song`.
pub const MODULE: &str = include_str!("../lua/music.lua");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MusicState {
    pub notes: Vec<Note>,
}

impl PluginState for MusicState {
    const NAME: &'static str = "music";

    fn reduce(&self, message: &Value) -> Self {
        let mut next = self.clone();
        match Note::deserialize(message) {
            Ok(note) => next.notes.push(note),
            Err(e) => tracing::warn!("ignoring malformed note: {e}"),
        }
        next
    }
}
