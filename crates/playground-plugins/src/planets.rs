//! Solar system plugin.

use playground_core::PluginState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lua implementation exposing `addPlanet`.
pub const MODULE: &str = include_str!("../lua/planets.lua");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Planet {
    pub name: String,
    /// Orbit radius, in canvas pixels.
    pub radius: f64,
    pub speed: f64,
    pub size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanetsState {
    pub planets: Vec<Planet>,
}

impl PluginState for PlanetsState {
    const NAME: &'static str = "planets";

    fn reduce(&self, message: &Value) -> Self {
        match Planet::deserialize(message) {
            Ok(planet) => {
                let mut next = self.clone();
                next.planets.push(planet);
                next
            }
            Err(e) => {
                tracing::warn!("ignoring malformed planet: {e}");
                self.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_appends_planets() {
        let state = PlanetsState::default()
            .reduce(&json!({ "name": "Earth", "radius": 150, "speed": 1, "size": 60, "color": "blue" }))
            .reduce(&json!({ "name": "Mars", "radius": 220, "speed": 0.5, "size": 40 }))
            .reduce(&json!({ "name": "Pluto" }));
        assert_eq!(state.planets.len(), 2);
        assert_eq!(state.planets[0].color.as_deref(), Some("blue"));
        assert_eq!(state.planets[1].speed, 0.5);
        assert!(state.planets[1].color.is_none());
    }
}
