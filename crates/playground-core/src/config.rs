//! Sandbox configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which execution model a context uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextVariant {
    /// Cooperative: user code is compiled against the capability names and
    /// may suspend between scheduled callbacks.
    #[default]
    Direct,
    /// A persistent interpreter runs user code in one blocking call; output is
    /// streamed through a bounded queue.
    Blocking,
}

impl std::str::FromStr for ContextVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "blocking" => Ok(Self::Blocking),
            other => Err(format!("unknown context variant: {other}")),
        }
    }
}

/// Settings shared by host controllers and the contexts they spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Execution model for new contexts.
    pub variant: ContextVariant,

    /// Capacity of the blocking variant's outbound queue.
    pub outbound_queue_capacity: usize,

    /// Instructions between checks of the termination flag.
    pub interrupt_check_interval: u32,

    /// Lower bound for `setInterval` periods, in milliseconds.
    pub min_repeat_interval_ms: u64,

    /// Name given to context threads.
    pub thread_name: String,

    /// Events an output hub keeps while nobody is subscribed.
    pub hub_backlog_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            variant: ContextVariant::Direct,
            outbound_queue_capacity: 256,
            interrupt_check_interval: 10_000,
            min_repeat_interval_ms: 1,
            thread_name: "playground-context".to_string(),
            hub_backlog_limit: 1024,
        }
    }
}

impl SandboxConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution model.
    #[must_use]
    pub const fn with_variant(mut self, variant: ContextVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Set the outbound queue capacity (clamped to at least 1).
    #[must_use]
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    /// Set how often the termination flag is polled, in instructions.
    #[must_use]
    pub fn with_interrupt_check_interval(mut self, instructions: u32) -> Self {
        self.interrupt_check_interval = instructions.max(1);
        self
    }

    /// Set the minimum repeat interval.
    #[must_use]
    pub const fn with_min_repeat_interval_ms(mut self, ms: u64) -> Self {
        self.min_repeat_interval_ms = ms;
        self
    }

    /// Set the context thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the hub backlog limit.
    #[must_use]
    pub const fn with_hub_backlog_limit(mut self, limit: usize) -> Self {
        self.hub_backlog_limit = limit;
        self
    }

    /// Minimum repeat interval as a [`Duration`].
    #[must_use]
    pub const fn min_repeat_interval(&self) -> Duration {
        Duration::from_millis(self.min_repeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.variant, ContextVariant::Direct);
        assert_eq!(cfg.outbound_queue_capacity, 256);
        assert_eq!(cfg.interrupt_check_interval, 10_000);
        assert_eq!(cfg.min_repeat_interval(), Duration::from_millis(1));
        assert_eq!(cfg.thread_name, "playground-context");
    }

    #[test]
    fn test_builder_clamps() {
        let cfg = SandboxConfig::new()
            .with_variant(ContextVariant::Blocking)
            .with_outbound_queue_capacity(0)
            .with_interrupt_check_interval(0)
            .with_thread_name("lesson");
        assert_eq!(cfg.variant, ContextVariant::Blocking);
        assert_eq!(cfg.outbound_queue_capacity, 1);
        assert_eq!(cfg.interrupt_check_interval, 1);
        assert_eq!(cfg.thread_name, "lesson");
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let cfg: SandboxConfig = serde_json::from_str(r#"{"variant":"blocking"}"#).unwrap();
        assert_eq!(cfg.variant, ContextVariant::Blocking);
        assert_eq!(cfg.hub_backlog_limit, 1024);
    }

    #[test]
    fn test_variant_from_str() {
        assert_eq!("direct".parse::<ContextVariant>(), Ok(ContextVariant::Direct));
        assert_eq!("blocking".parse::<ContextVariant>(), Ok(ContextVariant::Blocking));
        assert!("threads".parse::<ContextVariant>().is_err());
    }
}
