//! Core traits for plugin state.

use serde_json::Value;

/// Observable state of one plugin, driven only by relayed module messages.
///
/// `reduce` is the single mutation path: the host feeds it every `message`
/// event of the current run and publishes the returned value.
pub trait PluginState: Clone + Default + Send + Sync + 'static {
    /// Plugin name, for logging.
    const NAME: &'static str;

    /// Next state after `message`. Unknown messages should return a clone.
    #[must_use]
    fn reduce(&self, message: &Value) -> Self;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter(i64);

    impl PluginState for Counter {
        const NAME: &'static str = "counter";

        fn reduce(&self, message: &Value) -> Self {
            match message.get("add").and_then(Value::as_i64) {
                Some(n) => Self(self.0 + n),
                None => self.clone(),
            }
        }
    }

    #[test]
    fn test_reduce_folds_messages() {
        let messages = [json!({"add": 2}), json!("noise"), json!({"add": 3})];
        let state = messages
            .iter()
            .fold(Counter::default(), |state, message| state.reduce(message));
        assert_eq!(state, Counter(5));
    }
}
