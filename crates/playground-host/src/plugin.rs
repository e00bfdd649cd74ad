//! Reducer-driven plugin state.

use std::sync::{Arc, PoisonError, RwLock};

use playground_core::{HostEvent, PluginState};
use serde_json::Value;
use tokio::sync::watch;

use crate::controller::{ExecutionSender, HostError};

/// Holds one plugin's state and publishes every change.
pub struct PluginHost<S: PluginState> {
    state: watch::Sender<S>,
    sender: RwLock<Option<ExecutionSender>>,
}

impl<S: PluginState> Default for PluginHost<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PluginState> PluginHost<S> {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(S::default());
        Self {
            state,
            sender: RwLock::new(None),
        }
    }

    /// Apply a relayed host event.
    ///
    /// `start` resets to the default state, `message` goes through the
    /// reducer, everything else is ignored.
    pub fn handle(&self, event: &HostEvent) {
        match event {
            HostEvent::Start => {
                tracing::debug!(plugin = S::NAME, "resetting plugin state");
                self.state.send_replace(S::default());
            }
            HostEvent::Message { message } => {
                self.state.send_modify(|state| *state = state.reduce(message));
            }
            _ => {}
        }
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.state.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> S {
        self.state.borrow().clone()
    }

    /// Provide the channel used to send messages back into the sandbox.
    pub fn init(&self, sender: ExecutionSender) {
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Replace the state and send `contents` to the sandbox.
    ///
    /// # Errors
    /// Returns error if the plugin was never initialised or the context is
    /// gone.
    pub fn update_and_send(&self, next: S, contents: Value) -> Result<(), HostError> {
        self.state.send_replace(next);
        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(HostError::NotInitialised(S::NAME))?;
        sender.send_module(contents)
    }

    /// Adapt into a host controller callback.
    #[must_use]
    pub fn sink(self: &Arc<Self>) -> impl Fn(HostEvent) + Send + Sync + 'static {
        let host = Arc::clone(self);
        move |event| host.handle(&event)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Log(Vec<Value>);

    impl PluginState for Log {
        const NAME: &'static str = "log";

        fn reduce(&self, message: &Value) -> Self {
            let mut next = self.clone();
            next.0.push(message.clone());
            next
        }
    }

    #[test]
    fn test_reduce_and_reset_on_start() {
        let host = PluginHost::<Log>::new();
        let mut rx = host.subscribe();
        host.handle(&HostEvent::Message { message: json!(1) });
        host.handle(&HostEvent::Finished);
        host.handle(&HostEvent::Message { message: json!(2) });
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().0, vec![json!(1), json!(2)]);

        host.handle(&HostEvent::Start);
        assert_eq!(host.snapshot(), Log::default());
    }

    #[test]
    fn test_update_and_send_requires_init() {
        let host = PluginHost::<Log>::new();
        let err = host
            .update_and_send(Log(vec![json!("x")]), json!("x"))
            .unwrap_err();
        assert!(matches!(err, HostError::NotInitialised("log")));
        // The state still moved.
        assert_eq!(host.snapshot().0, vec![json!("x")]);
    }
}
