//! Host controller owning one execution context.

use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
};

use playground_core::{Envelope, HostEvent, SandboxConfig};
use playground_runtime::{ContextError, ContextHandle};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

/// Host controller error.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    #[error("Host controller requires a tokio runtime")]
    NoRuntime,
    #[error("Plugin not initialised: {0}")]
    NotInitialised(&'static str),
}

type OnMessage = Arc<dyn Fn(HostEvent) + Send + Sync>;

/// Sender that always targets the controller's current context, across
/// resets.
#[derive(Clone)]
pub struct ExecutionSender {
    target: Arc<RwLock<mpsc::UnboundedSender<Envelope>>>,
}

impl ExecutionSender {
    fn new(sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            target: Arc::new(RwLock::new(sender)),
        }
    }

    fn retarget(&self, sender: mpsc::UnboundedSender<Envelope>) {
        *self.target.write().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    /// Send any envelope.
    ///
    /// # Errors
    /// Returns error if the current context has exited.
    pub fn send(&self, envelope: Envelope) -> Result<(), HostError> {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .send(envelope)
            .map_err(|_| HostError::Context(ContextError::Closed))
    }

    /// Send a `module` payload.
    ///
    /// # Errors
    /// Returns error if the current context has exited.
    pub fn send_module(&self, contents: Value) -> Result<(), HostError> {
        self.send(Envelope::module(contents))
    }
}

impl std::fmt::Debug for ExecutionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSender").finish_non_exhaustive()
    }
}

/// A spawned context plus the task relaying its output.
struct Attached {
    context: ContextHandle,
    relay: JoinHandle<()>,
    broken: Arc<AtomicBool>,
}

impl Attached {
    fn spawn(config: &SandboxConfig, on_message: &OnMessage) -> Result<Self, HostError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HostError::NoRuntime)?;
        let (context, events) = ContextHandle::spawn(config)?;
        let broken = Arc::new(AtomicBool::new(false));
        let relay = runtime.spawn(relay(
            context.id(),
            events,
            Arc::clone(on_message),
            Arc::clone(&broken),
        ));
        Ok(Self {
            context,
            relay,
            broken,
        })
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst) || self.context.is_terminated()
    }

    /// Stop relaying first so nothing from this context reaches the callback.
    fn detach(&self) {
        self.relay.abort();
        self.context.terminate();
    }
}

/// Owns an execution context and relays its envelopes to one callback.
///
/// Dropping the controller terminates the context.
pub struct HostController {
    config: SandboxConfig,
    on_message: OnMessage,
    attached: Attached,
    sender: ExecutionSender,
}

impl HostController {
    /// Spawn a context and start relaying.
    ///
    /// # Errors
    /// Returns error if called outside a tokio runtime or the context thread
    /// cannot be spawned.
    pub fn new<F>(config: SandboxConfig, on_message: F) -> Result<Self, HostError>
    where
        F: Fn(HostEvent) + Send + Sync + 'static,
    {
        let on_message: OnMessage = Arc::new(on_message);
        let attached = Attached::spawn(&config, &on_message)?;
        let sender = ExecutionSender::new(attached.context.sender());
        Ok(Self {
            config,
            on_message,
            attached,
            sender,
        })
    }

    /// Begin a run.
    ///
    /// The callback sees `HostEvent::Start` before this returns. A broken or
    /// terminated context is replaced first; a healthy one is reused.
    ///
    /// # Errors
    /// Returns error if the context cannot be reached or replaced.
    pub fn start_execution(&mut self, user_code: &str, module_code: &str) -> Result<(), HostError> {
        if self.attached.is_broken() {
            tracing::warn!(context = %self.context_id(), "context unusable, resetting before start");
            self.reset()?;
        }
        (self.on_message)(HostEvent::Start);
        self.attached
            .context
            .send(Envelope::start(user_code, module_code))?;
        Ok(())
    }

    /// Forward an envelope into the context.
    ///
    /// # Errors
    /// Returns error if the context has exited.
    pub fn send_message_to_execution(&self, envelope: Envelope) -> Result<(), HostError> {
        self.attached.context.send(envelope)?;
        Ok(())
    }

    /// Forward a `module` payload into the context.
    ///
    /// # Errors
    /// Returns error if the context has exited.
    pub fn send_module_message(&self, contents: Value) -> Result<(), HostError> {
        self.send_message_to_execution(Envelope::module(contents))
    }

    /// Tear down the current context and spawn a fresh one.
    ///
    /// The old run never reports `finished`.
    ///
    /// # Errors
    /// Returns error if the new context cannot be spawned.
    pub fn reset(&mut self) -> Result<(), HostError> {
        let attached = Attached::spawn(&self.config, &self.on_message)?;
        let old = std::mem::replace(&mut self.attached, attached);
        old.detach();
        self.sender.retarget(self.attached.context.sender());
        tracing::info!(old = %old.context.id(), new = %self.context_id(), "host controller reset");
        Ok(())
    }

    /// Stop the current context without replacing it. The next
    /// `start_execution` spawns a new one.
    pub fn terminate(&self) {
        self.attached.context.terminate();
    }

    /// Handle for bidirectional plugins.
    #[must_use]
    pub fn sender(&self) -> ExecutionSender {
        self.sender.clone()
    }

    /// Id of the current context.
    #[must_use]
    pub const fn context_id(&self) -> Uuid {
        self.attached.context.id()
    }

    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

impl Drop for HostController {
    fn drop(&mut self) {
        self.attached.detach();
    }
}

async fn relay(
    id: Uuid,
    mut events: mpsc::UnboundedReceiver<Envelope>,
    on_message: OnMessage,
    broken: Arc<AtomicBool>,
) {
    while let Some(envelope) = events.recv().await {
        let event = match envelope {
            Envelope::Module { contents } => HostEvent::Message { message: contents },
            Envelope::Console(message) => {
                tracing::debug!(context = %id, ?message, "sandbox console");
                HostEvent::Console(message)
            }
            Envelope::ClearConsole => HostEvent::ClearConsole,
            Envelope::Finished => {
                tracing::debug!(context = %id, "execution finished");
                HostEvent::Finished
            }
            Envelope::Start { .. } => {
                tracing::warn!(context = %id, "ignoring start envelope from sandbox");
                continue;
            }
        };
        on_message(event);
    }
    tracing::warn!(context = %id, "execution context exited");
    broken.store(true, Ordering::SeqCst);
}
