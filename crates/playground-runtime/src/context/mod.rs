//! Isolated execution contexts.
//!
//! A context is a dedicated OS thread running a single-threaded tokio runtime
//! and an event loop that owns at most one session. The host talks to it only
//! through envelopes.

mod blocking;
mod direct;

use std::{rc::Rc, thread::JoinHandle, time::Duration};

use playground_core::{ConsoleMessage, ContextVariant, Envelope, SandboxConfig};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::ContextError,
    outbox::Outbox,
    session::{Session, SessionShared},
};

use self::{blocking::BlockingBackend, direct::DirectBackend};

/// Builds sessions for one execution model.
pub(crate) trait Backend {
    /// Load the module, bind capabilities and run user code.
    ///
    /// Session failures are reported through the session and still yield a
    /// session; only a broken sandbox is an error.
    fn start(
        &mut self,
        shared: Rc<SessionShared>,
        user_code: &str,
        module_code: &str,
    ) -> Result<Session, ContextError>;
}

/// Host-side handle to a running context.
///
/// Dropping the handle terminates the context.
pub struct ContextHandle {
    id: Uuid,
    variant: ContextVariant,
    commands: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

impl ContextHandle {
    /// Spawn a context thread.
    ///
    /// Returns the handle and the receiver for envelopes the sandbox emits.
    ///
    /// # Errors
    /// Returns [`ContextError::Spawn`] if the thread cannot be created.
    pub fn spawn(
        config: &SandboxConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>), ContextError> {
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn({
                let config = config.clone();
                let cancel = cancel.clone();
                move || run_context(id, config, command_rx, event_tx, cancel)
            })?;

        tracing::info!(%id, variant = ?config.variant, "execution context spawned");
        Ok((
            Self {
                id,
                variant: config.variant,
                commands: command_tx,
                cancel,
                thread,
            },
            event_rx,
        ))
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn variant(&self) -> ContextVariant {
        self.variant
    }

    /// Queue an envelope for the context.
    ///
    /// # Errors
    /// Returns [`ContextError::Closed`] if the context has exited.
    pub fn send(&self, envelope: Envelope) -> Result<(), ContextError> {
        self.commands.send(envelope).map_err(|_| ContextError::Closed)
    }

    /// A clonable sender targeting this context.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.commands.clone()
    }

    /// Stop the context. Running user code is interrupted at the next hook
    /// check and nothing further is emitted.
    pub fn terminate(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(id = %self.id, "terminating execution context");
            self.cancel.cancel();
        }
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the context thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_context(
    id: Uuid,
    config: SandboxConfig,
    commands: mpsc::UnboundedReceiver<Envelope>,
    host: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
) {
    let fatal = |host: &mpsc::UnboundedSender<Envelope>, err: &ContextError| {
        tracing::error!(%id, "execution context failed: {err}");
        let _ = host.send(Envelope::Console(ConsoleMessage::stderr(err.to_string())));
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return fatal(&host, &ContextError::Interceptor(e.to_string())),
    };

    let (outbox, forwarder) = match config.variant {
        ContextVariant::Direct => (Outbox::Direct(host.clone()), None),
        ContextVariant::Blocking => {
            match Outbox::queued(config.outbound_queue_capacity, host.clone(), &config.thread_name) {
                Ok((outbox, forwarder)) => (outbox, Some(forwarder)),
                Err(e) => return fatal(&host, &ContextError::Interceptor(e.to_string())),
            }
        }
    };
    drop(host);

    let backend: Box<dyn Backend> = match config.variant {
        ContextVariant::Direct => Box::new(DirectBackend::new(config.clone(), cancel.clone())),
        ContextVariant::Blocking => Box::new(BlockingBackend::new(config.clone(), cancel.clone())),
    };

    let mut event_loop = EventLoop {
        config,
        cancel: cancel.clone(),
        outbox: outbox.clone(),
        backend,
        session: None,
    };
    if let Err(err) = runtime.block_on(event_loop.run(commands)) {
        tracing::error!(%id, "execution context failed: {err}");
        if !cancel.is_cancelled() {
            outbox.send(Envelope::Console(ConsoleMessage::stderr(err.to_string())));
        }
    }

    drop(event_loop);
    drop(outbox);
    if let Some(forwarder) = forwarder {
        let _ = forwarder.join();
    }
    tracing::info!(%id, "execution context stopped");
}

struct EventLoop {
    config: SandboxConfig,
    cancel: CancellationToken,
    outbox: Outbox,
    backend: Box<dyn Backend>,
    session: Option<Session>,
}

impl EventLoop {
    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<(), ContextError> {
        let cancel = self.cancel.clone();
        loop {
            let deadline = self.session.as_ref().and_then(Session::next_due);
            let wake_at = deadline.map_or_else(
                || Instant::now() + Duration::from_secs(86_400),
                Instant::from_std,
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(envelope) => self.dispatch(envelope)?,
                    None => {
                        tracing::debug!("host dropped the command channel");
                        break;
                    }
                },
                () = sleep_until(wake_at), if deadline.is_some() => {
                    if let Some(session) = self.session.as_mut() {
                        session.fire_due(std::time::Instant::now());
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            if self.session.as_mut().is_some_and(Session::settle) {
                tracing::debug!("session finished");
                self.session = None;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<(), ContextError> {
        match envelope {
            Envelope::Start {
                user_code,
                module_code,
            } => {
                if let Some(old) = self.session.take() {
                    tracing::debug!(phase = ?old.phase(), "replacing unfinished session");
                }
                let shared =
                    SessionShared::new(self.outbox.clone(), self.cancel.clone(), &self.config);
                self.session = Some(self.backend.start(shared, &user_code, &module_code)?);
            }
            Envelope::Module { contents } => match self.session.as_mut() {
                Some(session) => session.deliver(&contents),
                None => tracing::debug!("no active session, dropping module message"),
            },
            other => tracing::warn!(kind = other.kind(), "unexpected envelope from host"),
        }
        Ok(())
    }
}
