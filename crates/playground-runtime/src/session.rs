//! One execution session: registries, main routine and completion detection.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use mlua::{Function, Lua, MultiValue, Thread, ThreadStatus, Value};
use playground_core::{Envelope, SandboxConfig, SessionError, SubscriberRegistry, SubscriptionId};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

use crate::{
    error::describe,
    facade, marshal,
    outbox::Outbox,
    registry::{CallbackRegistry, Fired, TimerKind},
};

/// A scheduled callback and the extra arguments it is called with.
#[derive(Clone)]
pub(crate) struct Timer {
    pub(crate) func: Function,
    pub(crate) args: Vec<Value>,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Loading,
    Running,
    Finished,
}

/// State reachable from the sandbox callbacks of one session.
pub(crate) struct SessionShared {
    outbox: Outbox,
    cancel: CancellationToken,
    pub(crate) timers: RefCell<CallbackRegistry<Timer>>,
    pub(crate) subscribers: RefCell<SubscriberRegistry<Function>>,
    pub(crate) min_repeat: Duration,
    interrupt_every: u32,
    confirm_pending: Cell<bool>,
    closed: Cell<bool>,
}

impl SessionShared {
    pub(crate) fn new(outbox: Outbox, cancel: CancellationToken, config: &SandboxConfig) -> Rc<Self> {
        Rc::new(Self {
            outbox,
            cancel,
            timers: RefCell::new(CallbackRegistry::new()),
            subscribers: RefCell::new(SubscriberRegistry::new()),
            min_repeat: config.min_repeat_interval(),
            interrupt_every: config.interrupt_check_interval,
            confirm_pending: Cell::new(false),
            closed: Cell::new(false),
        })
    }

    /// False once the session finished or the context was cancelled.
    pub(crate) fn is_live(&self) -> bool {
        !self.closed.get() && !self.cancel.is_cancelled()
    }

    /// Emit an envelope unless the session is closed.
    pub(crate) fn post(&self, envelope: Envelope) {
        if !self.is_live() {
            tracing::trace!(kind = envelope.kind(), "dropping envelope from closed session");
            return;
        }
        if !self.outbox.send(envelope) {
            tracing::debug!("host channel closed");
        }
    }

    /// Report a session error on stderr.
    ///
    /// Errors raised while the context is being terminated are never shown.
    pub(crate) fn report(&self, err: &SessionError) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(kind = err.kind(), "session error: {}", err.message());
        self.post(Envelope::Console(err.to_console()));
    }

    /// Make a coroutine interruptible by termination.
    pub(crate) fn guard(&self, thread: &Thread) {
        facade::guard_thread(thread, self.interrupt_every, &self.cancel);
    }

    /// Request a confirmation pass if the registry is empty.
    pub(crate) fn check_quiescence(&self) {
        if self.timers.borrow().is_empty() {
            self.confirm_pending.set(true);
        }
    }

    fn close(&self) {
        self.closed.set(true);
        self.confirm_pending.set(false);
        self.timers.borrow_mut().clear();
        self.subscribers.borrow_mut().clear();
    }
}

/// A running session bound to its module realm.
pub(crate) struct Session {
    shared: Rc<SessionShared>,
    main: Option<Thread>,
    phase: Phase,
    realm: Lua,
}

impl Session {
    pub(crate) const fn new(shared: Rc<SessionShared>, realm: Lua) -> Self {
        Self {
            shared,
            main: None,
            phase: Phase::Idle,
            realm,
        }
    }

    pub(crate) const fn realm(&self) -> &Lua {
        &self.realm
    }

    pub(crate) const fn shared(&self) -> &Rc<SessionShared> {
        &self.shared
    }

    pub(crate) const fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "session phase");
        self.phase = phase;
    }

    /// Run `func` as the main coroutine until it returns or suspends.
    pub(crate) fn run_main(&mut self, func: Function, args: MultiValue) {
        let thread = match self.realm.create_thread(func) {
            Ok(thread) => thread,
            Err(e) => {
                self.shared.report(&SessionError::Runtime(describe(&e)));
                return;
            }
        };
        self.shared.guard(&thread);
        if let Err(e) = thread.resume::<MultiValue>(args) {
            self.shared.report(&SessionError::Runtime(describe(&e)));
        }
        if thread.status() == ThreadStatus::Resumable {
            tracing::debug!("main routine suspended");
            self.main = Some(thread);
        }
    }

    /// Run `func` to completion with a single call.
    pub(crate) fn run_blocking(&self, func: &Function) {
        if let Err(e) = func.call::<()>(()) {
            self.shared.report(&SessionError::Runtime(describe(&e)));
        }
    }

    /// Whether the main coroutine is waiting for input.
    pub(crate) fn is_suspended(&self) -> bool {
        self.main
            .as_ref()
            .is_some_and(|thread| thread.status() == ThreadStatus::Resumable)
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.shared.timers.borrow().next_due()
    }

    /// Fire at most one due callback. Returns whether one fired.
    pub(crate) fn fire_due(&mut self, now: Instant) -> bool {
        let fired = self.shared.timers.borrow_mut().pop_due(now);
        let Some(Fired { id, kind, callback }) = fired else {
            return false;
        };
        tracing::trace!(id, ?kind, "timer fired");
        if kind == TimerKind::Once {
            self.shared.check_quiescence();
        }
        let args: MultiValue = callback.args.into_iter().collect();
        if let Err(e) = callback.func.call::<()>(args) {
            self.shared.report(&SessionError::Runtime(describe(&e)));
        }
        true
    }

    /// Hand an inbound `module` payload to subscribers and the main routine.
    pub(crate) fn deliver(&mut self, contents: &Json) {
        if !self.shared.is_live() {
            return;
        }
        let value = match marshal::from_json(&self.realm, contents) {
            Ok(value) => value,
            Err(e) => {
                self.shared.report(&SessionError::Marshal(describe(&e)));
                return;
            }
        };

        let handlers: Vec<(SubscriptionId, Function)> = self
            .shared
            .subscribers
            .borrow()
            .iter()
            .map(|(id, handler)| (id, handler.clone()))
            .collect();
        for (id, handler) in handlers {
            // Skip handlers removed by an earlier one in this pass.
            if !self.shared.subscribers.borrow().contains(id) {
                continue;
            }
            if let Err(e) = handler.call::<()>(value.clone()) {
                self.shared.report(&SessionError::Runtime(describe(&e)));
            }
        }

        if !self.is_suspended() {
            return;
        }
        if let Some(thread) = self.main.clone() {
            if let Err(e) = thread.resume::<MultiValue>(value) {
                self.shared.report(&SessionError::Runtime(describe(&e)));
            }
            if thread.status() != ThreadStatus::Resumable {
                tracing::debug!("main routine completed");
                self.main = None;
                self.shared.check_quiescence();
            }
        }
    }

    /// Confirmation pass run after every event-loop turn.
    ///
    /// Returns true if the session finished.
    pub(crate) fn settle(&mut self) -> bool {
        if !self.shared.confirm_pending.replace(false) || !self.shared.is_live() {
            return false;
        }
        if !self.shared.timers.borrow().is_empty() || self.is_suspended() {
            return false;
        }
        self.finish();
        true
    }

    fn finish(&mut self) {
        self.shared.post(Envelope::Finished);
        self.shared.close();
        self.main = None;
        self.set_phase(Phase::Finished);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Break reference cycles between registered callbacks and the shared
        // state while the realm is still open.
        self.shared.close();
    }
}
