//! Blocking-interpreter variant.
//!
//! The module still loads in its own per-session realm. User code runs in a
//! persistent interpreter, created on first use, where every capability is a
//! native callable that marshals its arguments across the realm boundary.
//! Output leaves through the bounded outbox while the interpreter is busy.

use std::{rc::Rc, time::Instant};

use mlua::{Function, Lua, MultiValue, Table, Value, Variadic};
use playground_core::{SandboxConfig, SessionError};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;

use super::Backend;
use crate::{
    error::{ContextError, describe},
    facade,
    loader::{self, CapabilitySet},
    marshal,
    session::{Phase, Session, SessionShared},
};

pub(crate) struct BlockingBackend {
    config: SandboxConfig,
    cancel: CancellationToken,
    interpreter: Option<Lua>,
}

impl BlockingBackend {
    pub(crate) const fn new(config: SandboxConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            interpreter: None,
        }
    }

    fn interpreter(&mut self) -> Result<&Lua, ContextError> {
        let lua = match self.interpreter.take() {
            Some(lua) => lua,
            None => {
                let started = Instant::now();
                tracing::info!("loading interpreter");
                let lua = facade::sandbox_state(&self.config, &self.cancel)?;
                tracing::debug!(elapsed = ?started.elapsed(), "interpreter ready");
                lua
            }
        };
        Ok(self.interpreter.insert(lua))
    }
}

impl Backend for BlockingBackend {
    fn start(
        &mut self,
        shared: Rc<SessionShared>,
        user_code: &str,
        module_code: &str,
    ) -> Result<Session, ContextError> {
        let realm = facade::sandbox_state(&self.config, &self.cancel)?;
        let module_env = facade::install(&realm, &shared)?;
        let (send, subscribe) = facade::module_bindings(&realm, &shared)?;
        let interpreter = self.interpreter()?;
        let user_env = facade::install(interpreter, &shared)?;

        let mut session = Session::new(Rc::clone(&shared), realm);
        session.set_phase(Phase::Loading);

        let prepared = {
            let realm = session.realm();
            loader::load_module(realm, &module_env, module_code)
                .and_then(|factory| loader::instantiate(&factory, send, subscribe))
                .and_then(|capabilities| {
                    register(realm, interpreter, &user_env, &capabilities)?;
                    loader::compile_user_code(
                        interpreter,
                        &user_env,
                        user_code,
                        &CapabilitySet::default(),
                    )
                })
        };

        match prepared {
            Ok(main) => {
                session.set_phase(Phase::Running);
                session.run_blocking(&main);
            }
            Err(err) => shared.report(&err),
        }

        shared.check_quiescence();
        Ok(session)
    }
}

/// Expose every capability by name in the interpreter environment.
fn register(
    realm: &Lua,
    interpreter: &Lua,
    env: &Table,
    capabilities: &CapabilitySet,
) -> Result<(), SessionError> {
    for (name, value) in capabilities.iter() {
        let bridged = bridge(realm, interpreter, value, 0)?;
        env.raw_set(name, bridged)
            .map_err(|e| SessionError::Init(describe(&e)))?;
    }
    Ok(())
}

/// Copy a module value into the interpreter, wrapping functions.
fn bridge(realm: &Lua, interpreter: &Lua, value: &Value, depth: usize) -> Result<Value, SessionError> {
    match value {
        Value::Function(target) => native_callable(realm, interpreter, target.clone())
            .map(Value::Function)
            .map_err(|e| SessionError::Init(describe(&e))),
        Value::Table(table) => {
            if depth >= marshal::MAX_DEPTH {
                return Err(SessionError::Marshal(
                    crate::error::MarshalError::TooDeep(marshal::MAX_DEPTH).to_string(),
                ));
            }
            let copy = interpreter
                .create_table()
                .map_err(|e| SessionError::Init(describe(&e)))?;
            for pair in table.pairs::<Value, Value>() {
                let (key, entry) = pair.map_err(|e| SessionError::Init(describe(&e)))?;
                let key = bridge(realm, interpreter, &key, depth + 1)?;
                let entry = bridge(realm, interpreter, &entry, depth + 1)?;
                copy.raw_set(key, entry)
                    .map_err(|e| SessionError::Init(describe(&e)))?;
            }
            Ok(Value::Table(copy))
        }
        scalar => {
            let json = marshal::to_json(scalar).map_err(|e| SessionError::Marshal(e.to_string()))?;
            marshal::from_json(interpreter, &json).map_err(|e| SessionError::Marshal(describe(&e)))
        }
    }
}

/// Wrap a module-realm function as an interpreter function.
///
/// Arguments and the first result cross as JSON text, so each realm only
/// ever touches its own values.
fn native_callable(realm: &Lua, interpreter: &Lua, target: Function) -> mlua::Result<Function> {
    let invoke = realm.create_function(move |lua, payload: String| {
        let args: Json = serde_json::from_str(&payload).map_err(mlua::Error::external)?;
        let args = match args {
            Json::Array(items) => items
                .iter()
                .map(|item| marshal::from_json(lua, item))
                .collect::<mlua::Result<MultiValue>>()?,
            other => MultiValue::from_iter([marshal::from_json(lua, &other)?]),
        };
        let result = target.call::<Value>(args)?;
        let result = marshal::to_json(&result).map_err(mlua::Error::external)?;
        Ok(result.to_string())
    })?;

    interpreter.create_function(move |lua, args: Variadic<Value>| {
        let payload = marshal::args_to_json(&args).map_err(mlua::Error::external)?;
        let reply: String = invoke.call(payload.to_string())?;
        let reply: Json = serde_json::from_str(&reply).map_err(mlua::Error::external)?;
        marshal::from_json(lua, &reply)
    })
}
