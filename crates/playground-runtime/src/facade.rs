//! Sandbox realms and the per-session scheduling/logging facade.
//!
//! Instead of patching globals, every session gets its own environment table:
//! a copy of the realm's globals plus `setTimeout`, `clearTimeout`,
//! `setInterval`, `clearInterval`, `console` and `print`, all bound to that
//! session's registry and outbox.

use std::{rc::Rc, time::Duration, time::Instant};

use mlua::{
    ChunkMode, Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Thread, Value,
    Variadic, VmState,
};
use playground_core::{ConsoleLevel, ConsoleMessage, Envelope, SandboxConfig};
use tokio_util::sync::CancellationToken;

use crate::{
    registry::TimerId,
    sanitize::{sanitize, sanitize_all},
    session::{SessionShared, Timer},
};

/// Error text raised inside the interpreter when its context is cancelled.
pub(crate) const TERMINATED: &str = "execution terminated";

/// Longest accepted timer delay, in milliseconds.
pub(crate) const MAX_DELAY_MS: f64 = 2_147_483_647.0;

/// Create an interpreter with the restricted standard library and the
/// termination hook installed.
pub(crate) fn sandbox_state(config: &SandboxConfig, cancel: &CancellationToken) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    let globals = lua.globals();
    for name in ["dofile", "loadfile"] {
        globals.raw_set(name, Value::Nil)?;
    }
    globals.get::<Table>("string")?.raw_set("dump", Value::Nil)?;
    // Sessions get their own library copies; the shared string metatable
    // must stay out of reach.
    lua.load("getmetatable('').__metatable = false")
        .set_name("=sandbox")
        .exec()?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(config.interrupt_check_interval),
        termination_hook(cancel),
    );
    Ok(lua)
}

/// Install the termination hook on a coroutine.
pub(crate) fn guard_thread(thread: &Thread, every: u32, cancel: &CancellationToken) {
    thread.set_hook(
        HookTriggers::new().every_nth_instruction(every),
        termination_hook(cancel),
    );
}

fn termination_hook(
    cancel: &CancellationToken,
) -> impl Fn(&Lua, mlua::Debug<'_>) -> mlua::Result<VmState> + 'static {
    let token = cancel.clone();
    move |_lua, _debug| {
        if token.is_cancelled() {
            Err(mlua::Error::runtime(TERMINATED))
        } else {
            Ok(VmState::Continue)
        }
    }
}

/// Build a session environment in `lua`.
pub(crate) fn install(lua: &Lua, shared: &Rc<SessionShared>) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    for pair in lua.globals().pairs::<Value, Value>() {
        let (key, value) = pair?;
        let value = match value {
            Value::Table(library) => Value::Table(copy_table(lua, &library)?),
            other => other,
        };
        env.raw_set(key, value)?;
    }
    env.raw_set("_G", env.clone())?;

    install_load(lua, &env)?;
    install_coroutines(lua, &env, shared)?;
    install_timers(lua, &env, shared)?;
    install_console(lua, &env, shared)?;
    Ok(env)
}

fn copy_table(lua: &Lua, source: &Table) -> mlua::Result<Table> {
    let copy = lua.create_table()?;
    for pair in source.pairs::<Value, Value>() {
        let (key, value) = pair?;
        copy.raw_set(key, value)?;
    }
    Ok(copy)
}

/// `send` and `subscribe`, the two functions handed to a module factory.
pub(crate) fn module_bindings(
    lua: &Lua,
    shared: &Rc<SessionShared>,
) -> mlua::Result<(Function, Function)> {
    let state = Rc::clone(shared);
    let send = lua.create_function(move |lua, payload: Value| {
        state.post(Envelope::module(sanitize(lua, &payload)));
        Ok(())
    })?;

    let state = Rc::clone(shared);
    let subscribe = lua.create_function(move |lua, handler: Function| {
        let id = state.subscribers.borrow_mut().subscribe(handler);
        tracing::trace!(%id, "module subscriber added");
        let owner = Rc::clone(&state);
        lua.create_function(move |_, ()| {
            owner.subscribers.borrow_mut().unsubscribe(id);
            Ok(())
        })
    })?;

    Ok((send, subscribe))
}

/// `load` defaults its environment to the session instead of the realm and
/// only accepts source text.
fn install_load(lua: &Lua, env: &Table) -> mlua::Result<()> {
    let load: Function = lua.globals().get("load")?;
    let scope = env.clone();
    let wrapped = lua.create_function(
        move |_, (chunk, name, _mode, chunk_env): (Value, Value, Value, Option<Table>)| {
            let chunk_env = chunk_env.unwrap_or_else(|| scope.clone());
            load.call::<MultiValue>((chunk, name, "t", chunk_env))
        },
    )?;
    env.raw_set("load", wrapped)
}

/// Coroutines created by sandboxed code stay interruptible.
fn install_coroutines(lua: &Lua, env: &Table, shared: &Rc<SessionShared>) -> mlua::Result<()> {
    let coroutine: Table = env.get("coroutine")?;
    let table: Table = env.get("table")?;

    let state = Rc::clone(shared);
    let create = lua.create_function(move |lua, func: Function| {
        let thread = lua.create_thread(func)?;
        state.guard(&thread);
        Ok(thread)
    })?;
    let wrap: Function = lua
        .load(
            r"
local create, resume, pack, unpack = ...
return function(f)
  local co = create(f)
  return function(...)
    local r = pack(resume(co, ...))
    if not r[1] then error(r[2], 0) end
    return unpack(r, 2, r.n)
  end
end",
        )
        .set_name("=coroutine")
        .call((
            create.clone(),
            coroutine.get::<Function>("resume")?,
            table.get::<Function>("pack")?,
            table.get::<Function>("unpack")?,
        ))?;

    coroutine.raw_set("create", create)?;
    coroutine.raw_set("wrap", wrap)
}

fn install_timers(lua: &Lua, env: &Table, shared: &Rc<SessionShared>) -> mlua::Result<()> {
    let (state, scope) = (Rc::clone(shared), env.clone());
    let set_timeout = lua.create_function(
        move |lua, (callback, delay, args): (Value, Value, Variadic<Value>)| {
            if !state.is_live() {
                return Ok(None);
            }
            let func = timer_callback(lua, &scope, callback, "setTimeout")?;
            let timer = Timer {
                func,
                args: args.to_vec(),
            };
            let id = state
                .timers
                .borrow_mut()
                .schedule_once(Instant::now(), millis(&delay), timer);
            Ok(Some(id))
        },
    )?;

    let (state, scope) = (Rc::clone(shared), env.clone());
    let set_interval = lua.create_function(
        move |lua, (callback, period, args): (Value, Value, Variadic<Value>)| {
            if !state.is_live() {
                return Ok(None);
            }
            let func = timer_callback(lua, &scope, callback, "setInterval")?;
            let timer = Timer {
                func,
                args: args.to_vec(),
            };
            let period = millis(&period).max(state.min_repeat);
            let id = state
                .timers
                .borrow_mut()
                .schedule_repeating(Instant::now(), period, timer);
            Ok(Some(id))
        },
    )?;

    let state = Rc::clone(shared);
    let clear_timeout = lua.create_function(move |_, id: Value| {
        if let Some(id) = timer_id(&id) {
            state.timers.borrow_mut().cancel_once(id);
        }
        state.check_quiescence();
        Ok(())
    })?;

    let state = Rc::clone(shared);
    let clear_interval = lua.create_function(move |_, id: Value| {
        if let Some(id) = timer_id(&id) {
            state.timers.borrow_mut().cancel_repeating(id);
        }
        state.check_quiescence();
        Ok(())
    })?;

    env.raw_set("setTimeout", set_timeout)?;
    env.raw_set("setInterval", set_interval)?;
    env.raw_set("clearTimeout", clear_timeout)?;
    env.raw_set("clearInterval", clear_interval)
}

fn install_console(lua: &Lua, env: &Table, shared: &Rc<SessionShared>) -> mlua::Result<()> {
    let console = lua.create_table()?;
    for level in ConsoleLevel::ALL {
        console.raw_set(level.as_str(), console_fn(lua, shared, level)?)?;
    }
    let state = Rc::clone(shared);
    console.raw_set(
        "clear",
        lua.create_function(move |_, ()| {
            state.post(Envelope::ClearConsole);
            Ok(())
        })?,
    )?;

    env.raw_set("console", console)?;
    env.raw_set("print", console_fn(lua, shared, ConsoleLevel::Log)?)
}

fn console_fn(lua: &Lua, shared: &Rc<SessionShared>, level: ConsoleLevel) -> mlua::Result<Function> {
    let state = Rc::clone(shared);
    lua.create_function(move |lua, args: Variadic<Value>| {
        state.post(Envelope::Console(ConsoleMessage::Log {
            level,
            data: sanitize_all(lua, &args),
        }));
        Ok(())
    })
}

/// Functions are used as-is; source strings are compiled in the session.
fn timer_callback(lua: &Lua, env: &Table, callback: Value, api: &str) -> mlua::Result<Function> {
    match callback {
        Value::Function(func) => Ok(func),
        Value::String(source) => {
            let source: String = source.to_string_lossy().into();
            lua.load(source)
                .set_name("=timer")
                .set_mode(ChunkMode::Text)
                .set_environment(env.clone())
                .into_function()
        }
        other => Err(mlua::Error::runtime(format!(
            "{api}: callback must be a function or a source string, got {}",
            other.type_name()
        ))),
    }
}

/// Delay argument in milliseconds; missing, negative or non-numeric is zero
/// and anything past [`MAX_DELAY_MS`] is clamped.
fn millis(value: &Value) -> Duration {
    let ms = match value {
        Value::Integer(i) => *i as f64,
        Value::Number(n) => *n,
        Value::String(s) => s.to_string_lossy().trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(ms.min(MAX_DELAY_MS) / 1000.0)
}

fn timer_id(value: &Value) -> Option<TimerId> {
    match value {
        Value::Integer(i) => TimerId::try_from(*i).ok(),
        Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 => Some(*n as TimerId),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::outbox::Outbox;

    struct Harness {
        lua: Lua,
        env: Table,
        shared: Rc<SessionShared>,
        rx: mpsc::UnboundedReceiver<Envelope>,
    }

    fn harness() -> Harness {
        let cancel = CancellationToken::new();
        let lua = sandbox_state(&SandboxConfig::default(), &cancel).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SandboxConfig::default().with_min_repeat_interval_ms(5);
        let shared = SessionShared::new(Outbox::Direct(tx), cancel, &config);
        let env = install(&lua, &shared).unwrap();
        Harness {
            lua,
            env,
            shared,
            rx,
        }
    }

    impl Harness {
        fn exec(&self, src: &str) {
            self.lua
                .load(src)
                .set_environment(self.env.clone())
                .exec()
                .unwrap();
        }

        fn drain(&mut self) -> Vec<Envelope> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }
    }

    #[test]
    fn test_restricted_globals() {
        let h = harness();
        let (dofile, io, os, require): (Value, Value, Value, Value) = h
            .lua
            .load("return dofile, io, os, require")
            .set_environment(h.env.clone())
            .eval()
            .unwrap();
        assert!(dofile.is_nil() && io.is_nil() && os.is_nil() && require.is_nil());
    }

    #[test]
    fn test_console_levels_and_clear() {
        let mut h = harness();
        h.exec("console.warn('careful', 3); print({ 1, 2 }); console.clear()");
        assert_eq!(
            h.drain(),
            vec![
                Envelope::Console(ConsoleMessage::Log {
                    level: ConsoleLevel::Warn,
                    data: vec![json!("careful"), json!(3)],
                }),
                Envelope::Console(ConsoleMessage::Log {
                    level: ConsoleLevel::Log,
                    data: vec![json!([1, 2])],
                }),
                Envelope::ClearConsole,
            ]
        );
    }

    #[test]
    fn test_timers_land_in_registry() {
        let h = harness();
        h.exec("a = setTimeout(function() end, 10); b = setInterval('x = 1', 0)");
        assert_eq!(h.shared.timers.borrow().len(), 2);

        h.exec("clearInterval(b)");
        assert_eq!(h.shared.timers.borrow().len(), 1);
        // Wrong kind: ignored.
        h.exec("clearInterval(a)");
        assert_eq!(h.shared.timers.borrow().len(), 1);
        h.exec("clearTimeout(a); clearTimeout(a); clearTimeout('junk')");
        assert!(h.shared.timers.borrow().is_empty());
    }

    #[test]
    fn test_interval_period_is_clamped() {
        let h = harness();
        let before = Instant::now();
        h.exec("setInterval(function() end, -50)");
        let due = h.shared.timers.borrow().next_due().unwrap();
        assert!(due >= before + Duration::from_millis(5));
    }

    #[test]
    fn test_bad_callback_is_an_error() {
        let h = harness();
        let err = h
            .lua
            .load("setTimeout(42, 1)")
            .set_environment(h.env.clone())
            .exec()
            .unwrap_err();
        assert!(crate::error::describe(&err).contains("setTimeout: callback must be"));
    }

    #[test]
    fn test_load_defaults_to_session_env() {
        let h = harness();
        let kind: String = h
            .lua
            .load("return type(load('return setTimeout')())")
            .set_environment(h.env.clone())
            .eval()
            .unwrap();
        assert_eq!(kind, "function");
    }

    #[test]
    fn test_send_and_subscribe() {
        let mut h = harness();
        let (send, subscribe) = module_bindings(&h.lua, &h.shared).unwrap();
        send.call::<()>(h.lua.create_table_from([("n", 1)]).unwrap())
            .unwrap();
        assert_eq!(h.drain(), vec![Envelope::module(json!({ "n": 1 }))]);

        let handler = h.lua.create_function(|_, _: Value| Ok(())).unwrap();
        let unsubscribe: Function = subscribe.call(handler).unwrap();
        assert_eq!(h.shared.subscribers.borrow().len(), 1);
        unsubscribe.call::<()>(()).unwrap();
        assert!(h.shared.subscribers.borrow().is_empty());
    }

    #[test]
    fn test_huge_delays_are_clamped() {
        let mut h = harness();
        h.exec("local id = setTimeout(function() end, 1e300); clearTimeout(id); print('after')");
        assert!(h.shared.timers.borrow().is_empty());
        assert_eq!(h.drain().len(), 1);

        assert_eq!(
            millis(&Value::Number(f64::INFINITY)),
            Duration::from_millis(2_147_483_647)
        );
        assert_eq!(millis(&Value::Number(f64::NAN)), Duration::ZERO);
        assert_eq!(millis(&Value::Integer(250)), Duration::from_millis(250));
    }

    #[test]
    fn test_binary_chunks_are_refused() {
        let h = harness();
        let (dump, loaded, message): (Value, bool, String) = h
            .lua
            .load(r"local f, err = load('\27Lua\84\0'); return string.dump, f ~= nil, err")
            .set_environment(h.env.clone())
            .eval()
            .unwrap();
        assert!(dump.is_nil());
        assert!(!loaded);
        assert!(message.contains("binary"));
    }

    #[test]
    fn test_sessions_do_not_share_libraries() {
        let h = harness();
        h.exec("string.upper = nil; math.pi = 3");
        let second = install(&h.lua, &h.shared).unwrap();
        let (upper, pi, locked): (String, f64, bool) = h
            .lua
            .load("return string.upper('a'), math.pi, getmetatable('') == false")
            .set_environment(second)
            .eval()
            .unwrap();
        assert_eq!(upper, "A");
        assert!(pi > 3.1);
        assert!(locked);
    }

    #[test]
    fn test_cancelled_state_interrupts_loops() {
        let cancel = CancellationToken::new();
        let config = SandboxConfig::default().with_interrupt_check_interval(100);
        let lua = sandbox_state(&config, &cancel).unwrap();
        cancel.cancel();
        let err = lua.load("while true do end").exec().unwrap_err();
        assert!(crate::error::describe(&err).contains(TERMINATED));
    }
}
