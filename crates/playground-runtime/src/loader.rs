//! Module loading and user-code compilation.

use mlua::{ChunkMode, Function, Lua, Table, Value};
use playground_core::SessionError;

use crate::error::describe;

/// Reserved words that can never be capability names.
const KEYWORDS: [&str; 22] = [
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Named values a module exposes to user code, in name order.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    entries: Vec<(String, Value)>,
}

impl CapabilitySet {
    /// Collect the usable entries of a factory result.
    ///
    /// Keys that are not identifiers are skipped with a warning.
    ///
    /// # Errors
    /// Returns an error if the table cannot be traversed.
    pub fn from_table(table: &Table) -> mlua::Result<Self> {
        let mut entries = Vec::new();
        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let name: String = match &key {
                Value::String(s) => s.to_string_lossy().into(),
                other => {
                    tracing::warn!(key = other.type_name(), "ignoring non-string capability key");
                    continue;
                }
            };
            if !is_identifier(&name) {
                tracing::warn!(%name, "ignoring capability that is not a valid identifier");
                continue;
            }
            entries.push((name, value));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self { entries })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capability names, in binding order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Capability values, in binding order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, value)| value)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Whether `name` can be bound as a Lua local.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !KEYWORDS.contains(&name)
}

/// Evaluate module text and extract its factory.
///
/// The chunk must return a function, or a table whose `default` field is one.
///
/// # Errors
/// Returns [`SessionError::Load`] on syntax errors, evaluation errors or a
/// missing factory.
pub fn load_module(lua: &Lua, env: &Table, source: &str) -> Result<Function, SessionError> {
    let exported = lua
        .load(source)
        .set_name("=module")
        .set_mode(ChunkMode::Text)
        .set_environment(env.clone())
        .eval::<Value>()
        .map_err(|e| SessionError::Load(describe(&e)))?;

    match exported {
        Value::Function(factory) => Ok(factory),
        Value::Table(table) => match table.get::<Value>("default") {
            Ok(Value::Function(factory)) => Ok(factory),
            _ => Err(SessionError::Load(
                "module table has no `default` factory function".to_string(),
            )),
        },
        other => Err(SessionError::Load(format!(
            "module must return a factory function, got {}",
            other.type_name()
        ))),
    }
}

/// Call the factory with the session's `send` and `subscribe`.
///
/// # Errors
/// Returns [`SessionError::Init`] if the factory raises or returns something
/// other than a table or nil.
pub fn instantiate(
    factory: &Function,
    send: Function,
    subscribe: Function,
) -> Result<CapabilitySet, SessionError> {
    let result = factory
        .call::<Value>((send, subscribe))
        .map_err(|e| SessionError::Init(describe(&e)))?;
    match result {
        Value::Nil => Ok(CapabilitySet::default()),
        Value::Table(table) => {
            CapabilitySet::from_table(&table).map_err(|e| SessionError::Init(describe(&e)))
        }
        other => Err(SessionError::Init(format!(
            "module factory must return a table, got {}",
            other.type_name()
        ))),
    }
}

/// Prologue binding the capability names to the chunk's varargs.
///
/// Kept on the first line so user line numbers are unchanged.
#[must_use]
pub fn binding_prologue(capabilities: &CapabilitySet) -> String {
    if capabilities.is_empty() {
        return String::new();
    }
    let names: Vec<&str> = capabilities.names().collect();
    format!("local {} = ...; ", names.join(", "))
}

/// Compile user code with the capability names in scope.
///
/// # Errors
/// Returns [`SessionError::Compile`] on syntax errors.
pub fn compile_user_code(
    lua: &Lua,
    env: &Table,
    source: &str,
    capabilities: &CapabilitySet,
) -> Result<Function, SessionError> {
    let chunk = format!("{}{source}", binding_prologue(capabilities));
    lua.load(chunk)
        .set_name("=user")
        .set_mode(ChunkMode::Text)
        .set_environment(env.clone())
        .into_function()
        .map_err(|e| SessionError::Compile(describe(&e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(lua: &Lua) -> Table {
        lua.globals()
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("addPlanet"));
        assert!(is_identifier("_private1"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("1st"));
        assert!(!is_identifier("play-note"));
        assert!(!is_identifier("end"));
    }

    #[test]
    fn test_load_function_and_default_field() {
        let lua = Lua::new();
        assert!(load_module(&lua, &env(&lua), "return function() end").is_ok());
        assert!(load_module(&lua, &env(&lua), "return { default = function() end }").is_ok());

        let err = load_module(&lua, &env(&lua), "return 5").unwrap_err();
        assert_eq!(err.kind(), "LoadError");
        assert!(err.message().contains("integer"));

        let err = load_module(&lua, &env(&lua), "return {").unwrap_err();
        assert!(matches!(err, SessionError::Load(_)));
    }

    #[test]
    fn test_capabilities_sorted_and_filtered() {
        let lua = Lua::new();
        let factory = load_module(
            &lua,
            &env(&lua),
            "return function(send, subscribe) return { zeta = 1, alpha = 2, ['not ok'] = 3, ['end'] = 4, [1] = 5 } end",
        )
        .unwrap();
        let noop = lua.create_function(|_, ()| Ok(())).unwrap();
        let caps = instantiate(&factory, noop.clone(), noop).unwrap();
        assert_eq!(caps.names().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
        assert_eq!(caps.get("zeta"), Some(&Value::Integer(1)));
        assert_eq!(binding_prologue(&caps), "local alpha, zeta = ...; ");
    }

    #[test]
    fn test_factory_failures_are_init_errors() {
        let lua = Lua::new();
        let noop = lua.create_function(|_, ()| Ok(())).unwrap();

        let raising = load_module(&lua, &env(&lua), "return function() error('nope', 0) end").unwrap();
        let err = instantiate(&raising, noop.clone(), noop.clone()).unwrap_err();
        assert_eq!(err, SessionError::Init("nope".to_string()));

        let wrong = load_module(&lua, &env(&lua), "return function() return 'x' end").unwrap();
        assert!(matches!(
            instantiate(&wrong, noop.clone(), noop.clone()),
            Err(SessionError::Init(_))
        ));

        let empty = load_module(&lua, &env(&lua), "return function() end").unwrap();
        assert!(instantiate(&empty, noop.clone(), noop).unwrap().is_empty());
    }

    #[test]
    fn test_compile_binds_positionally() {
        let lua = Lua::new();
        let factory = load_module(
            &lua,
            &env(&lua),
            "return function() return { double = function(x) return x * 2 end, base = 10 } end",
        )
        .unwrap();
        let noop = lua.create_function(|_, ()| Ok(())).unwrap();
        let caps = instantiate(&factory, noop.clone(), noop).unwrap();

        let func = compile_user_code(&lua, &env(&lua), "return double(base)", &caps).unwrap();
        let args: mlua::MultiValue = caps.values().cloned().collect();
        assert_eq!(func.call::<i64>(args).unwrap(), 20);

        let err = compile_user_code(&lua, &env(&lua), "double(", &caps).unwrap_err();
        assert_eq!(err.kind(), "CompileError");
        assert!(err.message().contains("user:1:"));
    }

    #[test]
    fn test_binary_chunks_are_refused() {
        let lua = Lua::new();
        let bytecode: mlua::String = lua
            .load("return string.dump(function() return 1 end)")
            .eval()
            .unwrap();
        let bytecode = String::from_utf8_lossy(&bytecode.as_bytes()).into_owned();

        let err = load_module(&lua, &env(&lua), &bytecode).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
        let caps = CapabilitySet::default();
        let err = compile_user_code(&lua, &env(&lua), &bytecode, &caps).unwrap_err();
        assert_eq!(err.kind(), "CompileError");
    }
}
