//! Total conversion of interpreter values into transmissible JSON.
//!
//! Used for `console.*` arguments and `send` payloads. Never fails: anything
//! that cannot cross the channel is replaced by a descriptive string.

use std::{collections::HashSet, ffi::c_void};

use mlua::{Lua, Table, Value};
use serde_json::{Map, Number, Value as Json};

use crate::marshal::MAX_DEPTH;

struct Sanitizer<'a> {
    lua: &'a Lua,
    seen: HashSet<*const c_void>,
    depth: usize,
}

/// Sanitize one value.
#[must_use]
pub fn sanitize(lua: &Lua, value: &Value) -> Json {
    Sanitizer::new(lua).convert(value, None)
}

/// Sanitize an argument list. Tables shared between arguments are reported
/// as circular after their first appearance.
#[must_use]
pub fn sanitize_all(lua: &Lua, values: &[Value]) -> Vec<Json> {
    let mut sanitizer = Sanitizer::new(lua);
    values.iter().map(|v| sanitizer.convert(v, None)).collect()
}

impl<'a> Sanitizer<'a> {
    fn new(lua: &'a Lua) -> Self {
        Self {
            lua,
            seen: HashSet::new(),
            depth: 0,
        }
    }

    fn convert(&mut self, value: &Value, field: Option<&str>) -> Json {
        match value {
            Value::Nil => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(i) => Json::from(*i),
            Value::Number(n) => Number::from_f64(*n).map_or(Json::Null, Json::Number),
            Value::String(s) => Json::String(s.to_string_lossy().into()),
            Value::Table(table) => self.table(table),
            Value::Function(_) => {
                Json::String(format!("[Function: {}]", field.unwrap_or("anonymous")))
            }
            Value::Thread(_) => Json::String("[Thread]".to_string()),
            Value::LightUserData(ud) if ud.0.is_null() => Json::Null,
            Value::UserData(_) | Value::LightUserData(_) => self.render(value),
            Value::Error(err) => Json::String(crate::error::describe(err)),
            other => Json::String(format!("[{}]", other.type_name())),
        }
    }

    /// Userdata handles are shown through the sandbox's own `tostring`.
    fn render(&self, value: &Value) -> Json {
        let rendered = self
            .lua
            .globals()
            .get::<mlua::Function>("tostring")
            .and_then(|tostring| tostring.call::<String>(value.clone()));
        Json::String(rendered.unwrap_or_else(|_| format!("[{}]", value.type_name())))
    }

    fn table(&mut self, table: &Table) -> Json {
        if self.depth >= MAX_DEPTH {
            return Json::String("[Depth]".to_string());
        }
        if !self.seen.insert(table.to_pointer()) {
            return Json::String("[Circular]".to_string());
        }
        self.depth += 1;
        let converted = self.table_body(table);
        self.depth -= 1;
        converted
    }

    fn table_body(&mut self, table: &Table) -> Json {

        let entries: Vec<(Value, Value)> = table.pairs::<Value, Value>().filter_map(Result::ok).collect();
        let len = table.raw_len();
        let is_sequence = len > 0
            && entries.len() == len
            && entries.iter().all(|(k, _)| {
                matches!(k, Value::Integer(i) if usize::try_from(*i).is_ok_and(|i| (1..=len).contains(&i)))
            });

        if is_sequence {
            let mut items = vec![Json::Null; len];
            for (key, value) in &entries {
                if let Value::Integer(i) = key {
                    let slot = usize::try_from(*i - 1).unwrap_or_default();
                    items[slot] = self.convert(value, None);
                }
            }
            return Json::Array(items);
        }

        let mut object = Map::new();
        for (key, value) in &entries {
            let Some(name) = key_name(key) else {
                continue;
            };
            let converted = self.convert(value, Some(&name));
            object.insert(name, converted);
        }
        Json::Object(object)
    }
}

fn key_name(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.to_string_lossy().into()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn eval(lua: &Lua, src: &str) -> Value {
        lua.load(src).eval().unwrap()
    }

    #[test]
    fn test_scalars() {
        let lua = Lua::new();
        assert_eq!(sanitize(&lua, &Value::Nil), Json::Null);
        assert_eq!(sanitize(&lua, &eval(&lua, "42")), json!(42));
        assert_eq!(sanitize(&lua, &eval(&lua, "1.5")), json!(1.5));
        assert_eq!(sanitize(&lua, &eval(&lua, "'hi'")), json!("hi"));
        assert_eq!(sanitize(&lua, &eval(&lua, "0/0")), Json::Null);
        assert_eq!(sanitize(&lua, &eval(&lua, "math.huge")), Json::Null);
        assert_eq!(sanitize(&lua, &Value::NULL), Json::Null);
    }

    #[test]
    fn test_sequence_and_map() {
        let lua = Lua::new();
        let value = eval(&lua, "return { 1, 'two', { x = 3, y = true } }");
        assert_eq!(
            sanitize(&lua, &value),
            json!([1, "two", { "x": 3, "y": true }])
        );

        let sparse = eval(&lua, "return { [1] = 'a', [3] = 'c' }");
        assert_eq!(sanitize(&lua, &sparse), json!({ "1": "a", "3": "c" }));

        assert_eq!(sanitize(&lua, &eval(&lua, "return {}")), json!({}));
    }

    #[test]
    fn test_self_reference_terminates() {
        let lua = Lua::new();
        let value = eval(&lua, "local t = { name = 'loop' }; t.self = t; return t");
        assert_eq!(
            sanitize(&lua, &value),
            json!({ "name": "loop", "self": "[Circular]" })
        );
    }

    #[test]
    fn test_functions_become_labels() {
        let lua = Lua::new();
        let value = eval(&lua, "return { greet = function() end, [1] = 1 }");
        assert_eq!(
            sanitize(&lua, &value),
            json!({ "1": 1, "greet": "[Function: greet]" })
        );
        let bare = eval(&lua, "return print");
        assert_eq!(sanitize(&lua, &bare), json!("[Function: anonymous]"));
        let list = eval(&lua, "return { print }");
        assert_eq!(sanitize(&lua, &list), json!(["[Function: anonymous]"]));
    }

    #[test]
    fn test_deep_tables_are_cut_off() {
        let lua = Lua::new();
        let value = eval(
            &lua,
            "local t = {}; local c = t; for i = 1, 200000 do c.n = {}; c = c.n end; return t",
        );
        let mut out = &sanitize(&lua, &value);
        let mut levels = 0;
        while let Some(inner) = out.get("n") {
            out = inner;
            levels += 1;
        }
        assert_eq!(out, &json!("[Depth]"));
        assert_eq!(levels, MAX_DEPTH);
    }

    #[test]
    fn test_threads_and_userdata() {
        let lua = Lua::new();
        let thread = eval(&lua, "return coroutine.create(function() end)");
        assert_eq!(sanitize(&lua, &thread), json!("[Thread]"));
    }

    #[test]
    fn test_shared_table_across_arguments() {
        let lua = Lua::new();
        let shared = eval(&lua, "return { 1 }");
        let out = sanitize_all(&lua, &[shared.clone(), shared]);
        assert_eq!(out, vec![json!([1]), json!("[Circular]")]);
    }

    #[test]
    fn test_output_round_trips_through_json() {
        let lua = Lua::new();
        let value = eval(
            &lua,
            "local t = { list = { 1, 2 }, f = print, co = coroutine.create(print) }; t.me = t; return t",
        );
        let out = sanitize(&lua, &value);
        let text = serde_json::to_string(&out).unwrap();
        let back: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(back, out);
    }
}
