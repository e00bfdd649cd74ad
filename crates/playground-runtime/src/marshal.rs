//! Strict value marshalling between interpreter realms.
//!
//! Unlike [`crate::sanitize`], marshalling refuses values that have no JSON
//! form; the failure surfaces in user code as a runtime error.

use std::ffi::c_void;

use mlua::{Lua, LuaSerdeExt, SerializeOptions, Table, Value};
use serde_json::{Map, Number, Value as Json};

use crate::error::MarshalError;

/// Deepest table nesting accepted.
pub const MAX_DEPTH: usize = 64;

/// Convert an interpreter value to JSON.
///
/// # Errors
/// Returns [`MarshalError`] for functions, threads, userdata, cyclic tables,
/// non-finite numbers and nesting deeper than [`MAX_DEPTH`].
pub fn to_json(value: &Value) -> Result<Json, MarshalError> {
    Marshaller::default().convert(value)
}

/// Convert an argument list to a JSON array.
///
/// # Errors
/// See [`to_json`].
pub fn args_to_json(values: &[Value]) -> Result<Json, MarshalError> {
    let mut marshaller = Marshaller::default();
    values
        .iter()
        .map(|v| marshaller.convert(v))
        .collect::<Result<Vec<_>, _>>()
        .map(Json::Array)
}

/// Convert JSON into a value of `lua`. `null` becomes `nil`.
///
/// # Errors
/// Returns an error if the interpreter cannot allocate the value.
pub fn from_json(lua: &Lua, value: &Json) -> mlua::Result<Value> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

#[derive(Default)]
struct Marshaller {
    ancestors: Vec<*const c_void>,
}

impl Marshaller {
    fn convert(&mut self, value: &Value) -> Result<Json, MarshalError> {
        match value {
            Value::Nil => Ok(Json::Null),
            Value::LightUserData(ud) if ud.0.is_null() => Ok(Json::Null),
            Value::Boolean(b) => Ok(Json::Bool(*b)),
            Value::Integer(i) => Ok(Json::from(*i)),
            Value::Number(n) => Number::from_f64(*n)
                .map(Json::Number)
                .ok_or(MarshalError::NonFinite),
            Value::String(s) => Ok(Json::String(s.to_string_lossy().into())),
            Value::Table(table) => self.table(table),
            other => Err(MarshalError::Unsupported(other.type_name())),
        }
    }

    fn table(&mut self, table: &Table) -> Result<Json, MarshalError> {
        let ptr = table.to_pointer();
        if self.ancestors.contains(&ptr) {
            return Err(MarshalError::Cycle);
        }
        if self.ancestors.len() >= MAX_DEPTH {
            return Err(MarshalError::TooDeep(MAX_DEPTH));
        }
        self.ancestors.push(ptr);
        let result = self.table_body(table);
        self.ancestors.pop();
        result
    }

    fn table_body(&mut self, table: &Table) -> Result<Json, MarshalError> {
        let entries = table
            .pairs::<Value, Value>()
            .collect::<mlua::Result<Vec<_>>>()
            .map_err(|e| MarshalError::Json(e.to_string()))?;
        let len = table.raw_len();

        if len > 0 && entries.len() == len {
            let mut items = vec![Json::Null; len];
            let mut complete = true;
            for (key, value) in &entries {
                match key {
                    Value::Integer(i) if (1..=len as i64).contains(i) => {
                        items[(*i - 1) as usize] = self.convert(value)?;
                    }
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                return Ok(Json::Array(items));
            }
        }

        let mut object = Map::new();
        for (key, value) in &entries {
            let name = match key {
                Value::String(s) => s.to_string_lossy().into(),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Boolean(b) => b.to_string(),
                other => return Err(MarshalError::Unsupported(other.type_name())),
            };
            object.insert(name, self.convert(value)?);
        }
        Ok(Json::Object(object))
    }
}
