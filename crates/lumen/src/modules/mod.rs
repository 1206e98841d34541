//! Globals installed for scripts: `app`, `cli`, `db`, `kv`, plus the request,
//! session and websocket contexts handed to handler scripts.

pub mod app;
pub mod cli;
pub mod db;
pub mod http;
pub mod kv;
pub mod session;
pub mod sqlite;
pub mod ws;

use mlua::{DeserializeOptions, Lua, LuaSerdeExt, SerializeOptions, Value};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Converts JSON into a Lua value; `null` becomes `nil`.
///
/// # Errors
/// Returns an error if a table cannot be allocated.
pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    lua.to_value_with(
        value,
        SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false),
    )
}

/// Converts a Lua value into JSON, skipping functions and userdata.
///
/// # Errors
/// Returns an error for values JSON cannot represent, such as recursive tables.
pub fn lua_to_json(lua: &Lua, value: Value) -> mlua::Result<serde_json::Value> {
    lua.from_value_with(value, DeserializeOptions::new().deny_unsupported_types(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trips_through_tables() {
        let lua = Lua::new();
        let value = serde_json::json!({"name": "lumen", "tags": ["a", "b"], "n": 3});
        let table = json_to_lua(&lua, &value).unwrap();
        lua.globals().set("t", table).unwrap();
        let (name, tag, n): (String, String, i64) =
            lua.load("return t.name, t.tags[2], t.n").eval().unwrap();
        assert_eq!((name.as_str(), tag.as_str(), n), ("lumen", "b", 3));

        let back = lua_to_json(&lua, lua.globals().get("t").unwrap()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn null_reads_as_nil() {
        let lua = Lua::new();
        assert!(json_to_lua(&lua, &serde_json::Value::Null).unwrap().is_nil());
    }
}
