//! `cli`: console output for scripts, routed through tracing.

use std::{collections::HashMap, io::Write};

use mlua::{Function, Lua, MultiValue, Table, Value};

use crate::{TRACE_TARGET_SCRIPT, bridge, engine::Module};

#[derive(Debug, Clone, Copy)]
enum Level {
    Debug,
    Info,
    Success,
    Warn,
    Error,
}

fn emit(level: Level, message: &str) {
    match level {
        Level::Debug => tracing::debug!(target: TRACE_TARGET_SCRIPT, "{message}"),
        Level::Info => tracing::info!(target: TRACE_TARGET_SCRIPT, "{message}"),
        Level::Success => tracing::info!(target: TRACE_TARGET_SCRIPT, success = true, "{message}"),
        Level::Warn => tracing::warn!(target: TRACE_TARGET_SCRIPT, "{message}"),
        Level::Error => tracing::error!(target: TRACE_TARGET_SCRIPT, "{message}"),
    }
}

/// Formats like `string.format` when the first argument is a string,
/// otherwise like `tostring`.
fn format(lua: &Lua, args: MultiValue) -> mlua::Result<String> {
    match args.front() {
        Some(Value::String(_)) => {
            let string: Table = lua.globals().get("string")?;
            let format: Function = string.get("format")?;
            format.call(args)
        }
        Some(_) => {
            let tostring: Function = lua.globals().get("tostring")?;
            tostring.call(args.into_iter().next())
        }
        None => Ok(String::new()),
    }
}

fn printer(lua: &Lua, level: Level) -> mlua::Result<Function> {
    lua.create_function(move |lua, args: MultiValue| {
        emit(level, &format(lua, args)?);
        Ok(())
    })
}

fn clear(lua: &Lua) -> mlua::Result<Function> {
    lua.create_function(|_, ()| {
        let mut out = std::io::stdout().lock();
        out.write_all(b"\x1b[2J\x1b[H")
            .and_then(|()| out.flush())
            .map_err(mlua::Error::external)
    })
}

/// The `cli` global, a read-only handle of plain functions (`cli.info(...)`).
#[must_use]
pub fn module() -> impl Module {
    |lua: &Lua| {
        let functions = HashMap::from([
            ("debug", printer(lua, Level::Debug)?),
            ("info", printer(lua, Level::Info)?),
            ("success", printer(lua, Level::Success)?),
            ("warn", printer(lua, Level::Warn)?),
            ("error", printer(lua, Level::Error)?),
            ("clear", clear(lua)?),
        ]);
        bridge::read_only(lua, move |_, name| {
            Ok(functions
                .get(name)
                .cloned()
                .map_or(Value::Nil, Value::Function))
        })
        .map(Value::UserData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_arguments() {
        let lua = Lua::new();
        let args = MultiValue::from_vec(vec![
            Value::String(lua.create_string("%s=%d").unwrap()),
            Value::String(lua.create_string("n").unwrap()),
            Value::Integer(4),
        ]);
        assert_eq!(format(&lua, args).unwrap(), "n=4");

        let args = MultiValue::from_vec(vec![Value::Boolean(true)]);
        assert_eq!(format(&lua, args).unwrap(), "true");
    }

    #[test]
    fn printers_accept_any_value() {
        let lua = Lua::new();
        lua.globals()
            .set("cli", module().load(&lua).unwrap())
            .unwrap();
        lua.load("cli.info('hello %s', 'world'); cli.warn({}); cli.error(); cli.success('ok')")
            .exec()
            .unwrap();
    }

    #[test]
    fn scripts_cannot_replace_printers() {
        let lua = Lua::new();
        lua.globals()
            .set("cli", module().load(&lua).unwrap())
            .unwrap();
        let err = lua.load("cli.info = nil").exec().unwrap_err();
        assert!(err.to_string().contains("read-only"), "{err}");
        assert!(lua.load("cli.log = print").exec().is_err());

        let missing: bool = lua
            .load("cli.info('still here') return cli.log == nil")
            .eval()
            .unwrap();
        assert!(missing);
    }
}
