use std::process::Command;

use mlua::{Lua, Table};
use tracing::debug;

/// Installs the string helpers and the `cmd` global.
pub(crate) fn install(lua: &Lua) -> mlua::Result<()> {
    let string: Table = lua.globals().get("string")?;
    string.set(
        "split",
        lua.create_function(|lua, (s, sep): (String, Option<String>)| {
            let sep = sep.unwrap_or_else(|| ",".to_string());
            if sep.is_empty() {
                return lua.create_sequence_from(s.chars().map(String::from));
            }
            lua.create_sequence_from(s.split(sep.as_str()).map(str::to_string))
        })?,
    )?;
    string.set(
        "fields",
        lua.create_function(|lua, s: String| lua.create_sequence_from(s.split_whitespace()))?,
    )?;
    // without a cutset, `trim` strips whitespace like `trimspace`
    string.set(
        "trim",
        lua.create_function(|_, (s, cutset): (String, Option<String>)| {
            Ok(match cutset {
                Some(cutset) => s.trim_matches(|c: char| cutset.contains(c)).to_string(),
                None => s.trim().to_string(),
            })
        })?,
    )?;
    string.set(
        "trimspace",
        lua.create_function(|_, s: String| Ok(s.trim().to_string()))?,
    )?;
    string.set(
        "trimstart",
        lua.create_function(|_, (s, prefix): (String, String)| {
            Ok(s.strip_prefix(prefix.as_str()).unwrap_or(s.as_str()).to_string())
        })?,
    )?;
    string.set(
        "trimend",
        lua.create_function(|_, (s, suffix): (String, String)| {
            Ok(s.strip_suffix(suffix.as_str()).unwrap_or(s.as_str()).to_string())
        })?,
    )?;
    string.set(
        "startswith",
        lua.create_function(|_, (s, prefix): (String, String)| Ok(s.starts_with(&prefix)))?,
    )?;
    string.set(
        "endswith",
        lua.create_function(|_, (s, suffix): (String, String)| Ok(s.ends_with(&suffix)))?,
    )?;
    string.set(
        "includes",
        lua.create_function(|_, (s, needle): (String, String)| Ok(s.contains(&needle)))?,
    )?;

    lua.globals().set("cmd", lua.create_function(run_command)?)?;
    Ok(())
}

/// `cmd(command)` runs `command` through `sh -c`, returning `ok, code`.
fn run_command(_: &Lua, command: String) -> mlua::Result<(bool, i32)> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .map_err(mlua::Error::external)?;
    debug!(%command, ?status, "Ran external command");
    Ok((status.success(), status.code().unwrap_or(-1)))
}
