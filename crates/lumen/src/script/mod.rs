//! Script compilation, the global-assignment check and the compiled cache.

pub mod bytecode;
mod cache;
pub mod sandbox;

use std::path::{Path, PathBuf};

use mlua::{ChunkMode, FromLuaMulti, IntoLuaMulti, Lua};

pub use cache::{CompiledScript, Fingerprint, ScriptCache, check_tree};

use crate::error::{Error, Result};

/// File run when an entry path names a directory.
pub const DEFAULT_INDEX: &str = "index.lua";

/// Maps a directory to its `index.lua`; files are returned unchanged.
#[must_use]
pub fn resolve_entry(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(DEFAULT_INDEX)
    } else {
        path.to_path_buf()
    }
}

pub(crate) fn chunk_name(path: &Path) -> String {
    format!("@{}", path.display())
}

/// Compiles `source` with `lua` and verifies it never assigns to an
/// undeclared variable. Returns the unstripped bytecode.
///
/// # Errors
/// Returns [`Error::Compile`] for syntax errors and global assignments.
pub fn compile_source(lua: &Lua, path: &Path, source: &[u8]) -> Result<Vec<u8>> {
    let function = lua
        .load(source)
        .set_name(chunk_name(path))
        .set_mode(ChunkMode::Text)
        .into_function()
        .map_err(|err| syntax_error(path, &err))?;

    let chunk = function.dump(false);
    let proto = bytecode::parse(&chunk).map_err(|err| Error::compile(path, 0, err.to_string()))?;
    if let Some(first) = sandbox::global_assignments(&proto).into_iter().next() {
        return Err(Error::compile(path, first.line, first.to_string()));
    }
    Ok(chunk)
}

fn syntax_error(path: &Path, err: &mlua::Error) -> Error {
    let text = match err {
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    let (line, message) = split_location(&text);
    Error::compile(path, line, message)
}

/// Splits `chunk:line: message` into its line and message.
fn split_location(text: &str) -> (u32, String) {
    let mut offset = 0;
    for segment in text.split(':') {
        let end = offset + segment.len();
        if offset > 0
            && !segment.is_empty()
            && segment.bytes().all(|b| b.is_ascii_digit())
            && let Ok(line) = segment.parse()
        {
            let rest = text.get(end + 1..).unwrap_or_default().trim_start();
            return (line, rest.to_string());
        }
        offset = end + 1;
    }
    (0, text.to_string())
}

/// Instantiates the compiled chunk on `lua` and calls it with `args`.
///
/// # Errors
/// Returns [`Error::Runtime`] carrying the script's message and traceback, or
/// [`Error::DeadlineExceeded`] when a deadline hook aborted it.
pub fn execute<R: FromLuaMulti>(
    lua: &Lua,
    script: &CompiledScript,
    args: impl IntoLuaMulti,
) -> Result<R> {
    let function = lua
        .load(script.bytecode())
        .set_name(chunk_name(script.path()))
        .set_mode(ChunkMode::Binary)
        .into_function()?;
    function.call::<R>(args).map_err(|err| {
        metrics::counter!("lumen_script_runtime_errors_total").increment(1);
        Error::from_script(&err)
    })
}
