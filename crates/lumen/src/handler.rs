//! Runs route scripts on pooled child engines.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use mlua::{AnyUserData, Value};
use tracing::{debug, warn};

use crate::{
    engine::{ChildEngine, Engine},
    error::Result,
    modules::{
        http::{HttpRequest, HttpResponse, RequestContext},
        session::SessionStore,
        ws::WsContext,
    },
    script::{self, CompiledScript, ScriptCache},
};

/// Executes one script per unit of work.
///
/// Each call checks out its own child engine, so concurrent calls never share
/// an interpreter, and the engine goes back to the pool on every path.
#[derive(Clone)]
pub struct ScriptHandler {
    engine: Engine,
    cache: Arc<ScriptCache>,
    root: PathBuf,
    sessions: Arc<dyn SessionStore>,
    timeout: Option<Duration>,
}

impl ScriptHandler {
    #[must_use]
    pub fn new(
        engine: Engine,
        cache: Arc<ScriptCache>,
        root: impl Into<PathBuf>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            engine,
            cache,
            root: root.into(),
            sessions,
            timeout: None,
        }
    }

    /// Bounds HTTP script execution; WebSocket scripts are unbounded.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    #[must_use]
    pub fn script_path(&self, script: &str) -> PathBuf {
        script::resolve_entry(&self.root.join(script))
    }

    /// Runs `script` with a fresh `ctx` and returns the response it built.
    ///
    /// # Errors
    /// Returns the compile, runtime or deadline error of the script, or an
    /// I/O error when the script file is missing.
    pub fn handle(&self, script: &str, request: HttpRequest) -> Result<HttpResponse> {
        let compiled = self.cache.load(&self.script_path(script))?;
        let (child, was_new) = self.engine.child()?;
        if let Some(timeout) = self.timeout {
            child.set_timeout(timeout);
        }
        let ctx = RequestContext::new(request, self.sessions.clone());
        debug!(
            request_id = ctx.id(),
            interpreter = child.id(),
            was_new,
            script,
            "Running route script"
        );
        let handle = ctx.handle(child.lua())?;
        run_with_global(&child, &compiled, "ctx", handle)?;
        Ok(ctx.response())
    }

    /// Runs a WebSocket `script` until it returns. A close frame is sent when
    /// the script did not send one itself.
    ///
    /// # Errors
    /// Same as [`ScriptHandler::handle`].
    pub fn handle_ws(&self, script: &str, ws: &Arc<WsContext>) -> Result<()> {
        let result = self.run_ws(script, ws);
        ws.finish();
        if let Err(err) = &result {
            warn!(script, %err, "WebSocket script failed");
        }
        result
    }

    fn run_ws(&self, script: &str, ws: &Arc<WsContext>) -> Result<()> {
        let compiled = self.cache.load(&self.script_path(script))?;
        let (child, _) = self.engine.child()?;
        let handle = ws.handle(child.lua())?;
        run_with_global(&child, &compiled, "ws", handle)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// The context is passed as the chunk argument and, for the duration of the
/// call, as a global.
fn run_with_global(
    child: &ChildEngine,
    compiled: &CompiledScript,
    name: &str,
    handle: AnyUserData,
) -> Result<()> {
    let globals = child.lua().globals();
    globals.set(name, handle.clone())?;
    let result = child.execute::<()>(compiled, handle);
    globals.set(name, Value::Nil)?;
    result
}

impl std::fmt::Debug for ScriptHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHandler")
            .field("root", &self.root)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
