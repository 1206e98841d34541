//! Root engine, module registration and pooled child engines.

mod base;

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use mlua::{FromLuaMulti, HookTriggers, IntoLuaMulti, Lua, Value, VmState};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    bridge,
    error::{DEADLINE_MESSAGE, Error, Result},
    pool::{InterpreterPool, PooledInterpreter, new_interpreter},
    script::{self, CompiledScript},
};

pub type EnvMap = serde_json::Map<String, serde_json::Value>;

/// Instructions between two deadline checks.
const DEADLINE_CHECK_INTERVAL: u32 = 1000;

/// A value installed under a global name on every interpreter.
///
/// `load` runs once on the root and once per freshly created pooled
/// interpreter, so it must not depend on being called only once.
pub trait Module: Send + Sync + 'static {
    /// # Errors
    /// Returns an error if the value cannot be built.
    fn load(&self, lua: &Lua) -> mlua::Result<Value>;
}

impl<F> Module for F
where
    F: Fn(&Lua) -> mlua::Result<Value> + Send + Sync + 'static,
{
    fn load(&self, lua: &Lua) -> mlua::Result<Value> {
        self(lua)
    }
}

struct Shared {
    env: Arc<EnvMap>,
    modules: RwLock<Vec<(String, Arc<dyn Module>)>>,
    pool: InterpreterPool,
}

impl Shared {
    fn prepare(&self, lua: &Lua) -> mlua::Result<()> {
        base::install(lua)?;
        lua.globals()
            .set("env", bridge::read_only_map(lua, self.env.clone())?)
    }
}

struct Root {
    lua: Lua,
    error: Option<Error>,
}

pub struct EngineBuilder {
    env: EnvMap,
    max_idle: Option<usize>,
}

impl EngineBuilder {
    /// Configuration exposed to scripts as the read-only `env` global.
    #[must_use]
    pub fn env(mut self, env: EnvMap) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub const fn max_idle(mut self, max_idle: Option<usize>) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// # Errors
    /// Returns an error if the root interpreter cannot be prepared.
    pub fn build(self) -> Result<Engine> {
        let mut pool = InterpreterPool::new(new_interpreter);
        if let Some(max_idle) = self.max_idle {
            pool = pool.with_max_idle(max_idle);
        }
        let shared = Arc::new(Shared {
            env: Arc::new(self.env),
            modules: RwLock::new(Vec::new()),
            pool,
        });
        let lua = new_interpreter()?;
        shared.prepare(&lua)?;
        Ok(Engine {
            shared,
            root: Arc::new(Mutex::new(Root { lua, error: None })),
        })
    }
}

/// The root runtime handle. Clones share the same root interpreter.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    root: Arc<Mutex<Root>>,
}

impl Engine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            env: EnvMap::new(),
            max_idle: None,
        }
    }

    /// # Errors
    /// Returns an error if the root interpreter cannot be prepared.
    pub fn new(env: EnvMap) -> Result<Self> {
        Self::builder().env(env).build()
    }

    /// Installs `module` as global `name` on the root and records it for
    /// every pooled interpreter created afterwards.
    ///
    /// # Errors
    /// Returns the sticky error, or the module's load error (which becomes
    /// sticky).
    pub fn register(&self, name: &str, module: impl Module) -> Result<()> {
        let mut root = self.root.lock();
        if let Some(err) = &root.error {
            return Err(err.clone());
        }
        let loaded = module
            .load(&root.lua)
            .and_then(|value| root.lua.globals().set(name, value));
        if let Err(err) = loaded {
            return Err(root.fail(err.into()));
        }
        self.shared
            .modules
            .write()
            .push((name.to_string(), Arc::new(module)));
        debug!(name, "Registered module");
        Ok(())
    }

    /// Runs the entry script on the root. A directory runs its `index.lua`.
    ///
    /// # Errors
    /// Returns the sticky error or the script's failure (which becomes sticky).
    pub fn run(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = script::resolve_entry(path.as_ref());
        let mut root = self.root.lock();
        if let Some(err) = &root.error {
            return Err(err.clone());
        }
        info!(path = %path.display(), "Running entry script");
        let result = fs::read(&path).map_err(Error::from).and_then(|source| {
            root.lua
                .load(source)
                .set_name(script::chunk_name(&path))
                .exec()
                .map_err(|err| Error::from_script(&err))
        });
        result.map_err(|err| root.fail(err))
    }

    /// Evaluates a snippet on the root.
    ///
    /// # Errors
    /// Returns the sticky error or the snippet's failure (which becomes sticky).
    pub fn eval<R: FromLuaMulti>(&self, source: &str) -> Result<R> {
        let mut root = self.root.lock();
        if let Some(err) = &root.error {
            return Err(err.clone());
        }
        let result = root
            .lua
            .load(source)
            .set_name("=eval")
            .eval::<R>()
            .map_err(|err| Error::from_script(&err));
        result.map_err(|err| root.fail(err))
    }

    /// First error recorded by `register`, `run` or `eval`.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.root.lock().error.clone()
    }

    /// Checks out a pooled interpreter for one task. Fresh interpreters get
    /// the base facilities, `env` and every registered module.
    ///
    /// # Errors
    /// Returns an error if a fresh interpreter fails to initialize; it is
    /// discarded rather than pooled.
    pub fn child(&self) -> Result<(ChildEngine, bool)> {
        let (interp, was_new) = self.shared.pool.acquire()?;
        if was_new && let Err(err) = self.initialize(interp.lua()) {
            debug!(id = interp.id(), %err, "Discarding interpreter that failed to initialize");
            return Err(err);
        }
        Ok((
            ChildEngine {
                interp: Some(interp),
                shared: self.shared.clone(),
            },
            was_new,
        ))
    }

    fn initialize(&self, lua: &Lua) -> Result<()> {
        self.shared.prepare(lua)?;
        let modules = self.shared.modules.read().clone();
        for (name, module) in modules {
            lua.globals().set(name.as_str(), module.load(lua)?)?;
        }
        Ok(())
    }

    /// Closes every idle pooled interpreter.
    pub fn shutdown(&self) {
        let closed = self.shared.pool.drain();
        info!(closed, "Engine shut down");
    }

    #[must_use]
    pub fn idle_interpreters(&self) -> usize {
        self.shared.pool.idle()
    }
}

impl Root {
    fn fail(&mut self, err: Error) -> Error {
        self.error.get_or_insert(err).clone()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modules: Vec<_> = self
            .shared
            .modules
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        f.debug_struct("Engine")
            .field("modules", &modules)
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

/// A task-scoped engine. Its interpreter goes back to the pool when dropped,
/// whether the task succeeded or not.
pub struct ChildEngine {
    interp: Option<PooledInterpreter>,
    shared: Arc<Shared>,
}

impl ChildEngine {
    #[must_use]
    pub fn lua(&self) -> &Lua {
        match &self.interp {
            Some(interp) => interp.lua(),
            None => unreachable!("interpreter is only taken on drop"),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.interp.as_ref().map_or(0, PooledInterpreter::id)
    }

    /// Aborts script execution once `deadline` has passed.
    pub fn set_deadline(&self, deadline: Instant) {
        self.lua().set_hook(
            HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_INTERVAL),
            move |_, _| {
                if Instant::now() >= deadline {
                    Err(mlua::Error::runtime(DEADLINE_MESSAGE))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.set_deadline(Instant::now() + timeout);
    }

    /// Runs a compiled script on this engine's interpreter.
    ///
    /// # Errors
    /// See [`script::execute`].
    pub fn execute<R: FromLuaMulti>(
        &self,
        script: &CompiledScript,
        args: impl IntoLuaMulti,
    ) -> Result<R> {
        script::execute(self.lua(), script, args)
    }

    /// Returns the interpreter to the pool.
    pub fn close(self) {}
}

impl Drop for ChildEngine {
    fn drop(&mut self) {
        if let Some(interp) = self.interp.take() {
            interp.lua().remove_hook();
            self.shared.pool.release(interp);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn engine() -> Engine {
        let mut env = EnvMap::new();
        env.insert("NAME".into(), serde_json::json!("lumen"));
        Engine::new(env).unwrap()
    }

    #[test]
    fn env_is_read_only() {
        let engine = engine();
        let name: String = engine.eval("return env.NAME").unwrap();
        assert_eq!(name, "lumen");
        assert!(engine.eval::<()>("env.NAME = 'x'").is_err());
    }

    #[test]
    fn errors_are_sticky() {
        let engine = engine();
        assert!(engine.eval::<()>("error('first')").is_err());
        let err = engine.eval::<i64>("return 1").unwrap_err();
        assert!(err.to_string().contains("first"), "{err}");
        assert!(engine.register("late", |_: &Lua| Ok(Value::Nil)).is_err());
        assert!(engine.error().is_some());
    }

    #[test]
    fn run_resolves_directory_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("index.lua")).unwrap();
        writeln!(file, "started = true").unwrap();
        let engine = engine();
        engine.run(dir.path()).unwrap();
        assert!(engine.eval::<bool>("return started").unwrap());
    }

    #[test]
    fn children_receive_registered_modules() {
        let engine = engine();
        engine
            .register("answer", |_: &Lua| Ok(Value::Integer(42)))
            .unwrap();

        let (child, was_new) = engine.child().unwrap();
        assert!(was_new);
        let (answer, name): (i64, String) = child
            .lua()
            .load("return answer, env.NAME")
            .eval()
            .unwrap();
        assert_eq!((answer, name.as_str()), (42, "lumen"));
        let id = child.id();
        child.close();

        let (again, was_new) = engine.child().unwrap();
        assert!(!was_new);
        assert_eq!(again.id(), id);
    }

    #[test]
    fn failing_module_discards_fresh_child() {
        let engine = engine();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        engine
            .register("flaky", move |_: &Lua| {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Ok(Value::Boolean(true))
                } else {
                    Err(mlua::Error::runtime("unavailable"))
                }
            })
            .unwrap();
        assert!(engine.child().is_err());
        assert_eq!(engine.idle_interpreters(), 0);
    }

    #[test]
    fn child_released_on_error_path() {
        let engine = engine();
        let run = || -> Result<()> {
            let (child, _) = engine.child()?;
            child.lua().load("error('nope')").exec()?;
            Ok(())
        };
        assert!(run().is_err());
        assert_eq!(engine.idle_interpreters(), 1);
    }

    #[test]
    fn deadline_stops_runaway_scripts() {
        let engine = engine();
        let (child, _) = engine.child().unwrap();
        let path = Path::new("spin.lua");
        let chunk = script::compile_source(child.lua(), path, b"while true do end").unwrap();
        let compiled = CompiledScript::from_parts(path, chunk, None);
        child.set_timeout(Duration::from_millis(50));
        let err = child.execute::<()>(&compiled, ()).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded), "{err:?}");
        drop(child);

        // the hook does not follow the interpreter back into the pool
        let (child, was_new) = engine.child().unwrap();
        assert!(!was_new);
        let n: i64 = child
            .lua()
            .load("local n = 0 for i = 1, 100000 do n = n + 1 end return n")
            .eval()
            .unwrap();
        assert_eq!(n, 100_000);
    }

    #[test]
    fn root_shutdown_drains_pool() {
        let engine = engine();
        let (child, _) = engine.child().unwrap();
        drop(child);
        assert_eq!(engine.idle_interpreters(), 1);
        engine.shutdown();
        assert_eq!(engine.idle_interpreters(), 0);
    }
}
