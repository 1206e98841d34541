use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mlua::{Lua, LuaOptions, StdLib};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

type Factory = Box<dyn Fn() -> mlua::Result<Lua> + Send + Sync>;

/// Creates an interpreter with the safe standard libraries loaded.
///
/// # Errors
/// Returns an error if the interpreter cannot be allocated.
#[allow(clippy::unnecessary_wraps)]
pub fn new_interpreter() -> mlua::Result<Lua> {
    // SAFETY: binary chunks are only ever loaded from bytecode this process
    // compiled itself and ran through the sandbox check.
    let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::new()) };
    Ok(lua)
}

/// An interpreter checked out of an [`InterpreterPool`].
pub struct PooledInterpreter {
    id: u64,
    lua: Lua,
}

impl PooledInterpreter {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn lua(&self) -> &Lua {
        &self.lua
    }
}

impl std::fmt::Debug for PooledInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInterpreter")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Free list of spare interpreters.
///
/// Acquisition never blocks: when the free list is empty a fresh interpreter
/// is built with the constructor closure. The pool does not reset state; the
/// caller decides what a fresh interpreter needs from the `was_new` flag.
pub struct InterpreterPool {
    idle: Mutex<Vec<PooledInterpreter>>,
    factory: Factory,
    next_id: AtomicU64,
    max_idle: Option<usize>,
    drained: AtomicBool,
}

impl InterpreterPool {
    pub fn new(factory: impl Fn() -> mlua::Result<Lua> + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            next_id: AtomicU64::new(1),
            max_idle: None,
            drained: AtomicBool::new(false),
        }
    }

    /// Caps how many released interpreters are retained. Extra ones are closed.
    #[must_use]
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// Hands out an interpreter for exclusive use, returning `true` alongside
    /// it when it was just created.
    ///
    /// # Errors
    /// Returns an error if a new interpreter cannot be constructed.
    pub fn acquire(&self) -> Result<(PooledInterpreter, bool)> {
        metrics::counter!("lumen_pool_acquired_total").increment(1);
        if let Some(interp) = self.idle.lock().pop() {
            return Ok((interp, false));
        }

        let lua = (self.factory)()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lumen_pool_created_total").increment(1);
        debug!(id, "Created interpreter");
        Ok((PooledInterpreter { id, lua }, true))
    }

    /// Returns an interpreter to the free list.
    pub fn release(&self, interp: PooledInterpreter) {
        if self.drained.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.idle.lock();
        if self.max_idle.is_some_and(|max| idle.len() >= max) {
            debug!(id = interp.id, "Idle pool full; closing interpreter");
            return;
        }
        idle.push(interp);
    }

    /// Closes every pooled interpreter. Interpreters released afterwards are
    /// closed instead of being kept.
    pub fn drain(&self) -> usize {
        self.drained.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.idle.lock());
        let count = drained.len();
        drop(drained);
        debug!(count, "Drained interpreter pool");
        count
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl std::fmt::Debug for InterpreterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterPool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Barrier},
        thread,
    };

    use super::*;

    #[test]
    fn reuse_reports_not_new() {
        let pool = InterpreterPool::new(new_interpreter);
        let (first, was_new) = pool.acquire().expect("acquire");
        assert!(was_new);
        let id = first.id();
        pool.release(first);

        let (second, was_new) = pool.acquire().expect("acquire");
        assert!(!was_new);
        assert_eq!(second.id(), id);
    }

    #[test]
    fn concurrent_holders_get_distinct_instances() {
        const HOLDERS: usize = 8;
        let pool = Arc::new(InterpreterPool::new(new_interpreter));
        let (warm, _) = pool.acquire().expect("acquire");
        pool.release(warm);

        let barrier = Arc::new(Barrier::new(HOLDERS));
        let handles: Vec<_> = (0..HOLDERS)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let (interp, _) = pool.acquire().expect("acquire");
                    let id = interp.id();
                    // every holder keeps its instance until all have acquired
                    barrier.wait();
                    pool.release(interp);
                    id
                })
            })
            .collect();

        let ids: HashSet<u64> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(ids.len(), HOLDERS);
        assert_eq!(pool.idle(), HOLDERS);
    }

    #[test]
    fn max_idle_closes_surplus() {
        let pool = InterpreterPool::new(new_interpreter).with_max_idle(1);
        let (a, _) = pool.acquire().expect("acquire");
        let (b, _) = pool.acquire().expect("acquire");
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn drain_closes_everything() {
        let pool = InterpreterPool::new(new_interpreter);
        let (a, _) = pool.acquire().expect("acquire");
        let (b, _) = pool.acquire().expect("acquire");
        pool.release(a);
        assert_eq!(pool.drain(), 1);
        pool.release(b);
        assert_eq!(pool.idle(), 0);
    }
}
