//! Per-request sessions, loaded from the store on first use.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use mlua::{AnyUserData, Lua, Value};
use parking_lot::Mutex;
use tracing::debug;

use super::{BoxError, json_to_lua, lua_to_json};
use crate::bridge::{self, Surface};

pub type SessionData = serde_json::Map<String, serde_json::Value>;

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "session_id";

pub trait SessionStore: Send + Sync + 'static {
    /// # Errors
    /// Returns a backend error.
    fn load(&self, id: &str) -> Result<Option<SessionData>, BoxError>;
    /// # Errors
    /// Returns a backend error.
    fn save(&self, id: &str, data: &SessionData, ttl: Option<Duration>) -> Result<(), BoxError>;
    /// # Errors
    /// Returns a backend error.
    fn destroy(&self, id: &str) -> Result<(), BoxError>;
}

/// In-process store with optional expiry.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, (SessionData, Option<Instant>)>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, id: &str) -> Result<Option<SessionData>, BoxError> {
        let expired = match self.entries.get(id) {
            Some(entry) => match entry.1 {
                Some(expires) if expires <= Instant::now() => true,
                _ => return Ok(Some(entry.0.clone())),
            },
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(id);
        }
        Ok(None)
    }

    fn save(&self, id: &str, data: &SessionData, ttl: Option<Duration>) -> Result<(), BoxError> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(id.to_string(), (data.clone(), expires));
        Ok(())
    }

    fn destroy(&self, id: &str) -> Result<(), BoxError> {
        self.entries.remove(id);
        Ok(())
    }
}

struct State {
    id: String,
    data: SessionData,
    is_new: bool,
}

/// A session that touches its store only when a script first uses it.
pub struct LazySession {
    store: Arc<dyn SessionStore>,
    requested_id: Option<String>,
    state: Mutex<Option<State>>,
    cookie: Mutex<Option<String>>,
}

fn new_session_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

impl LazySession {
    pub fn new(store: Arc<dyn SessionStore>, requested_id: Option<String>) -> Self {
        Self {
            store,
            requested_id,
            state: Mutex::new(None),
            cookie: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state.lock().is_some()
    }

    fn load_state(&self) -> Result<State, BoxError> {
        if let Some(id) = &self.requested_id
            && let Some(data) = self.store.load(id)?
        {
            debug!("Loaded session");
            return Ok(State {
                id: id.clone(),
                data,
                is_new: false,
            });
        }
        Ok(State {
            id: new_session_id(),
            data: SessionData::new(),
            is_new: true,
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Result<R, BoxError> {
        let mut guard = self.state.lock();
        let state = match guard.take() {
            Some(state) => state,
            None => self.load_state()?,
        };
        Ok(f(guard.insert(state)))
    }

    /// # Errors
    /// Returns a store error.
    pub fn get(&self, key: &str) -> Result<Option<serde_json::Value>, BoxError> {
        self.with_state(|s| s.data.get(key).cloned())
    }

    /// # Errors
    /// Returns a store error.
    pub fn set(&self, key: &str, value: serde_json::Value) -> Result<(), BoxError> {
        self.with_state(|s| {
            s.data.insert(key.to_string(), value);
        })
    }

    /// # Errors
    /// Returns a store error.
    pub fn delete(&self, key: &str) -> Result<(), BoxError> {
        self.with_state(|s| {
            s.data.remove(key);
        })
    }

    /// # Errors
    /// Returns a store error.
    pub fn keys(&self) -> Result<Vec<String>, BoxError> {
        self.with_state(|s| s.data.keys().cloned().collect())
    }

    /// Persists the session. New sessions issue the id cookie.
    ///
    /// # Errors
    /// Returns a store error.
    pub fn save(&self, ttl: Option<Duration>) -> Result<(), BoxError> {
        let (id, data, is_new) =
            self.with_state(|s| (s.id.clone(), s.data.clone(), s.is_new))?;
        self.store.save(&id, &data, ttl)?;
        if is_new || ttl.is_some() {
            let max_age = ttl.map(|ttl| format!("; Max-Age={}", ttl.as_secs())).unwrap_or_default();
            *self.cookie.lock() =
                Some(format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly{max_age}"));
        }
        Ok(())
    }

    /// Removes the session from the store and expires the cookie.
    ///
    /// # Errors
    /// Returns a store error.
    pub fn destroy(&self) -> Result<(), BoxError> {
        let id = self.with_state(|s| s.id.clone())?;
        self.store.destroy(&id)?;
        *self.state.lock() = None;
        *self.cookie.lock() = Some(format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0"));
        Ok(())
    }

    /// `Set-Cookie` value produced by `save` or `destroy`, if any.
    #[must_use]
    pub fn take_cookie(&self) -> Option<String> {
        self.cookie.lock().take()
    }
}

fn surface() -> Surface<LazySession> {
    Surface::new()
        .method("keys", |_, s: &LazySession, ()| {
            s.keys().map_err(mlua::Error::external)
        })
        .method("save", |_, s: &LazySession, hours: Option<f64>| {
            let ttl = hours
                .filter(|h| *h > 0.0)
                .map(|h| Duration::from_secs_f64(h * 3600.0));
            s.save(ttl).map_err(mlua::Error::external)
        })
        .method("destroy", |_, s: &LazySession, ()| {
            s.destroy().map_err(mlua::Error::external)
        })
        .index(|lua, s, key| match s.get(key).map_err(mlua::Error::external)? {
            Some(value) => json_to_lua(lua, &value),
            None => Ok(Value::Nil),
        })
        .new_index(|lua, s, key, value| {
            let result = if value.is_nil() {
                s.delete(key)
            } else {
                s.set(key, lua_to_json(lua, value)?)
            };
            result.map_err(mlua::Error::external)
        })
}

/// Script handle for `session`.
///
/// # Errors
/// Returns an error if the userdata cannot be allocated.
pub fn handle(lua: &Lua, session: Arc<LazySession>) -> mlua::Result<AnyUserData> {
    bridge::anonymous(lua, session, surface())
}
