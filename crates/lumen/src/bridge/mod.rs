//! Script-visible handles over host values.
//!
//! Every handle is the same userdata type, [`Proxy`], so scripts cannot tell
//! host types apart. What a handle answers is decided by its [`Dispatch`]:
//! named methods first, then the index callback, otherwise `nil`.

mod class;

use std::{any::Any, collections::HashMap, marker::PhantomData, sync::Arc};

use mlua::{
    AnyUserData, FromLuaMulti, IntoLua, IntoLuaMulti, Lua, MetaMethod, MultiValue, UserData,
    UserDataMethods, Value,
};

pub use class::class;

pub type HostValue = Arc<dyn Any + Send + Sync>;

type MethodFn =
    Arc<dyn Fn(&Lua, Option<&HostValue>, MultiValue) -> mlua::Result<MultiValue> + Send + Sync>;
type IndexFn = Arc<dyn Fn(&Lua, Option<&HostValue>, &str) -> mlua::Result<Value> + Send + Sync>;
type NewIndexFn =
    Arc<dyn Fn(&Lua, Option<&HostValue>, &str, Value) -> mlua::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Private dispatch built for one value.
    Anonymous,
    /// Dispatch shared by every handle of a named type.
    Class,
    /// Getter and setter only.
    ReadWrite,
    /// Getter only.
    ReadOnly,
}

pub struct Dispatch {
    flavor: Flavor,
    name: String,
    methods: HashMap<String, MethodFn>,
    index: Option<IndexFn>,
    new_index: Option<NewIndexFn>,
}

impl Dispatch {
    #[must_use]
    pub const fn flavor(&self) -> Flavor {
        self.flavor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Dispatch")
            .field("flavor", &self.flavor)
            .field("name", &self.name)
            .field("methods", &methods)
            .finish_non_exhaustive()
    }
}

/// Typed description of what a handle over `T` exposes.
pub struct Surface<T> {
    methods: HashMap<String, MethodFn>,
    index: Option<IndexFn>,
    new_index: Option<NewIndexFn>,
    _marker: PhantomData<fn(&T)>,
}

impl<T> Default for Surface<T> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            index: None,
            new_index: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Any + Send + Sync> Surface<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method called as `handle:name(...)`.
    #[must_use]
    pub fn method<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, &T, A) -> mlua::Result<R> + Send + Sync + 'static,
    {
        let method: MethodFn = Arc::new(move |lua: &Lua, host: Option<&HostValue>, args: MultiValue| {
            let this = receiver::<T>(host)?;
            let args = A::from_lua_multi(args, lua)?;
            f(lua, this, args)?.into_lua_multi(lua)
        });
        self.methods.insert(name.to_string(), method);
        self
    }

    /// Handles every key that is not a method.
    #[must_use]
    pub fn index<F>(mut self, f: F) -> Self
    where
        F: Fn(&Lua, &T, &str) -> mlua::Result<Value> + Send + Sync + 'static,
    {
        self.index = Some(Arc::new(move |lua: &Lua, host: Option<&HostValue>, key: &str| {
            f(lua, receiver::<T>(host)?, key)
        }));
        self
    }

    /// Handles `handle.key = value`.
    #[must_use]
    pub fn new_index<F>(mut self, f: F) -> Self
    where
        F: Fn(&Lua, &T, &str, Value) -> mlua::Result<()> + Send + Sync + 'static,
    {
        self.new_index = Some(Arc::new(
            move |lua: &Lua, host: Option<&HostValue>, key: &str, value: Value| {
                f(lua, receiver::<T>(host)?, key, value)
            },
        ));
        self
    }

    fn build(self, flavor: Flavor, name: &str) -> Dispatch {
        Dispatch {
            flavor,
            name: name.to_string(),
            methods: self.methods,
            index: self.index,
            new_index: self.new_index,
        }
    }
}

fn receiver<T: Any>(host: Option<&HostValue>) -> mlua::Result<&T> {
    host.and_then(|value| (**value).downcast_ref::<T>())
        .ok_or_else(|| mlua::Error::runtime("method called on an incompatible object"))
}

/// The single userdata type behind every handle.
pub struct Proxy {
    value: Option<HostValue>,
    dispatch: Arc<Dispatch>,
}

impl Proxy {
    fn get(&self, lua: &Lua, key: &str) -> mlua::Result<Value> {
        if let Some(method) = self.dispatch.methods.get(key) {
            let method = method.clone();
            let function = lua.create_function(move |lua, (this, args): (AnyUserData, MultiValue)| {
                let value = this.borrow::<Self>()?.value.clone();
                method(lua, value.as_ref(), args)
            })?;
            return Ok(Value::Function(function));
        }
        match &self.dispatch.index {
            Some(index) => index(lua, self.value.as_ref(), key),
            None => Ok(Value::Nil),
        }
    }

    fn set(&self, lua: &Lua, key: &str, value: Value) -> mlua::Result<()> {
        match &self.dispatch.new_index {
            Some(new_index) => new_index(lua, self.value.as_ref(), key, value),
            None => Err(mlua::Error::runtime(format!(
                "attempt to assign '{key}' on read-only {}",
                self.dispatch.name
            ))),
        }
    }
}

fn key_name(key: &Value) -> mlua::Result<Option<String>> {
    Ok(match key {
        Value::String(s) => Some(s.to_str()?.to_string()),
        Value::Integer(i) => Some(i.to_string()),
        _ => None,
    })
}

impl UserData for Proxy {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            match key_name(&key)? {
                Some(key) => this.get(lua, &key),
                None => Ok(Value::Nil),
            }
        });
        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (Value, Value)| match key_name(&key)? {
                Some(key) => this.set(lua, &key, value),
                None => Err(mlua::Error::runtime("object keys must be strings")),
            },
        );
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(this.dispatch.name.clone())
        });
    }
}

fn wrap(lua: &Lua, value: Option<HostValue>, dispatch: Arc<Dispatch>) -> mlua::Result<AnyUserData> {
    lua.create_userdata(Proxy { value, dispatch })
}

/// Wraps `value` with a dispatch private to this handle.
///
/// # Errors
/// Returns an error if the userdata cannot be allocated.
pub fn anonymous<T: Any + Send + Sync>(
    lua: &Lua,
    value: Arc<T>,
    surface: Surface<T>,
) -> mlua::Result<AnyUserData> {
    let dispatch = Arc::new(surface.build(Flavor::Anonymous, "object"));
    wrap(lua, Some(value), dispatch)
}

/// A handle whose reads go to `getter` and writes to `setter`.
///
/// # Errors
/// Returns an error if the userdata cannot be allocated.
pub fn read_write<G, S>(lua: &Lua, getter: G, setter: S) -> mlua::Result<AnyUserData>
where
    G: Fn(&Lua, &str) -> mlua::Result<Value> + Send + Sync + 'static,
    S: Fn(&Lua, &str, Value) -> mlua::Result<()> + Send + Sync + 'static,
{
    let dispatch = Dispatch {
        flavor: Flavor::ReadWrite,
        name: "accessor".to_string(),
        methods: HashMap::new(),
        index: Some(Arc::new(move |lua: &Lua, _: Option<&HostValue>, key: &str| {
            getter(lua, key)
        })),
        new_index: Some(Arc::new(
            move |lua: &Lua, _: Option<&HostValue>, key: &str, value: Value| setter(lua, key, value),
        )),
    };
    wrap(lua, None, Arc::new(dispatch))
}

/// A handle whose reads go to `getter`; every write fails.
///
/// # Errors
/// Returns an error if the userdata cannot be allocated.
pub fn read_only<G>(lua: &Lua, getter: G) -> mlua::Result<AnyUserData>
where
    G: Fn(&Lua, &str) -> mlua::Result<Value> + Send + Sync + 'static,
{
    let dispatch = Dispatch {
        flavor: Flavor::ReadOnly,
        name: "accessor".to_string(),
        methods: HashMap::new(),
        index: Some(Arc::new(move |lua: &Lua, _: Option<&HostValue>, key: &str| {
            getter(lua, key)
        })),
        new_index: None,
    };
    wrap(lua, None, Arc::new(dispatch))
}

/// Read-only handle over a JSON object; missing keys read as `nil`.
///
/// # Errors
/// Returns an error if the userdata cannot be allocated.
pub fn read_only_map(
    lua: &Lua,
    map: Arc<serde_json::Map<String, serde_json::Value>>,
) -> mlua::Result<AnyUserData> {
    read_only(lua, move |lua, key| match map.get(key) {
        Some(value) => crate::modules::json_to_lua(lua, value),
        None => Ok(Value::Nil),
    })
}

/// Read-only handle over string pairs.
///
/// # Errors
/// Returns an error if the userdata cannot be allocated.
pub fn read_only_strings(
    lua: &Lua,
    map: Arc<HashMap<String, String>>,
) -> mlua::Result<AnyUserData> {
    read_only(lua, move |lua, key| match map.get(key) {
        Some(value) => value.as_str().into_lua(lua),
        None => Ok(Value::Nil),
    })
}

/// Dispatch behind a handle created by this module.
///
/// # Errors
/// Returns an error if `handle` is not a proxy.
pub fn dispatch_of(handle: &AnyUserData) -> mlua::Result<Arc<Dispatch>> {
    Ok(handle.borrow::<Proxy>()?.dispatch.clone())
}
