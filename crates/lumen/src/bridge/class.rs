use std::{any::Any, collections::HashMap, sync::Arc};

use mlua::{AnyUserData, Lua};
use parking_lot::Mutex;

use super::{Dispatch, Flavor, Surface, wrap};

/// Class dispatch tables of one interpreter, keyed by type name.
#[derive(Default)]
struct ClassRegistry(Mutex<HashMap<String, Arc<Dispatch>>>);

/// Wraps `value` with the dispatch registered for `type_name` on this
/// interpreter. `surface` is only invoked the first time the name is seen.
///
/// # Errors
/// Returns an error if the userdata cannot be allocated.
pub fn class<T, F>(lua: &Lua, type_name: &str, value: Arc<T>, surface: F) -> mlua::Result<AnyUserData>
where
    T: Any + Send + Sync,
    F: FnOnce() -> Surface<T>,
{
    if lua.app_data_ref::<ClassRegistry>().is_none() {
        lua.set_app_data(ClassRegistry::default());
    }
    let dispatch = {
        let registry = lua
            .app_data_ref::<ClassRegistry>()
            .ok_or_else(|| mlua::Error::runtime("class registry unavailable"))?;
        let mut classes = registry.0.lock();
        classes
            .entry(type_name.to_string())
            .or_insert_with(|| Arc::new(surface().build(Flavor::Class, type_name)))
            .clone()
    };
    wrap(lua, Some(value), dispatch)
}
