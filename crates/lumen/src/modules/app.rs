//! `app`: route declarations made by the entry script.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use http::Method;
use mlua::{Lua, Value};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    bridge::{self, Surface},
    engine::Module,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Http,
    WebSocket,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// `None` matches every method.
    pub method: Option<Method>,
    pub pattern: String,
    pub script: String,
    pub kind: RouteKind,
}

/// Routes declared through `app`. Once sealed, further declarations fail.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Mutex<Vec<Route>>,
    sealed: AtomicBool,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stops accepting declarations and returns what was declared.
    pub fn seal(&self) -> Vec<Route> {
        self.sealed.store(true, Ordering::Release);
        self.routes()
    }

    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().clone()
    }

    fn add(&self, route: Route) -> mlua::Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(mlua::Error::runtime(
                "routes can only be declared while the entry script runs",
            ));
        }
        if !route.pattern.starts_with('/') {
            return Err(mlua::Error::runtime(format!(
                "route pattern must start with '/': {}",
                route.pattern
            )));
        }
        if route.script.is_empty() {
            return Err(mlua::Error::runtime("route script must not be empty"));
        }
        debug!(method = ?route.method, pattern = %route.pattern, script = %route.script, "Declared route");
        self.routes.lock().push(route);
        Ok(())
    }
}

const HTTP_METHODS: [(&str, Option<Method>); 8] = [
    ("get", Some(Method::GET)),
    ("post", Some(Method::POST)),
    ("put", Some(Method::PUT)),
    ("delete", Some(Method::DELETE)),
    ("patch", Some(Method::PATCH)),
    ("head", Some(Method::HEAD)),
    ("options", Some(Method::OPTIONS)),
    ("all", None),
];

fn surface() -> Surface<RouteTable> {
    let mut surface = Surface::new();
    for (name, method) in HTTP_METHODS {
        surface = surface.method(
            name,
            move |_, table: &RouteTable, (pattern, script): (String, String)| {
                table.add(Route {
                    method: method.clone(),
                    pattern,
                    script,
                    kind: RouteKind::Http,
                })
            },
        );
    }
    surface
        .method(
            "ws",
            |_, table: &RouteTable, (pattern, script): (String, String)| {
                table.add(Route {
                    method: Some(Method::GET),
                    pattern,
                    script,
                    kind: RouteKind::WebSocket,
                })
            },
        )
        .method("routes", |lua, table: &RouteTable, ()| {
            let list = lua.create_table()?;
            for route in table.routes() {
                let entry = lua.create_table()?;
                entry.set(
                    "method",
                    route.method.as_ref().map_or("ALL", Method::as_str),
                )?;
                entry.set("pattern", route.pattern)?;
                entry.set("script", route.script)?;
                entry.set("ws", route.kind == RouteKind::WebSocket)?;
                list.push(entry)?;
            }
            Ok(list)
        })
}

/// The `app` global backed by `table`.
pub fn module(table: Arc<RouteTable>) -> impl Module {
    move |lua: &Lua| bridge::class(lua, "Application", table.clone(), surface).map(Value::UserData)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn entry_script_declares_routes() {
        let table = RouteTable::new();
        let engine = Engine::new(crate::engine::EnvMap::new()).unwrap();
        engine.register("app", module(table.clone())).unwrap();
        engine
            .eval::<()>(
                r#"
                app:get("/hello", "hello.lua")
                app:post("/users/{id}", "users/update.lua")
                app:all("/any", "any.lua")
                app:ws("/chat", "chat.lua")
                "#,
            )
            .unwrap();

        let routes = table.seal();
        assert_eq!(routes.len(), 4);
        assert_eq!(routes[0].method, Some(Method::GET));
        assert_eq!(routes[1].pattern, "/users/{id}");
        assert_eq!(routes[2].method, None);
        assert_eq!(routes[3].kind, RouteKind::WebSocket);

        let n: i64 = engine.eval("return #app:routes()").unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn sealed_table_rejects_declarations() {
        let table = RouteTable::new();
        let engine = Engine::new(crate::engine::EnvMap::new()).unwrap();
        engine.register("app", module(table.clone())).unwrap();
        table.seal();

        let (child, _) = engine.child().unwrap();
        let err = child
            .lua()
            .load(r#"app:get("/late", "late.lua")"#)
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("entry script"), "{err}");
    }

    #[test]
    fn rejects_relative_patterns() {
        let table = RouteTable::new();
        let engine = Engine::new(crate::engine::EnvMap::new()).unwrap();
        engine.register("app", module(table)).unwrap();
        assert!(engine.eval::<()>(r#"app:get("hello", "h.lua")"#).is_err());
    }
}
