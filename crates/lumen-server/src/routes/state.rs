use std::sync::Arc;

use anyhow::{Context, anyhow};
use lumen::{
    Engine, ProjectConfig, ScriptCache, ScriptHandler,
    modules::{
        app::{self, Route, RouteTable},
        cli, db, kv,
        sqlite::{SqliteDriver, SqliteStore},
    },
};
use tracing::info;

/// Database file under the data path holding `kv` buckets and sessions.
const STORE_FILE: &str = "lumen.db";

#[derive(Clone)]
pub struct AppState {
    pub handler: ScriptHandler,
    pub routes: Arc<[Route]>,
}

impl AppState {
    /// Builds the engine, runs the entry script and freezes its routes.
    pub fn new(config: &ProjectConfig) -> anyhow::Result<Self> {
        let engine = Engine::builder()
            .env(config.env.clone())
            .max_idle(config.pool.max_idle)
            .build()?;
        let store_path = config.data_path.join(STORE_FILE);
        let store = Arc::new(
            SqliteStore::open(&store_path)
                .map_err(|err| anyhow!(err))
                .with_context(|| format!("data store {}", store_path.display()))?,
        );
        let driver = SqliteDriver::open(&config.db.conn)
            .map_err(|err| anyhow!(err))
            .with_context(|| {
                format!("{} database {}", config.db.driver, config.db.conn.display())
            })?;

        let table = RouteTable::new();
        engine.register("app", app::module(table.clone()))?;
        engine.register("cli", cli::module())?;
        engine.register("kv", kv::module(store.clone()))?;
        engine.register("db", db::module(Arc::new(driver)))?;

        let entry = config.entry();
        engine
            .run(&entry)
            .with_context(|| format!("entry script {}", entry.display()))?;
        let routes: Arc<[Route]> = table.seal().into();
        info!(routes = routes.len(), "Entry script finished");

        let handler = ScriptHandler::new(
            engine,
            Arc::new(ScriptCache::new()?),
            &config.root,
            store,
        )
        .with_timeout(config.script_timeout());
        Ok(Self { handler, routes })
    }

    pub fn shutdown(&self) {
        self.handler.engine().shutdown();
    }
}
