//! Project configuration: `project.lua`, the project's `.env` and `LUMEN_*`
//! overrides.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use mlua::{DeserializeOptions, LuaSerdeExt, Value};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    engine::EnvMap,
    error::{Error, Result},
    modules::sqlite::IN_MEMORY,
    pool::new_interpreter,
};

pub const PROJECT_FILE: &str = "project.lua";
pub const DOTENV_FILE: &str = ".env";

const DEFAULT_PID: &str = "lumen.pid";
const DEFAULT_DATA_PATH: &str = "data";
const SQL_DRIVERS: [&str; 2] = ["sqlite", "sqlite3"];
const DEFAULT_DRAIN_TIMEOUT_SECS: f64 = 10.0;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle interpreters kept for reuse; unlimited when absent.
    pub max_idle: Option<usize>,
}

/// The `db` global's database.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub driver: String,
    /// Database file relative to the project directory, or `:memory:`.
    pub conn: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            driver: SQL_DRIVERS[0].to_string(),
            conn: PathBuf::from(IN_MEMORY),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub listen: SocketAddr,
    /// Script directory, relative to the project directory.
    pub root: PathBuf,
    /// Entry script or directory, relative to `root`.
    pub index: PathBuf,
    pub pid: PathBuf,
    /// Seconds a retiring worker may spend finishing in-flight requests.
    pub drain_timeout: f64,
    /// Seconds an HTTP script may run.
    pub script_timeout: Option<f64>,
    pub pool: PoolConfig,
    /// Directory holding persistent `kv` buckets and sessions.
    pub data_path: PathBuf,
    pub db: DbConfig,
    pub env: EnvMap,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            root: PathBuf::from("."),
            index: PathBuf::from("."),
            pid: PathBuf::from(DEFAULT_PID),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT_SECS,
            script_timeout: None,
            pool: PoolConfig::default(),
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            db: DbConfig::default(),
            env: EnvMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Loads the configuration of the project in `dir`, applying overrides
    /// from the process environment.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `project.lua` is malformed.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_with(dir, |name| std::env::var(name).ok())
    }

    /// Same as [`ProjectConfig::load`] with overrides read through `lookup`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `project.lua` or `.env` is
    /// malformed.
    pub fn load_with(dir: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = dir.join(PROJECT_FILE);
        let mut config = if file.is_file() {
            Self::parse(&file)?
        } else {
            debug!(dir = %dir.display(), "No project file; using defaults");
            Self::default()
        };
        config.merge_dotenv(&dir.join(DOTENV_FILE))?;
        config.apply_overrides(lookup);
        config.validate()?;
        config.resolve(dir);
        Ok(config)
    }

    fn parse(file: &Path) -> Result<Self> {
        let source = fs::read(file)?;
        let invalid = |err: &dyn std::fmt::Display| {
            Error::Configuration(format!("{}: {err}", file.display()))
        };

        let lua = new_interpreter()?;
        let value: Value = lua
            .load(source)
            .set_name(format!("@{}", file.display()))
            .eval()
            .map_err(|err| invalid(&err))?;
        if !value.is_table() {
            return Err(invalid(&format!(
                "must return a table, got {}",
                value.type_name()
            )));
        }
        lua.from_value_with(value, DeserializeOptions::new().deny_unsupported_types(false))
            .map_err(|err| invalid(&err))
    }

    /// Adds the entries of a dotenv file to `env`, replacing same-named keys.
    fn merge_dotenv(&mut self, file: &Path) -> Result<()> {
        if !file.is_file() {
            return Ok(());
        }
        let invalid =
            |err: dotenvy::Error| Error::Configuration(format!("{}: {err}", file.display()));
        for entry in dotenvy::from_path_iter(file).map_err(invalid)? {
            let (key, value) = entry.map_err(invalid)?;
            self.env.insert(key, value.into());
        }
        Ok(())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("LUMEN_LISTEN") {
            match raw.parse::<SocketAddr>() {
                Ok(listen) => self.listen = listen,
                Err(err) => warn!(%raw, ?err, "Invalid LUMEN_LISTEN; keeping {}", self.listen),
            }
        }
        if let Some(raw) = lookup("LUMEN_ROOT").filter(|v| !v.trim().is_empty()) {
            self.root = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("LUMEN_INDEX").filter(|v| !v.trim().is_empty()) {
            self.index = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("LUMEN_PID").filter(|v| !v.trim().is_empty()) {
            self.pid = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("LUMEN_DATA_PATH").filter(|v| !v.trim().is_empty()) {
            self.data_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("LUMEN_DRAIN_TIMEOUT") {
            match raw.parse::<f64>() {
                Ok(secs) if secs >= 0.0 && secs.is_finite() => self.drain_timeout = secs,
                _ => warn!(
                    %raw,
                    "Invalid LUMEN_DRAIN_TIMEOUT; keeping {}s", self.drain_timeout
                ),
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.drain_timeout >= 0.0 && self.drain_timeout.is_finite()) {
            return Err(Error::Configuration(format!(
                "drain_timeout must be a non-negative number, got {}",
                self.drain_timeout
            )));
        }
        if let Some(secs) = self.script_timeout
            && !(secs > 0.0 && secs.is_finite())
        {
            return Err(Error::Configuration(format!(
                "script_timeout must be a positive number, got {secs}"
            )));
        }
        if !SQL_DRIVERS.contains(&self.db.driver.as_str()) {
            return Err(Error::Configuration(format!(
                "unsupported db driver {:?}; expected one of {SQL_DRIVERS:?}",
                self.db.driver
            )));
        }
        Ok(())
    }

    fn resolve(&mut self, dir: &Path) {
        self.root = dir.join(&self.root);
        self.pid = dir.join(&self.pid);
        self.data_path = dir.join(&self.data_path);
        if self.db.conn != Path::new(IN_MEMORY) {
            self.db.conn = dir.join(&self.db.conn);
        }
        let listen = self.listen.to_string();
        let root = self.root.display().to_string();
        let index = self.index.display().to_string();
        let data_path = self.data_path.display().to_string();
        self.env.insert("LISTEN".into(), listen.into());
        self.env.insert("ROOT".into(), root.into());
        self.env.insert("INDEX".into(), index.into());
        self.env.insert("DATAPATH".into(), data_path.into());
    }

    /// Entry script path; a directory means its `index.lua`.
    #[must_use]
    pub fn entry(&self) -> PathBuf {
        crate::script::resolve_entry(&self.root.join(&self.index))
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.drain_timeout).unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn script_timeout(&self) -> Option<Duration> {
        self.script_timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load_with(dir.path(), no_env).unwrap();
        assert_eq!(config.listen.to_string(), "127.0.0.1:3000");
        assert_eq!(config.entry(), dir.path().join("index.lua"));
        assert_eq!(config.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.pid, dir.path().join(DEFAULT_PID));
        assert_eq!(config.env["LISTEN"], "127.0.0.1:3000");
        assert_eq!(config.data_path, dir.path().join(DEFAULT_DATA_PATH));
        assert_eq!(config.db.driver, "sqlite");
        assert_eq!(config.db.conn, Path::new(IN_MEMORY));
    }

    #[test]
    fn reads_project_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PROJECT_FILE),
            r#"
            return {
                listen = "0.0.0.0:8080",
                root = "www",
                index = "main.lua",
                drain_timeout = 2.5,
                script_timeout = 1,
                pool = { max_idle = 4 },
                data_path = "state",
                db = { driver = "sqlite3", conn = "app.db" },
                env = { GREETING = "hi", LIMITS = { 1, 2 } },
            }
            "#,
        )
        .unwrap();
        let config = ProjectConfig::load_with(dir.path(), no_env).unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.entry(), dir.path().join("www").join("main.lua"));
        assert_eq!(config.drain_timeout(), Duration::from_millis(2500));
        assert_eq!(config.script_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.pool.max_idle, Some(4));
        assert_eq!(config.env["GREETING"], "hi");
        assert_eq!(config.env["LIMITS"], serde_json::json!([1, 2]));
        assert_eq!(config.data_path, dir.path().join("state"));
        assert_eq!(config.db.conn, dir.path().join("app.db"));
        assert_eq!(
            config.env["DATAPATH"],
            dir.path().join("state").display().to_string()
        );
    }

    #[test]
    fn dotenv_entries_merge_into_env() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(PROJECT_FILE),
            "return { env = { GREETING = 'hi', MODE = 'dev' } }",
        )
        .unwrap();
        fs::write(
            dir.path().join(DOTENV_FILE),
            "# local secrets\nMODE=prod\nAPI_KEY=\"s3cret\"\n",
        )
        .unwrap();
        let config = ProjectConfig::load_with(dir.path(), no_env).unwrap();
        assert_eq!(config.env["GREETING"], "hi");
        assert_eq!(config.env["MODE"], "prod");
        assert_eq!(config.env["API_KEY"], "s3cret");
    }

    #[test]
    fn environment_overrides_and_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::from([
            ("LUMEN_LISTEN", "127.0.0.1:9000"),
            ("LUMEN_PID", "run/app.pid"),
            ("LUMEN_DRAIN_TIMEOUT", "soon"),
            ("LUMEN_DATA_PATH", "/var/lib/lumen"),
        ]);
        let config = ProjectConfig::load_with(dir.path(), |name| {
            vars.get(name).map(ToString::to_string)
        })
        .unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.pid, dir.path().join("run/app.pid"));
        assert_eq!(config.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.data_path, Path::new("/var/lib/lumen"));
    }

    #[test]
    fn malformed_project_file_is_configuration_error() {
        for source in [
            "return {",
            "return 42",
            "return { listen = 'not an address' }",
            "return { pool = { max_idle = 'many' } }",
            "return { drain_timeout = -1 }",
            "return { db = { driver = 'postgres' } }",
        ] {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join(PROJECT_FILE), source).unwrap();
            let err = ProjectConfig::load_with(dir.path(), no_env).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{source}: {err:?}");
            assert!(err.is_fatal_at_startup());
        }
    }

    #[test]
    fn malformed_dotenv_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DOTENV_FILE), "NAME='unterminated\n").unwrap();
        let err = ProjectConfig::load_with(dir.path(), no_env).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err:?}");
    }
}
