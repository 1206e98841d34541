//! SQLite backends: the `db` driver and a file store for `kv` and sessions.
//!
//! Workers overlap during a reload, so persistent state lives in a file that
//! several processes can open at once.

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use rusqlite::{
    Connection, OptionalExtension, params, params_from_iter,
    types::{ToSql, ToSqlOutput, Value as SqliteValue, ValueRef},
};
use tracing::debug;

use super::{
    BoxError,
    db::{ExecResult, Rows, SqlDriver, SqlValue, Statement},
    kv::{BUCKET_DELIMITER, KvStore, validate_bucket},
    session::{SessionData, SessionStore},
};

/// Connection string for a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// How long a writer waits on another process holding the lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Self::Bool(b) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*b))),
            Self::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            Self::Real(n) => ToSqlOutput::Owned(SqliteValue::Real(*n)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_column(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(n) => SqlValue::Real(n),
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(text) => SqlValue::Text(text.to_string()),
            Err(_) => SqlValue::Blob(t.to_vec()),
        },
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

fn open(conn: &Path) -> rusqlite::Result<Connection> {
    if conn == Path::new(IN_MEMORY) {
        let connection = Connection::open_in_memory()?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        return Ok(connection);
    }
    open_file(conn)
}

fn open_file(path: &Path) -> rusqlite::Result<Connection> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(connection)
}

fn query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Rows, BoxError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_column(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(Rows { columns, rows: out })
}

fn exec(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<ExecResult, BoxError> {
    let affected = conn.prepare_cached(sql)?.execute(params_from_iter(params))?;
    Ok(ExecResult {
        rows_affected: u64::try_from(affected)?,
        last_insert_id: Some(conn.last_insert_rowid()),
    })
}

/// `db` driver over one SQLite connection.
pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDriver {
    /// Opens `conn`, a file path or [`IN_MEMORY`].
    ///
    /// # Errors
    /// Returns the SQLite error if the database cannot be opened.
    pub fn open(conn: &Path) -> Result<Self, BoxError> {
        debug!(conn = %conn.display(), "Opening SQL database");
        Ok(Self {
            conn: Arc::new(Mutex::new(open(conn)?)),
        })
    }
}

impl SqlDriver for SqliteDriver {
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Rows, BoxError> {
        query(&self.conn.lock(), sql, params)
    }

    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, BoxError> {
        exec(&self.conn.lock(), sql, params)
    }

    fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, BoxError> {
        self.conn.lock().prepare_cached(sql)?;
        Ok(Box::new(SqliteStatement {
            conn: self.conn.clone(),
            sql: sql.to_string(),
        }))
    }
}

/// Prepared statement; the compiled form stays in the connection's cache.
struct SqliteStatement {
    conn: Arc<Mutex<Connection>>,
    sql: String,
}

impl Statement for SqliteStatement {
    fn query(&self, params: &[SqlValue]) -> Result<Rows, BoxError> {
        query(&self.conn.lock(), &self.sql, params)
    }

    fn exec(&self, params: &[SqlValue]) -> Result<ExecResult, BoxError> {
        exec(&self.conn.lock(), &self.sql, params)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    bucket TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (bucket, key)
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expires_at INTEGER
);";

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Key/value buckets and sessions kept in one database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates the store at `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns an I/O or SQLite error.
    pub fn open(path: &Path) -> Result<Self, BoxError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = open_file(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "Opened data store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A store that lives as long as the value.
    ///
    /// # Errors
    /// Returns a SQLite error.
    pub fn in_memory() -> Result<Self, BoxError> {
        let conn = open(Path::new(IN_MEMORY))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<String>, BoxError> {
        validate_bucket(bucket)?;
        Ok(self
            .conn
            .lock()
            .prepare_cached("SELECT value FROM kv WHERE bucket = ?1 AND key = ?2")?
            .query_row(params![bucket, key], |row| row.get(0))
            .optional()?)
    }

    fn put(&self, bucket: &str, key: &str, value: &str) -> Result<(), BoxError> {
        validate_bucket(bucket)?;
        self.conn
            .lock()
            .prepare_cached(
                "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            )?
            .execute(params![bucket, key, value])?;
        Ok(())
    }

    fn keys(&self, bucket: &str) -> Result<Vec<String>, BoxError> {
        validate_bucket(bucket)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT key FROM kv WHERE bucket = ?1 ORDER BY key")?;
        let keys: Vec<String> = stmt
            .query_map(params![bucket], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(keys)
    }

    fn drop_bucket(&self, bucket: &str) -> Result<(), BoxError> {
        validate_bucket(bucket)?;
        let nested = format!("{bucket}{BUCKET_DELIMITER}");
        self.conn
            .lock()
            .prepare_cached(
                "DELETE FROM kv WHERE bucket = ?1 OR substr(bucket, 1, length(?2)) = ?2",
            )?
            .execute(params![bucket, nested])?;
        Ok(())
    }
}

impl SessionStore for SqliteStore {
    fn load(&self, id: &str) -> Result<Option<SessionData>, BoxError> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<i64>)> = conn
            .prepare_cached("SELECT data, expires_at FROM sessions WHERE id = ?1")?
            .query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        match row {
            Some((_, Some(expires_at))) if expires_at <= unix_now() => {
                conn.prepare_cached("DELETE FROM sessions WHERE id = ?1")?
                    .execute(params![id])?;
                Ok(None)
            }
            Some((data, _)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    fn save(&self, id: &str, data: &SessionData, ttl: Option<Duration>) -> Result<(), BoxError> {
        let expires_at = ttl
            .map(|ttl| i64::try_from(ttl.as_secs()).map(|secs| unix_now().saturating_add(secs)))
            .transpose()?;
        self.conn
            .lock()
            .prepare_cached(
                "INSERT INTO sessions (id, data, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET data = excluded.data, expires_at = excluded.expires_at",
            )?
            .execute(params![id, serde_json::to_string(data)?, expires_at])?;
        Ok(())
    }

    fn destroy(&self, id: &str) -> Result<(), BoxError> {
        self.conn
            .lock()
            .prepare_cached("DELETE FROM sessions WHERE id = ?1")?
            .execute(params![id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mlua::Lua;

    use super::*;
    use crate::engine::Module;
    use crate::modules::{db, kv};

    #[test]
    fn kv_survives_a_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("lumen.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("users", "alice", "1").unwrap();
            store.put("users:admins", "root", "1").unwrap();
            store.put("usersettings", "theme", "dark").unwrap();
            store.put("users", "alice", "2").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("users", "alice").unwrap().as_deref(), Some("2"));
        assert_eq!(store.keys("users:admins").unwrap(), vec!["root".to_string()]);

        store.drop_bucket("users").unwrap();
        assert!(store.keys("users").unwrap().is_empty());
        assert!(store.get("users:admins", "root").unwrap().is_none());
        assert_eq!(store.get("usersettings", "theme").unwrap().as_deref(), Some("dark"));
        assert!(store.put("a::b", "k", "v").is_err());
    }

    #[test]
    fn two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumen.db");
        let old = SqliteStore::open(&path).unwrap();
        let new = SqliteStore::open(&path).unwrap();
        old.put("jobs", "last", "7").unwrap();
        assert_eq!(new.get("jobs", "last").unwrap().as_deref(), Some("7"));
    }

    #[test]
    fn sessions_survive_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumen.db");
        let mut data = SessionData::new();
        data.insert("user".into(), serde_json::json!("ada"));
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save("live", &data, None).unwrap();
            store.save("old", &data, Some(Duration::ZERO)).unwrap();
            store.save("gone", &data, Some(Duration::from_secs(60))).unwrap();
            store.destroy("gone").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load("live").unwrap(), Some(data));
        assert!(store.load("old").unwrap().is_none());
        assert!(store.load("gone").unwrap().is_none());
    }

    #[test]
    fn scripts_query_sqlite() {
        let lua = Lua::new();
        let driver = Arc::new(SqliteDriver::open(Path::new(IN_MEMORY)).unwrap());
        lua.globals()
            .set("db", db::module(driver).load(&lua).unwrap())
            .unwrap();
        let (id, name, count, missing): (i64, String, i64, bool) = lua
            .load(
                r#"
                db:exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, admin BOOLEAN)")
                local r = db:exec("INSERT INTO users (name, admin) VALUES (?, ?)", "ada", true)
                local insert = db:stmt("INSERT INTO users (name) VALUES (?)")
                insert:exec("grace")
                insert:exec("linus")
                insert:close()
                local rows = db:query("SELECT id, name FROM users WHERE id = ?", r.last_insert_id).rows
                local total = db:query("SELECT count(*) AS n FROM users").rows[1].n
                local ok = pcall(db.query, db, "SELECT * FROM nope")
                return rows[1].id, rows[1].name, total, not ok
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!((id, name.as_str(), count, missing), (1, "ada", 3, true));
    }

    #[test]
    fn kv_module_over_sqlite() {
        let lua = Lua::new();
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::in_memory().unwrap());
        lua.globals()
            .set("kv", kv::module(store).load(&lua).unwrap())
            .unwrap();
        let value: String = lua
            .load("kv:put('site', 'title', 'Lumen') return kv:get('site', 'title')")
            .eval()
            .unwrap();
        assert_eq!(value, "Lumen");
    }
}
