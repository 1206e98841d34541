//! `db`: SQL access through a pluggable driver.

use std::sync::Arc;

use mlua::{FromLua, IntoLua, Lua, MultiValue, Table, Value};
use parking_lot::Mutex;

use super::BoxError;
use crate::{
    bridge::{self, Surface},
    engine::Module,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl FromLua for SqlValue {
    fn from_lua(value: Value, _: &Lua) -> mlua::Result<Self> {
        Ok(match value {
            Value::Nil => Self::Null,
            Value::Boolean(b) => Self::Bool(b),
            Value::Integer(i) => Self::Integer(i),
            Value::Number(n) => Self::Real(n),
            Value::String(s) => match s.to_str() {
                Ok(text) => Self::Text(text.to_string()),
                Err(_) => Self::Blob(s.as_bytes().to_vec()),
            },
            other => {
                return Err(mlua::Error::runtime(format!(
                    "cannot bind a {} as an SQL parameter",
                    other.type_name()
                )));
            }
        })
    }
}

impl IntoLua for SqlValue {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        match self {
            Self::Null => Ok(Value::Nil),
            Self::Bool(b) => Ok(Value::Boolean(b)),
            Self::Integer(i) => Ok(Value::Integer(i)),
            Self::Real(n) => Ok(Value::Number(n)),
            Self::Text(s) => s.into_lua(lua),
            Self::Blob(b) => lua.create_string(b).map(Value::String),
        }
    }
}

/// Result set of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

pub trait SqlDriver: Send + Sync + 'static {
    /// # Errors
    /// Returns a driver error.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Rows, BoxError>;
    /// # Errors
    /// Returns a driver error.
    fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, BoxError>;
    /// # Errors
    /// Returns a driver error.
    fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, BoxError>;
}

pub trait Statement: Send + Sync {
    /// # Errors
    /// Returns a driver error.
    fn query(&self, params: &[SqlValue]) -> Result<Rows, BoxError>;
    /// # Errors
    /// Returns a driver error.
    fn exec(&self, params: &[SqlValue]) -> Result<ExecResult, BoxError>;
    /// # Errors
    /// Returns a driver error.
    fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

fn params(args: MultiValue, lua: &Lua) -> mlua::Result<Vec<SqlValue>> {
    args.into_iter()
        .map(|value| SqlValue::from_lua(value, lua))
        .collect()
}

fn rows_to_lua(lua: &Lua, rows: Rows) -> mlua::Result<Table> {
    let out = lua.create_table()?;
    let list = lua.create_table()?;
    for row in rows.rows {
        let record = lua.create_table()?;
        for (column, value) in rows.columns.iter().zip(row) {
            record.set(column.as_str(), value)?;
        }
        list.push(record)?;
    }
    out.set("columns", rows.columns)?;
    out.set("rows", list)?;
    Ok(out)
}

fn exec_to_lua(lua: &Lua, result: ExecResult) -> mlua::Result<Table> {
    let out = lua.create_table()?;
    out.set("rows_affected", result.rows_affected)?;
    out.set("last_insert_id", result.last_insert_id)?;
    Ok(out)
}

struct Database(Arc<dyn SqlDriver>);

struct StatementHandle(Mutex<Option<Box<dyn Statement>>>);

impl StatementHandle {
    fn with<R>(&self, f: impl FnOnce(&dyn Statement) -> Result<R, BoxError>) -> mlua::Result<R> {
        let guard = self.0.lock();
        let statement = guard
            .as_deref()
            .ok_or_else(|| mlua::Error::runtime("statement is closed"))?;
        f(statement).map_err(mlua::Error::external)
    }
}

fn statement_surface() -> Surface<StatementHandle> {
    Surface::new()
        .method("query", |lua, stmt: &StatementHandle, args: MultiValue| {
            let params = params(args, lua)?;
            let rows = stmt.with(|s| s.query(&params))?;
            rows_to_lua(lua, rows)
        })
        .method("exec", |lua, stmt: &StatementHandle, args: MultiValue| {
            let params = params(args, lua)?;
            let result = stmt.with(|s| s.exec(&params))?;
            exec_to_lua(lua, result)
        })
        .method("close", |_, stmt: &StatementHandle, ()| {
            match stmt.0.lock().take() {
                Some(statement) => statement.close().map_err(mlua::Error::external),
                None => Ok(()),
            }
        })
}

fn database_surface() -> Surface<Database> {
    Surface::new()
        .method("query", |lua, db: &Database, (sql, args): (String, MultiValue)| {
            let rows = db
                .0
                .query(&sql, &params(args, lua)?)
                .map_err(mlua::Error::external)?;
            rows_to_lua(lua, rows)
        })
        .method("exec", |lua, db: &Database, (sql, args): (String, MultiValue)| {
            let result = db
                .0
                .exec(&sql, &params(args, lua)?)
                .map_err(mlua::Error::external)?;
            exec_to_lua(lua, result)
        })
        .method("stmt", |lua, db: &Database, sql: String| {
            let statement = db.0.prepare(&sql).map_err(mlua::Error::external)?;
            bridge::class(
                lua,
                "Statement",
                Arc::new(StatementHandle(Mutex::new(Some(statement)))),
                statement_surface,
            )
        })
}

/// The `db` global backed by `driver`.
pub fn module(driver: Arc<dyn SqlDriver>) -> impl Module {
    move |lua: &Lua| {
        bridge::class(lua, "Database", Arc::new(Database(driver.clone())), database_surface)
            .map(Value::UserData)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records calls and answers every query with one fixed row.
    #[derive(Default)]
    struct FakeDriver {
        calls: Mutex<Vec<(String, Vec<SqlValue>)>>,
    }

    impl FakeDriver {
        fn record(&self, sql: &str, params: &[SqlValue]) {
            self.calls.lock().push((sql.to_string(), params.to_vec()));
        }
    }

    impl SqlDriver for FakeDriver {
        fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Rows, BoxError> {
            if sql.contains("broken") {
                return Err("no such table: broken".into());
            }
            self.record(sql, params);
            Ok(Rows {
                columns: vec!["id".into(), "name".into()],
                rows: vec![vec![SqlValue::Integer(1), SqlValue::Text("ada".into())]],
            })
        }

        fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, BoxError> {
            self.record(sql, params);
            Ok(ExecResult {
                rows_affected: 1,
                last_insert_id: Some(7),
            })
        }

        fn prepare(&self, _: &str) -> Result<Box<dyn Statement>, BoxError> {
            Ok(Box::new(FakeStatement))
        }
    }

    struct FakeStatement;

    impl Statement for FakeStatement {
        fn query(&self, _: &[SqlValue]) -> Result<Rows, BoxError> {
            Ok(Rows::default())
        }

        fn exec(&self, params: &[SqlValue]) -> Result<ExecResult, BoxError> {
            Ok(ExecResult {
                rows_affected: params.len() as u64,
                last_insert_id: None,
            })
        }
    }

    fn lua_with(driver: Arc<FakeDriver>) -> Lua {
        let lua = Lua::new();
        lua.globals()
            .set("db", module(driver).load(&lua).unwrap())
            .unwrap();
        lua
    }

    #[test]
    fn query_returns_named_columns() {
        let driver = Arc::new(FakeDriver::default());
        let lua = lua_with(driver.clone());
        let (name, ncols): (String, usize) = lua
            .load("local r = db:query('select * from users where id = ?', 1) return r.rows[1].name, #r.columns")
            .eval()
            .unwrap();
        assert_eq!((name.as_str(), ncols), ("ada", 2));
        assert_eq!(driver.calls.lock()[0].1, vec![SqlValue::Integer(1)]);
    }

    #[test]
    fn exec_and_statements() {
        let driver = Arc::new(FakeDriver::default());
        let lua = lua_with(driver);
        let (id, affected): (i64, u64) = lua
            .load(
                r#"
                local r = db:exec("insert into t values (?, ?)", "a", nil)
                local s = db:stmt("update t set v = ?")
                local e = s:exec(1, 2, 3)
                s:close()
                return r.last_insert_id, e.rows_affected
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!((id, affected), (7, 3));
    }

    #[test]
    fn closed_statement_errors() {
        let lua = lua_with(Arc::new(FakeDriver::default()));
        let err = lua
            .load("local s = db:stmt('select 1') s:close() s:query()")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("statement is closed"), "{err}");
    }

    #[test]
    fn driver_errors_reach_scripts() {
        let lua = lua_with(Arc::new(FakeDriver::default()));
        let ok: bool = lua
            .load("local ok, err = pcall(db.query, db, 'select * from broken') return not ok and tostring(err):find('no such table') ~= nil")
            .eval()
            .unwrap();
        assert!(ok);
    }
}
