use crate::errors::{AppError, AppResult};
use crate::gate::{GateOptions, ResourceHandle, SyncGate};
use crate::models::{GateSnapshot, SqlRequest, SqlResponse};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

const CONNECTION_UNAVAILABLE: &str = "Database connection is not available";

#[derive(Debug)]
pub struct SqliteResource {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteResource {
    pub fn open_at(path: &Path) -> AppResult<Self> {
        let mut resource = Self {
            path: path.to_path_buf(),
            conn: None,
        };
        resource.open()?;
        Ok(resource)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> AppResult<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| AppError::ResourceUnavailable(CONNECTION_UNAVAILABLE.to_string()))
    }
}

impl ResourceHandle for SqliteResource {
    fn open(&mut self) -> AppResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(&self.path).map_err(AppError::from)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %self.path.display(), journal_mode = %mode, "extra database opened");
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        match self.conn.take() {
            Some(conn) => conn.close().map_err(|(_, error)| AppError::from(error)),
            None => Ok(()),
        }
    }

    fn ping(&self) -> AppResult<()> {
        self.connection()?
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

/// Auxiliary plugin database. Every statement goes through the sync gate so
/// nothing touches the file while a sync holds it closed.
#[derive(Clone)]
pub struct ExtraDatabase {
    gate: SyncGate<SqliteResource>,
    db_path: PathBuf,
}

impl ExtraDatabase {
    pub fn open(path: &Path, options: GateOptions) -> AppResult<Self> {
        let resource = SqliteResource::open_at(path)?;
        Ok(Self {
            gate: SyncGate::new(resource, options),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn gate(&self) -> &SyncGate<SqliteResource> {
        &self.gate
    }

    pub fn snapshot(&self) -> GateSnapshot {
        self.gate.snapshot()
    }

    pub async fn query(&self, request: SqlRequest) -> SqlResponse {
        self.gate
            .submit(move |resource: &mut SqliteResource| run_query(resource, &request))
            .await
            .unwrap_or_else(|error| SqlResponse::failure(error.to_string()))
    }

    pub async fn exec(&self, request: SqlRequest) -> SqlResponse {
        self.gate
            .submit(move |resource: &mut SqliteResource| run_exec(resource, &request))
            .await
            .unwrap_or_else(|error| SqlResponse::failure(error.to_string()))
    }

    pub async fn close_for_sync(&self) -> AppResult<()> {
        tracing::info!(path = %self.db_path.display(), "close extra database for sync");
        self.gate.begin_exclusive().await
    }

    pub async fn reopen_after_sync(&self) -> AppResult<()> {
        tracing::info!(path = %self.db_path.display(), "reopen extra database after sync");
        self.gate.end_exclusive().await
    }

    pub async fn close(&self) -> AppResult<()> {
        self.gate.close().await
    }
}

fn run_query(resource: &SqliteResource, request: &SqlRequest) -> SqlResponse {
    let Ok(conn) = resource.connection() else {
        return SqlResponse::failure(CONNECTION_UNAVAILABLE);
    };
    match query_rows(conn, request) {
        Ok(rows) => SqlResponse::success(Value::Array(rows)),
        Err(error) => SqlResponse::failure(error.to_string()),
    }
}

fn run_exec(resource: &SqliteResource, request: &SqlRequest) -> SqlResponse {
    let Ok(conn) = resource.connection() else {
        return SqlResponse::failure(CONNECTION_UNAVAILABLE);
    };
    match conn.execute(&request.stmt, params_from_iter(bind_args(&request.args))) {
        Ok(affected) => SqlResponse::success(json!({ "affected": affected })),
        Err(error) => SqlResponse::failure(error.to_string()),
    }
}

fn query_rows(conn: &Connection, request: &SqlRequest) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(&request.stmt)?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let mut rows = stmt.query(params_from_iter(bind_args(&request.args)))?;

    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            object.insert(column.clone(), column_to_json(row.get_ref(index)?));
        }
        result.push(Value::Object(object));
    }
    Ok(result)
}

fn bind_args(args: &[Value]) -> Vec<SqlValue> {
    args.iter()
        .map(|arg| match arg {
            Value::Null => SqlValue::Null,
            Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => SqlValue::Integer(integer),
                None => SqlValue::Real(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => SqlValue::Text(text.clone()),
            other => SqlValue::Text(other.to_string()),
        })
        .collect()
}

fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => json!(integer),
        ValueRef::Real(real) => serde_json::Number::from_f64(real)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
