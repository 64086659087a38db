//! SQLite-backed asset directory
//! Holds the ASSETS_DEVICE inventory and the PROXY_ASSETS mirror locally

use super::AssetDirectory;
use crate::error::{FleetError, FleetResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Number, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Thread-safe directory over a single SQLite connection
pub struct SqliteAssetDirectory {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl SqliteAssetDirectory {
    /// Open (or create) the database and ensure both tables exist
    pub fn new<P: AsRef<Path>>(db_path: P) -> FleetResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(unavailable)?;
            }
        }

        let conn = Connection::open(&db_path).map_err(unavailable)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(unavailable)?;

        Self::with_connection(conn, db_path_str)
    }

    pub fn open_in_memory() -> FleetResult<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::with_connection(conn, ":memory:".to_string())
    }

    fn with_connection(conn: Connection, db_path: String) -> FleetResult<Self> {
        let directory = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        directory.initialize()?;
        Ok(directory)
    }

    fn initialize(&self) -> FleetResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ASSETS_DEVICE (
                NDEVICECODE INTEGER PRIMARY KEY,
                SIP TEXT NOT NULL,
                NMANAGEPORT INTEGER NOT NULL DEFAULT 443,
                SNAME TEXT DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS PROXY_ASSETS (
                NPROXY_PORT TEXT PRIMARY KEY,
                NPROXY_CODE TEXT NOT NULL,
                SIP TEXT NOT NULL,
                NMANAGE_PORT TEXT NOT NULL,
                SNAME TEXT DEFAULT '',
                NUSE_FLAG INTEGER DEFAULT 1,
                SDESC TEXT DEFAULT ''
            );",
        )
        .map_err(unavailable)?;

        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }
}

#[async_trait]
impl AssetDirectory for SqliteAssetDirectory {
    async fn query(&self, sql: &str) -> FleetResult<Vec<Value>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(sql).map_err(unavailable)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query([]).map_err(unavailable)?;
        let mut out = Vec::new();

        while let Some(row) = rows.next().map_err(unavailable)? {
            let mut object = Map::new();
            for (idx, name) in names.iter().enumerate() {
                let value = row.get_ref(idx).map_err(unavailable)?;
                object.insert(name.clone(), to_json(value));
            }
            out.push(Value::Object(object));
        }

        debug!("{} returned {} rows", self.db_path, out.len());
        Ok(out)
    }

    async fn execute(&self, statements: &[String]) -> FleetResult<()> {
        let conn = self.conn.lock();
        for statement in statements {
            conn.execute_batch(statement).map_err(unavailable)?;
        }
        Ok(())
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn unavailable(e: impl std::fmt::Display) -> FleetError {
    FleetError::DirectoryUnavailable(e.to_string())
}
