use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use mpx_core::{ProxyError, Result, ServerState};

/// Durable runtime state for one upstream, mirrored from the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRecord {
    pub name: String,
    pub server_state: ServerState,
    pub ever_connected: bool,
    pub last_successful_connection: Option<DateTime<Utc>>,
    pub tool_count: Option<u32>,
    pub auto_disable_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UpstreamRecord {
    pub fn new(name: impl Into<String>, server_state: ServerState) -> Self {
        Self {
            name: name.into(),
            server_state,
            ever_connected: false,
            last_successful_connection: None,
            tool_count: None,
            auto_disable_reason: None,
            updated_at: Utc::now(),
        }
    }
}

/// SQLite-backed store for upstream records.
///
/// All writes are transactional at single-record granularity. The store is
/// the only component that touches the database; everyone else goes through
/// the supervisor.
pub struct StateStore {
    conn: Mutex<Option<Connection>>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS upstreams (
                name TEXT PRIMARY KEY,
                server_state TEXT NOT NULL,
                ever_connected INTEGER NOT NULL DEFAULT 0,
                last_successful_connection TEXT,
                tool_count INTEGER,
                auto_disable_reason TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn upsert(&self, record: &UpstreamRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO upstreams
                    (name, server_state, ever_connected, last_successful_connection,
                     tool_count, auto_disable_reason, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(name) DO UPDATE SET
                    server_state = excluded.server_state,
                    ever_connected = excluded.ever_connected,
                    last_successful_connection = excluded.last_successful_connection,
                    tool_count = excluded.tool_count,
                    auto_disable_reason = excluded.auto_disable_reason,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.name,
                    record.server_state.as_str(),
                    record.ever_connected,
                    record.last_successful_connection.map(|t| t.to_rfc3339()),
                    record.tool_count,
                    record.auto_disable_reason,
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<UpstreamRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name, server_state, ever_connected, last_successful_connection, \
                 tool_count, auto_disable_reason, updated_at \
                 FROM upstreams WHERE name = ?1",
                params![name],
                row_to_record,
            )
            .optional()
            .map_err(db_err)
        })
    }

    pub fn all(&self) -> Result<Vec<UpstreamRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, server_state, ever_connected, last_successful_connection, \
                     tool_count, auto_disable_reason, updated_at \
                     FROM upstreams ORDER BY name",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], row_to_record)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM upstreams WHERE name = ?1", params![name])
                .map_err(db_err)?;
            Ok(())
        })
    }

    /// Marks a successful connection: `ever_connected`, the success
    /// timestamp, and the discovered tool count.
    pub fn record_connected(&self, name: &str, state: ServerState, tool_count: u32) -> Result<()> {
        let mut record = self
            .get(name)?
            .unwrap_or_else(|| UpstreamRecord::new(name, state));
        record.server_state = state;
        record.ever_connected = true;
        record.last_successful_connection = Some(Utc::now());
        record.tool_count = Some(tool_count);
        record.updated_at = Utc::now();
        self.upsert(&record)
    }

    /// Durably records an auto-disable decision.
    pub fn persist_auto_disable(&self, name: &str, reason: &str) -> Result<()> {
        debug!(server = %name, reason = %reason, "persisting auto-disable");
        let mut record = self
            .get(name)?
            .unwrap_or_else(|| UpstreamRecord::new(name, ServerState::AutoDisabled));
        record.server_state = ServerState::AutoDisabled;
        record.auto_disable_reason = Some(reason.to_string());
        record.updated_at = Utc::now();
        self.upsert(&record)
    }

    /// Clears an auto-disable, writing the operator's chosen state.
    pub fn clear_auto_disable(&self, name: &str, new_state: ServerState) -> Result<()> {
        let mut record = self
            .get(name)?
            .unwrap_or_else(|| UpstreamRecord::new(name, new_state));
        record.server_state = new_state;
        record.auto_disable_reason = None;
        record.updated_at = Utc::now();
        self.upsert(&record)
    }

    /// Flushes and closes the connection. Later operations fail with a
    /// persistence error.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock();
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| ProxyError::Persistence(e.to_string()))?;
        }
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| ProxyError::Persistence("state store is closed".to_string()))?;
        f(conn)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UpstreamRecord> {
    let state: String = row.get(1)?;
    let last_ok: Option<String> = row.get(3)?;
    let updated_at: String = row.get(6)?;
    Ok(UpstreamRecord {
        name: row.get(0)?,
        server_state: state.parse().unwrap_or(ServerState::Disabled),
        ever_connected: row.get(2)?,
        last_successful_connection: last_ok
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc)),
        tool_count: row.get(4)?,
        auto_disable_reason: row.get(5)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn db_err(e: rusqlite::Error) -> ProxyError {
    ProxyError::Persistence(e.to_string())
}
