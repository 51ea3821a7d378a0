//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, Transaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Default number of checks kept per (host, network, type) bucket.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

pub(super) const HOST_COLUMNS: &str = "id, hostname, internal_address, public_address, discovered_address, \
     service_port, first_seen_at, last_seen_at, is_local";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid identity: {0}")]
    Invalid(String),
}

/// Thread-safe database store.
///
/// Every mutation runs in a single SQLite transaction behind one connection
/// lock, so concurrent writers are serialized and readers never observe a
/// half-applied write.
#[derive(Clone)]
pub struct Store {
    pub(super) conn: Arc<Mutex<Connection>>,
    pub(super) history_limit: usize,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    /// Cap the number of checks retained per bucket. Zero is treated as one.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    // --- Hosts ---

    /// Insert or merge a peer host.
    ///
    /// Identity precedence: a host with the advertised hostname is updated in
    /// place; otherwise a host already holding one of the advertised addresses
    /// is renamed and updated; otherwise a new host is created. Non-empty
    /// advertised addresses replace stored ones, and an address claimed from a
    /// different host is cleared on that host so addresses stay unique.
    pub fn upsert_host(&self, identity: &HostIdentity) -> Result<Host, DbError> {
        let hostname = identity.hostname.trim();
        if hostname.is_empty() {
            return Err(DbError::Invalid("empty hostname".to_string()));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(local) = find_local(&tx)? {
            if local.hostname == hostname
                || matches_nonempty(&local.internal_address, &identity.internal_address)
                || matches_nonempty(&local.public_address, &identity.public_address)
            {
                return Err(DbError::Conflict(format!(
                    "{} is the local node",
                    hostname
                )));
            }
        }

        let existing = match find_host_id(&tx, "hostname", hostname)? {
            Some(id) => Some(id),
            None => match find_host_id(&tx, "internal_address", &identity.internal_address)? {
                Some(id) => Some(id),
                None => find_host_id(&tx, "public_address", &identity.public_address)?,
            },
        };

        let now = fmt_time(Utc::now());
        let id = match existing {
            Some(id) => {
                release_addresses(&tx, identity, id)?;
                tx.execute(
                    "UPDATE hosts SET hostname = ?1,
                        internal_address = CASE WHEN ?2 = '' THEN internal_address ELSE ?2 END,
                        public_address = CASE WHEN ?3 = '' THEN public_address ELSE ?3 END,
                        discovered_address = CASE WHEN ?4 = '' THEN discovered_address ELSE ?4 END,
                        service_port = CASE WHEN ?5 = 0 THEN service_port ELSE ?5 END,
                        last_seen_at = ?6
                     WHERE id = ?7",
                    params![
                        hostname,
                        identity.internal_address,
                        identity.public_address,
                        identity.discovered_address,
                        identity.service_port,
                        now,
                        id,
                    ],
                )?;
                id
            }
            None => {
                release_addresses(&tx, identity, 0)?;
                tx.execute(
                    "INSERT INTO hosts (hostname, internal_address, public_address, discovered_address,
                        service_port, first_seen_at, last_seen_at, is_local)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)",
                    params![
                        hostname,
                        identity.internal_address,
                        identity.public_address,
                        identity.discovered_address,
                        identity.service_port,
                        now,
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        let host = get_host_tx(&tx, id)?;
        tx.commit()?;
        Ok(host)
    }

    /// Get a host by ID.
    pub fn get_host_by_id(&self, id: i64) -> Result<Host, DbError> {
        let conn = self.conn.lock();
        query_host(&conn, "id = ?1", params![id])
    }

    /// Get a host by its hostname.
    pub fn get_host_by_hostname(&self, hostname: &str) -> Result<Host, DbError> {
        let conn = self.conn.lock();
        query_host(&conn, "hostname = ?1", params![hostname])
    }

    /// Get a host by internal, public or discovered address, in that order.
    pub fn get_host_by_address(&self, addr: &str) -> Result<Host, DbError> {
        if addr.is_empty() {
            return Err(DbError::NotFound);
        }
        let conn = self.conn.lock();
        for column in ["internal_address", "public_address", "discovered_address"] {
            match query_host(&conn, &format!("{} = ?1", column), params![addr]) {
                Err(DbError::NotFound) => continue,
                other => return other,
            }
        }
        Err(DbError::NotFound)
    }

    /// List hosts matching the filter, ordered by hostname.
    pub fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>, DbError> {
        let mut sql = format!("SELECT {} FROM hosts WHERE 1 = 1", HOST_COLUMNS);
        if !filter.include_local {
            sql.push_str(" AND is_local = 0");
        }
        if filter.with_public_address {
            sql.push_str(" AND public_address <> ''");
        }
        if filter.seen_since.is_some() {
            sql.push_str(" AND last_seen_at >= ?1");
        }
        sql.push_str(" ORDER BY hostname ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let hosts = match filter.seen_since {
            Some(since) => stmt.query_map(params![fmt_time(since)], host_from_row)?,
            None => stmt.query_map([], host_from_row)?,
        }
        .collect::<SqlResult<Vec<_>>>()?;

        Ok(hosts)
    }

    /// Delete a host with its history, latest checks and uptime counters.
    pub fn delete_host(&self, id: i64) -> Result<(), DbError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let host = get_host_tx(&tx, id)?;
        if host.is_local {
            return Err(DbError::Conflict("cannot delete the local node".to_string()));
        }
        delete_host_tx(&tx, id)?;

        tx.commit()?;
        Ok(())
    }

    // --- Self identity ---

    /// Record a process start: create the local record on first start,
    /// otherwise bump the restart counter and refresh its addresses.
    pub fn register_start(&self, identity: &HostIdentity) -> Result<SelfIdentity, DbError> {
        self.write_self(identity, true)
    }

    /// Refresh the local record's hostname and addresses.
    pub fn refresh_self(&self, identity: &HostIdentity) -> Result<SelfIdentity, DbError> {
        self.write_self(identity, false)
    }

    /// Get the local node's record.
    pub fn self_identity(&self) -> Result<SelfIdentity, DbError> {
        let conn = self.conn.lock();
        query_self(&conn)
    }

    fn write_self(&self, identity: &HostIdentity, started: bool) -> Result<SelfIdentity, DbError> {
        let hostname = identity.hostname.trim();
        if hostname.is_empty() {
            return Err(DbError::Invalid("empty hostname".to_string()));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = fmt_time(Utc::now());

        // A peer record carrying our own name is a stale view of this node.
        let stale: Option<i64> = tx
            .query_row(
                "SELECT id FROM hosts WHERE hostname = ?1 AND is_local = 0",
                params![hostname],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = stale {
            delete_host_tx(&tx, id)?;
        }

        let local = find_local(&tx)?;
        let local_id = local.as_ref().map(|h| h.id).unwrap_or(0);
        release_addresses(&tx, identity, local_id)?;

        match local {
            Some(host) => {
                let restart_sql = if started {
                    ", restarts = restarts + 1, last_start_at = ?5"
                } else {
                    ""
                };
                tx.execute(
                    &format!(
                        "UPDATE hosts SET hostname = ?1, internal_address = ?2, public_address = ?3,
                            service_port = ?4, last_seen_at = ?5{} WHERE id = ?6",
                        restart_sql
                    ),
                    params![
                        hostname,
                        identity.internal_address,
                        identity.public_address,
                        identity.service_port,
                        now,
                        host.id,
                    ],
                )?;
            }
            None if started => {
                tx.execute(
                    "INSERT INTO hosts (hostname, internal_address, public_address, service_port,
                        first_seen_at, last_seen_at, is_local, restarts, first_start_at, last_start_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, 0, ?5, ?5)",
                    params![
                        hostname,
                        identity.internal_address,
                        identity.public_address,
                        identity.service_port,
                        now,
                    ],
                )?;
            }
            None => return Err(DbError::NotFound),
        }

        let me = query_self(&tx)?;
        tx.commit()?;
        Ok(me)
    }

    // --- Logs ---

    /// Add log entries in batch.
    pub fn add_logs(&self, entries: &[LogEntry]) -> Result<(), DbError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO logs (level, target, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            )?;

            for e in entries {
                stmt.execute(params![e.level, e.target, e.message, fmt_time(e.created_at)])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get the most recent log entries, newest first.
    pub fn get_logs(&self, limit: usize) -> Result<Vec<LogEntry>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT level, target, message, created_at FROM logs ORDER BY id DESC LIMIT ?1",
        )?;

        let logs = stmt
            .query_map(params![limit as i64], |row| {
                Ok(LogEntry {
                    level: row.get(0)?,
                    target: row.get(1)?,
                    message: row.get(2)?,
                    created_at: time_col(row, 3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(logs)
    }
}

fn matches_nonempty(stored: &str, advertised: &str) -> bool {
    !advertised.is_empty() && stored == advertised
}

fn find_host_id(conn: &Connection, column: &str, value: &str) -> Result<Option<i64>, DbError> {
    if value.is_empty() {
        return Ok(None);
    }
    let id = conn
        .query_row(
            &format!("SELECT id FROM hosts WHERE {} = ?1 AND is_local = 0", column),
            params![value],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

fn find_local(conn: &Connection) -> Result<Option<Host>, DbError> {
    match query_host(conn, "is_local = 1", []) {
        Ok(h) => Ok(Some(h)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Clear advertised addresses from any other peer currently holding them.
fn release_addresses(tx: &Transaction<'_>, identity: &HostIdentity, keep_id: i64) -> Result<(), DbError> {
    for (column, value) in [
        ("internal_address", &identity.internal_address),
        ("public_address", &identity.public_address),
    ] {
        if value.is_empty() {
            continue;
        }
        let moved = tx.execute(
            &format!(
                "UPDATE hosts SET {col} = '' WHERE {col} = ?1 AND id <> ?2 AND is_local = 0",
                col = column
            ),
            params![value, keep_id],
        )?;
        if moved > 0 {
            tracing::info!("Address {} moved to {}", value, identity.hostname);
        }
    }
    Ok(())
}

pub(super) fn delete_host_tx(tx: &Transaction<'_>, id: i64) -> Result<(), DbError> {
    tx.execute("DELETE FROM checks WHERE host_id = ?1", params![id])?;
    tx.execute("DELETE FROM latest_checks WHERE host_id = ?1", params![id])?;
    tx.execute("DELETE FROM uptime_counters WHERE host_id = ?1", params![id])?;
    tx.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
    Ok(())
}

pub(super) fn get_host_tx(conn: &Connection, id: i64) -> Result<Host, DbError> {
    query_host(conn, "id = ?1", params![id])
}

fn query_host<P: rusqlite::Params>(conn: &Connection, clause: &str, p: P) -> Result<Host, DbError> {
    conn.query_row(
        &format!("SELECT {} FROM hosts WHERE {} LIMIT 1", HOST_COLUMNS, clause),
        p,
        host_from_row,
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

fn query_self(conn: &Connection) -> Result<SelfIdentity, DbError> {
    conn.query_row(
        &format!(
            "SELECT {}, restarts, first_start_at, last_start_at FROM hosts WHERE is_local = 1",
            HOST_COLUMNS
        ),
        [],
        |row| {
            Ok(SelfIdentity {
                host: host_from_row(row)?,
                restarts: row.get(9)?,
                first_start_at: time_col(row, 10)?,
                last_start_at: time_col(row, 11)?,
            })
        },
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

pub(super) fn host_from_row(row: &Row<'_>) -> SqlResult<Host> {
    Ok(Host {
        id: row.get(0)?,
        hostname: row.get(1)?,
        internal_address: row.get(2)?,
        public_address: row.get(3)?,
        discovered_address: row.get(4)?,
        service_port: row.get(5)?,
        first_seen_at: time_col(row, 6)?,
        last_seen_at: time_col(row, 7)?,
        is_local: row.get(8)?,
    })
}

pub(super) fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub(super) fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad timestamp {:?}", s).into(),
        )
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
