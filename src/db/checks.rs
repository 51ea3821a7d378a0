//! Check history, latest check slots and uptime counters.

use chrono::Utc;
use rusqlite::{params, Result as SqlResult, Row, Transaction};

use super::models::*;
use super::store::{fmt_time, get_host_tx, time_col, DbError, Store};

const CHECK_COLUMNS: &str =
    "id, host_id, network, check_type, status, status_code, latency_ns, response_body, error, checked_at";

impl Store {
    /// Write one probe outcome.
    ///
    /// Appends to the (host, network, type) history, trims that bucket to the
    /// history limit, replaces the latest check slot and increments the uptime
    /// counters, all in one transaction. Trimming never touches the counters.
    pub fn record_check(&self, host_id: i64, check: &NewCheck) -> Result<Check, DbError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = write_check(&tx, host_id, check, self.history_limit, |_| Ok(()))?;
        tx.commit()?;
        Ok(stored)
    }

    /// Get the retained history of one bucket, newest first.
    pub fn get_checks(
        &self,
        host_id: i64,
        network: Network,
        check_type: CheckType,
        limit: usize,
    ) -> Result<Vec<Check>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM checks WHERE host_id = ?1 AND network = ?2 AND check_type = ?3
             ORDER BY checked_at DESC, id DESC LIMIT ?4",
            CHECK_COLUMNS
        ))?;

        let checks = stmt
            .query_map(
                params![host_id, network.as_str(), check_type.as_str(), limit as i64],
                check_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(checks)
    }

    /// Get the latest check of every bucket a host has.
    pub fn latest_checks(&self, host_id: i64) -> Result<Vec<Check>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT check_id, host_id, network, check_type, status, status_code, latency_ns,
                response_body, error, checked_at
             FROM latest_checks WHERE host_id = ?1 ORDER BY network, check_type",
        )?;

        let checks = stmt
            .query_map(params![host_id], check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(checks)
    }

    /// Per-type, per-network and host-level uptime, summed from the leaf counters.
    pub fn uptime_summary(&self, host_id: i64) -> Result<UptimeSummary, DbError> {
        let conn = self.conn.lock();
        get_host_tx(&conn, host_id)?;

        let mut stmt = conn.prepare(
            "SELECT network, check_type, success_count, total_count
             FROM uptime_counters WHERE host_id = ?1",
        )?;

        let leaves = stmt
            .query_map(params![host_id], |row| {
                let network: Network = enum_col(row, 0)?;
                let check_type: CheckType = enum_col(row, 1)?;
                let success: i64 = row.get(2)?;
                let total: i64 = row.get(3)?;
                Ok((
                    network,
                    check_type,
                    UptimeCounts {
                        success_count: success.max(0) as u64,
                        total_count: total.max(0) as u64,
                    },
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(UptimeSummary::from_leaves(host_id, leaves))
    }
}

/// Apply one check write inside `tx`. `after_history` runs between the
/// history append and the latest slot and counter updates.
fn write_check<F>(
    tx: &Transaction<'_>,
    host_id: i64,
    check: &NewCheck,
    history_limit: usize,
    after_history: F,
) -> Result<Check, DbError>
where
    F: FnOnce(&Transaction<'_>) -> Result<(), DbError>,
{
    get_host_tx(tx, host_id)?;

    let checked_at = fmt_time(Utc::now());
    let latency_ns = i64::try_from(check.latency.as_nanos()).unwrap_or(i64::MAX);
    let network = check.network.as_str();
    let check_type = check.check_type.as_str();

    tx.execute(
        "INSERT INTO checks (host_id, network, check_type, status, status_code, latency_ns,
            response_body, error, checked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            host_id,
            network,
            check_type,
            check.status.as_str(),
            check.status_code,
            latency_ns,
            check.response_body,
            check.error,
            checked_at,
        ],
    )?;
    let check_id = tx.last_insert_rowid();

    tx.execute(
        "DELETE FROM checks WHERE host_id = ?1 AND network = ?2 AND check_type = ?3
         AND id NOT IN (
            SELECT id FROM checks WHERE host_id = ?1 AND network = ?2 AND check_type = ?3
            ORDER BY checked_at DESC, id DESC LIMIT ?4
         )",
        params![host_id, network, check_type, history_limit as i64],
    )?;

    after_history(tx)?;

    tx.execute(
        "INSERT INTO latest_checks (host_id, network, check_type, check_id, status, status_code,
            latency_ns, response_body, error, checked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(host_id, network, check_type) DO UPDATE SET
            check_id = excluded.check_id, status = excluded.status,
            status_code = excluded.status_code, latency_ns = excluded.latency_ns,
            response_body = excluded.response_body, error = excluded.error,
            checked_at = excluded.checked_at",
        params![
            host_id,
            network,
            check_type,
            check_id,
            check.status.as_str(),
            check.status_code,
            latency_ns,
            check.response_body,
            check.error,
            checked_at,
        ],
    )?;

    let success = i64::from(check.status == CheckStatus::Success);
    tx.execute(
        "INSERT INTO uptime_counters (host_id, network, check_type, success_count, total_count)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT(host_id, network, check_type) DO UPDATE SET
            success_count = success_count + excluded.success_count,
            total_count = total_count + 1",
        params![host_id, network, check_type, success],
    )?;

    let stored = tx.query_row(
        &format!("SELECT {} FROM checks WHERE id = ?1", CHECK_COLUMNS),
        params![check_id],
        check_from_row,
    )?;

    Ok(stored)
}

fn check_from_row(row: &Row<'_>) -> SqlResult<Check> {
    Ok(Check {
        id: row.get(0)?,
        host_id: row.get(1)?,
        network: enum_col(row, 2)?,
        check_type: enum_col(row, 3)?,
        status: enum_col(row, 4)?,
        status_code: row.get(5)?,
        latency_ns: row.get(6)?,
        response_body: row.get(7)?,
        error: row.get(8)?,
        checked_at: time_col(row, 9)?,
    })
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: std::str::FromStr<Err = UnknownVariant>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e: UnknownVariant| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
