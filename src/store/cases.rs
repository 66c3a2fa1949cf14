//! Case repository. All coordination in the pipeline goes through atomic
//! upsert/update-by-digest here; there is no other writer path.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::model::{CaseHistory, CaseRecord, FileMeta, StatusFlags};

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this digest was seen; full document stored.
    Inserted,
    /// Digest already present and `override_existing` was false: no-op.
    Unchanged,
    /// Digest already present; document replaced, `doc_created` refreshed.
    Replaced,
}

const CASE_COLUMNS: &str = "digest, file_name, file_size, file_created, doc_created, \
     case_json, history_json, checked, passed, resolved, timeout, sent";

/// Upsert by content digest. Insert-or-ignore first so two writers racing on
/// the same digest serialize on the primary key.
pub fn upsert_case(
    conn: &Connection,
    record: &CaseRecord,
    override_existing: bool,
) -> Result<UpsertOutcome, StoreError> {
    let case_json = record.case.to_string();
    let history_json = serde_json::to_string(&record.history).map_err(|e| json_err("history_json", &record.digest, e))?;

    let inserted = conn.execute(
        "INSERT INTO cases (digest, file_name, file_size, file_created, doc_created,
                            case_json, history_json, checked, passed, resolved, timeout, sent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, 0, 0, 0)
         ON CONFLICT(digest) DO NOTHING",
        params![
            record.digest,
            record.file.name,
            record.file.size,
            record.file.created.to_rfc3339(),
            record.doc_created.to_rfc3339(),
            case_json,
            history_json,
        ],
    )?;
    if inserted > 0 {
        return Ok(UpsertOutcome::Inserted);
    }
    if !override_existing {
        return Ok(UpsertOutcome::Unchanged);
    }
    conn.execute(
        "UPDATE cases
         SET file_name = ?2, file_size = ?3, file_created = ?4, doc_created = ?5, case_json = ?6
         WHERE digest = ?1",
        params![
            record.digest,
            record.file.name,
            record.file.size,
            record.file.created.to_rfc3339(),
            Utc::now().to_rfc3339(),
            case_json,
        ],
    )?;
    Ok(UpsertOutcome::Replaced)
}

pub fn get_case(conn: &Connection, digest: &str) -> Result<Option<CaseRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {CASE_COLUMNS} FROM cases WHERE digest = ?1"))?;
    let result = stmt.query_row(params![digest], row_to_raw);
    match result {
        Ok(raw) => Ok(Some(case_from_raw(raw)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Records the checker has never run on.
pub fn find_unchecked(conn: &Connection) -> Result<Vec<CaseRecord>, StoreError> {
    select_cases(
        conn,
        &format!("SELECT {CASE_COLUMNS} FROM cases WHERE checked IS NULL ORDER BY doc_created"),
        params![],
    )
}

/// Not-yet-timed-out records whose source file is older than the cutoff.
/// Sent records are closed and never mutated again.
pub fn find_timeout_candidates(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<CaseRecord>, StoreError> {
    select_cases(
        conn,
        &format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE timeout = 0 AND sent = 0 AND file_created < ?1 ORDER BY file_created"
        ),
        params![cutoff.to_rfc3339()],
    )
}

/// Unsent records whose display status is RESOLVED or TIMEOUT.
pub fn find_sendable(conn: &Connection) -> Result<Vec<CaseRecord>, StoreError> {
    select_cases(
        conn,
        &format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE sent = 0 AND (timeout = 1 OR resolved = 1) ORDER BY doc_created"
        ),
        params![],
    )
}

/// Persist one check run: flags forward, history snapshot replaced.
pub fn set_checked(
    conn: &Connection,
    digest: &str,
    passed: bool,
    history: &CaseHistory,
) -> Result<(), StoreError> {
    let history_json =
        serde_json::to_string(history).map_err(|e| json_err("history_json", digest, e))?;
    conn.execute(
        "UPDATE cases SET checked = 1, passed = ?2, history_json = ?3 WHERE digest = ?1",
        params![digest, passed as i64, history_json],
    )?;
    Ok(())
}

/// Returns true when this call performed the transition (idempotent).
pub fn mark_timeout(conn: &Connection, digest: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE cases SET timeout = 1 WHERE digest = ?1 AND timeout = 0",
        params![digest],
    )?;
    Ok(changed > 0)
}

/// `sent` is set at most once.
pub fn mark_sent(conn: &Connection, digest: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE cases SET sent = 1 WHERE digest = ?1 AND sent = 0",
        params![digest],
    )?;
    Ok(changed > 0)
}

/// Manual resolve: sets `resolved` only, leaving checked/passed untouched.
pub fn resolve(conn: &Connection, digest: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE cases SET resolved = 1 WHERE digest = ?1 AND resolved = 0",
        params![digest],
    )?;
    Ok(changed > 0)
}

// ── Row mapping ──────────────────────────────────────────────

struct RawCase {
    digest: String,
    file_name: String,
    file_size: i64,
    file_created: String,
    doc_created: String,
    case_json: String,
    history_json: String,
    checked: Option<i64>,
    passed: Option<i64>,
    resolved: i64,
    timeout: i64,
    sent: i64,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCase> {
    Ok(RawCase {
        digest: row.get(0)?,
        file_name: row.get(1)?,
        file_size: row.get(2)?,
        file_created: row.get(3)?,
        doc_created: row.get(4)?,
        case_json: row.get(5)?,
        history_json: row.get(6)?,
        checked: row.get(7)?,
        passed: row.get(8)?,
        resolved: row.get(9)?,
        timeout: row.get(10)?,
        sent: row.get(11)?,
    })
}

fn select_cases(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<CaseRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_raw)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(case_from_raw(row?)?);
    }
    Ok(out)
}

fn case_from_raw(raw: RawCase) -> Result<CaseRecord, StoreError> {
    let case: Value = serde_json::from_str(&raw.case_json)
        .map_err(|e| json_err("case_json", &raw.digest, e))?;
    let history: CaseHistory = serde_json::from_str(&raw.history_json)
        .map_err(|e| json_err("history_json", &raw.digest, e))?;
    Ok(CaseRecord {
        file: FileMeta {
            name: raw.file_name,
            size: raw.file_size as u64,
            created: parse_ts("file_created", &raw.digest, &raw.file_created)?,
        },
        doc_created: parse_ts("doc_created", &raw.digest, &raw.doc_created)?,
        case,
        history,
        status: StatusFlags {
            checked: raw.checked.map(|v| v != 0),
            passed: raw.passed.map(|v| v != 0),
            resolved: raw.resolved != 0,
            timeout: raw.timeout != 0,
            sent: raw.sent != 0,
        },
        digest: raw.digest,
    })
}

fn parse_ts(column: &str, key: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            column: column.into(),
            key: key.into(),
            value: value.into(),
        })
}

fn json_err(column: &str, key: &str, source: serde_json::Error) -> StoreError {
    StoreError::InvalidJson {
        column: column.into(),
        key: key.into(),
        source,
    }
}
