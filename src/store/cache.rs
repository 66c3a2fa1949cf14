//! Durable caches of externally-verified answers, plus the payer lookup
//! table and the importer's (name, created) pre-check. Cache rows are
//! last-write-wins upserts keyed by NPI or query digest.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::StoreError;

// ── NPI registry answers ─────────────────────────────────────

pub fn put_npi_record(conn: &Connection, npi: &str, record: &Value) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO npi_registry (npi, record_json, fetched_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(npi) DO UPDATE SET
             record_json = excluded.record_json,
             fetched_at = excluded.fetched_at",
        params![npi, record.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Durable registry answer together with when it was fetched, so callers
/// can apply their own freshness bound.
#[derive(Debug, Clone)]
pub struct CachedNpiRecord {
    pub record: Value,
    pub fetched_at: DateTime<Utc>,
}

pub fn get_npi_record(conn: &Connection, npi: &str) -> Result<Option<CachedNpiRecord>, StoreError> {
    let raw: Option<(String, String)> = conn
        .query_row(
            "SELECT record_json, fetched_at FROM npi_registry WHERE npi = ?1",
            params![npi],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((json, fetched_at)) = raw else {
        return Ok(None);
    };
    let record = serde_json::from_str(&json).map_err(|e| StoreError::InvalidJson {
        column: "record_json".into(),
        key: npi.into(),
        source: e,
    })?;
    let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            column: "fetched_at".into(),
            key: npi.into(),
            value: fetched_at.clone(),
        })?;
    Ok(Some(CachedNpiRecord { record, fetched_at }))
}

// ── Eligibility responses by query digest ────────────────────

pub fn put_eligibility_response(
    conn: &Connection,
    query_digest: &str,
    response: &Value,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO eligibility_cache (query_digest, response_json, fetched_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(query_digest) DO UPDATE SET
             response_json = excluded.response_json,
             fetched_at = excluded.fetched_at",
        params![query_digest, response.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn get_eligibility_response(
    conn: &Connection,
    query_digest: &str,
) -> Result<Option<Value>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT response_json FROM eligibility_cache WHERE query_digest = ?1",
            params![query_digest],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|json| {
        serde_json::from_str(&json).map_err(|e| StoreError::InvalidJson {
            column: "response_json".into(),
            key: query_digest.into(),
            source: e,
        })
    })
    .transpose()
}

// ── Payer lookup ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayerEntry {
    pub payer_id: String,
    pub checkable: bool,
}

/// Resolve an insurer display name. User-layer overrides win over
/// system-layer rows with the same name.
pub fn resolve_payer(conn: &Connection, name: &str) -> Result<Option<PayerEntry>, StoreError> {
    conn.query_row(
        "SELECT payer_id, checkable FROM payers
         WHERE name = ?1
         ORDER BY CASE layer WHEN 'user' THEN 0 ELSE 1 END
         LIMIT 1",
        params![name],
        |row| {
            Ok(PayerEntry {
                payer_id: row.get(0)?,
                checkable: row.get::<_, i64>(1)? != 0,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn put_payer(
    conn: &Connection,
    name: &str,
    layer: &str,
    payer_id: &str,
    checkable: bool,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO payers (name, layer, payer_id, checkable)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name, layer) DO UPDATE SET
             payer_id = excluded.payer_id,
             checkable = excluded.checkable",
        params![name, layer, payer_id, checkable as i64],
    )?;
    Ok(())
}

// ── Importer (name, created) pre-check ───────────────────────

pub fn is_file_seen(
    conn: &Connection,
    name: &str,
    created: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM seen_files WHERE file_name = ?1 AND file_created = ?2",
            params![name, created.to_rfc3339()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn mark_file_seen(
    conn: &Connection,
    name: &str,
    created: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO seen_files (file_name, file_created) VALUES (?1, ?2)",
        params![name, created.to_rfc3339()],
    )?;
    Ok(())
}
