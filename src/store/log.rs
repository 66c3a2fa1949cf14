use rusqlite::{params, Connection};

use crate::model::{CaseLogEntry, Severity};

use super::StoreError;

/// Append one audit entry. Rows are never updated or deleted.
pub fn append(conn: &Connection, entry: &CaseLogEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO cases_log (at, severity, digest, accession, actor, action, message, status_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.at.to_rfc3339(),
            entry.severity.as_str(),
            entry.digest,
            entry.accession,
            entry.actor,
            entry.action,
            entry.message,
            entry.status_value,
        ],
    )?;
    Ok(())
}

/// All entries for one case, oldest first.
pub fn for_case(conn: &Connection, digest: &str) -> Result<Vec<CaseLogEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT at, severity, digest, accession, actor, action, message, status_value
         FROM cases_log WHERE digest = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![digest], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (at, severity, digest, accession, actor, action, message, status_value) = row?;
        out.push(CaseLogEntry {
            at: chrono::DateTime::parse_from_rfc3339(&at)
                .map_err(|_| StoreError::InvalidTimestamp {
                    column: "at".into(),
                    key: digest.clone(),
                    value: at.clone(),
                })?
                .with_timezone(&chrono::Utc),
            severity: severity_from_str(&severity)?,
            digest,
            accession,
            actor,
            action,
            message,
            status_value,
        });
    }
    Ok(out)
}

fn severity_from_str(s: &str) -> Result<Severity, StoreError> {
    match s {
        "OK" => Ok(Severity::Ok),
        "INFO" => Ok(Severity::Info),
        "WARN" => Ok(Severity::Warn),
        "QUESTION" => Ok(Severity::Question),
        "ERROR" => Ok(Severity::Error),
        _ => Err(StoreError::InvalidEnum {
            field: "severity".into(),
            value: s.into(),
        }),
    }
}
