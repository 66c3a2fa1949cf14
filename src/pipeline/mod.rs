//! The polling verification pipeline: import, check, timeout marking, and
//! send, plus the manual-action entry point the UI collaborator uses.

pub mod driver;
pub mod import;
pub mod send;

pub use driver::PipelineDriver;
pub use import::{ImportError, Importer};
pub use send::{SendError, Sender};

use rusqlite::Connection;

use crate::model::{CaseLogEntry, Severity};
use crate::store::{self, StoreError};

/// Manual resolve. Sets the `resolved` flag only and appends the audit
/// entry; returns false when the case was already resolved or is unknown.
pub fn resolve_case(conn: &Connection, digest: &str, actor: &str) -> Result<bool, StoreError> {
    if !store::cases::resolve(conn, digest)? {
        return Ok(false);
    }
    let Some(record) = store::cases::get_case(conn, digest)? else {
        return Ok(false);
    };
    store::log::append(
        conn,
        &CaseLogEntry::now(
            Severity::Ok,
            digest,
            record.accession(),
            actor,
            "resolve",
            "resolved",
            record.status.value(),
        ),
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseHistory, CaseRecord, FileMeta, StatusFlags};
    use crate::store::open_memory_database;
    use crate::xml::parse_document;
    use chrono::Utc;

    #[test]
    fn resolve_sets_flag_once_and_logs() {
        let conn = open_memory_database().unwrap();
        let xml = r#"<Order><Case Accession="A1"/></Order>"#;
        let record = CaseRecord {
            digest: "d1".into(),
            file: FileMeta {
                name: "order.xml".into(),
                size: 1,
                created: Utc::now(),
            },
            doc_created: Utc::now(),
            case: parse_document(xml, &[]).unwrap(),
            history: CaseHistory::default(),
            status: StatusFlags::default(),
        };
        store::cases::upsert_case(&conn, &record, false).unwrap();

        assert!(resolve_case(&conn, "d1", "ui").unwrap());
        assert!(!resolve_case(&conn, "d1", "ui").unwrap());
        assert!(!resolve_case(&conn, "ghost", "ui").unwrap());

        let log = store::log::for_case(&conn, "d1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "resolve");
        assert_eq!(log[0].actor, "ui");
        assert_eq!(log[0].status_value, "RESOLVED");
    }
}
