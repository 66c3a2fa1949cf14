//! Send stage: assemble and deliver output for resolved or timed-out cases.
//! Per-record failures become an error log entry and the batch continues.

use rusqlite::Connection;
use thiserror::Error;

use crate::model::{CaseLogEntry, CaseRecord, Severity};
use crate::output::{OutputAssembler, OutputError};
use crate::store::{self, StoreError};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("output error: {0}")]
    Output(#[from] OutputError),
}

pub struct Sender {
    assembler: OutputAssembler,
}

impl Sender {
    pub fn new(assembler: OutputAssembler) -> Self {
        Self { assembler }
    }

    /// Send every sendable record. Returns how many were sent.
    pub fn run(&self, conn: &Connection) -> Result<u32, SendError> {
        let mut sent = 0;
        for record in store::cases::find_sendable(conn)? {
            match self.send_one(conn, &record) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::error!(digest = %record.digest, error = %e, "Failed to send case");
                    let entry = CaseLogEntry::now(
                        Severity::Error,
                        &record.digest,
                        record.accession(),
                        "pipeline",
                        "case.send",
                        &e.to_string(),
                        record.status.value(),
                    );
                    if let Err(log_err) = store::log::append(conn, &entry) {
                        tracing::error!(digest = %record.digest, error = %log_err, "Cannot log send failure");
                    }
                }
            }
        }
        Ok(sent)
    }

    fn send_one(&self, conn: &Connection, record: &CaseRecord) -> Result<(), SendError> {
        let path = self.assembler.assemble(record)?;
        store::cases::mark_sent(conn, &record.digest)?;

        let mut status = record.status.clone();
        status.sent = true;
        store::log::append(
            conn,
            &CaseLogEntry::now(
                Severity::Ok,
                &record.digest,
                record.accession(),
                "pipeline",
                "case.send",
                "sent",
                status.value(),
            ),
        )?;
        tracing::info!(digest = %record.digest, path = %path.display(), "Case sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseHistory, FileMeta, StatusFlags};
    use crate::store::open_memory_database;
    use crate::xml::parse_document;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    const ORDER: &str = r#"<Order><Case Accession="A1"><Patient FirstName="A" LastName="B"/></Case></Order>"#;

    fn record(digest: &str) -> CaseRecord {
        CaseRecord {
            digest: digest.into(),
            file: FileMeta {
                name: format!("{digest}.xml"),
                size: ORDER.len() as u64,
                created: Utc::now(),
            },
            doc_created: Utc::now(),
            case: parse_document(ORDER, &[]).unwrap(),
            history: CaseHistory::default(),
            status: StatusFlags::default(),
        }
    }

    #[test]
    fn sends_resolved_records_once() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        let output = dir.path().join("output");
        fs::create_dir_all(&archive).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::write(archive.join("d1.xml"), ORDER).unwrap();

        let conn = open_memory_database().unwrap();
        store::cases::upsert_case(&conn, &record("d1"), false).unwrap();
        store::cases::resolve(&conn, "d1").unwrap();

        let sender = Sender::new(OutputAssembler::new(&archive, &output, &[]));
        assert_eq!(sender.run(&conn).unwrap(), 1);
        assert!(output.join("A1.xml").exists());

        let stored = store::cases::get_case(&conn, "d1").unwrap().unwrap();
        assert!(stored.status.sent);
        assert_eq!(stored.status.value(), "SENT");

        let log = store::log::for_case(&conn, "d1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "case.send");
        assert_eq!(log[0].message, "sent");
        assert_eq!(log[0].status_value, "SENT");

        // Nothing sendable remains.
        assert_eq!(sender.run(&conn).unwrap(), 0);
    }

    #[test]
    fn missing_archive_logs_an_error_and_continues() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("archive");
        let output = dir.path().join("output");
        fs::create_dir_all(&archive).unwrap();
        fs::create_dir_all(&output).unwrap();
        // d1 has no archived original; d2 does.
        fs::write(archive.join("d2.xml"), ORDER).unwrap();

        let conn = open_memory_database().unwrap();
        for d in ["d1", "d2"] {
            store::cases::upsert_case(&conn, &record(d), false).unwrap();
            store::cases::resolve(&conn, d).unwrap();
        }

        let sender = Sender::new(OutputAssembler::new(&archive, &output, &[]));
        assert_eq!(sender.run(&conn).unwrap(), 1);

        let failed = store::cases::get_case(&conn, "d1").unwrap().unwrap();
        assert!(!failed.status.sent);
        let log = store::log::for_case(&conn, "d1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].severity, Severity::Error);

        let ok = store::cases::get_case(&conn, "d2").unwrap().unwrap();
        assert!(ok.status.sent);
    }
}
