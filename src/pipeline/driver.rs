//! Polling pipeline driver: import → check → mark-timeout → send, one cycle
//! per poll interval. Stages are isolated — a failing stage is logged and the
//! cycle moves on — and interruption is cooperative, checked between records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;

use crate::checker::CaseChecker;
use crate::config::PipelineConfig;
use crate::model::{CaseLogEntry, Severity};
use crate::output::OutputAssembler;
use crate::store;
use crate::verify::address::AddressService;
use crate::verify::eligibility::EligibilityService;
use crate::verify::npi::NpiRegistry;

use super::import::Importer;
use super::send::Sender;

pub struct PipelineDriver<R: NpiRegistry, A: AddressService, E: EligibilityService> {
    conn: Connection,
    importer: Importer,
    checker: CaseChecker<R, A, E>,
    sender: Sender,
    poll_interval: Duration,
    timeout_days: i64,
    interrupted: Arc<AtomicBool>,
}

impl<R: NpiRegistry, A: AddressService, E: EligibilityService> PipelineDriver<R, A, E> {
    pub fn new(
        config: &PipelineConfig,
        conn: Connection,
        checker: CaseChecker<R, A, E>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            importer: Importer::new(config),
            sender: Sender::new(OutputAssembler::new(
                &config.archive_dir,
                &config.output_dir,
                &config.foldable_paths,
            )),
            conn,
            checker,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            timeout_days: config.timeout_days,
            interrupted,
        }
    }

    /// Poll until interrupted.
    pub fn run(&mut self) {
        while !self.is_interrupted() {
            self.cycle();
            if self.is_interrupted() {
                break;
            }
            self.sleep_between_cycles();
        }
        tracing::info!("Pipeline driver stopped");
    }

    /// One full pass over the four stages.
    pub fn cycle(&mut self) {
        match self.importer.run(&self.conn) {
            Ok(summary) => {
                if summary.imported > 0 || summary.failed > 0 {
                    tracing::info!(
                        imported = summary.imported,
                        duplicates = summary.duplicates,
                        failed = summary.failed,
                        "Import stage finished"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Import stage failed"),
        }
        if self.is_interrupted() {
            return;
        }

        self.check_stage();
        if self.is_interrupted() {
            return;
        }

        self.timeout_stage();
        if self.is_interrupted() {
            return;
        }

        match self.sender.run(&self.conn) {
            Ok(sent) if sent > 0 => tracing::info!(sent, "Send stage finished"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Send stage failed"),
        }
    }

    fn check_stage(&self) {
        let records = match store::cases::find_unchecked(&self.conn) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Check stage failed to list records");
                return;
            }
        };
        for mut record in records {
            if self.is_interrupted() {
                return;
            }
            match self.checker.check(&self.conn, &mut record) {
                Ok(passed) => {
                    tracing::info!(digest = %record.digest, passed, "Case checked");
                }
                Err(e) => {
                    tracing::error!(digest = %record.digest, error = %e, "Check failed");
                }
            }
        }
    }

    fn timeout_stage(&self) {
        let cutoff = Utc::now() - chrono::Duration::days(self.timeout_days);
        let candidates = match store::cases::find_timeout_candidates(&self.conn, cutoff) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(error = %e, "Timeout stage failed to list records");
                return;
            }
        };
        for record in candidates {
            if self.is_interrupted() {
                return;
            }
            match store::cases::mark_timeout(&self.conn, &record.digest) {
                Ok(true) => {
                    let mut status = record.status.clone();
                    status.timeout = true;
                    let entry = CaseLogEntry::now(
                        Severity::Warn,
                        &record.digest,
                        record.accession(),
                        "pipeline",
                        "markTimeout",
                        "timed out",
                        status.value(),
                    );
                    if let Err(e) = store::log::append(&self.conn, &entry) {
                        tracing::error!(digest = %record.digest, error = %e, "Cannot log timeout");
                    }
                    tracing::warn!(digest = %record.digest, "Case timed out");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(digest = %record.digest, error = %e, "Timeout marking failed");
                }
            }
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    fn sleep_between_cycles(&self) {
        let deadline = Instant::now() + self.poll_interval;
        while Instant::now() < deadline && !self.is_interrupted() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(Duration::from_millis(250)));
        }
    }
}
