//! Inbound directory scan: digest-deduplicated ingestion of order XML files
//! into the case store, with archive and day-bucketed backup copies.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::digest::content_digest;
use crate::model::{CaseLogEntry, CaseRecord, FileMeta, Severity};
use crate::store::{self, cache, StoreError};
use crate::xml::{parse_document, XmlError};

/// Attempt cap per file identity; beyond it the file is left alone until its
/// content or metadata changes.
const MAX_IMPORT_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported,
    /// Content digest already known: no-op beyond clearing the inbound file.
    Duplicate,
    /// (name, created) pre-check hit, or the attempt cap was reached.
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: u32,
    pub duplicates: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// File identity for the failure cap. A changed size or creation time makes
/// a new key, so an edited file gets fresh attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FailureKey {
    name: String,
    size: u64,
    created: DateTime<Utc>,
}

pub struct Importer {
    inbound_dir: PathBuf,
    archive_dir: PathBuf,
    backup_dir: PathBuf,
    foldable: Vec<String>,
    skip_by_name_and_time: bool,
    failures: HashMap<FailureKey, u32>,
}

impl Importer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            inbound_dir: config.inbound_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            backup_dir: config.backup_dir.clone(),
            foldable: config.foldable_paths.clone(),
            skip_by_name_and_time: config.skip_by_name_and_time,
            failures: HashMap::new(),
        }
    }

    /// One scan of the inbound directory, files in name order. Per-file
    /// failures are counted and logged, never fatal for the scan.
    pub fn run(&mut self, conn: &Connection) -> Result<ImportSummary, ImportError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.inbound_dir)
            .map_err(|e| ImportError::Io {
                path: self.inbound_dir.clone(),
                source: e,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|ext| ext.eq_ignore_ascii_case("xml"))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut summary = ImportSummary::default();
        for path in paths {
            let meta = match file_meta(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Cannot stat inbound file");
                    summary.failed += 1;
                    continue;
                }
            };
            let key = FailureKey {
                name: meta.name.clone(),
                size: meta.size,
                created: meta.created,
            };
            if self.failures.get(&key).copied().unwrap_or(0) >= MAX_IMPORT_ATTEMPTS {
                tracing::debug!(file = %meta.name, "Attempt cap reached, skipping");
                summary.skipped += 1;
                continue;
            }

            match self.import_file(conn, &path, &meta) {
                Ok(ImportOutcome::Imported) => {
                    self.failures.remove(&key);
                    summary.imported += 1;
                }
                Ok(ImportOutcome::Duplicate) => {
                    self.failures.remove(&key);
                    summary.duplicates += 1;
                }
                Ok(ImportOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to import file");
                    *self.failures.entry(key).or_insert(0) += 1;
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    fn import_file(
        &self,
        conn: &Connection,
        path: &Path,
        meta: &FileMeta,
    ) -> Result<ImportOutcome, ImportError> {
        if self.skip_by_name_and_time && cache::is_file_seen(conn, &meta.name, meta.created)? {
            remove(path)?;
            return Ok(ImportOutcome::Skipped);
        }

        let bytes = fs::read(path).map_err(|e| ImportError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let digest = content_digest(&bytes);
        let case = parse_document(&String::from_utf8_lossy(&bytes), &self.foldable)?;

        let record = CaseRecord {
            digest: digest.clone(),
            file: meta.clone(),
            doc_created: Utc::now(),
            case,
            history: Default::default(),
            status: Default::default(),
        };
        let outcome = store::cases::upsert_case(conn, &record, false)?;
        cache::mark_file_seen(conn, &meta.name, meta.created)?;

        if outcome == store::cases::UpsertOutcome::Inserted {
            self.archive(&bytes, &digest, &meta.name)?;
            store::log::append(
                conn,
                &CaseLogEntry::now(
                    Severity::Ok,
                    &digest,
                    record.accession(),
                    "pipeline",
                    "case.import",
                    "imported",
                    "",
                ),
            )?;
            tracing::info!(digest = %digest, file = %meta.name, "Case imported");
            remove(path)?;
            Ok(ImportOutcome::Imported)
        } else {
            tracing::info!(digest = %digest, file = %meta.name, "Duplicate content, no-op");
            remove(path)?;
            Ok(ImportOutcome::Duplicate)
        }
    }

    /// `archive/<digest>.xml` for output assembly, plus a day-bucketed backup
    /// under the original name.
    fn archive(&self, bytes: &[u8], digest: &str, name: &str) -> Result<(), ImportError> {
        let archive_path = self.archive_dir.join(format!("{digest}.xml"));
        fs::write(&archive_path, bytes).map_err(|e| ImportError::Io {
            path: archive_path,
            source: e,
        })?;

        let day_dir = self.backup_dir.join(Utc::now().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir).map_err(|e| ImportError::Io {
            path: day_dir.clone(),
            source: e,
        })?;
        let backup_path = day_dir.join(name);
        fs::write(&backup_path, bytes).map_err(|e| ImportError::Io {
            path: backup_path,
            source: e,
        })?;
        Ok(())
    }
}

fn file_meta(path: &Path) -> Result<FileMeta, ImportError> {
    let metadata = fs::metadata(path).map_err(|e| ImportError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    // Creation time is unavailable on some filesystems; modification time is
    // close enough for the timeout clock.
    let created: SystemTime = metadata
        .created()
        .or_else(|_| metadata.modified())
        .map_err(|e| ImportError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(FileMeta {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: metadata.len(),
        created: created.into(),
    })
}

fn remove(path: &Path) -> Result<(), ImportError> {
    fs::remove_file(path).map_err(|e| ImportError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
