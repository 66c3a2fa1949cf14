//! Output assembly for resolved or timed-out cases: re-parse the archived
//! original, overwrite each subscriber slot from the best eligibility result
//! for its responsibility class, and write the downstream document once.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{CaseRecord, EligibilityIssue, Responsibility};
use crate::xml::{parse_document, write_document, XmlError};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("archived original not found: {0}")]
    MissingArchive(PathBuf),

    #[error("output already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Eligibility-result field → subscriber attribute. Attributes are written
/// even when the value is empty so downstream parsers see a stable shape;
/// `Responsibility` is only written on synthesized slots.
const SUBSCRIBER_ATTRS: &[(&str, fn(&EligibilityIssue) -> String)] = &[
    ("FirstName", |i| i.subscriber.first_name.clone()),
    ("LastName", |i| i.subscriber.last_name.clone()),
    ("MiddleInitial", |i| i.subscriber.middle_initial.clone()),
    ("PolicyNum", |i| i.subscriber.policy_number.clone()),
    ("GroupNum", |i| i.subscriber.group_number.clone()),
    ("Insurance", |i| i.subscriber.insurance.clone()),
    ("PayerID", |i| i.payer_id.clone().unwrap_or_default()),
    ("PayerName", |i| i.payer_name.clone()),
    ("Relationship", |i| i.subscriber.relationship.clone()),
    ("DOB", |i| i.subscriber.dob.clone()),
    ("Sex", |i| i.subscriber.sex.clone()),
    ("Address1", |i| i.subscriber.address.line1.clone()),
    ("Address2", |i| i.subscriber.address.line2.clone()),
    ("City", |i| i.subscriber.address.city.clone()),
    ("State", |i| i.subscriber.address.state.clone()),
    ("Zip", |i| i.subscriber.address.zip.clone()),
];

pub struct OutputAssembler {
    archive_dir: PathBuf,
    output_dir: PathBuf,
    foldable: Vec<String>,
}

impl OutputAssembler {
    pub fn new(archive_dir: &Path, output_dir: &Path, foldable: &[String]) -> Self {
        Self {
            archive_dir: archive_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            foldable: foldable.to_vec(),
        }
    }

    /// Build and write the downstream document for one case. Returns the
    /// written path. Write-once: an existing output file is an error.
    pub fn assemble(&self, record: &CaseRecord) -> Result<PathBuf, OutputError> {
        let archive_path = self.archive_dir.join(format!("{}.xml", record.digest));
        if !archive_path.exists() {
            return Err(OutputError::MissingArchive(archive_path));
        }
        let raw = fs::read_to_string(&archive_path).map_err(|e| OutputError::Io {
            path: archive_path.clone(),
            source: e,
        })?;
        let mut doc = parse_document(&raw, &self.foldable)?;

        if let Some(case) = case_element_mut(&mut doc) {
            rewrite_subscribers(case, record);
        }

        let name = match record.accession() {
            "" => record.digest.as_str(),
            accession => accession,
        };
        let output_path = self.output_dir.join(format!("{name}.xml"));
        if output_path.exists() {
            return Err(OutputError::AlreadyExists(output_path));
        }
        let xml = write_document(&doc)?;
        fs::write(&output_path, xml).map_err(|e| OutputError::Io {
            path: output_path.clone(),
            source: e,
        })?;
        Ok(output_path)
    }
}

fn case_element_mut(doc: &mut Value) -> Option<&mut Value> {
    let order = unwrap_single_mut(doc.get_mut("Order")?)?;
    unwrap_single_mut(order.get_mut("Case")?)
}

fn unwrap_single_mut(value: &mut Value) -> Option<&mut Value> {
    match value {
        Value::Array(items) => items.first_mut(),
        other => Some(other),
    }
}

/// Overwrite existing subscriber slots in place; when the original has none,
/// synthesize one slot per responsibility class with a usable result.
fn rewrite_subscribers(case: &mut Value, record: &CaseRecord) {
    match case.get_mut("Subscriber") {
        Some(entry) => {
            let slots: Vec<&mut Value> = match entry {
                Value::Array(items) => items.iter_mut().collect(),
                other => vec![other],
            };
            for slot in slots {
                let Some(map) = slot.as_object_mut() else {
                    continue;
                };
                let responsibility = Responsibility::parse(
                    map.get("Responsibility").and_then(Value::as_str).unwrap_or(""),
                );
                if let Some(best) = record.history.best_eligibility(responsibility, &record.status)
                {
                    apply_mapping(map, best);
                }
            }
        }
        None => {
            let mut slots = Vec::new();
            for responsibility in Responsibility::ALL {
                let Some(best) = record.history.best_eligibility(responsibility, &record.status)
                else {
                    continue;
                };
                let mut map = Map::new();
                map.insert(
                    "Responsibility".to_string(),
                    Value::String(responsibility.as_str().to_string()),
                );
                apply_mapping(&mut map, best);
                slots.push(Value::Object(map));
            }
            if !slots.is_empty() {
                if let Some(map) = case.as_object_mut() {
                    map.insert("Subscriber".to_string(), Value::Array(slots));
                }
            }
        }
    }
}

fn apply_mapping(slot: &mut Map<String, Value>, issue: &EligibilityIssue) {
    for (attribute, field) in SUBSCRIBER_ATTRS {
        slot.insert(attribute.to_string(), Value::String(field(issue)));
    }
}
