use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::issue::Severity;

/// Append-only audit record: one entry per pipeline action on a case.
/// Entries are never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseLogEntry {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub digest: String,
    pub accession: String,
    /// Acting component or user ("pipeline", "ui", ...).
    pub actor: String,
    /// Action name ("case.import", "case.check", "markTimeout", "case.send", "resolve").
    pub action: String,
    pub message: String,
    /// Status display value after the action.
    pub status_value: String,
}

impl CaseLogEntry {
    pub fn now(
        severity: Severity,
        digest: &str,
        accession: &str,
        actor: &str,
        action: &str,
        message: &str,
        status_value: &str,
    ) -> Self {
        Self {
            at: Utc::now(),
            severity,
            digest: digest.to_string(),
            accession: accession.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            message: message.to_string(),
            status_value: status_value.to_string(),
        }
    }
}
