//! Postal address verification through an address-standardization service.
//!
//! The service is asked for the best "range"-mode candidate; the verdict
//! comes from the maximum-severity footnote on that candidate. Footnote
//! codes are preserved verbatim for audit regardless of the verdict.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AddressIssue, AddressStatus, Footnote, FootnoteSeverity, PostalAddress};

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address service request failed: {0}")]
    Http(String),

    #[error("address service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("address not found")]
    NotFound,
}

/// One ranked candidate from the standardization service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressCandidate {
    pub address: PostalAddress,
    #[serde(default)]
    pub footnotes: Vec<Footnote>,
}

pub trait AddressService {
    fn standardize(&self, query: &PostalAddress) -> Result<Vec<AddressCandidate>, AddressError>;
}

// ── HTTP implementation ──────────────────────────────────────

pub struct HttpAddressService {
    base_url: String,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct StandardizeRequest<'a> {
    address1: &'a str,
    address2: &'a str,
    city: &'a str,
    state: &'a str,
    zip: &'a str,
    match_mode: &'static str,
    max_candidates: u32,
}

#[derive(Deserialize)]
struct StandardizeResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Deserialize)]
struct WireCandidate {
    #[serde(default)]
    address1: String,
    #[serde(default)]
    address2: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    zip: String,
    #[serde(default)]
    plus4: String,
    #[serde(default)]
    footnotes: Vec<WireFootnote>,
}

#[derive(Deserialize)]
struct WireFootnote {
    #[serde(default)]
    code: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    note: String,
}

impl HttpAddressService {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

impl AddressService for HttpAddressService {
    fn standardize(&self, query: &PostalAddress) -> Result<Vec<AddressCandidate>, AddressError> {
        let url = format!("{}/standardize", self.base_url);
        let body = StandardizeRequest {
            address1: &query.line1,
            address2: &query.line2,
            city: &query.city,
            state: &query.state,
            zip: &query.zip,
            match_mode: "range",
            max_candidates: 1,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| AddressError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AddressError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: StandardizeResponse = response
            .json()
            .map_err(|e| AddressError::Http(format!("invalid address service JSON: {e}")))?;

        Ok(parsed
            .candidates
            .into_iter()
            .map(|c| AddressCandidate {
                address: PostalAddress {
                    line1: c.address1,
                    line2: c.address2,
                    city: c.city,
                    state: c.state,
                    zip: c.zip,
                    plus4: c.plus4,
                },
                footnotes: c
                    .footnotes
                    .into_iter()
                    .map(|f| Footnote {
                        code: f.code,
                        severity: parse_severity(&f.severity),
                        label: f.label,
                        note: f.note,
                    })
                    .collect(),
            })
            .collect())
    }
}

fn parse_severity(s: &str) -> FootnoteSeverity {
    match s.to_ascii_uppercase().as_str() {
        "ERROR" => FootnoteSeverity::Error,
        "WARNING" => FootnoteSeverity::Warning,
        _ => FootnoteSeverity::Info,
    }
}

// ── Mock ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockAddressService {
    candidates: Vec<AddressCandidate>,
    error: Option<String>,
}

impl MockAddressService {
    pub fn with_candidate(mut self, candidate: AddressCandidate) -> Self {
        self.candidates.push(candidate);
        self
    }

    pub fn failing(message: &str) -> Self {
        Self {
            candidates: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

impl AddressService for MockAddressService {
    fn standardize(&self, _query: &PostalAddress) -> Result<Vec<AddressCandidate>, AddressError> {
        if let Some(message) = &self.error {
            return Err(AddressError::Http(message.clone()));
        }
        Ok(self.candidates.clone())
    }
}

// ── Verifier ─────────────────────────────────────────────────

pub struct AddressVerifier<S: AddressService> {
    service: S,
}

impl<S: AddressService> AddressVerifier<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn verify(&self, candidate: &PostalAddress) -> AddressIssue {
        let candidates = match self.service.standardize(candidate) {
            Ok(c) => c,
            Err(e) => return error_issue(candidate, &e),
        };
        let Some(best) = candidates.into_iter().next() else {
            return error_issue(candidate, &AddressError::NotFound);
        };

        let worst = best.footnotes.iter().max_by_key(|f| f.severity);
        let status = match worst {
            Some(f) if f.severity == FootnoteSeverity::Error => AddressStatus::Error {
                code: f.label.clone(),
                message: f.note.clone(),
            },
            Some(f) if f.severity == FootnoteSeverity::Warning => AddressStatus::Corrected,
            _ => AddressStatus::Confirmed,
        };

        AddressIssue {
            status,
            address: best.address,
            footnotes: best.footnotes,
            checked_at: Utc::now(),
        }
    }
}

fn error_issue(submitted: &PostalAddress, error: &AddressError) -> AddressIssue {
    let code = match error {
        AddressError::NotFound => "not-found",
        AddressError::Http(_) => "http",
        AddressError::Service { .. } => "service",
    };
    AddressIssue {
        status: AddressStatus::Error {
            code: code.to_string(),
            message: error.to_string(),
        },
        address: submitted.clone(),
        footnotes: Vec::new(),
        checked_at: Utc::now(),
    }
}
