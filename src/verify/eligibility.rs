//! Insurance eligibility verification.
//!
//! A subscriber+insurance pair is resolved to a canonical payer id, checked
//! for completeness, then looked up in the durable response cache by query
//! digest before any network call. Responses backfill blank subscriber
//! demographics so later stages see the payer's view of the member.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{Datelike, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::content_digest;
use crate::model::{EligibilityIssue, EligibilityStatus, Patient, PostalAddress, Subscriber};
use crate::store::{cache, StoreError};

#[derive(Debug, Error)]
pub enum EligibilityError {
    #[error("eligibility request failed: {0}")]
    Http(String),

    #[error("eligibility token exchange failed: {0}")]
    Auth(String),

    #[error("eligibility service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Service answer for one eligibility query. Also the durable cache row
/// payload, so every field must survive a JSON round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EligibilityResponse {
    #[serde(default)]
    pub active_coverage: bool,
    /// Payer answered but cannot report coverage for this member.
    #[serde(default)]
    pub not_available: bool,
    #[serde(default)]
    pub payer_name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub middle_initial: String,
    #[serde(default)]
    pub dob: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub group_number: String,
    #[serde(default)]
    pub address: PostalAddress,
}

pub trait EligibilityService {
    fn check(
        &self,
        payer_id: &str,
        subscriber: &Subscriber,
    ) -> Result<EligibilityResponse, EligibilityError>;
}

// ── HTTP implementation ──────────────────────────────────────

pub struct HttpEligibilityService {
    base_url: String,
    client: reqwest::blocking::Client,
    client_id: String,
    client_secret: String,
    organization_npi: String,
    token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct EligibilityRequest<'a> {
    payer_id: &'a str,
    provider_npi: &'a str,
    first_name: &'a str,
    last_name: &'a str,
    policy_number: &'a str,
    group_number: &'a str,
    dob: &'a str,
    sex: &'a str,
}

impl HttpEligibilityService {
    pub fn new(
        base_url: &str,
        client_id: &str,
        client_secret: &str,
        organization_npi: &str,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            organization_npi: organization_npi.to_string(),
            token: Mutex::new(None),
        }
    }

    fn bearer_token(&self) -> Result<String, EligibilityError> {
        if let Some(token) = self.token.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(token);
        }
        let response = self
            .client
            .post(format!("{}/oauth2/token", self.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .map_err(|e| EligibilityError::Auth(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EligibilityError::Auth(format!("{status}: {body}")));
        }
        let parsed: TokenResponse = response
            .json()
            .map_err(|e| EligibilityError::Auth(format!("invalid token JSON: {e}")))?;
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(parsed.access_token.clone());
        Ok(parsed.access_token)
    }

    fn post_once(
        &self,
        token: &str,
        payer_id: &str,
        subscriber: &Subscriber,
    ) -> Result<reqwest::blocking::Response, EligibilityError> {
        self.client
            .post(format!("{}/eligibility", self.base_url))
            .bearer_auth(token)
            .json(&EligibilityRequest {
                payer_id,
                provider_npi: &self.organization_npi,
                first_name: &subscriber.first_name,
                last_name: &subscriber.last_name,
                policy_number: &subscriber.policy_number,
                group_number: &subscriber.group_number,
                dob: &subscriber.dob,
                sex: &subscriber.sex,
            })
            .send()
            .map_err(|e| EligibilityError::Http(e.to_string()))
    }
}

impl EligibilityService for HttpEligibilityService {
    fn check(
        &self,
        payer_id: &str,
        subscriber: &Subscriber,
    ) -> Result<EligibilityResponse, EligibilityError> {
        let token = self.bearer_token()?;
        let mut response = self.post_once(&token, payer_id, subscriber)?;

        // One transparent refresh on an expired token, then exactly one retry.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
            let fresh = self.bearer_token()?;
            response = self.post_once(&fresh, payer_id, subscriber)?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EligibilityError::Service {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .map_err(|e| EligibilityError::Http(format!("invalid eligibility JSON: {e}")))
    }
}

// ── Mock ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockEligibilityService {
    response: Option<EligibilityResponse>,
    error: Option<String>,
    calls: Mutex<u32>,
}

impl MockEligibilityService {
    pub fn with_response(response: EligibilityResponse) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EligibilityService for MockEligibilityService {
    fn check(
        &self,
        _payer_id: &str,
        _subscriber: &Subscriber,
    ) -> Result<EligibilityResponse, EligibilityError> {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if let Some(message) = &self.error {
            return Err(EligibilityError::Http(message.clone()));
        }
        Ok(self.response.clone().unwrap_or_default())
    }
}

// ── Verifier ─────────────────────────────────────────────────

pub struct EligibilityVerifier<S: EligibilityService> {
    service: S,
}

impl<S: EligibilityService> EligibilityVerifier<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Verify one submitted subscriber entry. Store failures propagate;
    /// service failures classify as `Problem` on the returned issue.
    pub fn verify(
        &self,
        conn: &Connection,
        submitted: &Subscriber,
        patient: Option<&Patient>,
    ) -> Result<EligibilityIssue, StoreError> {
        let mut subscriber = submitted.clone();
        if let Some(patient) = patient {
            backfill_from_patient(&mut subscriber, patient);
        }

        let payer = cache::resolve_payer(conn, subscriber.insurance.trim())?;
        let (payer_id, payer_checkable, note) = match &payer {
            Some(entry) if entry.checkable => (Some(entry.payer_id.clone()), true, String::new()),
            Some(entry) => (
                Some(entry.payer_id.clone()),
                false,
                "payer does not support automated checking".to_string(),
            ),
            None => (None, false, "insurer not recognized".to_string()),
        };

        if !payer_checkable {
            return Ok(unchecked_issue(&subscriber, payer_id, note));
        }
        if !subscriber_checkable(&subscriber) {
            return Ok(unchecked_issue(
                &subscriber,
                payer_id,
                "subscriber identifiers incomplete".to_string(),
            ));
        }
        let payer_id = payer_id.unwrap_or_default();

        let digest = query_digest(&payer_id, &subscriber);
        let response = match self.fetch(conn, &digest, &payer_id, &subscriber) {
            Ok(response) => response,
            Err(EligibilityError::Store(e)) => return Err(e),
            Err(e) => {
                return Ok(EligibilityIssue {
                    responsibility: subscriber.responsibility,
                    status: EligibilityStatus::Problem,
                    insurance: subscriber.insurance.clone(),
                    payer_id: Some(payer_id),
                    subscriber,
                    payer_name: String::new(),
                    note: e.to_string(),
                    checked_at: Utc::now(),
                })
            }
        };

        backfill_from_response(&mut subscriber, &response);
        let (status, note) = if response.not_available {
            (EligibilityStatus::NotAvailable, String::new())
        } else if response.active_coverage {
            (EligibilityStatus::Confirmed, String::new())
        } else {
            (EligibilityStatus::Problem, "coverage isn't active".to_string())
        };

        Ok(EligibilityIssue {
            responsibility: subscriber.responsibility,
            status,
            insurance: subscriber.insurance.clone(),
            payer_id: Some(payer_id),
            subscriber,
            payer_name: response.payer_name.clone(),
            note,
            checked_at: Utc::now(),
        })
    }

    /// Durable cache hit short-circuits the external call; a fresh answer is
    /// persisted under the query digest before classification.
    fn fetch(
        &self,
        conn: &Connection,
        digest: &str,
        payer_id: &str,
        subscriber: &Subscriber,
    ) -> Result<EligibilityResponse, EligibilityError> {
        if let Some(cached) = cache::get_eligibility_response(conn, digest)? {
            if let Ok(response) = serde_json::from_value(cached) {
                return Ok(response);
            }
            // Unreadable row: fall through and refresh it.
        }
        let response = self.service.check(payer_id, subscriber)?;
        let json = serde_json::to_value(&response)
            .map_err(|e| EligibilityError::Http(format!("cannot serialize response: {e}")))?;
        cache::put_eligibility_response(conn, digest, &json)?;
        Ok(response)
    }
}

fn unchecked_issue(
    subscriber: &Subscriber,
    payer_id: Option<String>,
    note: String,
) -> EligibilityIssue {
    EligibilityIssue {
        responsibility: subscriber.responsibility,
        status: EligibilityStatus::Unchecked,
        insurance: subscriber.insurance.clone(),
        payer_id,
        subscriber: subscriber.clone(),
        payer_name: String::new(),
        note,
        checked_at: Utc::now(),
    }
}

fn subscriber_checkable(s: &Subscriber) -> bool {
    !s.first_name.trim().is_empty()
        && !s.last_name.trim().is_empty()
        && !s.policy_number.trim().is_empty()
}

/// SHA-256 over the normalized query so retries and re-imports hit the same
/// durable cache row.
pub fn query_digest(payer_id: &str, s: &Subscriber) -> String {
    let normalized = [
        payer_id,
        s.first_name.as_str(),
        s.last_name.as_str(),
        s.middle_initial.as_str(),
        s.policy_number.as_str(),
        s.group_number.as_str(),
        s.dob.as_str(),
        s.sex.as_str(),
    ]
    .map(|field| field.trim().to_lowercase())
    .join("\n");
    content_digest(normalized.as_bytes())
}

/// True for a dash-delimited date whose year falls in 1900..=current year.
fn plausible_dob(dob: &str) -> bool {
    let Some(year) = dob.trim().split('-').next().and_then(|y| y.parse::<i32>().ok()) else {
        return false;
    };
    (1900..=Utc::now().year()).contains(&year)
}

/// When the subscriber is (or may be) the patient, fill blank identity
/// fields from the patient context.
fn backfill_from_patient(subscriber: &mut Subscriber, patient: &Patient) {
    let relationship = subscriber.relationship.trim().to_ascii_lowercase();
    if !(relationship.is_empty() || relationship == "self" || relationship == "unknown") {
        return;
    }
    fill_if_blank(&mut subscriber.first_name, &patient.first_name);
    fill_if_blank(&mut subscriber.last_name, &patient.last_name);
    if subscriber.dob.trim().is_empty() && plausible_dob(&patient.dob) {
        subscriber.dob = patient.dob.clone();
    }
    if subscriber.address.is_blank() && !patient.address.is_blank() {
        subscriber.address = patient.address.clone();
    }
}

/// Adopt the payer's demographics where ours are blank or implausible.
fn backfill_from_response(subscriber: &mut Subscriber, response: &EligibilityResponse) {
    fill_if_blank(&mut subscriber.first_name, &response.first_name);
    fill_if_blank(&mut subscriber.last_name, &response.last_name);
    fill_if_blank(&mut subscriber.middle_initial, &response.middle_initial);
    fill_if_blank(&mut subscriber.sex, &response.sex);
    fill_if_blank(&mut subscriber.group_number, &response.group_number);
    if !plausible_dob(&subscriber.dob) && plausible_dob(&response.dob) {
        subscriber.dob = response.dob.clone();
    }
    if subscriber.address.is_blank() && !response.address.is_blank() {
        subscriber.address = response.address.clone();
    }
}

fn fill_if_blank(target: &mut String, value: &str) {
    if target.trim().is_empty() && !value.trim().is_empty() {
        *target = value.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Responsibility;
    use crate::store::open_memory_database;

    fn seeded_conn() -> Connection {
        let conn = open_memory_database().unwrap();
        cache::put_payer(&conn, "Acme Health", "system", "ACME1", true).unwrap();
        cache::put_payer(&conn, "Paper Mutual", "system", "PAPER1", false).unwrap();
        conn
    }

    fn subscriber() -> Subscriber {
        Subscriber {
            first_name: "Ana".into(),
            last_name: "Reyes".into(),
            policy_number: "P100".into(),
            insurance: "Acme Health".into(),
            relationship: "self".into(),
            dob: "1980-04-02".into(),
            ..Default::default()
        }
    }

    fn active_response() -> EligibilityResponse {
        EligibilityResponse {
            active_coverage: true,
            payer_name: "ACME HEALTH PLANS".into(),
            sex: "F".into(),
            group_number: "G9".into(),
            ..Default::default()
        }
    }

    #[test]
    fn active_coverage_is_confirmed_and_cached_durably() {
        let conn = seeded_conn();
        let verifier = EligibilityVerifier::new(MockEligibilityService::with_response(
            active_response(),
        ));

        let issue = verifier.verify(&conn, &subscriber(), None).unwrap();
        assert_eq!(issue.status, EligibilityStatus::Confirmed);
        assert_eq!(issue.payer_id.as_deref(), Some("ACME1"));
        assert_eq!(issue.payer_name, "ACME HEALTH PLANS");
        // Blank demographics adopted from the payer.
        assert_eq!(issue.subscriber.sex, "F");
        assert_eq!(issue.subscriber.group_number, "G9");

        // The cache is keyed on the submitted query, before any backfill,
        // so a re-import of the same export hits it.
        let digest = query_digest("ACME1", &subscriber());
        assert!(cache::get_eligibility_response(&conn, &digest)
            .unwrap()
            .is_some());
    }

    #[test]
    fn cache_hit_short_circuits_the_service() {
        let conn = seeded_conn();
        let verifier = EligibilityVerifier::new(MockEligibilityService::with_response(
            active_response(),
        ));
        verifier.verify(&conn, &subscriber(), None).unwrap();
        verifier.verify(&conn, &subscriber(), None).unwrap();
        assert_eq!(verifier.service.calls(), 1);
    }

    #[test]
    fn inactive_coverage_is_problem_with_note() {
        let conn = seeded_conn();
        let verifier = EligibilityVerifier::new(MockEligibilityService::with_response(
            EligibilityResponse::default(),
        ));
        let issue = verifier.verify(&conn, &subscriber(), None).unwrap();
        assert_eq!(issue.status, EligibilityStatus::Problem);
        assert_eq!(issue.note, "coverage isn't active");
    }

    #[test]
    fn not_available_sentinel_passes() {
        let conn = seeded_conn();
        let verifier = EligibilityVerifier::new(MockEligibilityService::with_response(
            EligibilityResponse {
                not_available: true,
                ..Default::default()
            },
        ));
        let issue = verifier.verify(&conn, &subscriber(), None).unwrap();
        assert_eq!(issue.status, EligibilityStatus::NotAvailable);
        assert!(issue.status.passed());
    }

    #[test]
    fn service_failure_is_problem() {
        let conn = seeded_conn();
        let verifier =
            EligibilityVerifier::new(MockEligibilityService::failing("connection refused"));
        let issue = verifier.verify(&conn, &subscriber(), None).unwrap();
        assert_eq!(issue.status, EligibilityStatus::Problem);
        assert!(issue.note.contains("connection refused"));
    }

    #[test]
    fn unknown_insurer_is_unchecked_without_a_call() {
        let conn = seeded_conn();
        let service = MockEligibilityService::with_response(active_response());
        let verifier = EligibilityVerifier::new(service);
        let mut s = subscriber();
        s.insurance = "Nobody Knows Mutual".into();
        let issue = verifier.verify(&conn, &s, None).unwrap();
        assert_eq!(issue.status, EligibilityStatus::Unchecked);
        assert_eq!(issue.payer_id, None);
        assert_eq!(verifier.service.calls(), 0);
    }

    #[test]
    fn non_checkable_payer_is_unchecked() {
        let conn = seeded_conn();
        let verifier =
            EligibilityVerifier::new(MockEligibilityService::with_response(active_response()));
        let mut s = subscriber();
        s.insurance = "Paper Mutual".into();
        let issue = verifier.verify(&conn, &s, None).unwrap();
        assert_eq!(issue.status, EligibilityStatus::Unchecked);
        assert_eq!(issue.payer_id.as_deref(), Some("PAPER1"));
        assert_eq!(verifier.service.calls(), 0);
    }

    #[test]
    fn incomplete_subscriber_is_unchecked() {
        let conn = seeded_conn();
        let verifier =
            EligibilityVerifier::new(MockEligibilityService::with_response(active_response()));
        let mut s = subscriber();
        s.policy_number = String::new();
        // No patient context: nothing fills the gap.
        let issue = verifier.verify(&conn, &s, None).unwrap();
        assert_eq!(issue.status, EligibilityStatus::Unchecked);
        assert_eq!(issue.note, "subscriber identifiers incomplete");
    }

    #[test]
    fn self_relationship_backfills_from_patient() {
        let patient = Patient {
            first_name: "Ana".into(),
            last_name: "Reyes".into(),
            dob: "1980-04-02".into(),
            address: PostalAddress {
                line1: "1 Main St".into(),
                city: "Boston".into(),
                state: "MA".into(),
                zip: "02101".into(),
                ..Default::default()
            },
        };
        let mut s = Subscriber {
            policy_number: "P100".into(),
            insurance: "Acme Health".into(),
            relationship: "self".into(),
            ..Default::default()
        };
        backfill_from_patient(&mut s, &patient);
        assert_eq!(s.first_name, "Ana");
        assert_eq!(s.dob, "1980-04-02");
        assert_eq!(s.address.zip, "02101");

        // A spouse keeps their own (blank) identity.
        s = Subscriber {
            relationship: "spouse".into(),
            ..Default::default()
        };
        backfill_from_patient(&mut s, &patient);
        assert!(s.first_name.is_empty());
    }

    #[test]
    fn implausible_dob_is_replaced_by_response() {
        let mut s = subscriber();
        s.dob = "1812-01-01".into();
        let response = EligibilityResponse {
            dob: "1980-04-02".into(),
            ..Default::default()
        };
        backfill_from_response(&mut s, &response);
        assert_eq!(s.dob, "1980-04-02");

        assert!(!plausible_dob("1812-01-01"));
        assert!(!plausible_dob(""));
        assert!(!plausible_dob("not-a-date"));
        assert!(plausible_dob("1980-04-02"));
    }

    #[test]
    fn query_digest_ignores_case_and_whitespace() {
        let a = subscriber();
        let mut b = subscriber();
        b.first_name = "  ANA ".into();
        b.last_name = "reyes".into();
        assert_eq!(query_digest("ACME1", &a), query_digest("ACME1", &b));
        assert_ne!(query_digest("ACME1", &a), query_digest("OTHER", &a));
    }

    #[test]
    fn responsibility_carries_through() {
        let conn = seeded_conn();
        let verifier =
            EligibilityVerifier::new(MockEligibilityService::with_response(active_response()));
        let mut s = subscriber();
        s.responsibility = Responsibility::Secondary;
        let issue = verifier.verify(&conn, &s, None).unwrap();
        assert_eq!(issue.responsibility, Responsibility::Secondary);
    }
}
