//! Referring-provider identity verification against the NPI registry.

use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{NpiIssue, NpiStatus, Provider, Taxonomy};
use crate::store::{cache, StoreError};

use super::ttl::TtlCache;

#[derive(Debug, Error)]
pub enum NpiError {
    #[error("NPI registry request failed: {0}")]
    Http(String),

    #[error("NPI registry error: {message}")]
    Registry {
        message: String,
        errors: Vec<RegistryApiError>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl NpiError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Registry { .. } => "registry",
            Self::Store(_) => "store",
        }
    }
}

/// Structured error item from the registry's `Errors[]` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub field: String,
}

/// Registry answer for one NPI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NpiRegistryRecord {
    pub npi: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub middle_name: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub taxonomies: Vec<Taxonomy>,
}

pub trait NpiRegistry {
    fn lookup(&self, npi: &str) -> Result<NpiRegistryRecord, NpiError>;
}

// ── HTTP implementation ──────────────────────────────────────

pub struct HttpNpiRegistry {
    base_url: String,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct RegistryResponse {
    #[serde(default)]
    results: Vec<RegistryResult>,
    #[serde(default, rename = "Errors")]
    errors: Vec<RegistryApiError>,
}

#[derive(Deserialize)]
struct RegistryResult {
    #[serde(default)]
    number: String,
    basic: Option<RegistryBasic>,
    #[serde(default)]
    taxonomies: Vec<RegistryTaxonomy>,
}

#[derive(Deserialize, Default)]
struct RegistryBasic {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    middle_name: String,
    #[serde(default)]
    organization_name: String,
}

#[derive(Deserialize)]
struct RegistryTaxonomy {
    #[serde(default)]
    code: String,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    state: String,
    #[serde(default)]
    license: String,
}

impl HttpNpiRegistry {
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

impl NpiRegistry for HttpNpiRegistry {
    fn lookup(&self, npi: &str) -> Result<NpiRegistryRecord, NpiError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("version", "2.1"), ("number", npi)])
            .send()
            .map_err(|e| NpiError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(NpiError::Registry {
                message: format!("registry returned {status}: {body}"),
                errors: Vec::new(),
            });
        }

        let parsed: RegistryResponse = response
            .json()
            .map_err(|e| NpiError::Http(format!("invalid registry JSON for {npi}: {e}")))?;

        if !parsed.errors.is_empty() {
            let message = parsed
                .errors
                .iter()
                .map(|e| e.description.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(NpiError::Registry {
                message,
                errors: parsed.errors,
            });
        }
        // Exactly one record per NPI; anything else is an API problem,
        // not a checker bug.
        if parsed.results.len() != 1 {
            return Err(NpiError::Registry {
                message: format!(
                    "expected exactly one registry record for {npi}, got {}",
                    parsed.results.len()
                ),
                errors: Vec::new(),
            });
        }
        let result = parsed.results.into_iter().next().expect("len checked");
        let basic = result.basic.unwrap_or_default();
        Ok(NpiRegistryRecord {
            npi: if result.number.is_empty() {
                npi.to_string()
            } else {
                result.number
            },
            first_name: basic.first_name,
            last_name: basic.last_name,
            middle_name: basic.middle_name,
            organization_name: basic.organization_name,
            taxonomies: result
                .taxonomies
                .into_iter()
                .map(|t| Taxonomy {
                    code: t.code,
                    description: t.desc,
                    primary: t.primary,
                    state: t.state,
                    license: t.license,
                })
                .collect(),
        })
    }
}

// ── Mock ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockNpiRegistry {
    records: std::collections::HashMap<String, NpiRegistryRecord>,
    error: Option<String>,
    calls: std::sync::Mutex<u32>,
}

impl MockNpiRegistry {
    pub fn with_record(mut self, record: NpiRegistryRecord) -> Self {
        self.records.insert(record.npi.clone(), record);
        self
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

impl NpiRegistry for MockNpiRegistry {
    fn lookup(&self, npi: &str) -> Result<NpiRegistryRecord, NpiError> {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if let Some(message) = &self.error {
            return Err(NpiError::Registry {
                message: message.clone(),
                errors: Vec::new(),
            });
        }
        self.records
            .get(npi)
            .cloned()
            .ok_or_else(|| NpiError::Registry {
                message: format!("expected exactly one registry record for {npi}, got 0"),
                errors: Vec::new(),
            })
    }
}

// ── Verifier ─────────────────────────────────────────────────

pub const NPI_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Wraps a registry with the in-process TTL cache and the durable
/// last-write-wins answer store, then classifies the name comparison.
pub struct NpiVerifier<R: NpiRegistry> {
    registry: R,
    cache: TtlCache<NpiRegistryRecord>,
    ttl: Duration,
    compare_middle_initial: bool,
}

impl<R: NpiRegistry> NpiVerifier<R> {
    pub fn new(registry: R, ttl: Duration, compare_middle_initial: bool) -> Self {
        Self {
            registry,
            cache: TtlCache::new(ttl),
            ttl,
            compare_middle_initial,
        }
    }

    /// Registry record for an NPI: memory cache within the TTL, then the
    /// durable store under the same freshness bound, otherwise a fresh
    /// lookup persisted durably and re-cached.
    pub fn fetch(&self, conn: &Connection, npi: &str) -> Result<NpiRegistryRecord, NpiError> {
        if let Some(record) = self.cache.get(npi) {
            return Ok(record);
        }
        if let Some(record) = self.fetch_durable(conn, npi)? {
            self.cache.insert(npi, record.clone());
            return Ok(record);
        }
        let record = self.registry.lookup(npi)?;
        let json = serde_json::to_value(&record).map_err(|e| {
            NpiError::Http(format!("cannot serialize registry record for {npi}: {e}"))
        })?;
        cache::put_npi_record(conn, npi, &json)?;
        self.cache.insert(npi, record.clone());
        Ok(record)
    }

    /// A durable row older than the TTL, or one whose shape no longer
    /// deserializes, falls through to a network refresh.
    fn fetch_durable(
        &self,
        conn: &Connection,
        npi: &str,
    ) -> Result<Option<NpiRegistryRecord>, StoreError> {
        let Some(cached) = cache::get_npi_record(conn, npi)? else {
            return Ok(None);
        };
        let age = Utc::now().signed_duration_since(cached.fetched_at);
        let fresh = age >= chrono::Duration::zero()
            && age.to_std().map(|a| a < self.ttl).unwrap_or(false);
        if !fresh {
            return Ok(None);
        }
        Ok(serde_json::from_value(cached.record).ok())
    }

    /// Compare the submitted identity against the registry and classify.
    pub fn verify(&self, conn: &Connection, submitted: &Provider) -> Result<NpiIssue, StoreError> {
        match self.fetch(conn, &submitted.npi) {
            Ok(record) => Ok(self.classify(submitted, &record)),
            Err(NpiError::Store(e)) => Err(e),
            Err(e) => Ok(NpiIssue {
                status: NpiStatus::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
                provider: submitted.clone(),
                taxonomies: Vec::new(),
                checked_at: Utc::now(),
            }),
        }
    }

    fn classify(&self, submitted: &Provider, record: &NpiRegistryRecord) -> NpiIssue {
        let registry_provider = Provider {
            npi: record.npi.clone(),
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            middle_initial: initial(&record.middle_name),
        };

        let mut matches = eq_ci(&submitted.first_name, &registry_provider.first_name)
            && eq_ci(&submitted.last_name, &registry_provider.last_name);
        if matches && self.compare_middle_initial {
            let a = initial(&submitted.middle_initial);
            let b = registry_provider.middle_initial.clone();
            if !a.is_empty() && !b.is_empty() && !eq_ci(&a, &b) {
                matches = false;
            }
        }

        NpiIssue {
            status: if matches {
                NpiStatus::Confirmed
            } else {
                NpiStatus::Corrected
            },
            provider: registry_provider,
            taxonomies: record.taxonomies.clone(),
            checked_at: Utc::now(),
        }
    }
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn initial(name: &str) -> String {
    name.trim().chars().next().map(|c| c.to_string()).unwrap_or_default()
}
