//! Pipeline configuration: directory layout, polling cadence, timeout
//! policy, and the per-service endpoints. Loaded from a JSON file when one
//! exists, otherwise defaults rooted under `~/Casecheck/`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Casecheck";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> String {
    format!("info,{}=debug", env!("CARGO_PKG_NAME"))
}

/// Get the application data directory.
/// ~/Casecheck/ on all platforms (user-visible, by design)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(APP_NAME)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NpiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Middle initials are noisy in the exports; off by default.
    pub compare_middle_initial: bool,
}

impl Default for NpiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://npiregistry.cms.hhs.gov/api/".to_string(),
            timeout_secs: 30,
            compare_middle_initial: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Billing organization NPI sent as the requesting provider.
    pub organization_npi: String,
    pub timeout_secs: u64,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            organization_npi: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub inbound_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub poll_interval_secs: u64,
    pub timeout_days: i64,
    /// Skip files whose (name, created) pair was already imported, before
    /// reading their content. Off by default: content digest is the truth.
    pub skip_by_name_and_time: bool,
    /// Dotted element paths collapsed to scalar objects after parsing.
    pub foldable_paths: Vec<String>,
    pub npi: NpiConfig,
    pub address: AddressConfig,
    pub eligibility: EligibilityConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let root = app_data_dir();
        Self {
            inbound_dir: root.join("inbound"),
            archive_dir: root.join("archive"),
            backup_dir: root.join("backup"),
            output_dir: root.join("output"),
            db_path: root.join("casecheck.db"),
            poll_interval_secs: 30,
            timeout_days: 14,
            skip_by_name_and_time: false,
            foldable_paths: vec![
                "Order.Case".to_string(),
                "Order.Case.Patient".to_string(),
                "Order.Case.Physician".to_string(),
            ],
            npi: NpiConfig::default(),
            address: AddressConfig::default(),
            eligibility: EligibilityConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        let mut dirs = vec![
            self.inbound_dir.clone(),
            self.archive_dir.clone(),
            self.backup_dir.clone(),
            self.output_dir.clone(),
        ];
        if let Some(parent) = self.db_path.parent() {
            dirs.push(parent.to_path_buf());
        }
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|e| ConfigError::CreateDir {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}
