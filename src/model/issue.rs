//! Per-facet verification results and the append-style case history.
//!
//! Each facet (NPI, address, eligibility) has its own sealed status union;
//! eligibility statuses additionally carry a total order used for
//! worst-status-wins display selection. Orderings go through explicit rank
//! tables, never through declaration order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::case::{Provider, Subscriber};
use super::status::StatusFlags;

// ═══════════════════════════════════════════════════════════
// Severity
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Ok,
    Info,
    Warn,
    Question,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Question => "QUESTION",
            Self::Error => "ERROR",
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Responsibility
// ═══════════════════════════════════════════════════════════

/// Insurance coverage priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Responsibility {
    Primary,
    Secondary,
    Tertiary,
}

impl Responsibility {
    pub const ALL: [Responsibility; 3] = [Self::Primary, Self::Secondary, Self::Tertiary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "Primary",
            Self::Secondary => "Secondary",
            Self::Tertiary => "Tertiary",
        }
    }

    /// Lenient parse used on inbound XML; anything unrecognized maps to
    /// Primary, matching how the exports treat a missing attribute.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "secondary" | "2" => Self::Secondary,
            "tertiary" | "3" => Self::Tertiary,
            _ => Self::Primary,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// NPI facet
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NpiStatus {
    Original,
    Unchecked,
    Corrected,
    Confirmed,
    Error { code: String, message: String },
}

impl NpiStatus {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Original => Severity::Info,
            Self::Unchecked => Severity::Question,
            Self::Corrected => Severity::Warn,
            Self::Confirmed => Severity::Ok,
            Self::Error { .. } => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub license: String,
}

/// One NPI verification attempt. `provider` holds the submitted identity for
/// `Original` entries and the registry identity for verified ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpiIssue {
    pub status: NpiStatus,
    pub provider: Provider,
    #[serde(default)]
    pub taxonomies: Vec<Taxonomy>,
    pub checked_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════
// Address facet
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressStatus {
    Missing,
    Original,
    Unchecked,
    Corrected,
    Confirmed,
    Error { code: String, message: String },
}

impl AddressStatus {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Corrected | Self::Confirmed)
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Missing => Severity::Error,
            Self::Original => Severity::Info,
            Self::Unchecked => Severity::Question,
            Self::Corrected => Severity::Warn,
            Self::Confirmed => Severity::Ok,
            Self::Error { .. } => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalAddress {
    pub line1: String,
    #[serde(default)]
    pub line2: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    #[serde(default)]
    pub plus4: String,
}

impl PostalAddress {
    pub fn is_blank(&self) -> bool {
        self.line1.trim().is_empty()
            && self.city.trim().is_empty()
            && self.zip.trim().is_empty()
    }
}

/// Severity level attached to a standardization footnote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FootnoteSeverity {
    Info,
    Warning,
    Error,
}

impl FootnoteSeverity {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }
}

impl PartialOrd for FootnoteSeverity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FootnoteSeverity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Coded annotation from the address service, preserved verbatim for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footnote {
    pub code: String,
    pub severity: FootnoteSeverity,
    pub label: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressIssue {
    pub status: AddressStatus,
    pub address: PostalAddress,
    #[serde(default)]
    pub footnotes: Vec<Footnote>,
    pub checked_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════
// Eligibility facet
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EligibilityStatus {
    Missing,
    Problem,
    Unchecked,
    Original,
    NotAvailable,
    Confirmed,
}

impl EligibilityStatus {
    /// Explicit total-order table: Missing < Problem < Unchecked < Original
    /// < NotAvailable < Confirmed.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Missing => 0,
            Self::Problem => 1,
            Self::Unchecked => 2,
            Self::Original => 3,
            Self::NotAvailable => 4,
            Self::Confirmed => 5,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::NotAvailable | Self::Confirmed)
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Missing => Severity::Error,
            Self::Problem => Severity::Warn,
            Self::Unchecked => Severity::Question,
            Self::Original => Severity::Info,
            Self::NotAvailable => Severity::Info,
            Self::Confirmed => Severity::Ok,
        }
    }
}

impl PartialOrd for EligibilityStatus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EligibilityStatus {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// One eligibility verification attempt for one responsibility class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityIssue {
    pub responsibility: Responsibility,
    pub status: EligibilityStatus,
    /// Insurer display name as submitted.
    pub insurance: String,
    /// Canonical payer id when resolution succeeded.
    pub payer_id: Option<String>,
    /// Subscriber snapshot after any demographic backfill.
    pub subscriber: Subscriber,
    /// Payer name reported by the service, when a response was obtained.
    #[serde(default)]
    pub payer_name: String,
    /// Human-readable note ("coverage isn't active", error text, ...).
    #[serde(default)]
    pub note: String,
    pub checked_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════
// History overlay
// ═══════════════════════════════════════════════════════════

/// Append-style lists of verification attempts per facet. "Current
/// attributes" are always derived from here, never stored separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseHistory {
    #[serde(default)]
    pub npi: Vec<NpiIssue>,
    #[serde(default)]
    pub address: Vec<AddressIssue>,
    #[serde(default)]
    pub eligibility: Vec<EligibilityIssue>,
}

impl CaseHistory {
    pub fn current_npi(&self) -> Option<&NpiIssue> {
        self.npi.last()
    }

    pub fn current_address(&self) -> Option<&AddressIssue> {
        self.address.last()
    }

    pub fn eligibility_for(&self, r: Responsibility) -> Vec<&EligibilityIssue> {
        self.eligibility
            .iter()
            .filter(|i| i.responsibility == r)
            .collect()
    }

    pub fn latest_eligibility(&self, r: Responsibility) -> Option<&EligibilityIssue> {
        self.eligibility.iter().rev().find(|i| i.responsibility == r)
    }

    /// The eligibility result to use for output assembly for one
    /// responsibility class:
    /// - timed out: none — the original submission is forwarded as-is;
    /// - resolved: latest passed attempt, falling back to the most recent
    ///   attempt that carries any substantive status (anything but Missing);
    /// - otherwise: latest passed attempt only.
    pub fn best_eligibility(
        &self,
        r: Responsibility,
        flags: &StatusFlags,
    ) -> Option<&EligibilityIssue> {
        if flags.timeout {
            return None;
        }
        let attempts = self.eligibility_for(r);
        let latest_passed = attempts.iter().rev().find(|i| i.status.passed()).copied();
        if flags.resolved {
            latest_passed.or_else(|| {
                attempts
                    .iter()
                    .rev()
                    .find(|i| i.status != EligibilityStatus::Missing)
                    .copied()
            })
        } else {
            latest_passed
        }
    }

    /// Single display value across responsibility classes: the minimum by
    /// the status total order among the latest attempt per class —
    /// worst-status-wins, so problems surface first.
    pub fn display_eligibility(&self) -> Option<&EligibilityIssue> {
        Responsibility::ALL
            .iter()
            .filter_map(|r| self.latest_eligibility(*r))
            .min_by_key(|i| i.status.rank())
    }
}
