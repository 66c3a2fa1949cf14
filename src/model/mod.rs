pub mod case;
pub mod issue;
pub mod log;
pub mod status;

pub use case::{CaseRecord, FileMeta, Patient, Provider, Subscriber};
pub use issue::{
    AddressIssue, AddressStatus, CaseHistory, EligibilityIssue, EligibilityStatus, Footnote,
    FootnoteSeverity, NpiIssue, NpiStatus, PostalAddress, Responsibility, Severity, Taxonomy,
};
pub use log::CaseLogEntry;
pub use status::StatusFlags;
