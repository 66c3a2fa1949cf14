//! Per-record verification run: orchestrates the three facet verifiers,
//! rebuilds the history snapshot, computes pass/fail, and persists the
//! outcome with one audit entry.
//!
//! A check run is idempotent: it replaces the whole history snapshot, so
//! retries never accumulate duplicate attempts.

use chrono::Utc;
use rusqlite::Connection;
use thiserror::Error;

use crate::model::{
    AddressIssue, AddressStatus, CaseHistory, CaseLogEntry, CaseRecord, EligibilityIssue,
    EligibilityStatus, NpiIssue, NpiStatus, PostalAddress, Responsibility, Severity, Subscriber,
};
use crate::store::{self, StoreError};
use crate::verify::address::AddressService;
use crate::verify::eligibility::EligibilityService;
use crate::verify::npi::NpiRegistry;
use crate::verify::{AddressVerifier, EligibilityVerifier, NpiVerifier};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct CaseChecker<R: NpiRegistry, A: AddressService, E: EligibilityService> {
    npi: NpiVerifier<R>,
    address: AddressVerifier<A>,
    eligibility: EligibilityVerifier<E>,
}

impl<R: NpiRegistry, A: AddressService, E: EligibilityService> CaseChecker<R, A, E> {
    pub fn new(
        npi: NpiVerifier<R>,
        address: AddressVerifier<A>,
        eligibility: EligibilityVerifier<E>,
    ) -> Self {
        Self {
            npi,
            address,
            eligibility,
        }
    }

    /// Run all three facets on one record. Updates the record in place,
    /// persists flags and history, and appends the `case.check` log entry.
    /// Returns whether the record passed.
    pub fn check(&self, conn: &Connection, record: &mut CaseRecord) -> Result<bool, CheckError> {
        let mut history = CaseHistory::default();

        let npi_passed = self.check_npi(conn, record, &mut history)?;
        let eligibility_passed = self.check_eligibility(conn, record, &mut history)?;
        let address_passed = self.check_address(&mut history, record);
        let passed = npi_passed && eligibility_passed && address_passed;

        store::cases::set_checked(conn, &record.digest, passed, &history)?;
        record.history = history;
        record.status.checked = Some(true);
        record.status.passed = Some(passed);

        let (severity, message) = if passed {
            (Severity::Ok, "passed")
        } else {
            (Severity::Warn, "not passed")
        };
        store::log::append(
            conn,
            &CaseLogEntry::now(
                severity,
                &record.digest,
                record.accession(),
                "pipeline",
                "case.check",
                message,
                record.status.value(),
            ),
        )?;
        Ok(passed)
    }

    /// An `Original` entry plus the verification result, or a single
    /// `Unchecked` entry when the export carries no provider.
    fn check_npi(
        &self,
        conn: &Connection,
        record: &CaseRecord,
        history: &mut CaseHistory,
    ) -> Result<bool, CheckError> {
        let Some(provider) = record.physician() else {
            history.npi.push(NpiIssue {
                status: NpiStatus::Unchecked,
                provider: Default::default(),
                taxonomies: Vec::new(),
                checked_at: Utc::now(),
            });
            return Ok(false);
        };

        history.npi.push(NpiIssue {
            status: NpiStatus::Original,
            provider: provider.clone(),
            taxonomies: Vec::new(),
            checked_at: Utc::now(),
        });
        let result = self.npi.verify(conn, &provider)?;
        let passed = result.status.passed();
        history.npi.push(result);
        Ok(passed)
    }

    /// One attempt per submitted subscriber; a record with no subscribers at
    /// all gets a synthesized `Missing` issue on Primary and fails.
    fn check_eligibility(
        &self,
        conn: &Connection,
        record: &CaseRecord,
        history: &mut CaseHistory,
    ) -> Result<bool, CheckError> {
        let subscribers = record.subscribers();
        if subscribers.is_empty() {
            history.eligibility.push(EligibilityIssue {
                responsibility: Responsibility::Primary,
                status: EligibilityStatus::Missing,
                insurance: String::new(),
                payer_id: None,
                subscriber: Subscriber::default(),
                payer_name: String::new(),
                note: "no subscriber submitted".to_string(),
                checked_at: Utc::now(),
            });
            return Ok(false);
        }

        let patient = record.patient();
        let mut submitted: Vec<Responsibility> = Vec::new();
        for subscriber in &subscribers {
            if !submitted.contains(&subscriber.responsibility) {
                submitted.push(subscriber.responsibility);
            }
            let issue = self.eligibility.verify(conn, subscriber, patient.as_ref())?;
            history.eligibility.push(issue);
        }

        // Every submitted responsibility class must pass on its latest attempt.
        Ok(submitted.iter().all(|r| {
            history
                .latest_eligibility(*r)
                .map(|i| i.status.passed())
                .unwrap_or(false)
        }))
    }

    /// The patient's submitted address is tried first. When it is absent or
    /// does not verify, an address recovered from a passed eligibility
    /// response is tried next. Each attempted candidate is recorded as an
    /// `Original` entry followed by its result.
    fn check_address(&self, history: &mut CaseHistory, record: &CaseRecord) -> bool {
        let submitted = record
            .patient()
            .map(|p| p.address)
            .filter(|a| !a.is_blank());
        let recovered = recovered_address(history);

        match (submitted, recovered) {
            (Some(candidate), recovered) => {
                // No point retrying the identical address.
                let fallback = recovered.filter(|f| *f != candidate);
                if self.attempt_address(history, candidate) {
                    return true;
                }
                match fallback {
                    Some(fallback) => self.attempt_address(history, fallback),
                    None => false,
                }
            }
            (None, Some(candidate)) => self.attempt_address(history, candidate),
            (None, None) => {
                history.address.push(AddressIssue {
                    status: AddressStatus::Missing,
                    address: PostalAddress::default(),
                    footnotes: Vec::new(),
                    checked_at: Utc::now(),
                });
                false
            }
        }
    }

    fn attempt_address(&self, history: &mut CaseHistory, candidate: PostalAddress) -> bool {
        history.address.push(AddressIssue {
            status: AddressStatus::Original,
            address: candidate.clone(),
            footnotes: Vec::new(),
            checked_at: Utc::now(),
        });
        let result = self.address.verify(&candidate);
        let passed = result.status.passed();
        history.address.push(result);
        passed
    }
}

/// First passed eligibility attempt carrying a usable subscriber address.
fn recovered_address(history: &CaseHistory) -> Option<PostalAddress> {
    history
        .eligibility
        .iter()
        .find(|i| i.status.passed() && !i.subscriber.address.is_blank())
        .map(|i| i.subscriber.address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileMeta, StatusFlags, Taxonomy};
    use crate::store::{cache, open_memory_database};
    use crate::verify::address::{AddressCandidate, AddressError, MockAddressService};
    use crate::verify::eligibility::{EligibilityResponse, MockEligibilityService};
    use crate::verify::npi::{MockNpiRegistry, NpiRegistryRecord, NPI_CACHE_TTL};
    use crate::xml::parse_document;

    const FULL_ORDER: &str = r#"<Order>
  <Case Accession="A42">
    <Patient FirstName="Ana" LastName="Reyes" DOB="1980-04-02"
             Address1="1 Main St" City="Boston" State="MA" Zip="02101"/>
    <Physician NPI="1234567893" FirstName="John" LastName="Carter"/>
    <Subscriber Responsibility="Primary" FirstName="Ana" LastName="Reyes"
                PolicyNum="P100" Insurance="Acme Health" Relationship="self"/>
  </Case>
</Order>"#;

    fn record_from(xml: &str) -> CaseRecord {
        CaseRecord {
            digest: "d1".into(),
            file: FileMeta {
                name: "order.xml".into(),
                size: xml.len() as u64,
                created: Utc::now(),
            },
            doc_created: Utc::now(),
            case: parse_document(xml, &[]).unwrap(),
            history: CaseHistory::default(),
            status: StatusFlags::default(),
        }
    }

    fn carter_registry() -> MockNpiRegistry {
        MockNpiRegistry::default().with_record(NpiRegistryRecord {
            npi: "1234567893".into(),
            first_name: "John".into(),
            last_name: "Carter".into(),
            middle_name: String::new(),
            organization_name: String::new(),
            taxonomies: vec![Taxonomy {
                code: "207Q00000X".into(),
                description: "Family Medicine".into(),
                primary: true,
                state: "MA".into(),
                license: "L1".into(),
            }],
        })
    }

    fn confirming_address() -> MockAddressService {
        MockAddressService::default().with_candidate(AddressCandidate {
            address: PostalAddress {
                line1: "1 MAIN ST".into(),
                line2: String::new(),
                city: "BOSTON".into(),
                state: "MA".into(),
                zip: "02101".into(),
                plus4: "1234".into(),
            },
            footnotes: Vec::new(),
        })
    }

    fn active_eligibility() -> MockEligibilityService {
        MockEligibilityService::with_response(EligibilityResponse {
            active_coverage: true,
            payer_name: "ACME HEALTH PLANS".into(),
            ..Default::default()
        })
    }

    fn checker(
        registry: MockNpiRegistry,
        address: MockAddressService,
        eligibility: MockEligibilityService,
    ) -> CaseChecker<MockNpiRegistry, MockAddressService, MockEligibilityService> {
        CaseChecker::new(
            NpiVerifier::new(registry, NPI_CACHE_TTL, false),
            AddressVerifier::new(address),
            EligibilityVerifier::new(eligibility),
        )
    }

    fn seeded_conn() -> Connection {
        let conn = open_memory_database().unwrap();
        cache::put_payer(&conn, "Acme Health", "system", "ACME1", true).unwrap();
        conn
    }

    #[test]
    fn all_facets_passing_marks_record_passed() {
        let conn = seeded_conn();
        let mut record = record_from(FULL_ORDER);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        let checker = checker(carter_registry(), confirming_address(), active_eligibility());
        assert!(checker.check(&conn, &mut record).unwrap());

        // Original + result per facet, one eligibility attempt.
        assert_eq!(record.history.npi.len(), 2);
        assert_eq!(record.history.npi[0].status, NpiStatus::Original);
        assert_eq!(record.history.npi[1].status, NpiStatus::Confirmed);
        assert_eq!(record.history.eligibility.len(), 1);
        assert_eq!(record.history.address.len(), 2);
        assert_eq!(record.history.address[0].status, AddressStatus::Original);
        assert_eq!(record.history.address[1].status, AddressStatus::Confirmed);

        let stored = store::cases::get_case(&conn, "d1").unwrap().unwrap();
        assert_eq!(stored.status.checked, Some(true));
        assert_eq!(stored.status.passed, Some(true));
        assert_eq!(stored.history.npi.len(), 2);

        let log = store::log::for_case(&conn, "d1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, "case.check");
        assert_eq!(log[0].message, "passed");
        assert_eq!(log[0].accession, "A42");
    }

    #[test]
    fn missing_subscriber_synthesizes_missing_primary_and_fails() {
        let conn = seeded_conn();
        let xml = r#"<Order><Case Accession="A1">
            <Patient FirstName="Ana" LastName="Reyes" Address1="1 Main St" City="Boston" State="MA" Zip="02101"/>
            <Physician NPI="1234567893" FirstName="John" LastName="Carter"/>
        </Case></Order>"#;
        let mut record = record_from(xml);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        let checker = checker(carter_registry(), confirming_address(), active_eligibility());
        assert!(!checker.check(&conn, &mut record).unwrap());

        assert_eq!(record.history.eligibility.len(), 1);
        let issue = &record.history.eligibility[0];
        assert_eq!(issue.status, EligibilityStatus::Missing);
        assert_eq!(issue.responsibility, Responsibility::Primary);
        assert_eq!(record.status.passed, Some(false));
        // Checked but not passed: display value stays CHECKED.
        assert_eq!(record.status.value(), "CHECKED");
    }

    #[test]
    fn missing_physician_is_single_unchecked_entry() {
        let conn = seeded_conn();
        let xml = r#"<Order><Case Accession="A1">
            <Patient FirstName="Ana" LastName="Reyes" Address1="1 Main St" City="Boston" State="MA" Zip="02101"/>
            <Subscriber Responsibility="Primary" FirstName="Ana" LastName="Reyes"
                        PolicyNum="P100" Insurance="Acme Health"/>
        </Case></Order>"#;
        let mut record = record_from(xml);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        let checker = checker(carter_registry(), confirming_address(), active_eligibility());
        assert!(!checker.check(&conn, &mut record).unwrap());
        assert_eq!(record.history.npi.len(), 1);
        assert_eq!(record.history.npi[0].status, NpiStatus::Unchecked);
    }

    #[test]
    fn address_falls_back_to_passed_eligibility_subscriber() {
        let conn = seeded_conn();
        // Patient has no address; the payer reports one.
        let xml = r#"<Order><Case Accession="A1">
            <Patient FirstName="Ana" LastName="Reyes"/>
            <Physician NPI="1234567893" FirstName="John" LastName="Carter"/>
            <Subscriber Responsibility="Primary" FirstName="Ana" LastName="Reyes"
                        PolicyNum="P100" Insurance="Acme Health" Relationship="self"/>
        </Case></Order>"#;
        let mut record = record_from(xml);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        let eligibility = MockEligibilityService::with_response(EligibilityResponse {
            active_coverage: true,
            address: PostalAddress {
                line1: "9 Payer Way".into(),
                city: "Boston".into(),
                state: "MA".into(),
                zip: "02102".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        let checker = checker(carter_registry(), confirming_address(), eligibility);
        assert!(checker.check(&conn, &mut record).unwrap());
        assert_eq!(record.history.address[0].address.line1, "9 Payer Way");
        assert_eq!(record.history.address[1].status, AddressStatus::Confirmed);
    }

    /// Standardizes only the addresses it knows by line1; everything else
    /// comes back with no candidates.
    struct SelectiveAddressService {
        known: Vec<PostalAddress>,
    }

    impl AddressService for SelectiveAddressService {
        fn standardize(
            &self,
            query: &PostalAddress,
        ) -> Result<Vec<AddressCandidate>, AddressError> {
            Ok(self
                .known
                .iter()
                .filter(|a| a.line1 == query.line1)
                .map(|a| AddressCandidate {
                    address: a.clone(),
                    footnotes: Vec::new(),
                })
                .collect())
        }
    }

    #[test]
    fn rejected_patient_address_retries_with_payer_reported_one() {
        let conn = seeded_conn();
        let xml = r#"<Order><Case Accession="A1">
            <Patient FirstName="Ana" LastName="Reyes" Address1="1 Bad St" City="Boston" State="MA" Zip="02101"/>
            <Physician NPI="1234567893" FirstName="John" LastName="Carter"/>
            <Subscriber Responsibility="Primary" FirstName="Ana" LastName="Reyes"
                        PolicyNum="P100" Insurance="Acme Health" Relationship="self"/>
        </Case></Order>"#;
        let mut record = record_from(xml);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        let payer_address = PostalAddress {
            line1: "9 Payer Way".into(),
            city: "Boston".into(),
            state: "MA".into(),
            zip: "02102".into(),
            ..Default::default()
        };
        let eligibility = MockEligibilityService::with_response(EligibilityResponse {
            active_coverage: true,
            address: payer_address.clone(),
            ..Default::default()
        });
        let address = SelectiveAddressService {
            known: vec![payer_address],
        };
        let checker = CaseChecker::new(
            NpiVerifier::new(carter_registry(), NPI_CACHE_TTL, false),
            AddressVerifier::new(address),
            EligibilityVerifier::new(eligibility),
        );
        assert!(checker.check(&conn, &mut record).unwrap());

        // Failed patient attempt, then the recovered address.
        assert_eq!(record.history.address.len(), 4);
        assert_eq!(record.history.address[0].status, AddressStatus::Original);
        assert_eq!(record.history.address[0].address.line1, "1 Bad St");
        assert!(matches!(
            record.history.address[1].status,
            AddressStatus::Error { .. }
        ));
        assert_eq!(record.history.address[2].status, AddressStatus::Original);
        assert_eq!(record.history.address[2].address.line1, "9 Payer Way");
        assert_eq!(record.history.address[3].status, AddressStatus::Confirmed);
    }

    #[test]
    fn rejected_address_with_no_recovered_fallback_fails() {
        let conn = seeded_conn();
        let mut record = record_from(FULL_ORDER);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        // Payer reports no address, so there is nothing to retry with.
        let checker = checker(
            carter_registry(),
            MockAddressService::default(),
            active_eligibility(),
        );
        assert!(!checker.check(&conn, &mut record).unwrap());
        assert_eq!(record.history.address.len(), 2);
        assert!(matches!(
            record.history.address[1].status,
            AddressStatus::Error { .. }
        ));
    }

    #[test]
    fn no_address_candidate_at_all_is_missing() {
        let conn = seeded_conn();
        let xml = r#"<Order><Case Accession="A1">
            <Patient FirstName="Ana" LastName="Reyes"/>
            <Physician NPI="1234567893" FirstName="John" LastName="Carter"/>
            <Subscriber Responsibility="Primary" FirstName="Ana" LastName="Reyes"
                        PolicyNum="P100" Insurance="Acme Health"/>
        </Case></Order>"#;
        let mut record = record_from(xml);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        let checker = checker(carter_registry(), confirming_address(), active_eligibility());
        assert!(!checker.check(&conn, &mut record).unwrap());
        assert_eq!(record.history.address.len(), 1);
        assert_eq!(record.history.address[0].status, AddressStatus::Missing);
    }

    #[test]
    fn rerunning_check_replaces_history_instead_of_appending() {
        let conn = seeded_conn();
        let mut record = record_from(FULL_ORDER);
        store::cases::upsert_case(&conn, &record, false).unwrap();

        let checker = checker(carter_registry(), confirming_address(), active_eligibility());
        checker.check(&conn, &mut record).unwrap();
        checker.check(&conn, &mut record).unwrap();

        assert_eq!(record.history.npi.len(), 2);
        assert_eq!(record.history.eligibility.len(), 1);
        assert_eq!(record.history.address.len(), 2);
        // One audit entry per run, though.
        assert_eq!(store::log::for_case(&conn, "d1").unwrap().len(), 2);
    }
}
