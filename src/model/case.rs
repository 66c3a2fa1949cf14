use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::xml::{attr_or_empty, child, children};

use super::issue::{CaseHistory, PostalAddress, Responsibility};
use super::status::StatusFlags;

/// Ingestion metadata of the source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
}

/// Referring provider identity as submitted or as returned by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub npi: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub middle_initial: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub dob: String,
    #[serde(default)]
    pub address: PostalAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub responsibility: Responsibility,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub middle_initial: String,
    pub policy_number: String,
    #[serde(default)]
    pub group_number: String,
    pub insurance: String,
    #[serde(default)]
    pub relationship: String,
    #[serde(default)]
    pub dob: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub address: PostalAddress,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self {
            responsibility: Responsibility::Primary,
            first_name: String::new(),
            last_name: String::new(),
            middle_initial: String::new(),
            policy_number: String::new(),
            group_number: String::new(),
            insurance: String::new(),
            relationship: String::new(),
            dob: String::new(),
            sex: String::new(),
            address: PostalAddress::default(),
        }
    }
}

/// One ingested order case: the immutable parsed tree plus the mutable
/// verification overlay. Created once per unique content digest; only
/// `history` and `status` change after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub digest: String,
    pub file: FileMeta,
    pub doc_created: DateTime<Utc>,
    pub case: Value,
    #[serde(default)]
    pub history: CaseHistory,
    #[serde(default)]
    pub status: StatusFlags,
}

impl CaseRecord {
    fn case_element(&self) -> Option<&Value> {
        child(child(&self.case, "Order")?, "Case")
    }

    pub fn accession(&self) -> &str {
        self.case_element()
            .map(|c| attr_or_empty(c, "Accession"))
            .unwrap_or("")
    }

    /// Referring physician, when the export carries one with an NPI.
    pub fn physician(&self) -> Option<Provider> {
        let el = child(self.case_element()?, "Physician")?;
        let npi = attr_or_empty(el, "NPI").trim().to_string();
        if npi.is_empty() {
            return None;
        }
        Some(Provider {
            npi,
            first_name: attr_or_empty(el, "FirstName").to_string(),
            last_name: attr_or_empty(el, "LastName").to_string(),
            middle_initial: attr_or_empty(el, "MiddleInitial").to_string(),
        })
    }

    pub fn patient(&self) -> Option<Patient> {
        let el = child(self.case_element()?, "Patient")?;
        Some(Patient {
            first_name: attr_or_empty(el, "FirstName").to_string(),
            last_name: attr_or_empty(el, "LastName").to_string(),
            dob: attr_or_empty(el, "DOB").to_string(),
            address: address_from_element(el),
        })
    }

    /// All submitted subscriber entries, in document order.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        let Some(case) = self.case_element() else {
            return Vec::new();
        };
        children(case, "Subscriber")
            .into_iter()
            .map(|el| Subscriber {
                responsibility: Responsibility::parse(attr_or_empty(el, "Responsibility")),
                first_name: attr_or_empty(el, "FirstName").to_string(),
                last_name: attr_or_empty(el, "LastName").to_string(),
                middle_initial: attr_or_empty(el, "MiddleInitial").to_string(),
                policy_number: attr_or_empty(el, "PolicyNum").to_string(),
                group_number: attr_or_empty(el, "GroupNum").to_string(),
                insurance: attr_or_empty(el, "Insurance").to_string(),
                relationship: attr_or_empty(el, "Relationship").to_string(),
                dob: attr_or_empty(el, "DOB").to_string(),
                sex: attr_or_empty(el, "Sex").to_string(),
                address: address_from_element(el),
            })
            .collect()
    }
}

fn address_from_element(el: &Value) -> PostalAddress {
    PostalAddress {
        line1: attr_or_empty(el, "Address1").to_string(),
        line2: attr_or_empty(el, "Address2").to_string(),
        city: attr_or_empty(el, "City").to_string(),
        state: attr_or_empty(el, "State").to_string(),
        zip: attr_or_empty(el, "Zip").to_string(),
        plus4: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;

    const SAMPLE: &str = r#"<Order>
  <Case Accession="A42">
    <Patient FirstName="Ana" LastName="Reyes" DOB="1980-04-02"
             Address1="1 Main St" City="Boston" State="MA" Zip="02101"/>
    <Physician NPI="1234567893" FirstName="John" LastName="Carter" MiddleInitial="Q"/>
    <Subscriber Responsibility="Primary" FirstName="Ana" LastName="Reyes"
                PolicyNum="P100" Insurance="Acme Health" Relationship="self"/>
    <Subscriber Responsibility="Secondary" FirstName="Luis" LastName="Reyes"
                PolicyNum="S200" Insurance="Umbrella Care" Relationship="spouse"/>
  </Case>
</Order>"#;

    fn record() -> CaseRecord {
        let foldable = vec![
            "Order.Case".to_string(),
            "Order.Case.Patient".to_string(),
            "Order.Case.Physician".to_string(),
        ];
        CaseRecord {
            digest: "d".into(),
            file: FileMeta {
                name: "order.xml".into(),
                size: SAMPLE.len() as u64,
                created: Utc::now(),
            },
            doc_created: Utc::now(),
            case: parse_document(SAMPLE, &foldable).unwrap(),
            history: CaseHistory::default(),
            status: StatusFlags::default(),
        }
    }

    #[test]
    fn reads_accession_and_physician() {
        let r = record();
        assert_eq!(r.accession(), "A42");
        let phys = r.physician().unwrap();
        assert_eq!(phys.npi, "1234567893");
        assert_eq!(phys.middle_initial, "Q");
    }

    #[test]
    fn reads_patient_address() {
        let p = record().patient().unwrap();
        assert_eq!(p.address.line1, "1 Main St");
        assert_eq!(p.address.zip, "02101");
        assert!(!p.address.is_blank());
    }

    #[test]
    fn reads_subscribers_in_document_order() {
        let subs = record().subscribers();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].responsibility, Responsibility::Primary);
        assert_eq!(subs[0].insurance, "Acme Health");
        assert_eq!(subs[1].responsibility, Responsibility::Secondary);
        assert_eq!(subs[1].policy_number, "S200");
    }

    #[test]
    fn missing_sections_yield_none_or_empty() {
        let mut r = record();
        r.case = parse_document("<Order><Case Accession=\"A1\"/></Order>", &[]).unwrap();
        assert!(r.physician().is_none());
        assert!(r.patient().is_none());
        assert!(r.subscribers().is_empty());
    }

    #[test]
    fn physician_without_npi_is_absent() {
        let mut r = record();
        r.case = parse_document(
            "<Order><Case><Physician FirstName=\"J\" LastName=\"C\"/></Case></Order>",
            &[],
        )
        .unwrap();
        assert!(r.physician().is_none());
    }
}
