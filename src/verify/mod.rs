//! External verification facets: referring-provider NPI, postal address,
//! and insurance eligibility. Each facet pairs a service trait (with a
//! blocking HTTP implementation and a mock) with a verifier that owns
//! caching and status classification.

pub mod address;
pub mod eligibility;
pub mod npi;
pub mod ttl;

pub use address::{AddressError, AddressService, AddressVerifier, HttpAddressService};
pub use eligibility::{
    EligibilityError, EligibilityService, EligibilityVerifier, HttpEligibilityService,
};
pub use npi::{HttpNpiRegistry, NpiError, NpiRegistry, NpiVerifier};
pub use ttl::TtlCache;
