pub mod checker;
pub mod config;
pub mod digest;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod store;
pub mod verify;
pub mod xml;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use checker::CaseChecker;
use config::PipelineConfig;
use pipeline::PipelineDriver;
use verify::npi::NPI_CACHE_TTL;
use verify::{
    AddressVerifier, EligibilityVerifier, HttpAddressService, HttpEligibilityService,
    HttpNpiRegistry, NpiVerifier,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Store(#[from] store::StoreError),
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}

/// Load configuration, open the store, wire the verifiers, and poll until
/// the interrupt flag flips.
pub fn run(config_path: &Path, interrupted: Arc<AtomicBool>) -> Result<(), AppError> {
    let config = PipelineConfig::load(config_path)?;
    config.ensure_dirs()?;
    let conn = store::open_database(&config.db_path)?;

    tracing::info!(
        db = %config.db_path.display(),
        inbound = %config.inbound_dir.display(),
        "{} starting v{}",
        config::APP_NAME,
        config::APP_VERSION
    );

    let checker = CaseChecker::new(
        NpiVerifier::new(
            HttpNpiRegistry::new(&config.npi.base_url, config.npi.timeout_secs),
            NPI_CACHE_TTL,
            config.npi.compare_middle_initial,
        ),
        AddressVerifier::new(HttpAddressService::new(
            &config.address.base_url,
            config.address.timeout_secs,
        )),
        EligibilityVerifier::new(HttpEligibilityService::new(
            &config.eligibility.base_url,
            &config.eligibility.client_id,
            &config.eligibility.client_secret,
            &config.eligibility.organization_npi,
            config.eligibility.timeout_secs,
        )),
    );

    let mut driver = PipelineDriver::new(&config, conn, checker, interrupted);
    driver.run();
    Ok(())
}
