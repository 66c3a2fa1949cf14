use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use casecheck::config;

#[tokio::main]
async fn main() {
    casecheck::init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| config::app_data_dir().join("config.json"));

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing the current record");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let result =
        tokio::task::spawn_blocking(move || casecheck::run(&config_path, interrupted)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Pipeline exited with an error");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "Pipeline task panicked");
            std::process::exit(1);
        }
    }
}
