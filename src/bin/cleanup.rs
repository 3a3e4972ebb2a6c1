//! watchfolio-cleanup — scheduled retention cleanup.
//!
//! Physically deletes remote library rows whose tombstone is older than the
//! retention window. Meant to run from cron; exits non-zero when any row
//! failed to delete so the scheduler can alert.

use anyhow::Result;
use chrono::Utc;

use watchfolio::backend::http::HttpBackend;
use watchfolio::cleanup::run_cleanup;
use watchfolio::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    if config.backend.endpoint.is_empty() {
        eprintln!("Cleanup needs backend.endpoint in the config.");
        std::process::exit(1);
    }

    let backend = HttpBackend::new(&config.backend);
    let report = run_cleanup(&backend, Utc::now()).await?;

    println!(
        "Deleted {} of {} expired rows ({} failures)",
        report.deleted_count, report.total_processed, report.failure_count
    );
    if report.failure_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}
