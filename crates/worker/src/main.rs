//! VenueLens Background Worker
//!
//! Handles scheduled jobs including:
//! - Yearly reset sweep: monthly credit replenishment for yearly plans (every 6 hours)
//! - Reset ledger TTL maintenance (daily at 3:30 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use venuelens_billing::{LedgerSweepSummary, MeteringService, ResetResult, ResetRun};
use venuelens_shared::config::env_or;
use venuelens_shared::{connect_counter_store, create_pool, CounterStoreConfig};

const DEFAULT_RESET_CRON: &str = "0 0 */6 * * *";
const LEDGER_SWEEP_CRON: &str = "0 30 3 * * *";
const HEARTBEAT_CRON: &str = "0 */5 * * * *";

/// Log results of a yearly reset sweep
fn log_reset_results(run: &ResetRun) {
    let summary = &run.summary;
    info!(
        checked = summary.checked,
        resets = summary.resets,
        already_done = summary.already_done,
        not_eligible = summary.not_eligible,
        not_yearly = summary.not_yearly,
        errors = summary.errors,
        "Yearly reset sweep complete"
    );

    // Log individual resets and errors
    for result in &run.results {
        match result {
            ResetResult::Reset { user_id, period } => {
                info!(user_id = %user_id, period = period, "Yearly subscriber replenished");
            }
            ResetResult::Error { user_id, error } => {
                error!(user_id = %user_id, error = %error, "Failed to process yearly reset");
            }
            _ => {}
        }
    }
}

fn log_ledger_sweep(summary: &LedgerSweepSummary) {
    if summary.errors > 0 {
        warn!(
            scanned = summary.scanned,
            fixed_missing_expiry = summary.fixed_missing_expiry,
            clamped = summary.clamped,
            errors = summary.errors,
            "Reset ledger sweep finished with errors"
        );
    } else {
        info!(
            scanned = summary.scanned,
            fixed_missing_expiry = summary.fixed_missing_expiry,
            clamped = summary.clamped,
            "Reset ledger sweep complete"
        );
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting VenueLens Worker");

    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let counter = connect_counter_store(&CounterStoreConfig::from_env()?).await?;
    if !counter.is_durable() {
        warn!("Counter store degraded - yearly resets will fail until it recovers");
    }

    let metering = match MeteringService::from_env(pool, counter) {
        Ok(m) => m,
        Err(e) => {
            // If the billing provider isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create metering service - running in minimal mode");
            info!("Worker running without billing provider integration");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Yearly reset sweep
    // Default cron: minute 0 past every 6th hour, so each 2-day eligibility window is hit several times
    let reset_cron: String = env_or("YEARLY_RESET_CRON", DEFAULT_RESET_CRON.to_string())?;
    let reset_scheduler = metering.scheduler.clone();
    scheduler
        .add(Job::new_async(reset_cron.as_str(), move |_uuid, _l| {
            let reset_scheduler = reset_scheduler.clone();
            Box::pin(async move {
                info!("Running yearly reset sweep");
                match reset_scheduler.run_once().await {
                    Ok(run) => log_reset_results(&run),
                    Err(e) => error!(error = %e, "Yearly reset sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %reset_cron, "Scheduled: Yearly reset sweep");

    // Job 2: Reset ledger TTL maintenance (daily at 3:30 AM UTC)
    let ledger_scheduler = metering.scheduler.clone();
    scheduler
        .add(Job::new_async(LEDGER_SWEEP_CRON, move |_uuid, _l| {
            let ledger_scheduler = ledger_scheduler.clone();
            Box::pin(async move {
                info!("Running reset ledger sweep");
                match ledger_scheduler.sweep_ledger_ttls().await {
                    Ok(summary) => log_ledger_sweep(&summary),
                    Err(e) => error!(error = %e, "Reset ledger sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Reset ledger sweep (daily at 3:30 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async(HEARTBEAT_CRON, |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("VenueLens Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
