//! Subledger Background Worker
//!
//! Applies the billing schema and runs scheduled jobs:
//! - Billing invariant checks over ledger, payment log and customers (hourly by default)
//! - Heartbeat (every 5 minutes)

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use subledger_billing::{
    InvariantCheckSummary, InvariantChecker, PgBillingStore, PlanCatalog, ViolationSeverity,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_INVARIANT_SCHEDULE: &str = "0 0 * * * *";

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of an invariant run
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing invariants hold"
        );
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        worst = ?summary.worst_severity(),
        "Billing invariant check found violations"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Subledger Worker");

    let pool = create_db_pool().await?;

    let store = PgBillingStore::new(pool.clone());
    store.migrate().await?;
    info!("Billing schema up to date");

    match store.list_plans().await {
        Ok(plans) => info!(plans = plans.len(), "Plan catalog loaded"),
        Err(e) => warn!(error = %e, "Failed to read plan catalog"),
    }

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariants
    let schedule = std::env::var("BILLING_INVARIANT_SCHEDULE")
        .unwrap_or_else(|_| DEFAULT_INVARIANT_SCHEDULE.to_string());
    let checker = InvariantChecker::new(pool.clone());
    scheduler
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!(schedule = %schedule, "Scheduled: Billing invariant checks");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Subledger Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
