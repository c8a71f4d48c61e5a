//! # Studio Worker
//!
//! Scheduled maintenance for the studio platform:
//! - releases unpaid appointment holds
//! - emails reminders for upcoming sessions
//! - expires plans past their validity
//! - prunes expired sessions and old webhook records

mod jobs;

use std::sync::Arc;

use studio_api::{Config, StudioEmailService};
use studio_billing::PlanService;
use studio_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobs::{JobContext, Schedule};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "studio_worker=info,studio_api=info,studio_billing=info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Studio Worker v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url, config.database_max_connections.min(5)).await?;

    let ctx = Arc::new(JobContext {
        plans: PlanService::new(pool.clone()),
        email: StudioEmailService::new(config.email_config(), None),
        pool,
    });

    let mut scheduler = JobScheduler::new().await?;
    for schedule in Schedule::ALL {
        let ctx = ctx.clone();
        let job = Job::new_async(schedule.cron(), move |_id, _lock| {
            let ctx = ctx.clone();
            Box::pin(async move {
                jobs::run(schedule, &ctx).await;
            })
        })?;
        scheduler.add(job).await?;
        tracing::info!(job = schedule.name(), cron = schedule.cron(), "Job scheduled");
    }

    scheduler.start().await?;
    tracing::info!("Worker running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
