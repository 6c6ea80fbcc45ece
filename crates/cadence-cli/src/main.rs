use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_assess::{build_scheduler, AssessConfig};
use cadence_core::TenantSelector;
use cadence_storage::PgStore;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cadence-cli")]
#[command(about = "Customer cadence health command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one assessment pass and print the summary.
    Assess(AssessArgs),
    /// Serve the HTTP trigger (and the scheduler when enabled).
    Serve,
    /// Run the cron scheduler in the foreground until interrupted.
    Schedule,
    /// Apply the bundled database migrations.
    Migrate,
}

#[derive(Debug, Args, Default)]
struct AssessArgs {
    #[arg(long, conflicts_with_all = ["tenant_slug", "all"])]
    tenant_id: Option<Uuid>,
    #[arg(long, conflicts_with = "all")]
    tenant_slug: Option<String>,
    /// Assess every tenant, ignoring DEFAULT_TENANT_SLUG.
    #[arg(long)]
    all: bool,
    /// Evaluation time (RFC 3339); defaults to now.
    #[arg(long)]
    now: Option<DateTime<Utc>>,
    #[arg(long)]
    json: bool,
}

impl AssessArgs {
    fn selector(&self, config: &AssessConfig) -> Option<TenantSelector> {
        if let Some(id) = self.tenant_id {
            Some(TenantSelector::Id(id))
        } else if let Some(slug) = &self.tenant_slug {
            Some(TenantSelector::Slug(slug.clone()))
        } else if self.all {
            None
        } else {
            config.default_selector()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Assess(AssessArgs::default())) {
        Commands::Assess(args) => {
            let config = AssessConfig::from_env();
            let job = config.build_job().await?;
            let summary = job
                .run(args.selector(&config), args.now.unwrap_or_else(Utc::now))
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "assessment complete: run_id={} tenants={} scanned={} changed={} errors={}",
                    summary.run_id,
                    summary.tenants_processed,
                    summary.customers_scanned,
                    summary.statuses_changed,
                    summary.errors
                );
            }
        }
        Commands::Serve => cadence_web::serve_from_env().await?,
        Commands::Schedule => {
            let config = AssessConfig::from_env();
            let job = Arc::new(config.build_job().await?);
            let mut sched = build_scheduler(job, &config.cron, config.default_selector()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cron, "health assessment scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = AssessConfig::from_env();
            let store = PgStore::connect(&config.database_url, 1).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
