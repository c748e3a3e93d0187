use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bidfit_core::{parse_date_str, DateRange, OpportunityRecord};
use bidfit_dedup::{
    dedupe_records, load_dedup_config, maybe_build_scheduler, report_recent_runs_markdown, run_job,
    BatchOptions, DedupJobConfig, SetOptions, StoreBackend, DEFAULT_MATCH_THRESHOLD,
};
use bidfit_matching::ResolutionStrategy;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bidfit-cli")]
#[command(about = "BidFit opportunity deduplication")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deduplicate the persisted store. Dry run unless --apply is given.
    Run(RunArgs),
    /// Reduce a JSON array of records to one record per duplicate group.
    DedupeFile(DedupeFileArgs),
    /// Apply database migrations.
    Migrate,
    /// Run batch dedup on the BIDFIT_DEDUP_CRON schedule until interrupted.
    Schedule(BatchArgs),
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    backend: Option<StoreBackend>,
    #[arg(long)]
    store: Option<PathBuf>,
    #[command(flatten)]
    batch: BatchArgs,
}

#[derive(Debug, Args)]
struct BatchArgs {
    /// Archive duplicates instead of only reporting them.
    #[arg(long)]
    apply: bool,
    #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
    threshold: f64,
    /// Candidate page size; defaults to the dedup config's batch_size.
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    max_opportunities: Option<usize>,
    #[arg(long)]
    agency: Option<String>,
    #[arg(long, value_parser = parse_date_arg)]
    from: Option<DateTime<Utc>>,
    #[arg(long, value_parser = parse_date_arg)]
    to: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = ResolutionStrategy::BestQuality)]
    strategy: ResolutionStrategy,
    #[arg(long)]
    no_audit: bool,
    /// YAML dedup config; overrides BIDFIT_DEDUP_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl BatchArgs {
    fn options(&self) -> BatchOptions {
        let date_range = (self.from.is_some() || self.to.is_some()).then_some(DateRange {
            start: self.from,
            end: self.to,
        });
        BatchOptions {
            dry_run: !self.apply,
            batch_size: self.batch_size,
            match_threshold: self.threshold,
            date_range,
            agency_filter: self.agency.clone(),
            create_audit_trail: !self.no_audit,
            max_opportunities: self.max_opportunities,
            strategy: self.strategy,
        }
    }
}

#[derive(Debug, Args)]
struct DedupeFileArgs {
    input: PathBuf,
    /// Defaults to stdout.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
    threshold: f64,
    #[arg(long, default_value_t = ResolutionStrategy::BestQuality)]
    strategy: ResolutionStrategy,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_date_arg(input: &str) -> Result<DateTime<Utc>, String> {
    parse_date_str(input).ok_or_else(|| format!("unrecognized date: {input}"))
}

/// `RUST_LOG` directives when set and valid, `info` otherwise.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    let cli = Cli::parse();
    let mut job = DedupJobConfig::from_env();

    match cli.command.unwrap_or(Commands::Report { runs: 5 }) {
        Commands::Run(args) => {
            if let Some(backend) = args.backend {
                job.backend = backend;
            }
            if let Some(store) = args.store {
                job.store_path = store;
            }
            if let Some(config) = &args.batch.config {
                job.dedup_config_path = Some(config.clone());
            }
            let (result, reports_dir) = run_job(&job, &args.batch.options()).await?;
            println!(
                "dedup complete: run_id={} dry_run={} scanned={} groups={} removed={} errors={} reports={}",
                result.run_id,
                result.dry_run,
                result.total_opportunities,
                result.duplicate_groups.len(),
                result.duplicates_removed,
                result.errors.len(),
                reports_dir.display()
            );
        }
        Commands::DedupeFile(args) => {
            let config = match args.config.as_ref().or(job.dedup_config_path.as_ref()) {
                Some(path) => load_dedup_config(path).await?,
                None => Default::default(),
            };
            let text = tokio::fs::read_to_string(&args.input)
                .await
                .with_context(|| format!("reading {}", args.input.display()))?;
            let records: Vec<OpportunityRecord> =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", args.input.display()))?;
            let options = SetOptions {
                match_threshold: args.threshold,
                strategy: args.strategy,
            };
            let reduced = dedupe_records(&config, &records, &options)?;
            info!(input = records.len(), output = reduced.len(), "deduplicated record file");

            let json = serde_json::to_string_pretty(&reduced).context("serializing records")?;
            match &args.output {
                Some(path) => tokio::fs::write(path, json)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Commands::Migrate => {
            let pool = bidfit_storage::connect_pg(&job.database_url)
                .await
                .context("connecting to postgres")?;
            bidfit_storage::run_migrations(&pool).await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule(args) => {
            if let Some(config) = &args.config {
                job.dedup_config_path = Some(config.clone());
            }
            job.scheduler_enabled = true;
            let Some(mut sched) = maybe_build_scheduler(&job, &args.options()).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %job.dedup_cron, "dedup scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs_markdown(runs, &job.reports_dir)?);
        }
    }

    Ok(())
}
