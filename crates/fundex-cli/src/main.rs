mod log;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::Term;
use fundex_core::Dataset;
use fundex_storage::{FundStore, HttpFetcher, MemoryFundStore, PgFundStore};
use fundex_sync::{
    run_scheduler, DatabaseSettings, FailurePolicy, HarvestContext, HarvestOptions, Harvester,
    SourceRegistry, SyncConfig,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fundex-cli")]
#[command(about = "Mutual fund reference data harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest once and exit.
    Sync(SyncArgs),
    /// Create any missing fund tables.
    Migrate,
    /// Run the cron-scheduled harvests until Ctrl-C.
    Schedule,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum DatasetArg {
    Identity,
    Detail,
    Rate,
    #[default]
    All,
}

impl DatasetArg {
    fn datasets(self) -> Vec<Dataset> {
        match self {
            DatasetArg::Identity => vec![Dataset::Identity],
            DatasetArg::Detail => vec![Dataset::Detail],
            DatasetArg::Rate => vec![Dataset::Rate],
            DatasetArg::All => Dataset::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long, value_enum, default_value_t = DatasetArg::All)]
    dataset: DatasetArg,
    /// Re-fetch codes that already have a stored row.
    #[arg(long)]
    refresh: bool,
    /// Log and skip codes whose fetch or mapping fails instead of aborting.
    #[arg(long)]
    skip_failures: bool,
    /// Harvest into an in-memory store; nothing is written to Postgres.
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn options(&self, config: &SyncConfig) -> HarvestOptions {
        let mut options = HarvestOptions::from_config(config);
        options.refresh = self.refresh;
        if self.skip_failures {
            options.failure_policy = FailurePolicy::Skip;
        }
        options
    }
}

fn prompt_password(settings: &DatabaseSettings) -> Result<String> {
    let term = Term::stderr();
    term.write_str(&format!("Password for {}: ", settings.display_target()))
        .context("writing password prompt")?;
    term.read_secure_line().context("reading database password")
}

async fn connect(config: &SyncConfig) -> Result<PgFundStore> {
    let prompted = if config.database.needs_password() {
        Some(prompt_password(&config.database)?)
    } else {
        None
    };
    let options = config.database.connect_options(prompted.as_deref())?;
    info!(database = %config.database.display_target(), "connecting to postgres");
    PgFundStore::connect(options)
        .await
        .context("connecting to the fund store")
}

async fn build_harvester(
    config: &SyncConfig,
    store: Arc<dyn FundStore>,
    options: HarvestOptions,
) -> Result<Harvester> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let http = HttpFetcher::new(config.http_client_config())?;
    Ok(Harvester::new(HarvestContext::new(store, http, registry, options)))
}

async fn run_sync(config: &SyncConfig, args: SyncArgs) -> Result<()> {
    let store: Arc<dyn FundStore> = if args.dry_run {
        info!("dry run: writes go to an in-memory store");
        Arc::new(MemoryFundStore::new())
    } else {
        Arc::new(connect(config).await?)
    };
    let harvester = build_harvester(config, store, args.options(config)).await?;
    let summary = harvester.run(&args.dataset.datasets()).await?;

    for dataset in &summary.datasets {
        println!(
            "{}: candidates={} inserted={} updated={} skipped={} empty={} failed={} flushes={} dropped_tiers={}",
            dataset.dataset,
            dataset.candidates,
            dataset.inserted,
            dataset.updated,
            dataset.skipped_known,
            dataset.empty,
            dataset.failed,
            dataset.flushes.len(),
            dataset.dropped_tiers,
        );
    }
    println!(
        "sync complete: run_id={} elapsed={:.1}s",
        summary.run_id,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;
    let log_path = log::init_logging(&config.log_dir)?;
    info!(log_file = %log_path.display(), "fundex starting");

    match cli
        .command
        .unwrap_or_else(|| Commands::Sync(SyncArgs::default()))
    {
        Commands::Sync(args) => run_sync(&config, args).await?,
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.ensure_schema().await.context("creating fund tables")?;
            println!("migrate complete");
        }
        Commands::Schedule => {
            let store: Arc<dyn FundStore> = Arc::new(connect(&config).await?);
            let harvester =
                build_harvester(&config, store, HarvestOptions::from_config(&config)).await?;
            run_scheduler(&harvester, &config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::try_parse_from([
            "fundex-cli",
            "sync",
            "--dataset",
            "rate",
            "--refresh",
            "--skip-failures",
        ])
        .expect("parse");
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.dataset, DatasetArg::Rate);
        assert!(args.refresh);
        assert!(args.skip_failures);
        assert!(!args.dry_run);
    }

    #[test]
    fn all_datasets_expand_in_harvest_order() {
        assert_eq!(
            DatasetArg::All.datasets(),
            vec![Dataset::Identity, Dataset::Detail, Dataset::Rate]
        );
        assert_eq!(DatasetArg::default(), DatasetArg::All);
    }

    #[test]
    fn skip_failures_overrides_configured_policy() {
        let mut config = SyncConfig::from_env().expect("config");
        config.failure_policy = FailurePolicy::Abort;
        let args = SyncArgs {
            skip_failures: true,
            refresh: true,
            ..Default::default()
        };
        let options = args.options(&config);
        assert_eq!(options.failure_policy, FailurePolicy::Skip);
        assert!(options.refresh);
    }
}
