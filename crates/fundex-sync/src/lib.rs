//! Harvest orchestration: identity listings first, then keyed detail and rate fetches.

mod batcher;
mod config;
mod reconcile;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundex_adapters::{
    identity_source_for, map_detail, map_rate, AdapterError, DetailUpdate, FundApiClient,
    MappingError, RateUpdate, RawRecord,
};
use fundex_core::{Dataset, FundDetail, FundIdentity, FundRate, FundRecord, NameSide, Payload};
use fundex_storage::{FundStore, HttpFetcher, Persist};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use batcher::{BatchReport, UpsertBatcher, Upserted};
pub use config::{
    BatchSizes, DatabaseSettings, FailurePolicy, FundApiConfig, SourceConfig, SourceRegistry,
    SyncConfig, REGISTRY_FILE,
};
pub use reconcile::{recompute_name_agreement, reconcile};

pub const CRATE_NAME: &str = "fundex-sync";

#[derive(Debug, Clone, Default)]
pub struct HarvestOptions {
    /// Re-fetch codes already present downstream instead of skipping them.
    pub refresh: bool,
    pub failure_policy: FailurePolicy,
    pub batch_sizes: BatchSizes,
}

impl HarvestOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            refresh: false,
            failure_policy: config.failure_policy,
            batch_sizes: config.batch_sizes,
        }
    }
}

/// Everything a run needs, built once at startup.
pub struct HarvestContext {
    pub store: Arc<dyn FundStore>,
    pub http: HttpFetcher,
    pub registry: SourceRegistry,
    pub api: FundApiClient,
    pub options: HarvestOptions,
}

impl HarvestContext {
    pub fn new(
        store: Arc<dyn FundStore>,
        http: HttpFetcher,
        registry: SourceRegistry,
        options: HarvestOptions,
    ) -> Self {
        let api = FundApiClient::new(&registry.fund_api.detail_url, &registry.fund_api.rate_url);
        Self {
            store,
            http,
            registry,
            api,
            options,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub dataset: Dataset,
    pub candidates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_known: usize,
    pub empty: usize,
    pub failed: usize,
    pub flushes: Vec<usize>,
    pub dropped_tiers: usize,
    pub elapsed: Duration,
}

impl DatasetSummary {
    fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            candidates: 0,
            inserted: 0,
            updated: 0,
            skipped_known: 0,
            empty: 0,
            failed: 0,
            flushes: Vec::new(),
            dropped_tiers: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn absorb(&mut self, report: BatchReport) {
        self.inserted = report.inserted;
        self.updated = report.updated;
        self.flushes = report.flushes;
    }

    fn log(&self) {
        info!(
            dataset = %self.dataset,
            candidates = self.candidates,
            inserted = self.inserted,
            updated = self.updated,
            skipped_known = self.skipped_known,
            empty = self.empty,
            failed = self.failed,
            flushes = self.flushes.len(),
            dropped_tiers = self.dropped_tiers,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "dataset harvested"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetSummary>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn dataset(&self, dataset: Dataset) -> Option<&DatasetSummary> {
        self.datasets.iter().find(|s| s.dataset == dataset)
    }
}

/// A dataset fetched per code from the fund API and keyed by the codes of an upstream table.
trait KeyedRecord: Persist {
    type Upstream: Persist;
    type Update: Send + Sync;

    fn batch_size(sizes: &BatchSizes) -> usize;

    fn map(raw: &RawRecord) -> Result<Self::Update, MappingError>;

    fn apply(update: &Self::Update, row: &mut Self);

    fn payload_code(_update: &Self::Update) -> Option<&str> {
        None
    }

    fn dropped_tiers(_update: &Self::Update) -> usize {
        0
    }
}

impl KeyedRecord for FundDetail {
    type Upstream = FundIdentity;
    type Update = DetailUpdate;

    fn batch_size(sizes: &BatchSizes) -> usize {
        sizes.detail
    }

    fn map(raw: &RawRecord) -> Result<DetailUpdate, MappingError> {
        map_detail(raw)
    }

    fn apply(update: &DetailUpdate, row: &mut Self) {
        update.apply_to(row);
    }

    fn payload_code(update: &DetailUpdate) -> Option<&str> {
        update.payload_code.as_deref()
    }
}

impl KeyedRecord for FundRate {
    type Upstream = FundDetail;
    type Update = RateUpdate;

    fn batch_size(sizes: &BatchSizes) -> usize {
        sizes.rate
    }

    fn map(raw: &RawRecord) -> Result<RateUpdate, MappingError> {
        map_rate(raw)
    }

    fn apply(update: &RateUpdate, row: &mut Self) {
        update.apply_to(row);
    }

    fn dropped_tiers(update: &RateUpdate) -> usize {
        update.dropped_tiers()
    }
}

fn on_failure(
    policy: FailurePolicy,
    summary: &mut DatasetSummary,
    key: &str,
    err: AdapterError,
) -> Result<()> {
    match policy {
        FailurePolicy::Abort => Err(anyhow::Error::new(err)
            .context(format!("{} harvest failed for {key}", summary.dataset))),
        FailurePolicy::Skip => {
            warn!(key, network = err.is_network(), error = %err, "skipping after failure");
            summary.failed += 1;
            Ok(())
        }
    }
}

/// Runs harvests against one [`HarvestContext`]. Clones share the context and its run lock.
#[derive(Clone)]
pub struct Harvester {
    ctx: Arc<HarvestContext>,
    run_lock: Arc<Mutex<()>>,
}

impl Harvester {
    pub fn new(ctx: HarvestContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Harvest the requested datasets in identity, detail, rate order.
    pub async fn run(&self, datasets: &[Dataset]) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            %run_id,
            ?datasets,
            refresh = self.ctx.options.refresh,
            policy = ?self.ctx.options.failure_policy,
            "harvest started"
        );

        self.ctx
            .store
            .ensure_schema()
            .await
            .context("ensuring fund tables")?;

        let mut summaries = Vec::new();
        for dataset in Dataset::ALL.into_iter().filter(|d| datasets.contains(d)) {
            let span = info_span!("harvest", %run_id, dataset = %dataset);
            let summary = match dataset {
                Dataset::Identity => self.harvest_identity().instrument(span).await,
                Dataset::Detail => self.harvest_keyed::<FundDetail>().instrument(span).await,
                Dataset::Rate => self.harvest_keyed::<FundRate>().instrument(span).await,
            }?;
            summary.log();
            summaries.push(summary);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            datasets: summaries,
            elapsed: clock.elapsed(),
        };
        info!(
            %run_id,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "harvest finished"
        );
        Ok(summary)
    }

    async fn harvest_identity(&self) -> Result<DatasetSummary> {
        let ctx = &self.ctx;
        let store = ctx.store.as_ref();
        let clock = Instant::now();
        let mut summary = DatasetSummary::new(Dataset::Identity);
        let mut batcher = UpsertBatcher::<FundIdentity>::preload(store, ctx.options.batch_sizes.identity)
            .await
            .context("preloading fund_identity")?;

        for source in ctx.registry.enabled_identity_sources() {
            let client = identity_source_for(&source.source_id, source.kind, source.url());
            let mut listed = 0usize;
            for page in 1u32.. {
                let funds = match client.fetch_page(&ctx.http, page).await {
                    Ok(funds) => funds,
                    Err(err) => {
                        on_failure(ctx.options.failure_policy, &mut summary, &source.source_id, err)?;
                        break;
                    }
                };
                if funds.is_empty() {
                    break;
                }
                listed += funds.len();

                for fund in &funds {
                    summary.candidates += 1;
                    let name = fund.name.as_deref();
                    let (howbuy, eastmoney) = match client.side() {
                        NameSide::Howbuy => (name, None),
                        NameSide::Eastmoney => (None, name),
                    };
                    let outcome = reconcile(&mut batcher, store, &fund.code, howbuy, eastmoney)
                        .await
                        .context("writing fund_identity batch")?;
                    if outcome.is_none() {
                        summary.skipped_known += 1;
                    }
                }
                ctx.http.pace().await;
            }
            info!(source_id = %source.source_id, listed, "fetched listing");
        }

        let report = batcher
            .finish(store)
            .await
            .context("writing final fund_identity batch")?;
        recompute_name_agreement(&mut batcher, store)
            .await
            .context("recomputing names_agree")?;
        summary.absorb(report);
        summary.elapsed = clock.elapsed();
        Ok(summary)
    }

    async fn fetch_payload(&self, dataset: Dataset, code: &str) -> Result<Payload, AdapterError> {
        let ctx = &self.ctx;
        match dataset {
            Dataset::Rate => ctx.api.fetch_rate(&ctx.http, code).await,
            _ => ctx.api.fetch_detail(&ctx.http, code).await,
        }
    }

    async fn harvest_keyed<T: KeyedRecord>(&self) -> Result<DatasetSummary> {
        let ctx = &self.ctx;
        let store = ctx.store.as_ref();
        let clock = Instant::now();
        let mut summary = DatasetSummary::new(T::DATASET);

        let upstream = T::Upstream::load_all(store)
            .await
            .with_context(|| format!("loading {} codes", T::Upstream::DATASET.table()))?;
        let mut candidates: Vec<String> = upstream.iter().map(|r| r.code().to_string()).collect();
        candidates.sort();
        candidates.dedup();
        summary.candidates = candidates.len();

        let mut batcher = UpsertBatcher::<T>::preload(store, T::batch_size(&ctx.options.batch_sizes))
            .await
            .with_context(|| format!("preloading {}", T::DATASET.table()))?;

        for code in &candidates {
            if batcher.contains(code) && !ctx.options.refresh {
                summary.skipped_known += 1;
                continue;
            }

            let fetched = self.fetch_payload(T::DATASET, code).await;
            ctx.http.pace().await;
            let raw = match fetched {
                Ok(Payload::Present(raw)) => raw,
                Ok(Payload::Empty) => {
                    debug!(code = %code, "empty payload");
                    summary.empty += 1;
                    continue;
                }
                Err(err) => {
                    on_failure(ctx.options.failure_policy, &mut summary, code, err)?;
                    continue;
                }
            };
            let update = match T::map(&raw) {
                Ok(update) => update,
                Err(err) => {
                    on_failure(ctx.options.failure_policy, &mut summary, code, err.into())?;
                    continue;
                }
            };

            if let Some(payload_code) = T::payload_code(&update) {
                if payload_code != code {
                    warn!(code = %code, payload_code, "payload names a different code");
                }
            }
            let dropped = T::dropped_tiers(&update);
            if dropped > 0 {
                warn!(code = %code, dropped, "fee tiers beyond column capacity dropped");
                summary.dropped_tiers += dropped;
            }

            batcher
                .upsert_with(store, code, |row| T::apply(&update, row))
                .await
                .with_context(|| format!("writing {} batch", T::DATASET.table()))?;
        }

        let report = batcher
            .finish(store)
            .await
            .with_context(|| format!("writing final {} batch", T::DATASET.table()))?;
        summary.absorb(report);
        summary.elapsed = clock.elapsed();
        Ok(summary)
    }
}

/// Two cron jobs each running a full harvest, or `None` when scheduling is disabled.
pub async fn build_scheduler(
    harvester: &Harvester,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let harvester = harvester.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let harvester = harvester.clone();
            Box::pin(async move {
                match harvester.run(&Dataset::ALL).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled harvest finished"),
                    Err(err) => error!(error = ?err, "scheduled harvest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "registered harvest job");
    }
    Ok(Some(sched))
}

/// Run scheduled harvests until Ctrl-C.
pub async fn run_scheduler(harvester: &Harvester, config: &SyncConfig) -> Result<()> {
    let Some(mut sched) = build_scheduler(harvester, config).await? else {
        warn!("scheduler disabled; set FUNDEX_SCHEDULER_ENABLED=true to enable");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
