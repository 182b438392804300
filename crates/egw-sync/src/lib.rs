//! Store, reconciliation, lifecycle sweep, notification dispatch and the
//! periodic jobs that tie them together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use egw_adapters::{EncounterFeed, FeedBatch, ListingFeed, ListingView};
use egw_storage::{BackoffPolicy, FsImageCache, HttpClientConfig, HttpFetcher, ImageCache};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod messages;
pub mod reconcile;
pub mod store;
pub mod sweep;
pub mod transport;

pub use commands::{Command, CommandPipeline, Reply, Request};
pub use config::{AppConfig, CompletionPolicy, EngineConfig, SourceRegistry};
pub use dispatch::{DispatchReport, Dispatcher};
pub use messages::Formatter;
pub use reconcile::{
    ActiveSetReport, Reconciler, RescheduleNotice, ScheduleChange, UpsertOutcome, UpsertReport,
};
pub use store::{BroadcastKind, GameFilter, GameQuery, GameStore};
pub use sweep::{sweep, SweepReport};
pub use transport::{
    DeliveryOutcome, LogTransport, MemoryTransport, NotificationTransport, TelegramTransport,
};

pub const CRATE_NAME: &str = "egw-sync";

/// Every long-lived component, built once at startup and shared by the jobs.
#[derive(Clone)]
pub struct Services {
    pub store: GameStore,
    pub feed: Arc<dyn ListingFeed>,
    pub reconciler: Reconciler,
    pub dispatcher: Dispatcher,
    pub commands: Arc<CommandPipeline>,
}

impl Services {
    pub fn new(
        store: GameStore,
        feed: Arc<dyn ListingFeed>,
        images: Arc<dyn ImageCache>,
        transport: Arc<dyn NotificationTransport>,
        chats: Vec<i64>,
        formatter: Formatter,
        engine: EngineConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone(), images, engine),
            dispatcher: Dispatcher::new(store.clone(), transport, chats, formatter, engine),
            commands: Arc::new(CommandPipeline::new(store.clone(), formatter)),
            feed,
            store,
        }
    }

    /// Connects, migrates and wires the live collaborators.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store = GameStore::connect(&config.database_url).await?;
        store.migrate().await?;

        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })?);

        let registry = SourceRegistry::load(&config.sources_path).await?;
        let feed = EncounterFeed::new(
            http.clone(),
            registry.sources,
            config.source_offset()?,
            Duration::from_secs(config.batch_timeout_secs),
        );
        let images = FsImageCache::new(config.images_dir.clone(), http.clone());

        let transport: Arc<dyn NotificationTransport> = match &config.bot_token {
            Some(token) => Arc::new(TelegramTransport::new(
                http.client().clone(),
                &config.telegram_api_base,
                token,
            )),
            None => {
                warn!("no bot token configured; messages are only logged");
                Arc::new(LogTransport)
            }
        };

        Ok(Self::new(
            store,
            Arc::new(feed),
            Arc::new(images),
            transport,
            config.chat_ids.clone(),
            Formatter::new(config.source_offset()?),
            config.engine,
        ))
    }

    async fn fetch_views(&self) -> (FeedBatch, FeedBatch) {
        tokio::join!(
            self.feed.fetch_view(ListingView::Upcoming),
            self.feed.fetch_view(ListingView::Active)
        )
    }
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_records: usize,
    pub failed_targets: usize,
    pub reschedule_notices: usize,
}

/// Scrapes both views and merges every record. A record that fails to merge
/// is logged and skipped.
pub async fn run_ingestion(services: &Services, now: DateTime<Utc>) -> Result<IngestSummary> {
    let run_id = Uuid::new_v4();
    async move {
        let started_at = Utc::now();
        let (upcoming, active) = services.fetch_views().await;
        let mut summary = IngestSummary {
            run_id,
            started_at,
            finished_at: started_at,
            records: upcoming.records.len() + active.records.len(),
            created: 0,
            updated: 0,
            unchanged: 0,
            failed_records: 0,
            failed_targets: upcoming.failed_targets + active.failed_targets,
            reschedule_notices: 0,
        };

        for record in upcoming.records.iter().chain(active.records.iter()) {
            let report = match services.reconciler.upsert(record, now).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(game_id = record.id, error = %err, "failed to merge record");
                    summary.failed_records += 1;
                    continue;
                }
            };
            match report.outcome {
                UpsertOutcome::Created => summary.created += 1,
                UpsertOutcome::Updated => summary.updated += 1,
                UpsertOutcome::Unchanged => summary.unchanged += 1,
            }
            if let Some(notice) = &report.reschedule {
                if services
                    .dispatcher
                    .broadcast_reschedule(&report.game, notice)
                    .await?
                {
                    summary.reschedule_notices += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            records = summary.records,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed_records = summary.failed_records,
            failed_targets = summary.failed_targets,
            "ingestion finished"
        );
        Ok(summary)
    }
    .instrument(info_span!("ingest", %run_id))
    .await
}

pub async fn run_active_set(services: &Services) -> Result<ActiveSetReport> {
    let run_id = Uuid::new_v4();
    async move {
        let (upcoming, active) = services.fetch_views().await;
        services
            .reconciler
            .reconcile_active_set(&active, &upcoming)
            .await
    }
    .instrument(info_span!("active_set", %run_id))
    .await
}

pub async fn run_sweep(services: &Services, now: DateTime<Utc>) -> Result<SweepReport> {
    let run_id = Uuid::new_v4();
    async move {
        let report = sweep(&services.store, now).await?;
        info!(
            examined = report.examined,
            transitions = report.transitions.len(),
            "sweep finished"
        );
        Ok(report)
    }
    .instrument(info_span!("sweep", %run_id))
    .await
}

pub async fn run_dispatch(services: &Services, now: DateTime<Utc>) -> Result<DispatchReport> {
    let run_id = Uuid::new_v4();
    services
        .dispatcher
        .run(now)
        .instrument(info_span!("dispatch", %run_id))
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Ingest,
    ActiveSet,
    Sweep,
    Dispatch,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::ActiveSet => "active_set",
            Self::Sweep => "sweep",
            Self::Dispatch => "dispatch",
        }
    }

    fn cron(self, config: &AppConfig) -> &str {
        match self {
            Self::Ingest => &config.ingest_cron,
            Self::ActiveSet => &config.active_set_cron,
            Self::Sweep => &config.sweep_cron,
            Self::Dispatch => &config.dispatch_cron,
        }
    }
}

pub async fn run_job(services: &Services, kind: JobKind) -> Result<()> {
    let now = Utc::now();
    match kind {
        JobKind::Ingest => run_ingestion(services, now).await.map(|_| ()),
        JobKind::ActiveSet => run_active_set(services).await.map(|_| ()),
        JobKind::Sweep => run_sweep(services, now).await.map(|_| ()),
        JobKind::Dispatch => run_dispatch(services, now).await.map(|_| ()),
    }
}

/// One cron job per periodic task. Jobs never wait on each other; overlapping
/// runs are safe because every mutation is flag-gated or compare-and-set.
pub async fn maybe_build_scheduler(
    services: Arc<Services>,
    config: &AppConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for kind in [JobKind::Ingest, JobKind::ActiveSet, JobKind::Sweep, JobKind::Dispatch] {
        let cron = kind.cron(config);
        let services = services.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let services = services.clone();
            Box::pin(async move {
                if let Err(err) = run_job(&services, kind).await {
                    error!(job = kind.as_str(), error = %err, "scheduled job failed");
                }
            })
        })
        .with_context(|| format!("creating {} job for cron {cron}", kind.as_str()))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(job = kind.as_str(), cron, "scheduled");
    }
    Ok(Some(sched))
}
