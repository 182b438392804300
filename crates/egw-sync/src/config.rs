use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{Duration, FixedOffset};
use egw_adapters::SourceTarget;
use egw_core::WindowConfig;
use serde::Deserialize;

/// What the active-set pass does when more ACTIVE games vanished at once than
/// `completion_guard` allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    WarnAndProceed,
    Abort,
}

impl FromStr for CompletionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" | "warn_and_proceed" | "proceed" => Ok(Self::WarnAndProceed),
            "abort" => Ok(Self::Abort),
            other => anyhow::bail!("unknown completion policy {other:?}"),
        }
    }
}

/// Thresholds of the reconciliation engine and the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Start-time shift at or beyond which the broadcast flags are reset.
    pub reschedule_reset: Duration,
    pub completion_guard: usize,
    pub completion_policy: CompletionPolicy,
    /// More simultaneous archivals than this and none are applied.
    pub archive_cap: usize,
    pub announcement_lookahead: Duration,
    pub start_notice_lookahead: Duration,
    pub windows: WindowConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reschedule_reset: Duration::days(5),
            completion_guard: 10,
            completion_policy: CompletionPolicy::WarnAndProceed,
            archive_cap: 5,
            announcement_lookahead: Duration::days(5),
            start_notice_lookahead: Duration::hours(12),
            windows: WindowConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub images_dir: PathBuf,
    pub sources_path: PathBuf,
    /// No token means dry-run: messages are logged instead of sent.
    pub bot_token: Option<String>,
    pub telegram_api_base: String,
    pub chat_ids: Vec<i64>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub batch_timeout_secs: u64,
    pub source_utc_offset_hours: i32,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub active_set_cron: String,
    pub sweep_cron: String,
    pub dispatch_cron: String,
    pub engine: EngineConfig,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Comma separated chat ids; entries that are not integers are ignored.
pub fn parse_chat_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            reschedule_reset: Duration::hours(env_parse("EGW_RESCHEDULE_RESET_HOURS", 5 * 24)),
            completion_guard: env_parse("EGW_COMPLETION_GUARD", defaults.completion_guard),
            completion_policy: env_parse("EGW_COMPLETION_POLICY", defaults.completion_policy),
            archive_cap: env_parse("EGW_ARCHIVE_CAP", defaults.archive_cap),
            announcement_lookahead: Duration::hours(env_parse("EGW_ANNOUNCE_LOOKAHEAD_HOURS", 5 * 24)),
            start_notice_lookahead: Duration::hours(env_parse("EGW_START_NOTICE_LOOKAHEAD_HOURS", 12)),
            windows: WindowConfig {
                window: Duration::minutes(env_parse("EGW_NOTICE_WINDOW_MINUTES", 60)),
                near_end_lead: Duration::hours(env_parse("EGW_NEAR_END_LEAD_HOURS", 48)),
                min_separation: Duration::minutes(env_parse("EGW_MIN_SEPARATION_MINUTES", 60)),
            },
        };

        Self {
            database_url: env_string("DATABASE_URL", "sqlite://egw.db"),
            images_dir: PathBuf::from(env_string("EGW_IMAGES_DIR", "./images")),
            sources_path: PathBuf::from(env_string("EGW_SOURCES", "sources.yaml")),
            bot_token: std::env::var("EGW_BOT_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            telegram_api_base: env_string("EGW_TELEGRAM_API", "https://api.telegram.org"),
            chat_ids: parse_chat_ids(&env_string("EGW_CHAT_IDS", "")),
            user_agent: env_string("EGW_USER_AGENT", "Mozilla/5.0"),
            http_timeout_secs: env_parse("EGW_HTTP_TIMEOUT_SECS", 30),
            http_max_retries: env_parse("EGW_HTTP_MAX_RETRIES", 0),
            batch_timeout_secs: env_parse("EGW_BATCH_TIMEOUT_SECS", 180),
            source_utc_offset_hours: env_parse("EGW_SOURCE_UTC_OFFSET_HOURS", 3),
            scheduler_enabled: env_flag("EGW_SCHEDULER_ENABLED", true),
            ingest_cron: env_string("EGW_INGEST_CRON", "0 15,45 * * * *"),
            active_set_cron: env_string("EGW_ACTIVE_SET_CRON", "0 0,30 * * * *"),
            sweep_cron: env_string("EGW_SWEEP_CRON", "0 20,50 * * * *"),
            dispatch_cron: env_string("EGW_DISPATCH_CRON", "0 5,35 * * * *"),
            engine,
        }
    }

    pub fn source_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.source_utc_offset_hours * 3600).with_context(|| {
            format!(
                "source utc offset {}h is out of range",
                self.source_utc_offset_hours
            )
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceTarget>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}
