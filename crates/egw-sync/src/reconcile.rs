//! Merges scraped batches into the store.
//!
//! `upsert` is the field-level merge for one record; `reconcile_active_set`
//! compares the store against the live active/upcoming views to detect games
//! that disappeared.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use egw_adapters::FeedBatch;
use egw_core::{evaluate, Game, GameId, GameRecord, LifecycleState};
use egw_storage::ImageCache;
use tracing::{debug, info, warn};

use crate::config::{CompletionPolicy, EngineConfig};
use crate::store::{GameQuery, GameStore};

/// Attempts per record before a lost compare-and-set race is reported.
const CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Which schedule fields moved in one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleChange {
    StartOnly,
    EndOnly,
    Both,
}

impl ScheduleChange {
    pub fn from_flags(start_changed: bool, end_changed: bool) -> Option<Self> {
        match (start_changed, end_changed) {
            (true, true) => Some(Self::Both),
            (true, false) => Some(Self::StartOnly),
            (false, true) => Some(Self::EndOnly),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleNotice {
    pub game_id: GameId,
    pub change: ScheduleChange,
    pub old_start: DateTime<Utc>,
    pub new_start: DateTime<Utc>,
    pub old_end: Option<DateTime<Utc>>,
    pub new_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertReport {
    pub outcome: UpsertOutcome,
    /// Stored row after the call.
    pub game: Game,
    /// At most one per call, and only for games already announced.
    pub reschedule: Option<RescheduleNotice>,
    pub flags_reset: bool,
}

/// Result of merging a record into an existing row, before any I/O.
#[derive(Debug, Clone)]
struct Merge {
    game: Game,
    start_changed: bool,
    end_changed: bool,
    flags_reset: bool,
    /// New remote image url that has to be fetched.
    image_to_fetch: Option<String>,
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn merge(existing: &Game, record: &GameRecord, config: &EngineConfig) -> Merge {
    let mut game = existing.clone();
    game.domain = record.domain.clone();
    game.name = record.name.clone();
    game.author = record.author.clone();
    game.price = record.price.clone();
    game.link = record.link.clone();
    game.category = record.category;
    if record.capacity.is_some() {
        game.capacity = record.capacity;
    }

    let start_changed = record.start_time != existing.start_time;
    let end_changed = record.end_time.is_some() && record.end_time != existing.end_time;
    game.start_time = record.start_time;
    if end_changed {
        game.end_time = record.end_time;
    }

    let shift = (record.start_time - existing.start_time).abs();
    let flags_reset = start_changed && shift >= config.reschedule_reset;
    if flags_reset {
        game.announcement_sent = false;
        game.start_notice_sent = false;
    }

    let image_to_fetch = record
        .image_source_url
        .as_ref()
        .filter(|url| existing.image_source_url.as_ref() != Some(*url))
        .cloned();

    Merge {
        game,
        start_changed,
        end_changed,
        flags_reset,
        image_to_fetch,
    }
}

fn new_game(record: &GameRecord, now: DateTime<Utc>) -> Game {
    let state = evaluate(LifecycleState::Upcoming, now, record.start_time, record.end_time).state;
    Game {
        id: record.id,
        domain: record.domain.clone(),
        name: record.name.clone(),
        author: record.author.clone(),
        price: record.price.clone(),
        link: record.link.clone(),
        category: record.category,
        capacity: record.capacity,
        start_time: record.start_time,
        end_time: record.end_time,
        lifecycle_state: state,
        announcement_sent: false,
        start_notice_sent: false,
        image_ref: None,
        image_source_url: record.image_source_url.clone(),
        revision: 0,
        created_at: now,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSetReport {
    pub completed: Vec<GameId>,
    pub promoted: Vec<GameId>,
    pub archived: Vec<GameId>,
    pub completion_skipped: bool,
    pub archival_skipped: bool,
}

#[derive(Clone)]
pub struct Reconciler {
    store: GameStore,
    images: Arc<dyn ImageCache>,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(store: GameStore, images: Arc<dyn ImageCache>, config: EngineConfig) -> Self {
        Self {
            store,
            images,
            config,
        }
    }

    pub fn store(&self) -> &GameStore {
        &self.store
    }

    async fn fetch_image(&self, url: &str, game_id: GameId) -> Option<String> {
        if !is_remote(url) {
            debug!(game_id, url, "image url is not remote; not fetching");
            return None;
        }
        self.images.fetch(url, game_id).await
    }

    /// Merges one record into the store. Unchanged records cause no write.
    pub async fn upsert(&self, record: &GameRecord, now: DateTime<Utc>) -> Result<UpsertReport> {
        for attempt in 0..CAS_ATTEMPTS {
            let Some(existing) = self.store.get_game(record.id).await? else {
                let mut game = new_game(record, now);
                if let Some(url) = &record.image_source_url {
                    game.image_ref = self.fetch_image(url, record.id).await;
                }
                if self.store.insert_game(&game).await? {
                    info!(game_id = game.id, state = %game.lifecycle_state, "game created");
                    return Ok(UpsertReport {
                        outcome: UpsertOutcome::Created,
                        game,
                        reschedule: None,
                        flags_reset: false,
                    });
                }
                debug!(game_id = record.id, attempt, "insert raced with another writer");
                continue;
            };

            let mut merged = merge(&existing, record, &self.config);
            if let Some(url) = &merged.image_to_fetch {
                merged.game.image_ref = self.fetch_image(url, record.id).await;
                merged.game.image_source_url = Some(url.clone());
            }
            if merged.game == existing {
                return Ok(UpsertReport {
                    outcome: UpsertOutcome::Unchanged,
                    game: existing,
                    reschedule: None,
                    flags_reset: false,
                });
            }

            let reset_subscriptions = merged.flags_reset;
            if !self.store.update_game(&merged.game, reset_subscriptions).await? {
                debug!(game_id = record.id, attempt, "revision moved; retrying merge");
                continue;
            }

            let reschedule = ScheduleChange::from_flags(merged.start_changed, merged.end_changed)
                .filter(|_| merged.game.announcement_sent)
                .map(|change| RescheduleNotice {
                    game_id: record.id,
                    change,
                    old_start: existing.start_time,
                    new_start: merged.game.start_time,
                    old_end: existing.end_time,
                    new_end: merged.game.end_time,
                });
            if merged.flags_reset {
                info!(
                    game_id = record.id,
                    old_start = %existing.start_time,
                    new_start = %merged.game.start_time,
                    "material reschedule; notification flags reset"
                );
            }
            let mut game = merged.game;
            game.revision += 1;
            return Ok(UpsertReport {
                outcome: UpsertOutcome::Updated,
                game,
                reschedule,
                flags_reset: merged.flags_reset,
            });
        }
        anyhow::bail!(
            "game {} kept changing underneath reconciliation ({CAS_ATTEMPTS} attempts)",
            record.id
        )
    }

    /// Promotes a vanished UPCOMING game found in the active view.
    async fn promote(&self, record: &GameRecord) -> Result<bool> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(existing) = self.store.get_game(record.id).await? else {
                return Ok(false);
            };
            if existing.lifecycle_state != LifecycleState::Upcoming {
                return Ok(false);
            }
            let mut merged = merge(&existing, record, &self.config);
            if let Some(url) = &merged.image_to_fetch {
                merged.game.image_ref = self.fetch_image(url, record.id).await;
                merged.game.image_source_url = Some(url.clone());
            }
            merged.game.lifecycle_state = LifecycleState::Active;
            if self.store.update_game(&merged.game, true).await? {
                return Ok(true);
            }
        }
        anyhow::bail!("game {} kept changing during promotion", record.id)
    }

    /// Disappearance pass over the live views. Views that are empty or had a
    /// failed target never drive transitions.
    pub async fn reconcile_active_set(
        &self,
        active: &FeedBatch,
        upcoming: &FeedBatch,
    ) -> Result<ActiveSetReport> {
        let mut report = ActiveSetReport::default();

        if active.is_trustworthy() {
            self.complete_vanished(active, &mut report).await?;
        } else {
            warn!(
                records = active.records.len(),
                failed_targets = active.failed_targets,
                "active view incomplete; completion step skipped"
            );
            report.completion_skipped = true;
        }

        if upcoming.is_trustworthy() {
            self.resolve_vanished_upcoming(active, upcoming, &mut report)
                .await?;
        } else {
            warn!(
                records = upcoming.records.len(),
                failed_targets = upcoming.failed_targets,
                "upcoming view incomplete; promotion and archival skipped"
            );
            report.archival_skipped = true;
        }

        info!(
            completed = report.completed.len(),
            promoted = report.promoted.len(),
            archived = report.archived.len(),
            "active-set pass finished"
        );
        Ok(report)
    }

    async fn complete_vanished(&self, active: &FeedBatch, report: &mut ActiveSetReport) -> Result<()> {
        let vanished: Vec<Game> = self
            .store
            .list_games(&GameQuery::new().state(LifecycleState::Active))
            .await?
            .into_iter()
            .filter(|g| !active.contains(g.id))
            .collect();

        if vanished.len() > self.config.completion_guard {
            warn!(
                candidates = vanished.len(),
                guard = self.config.completion_guard,
                policy = ?self.config.completion_policy,
                "unusually many active games vanished at once"
            );
            if self.config.completion_policy == CompletionPolicy::Abort {
                report.completion_skipped = true;
                return Ok(());
            }
        }

        for game in vanished {
            if self
                .store
                .complete_and_cascade(game.id, LifecycleState::Active)
                .await
                .with_context(|| format!("completing game {}", game.id))?
            {
                info!(game_id = game.id, "active game vanished from listing; completed");
                report.completed.push(game.id);
            }
        }
        Ok(())
    }

    async fn resolve_vanished_upcoming(
        &self,
        active: &FeedBatch,
        upcoming: &FeedBatch,
        report: &mut ActiveSetReport,
    ) -> Result<()> {
        let vanished: Vec<Game> = self
            .store
            .list_games(&GameQuery::new().state(LifecycleState::Upcoming))
            .await?
            .into_iter()
            .filter(|g| !upcoming.contains(g.id))
            .collect();

        let mut to_archive = Vec::new();
        for game in vanished {
            match active.get(game.id) {
                Some(record) => {
                    if self.promote(record).await? {
                        info!(game_id = game.id, "upcoming game found in active view; promoted");
                        report.promoted.push(game.id);
                    }
                }
                None => to_archive.push(game.id),
            }
        }

        if to_archive.is_empty() {
            return Ok(());
        }
        // Archival infers absence from the active view too.
        if active.failed_targets > 0 {
            warn!(
                candidates = to_archive.len(),
                "active view had failed targets; archival skipped"
            );
            report.archival_skipped = true;
            return Ok(());
        }
        if to_archive.len() > self.config.archive_cap {
            warn!(
                candidates = to_archive.len(),
                cap = self.config.archive_cap,
                "too many upcoming games vanished at once; nothing archived"
            );
            report.archival_skipped = true;
            return Ok(());
        }
        for id in to_archive {
            if self.store.archive_and_cascade(id).await? {
                info!(game_id = id, "upcoming game vanished from both views; archived");
                report.archived.push(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::t0;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use egw_core::{Category, SearchRole, SubscriberNotice};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeImages {
        calls: Mutex<Vec<(String, GameId)>>,
        fail: bool,
    }

    impl FakeImages {
        fn calls(&self) -> Vec<(String, GameId)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageCache for FakeImages {
        async fn fetch(&self, url: &str, game_id: GameId) -> Option<String> {
            self.calls.lock().unwrap().push((url.to_string(), game_id));
            if self.fail {
                None
            } else {
                Some(format!("{game_id}.jpg"))
            }
        }
    }

    fn record(id: GameId, start: DateTime<Utc>) -> GameRecord {
        GameRecord {
            id,
            domain: "kovrov.en.cx".into(),
            name: format!("game {id}"),
            author: "author".into(),
            price: "300 руб.".into(),
            link: egw_core::detail_link("kovrov.en.cx", id),
            category: Category::Team,
            capacity: Some(6),
            start_time: start,
            end_time: Some(start + Duration::hours(10)),
            image_source_url: Some(format!("https://kovrov.en.cx/GameImages/{id}.jpg")),
        }
    }

    async fn setup(images: Arc<FakeImages>) -> Reconciler {
        let store = GameStore::in_memory().await.unwrap();
        Reconciler::new(store, images, EngineConfig::default())
    }

    fn march(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 10, 0, 0).single().unwrap()
    }

    async fn announce(r: &Reconciler, id: GameId) {
        let mut game = r.store().get_game(id).await.unwrap().unwrap();
        game.announcement_sent = true;
        game.start_notice_sent = true;
        assert!(r.store().update_game(&game, false).await.unwrap());
    }

    #[tokio::test]
    async fn identical_reingest_is_a_no_op() {
        let images = Arc::new(FakeImages::default());
        let r = setup(images.clone()).await;
        let now = march(1) - Duration::days(10);

        let first = r.upsert(&record(1, march(1)), now).await.unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Created);
        assert_eq!(first.game.image_ref.as_deref(), Some("1.jpg"));

        let before = r.store().get_game(1).await.unwrap();
        let second = r.upsert(&record(1, march(1)), now).await.unwrap();
        assert_eq!(second.outcome, UpsertOutcome::Unchanged);
        assert_eq!(second.reschedule, None);
        assert_eq!(r.store().get_game(1).await.unwrap(), before);
        assert_eq!(images.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_image_keeps_remote_url_for_retry() {
        let images = Arc::new(FakeImages {
            fail: true,
            ..FakeImages::default()
        });
        let r = setup(images).await;
        let report = r.upsert(&record(2, march(1)), march(1) - Duration::days(1)).await.unwrap();
        assert_eq!(report.game.image_ref, None);
        assert_eq!(
            report.game.image_source_url.as_deref(),
            Some("https://kovrov.en.cx/GameImages/2.jpg")
        );
    }

    #[tokio::test]
    async fn image_refetched_only_when_remote_url_changes() {
        let images = Arc::new(FakeImages::default());
        let r = setup(images.clone()).await;
        let now = march(1) - Duration::days(10);
        r.upsert(&record(3, march(1)), now).await.unwrap();

        let mut renamed = record(3, march(1));
        renamed.name = "new name".into();
        r.upsert(&renamed, now).await.unwrap();
        assert_eq!(images.calls().len(), 1);

        let mut new_cover = renamed.clone();
        new_cover.image_source_url = Some("https://kovrov.en.cx/GameImages/3-v2.png".into());
        let report = r.upsert(&new_cover, now).await.unwrap();
        assert_eq!(images.calls().len(), 2);
        assert_eq!(
            report.game.image_source_url.as_deref(),
            Some("https://kovrov.en.cx/GameImages/3-v2.png")
        );
    }

    #[tokio::test]
    async fn large_shift_resets_broadcast_flags() {
        let r = setup(Arc::new(FakeImages::default())).await;
        let now = march(1) - Duration::days(10);
        r.upsert(&record(4, march(1)), now).await.unwrap();
        announce(&r, 4).await;

        let report = r.upsert(&record(4, march(8)), now).await.unwrap();
        assert!(report.flags_reset);
        let stored = r.store().get_game(4).await.unwrap().unwrap();
        assert!(!stored.announcement_sent);
        assert!(!stored.start_notice_sent);
        assert_eq!(stored.start_time, march(8));
        // The game re-enters the pipeline and will be announced afresh.
        assert_eq!(report.reschedule, None);
    }

    #[tokio::test]
    async fn small_shift_keeps_flags_and_notifies_once() {
        let r = setup(Arc::new(FakeImages::default())).await;
        let now = march(1) - Duration::days(10);
        r.upsert(&record(5, march(1)), now).await.unwrap();
        announce(&r, 5).await;

        let report = r.upsert(&record(5, march(2)), now).await.unwrap();
        assert!(!report.flags_reset);
        let stored = r.store().get_game(5).await.unwrap().unwrap();
        assert!(stored.announcement_sent);
        assert!(stored.start_notice_sent);
        let notice = report.reschedule.unwrap();
        assert_eq!(notice.change, ScheduleChange::Both);
        assert_eq!(notice.old_start, march(1));
        assert_eq!(notice.new_start, march(2));
    }

    #[tokio::test]
    async fn end_only_change_yields_end_variant() {
        let r = setup(Arc::new(FakeImages::default())).await;
        let now = march(1) - Duration::days(10);
        r.upsert(&record(6, march(1)), now).await.unwrap();
        announce(&r, 6).await;

        let mut longer = record(6, march(1));
        longer.end_time = Some(march(1) + Duration::hours(20));
        let report = r.upsert(&longer, now).await.unwrap();
        assert_eq!(report.reschedule.map(|n| n.change), Some(ScheduleChange::EndOnly));

        let again = r.upsert(&longer, now).await.unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Unchanged);
        assert_eq!(again.reschedule, None);
    }

    #[tokio::test]
    async fn unannounced_games_get_no_reschedule_notice() {
        let r = setup(Arc::new(FakeImages::default())).await;
        let now = march(1) - Duration::days(10);
        r.upsert(&record(7, march(1)), now).await.unwrap();
        let report = r.upsert(&record(7, march(2)), now).await.unwrap();
        assert_eq!(report.outcome, UpsertOutcome::Updated);
        assert_eq!(report.reschedule, None);
    }

    #[tokio::test]
    async fn absent_optional_fields_keep_stored_values() {
        let r = setup(Arc::new(FakeImages::default())).await;
        let now = march(1) - Duration::days(10);
        r.upsert(&record(8, march(1)), now).await.unwrap();

        let mut degraded = record(8, march(1));
        degraded.end_time = None;
        degraded.capacity = None;
        degraded.image_source_url = None;
        let report = r.upsert(&degraded, now).await.unwrap();
        assert_eq!(report.outcome, UpsertOutcome::Unchanged);
        assert_eq!(report.game.capacity, Some(6));
        assert!(report.game.end_time.is_some());
    }

    fn batch(records: Vec<GameRecord>) -> FeedBatch {
        FeedBatch::from_records(records)
    }

    async fn seed(r: &Reconciler, id: GameId, state: LifecycleState) {
        let mut game = crate::store::tests::sample_game(id, state);
        game.start_time = t0();
        r.store().insert_game(&game).await.unwrap();
    }

    #[tokio::test]
    async fn vanished_active_games_complete_and_cascade() {
        let r = setup(Arc::new(FakeImages::default())).await;
        seed(&r, 10, LifecycleState::Active).await;
        seed(&r, 11, LifecycleState::Active).await;
        let sub = r.store().register_subscriber(1, "n").await.unwrap();
        r.store().subscribe(sub.id, 10).await.unwrap();
        r.store().set_role(sub.id, 10, SearchRole::SeekingGame).await.unwrap();

        let active = batch(vec![record(11, t0())]);
        let upcoming = batch(vec![record(99, t0())]);
        let report = r.reconcile_active_set(&active, &upcoming).await.unwrap();
        assert_eq!(report.completed, vec![10]);
        assert_eq!(r.store().subscription_count(10).await.unwrap(), 0);
        assert!(r.store().role_entries(10).await.unwrap().is_empty());

        let again = r.reconcile_active_set(&active, &upcoming).await.unwrap();
        assert_eq!(again, ActiveSetReport::default());
    }

    #[tokio::test]
    async fn empty_views_never_drive_transitions() {
        let r = setup(Arc::new(FakeImages::default())).await;
        seed(&r, 12, LifecycleState::Active).await;
        seed(&r, 13, LifecycleState::Upcoming).await;

        let report = r
            .reconcile_active_set(&FeedBatch::default(), &FeedBatch::default())
            .await
            .unwrap();
        assert!(report.completion_skipped);
        assert!(report.archival_skipped);
        assert_eq!(
            r.store().get_game(12).await.unwrap().unwrap().lifecycle_state,
            LifecycleState::Active
        );
        assert_eq!(
            r.store().get_game(13).await.unwrap().unwrap().lifecycle_state,
            LifecycleState::Upcoming
        );
    }

    #[tokio::test]
    async fn completion_guard_abort_policy_blocks_mass_completion() {
        let store = GameStore::in_memory().await.unwrap();
        let config = EngineConfig {
            completion_guard: 2,
            completion_policy: CompletionPolicy::Abort,
            ..EngineConfig::default()
        };
        let r = Reconciler::new(store, Arc::new(FakeImages::default()), config);
        for id in 20..23 {
            seed(&r, id, LifecycleState::Active).await;
        }
        let report = r
            .reconcile_active_set(&batch(vec![record(1, t0())]), &batch(vec![record(2, t0())]))
            .await
            .unwrap();
        assert!(report.completion_skipped);
        assert!(report.completed.is_empty());
    }

    #[tokio::test]
    async fn completion_guard_warn_policy_still_proceeds() {
        let store = GameStore::in_memory().await.unwrap();
        let config = EngineConfig {
            completion_guard: 2,
            ..EngineConfig::default()
        };
        let r = Reconciler::new(store, Arc::new(FakeImages::default()), config);
        for id in 20..23 {
            seed(&r, id, LifecycleState::Active).await;
        }
        let report = r
            .reconcile_active_set(&batch(vec![record(1, t0())]), &batch(vec![record(2, t0())]))
            .await
            .unwrap();
        assert_eq!(report.completed, vec![20, 21, 22]);
    }

    #[tokio::test]
    async fn vanished_upcoming_is_promoted_or_archived() {
        let images = Arc::new(FakeImages::default());
        let r = setup(images.clone()).await;
        seed(&r, 30, LifecycleState::Upcoming).await;
        seed(&r, 31, LifecycleState::Upcoming).await;
        let sub = r.store().register_subscriber(1, "n").await.unwrap();
        r.store().subscribe(sub.id, 30).await.unwrap();
        assert!(r
            .store()
            .mark_notice_sent(sub.id, 30, SubscriberNotice::Started)
            .await
            .unwrap());

        let active = batch(vec![record(30, t0())]);
        let upcoming = batch(vec![record(50, t0())]);
        let report = r.reconcile_active_set(&active, &upcoming).await.unwrap();

        assert_eq!(report.promoted, vec![30]);
        assert_eq!(report.archived, vec![31]);
        let promoted = r.store().get_game(30).await.unwrap().unwrap();
        assert_eq!(promoted.lifecycle_state, LifecycleState::Active);
        assert_eq!(promoted.image_ref.as_deref(), Some("30.jpg"));
        assert!(!r.store().subscription(sub.id, 30).await.unwrap().unwrap().started_notified);
        assert_eq!(
            r.store().get_game(31).await.unwrap().unwrap().lifecycle_state,
            LifecycleState::Archived
        );
        assert_eq!(images.calls(), vec![("https://kovrov.en.cx/GameImages/30.jpg".to_string(), 30)]);
    }

    #[tokio::test]
    async fn archival_cap_archives_nothing_when_exceeded() {
        let r = setup(Arc::new(FakeImages::default())).await;
        for id in 40..46 {
            seed(&r, id, LifecycleState::Upcoming).await;
        }
        let report = r
            .reconcile_active_set(&batch(vec![record(1, t0())]), &batch(vec![record(2, t0())]))
            .await
            .unwrap();
        assert!(report.archival_skipped);
        assert!(report.archived.is_empty());
        let upcoming = r
            .store()
            .list_games(&GameQuery::new().state(LifecycleState::Upcoming))
            .await
            .unwrap();
        assert_eq!(upcoming.len(), 6);
    }
}
