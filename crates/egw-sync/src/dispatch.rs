//! Notification dispatcher: entity-level broadcasts and per-subscriber
//! timeline notices. A one-shot flag is set only after a confirmed delivery,
//! with a guarded update outside any send; overlapping runs may repeat a
//! message but never lose one.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use egw_core::{Game, LifecycleState, NotificationWindows, SubscriberNotice};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::messages::Formatter;
use crate::reconcile::RescheduleNotice;
use crate::store::{BroadcastKind, GameQuery, GameStore};
use crate::transport::{DeliveryOutcome, NotificationTransport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub announcements: usize,
    pub start_notices: usize,
    pub subscriber_notices: usize,
    pub blocked: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: GameStore,
    transport: Arc<dyn NotificationTransport>,
    chats: Vec<i64>,
    formatter: Formatter,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        store: GameStore,
        transport: Arc<dyn NotificationTransport>,
        chats: Vec<i64>,
        formatter: Formatter,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            chats,
            formatter,
            config,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let announcements = self
            .broadcast_due(BroadcastKind::Announcement, now, &mut report)
            .await?;
        let start_notices = self
            .broadcast_due(BroadcastKind::StartNotice, now, &mut report)
            .await?;
        report.announcements = announcements;
        report.start_notices = start_notices;
        self.notify_subscribers(now, &mut report).await?;
        info!(
            announcements = report.announcements,
            start_notices = report.start_notices,
            subscriber_notices = report.subscriber_notices,
            blocked = report.blocked,
            failed = report.failed,
            "dispatch finished"
        );
        Ok(report)
    }

    fn lookahead(&self, kind: BroadcastKind) -> chrono::Duration {
        match kind {
            BroadcastKind::Announcement => self.config.announcement_lookahead,
            BroadcastKind::StartNotice => self.config.start_notice_lookahead,
        }
    }

    /// Sends `text` to every configured chat. Returns how many confirmed.
    async fn fan_out(&self, text: &str, report: &mut DispatchReport) -> usize {
        let mut delivered = 0;
        for chat in &self.chats {
            match self.transport.send(*chat, text).await {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::Blocked => {
                    warn!(chat, "broadcast chat refused the bot");
                    report.blocked += 1;
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(chat, %reason, "broadcast delivery failed");
                    report.failed += 1;
                }
            }
        }
        delivered
    }

    async fn broadcast_due(
        &self,
        kind: BroadcastKind,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<usize> {
        let due = self
            .store
            .list_games(
                &GameQuery::new()
                    .states(&[LifecycleState::Upcoming, LifecycleState::Active])
                    .flag(kind, false)
                    .start_at_most(now + self.lookahead(kind)),
            )
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        if self.chats.is_empty() {
            warn!(kind = kind.as_str(), pending = due.len(), "no broadcast chats configured");
            return Ok(0);
        }

        let mut sent = 0;
        for game in due {
            let text = self.formatter.broadcast(kind, &game);
            if self.fan_out(&text, report).await == 0 {
                continue;
            }
            if self.store.mark_broadcast_sent(game.id, kind).await? {
                info!(game_id = game.id, kind = kind.as_str(), "broadcast sent");
                sent += 1;
            } else {
                debug!(game_id = game.id, kind = kind.as_str(), "flag already set by an overlapping run");
            }
        }
        Ok(sent)
    }

    /// Reschedule notices carry no flag; the reconciler emits each at most
    /// once per actual change.
    pub async fn broadcast_reschedule(&self, game: &Game, notice: &RescheduleNotice) -> Result<bool> {
        if self.chats.is_empty() {
            warn!(game_id = game.id, "no broadcast chats configured; reschedule notice dropped");
            return Ok(false);
        }
        let mut scratch = DispatchReport::default();
        let text = self.formatter.reschedule(game, notice);
        let delivered = self.fan_out(&text, &mut scratch).await;
        info!(game_id = game.id, change = ?notice.change, delivered, "reschedule notice sent");
        Ok(delivered > 0)
    }

    async fn notify_subscribers(&self, now: DateTime<Utc>, report: &mut DispatchReport) -> Result<()> {
        let games = self
            .store
            .list_games(&GameQuery::new().state(LifecycleState::Active).has_end_time())
            .await?;
        for game in games {
            let Some(end) = game.end_time else { continue };
            let windows = NotificationWindows::for_game(game.start_time, end, &self.config.windows);
            for notice in windows.due(now) {
                self.notify_window(&game, notice, report).await?;
            }
        }
        Ok(())
    }

    async fn notify_window(
        &self,
        game: &Game,
        notice: SubscriberNotice,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let recipients = self.store.pending_recipients(game.id, notice).await?;
        if recipients.is_empty() {
            return Ok(());
        }
        let text = self.formatter.subscriber_notice(notice, game);
        for subscriber in recipients {
            match self.transport.send(subscriber.external_id, &text).await {
                DeliveryOutcome::Delivered => {
                    if self
                        .store
                        .mark_notice_sent(subscriber.id, game.id, notice)
                        .await?
                    {
                        report.subscriber_notices += 1;
                    }
                }
                DeliveryOutcome::Blocked => {
                    self.store.mark_blocked(subscriber.id).await?;
                    info!(subscriber_id = subscriber.id, "subscriber blocked the bot");
                    report.blocked += 1;
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(
                        subscriber_id = subscriber.id,
                        game_id = game.id,
                        notice = notice.as_str(),
                        %reason,
                        "subscriber notice failed"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{sample_game, t0};
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use chrono::{Duration, FixedOffset};
    use std::sync::Mutex;

    const CHAT: i64 = -100;

    /// Promotes game 2 from inside every send, the way an overlapping sweep
    /// would, and records whether that write went through.
    struct WritingTransport {
        store: GameStore,
        writes: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl NotificationTransport for WritingTransport {
        async fn send(&self, _target: i64, _html: &str) -> DeliveryOutcome {
            let ok = self
                .store
                .transition_state(2, LifecycleState::Upcoming, LifecycleState::Active)
                .await
                .is_ok();
            self.writes.lock().unwrap().push(ok);
            DeliveryOutcome::Delivered
        }
    }

    fn dispatcher(store: GameStore, transport: Arc<MemoryTransport>, chats: Vec<i64>) -> Dispatcher {
        Dispatcher::new(
            store,
            transport,
            chats,
            Formatter::new(FixedOffset::east_opt(3 * 3600).unwrap()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn announcement_goes_out_once_within_lookahead() {
        let store = GameStore::in_memory().await.unwrap();
        store.insert_game(&sample_game(1, LifecycleState::Upcoming)).await.unwrap();
        let mut far = sample_game(2, LifecycleState::Upcoming);
        far.start_time = t0() + Duration::days(30);
        store.insert_game(&far).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let d = dispatcher(store.clone(), transport.clone(), vec![CHAT]);

        let now = t0() - Duration::days(4);
        let report = d.run(now).await.unwrap();
        assert_eq!(report.announcements, 1);
        assert_eq!(report.start_notices, 0);
        assert!(store.get_game(1).await.unwrap().unwrap().announcement_sent);
        assert!(!store.get_game(2).await.unwrap().unwrap().announcement_sent);

        let again = d.run(now).await.unwrap();
        assert_eq!(again.announcements, 0);
        assert_eq!(transport.sent_to(CHAT).len(), 1);
    }

    #[tokio::test]
    async fn failed_broadcast_leaves_flag_for_retry() {
        let store = GameStore::in_memory().await.unwrap();
        store.insert_game(&sample_game(1, LifecycleState::Upcoming)).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.script(CHAT, DeliveryOutcome::Failed("timeout".into()));
        let d = dispatcher(store.clone(), transport.clone(), vec![CHAT]);

        let now = t0() - Duration::hours(1);
        let report = d.run(now).await.unwrap();
        assert_eq!(report.announcements, 0);
        assert_eq!(report.failed, 2);
        let game = store.get_game(1).await.unwrap().unwrap();
        assert!(!game.announcement_sent);
        assert!(!game.start_notice_sent);

        transport.script(CHAT, DeliveryOutcome::Delivered);
        let report = d.run(now).await.unwrap();
        assert_eq!((report.announcements, report.start_notices), (1, 1));
    }

    #[tokio::test]
    async fn terminal_games_are_never_broadcast() {
        let store = GameStore::in_memory().await.unwrap();
        store.insert_game(&sample_game(1, LifecycleState::Archived)).await.unwrap();
        store.insert_game(&sample_game(2, LifecycleState::Completed)).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let d = dispatcher(store, transport.clone(), vec![CHAT]);
        d.run(t0() - Duration::hours(1)).await.unwrap();
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn without_chats_flags_stay_unset() {
        let store = GameStore::in_memory().await.unwrap();
        store.insert_game(&sample_game(1, LifecycleState::Upcoming)).await.unwrap();
        let d = dispatcher(store.clone(), Arc::new(MemoryTransport::new()), Vec::new());
        let report = d.run(t0() - Duration::hours(1)).await.unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(!store.get_game(1).await.unwrap().unwrap().announcement_sent);
    }

    #[tokio::test]
    async fn equator_notice_is_one_shot_within_window() {
        let store = GameStore::in_memory().await.unwrap();
        store.insert_game(&sample_game(3, LifecycleState::Active)).await.unwrap();
        let sub = store.register_subscriber(500, "n").await.unwrap();
        store.subscribe(sub.id, 3).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let d = dispatcher(store.clone(), transport.clone(), Vec::new());

        let equator = t0() + Duration::hours(5);
        assert_eq!(d.run(equator).await.unwrap().subscriber_notices, 1);
        assert_eq!(d.run(equator + Duration::minutes(30)).await.unwrap().subscriber_notices, 0);
        assert_eq!(transport.sent_to(500).len(), 1);
        assert!(store.subscription(sub.id, 3).await.unwrap().unwrap().equator_notified);
    }

    #[tokio::test]
    async fn blocked_delivery_marks_subscriber_and_keeps_flag_unset() {
        let store = GameStore::in_memory().await.unwrap();
        store.insert_game(&sample_game(4, LifecycleState::Active)).await.unwrap();
        let gone = store.register_subscriber(600, "gone").await.unwrap();
        let here = store.register_subscriber(601, "here").await.unwrap();
        store.subscribe(gone.id, 4).await.unwrap();
        store.subscribe(here.id, 4).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.script(600, DeliveryOutcome::Blocked);
        let d = dispatcher(store.clone(), transport.clone(), Vec::new());

        let report = d.run(t0()).await.unwrap();
        assert_eq!(report.subscriber_notices, 1);
        assert_eq!(report.blocked, 1);
        assert!(store.subscriber_by_external_id(600).await.unwrap().unwrap().blocked);
        assert!(!store.subscription(gone.id, 4).await.unwrap().unwrap().started_notified);
        assert!(store.subscription(here.id, 4).await.unwrap().unwrap().started_notified);
    }

    #[tokio::test]
    async fn games_without_end_get_no_subscriber_notices() {
        let store = GameStore::in_memory().await.unwrap();
        let mut open_ended = sample_game(5, LifecycleState::Active);
        open_ended.end_time = None;
        store.insert_game(&open_ended).await.unwrap();
        let sub = store.register_subscriber(700, "n").await.unwrap();
        store.subscribe(sub.id, 5).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let d = dispatcher(store, transport.clone(), Vec::new());
        d.run(t0()).await.unwrap();
        assert!(transport.sent_to(700).is_empty());
    }

    #[tokio::test]
    async fn store_stays_writable_while_a_broadcast_is_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("egw.db").display());
        let store = GameStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store.insert_game(&sample_game(1, LifecycleState::Upcoming)).await.unwrap();
        let mut later = sample_game(2, LifecycleState::Upcoming);
        later.start_time = t0() + Duration::days(30);
        store.insert_game(&later).await.unwrap();

        let transport = Arc::new(WritingTransport {
            store: store.clone(),
            writes: Mutex::new(Vec::new()),
        });
        let d = Dispatcher::new(
            store.clone(),
            transport.clone(),
            vec![CHAT],
            Formatter::new(FixedOffset::east_opt(3 * 3600).unwrap()),
            EngineConfig::default(),
        );

        let report = d.run(t0() - Duration::days(4)).await.unwrap();
        assert_eq!(report.announcements, 1);
        assert_eq!(*transport.writes.lock().unwrap(), vec![true]);
        assert!(store.get_game(1).await.unwrap().unwrap().announcement_sent);
        assert_eq!(
            store.get_game(2).await.unwrap().unwrap().lifecycle_state,
            LifecycleState::Active
        );
    }

    #[tokio::test]
    async fn subscriber_flag_is_set_only_after_delivery() {
        let store = GameStore::in_memory().await.unwrap();
        store.insert_game(&sample_game(6, LifecycleState::Active)).await.unwrap();
        let sub = store.register_subscriber(800, "n").await.unwrap();
        store.subscribe(sub.id, 6).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.script(800, DeliveryOutcome::Failed("timeout".into()));
        let d = dispatcher(store.clone(), transport.clone(), Vec::new());

        assert_eq!(d.run(t0()).await.unwrap().failed, 1);
        assert!(!store.subscription(sub.id, 6).await.unwrap().unwrap().started_notified);

        transport.script(800, DeliveryOutcome::Delivered);
        assert_eq!(d.run(t0()).await.unwrap().subscriber_notices, 1);
        assert!(store.subscription(sub.id, 6).await.unwrap().unwrap().started_notified);
    }
}
