//! SQLite entity store: games, subscribers, subscriptions and role searches.
//!
//! Every game update is a compare-and-set on the `revision` column; lifecycle
//! transitions additionally guard on the state they leave.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use egw_core::{
    Game, GameId, LifecycleState, RoleSearchEntry, SearchRole, Subscriber, SubscriberId,
    SubscriberNotice, Subscription,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

const GAME_COLUMNS: &str = "id, domain, name, author, price, link, category, capacity, \
     start_time, end_time, lifecycle_state, announcement_sent, start_notice_sent, \
     image_ref, image_source_url, revision, created_at";

const OPEN_GAME_CHECK: &str =
    "SELECT 1 FROM games WHERE id = ? AND lifecycle_state IN ('upcoming', 'active')";

/// Entity-level one-shot broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    Announcement,
    StartNotice,
}

impl BroadcastKind {
    pub fn flag_column(self) -> &'static str {
        match self {
            Self::Announcement => "announcement_sent",
            Self::StartNotice => "start_notice_sent",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Announcement => "announcement",
            Self::StartNotice => "start_notice",
        }
    }
}

/// One predicate of a game listing query.
#[derive(Debug, Clone, PartialEq)]
pub enum GameFilter {
    StateIn(Vec<LifecycleState>),
    FlagEquals(BroadcastKind, bool),
    StartAtMost(DateTime<Utc>),
    StartAtLeast(DateTime<Utc>),
    HasEndTime,
}

/// Conjunction of filters, rendered with bound parameters only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameQuery {
    filters: Vec<GameFilter>,
}

impl GameQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(self, state: LifecycleState) -> Self {
        self.states(&[state])
    }

    pub fn states(mut self, states: &[LifecycleState]) -> Self {
        self.filters.push(GameFilter::StateIn(states.to_vec()));
        self
    }

    pub fn flag(mut self, kind: BroadcastKind, value: bool) -> Self {
        self.filters.push(GameFilter::FlagEquals(kind, value));
        self
    }

    pub fn start_at_most(mut self, at: DateTime<Utc>) -> Self {
        self.filters.push(GameFilter::StartAtMost(at));
        self
    }

    pub fn start_at_least(mut self, at: DateTime<Utc>) -> Self {
        self.filters.push(GameFilter::StartAtLeast(at));
        self
    }

    pub fn has_end_time(mut self) -> Self {
        self.filters.push(GameFilter::HasEndTime);
        self
    }

    pub fn filters(&self) -> &[GameFilter] {
        &self.filters
    }

    fn to_builder(&self) -> QueryBuilder<'_, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT {GAME_COLUMNS} FROM games WHERE 1 = 1"));
        for filter in &self.filters {
            match filter {
                GameFilter::StateIn(states) if states.is_empty() => {
                    qb.push(" AND 1 = 0");
                }
                GameFilter::StateIn(states) => {
                    qb.push(" AND lifecycle_state IN (");
                    let mut list = qb.separated(", ");
                    for state in states {
                        list.push_bind(state.as_str());
                    }
                    list.push_unseparated(")");
                }
                GameFilter::FlagEquals(kind, value) => {
                    qb.push(format!(" AND {} = ", kind.flag_column()))
                        .push_bind(*value);
                }
                GameFilter::StartAtMost(at) => {
                    qb.push(" AND start_time <= ").push_bind(*at);
                }
                GameFilter::StartAtLeast(at) => {
                    qb.push(" AND start_time >= ").push_bind(*at);
                }
                GameFilter::HasEndTime => {
                    qb.push(" AND end_time IS NOT NULL");
                }
            }
        }
        qb.push(" ORDER BY start_time, id");
        qb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
    GameMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    NotSubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    Set,
    Switched,
    Unchanged,
    GameMissing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub seeking_game: i64,
    pub seeking_team: i64,
}

#[derive(Debug, Clone)]
pub struct GameStore {
    pool: SqlitePool,
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .with_context(|| format!("decoding column {column}"))
}

fn game_from_row(row: &SqliteRow) -> Result<Game> {
    Ok(Game {
        id: row.try_get("id")?,
        domain: row.try_get("domain")?,
        name: row.try_get("name")?,
        author: row.try_get("author")?,
        price: row.try_get("price")?,
        link: row.try_get("link")?,
        category: parse_column(row, "category")?,
        capacity: row.try_get("capacity")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        lifecycle_state: parse_column(row, "lifecycle_state")?,
        announcement_sent: row.try_get("announcement_sent")?,
        start_notice_sent: row.try_get("start_notice_sent")?,
        image_ref: row.try_get("image_ref")?,
        image_source_url: row.try_get("image_source_url")?,
        revision: row.try_get("revision")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscriber_from_row(row: &SqliteRow) -> Result<Subscriber> {
    Ok(Subscriber {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        nickname: row.try_get("nickname")?,
        blocked: row.try_get("blocked")?,
    })
}

async fn delete_dependents(tx: &mut Transaction<'_, Sqlite>, game_id: GameId) -> Result<()> {
    sqlx::query("DELETE FROM subscriptions WHERE game_id = ?")
        .bind(game_id)
        .execute(&mut **tx)
        .await
        .context("deleting subscriptions")?;
    sqlx::query("DELETE FROM role_searches WHERE game_id = ?")
        .bind(game_id)
        .execute(&mut **tx)
        .await
        .context("deleting role searches")?;
    Ok(())
}

async fn reset_subscription_flags(tx: &mut Transaction<'_, Sqlite>, game_id: GameId) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
           SET started_notified = 0,
               equator_notified = 0,
               near_end_notified = 0
         WHERE game_id = ?
        "#,
    )
    .bind(game_id)
    .execute(&mut **tx)
    .await
    .context("resetting subscription flags")?;
    Ok(result.rows_affected())
}

impl GameStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database, migrated. Each call is isolated.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    // --- games -----------------------------------------------------------

    pub async fn get_game(&self, id: GameId) -> Result<Option<Game>> {
        let row = sqlx::query(&format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading game {id}"))?;
        row.as_ref().map(game_from_row).transpose()
    }

    /// True while the game is UPCOMING or ACTIVE. Completed and archived rows
    /// stay in the table but no longer take subscriptions or role searches.
    pub async fn is_open_game(&self, id: GameId) -> Result<bool> {
        let row = sqlx::query(OPEN_GAME_CHECK)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_games(&self, query: &GameQuery) -> Result<Vec<Game>> {
        let mut qb = query.to_builder();
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("listing games")?;
        rows.iter().map(game_from_row).collect()
    }

    /// Inserts a new row. Returns false when the id already exists.
    pub async fn insert_game(&self, game: &Game) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO games (
                id, domain, name, author, price, link, category, capacity,
                start_time, end_time, lifecycle_state, announcement_sent, start_notice_sent,
                image_ref, image_source_url, revision, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(game.id)
        .bind(&game.domain)
        .bind(&game.name)
        .bind(&game.author)
        .bind(&game.price)
        .bind(&game.link)
        .bind(game.category.as_str())
        .bind(game.capacity)
        .bind(game.start_time)
        .bind(game.end_time)
        .bind(game.lifecycle_state.as_str())
        .bind(game.announcement_sent)
        .bind(game.start_notice_sent)
        .bind(&game.image_ref)
        .bind(&game.image_source_url)
        .bind(game.created_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting game {}", game.id))?;
        Ok(result.rows_affected() == 1)
    }

    /// Writes every mutable column of `game` if the stored revision still
    /// equals `game.revision`. Optionally resets the game's subscription flags
    /// in the same transaction. Returns false on a lost race.
    pub async fn update_game(&self, game: &Game, reset_subscriptions: bool) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("beginning game update")?;
        let result = sqlx::query(
            r#"
            UPDATE games
               SET domain = ?, name = ?, author = ?, price = ?, link = ?, category = ?,
                   capacity = ?, start_time = ?, end_time = ?, lifecycle_state = ?,
                   announcement_sent = ?, start_notice_sent = ?,
                   image_ref = ?, image_source_url = ?,
                   revision = revision + 1, updated_at = ?
             WHERE id = ? AND revision = ?
            "#,
        )
        .bind(&game.domain)
        .bind(&game.name)
        .bind(&game.author)
        .bind(&game.price)
        .bind(&game.link)
        .bind(game.category.as_str())
        .bind(game.capacity)
        .bind(game.start_time)
        .bind(game.end_time)
        .bind(game.lifecycle_state.as_str())
        .bind(game.announcement_sent)
        .bind(game.start_notice_sent)
        .bind(&game.image_ref)
        .bind(&game.image_source_url)
        .bind(Utc::now())
        .bind(game.id)
        .bind(game.revision)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("updating game {}", game.id))?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        if reset_subscriptions {
            reset_subscription_flags(&mut tx, game.id).await?;
        }
        tx.commit().await.context("committing game update")?;
        Ok(true)
    }

    /// Moves `id` from `from` to `to` if it is still in `from`.
    pub async fn transition_state(
        &self,
        id: GameId,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE games
               SET lifecycle_state = ?, revision = revision + 1, updated_at = ?
             WHERE id = ? AND lifecycle_state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("transitioning game {id} {from} -> {to}"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition_and_cascade(
        &self,
        id: GameId,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE games
               SET lifecycle_state = ?, revision = revision + 1, updated_at = ?
             WHERE id = ? AND lifecycle_state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("transitioning game {id} {from} -> {to}"))?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        delete_dependents(&mut tx, id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// `from -> COMPLETED`, deleting the game's subscriptions and role rows.
    pub async fn complete_and_cascade(&self, id: GameId, from: LifecycleState) -> Result<bool> {
        self.transition_and_cascade(id, from, LifecycleState::Completed)
            .await
    }

    /// `UPCOMING -> ARCHIVED`, deleting the game's subscriptions and role rows.
    pub async fn archive_and_cascade(&self, id: GameId) -> Result<bool> {
        self.transition_and_cascade(id, LifecycleState::Upcoming, LifecycleState::Archived)
            .await
    }

    /// Records a delivered broadcast. A single guarded statement, run only
    /// after the send, so no write lock is held across network I/O.
    /// Returns false when an overlapping dispatch already set the flag.
    pub async fn mark_broadcast_sent(&self, id: GameId, kind: BroadcastKind) -> Result<bool> {
        let column = kind.flag_column();
        let result = sqlx::query(&format!(
            "UPDATE games SET {column} = 1, revision = revision + 1 WHERE id = ? AND {column} = 0"
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking {} sent for game {id}", kind.as_str()))?;
        Ok(result.rows_affected() == 1)
    }

    // --- subscribers -----------------------------------------------------

    /// Registers a chat identity, refreshing the nickname on re-registration.
    pub async fn register_subscriber(&self, external_id: i64, nickname: &str) -> Result<Subscriber> {
        sqlx::query(
            r#"
            INSERT INTO subscribers (external_id, nickname, blocked, created_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT (external_id) DO UPDATE SET nickname = excluded.nickname
            "#,
        )
        .bind(external_id)
        .bind(nickname)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("registering subscriber {external_id}"))?;

        self.subscriber_by_external_id(external_id)
            .await?
            .with_context(|| format!("subscriber {external_id} vanished after upsert"))
    }

    pub async fn subscriber_by_external_id(&self, external_id: i64) -> Result<Option<Subscriber>> {
        let row = sqlx::query(
            "SELECT id, external_id, nickname, blocked FROM subscribers WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    pub async fn mark_blocked(&self, subscriber_id: SubscriberId) -> Result<()> {
        sqlx::query("UPDATE subscribers SET blocked = 1 WHERE id = ?")
            .bind(subscriber_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("blocking subscriber {subscriber_id}"))?;
        Ok(())
    }

    /// Returns true when the subscriber was blocked before the call.
    pub async fn unblock(&self, subscriber_id: SubscriberId) -> Result<bool> {
        let result = sqlx::query("UPDATE subscribers SET blocked = 0 WHERE id = ? AND blocked = 1")
            .bind(subscriber_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // --- subscriptions ---------------------------------------------------

    /// The insert re-checks the game state in the same statement, so a
    /// completion cascade running concurrently cannot leave an orphan row.
    pub async fn subscribe(&self, subscriber_id: SubscriberId, game_id: GameId) -> Result<SubscribeOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (subscriber_id, game_id)
            SELECT ?, id FROM games
             WHERE id = ? AND lifecycle_state IN ('upcoming', 'active')
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(subscriber_id)
        .bind(game_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("subscribing {subscriber_id} to game {game_id}"))?;
        if result.rows_affected() == 1 {
            return Ok(SubscribeOutcome::Subscribed);
        }
        Ok(if self.is_open_game(game_id).await? {
            SubscribeOutcome::AlreadySubscribed
        } else {
            SubscribeOutcome::GameMissing
        })
    }

    pub async fn unsubscribe(&self, subscriber_id: SubscriberId, game_id: GameId) -> Result<UnsubscribeOutcome> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE subscriber_id = ? AND game_id = ?")
            .bind(subscriber_id)
            .bind(game_id)
            .execute(&self.pool)
            .await?;
        Ok(if result.rows_affected() == 1 {
            UnsubscribeOutcome::Unsubscribed
        } else {
            UnsubscribeOutcome::NotSubscribed
        })
    }

    pub async fn subscription(&self, subscriber_id: SubscriberId, game_id: GameId) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            r#"
            SELECT subscriber_id, game_id, started_notified, equator_notified, near_end_notified
              FROM subscriptions
             WHERE subscriber_id = ? AND game_id = ?
            "#,
        )
        .bind(subscriber_id)
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<Subscription> {
            Ok(Subscription {
                subscriber_id: row.try_get("subscriber_id")?,
                game_id: row.try_get("game_id")?,
                started_notified: row.try_get("started_notified")?,
                equator_notified: row.try_get("equator_notified")?,
                near_end_notified: row.try_get("near_end_notified")?,
            })
        })
        .transpose()
    }

    pub async fn subscription_count(&self, game_id: GameId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM subscriptions WHERE game_id = ?")
            .bind(game_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn subscribed_games(&self, subscriber_id: SubscriberId) -> Result<Vec<Game>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {cols}
              FROM games g
              JOIN subscriptions s ON s.game_id = g.id
             WHERE s.subscriber_id = ?
             ORDER BY g.start_time, g.id
            "#,
            cols = GAME_COLUMNS
                .split(", ")
                .map(|c| format!("g.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await
        .context("listing subscribed games")?;
        rows.iter().map(game_from_row).collect()
    }

    /// Unblocked subscribers of `game_id` whose flag for `notice` is unset.
    pub async fn pending_recipients(&self, game_id: GameId, notice: SubscriberNotice) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT u.id, u.external_id, u.nickname, u.blocked
              FROM subscriptions s
              JOIN subscribers u ON u.id = s.subscriber_id
             WHERE s.game_id = ? AND s.{flag} = 0 AND u.blocked = 0
             ORDER BY u.id
            "#,
            flag = notice.flag_column()
        ))
        .bind(game_id)
        .fetch_all(&self.pool)
        .await
        .context("selecting notification recipients")?;
        rows.iter().map(subscriber_from_row).collect()
    }

    /// Subscriber-level counterpart of [`GameStore::mark_broadcast_sent`].
    pub async fn mark_notice_sent(
        &self,
        subscriber_id: SubscriberId,
        game_id: GameId,
        notice: SubscriberNotice,
    ) -> Result<bool> {
        let column = notice.flag_column();
        let result = sqlx::query(&format!(
            "UPDATE subscriptions SET {column} = 1 \
             WHERE subscriber_id = ? AND game_id = ? AND {column} = 0"
        ))
        .bind(subscriber_id)
        .bind(game_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking {} sent for subscriber {subscriber_id}", notice.as_str()))?;
        Ok(result.rows_affected() == 1)
    }

    // --- role searches ---------------------------------------------------

    pub async fn set_role(&self, subscriber_id: SubscriberId, game_id: GameId, role: SearchRole) -> Result<RoleOutcome> {
        if !self.is_open_game(game_id).await? {
            return Ok(RoleOutcome::GameMissing);
        }
        let previous = self.role_of(subscriber_id, game_id).await?;
        if previous == Some(role) {
            return Ok(RoleOutcome::Unchanged);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO role_searches (subscriber_id, game_id, role)
            SELECT ?, id, ? FROM games
             WHERE id = ? AND lifecycle_state IN ('upcoming', 'active')
            ON CONFLICT (subscriber_id, game_id) DO UPDATE SET role = excluded.role
            "#,
        )
        .bind(subscriber_id)
        .bind(role.as_str())
        .bind(game_id)
        .execute(&self.pool)
        .await
        .context("saving role search")?;
        Ok(if result.rows_affected() == 0 {
            RoleOutcome::GameMissing
        } else if previous.is_some() {
            RoleOutcome::Switched
        } else {
            RoleOutcome::Set
        })
    }

    pub async fn clear_role(&self, subscriber_id: SubscriberId, game_id: GameId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM role_searches WHERE subscriber_id = ? AND game_id = ?")
            .bind(subscriber_id)
            .bind(game_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn role_of(&self, subscriber_id: SubscriberId, game_id: GameId) -> Result<Option<SearchRole>> {
        let row = sqlx::query("SELECT role FROM role_searches WHERE subscriber_id = ? AND game_id = ?")
            .bind(subscriber_id)
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| parse_column(r, "role")).transpose()
    }

    pub async fn role_entries(&self, game_id: GameId) -> Result<Vec<RoleSearchEntry>> {
        let rows = sqlx::query(
            "SELECT subscriber_id, game_id, role FROM role_searches WHERE game_id = ? ORDER BY subscriber_id",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<RoleSearchEntry> {
                Ok(RoleSearchEntry {
                    subscriber_id: row.try_get("subscriber_id")?,
                    game_id: row.try_get("game_id")?,
                    role: parse_column(row, "role")?,
                })
            })
            .collect()
    }

    pub async fn nicknames_with_role(&self, game_id: GameId, role: SearchRole) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT u.nickname
              FROM role_searches r
              JOIN subscribers u ON u.id = r.subscriber_id
             WHERE r.game_id = ? AND r.role = ?
             ORDER BY u.nickname
            "#,
        )
        .bind(game_id)
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<String> { Ok(row.try_get("nickname")?) })
            .collect()
    }

    pub async fn role_counts(&self, game_id: GameId) -> Result<RoleCounts> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(role = 'seeking_game'), 0) AS seeking_game,
                   COALESCE(SUM(role = 'seeking_team'), 0) AS seeking_team
              FROM role_searches
             WHERE game_id = ?
            "#,
        )
        .bind(game_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(RoleCounts {
            seeking_game: row.try_get("seeking_game")?,
            seeking_team: row.try_get("seeking_team")?,
        })
    }
}
