//! Chat command parsing and the request pipeline behind the bot.
//!
//! Requests pass through an ordered middleware chain before reaching a
//! handler; any middleware may answer on its own and stop the chain.

use anyhow::Result;
use async_trait::async_trait;
use egw_core::{GameId, LifecycleState, SearchRole, Subscriber};
use thiserror::Error;
use tracing::{debug, info};

use crate::messages::{role_summary, Formatter, MAX_MESSAGE_LEN};
use crate::store::{
    BroadcastKind, GameQuery, GameStore, RoleOutcome, SubscribeOutcome, UnsubscribeOutcome,
};

pub const NOT_REGISTERED: &str = "❌ Для начала работы нажмите /start";
pub const GREETING: &str = "Привет! 👋\n🤖 Enc bot. Чем могу помочь?";
const NO_UPCOMING: &str = "На данный момент нет предстоящих игр.";
const NO_ACTIVE: &str = "На данный момент нет активных игр.";
const NO_SUBSCRIPTIONS: &str = "У вас нет подписок.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Subscribe(GameId),
    Unsubscribe(GameId),
    MySubscriptions,
    SeekRole(GameId, SearchRole),
    CancelRole(GameId),
    Upcoming,
    Active,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("/{command} needs {expected}")]
    MissingArgument {
        command: &'static str,
        expected: &'static str,
    },
    #[error("/{command}: cannot parse {value:?}")]
    InvalidArgument { command: &'static str, value: String },
}

impl CommandError {
    /// Reply shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unknown(_) => "Неизвестная команда. Список команд: /help".to_string(),
            Self::MissingArgument { command, expected } => {
                format!("Использование: /{command} <{expected}>")
            }
            Self::InvalidArgument { command, value } => {
                format!("Не удалось разобрать «{value}» для /{command}.")
            }
        }
    }
}

fn game_id_arg(command: &'static str, arg: Option<&str>) -> Result<GameId, CommandError> {
    let raw = arg.ok_or(CommandError::MissingArgument {
        command,
        expected: "id игры",
    })?;
    raw.parse().map_err(|_| CommandError::InvalidArgument {
        command,
        value: raw.to_string(),
    })
}

fn role_arg(raw: Option<&str>) -> Result<SearchRole, CommandError> {
    let raw = raw.ok_or(CommandError::MissingArgument {
        command: "seek_role",
        expected: "id игры> <player|team",
    })?;
    match raw.to_lowercase().as_str() {
        "player" | "игрок" | "seeking_game" => Ok(SearchRole::SeekingGame),
        "team" | "команда" | "seeking_team" => Ok(SearchRole::SeekingTeam),
        _ => Err(CommandError::InvalidArgument {
            command: "seek_role",
            value: raw.to_string(),
        }),
    }
}

impl Command {
    /// Parses `/name[@bot] [args..]`.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let mut parts = text.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let name = head
            .strip_prefix('/')
            .ok_or_else(|| CommandError::Unknown(head.to_string()))?;
        let name = name.split('@').next().unwrap_or_default();
        match name {
            "start" => Ok(Self::Start),
            "help" => Ok(Self::Help),
            "subscribe" => Ok(Self::Subscribe(game_id_arg("subscribe", parts.next())?)),
            "unsubscribe" => Ok(Self::Unsubscribe(game_id_arg("unsubscribe", parts.next())?)),
            "my_subscriptions" => Ok(Self::MySubscriptions),
            "seek_role" => {
                let id = game_id_arg("seek_role", parts.next())?;
                Ok(Self::SeekRole(id, role_arg(parts.next())?))
            }
            "cancel_role" => Ok(Self::CancelRole(game_id_arg("cancel_role", parts.next())?)),
            "upcoming" => Ok(Self::Upcoming),
            "active" => Ok(Self::Active),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Help => "help",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::MySubscriptions => "my_subscriptions",
            Self::SeekRole(..) => "seek_role",
            Self::CancelRole(_) => "cancel_role",
            Self::Upcoming => "upcoming",
            Self::Active => "active",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Chat identity of the caller.
    pub external_id: i64,
    pub nickname: String,
    pub command: Command,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub messages: Vec<String>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![text.into()],
        }
    }
}

/// What a middleware decided about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Respond(Reply),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before(&self, store: &GameStore, request: &Request) -> Result<Flow>;
}

/// Answers every command but `/start` with a fixed message until the caller
/// has registered.
pub struct RequireRegistered;

#[async_trait]
impl Middleware for RequireRegistered {
    async fn before(&self, store: &GameStore, request: &Request) -> Result<Flow> {
        if matches!(request.command, Command::Start | Command::Help) {
            return Ok(Flow::Continue);
        }
        match store.subscriber_by_external_id(request.external_id).await? {
            Some(_) => Ok(Flow::Continue),
            None => Ok(Flow::Respond(Reply::text(NOT_REGISTERED))),
        }
    }
}

/// A subscriber writing to the bot is reachable again.
pub struct ReactivateSubscriber;

#[async_trait]
impl Middleware for ReactivateSubscriber {
    async fn before(&self, store: &GameStore, request: &Request) -> Result<Flow> {
        if let Some(subscriber) = store.subscriber_by_external_id(request.external_id).await? {
            if subscriber.blocked && store.unblock(subscriber.id).await? {
                info!(subscriber_id = subscriber.id, "subscriber reachable again; unblocked");
            }
        }
        Ok(Flow::Continue)
    }
}

pub struct CommandPipeline {
    store: GameStore,
    formatter: Formatter,
    middleware: Vec<Box<dyn Middleware>>,
}

impl CommandPipeline {
    /// Pipeline with the registration guard followed by reactivation.
    pub fn new(store: GameStore, formatter: Formatter) -> Self {
        Self {
            store,
            formatter,
            middleware: vec![Box::new(RequireRegistered), Box::new(ReactivateSubscriber)],
        }
    }

    pub fn with_middleware(mut self, middleware: Box<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Parses and handles raw message text.
    pub async fn handle_text(&self, external_id: i64, nickname: &str, text: &str) -> Result<Reply> {
        match Command::parse(text) {
            Ok(command) => {
                self.handle(Request {
                    external_id,
                    nickname: nickname.to_string(),
                    command,
                })
                .await
            }
            Err(err) => {
                debug!(external_id, error = %err, "unparsable command");
                Ok(Reply::text(err.user_message()))
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Result<Reply> {
        for middleware in &self.middleware {
            if let Flow::Respond(reply) = middleware.before(&self.store, &request).await? {
                return Ok(reply);
            }
        }
        debug!(external_id = request.external_id, command = request.command.name(), "handling command");

        match request.command {
            Command::Start => {
                self.store
                    .register_subscriber(request.external_id, &request.nickname)
                    .await?;
                Ok(Reply::text(GREETING))
            }
            Command::Help => Ok(Reply::text(help_text())),
            Command::Subscribe(id) => self.subscribe(&request, id).await,
            Command::Unsubscribe(id) => self.unsubscribe(&request, id).await,
            Command::MySubscriptions => self.my_subscriptions(&request).await,
            Command::SeekRole(id, role) => self.seek_role(&request, id, role).await,
            Command::CancelRole(id) => self.cancel_role(&request, id).await,
            Command::Upcoming => {
                let games = self
                    .store
                    .list_games(
                        &GameQuery::new()
                            .state(LifecycleState::Upcoming)
                            .flag(BroadcastKind::Announcement, true),
                    )
                    .await?;
                Ok(self.listing(&games, NO_UPCOMING))
            }
            Command::Active => {
                let games = self
                    .store
                    .list_games(&GameQuery::new().state(LifecycleState::Active))
                    .await?;
                Ok(self.listing(&games, NO_ACTIVE))
            }
        }
    }

    fn listing(&self, games: &[egw_core::Game], empty: &str) -> Reply {
        if games.is_empty() {
            return Reply::text(empty);
        }
        Reply {
            messages: self.formatter.game_listing(games, MAX_MESSAGE_LEN),
        }
    }

    async fn caller(&self, request: &Request) -> Result<Option<Subscriber>> {
        self.store.subscriber_by_external_id(request.external_id).await
    }

    async fn subscribe(&self, request: &Request, id: GameId) -> Result<Reply> {
        let Some(subscriber) = self.caller(request).await? else {
            return Ok(Reply::text(NOT_REGISTERED));
        };
        let text = match self.store.subscribe(subscriber.id, id).await? {
            SubscribeOutcome::Subscribed => format!("Вы успешно подписались на игру {id}."),
            SubscribeOutcome::AlreadySubscribed => format!("Вы уже подписаны на игру {id}."),
            SubscribeOutcome::GameMissing => format!("Игра {id} больше не существует."),
        };
        Ok(Reply::text(text))
    }

    async fn unsubscribe(&self, request: &Request, id: GameId) -> Result<Reply> {
        let Some(subscriber) = self.caller(request).await? else {
            return Ok(Reply::text(NOT_REGISTERED));
        };
        let text = match self.store.unsubscribe(subscriber.id, id).await? {
            UnsubscribeOutcome::Unsubscribed => format!("Вы успешно отписались от игры {id}."),
            UnsubscribeOutcome::NotSubscribed => format!("Вы не подписаны на игру {id}."),
        };
        Ok(Reply::text(text))
    }

    async fn my_subscriptions(&self, request: &Request) -> Result<Reply> {
        let Some(subscriber) = self.caller(request).await? else {
            return Ok(Reply::text(NOT_REGISTERED));
        };
        let games = self.store.subscribed_games(subscriber.id).await?;
        Ok(self.listing(&games, NO_SUBSCRIPTIONS))
    }

    async fn seek_role(&self, request: &Request, id: GameId, role: SearchRole) -> Result<Reply> {
        let Some(subscriber) = self.caller(request).await? else {
            return Ok(Reply::text(NOT_REGISTERED));
        };
        let looking_for = match role {
            SearchRole::SeekingGame => "команду",
            SearchRole::SeekingTeam => "игроков",
        };
        let headline = match self.store.set_role(subscriber.id, id, role).await? {
            RoleOutcome::GameMissing => return Ok(Reply::text(format!("Игра {id} больше не существует."))),
            RoleOutcome::Set => format!("Вы ищете {looking_for} для игры {id}."),
            RoleOutcome::Switched => format!("Роль изменена: теперь вы ищете {looking_for} для игры {id}."),
            RoleOutcome::Unchanged => format!("Вы уже ищете {looking_for} для игры {id}."),
        };
        let counts = self.store.role_counts(id).await?;
        let matches = self.store.nicknames_with_role(id, role.opposite()).await?;
        Ok(Reply::text(format!("{headline}\n{}", role_summary(counts, &matches))))
    }

    async fn cancel_role(&self, request: &Request, id: GameId) -> Result<Reply> {
        let Some(subscriber) = self.caller(request).await? else {
            return Ok(Reply::text(NOT_REGISTERED));
        };
        let text = if self.store.clear_role(subscriber.id, id).await? {
            format!("Поиск для игры {id} отменён.")
        } else {
            format!("Для игры {id} поиск не был активен.")
        };
        Ok(Reply::text(text))
    }
}

fn help_text() -> String {
    [
        "/start: регистрация",
        "/upcoming: предстоящие игры",
        "/active: активные игры",
        "/subscribe <id>: подписаться на уведомления игры",
        "/unsubscribe <id>: отписаться",
        "/my_subscriptions: ваши подписки",
        "/seek_role <id> <player|team>: искать команду или игроков",
        "/cancel_role <id>: отменить поиск",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_game;
    use chrono::FixedOffset;

    async fn pipeline() -> (GameStore, CommandPipeline) {
        let store = GameStore::in_memory().await.unwrap();
        let formatter = Formatter::new(FixedOffset::east_opt(3 * 3600).unwrap());
        (store.clone(), CommandPipeline::new(store, formatter))
    }

    fn only(reply: Reply) -> String {
        assert_eq!(reply.messages.len(), 1, "{reply:?}");
        reply.messages.into_iter().next().unwrap()
    }

    #[test]
    fn commands_parse_with_arguments_and_bot_suffix() {
        assert_eq!(Command::parse("/subscribe@enc_bot 42"), Ok(Command::Subscribe(42)));
        assert_eq!(
            Command::parse("/seek_role 7 team"),
            Ok(Command::SeekRole(7, SearchRole::SeekingTeam))
        );
        assert_eq!(Command::parse("  /active  "), Ok(Command::Active));
        assert!(matches!(
            Command::parse("/subscribe"),
            Err(CommandError::MissingArgument { command: "subscribe", .. })
        ));
        assert!(matches!(
            Command::parse("/unsubscribe abc"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(Command::parse("hello"), Err(CommandError::Unknown(_))));
    }

    #[tokio::test]
    async fn unregistered_callers_get_fixed_message() {
        let (_, p) = pipeline().await;
        assert_eq!(only(p.handle_text(1, "n", "/subscribe 5").await.unwrap()), NOT_REGISTERED);
        assert_eq!(only(p.handle_text(1, "n", "/upcoming").await.unwrap()), NOT_REGISTERED);
        assert_eq!(only(p.handle_text(1, "n", "/start").await.unwrap()), GREETING);
    }

    #[tokio::test]
    async fn subscribe_flow_reports_each_outcome() {
        let (store, p) = pipeline().await;
        store.insert_game(&sample_game(42, LifecycleState::Upcoming)).await.unwrap();
        p.handle_text(9, "nick", "/start").await.unwrap();

        let say = |text: &'static str| p.handle_text(9, "nick", text);
        assert_eq!(only(say("/subscribe 42").await.unwrap()), "Вы успешно подписались на игру 42.");
        assert_eq!(only(say("/subscribe 42").await.unwrap()), "Вы уже подписаны на игру 42.");
        assert_eq!(only(say("/subscribe 43").await.unwrap()), "Игра 43 больше не существует.");
        assert!(only(say("/my_subscriptions").await.unwrap()).contains("(id 42)"));
        assert_eq!(only(say("/unsubscribe 42").await.unwrap()), "Вы успешно отписались от игры 42.");
        assert_eq!(only(say("/unsubscribe 42").await.unwrap()), "Вы не подписаны на игру 42.");
        assert_eq!(only(say("/my_subscriptions").await.unwrap()), NO_SUBSCRIPTIONS);
    }

    #[tokio::test]
    async fn completed_game_cannot_be_subscribed() {
        let (store, p) = pipeline().await;
        store.insert_game(&sample_game(44, LifecycleState::Completed)).await.unwrap();
        p.handle_text(9, "nick", "/start").await.unwrap();

        assert_eq!(
            only(p.handle_text(9, "nick", "/subscribe 44").await.unwrap()),
            "Игра 44 больше не существует."
        );
        assert_eq!(
            only(p.handle_text(9, "nick", "/seek_role 44 player").await.unwrap()),
            "Игра 44 больше не существует."
        );
        assert_eq!(store.subscription_count(44).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upcoming_lists_only_announced_games() {
        let (store, p) = pipeline().await;
        p.handle_text(1, "n", "/start").await.unwrap();
        assert_eq!(only(p.handle_text(1, "n", "/upcoming").await.unwrap()), NO_UPCOMING);

        let mut announced = sample_game(1, LifecycleState::Upcoming);
        announced.announcement_sent = true;
        store.insert_game(&announced).await.unwrap();
        store.insert_game(&sample_game(2, LifecycleState::Upcoming)).await.unwrap();

        let text = only(p.handle_text(1, "n", "/upcoming").await.unwrap());
        assert!(text.contains("(id 1)"));
        assert!(!text.contains("(id 2)"));
        assert_eq!(only(p.handle_text(1, "n", "/active").await.unwrap()), NO_ACTIVE);
    }

    #[tokio::test]
    async fn role_search_shows_complementary_nicknames() {
        let (store, p) = pipeline().await;
        store.insert_game(&sample_game(5, LifecycleState::Upcoming)).await.unwrap();
        p.handle_text(1, "anna", "/start").await.unwrap();
        p.handle_text(2, "team_b", "/start").await.unwrap();

        let first = only(p.handle_text(2, "team_b", "/seek_role 5 team").await.unwrap());
        assert!(first.contains("Пока никто не откликнулся."));

        let text = only(p.handle_text(1, "anna", "/seek_role 5 player").await.unwrap());
        assert!(text.starts_with("Вы ищете команду для игры 5."));
        assert!(text.contains("Ищут команду: 1\nИщут игроков: 1"));
        assert!(text.contains("team_b"));

        let switched = only(p.handle_text(1, "anna", "/seek_role 5 team").await.unwrap());
        assert!(switched.starts_with("Роль изменена"));
        assert_eq!(
            only(p.handle_text(1, "anna", "/cancel_role 5").await.unwrap()),
            "Поиск для игры 5 отменён."
        );
        assert_eq!(
            only(p.handle_text(1, "anna", "/seek_role 9 team").await.unwrap()),
            "Игра 9 больше не существует."
        );
    }

    #[tokio::test]
    async fn writing_to_the_bot_clears_blocked_flag() {
        let (store, p) = pipeline().await;
        let sub = store.register_subscriber(3, "n").await.unwrap();
        store.mark_blocked(sub.id).await.unwrap();
        p.handle_text(3, "n", "/active").await.unwrap();
        assert!(!store.subscriber_by_external_id(3).await.unwrap().unwrap().blocked);
    }

    #[tokio::test]
    async fn bad_arguments_get_usage_reply() {
        let (_, p) = pipeline().await;
        let text = only(p.handle_text(1, "n", "/subscribe").await.unwrap());
        assert!(text.starts_with("Использование: /subscribe"));
    }
}
