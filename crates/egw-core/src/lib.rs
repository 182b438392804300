//! Core domain model for tracked games, subscribers and their one-shot flags.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod lifecycle;
pub mod schedule;

pub use lifecycle::{evaluate, next_state, Boundary, Evaluation};
pub use schedule::{NotificationWindows, SubscriberNotice, WindowConfig};

pub const CRATE_NAME: &str = "egw-core";

/// External-source identifier of a game. Stable across runs and used as the
/// only reconciliation key.
pub type GameId = i64;

/// Internal subscriber row id (not the chat identity).
pub type SubscriberId = i64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Single,
    Team,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Team => "team",
        }
    }
}

impl FromStr for Category {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "team" => Ok(Self::Team),
            other => Err(ParseEnumError {
                kind: "category",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Upcoming,
    Active,
    Completed,
    Archived,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// COMPLETED and ARCHIVED are never left by the time-based engine.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Archived)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(Self::Upcoming),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(ParseEnumError {
                kind: "lifecycle state",
                value: other.to_string(),
            }),
        }
    }
}

/// Which of the two complementary roles a subscriber advertises for a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchRole {
    /// A player looking for a team to join.
    SeekingGame,
    /// A team looking for more players.
    SeekingTeam,
}

impl SearchRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SeekingGame => "seeking_game",
            Self::SeekingTeam => "seeking_team",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::SeekingGame => Self::SeekingTeam,
            Self::SeekingTeam => Self::SeekingGame,
        }
    }
}

impl FromStr for SearchRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seeking_game" => Ok(Self::SeekingGame),
            "seeking_team" => Ok(Self::SeekingTeam),
            other => Err(ParseEnumError {
                kind: "search role",
                value: other.to_string(),
            }),
        }
    }
}

/// Canonical record produced by ingestion. Carries no lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: GameId,
    pub domain: String,
    pub name: String,
    pub author: String,
    pub price: String,
    pub link: String,
    pub category: Category,
    /// `None` means unknown (enrichment failed), `Some(0)` means unspecified.
    pub capacity: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub image_source_url: Option<String>,
}

/// Persisted game row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub domain: String,
    pub name: String,
    pub author: String,
    pub price: String,
    pub link: String,
    pub category: Category,
    pub capacity: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub lifecycle_state: LifecycleState,
    pub announcement_sent: bool,
    pub start_notice_sent: bool,
    pub image_ref: Option<String>,
    pub image_source_url: Option<String>,
    /// Bumped on every write; the compare-and-set token for updates.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

impl Game {
    pub fn is_single(&self) -> bool {
        self.category == Category::Single
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    /// Chat identity on the transport side.
    pub external_id: i64,
    pub nickname: String,
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    pub game_id: GameId,
    pub started_notified: bool,
    pub equator_notified: bool,
    pub near_end_notified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSearchEntry {
    pub subscriber_id: SubscriberId,
    pub game_id: GameId,
    pub role: SearchRole,
}

/// Detail-page link derived from the hosting domain and the game id.
pub fn detail_link(domain: &str, id: GameId) -> String {
    format!("https://{domain}/GameDetails.aspx?gid={id}&lang=ru")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_link_is_deterministic() {
        assert_eq!(
            detail_link("kovrov.en.cx", 78123),
            "https://kovrov.en.cx/GameDetails.aspx?gid=78123&lang=ru"
        );
    }

    #[test]
    fn enum_string_forms_round_trip_through_from_str() {
        for state in [
            LifecycleState::Upcoming,
            LifecycleState::Active,
            LifecycleState::Completed,
            LifecycleState::Archived,
        ] {
            assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
        }
        assert_eq!("team".parse::<Category>().unwrap(), Category::Team);
        assert!("duo".parse::<Category>().is_err());
    }

    #[test]
    fn roles_are_complementary() {
        assert_eq!(SearchRole::SeekingGame.opposite(), SearchRole::SeekingTeam);
        assert_eq!(SearchRole::SeekingTeam.opposite(), SearchRole::SeekingGame);
    }
}
