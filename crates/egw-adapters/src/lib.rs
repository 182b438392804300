//! Listing-source contracts and the encounter calendar adapter.

use async_trait::async_trait;
use egw_core::{Category, GameRecord};
use egw_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod feed;
pub mod html;
pub mod normalize;

pub use feed::{normalize_rows, EncounterFeed};
pub use html::{pagination_links, parse_detail_page, parse_listing_rows};
pub use normalize::{
    apply_detail, extract_capacity, normalize_row, parse_detail_datetime, parse_game_id,
    parse_listing_datetime, DetailFields, NormalizeError, RawListingRow,
};

pub const CRATE_NAME: &str = "egw-adapters";

/// Which live view of the source a listing url belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingView {
    Upcoming,
    Active,
}

impl ListingView {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Active => "active",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTarget {
    pub url: String,
    pub category: Category,
    pub view: ListingView,
}

/// Records scraped for one view, plus how many of its targets failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedBatch {
    pub records: Vec<GameRecord>,
    pub failed_targets: usize,
    pub total_targets: usize,
}

impl FeedBatch {
    pub fn from_records(records: Vec<GameRecord>) -> Self {
        Self {
            records,
            failed_targets: 0,
            total_targets: 1,
        }
    }

    /// Only a complete, non-empty view may be used to infer disappearances.
    pub fn is_trustworthy(&self) -> bool {
        self.failed_targets == 0 && !self.records.is_empty()
    }

    pub fn contains(&self, id: egw_core::GameId) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn get(&self, id: egw_core::GameId) -> Option<&GameRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("timed out fetching {url}")]
    Timeout { url: String },
}

/// Scraper collaborator. Never fails as a whole: a broken target degrades to
/// fewer records and a non-zero `failed_targets`.
#[async_trait]
pub trait ListingFeed: Send + Sync {
    async fn fetch_view(&self, view: ListingView) -> FeedBatch;
}
