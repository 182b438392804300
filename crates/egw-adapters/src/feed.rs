use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::FixedOffset;
use egw_core::{Category, GameRecord};
use egw_storage::HttpFetcher;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::html::{pagination_links, parse_detail_page, parse_listing_rows};
use crate::normalize::{apply_detail, normalize_row, RawListingRow};
use crate::{AdapterError, FeedBatch, ListingFeed, ListingView, SourceTarget};

/// Normalizes scraped rows, dropping (and logging) the ones that fail.
pub fn normalize_rows(
    rows: &[RawListingRow],
    category: Category,
    offset: FixedOffset,
) -> Vec<GameRecord> {
    rows.iter()
        .filter_map(|raw| match normalize_row(raw, category, offset) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(id_cell = %raw.id_cell, error = %err, "skipping unparseable listing row");
                None
            }
        })
        .collect()
}

/// Live feed over the encounter calendar pages listed in `sources.yaml`.
pub struct EncounterFeed {
    http: Arc<HttpFetcher>,
    targets: Vec<SourceTarget>,
    utc_offset: FixedOffset,
    batch_timeout: Duration,
}

impl EncounterFeed {
    pub fn new(
        http: Arc<HttpFetcher>,
        targets: Vec<SourceTarget>,
        utc_offset: FixedOffset,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            http,
            targets,
            utc_offset,
            batch_timeout,
        }
    }

    pub fn targets(&self) -> &[SourceTarget] {
        &self.targets
    }

    async fn fetch_target(&self, target: &SourceTarget) -> Result<Vec<GameRecord>, AdapterError> {
        let first_page = self.http.fetch_text(&target.url).await?;
        let mut rows = parse_listing_rows(&first_page)?;

        let extra_pages = pagination_links(&first_page, &target.url)?;
        if !extra_pages.is_empty() {
            debug!(url = %target.url, pages = extra_pages.len() + 1, "listing is paginated");
        }
        // A missing page would look like vanished games, so it fails the target.
        for page in join_all(extra_pages.iter().map(|url| self.http.fetch_text(url))).await {
            rows.extend(parse_listing_rows(&page?)?);
        }

        let records = normalize_rows(&rows, target.category, self.utc_offset);
        Ok(join_all(records.into_iter().map(|record| self.enrich(record))).await)
    }

    /// Detail-page fields are best effort; a failed fetch leaves them absent.
    async fn enrich(&self, mut record: GameRecord) -> GameRecord {
        let detail = match self.http.fetch_text(&record.link).await {
            Ok(html) => parse_detail_page(&html, &record.link),
            Err(err) => Err(AdapterError::from(err)),
        };
        match detail {
            Ok(fields) => apply_detail(&mut record, fields, self.utc_offset),
            Err(err) => warn!(game_id = record.id, error = %err, "detail enrichment failed"),
        }
        record
    }

    /// Targets of one view share a single deadline, so the whole batch is
    /// bounded by `batch_timeout` and a target cut off by it counts as failed.
    async fn fetch_target_by(
        &self,
        target: &SourceTarget,
        deadline: Instant,
    ) -> Result<Vec<GameRecord>, AdapterError> {
        tokio::time::timeout_at(deadline, self.fetch_target(target))
            .await
            .map_err(|_| AdapterError::Timeout {
                url: target.url.clone(),
            })?
    }
}

#[async_trait]
impl ListingFeed for EncounterFeed {
    async fn fetch_view(&self, view: ListingView) -> FeedBatch {
        let targets: Vec<&SourceTarget> = self.targets.iter().filter(|t| t.view == view).collect();
        let deadline = Instant::now() + self.batch_timeout;
        let results = join_all(targets.iter().map(|t| self.fetch_target_by(t, deadline))).await;

        let mut batch = FeedBatch {
            total_targets: targets.len(),
            ..FeedBatch::default()
        };
        let mut seen = HashSet::new();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(records) => {
                    info!(url = %target.url, view = view.as_str(), records = records.len(), "listing scraped");
                    batch
                        .records
                        .extend(records.into_iter().filter(|r| seen.insert(r.id)));
                }
                Err(err) => {
                    batch.failed_targets += 1;
                    warn!(url = %target.url, view = view.as_str(), error = %err, "listing target failed");
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egw_storage::HttpClientConfig;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600).unwrap()
    }

    #[test]
    fn bad_rows_are_dropped_individually() {
        let good = RawListingRow {
            id_cell: "Игра/5".into(),
            domain: "a.en.cx".into(),
            start_text: "1 мая 2025 г. 10:00:00".into(),
            name: "n".into(),
            author: "a".into(),
            price: "0".into(),
        };
        let bad = RawListingRow {
            start_text: "завтра".into(),
            ..good.clone()
        };
        let records = normalize_rows(&[bad, good], Category::Team, offset());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 5);
    }

    #[tokio::test]
    async fn unreachable_targets_degrade_to_an_untrustworthy_batch() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let feed = EncounterFeed::new(
            http,
            vec![
                SourceTarget {
                    url: "not a url".into(),
                    category: Category::Team,
                    view: ListingView::Active,
                },
                SourceTarget {
                    url: "also not a url".into(),
                    category: Category::Single,
                    view: ListingView::Upcoming,
                },
            ],
            offset(),
            Duration::from_secs(5),
        );

        let batch = feed.fetch_view(ListingView::Active).await;
        assert_eq!(batch.total_targets, 1);
        assert_eq!(batch.failed_targets, 1);
        assert!(batch.records.is_empty());
        assert!(!batch.is_trustworthy());
    }

    #[tokio::test]
    async fn stalled_targets_fail_at_the_batch_deadline() {
        // Accepts connections through the backlog and never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/GameCalendar.aspx", listener.local_addr().unwrap());
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let target = |category| SourceTarget {
            url: url.clone(),
            category,
            view: ListingView::Upcoming,
        };
        let feed = EncounterFeed::new(
            http,
            vec![target(Category::Team), target(Category::Single)],
            offset(),
            Duration::from_millis(200),
        );

        let started = std::time::Instant::now();
        let batch = feed.fetch_view(ListingView::Upcoming).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(batch.failed_targets, 2);
        assert!(!batch.is_trustworthy());
        drop(listener);
    }
}
