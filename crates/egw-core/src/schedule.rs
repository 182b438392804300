//! One-shot notification windows for subscribers of an active game.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberNotice {
    Started,
    Equator,
    NearEnd,
}

impl SubscriberNotice {
    pub const ALL: [SubscriberNotice; 3] = [Self::Started, Self::Equator, Self::NearEnd];

    /// Column holding the one-shot flag for this notice.
    pub fn flag_column(self) -> &'static str {
        match self {
            Self::Started => "started_notified",
            Self::Equator => "equator_notified",
            Self::NearEnd => "near_end_notified",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Equator => "equator",
            Self::NearEnd => "near_end",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    /// Width of every window. The dispatcher must run at least this often.
    pub window: Duration,
    /// How long before the end the near-end notice opens.
    pub near_end_lead: Duration,
    /// Minimum gap between the equator and near-end window starts.
    pub min_separation: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window: Duration::hours(1),
            near_end_lead: Duration::hours(48),
            min_separation: Duration::hours(1),
        }
    }
}

/// Half-open windows `[open, open + width)` for one game's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationWindows {
    pub started: DateTime<Utc>,
    pub equator: DateTime<Utc>,
    /// Absent when the near-end window would precede the start or collapse
    /// onto the equator window.
    pub near_end: Option<DateTime<Utc>>,
    pub width: Duration,
}

impl NotificationWindows {
    pub fn for_game(start: DateTime<Utc>, end: DateTime<Utc>, config: &WindowConfig) -> Self {
        let equator = start + (end - start) / 2;
        let near_end_open = end - config.near_end_lead;
        let near_end = (near_end_open > start
            && near_end_open - equator >= config.min_separation)
            .then_some(near_end_open);
        Self {
            started: start,
            equator,
            near_end,
            width: config.window,
        }
    }

    pub fn opens_at(&self, notice: SubscriberNotice) -> Option<DateTime<Utc>> {
        match notice {
            SubscriberNotice::Started => Some(self.started),
            SubscriberNotice::Equator => Some(self.equator),
            SubscriberNotice::NearEnd => self.near_end,
        }
    }

    pub fn is_open(&self, notice: SubscriberNotice, now: DateTime<Utc>) -> bool {
        self.opens_at(notice)
            .is_some_and(|open| open <= now && now < open + self.width)
    }

    /// Notices whose window contains `now`, in timeline order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<SubscriberNotice> {
        SubscriberNotice::ALL
            .into_iter()
            .filter(|notice| self.is_open(*notice, now))
            .collect()
    }
}
