//! Time-based lifecycle engine.
//!
//! Pure functions only: the periodic sweep in `egw-sync` reads rows, asks this
//! module for the next state and persists it when it differs.

use chrono::{DateTime, Utc};

use crate::LifecycleState;

/// Which boundary condition produced a state. Logged with every transition so
/// time-zone or data-entry errors can be traced back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// `now < start_time`
    BeforeStart,
    /// `start_time <= now` and the game has no end time.
    StartedOpenEnded,
    /// `start_time <= now < end_time`
    WithinWindow,
    /// `end_time <= now`
    PastEnd,
    /// The current state is terminal and was left untouched.
    Frozen,
}

impl Boundary {
    pub fn describe(self) -> &'static str {
        match self {
            Self::BeforeStart => "now is before start_time",
            Self::StartedOpenEnded => "start_time reached, no end_time",
            Self::WithinWindow => "start_time reached, end_time not reached",
            Self::PastEnd => "end_time reached",
            Self::Frozen => "terminal state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub state: LifecycleState,
    pub boundary: Boundary,
}

pub fn evaluate(
    current: LifecycleState,
    now: DateTime<Utc>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
) -> Evaluation {
    if current.is_terminal() {
        return Evaluation {
            state: current,
            boundary: Boundary::Frozen,
        };
    }
    if now < start_time {
        return Evaluation {
            state: LifecycleState::Upcoming,
            boundary: Boundary::BeforeStart,
        };
    }
    match end_time {
        None => Evaluation {
            state: LifecycleState::Active,
            boundary: Boundary::StartedOpenEnded,
        },
        Some(end) if end > now => Evaluation {
            state: LifecycleState::Active,
            boundary: Boundary::WithinWindow,
        },
        Some(_) => Evaluation {
            state: LifecycleState::Completed,
            boundary: Boundary::PastEnd,
        },
    }
}

pub fn next_state(
    current: LifecycleState,
    now: DateTime<Utc>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
) -> LifecycleState {
    evaluate(current, now, start_time, end_time).state
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).single().unwrap()
    }

    #[test]
    fn before_start_is_upcoming() {
        let start = t0();
        let now = start - Duration::minutes(1);
        assert_eq!(
            next_state(LifecycleState::Upcoming, now, start, Some(start + Duration::hours(5))),
            LifecycleState::Upcoming
        );
    }

    #[test]
    fn start_boundary_is_inclusive_and_end_boundary_exclusive() {
        let start = t0();
        let end = start + Duration::hours(10);
        assert_eq!(
            evaluate(LifecycleState::Upcoming, start, start, Some(end)),
            Evaluation {
                state: LifecycleState::Active,
                boundary: Boundary::WithinWindow
            }
        );
        assert_eq!(
            evaluate(LifecycleState::Active, end, start, Some(end)),
            Evaluation {
                state: LifecycleState::Completed,
                boundary: Boundary::PastEnd
            }
        );
    }

    #[test]
    fn open_ended_game_stays_active() {
        let start = t0();
        let eval = evaluate(LifecycleState::Active, start + Duration::days(400), start, None);
        assert_eq!(eval.state, LifecycleState::Active);
        assert_eq!(eval.boundary, Boundary::StartedOpenEnded);
    }

    #[test]
    fn terminal_states_are_frozen() {
        let start = t0();
        let now = start - Duration::days(1);
        assert_eq!(
            next_state(LifecycleState::Completed, now, start, None),
            LifecycleState::Completed
        );
        assert_eq!(
            next_state(LifecycleState::Archived, now, start, None),
            LifecycleState::Archived
        );
    }

    #[test]
    fn repeated_evaluation_never_flaps() {
        let start = t0();
        let end = Some(start + Duration::hours(3));
        for offset in [-120i64, -1, 0, 1, 90, 179, 180, 500] {
            let now = start + Duration::minutes(offset);
            let first = next_state(LifecycleState::Upcoming, now, start, end);
            let again = next_state(first, now, start, end);
            assert_eq!(first, again, "flapped at offset {offset}");
        }
    }
}
