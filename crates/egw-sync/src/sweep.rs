//! Periodic lifecycle sweep over non-terminal games.

use anyhow::Result;
use chrono::{DateTime, Utc};
use egw_core::{evaluate, GameId, LifecycleState};
use tracing::{debug, info};

use crate::store::{GameQuery, GameStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTransition {
    pub game_id: GameId,
    pub from: LifecycleState,
    pub to: LifecycleState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub transitions: Vec<SweepTransition>,
    /// Rows whose state moved underneath the sweep before it could write.
    pub lost_races: usize,
}

/// Re-evaluates every UPCOMING and ACTIVE game against `now` and persists
/// the state when it differs. Reaching COMPLETED also drops the game's
/// subscriptions and role rows.
pub async fn sweep(store: &GameStore, now: DateTime<Utc>) -> Result<SweepReport> {
    let games = store
        .list_games(&GameQuery::new().states(&[LifecycleState::Upcoming, LifecycleState::Active]))
        .await?;
    let mut report = SweepReport {
        examined: games.len(),
        ..SweepReport::default()
    };

    for game in games {
        let eval = evaluate(game.lifecycle_state, now, game.start_time, game.end_time);
        if eval.state == game.lifecycle_state {
            continue;
        }
        let applied = if eval.state == LifecycleState::Completed {
            store.complete_and_cascade(game.id, game.lifecycle_state).await?
        } else {
            store
                .transition_state(game.id, game.lifecycle_state, eval.state)
                .await?
        };
        if !applied {
            debug!(game_id = game.id, "state changed concurrently; skipping");
            report.lost_races += 1;
            continue;
        }
        info!(
            game_id = game.id,
            from = %game.lifecycle_state,
            to = %eval.state,
            boundary = eval.boundary.describe(),
            "lifecycle transition"
        );
        report.transitions.push(SweepTransition {
            game_id: game.id,
            from: game.lifecycle_state,
            to: eval.state,
        });
    }
    Ok(report)
}
