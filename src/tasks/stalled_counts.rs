use crate::db::Database;
use crate::error::Result;
use crate::models::VoteState;
use crate::tasks::TallyRunner;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Periodically reports votes stuck mid-count with no run behind them, which
/// happens after a restart. They stay put until an administrator resets them.
pub async fn check_stalled_counts_task(
    database: Arc<Database>,
    runner: TallyRunner,
    every: Duration,
) {
    info!("Starting background task to check for stalled counts...");
    let mut interval = interval(every);

    loop {
        interval.tick().await;
        match stalled_votes(&database, &runner).await {
            Ok(stalled) if stalled.is_empty() => debug!("No stalled counts found."),
            Ok(stalled) => {
                for (vote_id, state) in stalled {
                    warn!(
                        "Vote {} is {} but no count is running for it; reset and close it again",
                        vote_id, state
                    );
                }
            }
            Err(e) => error!("Failed to query for stalled counts: {}", e),
        }
    }
}

/// Votes counting or paused in the store that this process is not running.
pub async fn stalled_votes(
    database: &Database,
    runner: &TallyRunner,
) -> Result<Vec<(String, VoteState)>> {
    let mut stalled = Vec::new();
    for state in [VoteState::Counting, VoteState::PausedForTieBreak] {
        for vote_id in database.vote_ids_in_state(state).await? {
            if !runner.is_running(&vote_id).await {
                stalled.push((vote_id, state));
            }
        }
    }
    Ok(stalled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Vote, VoteMethod};
    use crate::tasks::TieBreakCoordinator;

    #[tokio::test]
    async fn only_votes_without_a_run_are_reported() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let runner = TallyRunner::new(db.clone(), Arc::new(TieBreakCoordinator::new()));

        let mut ids = Vec::new();
        for name in ["Orphan", "Running"] {
            let vote = Vote::new("set".into(), name.into(), VoteMethod::Threshold);
            db.create_vote(&vote).await.unwrap();
            db.transition(&vote.id, VoteState::Unopened, VoteState::Live).await.unwrap();
            db.transition(&vote.id, VoteState::Live, VoteState::Counting).await.unwrap();
            ids.push(vote.id);
        }
        assert!(runner.claim(&ids[1]).await);

        let stalled = stalled_votes(&db, &runner).await.unwrap();
        assert_eq!(stalled, vec![(ids[0].clone(), VoteState::Counting)]);
    }
}
