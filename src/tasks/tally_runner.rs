use crate::db::Database;
use crate::error::{Result, TallyError};
use crate::models::{ResultRecord, TieBreakRequest, Vote, VoteMethod};
use crate::tasks::tie_break::TieBreakCoordinator;
use crate::voting::{Progress, RankedInput, RankedTally, Tie, calculate_results, render};
use chrono::Utc;
use log::{debug, error, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Runs counts in the background, at most one per vote in this process.
#[derive(Clone)]
pub struct TallyRunner {
    db: Arc<Database>,
    ties: Arc<TieBreakCoordinator>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl TallyRunner {
    pub fn new(db: Arc<Database>, ties: Arc<TieBreakCoordinator>) -> Self {
        Self {
            db,
            ties,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Reserves the vote for a new run. False if one is already running here.
    pub async fn claim(&self, vote_id: &str) -> bool {
        self.active.lock().await.insert(vote_id.to_string())
    }

    pub async fn release(&self, vote_id: &str) {
        self.active.lock().await.remove(vote_id);
    }

    pub async fn is_running(&self, vote_id: &str) -> bool {
        self.active.lock().await.contains(vote_id)
    }

    /// Starts counting a vote already claimed and moved to counting. The
    /// claim is released whatever way the run ends.
    pub fn spawn(&self, vote: Vote) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let vote_id = vote.id.clone();
            let work = tokio::spawn(runner.clone().run(vote));
            match work.await {
                Ok(Ok(())) => info!("Count for vote {} finished", vote_id),
                Ok(Err(e)) => error!("Count for vote {} failed: {}", vote_id, e),
                Err(e) => error!("Count for vote {} did not complete: {}", vote_id, e),
            }
            runner.ties.forget(&vote_id).await;
            runner.release(&vote_id).await;
        })
    }

    async fn run(self, vote: Vote) -> Result<()> {
        let entries = self.db.entries_for_vote(&vote.id).await?;
        debug!("Counting vote {} with {} ballot entries", vote.id, entries.len());

        let record = match vote.method {
            VoteMethod::Threshold => ResultRecord::Threshold(calculate_results(
                &vote,
                &entries,
                vote.params.majority_threshold,
            )),
            VoteMethod::Ranked => {
                let seats = vote
                    .params
                    .num_seats
                    .ok_or_else(|| TallyError::MissingParameter("num_seats".to_string()))?;
                let input = RankedInput::from_entries(&vote, &entries, seats)?;
                let option_ids = input.option_ids.clone();
                let mut tally = RankedTally::new(input)?;
                loop {
                    match tally.advance()? {
                        Progress::Finished(result) => break ResultRecord::Ranked(result),
                        Progress::NeedsDecision(tie) => {
                            let chosen = self.wait_for_decision(&vote.id, &tie, &option_ids).await?;
                            tally.decide(chosen)?;
                        }
                    }
                }
            }
        };

        let text = render(&record);
        if !self.db.store_results(&vote.id, &record, &text).await? {
            return Err(TallyError::Aborted(format!(
                "vote {} stopped counting before its results were stored",
                vote.id
            )));
        }
        Ok(())
    }

    /// Pauses the vote and waits for the administrator's pick.
    async fn wait_for_decision(
        &self,
        vote_id: &str,
        tie: &Tie,
        option_ids: &[String],
    ) -> Result<usize> {
        let candidates: Vec<(String, usize)> = tie
            .tied
            .iter()
            .map(|&c| (option_ids[c].clone(), c))
            .collect();
        let tied_option_ids = candidates.iter().map(|(id, _)| id.clone()).collect();

        // The slot exists before the pause is visible, so a resolution never
        // finds a paused vote with nobody listening.
        let decision = self.ties.register(vote_id, candidates).await;
        let request = TieBreakRequest {
            vote_id: vote_id.to_string(),
            kind: tie.kind,
            round: tie.round,
            tied_option_ids,
            created_at: Utc::now(),
        };
        if !self.db.open_tie_break(&request).await? {
            return Err(TallyError::Aborted(format!(
                "vote {} stopped counting before the tie in round {} could be raised",
                vote_id, tie.round
            )));
        }
        info!(
            "Vote {} paused for a tie break ({}) in round {}",
            vote_id,
            tie.kind.as_str(),
            tie.round
        );

        decision.await.map_err(|_| {
            TallyError::Aborted(format!("tie break for vote {} was abandoned", vote_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_vote_can_only_be_claimed_once() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let runner = TallyRunner::new(db, Arc::new(TieBreakCoordinator::new()));

        assert!(runner.claim("v1").await);
        assert!(!runner.claim("v1").await);
        assert!(runner.is_running("v1").await);

        runner.release("v1").await;
        assert!(!runner.is_running("v1").await);
        assert!(runner.claim("v1").await);
    }

    #[tokio::test]
    async fn a_failed_run_releases_its_claim() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let runner = TallyRunner::new(db, Arc::new(TieBreakCoordinator::new()));
        // Never stored, so loading entries finds nothing and storing fails.
        let vote = Vote::new("set".into(), "Motion".into(), VoteMethod::Threshold);

        assert!(runner.claim(&vote.id).await);
        runner.spawn(vote.clone()).await.unwrap();
        assert!(!runner.is_running(&vote.id).await);
    }
}
