use crate::auth::Authorizer;
use crate::db::{Database, StoredResults};
use crate::error::{Result, TallyError};
use crate::models::{
    NONE_OF_THE_ABOVE, ThresholdKind, TieBreakRequest, Vote, VoteMethod, VoteOption, VoteParams,
    VoteState,
};
use crate::tasks::{TallyRunner, TieBreakCoordinator};
use crate::voting::{SubmittedMark, validate_ballot};
use log::{error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

pub const MAJORITY_THRESHOLD: &str = "majority_threshold";
pub const NUM_SEATS: &str = "num_seats";

/// What `close_meeting` did to each vote of the meeting.
#[derive(Debug, Default)]
pub struct MeetingClosure {
    pub counting: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, TallyError)>,
}

/// The vote state machine and every administrative operation on it.
pub struct VoteLifecycle {
    db: Arc<Database>,
    auth: Box<dyn Authorizer>,
    ties: Arc<TieBreakCoordinator>,
    runner: TallyRunner,
}

impl VoteLifecycle {
    pub fn new(db: Arc<Database>, auth: Box<dyn Authorizer>) -> Self {
        let ties = Arc::new(TieBreakCoordinator::new());
        let runner = TallyRunner::new(db.clone(), ties.clone());
        Self {
            db,
            auth,
            ties,
            runner,
        }
    }

    pub fn runner(&self) -> &TallyRunner {
        &self.runner
    }

    async fn authorized(&self, actor: &str, vote_id: &str) -> Result<Vote> {
        let vote = self.db.get_vote(vote_id).await?;
        if !self.auth.can_manage(actor, &vote).await {
            warn!("{} was refused access to vote {}", actor, vote_id);
            return Err(TallyError::PermissionDenied(actor.to_string()));
        }
        Ok(vote)
    }

    pub async fn create_vote(
        &self,
        actor: &str,
        ballot_set_id: &str,
        name: &str,
        method: VoteMethod,
    ) -> Result<Vote> {
        let vote = Vote::new(ballot_set_id.to_string(), name.to_string(), method);
        if !self.auth.can_manage(actor, &vote).await {
            return Err(TallyError::PermissionDenied(actor.to_string()));
        }
        self.db.create_vote(&vote).await?;
        info!("Created {} vote {} ({})", method.as_str(), vote.id, vote.name);
        Ok(vote)
    }

    pub async fn add_option(&self, actor: &str, vote_id: &str, name: &str) -> Result<VoteOption> {
        let vote = self.authorized(actor, vote_id).await?;
        if vote.method == VoteMethod::Threshold {
            return Err(TallyError::invalid_state(
                vote.state,
                "yes/no/abstain votes have fixed options",
            ));
        }
        if vote.state != VoteState::Unopened {
            return Err(TallyError::invalid_state(
                vote.state,
                "options can only be changed before the vote opens",
            ));
        }
        if vote.option_named(name).is_some() {
            return Err(TallyError::InvalidParameter(format!(
                "option {:?} already exists",
                name
            )));
        }

        let option = VoteOption {
            id: Uuid::new_v4().to_string(),
            vote_id: vote.id.clone(),
            name: name.to_string(),
            position: vote.options.iter().map(|o| o.position).max().unwrap_or(-1) + 1,
        };
        if !self.db.insert_option(&option, VoteState::Unopened).await? {
            return Err(self.lost_race(vote_id, "options can only be changed before the vote opens").await);
        }
        Ok(option)
    }

    pub async fn remove_option(&self, actor: &str, vote_id: &str, option_id: &str) -> Result<()> {
        let vote = self.authorized(actor, vote_id).await?;
        if vote.method == VoteMethod::Threshold {
            return Err(TallyError::invalid_state(
                vote.state,
                "yes/no/abstain votes have fixed options",
            ));
        }
        if vote.state != VoteState::Unopened {
            return Err(TallyError::invalid_state(
                vote.state,
                "options can only be changed before the vote opens",
            ));
        }
        let option = vote
            .option(option_id)
            .ok_or_else(|| TallyError::NotFound(format!("option {}", option_id)))?;
        if option.name == NONE_OF_THE_ABOVE {
            return Err(TallyError::invalid_state(
                vote.state,
                "\"None of the above\" cannot be removed",
            ));
        }
        if !self.db.delete_option(vote_id, option_id, VoteState::Unopened).await? {
            return Err(self.lost_race(vote_id, "options can only be changed before the vote opens").await);
        }
        Ok(())
    }

    pub async fn set_parameter(
        &self,
        actor: &str,
        vote_id: &str,
        key: &str,
        value: &str,
    ) -> Result<VoteParams> {
        let vote = self.authorized(actor, vote_id).await?;
        if !matches!(vote.state, VoteState::Unopened | VoteState::Live) {
            return Err(TallyError::invalid_state(
                vote.state,
                "parameters can only be changed before counting starts",
            ));
        }
        let params = apply_parameter(vote.method, &vote.params, key, value)?;
        if !self
            .db
            .update_params(vote_id, &params, [VoteState::Unopened, VoteState::Live])
            .await?
        {
            return Err(self.lost_race(vote_id, "parameters can only be changed before counting starts").await);
        }
        info!("Vote {}: {} set to {}", vote_id, key, value);
        Ok(params)
    }

    pub async fn open(&self, actor: &str, vote_id: &str) -> Result<VoteState> {
        let vote = self.authorized(actor, vote_id).await?;
        if vote.state != VoteState::Unopened {
            return Err(TallyError::invalid_state(vote.state, "only an unopened vote can be opened"));
        }
        if vote.options.len() < 2 {
            return Err(TallyError::insufficient_options());
        }
        if !self.db.transition(vote_id, VoteState::Unopened, VoteState::Live).await? {
            return Err(self.lost_race(vote_id, "only an unopened vote can be opened").await);
        }
        info!("Vote {} is now live", vote_id);
        Ok(VoteState::Live)
    }

    /// Starts counting. Overrides are stored as the vote's parameters first.
    pub async fn close(&self, actor: &str, vote_id: &str, overrides: VoteParams) -> Result<VoteState> {
        let vote = self.authorized(actor, vote_id).await?;
        self.close_authorized(vote, overrides).await
    }

    async fn close_authorized(&self, mut vote: Vote, overrides: VoteParams) -> Result<VoteState> {
        if vote.state != VoteState::Live {
            warn!("Refused to close vote {} while it is {}", vote.id, vote.state);
            return Err(TallyError::invalid_state(vote.state, "only a live vote can be closed"));
        }

        let params = merge_overrides(vote.method, &vote.params, &overrides)?;
        if params != vote.params {
            if !self
                .db
                .update_params(&vote.id, &params, [VoteState::Live, VoteState::Live])
                .await?
            {
                return Err(self.lost_race(&vote.id, "only a live vote can be closed").await);
            }
            vote.params = params;
        }

        if let Some(missing) = vote.missing_parameter() {
            return Err(TallyError::MissingParameter(missing.to_string()));
        }

        self.start_count(vote).await
    }

    async fn start_count(&self, vote: Vote) -> Result<VoteState> {
        if !self.runner.claim(&vote.id).await {
            return Err(TallyError::invalid_state(
                VoteState::Counting,
                "a count is already running for this vote",
            ));
        }
        let moved = match self
            .db
            .transition(&vote.id, VoteState::Live, VoteState::Counting)
            .await
        {
            Ok(moved) => moved,
            Err(e) => {
                self.runner.release(&vote.id).await;
                return Err(e);
            }
        };
        if !moved {
            self.runner.release(&vote.id).await;
            return Err(self.lost_race(&vote.id, "only a live vote can be closed").await);
        }

        info!("Vote {} is now counting", vote.id);
        self.runner.spawn(vote);
        Ok(VoteState::Counting)
    }

    /// Supplies the decision a paused count is waiting for.
    pub async fn resolve_tie(&self, actor: &str, vote_id: &str, option_id: &str) -> Result<()> {
        self.authorized(actor, vote_id).await?;
        let request = self
            .db
            .get_tie_break(vote_id)
            .await?
            .ok_or_else(|| TallyError::NoPendingTieBreak(vote_id.to_string()))?;
        if !request.tied_option_ids.iter().any(|id| id == option_id) {
            return Err(TallyError::InvalidTieChoice(option_id.to_string()));
        }

        let Some(pending) = self.ties.take(vote_id).await else {
            if self.runner.is_running(vote_id).await {
                // Another decision got here first.
                return Err(TallyError::NoPendingTieBreak(vote_id.to_string()));
            }
            return Err(TallyError::invalid_state(
                VoteState::PausedForTieBreak,
                "no count is waiting on this tie any more; reset the vote and close it again",
            ));
        };
        let Some(candidate) = pending.candidate_for(option_id) else {
            self.ties.restore(vote_id, pending).await;
            return Err(TallyError::InvalidTieChoice(option_id.to_string()));
        };

        match self.db.resolve_tie_break(vote_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.ties.restore(vote_id, pending).await;
                return Err(TallyError::NoPendingTieBreak(vote_id.to_string()));
            }
            Err(e) => {
                self.ties.restore(vote_id, pending).await;
                return Err(e);
            }
        }

        info!("Vote {}: tie resolved for option {}, counting resumes", vote_id, option_id);
        if !pending.answer(candidate) {
            warn!("Vote {}: the paused count went away before the decision arrived", vote_id);
        }
        Ok(())
    }

    pub async fn cast_ballot(
        &self,
        vote_id: &str,
        voter_id: &str,
        submission: &[SubmittedMark],
    ) -> Result<usize> {
        let vote = self.db.get_vote(vote_id).await?;
        if vote.state != VoteState::Live {
            return Err(TallyError::invalid_state(
                vote.state,
                "ballots are only accepted while the vote is live",
            ));
        }
        let entries = validate_ballot(&vote, voter_id, submission)?;
        self.db.insert_ballot(vote_id, &entries).await?;
        Ok(entries.len())
    }

    /// Puts a counting, paused or closed vote back to live.
    pub async fn reset(&self, actor: &str, vote_id: &str) -> Result<VoteState> {
        let vote = self.authorized(actor, vote_id).await?;
        self.reset_authorized(&vote).await
    }

    async fn reset_authorized(&self, vote: &Vote) -> Result<VoteState> {
        if self.runner.is_running(&vote.id).await {
            return Err(TallyError::invalid_state(
                vote.state,
                "a count is still running for this vote",
            ));
        }
        if !self.db.reset_to_live(&vote.id).await? {
            return Err(TallyError::invalid_state(
                vote.state,
                "only a counting, paused or closed vote can be reset",
            ));
        }
        info!("Vote {} was reset to live", vote.id);
        Ok(VoteState::Live)
    }

    /// Reset and close again, producing fresh results from the same ballots.
    /// The overrides are checked before anything is reset.
    pub async fn regenerate(
        &self,
        actor: &str,
        vote_id: &str,
        overrides: VoteParams,
    ) -> Result<VoteState> {
        let vote = self.authorized(actor, vote_id).await?;
        let overrides = regeneration_overrides(&vote, overrides)?;
        self.regenerate_authorized(vote, overrides).await
    }

    async fn regenerate_authorized(&self, vote: Vote, overrides: VoteParams) -> Result<VoteState> {
        self.reset_authorized(&vote).await?;
        let vote = self.db.get_vote(&vote.id).await?;
        self.close_authorized(vote, overrides).await
    }

    /// Regenerates every closed vote of one method. Votes that cannot be
    /// regenerated are logged and skipped. Returns the ids now counting.
    pub async fn regenerate_all(
        &self,
        actor: &str,
        method: VoteMethod,
        overrides: VoteParams,
    ) -> Result<Vec<String>> {
        merge_overrides(method, &VoteParams::default(), &overrides)?;

        let mut votes = Vec::new();
        for vote_id in self.db.vote_ids_in_state(VoteState::Closed).await? {
            let vote = self.db.get_vote(&vote_id).await?;
            if vote.method != method {
                continue;
            }
            if !self.auth.can_manage(actor, &vote).await {
                return Err(TallyError::PermissionDenied(actor.to_string()));
            }
            votes.push(vote);
        }

        let mut regenerated = Vec::new();
        for vote in votes {
            let vote_overrides = match regeneration_overrides(&vote, overrides.clone()) {
                Ok(vote_overrides) => vote_overrides,
                Err(e) => {
                    warn!("Skipping regeneration of vote {} ({}): {}", vote.id, vote.name, e);
                    continue;
                }
            };
            let id = vote.id.clone();
            match self.regenerate_authorized(vote, vote_overrides).await {
                Ok(_) => regenerated.push(id),
                Err(e) => error!("Failed to regenerate vote {}: {}", id, e),
            }
        }
        info!(
            "Regenerating {} closed {} vote(s)",
            regenerated.len(),
            method.as_str()
        );
        Ok(regenerated)
    }

    pub async fn delete_vote(&self, actor: &str, vote_id: &str) -> Result<()> {
        let vote = self.authorized(actor, vote_id).await?;
        if vote.state != VoteState::Unopened {
            return Err(TallyError::invalid_state(vote.state, "only an unopened vote can be deleted"));
        }
        if !self.db.delete_vote(vote_id, VoteState::Unopened).await? {
            return Err(self.lost_race(vote_id, "only an unopened vote can be deleted").await);
        }
        info!("Deleted vote {}", vote_id);
        Ok(())
    }

    /// Closes every live vote of a ballot set and drops the unopened ones.
    /// Nothing happens unless every live vote has its parameters. A vote that
    /// fails to close does not stop the rest; it is reported in the outcome.
    pub async fn close_meeting(&self, actor: &str, ballot_set_id: &str) -> Result<MeetingClosure> {
        let votes = self.db.votes_in_ballot_set(ballot_set_id).await?;
        for vote in &votes {
            if !self.auth.can_manage(actor, vote).await {
                return Err(TallyError::PermissionDenied(actor.to_string()));
            }
        }

        let missing: Vec<String> = votes
            .iter()
            .filter(|v| v.state == VoteState::Live)
            .filter_map(|v| v.missing_parameter().map(|p| format!("{} ({})", v.name, p)))
            .collect();
        if !missing.is_empty() {
            return Err(TallyError::MissingParameter(missing.join(", ")));
        }

        let mut closure = MeetingClosure::default();
        for vote in votes {
            let id = vote.id.clone();
            let outcome = match vote.state {
                VoteState::Live => match self.close_authorized(vote, VoteParams::default()).await {
                    Ok(_) => {
                        closure.counting.push(id.clone());
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                VoteState::Unopened => match self.db.delete_vote(&id, VoteState::Unopened).await {
                    Ok(true) => {
                        info!("Deleted unopened vote {} with its meeting", id);
                        closure.deleted.push(id.clone());
                        Ok(())
                    }
                    Ok(false) => Err(self.lost_race(&id, "only an unopened vote can be deleted").await),
                    Err(e) => Err(e),
                },
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                error!("Meeting {}: vote {} was left as it was: {}", ballot_set_id, id, e);
                closure.failed.push((id, e));
            }
        }
        info!(
            "Closed meeting {}: {} vote(s) counting, {} deleted, {} failed",
            ballot_set_id,
            closure.counting.len(),
            closure.deleted.len(),
            closure.failed.len()
        );
        Ok(closure)
    }

    pub async fn vote(&self, vote_id: &str) -> Result<Vote> {
        self.db.get_vote(vote_id).await
    }

    pub async fn pending_tie(&self, vote_id: &str) -> Result<Option<TieBreakRequest>> {
        self.db.get_vote(vote_id).await?;
        self.db.get_tie_break(vote_id).await
    }

    pub async fn results(&self, vote_id: &str) -> Result<Option<StoredResults>> {
        self.db.get_results(vote_id).await
    }

    // A conditional write matched nothing: report the state that beat us.
    async fn lost_race(&self, vote_id: &str, reason: &str) -> TallyError {
        match self.db.get_vote(vote_id).await {
            Ok(vote) => TallyError::invalid_state(vote.state, reason),
            Err(e) => e,
        }
    }
}

/// Validates one `key=value` parameter against the vote's method and returns
/// the updated parameter set.
pub fn apply_parameter(
    method: VoteMethod,
    params: &VoteParams,
    key: &str,
    value: &str,
) -> Result<VoteParams> {
    let mut params = params.clone();
    match (key, method) {
        (MAJORITY_THRESHOLD, VoteMethod::Threshold) => {
            let kind = ThresholdKind::parse(value).ok_or_else(|| {
                TallyError::InvalidParameter(format!(
                    "majority_threshold must be simple or two_thirds, got {:?}",
                    value
                ))
            })?;
            params.majority_threshold = Some(kind);
        }
        (NUM_SEATS, VoteMethod::Ranked) => {
            params.num_seats = Some(parse_seats(value)?);
        }
        (MAJORITY_THRESHOLD | NUM_SEATS, _) => {
            return Err(TallyError::InvalidParameter(format!(
                "{} does not apply to {} votes",
                key,
                method.as_str()
            )));
        }
        _ => {
            return Err(TallyError::InvalidParameter(format!("unknown parameter {:?}", key)));
        }
    }
    Ok(params)
}

pub fn parse_seats(value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(TallyError::InvalidParameter(format!(
            "num_seats must be a whole number of at least 1, got {:?}",
            value
        ))),
    }
}

/// Overrides a regeneration will close with. Threshold votes with no kind
/// fall back to simple; ranked votes must end up with a seat count.
fn regeneration_overrides(vote: &Vote, overrides: VoteParams) -> Result<VoteParams> {
    let mut overrides = overrides;
    if vote.method == VoteMethod::Threshold
        && vote.params.majority_threshold.is_none()
        && overrides.majority_threshold.is_none()
    {
        overrides.majority_threshold = Some(ThresholdKind::Simple);
    }
    let params = merge_overrides(vote.method, &vote.params, &overrides)?;
    if vote.method == VoteMethod::Ranked && params.num_seats.is_none() {
        return Err(TallyError::MissingParameter(NUM_SEATS.to_string()));
    }
    Ok(overrides)
}

fn merge_overrides(method: VoteMethod, params: &VoteParams, overrides: &VoteParams) -> Result<VoteParams> {
    let mut merged = params.clone();
    if let Some(kind) = overrides.majority_threshold {
        merged = apply_parameter(method, &merged, MAJORITY_THRESHOLD, kind.as_str())?;
    }
    if let Some(seats) = overrides.num_seats {
        merged = apply_parameter(method, &merged, NUM_SEATS, &seats.to_string())?;
    }
    Ok(merged)
}
