use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const YES: &str = "yes";
pub const NO: &str = "no";
pub const ABSTAIN: &str = "abs";
pub const NONE_OF_THE_ABOVE: &str = "None of the above";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub ballot_set_id: String,
    pub name: String,
    pub method: VoteMethod,
    pub state: VoteState,
    pub options: Vec<VoteOption>,
    pub params: VoteParams,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOption {
    pub id: String,
    pub vote_id: String,
    pub name: String,
    pub position: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteMethod {
    Threshold,
    Ranked,
}

/// Lifecycle of a vote. `Unopened` is initial, `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteState {
    Unopened,
    Live,
    Counting,
    PausedForTieBreak,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    Simple,
    TwoThirds,
}

/// Method parameters. Only the one matching the vote's method is ever set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteParams {
    pub majority_threshold: Option<ThresholdKind>,
    pub num_seats: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotEntry {
    pub voter_id: String,
    pub option_id: String,
    pub value: i64,
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieKind {
    /// Who to eliminate among the lowest tied candidates.
    Eliminate,
    /// Who wins the last open seat.
    FinalSeat,
}

/// A durable request for an external tie decision. At most one per vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieBreakRequest {
    pub vote_id: String,
    pub kind: TieKind,
    pub round: u32,
    pub tied_option_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ResultRecord {
    Threshold(ThresholdResult),
    Ranked(RankedResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentages {
    pub yes: f64,
    pub no: f64,
    pub abstain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub yes: u64,
    pub no: u64,
    pub abstain: u64,
    pub total: u64,
    pub percentages: Percentages,
    pub yes_no_total: u64,
    pub has_majority: bool,
    pub has_two_thirds: bool,
    pub passed: Option<bool>,
    pub majority_threshold: Option<ThresholdKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    pub name: String,
    pub order: u32,
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loser {
    pub name: String,
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCount {
    pub name: String,
    pub votes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub counts: Vec<CandidateCount>,
    pub exhausted: f64,
    pub elected: Vec<String>,
    pub eliminated: Vec<String>,
    pub surplus_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub winners: Vec<Winner>,
    pub losers: Vec<Loser>,
    pub seats: u32,
    pub num_ballots: u64,
    pub quota: f64,
    pub rounds: Vec<RoundRecord>,
}

impl Vote {
    /// Builds a fresh `Unopened` vote with the options its method always carries.
    pub fn new(ballot_set_id: String, name: String, method: VoteMethod) -> Self {
        let id = Uuid::new_v4().to_string();
        let fixed: &[&str] = match method {
            VoteMethod::Threshold => &[YES, NO, ABSTAIN],
            VoteMethod::Ranked => &[NONE_OF_THE_ABOVE],
        };
        let options = fixed
            .iter()
            .enumerate()
            .map(|(i, name)| VoteOption {
                id: Uuid::new_v4().to_string(),
                vote_id: id.clone(),
                name: name.to_string(),
                position: i as i64,
            })
            .collect();

        Self {
            id,
            ballot_set_id,
            name,
            method,
            state: VoteState::Unopened,
            options,
            params: VoteParams::default(),
            created_at: Utc::now(),
        }
    }

    pub fn option(&self, option_id: &str) -> Option<&VoteOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    pub fn option_named(&self, name: &str) -> Option<&VoteOption> {
        self.options.iter().find(|o| o.name == name)
    }

    /// The first required parameter that is still unset, if any.
    pub fn missing_parameter(&self) -> Option<&'static str> {
        match self.method {
            VoteMethod::Threshold if self.params.majority_threshold.is_none() => {
                Some("majority_threshold")
            }
            VoteMethod::Ranked if self.params.num_seats.is_none() => Some("num_seats"),
            _ => None,
        }
    }
}

impl VoteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteMethod::Threshold => "threshold",
            VoteMethod::Ranked => "ranked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "threshold" => Some(VoteMethod::Threshold),
            "ranked" => Some(VoteMethod::Ranked),
            _ => None,
        }
    }
}

impl VoteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteState::Unopened => "unopened",
            VoteState::Live => "live",
            VoteState::Counting => "counting",
            VoteState::PausedForTieBreak => "paused_for_tie_break",
            VoteState::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unopened" => Some(VoteState::Unopened),
            "live" => Some(VoteState::Live),
            "counting" => Some(VoteState::Counting),
            "paused_for_tie_break" => Some(VoteState::PausedForTieBreak),
            "closed" => Some(VoteState::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for VoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ThresholdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdKind::Simple => "simple",
            ThresholdKind::TwoThirds => "two_thirds",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(ThresholdKind::Simple),
            "two_thirds" => Some(ThresholdKind::TwoThirds),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ThresholdKind::Simple => "Simple Majority",
            ThresholdKind::TwoThirds => "Two-Thirds Majority",
        }
    }
}

impl TieKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TieKind::Eliminate => "eliminate",
            TieKind::FinalSeat => "final_seat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eliminate" => Some(TieKind::Eliminate),
            "final_seat" => Some(TieKind::FinalSeat),
            _ => None,
        }
    }
}
