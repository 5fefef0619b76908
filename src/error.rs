use crate::models::VoteState;
use thiserror::Error;

pub const INSUFFICIENT_OPTIONS_MESSAGE: &str =
    "This ballot needs at least 2 candidates to open. Please add more candidates and try again.";

/// Every rejection the engine can hand back. Rejected operations never
/// change stored data.
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("{message}")]
    InsufficientOptions { message: String },

    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("not allowed while the vote is {state}: {reason}")]
    InvalidState { state: VoteState, reason: String },

    #[error("invalid ballot: {0}")]
    InvalidBallot(String),

    #[error("no tie break is pending for vote {0}")]
    NoPendingTieBreak(String),

    #[error("option {0} is not one of the tied options")]
    InvalidTieChoice(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is not permitted to manage this vote")]
    PermissionDenied(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("result encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("tally aborted: {0}")]
    Aborted(String),
}

impl TallyError {
    pub fn insufficient_options() -> Self {
        TallyError::InsufficientOptions {
            message: INSUFFICIENT_OPTIONS_MESSAGE.to_string(),
        }
    }

    pub fn invalid_state(state: VoteState, reason: impl Into<String>) -> Self {
        TallyError::InvalidState {
            state,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TallyError::InsufficientOptions { .. } => "insufficient_options",
            TallyError::MissingParameter(_) => "missing_parameter",
            TallyError::InvalidParameter(_) => "invalid_parameter",
            TallyError::InvalidState { .. } => "invalid_state",
            TallyError::InvalidBallot(_) => "invalid_ballot",
            TallyError::NoPendingTieBreak(_) => "no_pending_tie_break",
            TallyError::InvalidTieChoice(_) => "invalid_tie_choice",
            TallyError::NotFound(_) => "not_found",
            TallyError::PermissionDenied(_) => "permission_denied",
            TallyError::Database(_) | TallyError::Encoding(_) | TallyError::Corrupt(_) => {
                "storage"
            }
            TallyError::Aborted(_) => "aborted",
        }
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;
