use crate::error::{Result, TallyError};
use crate::models::{BallotEntry, Vote, VoteMethod};
use chrono::Utc;
use std::collections::HashSet;

/// One submitted (option id, raw value) pair, as it arrives from a voter.
pub type SubmittedMark = (String, String);

/// Checks a voter's submission against the vote's method and turns it into
/// the entries to append.
pub fn validate_ballot(
    vote: &Vote,
    voter_id: &str,
    submission: &[SubmittedMark],
) -> Result<Vec<BallotEntry>> {
    let mut seen = HashSet::new();
    for (option_id, _) in submission {
        if vote.option(option_id).is_none() {
            return Err(TallyError::InvalidBallot(format!(
                "option {} does not belong to this vote",
                option_id
            )));
        }
        if !seen.insert(option_id.as_str()) {
            return Err(TallyError::InvalidBallot(format!(
                "option {} appears more than once",
                option_id
            )));
        }
    }

    let marks = match vote.method {
        VoteMethod::Threshold => threshold_marks(submission)?,
        VoteMethod::Ranked => ranked_marks(submission)?,
    };

    let now = Utc::now();
    Ok(marks
        .into_iter()
        .map(|(option_id, value)| BallotEntry {
            voter_id: voter_id.to_string(),
            option_id,
            value,
            cast_at: now,
        })
        .collect())
}

fn parse_value(raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| TallyError::InvalidBallot(format!("invalid preference value: {:?}", raw)))
}

fn threshold_marks(submission: &[SubmittedMark]) -> Result<Vec<(String, i64)>> {
    let mut marked = Vec::new();
    for (option_id, raw) in submission {
        match parse_value(raw)? {
            0 => {}
            1 => marked.push((option_id.clone(), 1)),
            other => {
                return Err(TallyError::InvalidBallot(format!(
                    "a yes/no/abstain mark must be 0 or 1, got {}",
                    other
                )));
            }
        }
    }
    if marked.len() != 1 {
        return Err(TallyError::InvalidBallot(format!(
            "exactly one option must be marked, found {}",
            marked.len()
        )));
    }
    Ok(marked)
}

/// Ranks must read 1, 2, 3, ... once sorted. Non-positive ranks are dropped.
fn ranked_marks(submission: &[SubmittedMark]) -> Result<Vec<(String, i64)>> {
    let mut preferences = Vec::new();
    for (option_id, raw) in submission {
        let value = parse_value(raw)?;
        if value >= 1 {
            preferences.push((option_id.clone(), value));
        }
    }

    preferences.sort_by_key(|(_, rank)| *rank);

    let mut expected = 1;
    for (_, rank) in &preferences {
        if *rank != expected {
            return Err(TallyError::InvalidBallot(format!(
                "Preferences must be consecutive whole numbers starting from 1. Expected {}, got {}",
                expected, rank
            )));
        }
        expected += 1;
    }
    Ok(preferences)
}
