use super::{Command, OptionEdit, format_error};
use crate::error::{Result, TallyError};
use crate::lifecycle::VoteLifecycle;
use crate::models::{Vote, VoteState};

/// Runs one parsed command and describes what happened.
pub(super) async fn execute(lifecycle: &VoteLifecycle, actor: &str, command: Command) -> Result<String> {
    match command {
        Command::Create {
            meeting,
            method,
            name,
        } => {
            let vote = lifecycle
                .create_vote(actor, &meeting, &name.join(" "), method)
                .await?;
            Ok(format!("created vote {} ({})", vote.id, describe_options(&vote)))
        }
        Command::Options {
            edit: OptionEdit::Add { vote, name },
        } => {
            let option = lifecycle.add_option(actor, &vote, &name.join(" ")).await?;
            Ok(format!("added option {} ({})", option.name, option.id))
        }
        Command::Options {
            edit: OptionEdit::Remove { vote, option },
        } => {
            let option = option.join(" ");
            let option_id = option_id(lifecycle, &vote, &option).await?;
            lifecycle.remove_option(actor, &vote, &option_id).await?;
            Ok(format!("removed option {}", option))
        }
        Command::Set { vote, key, value } => {
            lifecycle.set_parameter(actor, &vote, &key, &value).await?;
            Ok(format!("{} = {}", key, value))
        }
        Command::Open { vote } => {
            let state = lifecycle.open(actor, &vote).await?;
            Ok(format!("vote {} is {}", vote, state))
        }
        Command::Close { vote, overrides } => {
            let state = lifecycle.close(actor, &vote, overrides.into()).await?;
            Ok(format!("vote {} is {}", vote, state))
        }
        Command::Tie { vote, option } if option.is_empty() => match lifecycle.pending_tie(&vote).await? {
            Some(request) => {
                let stored = lifecycle.vote(&vote).await?;
                let names: Vec<String> = request
                    .tied_option_ids
                    .iter()
                    .map(|id| option_label(&stored, id))
                    .collect();
                Ok(format!(
                    "round {} needs a decision ({}) between {}",
                    request.round,
                    request.kind.as_str(),
                    names.join(", ")
                ))
            }
            None => Ok(format!("no tie is pending for vote {}", vote)),
        },
        Command::Tie { vote, option } => {
            let option = option.join(" ");
            let option_id = option_id(lifecycle, &vote, &option).await?;
            lifecycle.resolve_tie(actor, &vote, &option_id).await?;
            Ok(format!("tie resolved for {}, counting resumes", option))
        }
        Command::Ballot { vote, voter, marks } => {
            let stored = lifecycle.vote(&vote).await?;
            let marks: Vec<(String, String)> = marks
                .into_iter()
                .map(|(option, value)| {
                    let id = stored
                        .option(&option)
                        .or_else(|| stored.option_named(&option))
                        .map(|o| o.id.clone())
                        .unwrap_or(option);
                    (id, value)
                })
                .collect();
            let stored_entries = lifecycle.cast_ballot(&vote, &voter, &marks).await?;
            Ok(format!("ballot from {} recorded ({} entries)", voter, stored_entries))
        }
        Command::Show { vote } => show(lifecycle, &vote).await,
        Command::Reset { vote } => {
            let state = lifecycle.reset(actor, &vote).await?;
            Ok(format!("vote {} is {}", vote, state))
        }
        Command::Regenerate {
            vote: Some(vote),
            all: None,
            overrides,
        } => {
            let state = lifecycle.regenerate(actor, &vote, overrides.into()).await?;
            Ok(format!("vote {} is {}", vote, state))
        }
        Command::Regenerate {
            vote: None,
            all: Some(method),
            overrides,
        } => {
            let regenerated = lifecycle
                .regenerate_all(actor, method, overrides.into())
                .await?;
            Ok(format!(
                "regenerating {} closed {} vote(s){}",
                regenerated.len(),
                method.as_str(),
                listed(&regenerated)
            ))
        }
        Command::Regenerate { .. } => Err(TallyError::InvalidParameter(
            "name one vote or use --all <method>".to_string(),
        )),
        Command::Delete { vote } => {
            lifecycle.delete_vote(actor, &vote).await?;
            Ok(format!("deleted vote {}", vote))
        }
        Command::CloseMeeting { meeting } => {
            let closure = lifecycle.close_meeting(actor, &meeting).await?;
            let mut out = format!(
                "meeting {} closed, counting {} vote(s), deleted {}",
                meeting,
                closure.counting.len(),
                closure.deleted.len()
            );
            for (vote_id, e) in &closure.failed {
                out.push_str(&format!("\n  vote {} was left as it was: {}", vote_id, format_error(e)));
            }
            Ok(out)
        }
        Command::Quit => Ok(String::new()),
    }
}

/// Accepts an option id or an option name.
async fn option_id(lifecycle: &VoteLifecycle, vote_id: &str, option: &str) -> Result<String> {
    let vote = lifecycle.vote(vote_id).await?;
    Ok(vote
        .option(option)
        .or_else(|| vote.option_named(option))
        .map(|o| o.id.clone())
        .unwrap_or_else(|| option.to_string()))
}

fn listed(ids: &[String]) -> String {
    if ids.is_empty() {
        String::new()
    } else {
        format!(": {}", ids.join(", "))
    }
}

fn option_label(vote: &Vote, option_id: &str) -> String {
    vote.option(option_id)
        .map(|o| o.name.clone())
        .unwrap_or_else(|| option_id.to_string())
}

fn describe_options(vote: &Vote) -> String {
    let names: Vec<&str> = vote.options.iter().map(|o| o.name.as_str()).collect();
    format!("options: {}", names.join(", "))
}

async fn show(lifecycle: &VoteLifecycle, vote_id: &str) -> Result<String> {
    let vote = lifecycle.vote(vote_id).await?;
    let mut out = format!(
        "{} \"{}\" [{}] {} in meeting {}; {}",
        vote.id,
        vote.name,
        vote.method.as_str(),
        vote.state,
        vote.ballot_set_id,
        describe_options(&vote)
    );
    if let Some(kind) = vote.params.majority_threshold {
        out.push_str(&format!("; majority_threshold={}", kind.as_str()));
    }
    if let Some(seats) = vote.params.num_seats {
        out.push_str(&format!("; num_seats={}", seats));
    }
    if vote.state == VoteState::Closed {
        if let Some(results) = lifecycle.results(vote_id).await? {
            out.push('\n');
            out.push_str(&results.text);
        }
    }
    Ok(out)
}
