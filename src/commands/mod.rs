mod vote;

use crate::error::TallyError;
use crate::lifecycle::{VoteLifecycle, parse_seats};
use crate::models::{ThresholdKind, VoteMethod, VoteParams};
use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};

/// One console line.
#[derive(Parser, Debug)]
#[command(
    name = "meeting-tally",
    no_binary_name = true,
    disable_version_flag = true,
    about = "Manage meeting votes and their counts"
)]
pub struct Console {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create a vote in a meeting
    Create {
        meeting: String,
        /// threshold or ranked
        #[arg(value_parser = parse_method)]
        method: VoteMethod,
        #[arg(required = true)]
        name: Vec<String>,
    },
    /// Add or remove a candidate before the vote opens
    #[command(name = "option")]
    Options {
        #[command(subcommand)]
        edit: OptionEdit,
    },
    /// Set majority_threshold or num_seats
    Set {
        vote: String,
        key: String,
        value: String,
    },
    /// Open a vote for ballots
    Open { vote: String },
    /// Close a live vote and start counting
    Close {
        vote: String,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Show the pending tie, or decide it by naming an option
    Tie { vote: String, option: Vec<String> },
    /// Record a ballot as OPTION=VALUE marks
    Ballot {
        vote: String,
        voter: String,
        #[arg(value_parser = parse_mark)]
        marks: Vec<(String, String)>,
    },
    /// Show a vote and, once closed, its results
    Show { vote: String },
    /// Put a counting, paused or closed vote back to live
    Reset { vote: String },
    /// Count a closed vote again, or every closed vote of one method
    Regenerate {
        vote: Option<String>,
        #[arg(
            long,
            value_name = "METHOD",
            value_parser = parse_method,
            conflicts_with = "vote",
            required_unless_present = "vote"
        )]
        all: Option<VoteMethod>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Delete an unopened vote
    Delete { vote: String },
    /// Close every live vote of a meeting and drop its unopened votes
    CloseMeeting { meeting: String },
    /// Leave the console
    #[command(alias = "exit")]
    Quit,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum OptionEdit {
    Add {
        vote: String,
        #[arg(required = true)]
        name: Vec<String>,
    },
    Remove {
        vote: String,
        #[arg(required = true)]
        option: Vec<String>,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// simple or two_thirds
    #[arg(long, value_parser = parse_threshold)]
    pub majority_threshold: Option<ThresholdKind>,
    #[arg(long, value_parser = parse_seat_count)]
    pub num_seats: Option<u32>,
}

impl From<Overrides> for VoteParams {
    fn from(overrides: Overrides) -> Self {
        VoteParams {
            majority_threshold: overrides.majority_threshold,
            num_seats: overrides.num_seats,
        }
    }
}

fn parse_method(value: &str) -> Result<VoteMethod, String> {
    VoteMethod::parse(value).ok_or_else(|| format!("unknown method {:?}, use threshold or ranked", value))
}

fn parse_threshold(value: &str) -> Result<ThresholdKind, String> {
    ThresholdKind::parse(value).ok_or_else(|| format!("unknown threshold kind {:?}", value))
}

fn parse_seat_count(value: &str) -> Result<u32, String> {
    parse_seats(value).map_err(|e| e.to_string())
}

fn parse_mark(value: &str) -> Result<(String, String), String> {
    value
        .rsplit_once('=')
        .map(|(option, mark)| (option.to_string(), mark.to_string()))
        .ok_or_else(|| format!("expected OPTION=VALUE, got {:?}", value))
}

/// Parses one console line. `Ok(None)` for blank lines and comments.
pub fn parse(line: &str) -> Result<Option<Command>, clap::Error> {
    if line.trim_start().starts_with('#') {
        return Ok(None);
    }
    let Some(words) = shlex::split(line) else {
        return Err(Console::command().error(ErrorKind::InvalidValue, "unbalanced quotes"));
    };
    if words.is_empty() {
        return Ok(None);
    }
    Console::try_parse_from(words).map(|console| Some(console.command))
}

/// Outcome of one console line.
pub enum Reply {
    Text(String),
    Quit,
}

pub async fn handle_line(lifecycle: &VoteLifecycle, actor: &str, line: &str) -> Option<Reply> {
    let command = match parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return None,
        Err(e) => return Some(Reply::Text(format_usage(&e))),
    };
    match command {
        Command::Quit => Some(Reply::Quit),
        command => Some(Reply::Text(
            match vote::execute(lifecycle, actor, command).await {
                Ok(message) => format!("ok: {}", message),
                Err(e) => format_error(&e),
            },
        )),
    }
}

/// Help passes through as is; anything else clap refused is a usage error.
fn format_usage(e: &clap::Error) -> String {
    let text = e.to_string();
    match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
            text.trim_end().to_string()
        }
        _ => format!("error[usage]: {}", text.trim_start_matches("error: ").trim_end()),
    }
}

pub fn format_error(e: &TallyError) -> String {
    format!("error[{}]: {}", e.kind(), e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn blank_lines_and_comments_are_skipped() {
        assert_eq!(parse("   ").unwrap(), None);
        assert_eq!(parse("# setup").unwrap(), None);
    }

    #[test]
    fn names_keep_their_spaces() {
        assert_eq!(
            parse("create agm ranked Board of Trustees").unwrap(),
            Some(Command::Create {
                meeting: "agm".into(),
                method: VoteMethod::Ranked,
                name: words(&["Board", "of", "Trustees"]),
            })
        );
        assert_eq!(
            parse("option add v1 \"Ada Lovelace\"").unwrap(),
            Some(Command::Options {
                edit: OptionEdit::Add {
                    vote: "v1".into(),
                    name: words(&["Ada Lovelace"]),
                },
            })
        );
    }

    #[test]
    fn close_takes_parameter_overrides() {
        let parsed = parse("close v1 --num-seats 2").unwrap().unwrap();
        assert_eq!(
            parsed,
            Command::Close {
                vote: "v1".into(),
                overrides: Overrides {
                    majority_threshold: None,
                    num_seats: Some(2),
                },
            }
        );
        assert!(parse("close v1 --num-seats 0").is_err());
        assert!(parse("close v1 --quorum 3").is_err());
        assert!(parse("close v1 --majority-threshold most").is_err());
    }

    #[test]
    fn ballots_are_option_value_pairs() {
        assert_eq!(
            parse("ballot v1 alice Ada=1 'Grace Hopper=2'").unwrap(),
            Some(Command::Ballot {
                vote: "v1".into(),
                voter: "alice".into(),
                marks: vec![
                    ("Ada".into(), "1".into()),
                    ("Grace Hopper".into(), "2".into())
                ],
            })
        );
        assert!(parse("ballot v1 alice Ada").is_err());
        assert!(parse("ballot v1 alice 'Ada=1").is_err());
    }

    #[test]
    fn tie_without_an_option_asks_what_is_pending() {
        assert_eq!(
            parse("tie v1").unwrap(),
            Some(Command::Tie {
                vote: "v1".into(),
                option: Vec::new(),
            })
        );
    }

    #[test]
    fn regenerate_takes_one_vote_or_a_whole_method() {
        assert_eq!(
            parse("regenerate --all ranked --num-seats 2").unwrap(),
            Some(Command::Regenerate {
                vote: None,
                all: Some(VoteMethod::Ranked),
                overrides: Overrides {
                    majority_threshold: None,
                    num_seats: Some(2),
                },
            })
        );
        let err = parse("regenerate v1 --all threshold").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        let err = parse("regenerate").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn unknown_commands_are_usage_errors() {
        let err = parse("vote now").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        assert!(format_usage(&err).starts_with("error[usage]: "));

        let err = parse("create agm plurality Chair").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn help_lists_the_commands() {
        let err = parse("help").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        let text = format_usage(&err);
        assert!(text.contains("close-meeting"));
        assert!(text.contains("regenerate"));
        assert!(!text.starts_with("error"));
    }

    #[test]
    fn exit_is_an_alias_for_quit() {
        assert_eq!(parse("exit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn errors_render_with_their_kind() {
        let e = TallyError::NoPendingTieBreak("v1".into());
        assert_eq!(format_error(&e), "error[no_pending_tie_break]: no tie break is pending for vote v1");
    }
}
