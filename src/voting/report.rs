use crate::models::{RankedResult, ResultRecord, ThresholdResult};

/// Human-readable summary of a stored result. Pure, so re-rendering a stored
/// record always reproduces the stored text.
pub fn render(record: &ResultRecord) -> String {
    match record {
        ResultRecord::Threshold(result) => render_threshold(result),
        ResultRecord::Ranked(result) => render_ranked(result),
    }
}

fn render_threshold(result: &ThresholdResult) -> String {
    let mut summary = String::new();
    summary.push_str(&format!(
        "Yes: {} votes ({:.1}%)\n",
        result.yes, result.percentages.yes
    ));
    summary.push_str(&format!(
        "No: {} votes ({:.1}%)\n",
        result.no, result.percentages.no
    ));
    summary.push_str(&format!(
        "Abstain: {} votes ({:.1}%)\n\n",
        result.abstain, result.percentages.abstain
    ));
    summary.push_str(&format!("{} voters participated.\n", result.total));

    match (result.majority_threshold, result.passed) {
        (Some(kind), Some(true)) => {
            summary.push_str(&format!("**Passed** ({} required).", kind.label()))
        }
        (Some(kind), Some(false)) => {
            summary.push_str(&format!("**Failed** ({} required).", kind.label()))
        }
        _ => summary.push_str("No threshold was set, so the outcome is undetermined."),
    }
    summary
}

fn render_ranked(result: &RankedResult) -> String {
    let mut summary = String::new();
    summary.push_str(&format!(
        "{} seat(s), {} ballots, quota {}\n\n",
        result.seats,
        result.num_ballots,
        votes(result.quota)
    ));

    for round in &result.rounds {
        summary.push_str(&format!("**Round {}**\n", round.round));
        for count in &round.counts {
            summary.push_str(&format!("• {}: {} votes\n", count.name, votes(count.votes)));
        }
        if round.exhausted > 0.0 {
            summary.push_str(&format!("Exhausted: {}\n", votes(round.exhausted)));
        }
        if !round.elected.is_empty() {
            summary.push_str(&format!("Elected: {}\n", round.elected.join(", ")));
        }
        if let Some(from) = &round.surplus_from {
            summary.push_str(&format!("Transferring surplus of {}\n", from));
        }
        if !round.eliminated.is_empty() {
            summary.push_str(&format!("Eliminating: {}\n", round.eliminated.join(", ")));
        }
        summary.push('\n');
    }

    if result.winners.is_empty() {
        summary.push_str("Nobody was elected.");
    } else {
        let names: Vec<String> = result
            .winners
            .iter()
            .map(|w| format!("{}. **{}** (round {})", w.order, w.name, w.round))
            .collect();
        summary.push_str(&format!("Winners:\n{}", names.join("\n")));
    }
    summary
}

// Whole numbers print bare, fractions keep their five places.
fn votes(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.5}", value)
    }
}
