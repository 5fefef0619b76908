use crate::models::{
    BallotEntry, Percentages, ThresholdKind, ThresholdResult, Vote, ABSTAIN, NO, YES,
};
use log::error;

/// Counts a yes/no/abstain vote in a single pass.
///
/// Abstentions count towards the total and the percentages but not towards
/// the majority comparison. Without a threshold kind the outcome is left
/// undetermined rather than failing.
pub fn calculate_results(
    vote: &Vote,
    entries: &[BallotEntry],
    threshold: Option<ThresholdKind>,
) -> ThresholdResult {
    let id_of = |name: &str| vote.option_named(name).map(|o| o.id.as_str());
    let (yes_id, no_id, abs_id) = (id_of(YES), id_of(NO), id_of(ABSTAIN));

    let (mut y, mut n, mut a) = (0u64, 0u64, 0u64);
    for entry in entries.iter().filter(|e| e.value == 1) {
        let option = Some(entry.option_id.as_str());
        if option == yes_id {
            y += 1;
        } else if option == no_id {
            n += 1;
        } else if option == abs_id {
            a += 1;
        } else {
            error!(
                "Suspicious ballot entry from voter {} on option {} in yes/no/abstain vote {}",
                entry.voter_id, entry.option_id, vote.id
            );
        }
    }

    let total = y + n + a;
    let yes_no_total = y + n;
    let has_majority = yes_no_total > 0 && y > n;
    let has_two_thirds = yes_no_total > 0 && y >= 2 * n;

    let passed = threshold.map(|kind| match kind {
        ThresholdKind::Simple => has_majority,
        ThresholdKind::TwoThirds => has_two_thirds,
    });

    ThresholdResult {
        yes: y,
        no: n,
        abstain: a,
        total,
        percentages: Percentages {
            yes: percentage(y, total),
            no: percentage(n, total),
            abstain: percentage(a, total),
        },
        yes_no_total,
        has_majority,
        has_two_thirds,
        passed,
        majority_threshold: threshold,
    }
}

/// Share of `total`, rounded to one decimal place. Zero when nothing was cast.
fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 1000.0 / total as f64).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VoteMethod;
    use chrono::Utc;

    fn ballots(vote: &Vote, yes: usize, no: usize, abstain: usize) -> Vec<BallotEntry> {
        let mut entries = Vec::new();
        let mut voter = 0;
        for (name, count) in [(YES, yes), (NO, no), (ABSTAIN, abstain)] {
            let option_id = vote.option_named(name).unwrap().id.clone();
            for _ in 0..count {
                voter += 1;
                entries.push(BallotEntry {
                    voter_id: format!("voter-{}", voter),
                    option_id: option_id.clone(),
                    value: 1,
                    cast_at: Utc::now(),
                });
            }
        }
        entries
    }

    fn motion() -> Vote {
        Vote::new("set".into(), "Motion".into(), VoteMethod::Threshold)
    }

    #[test]
    fn six_to_four_passes_a_simple_majority() {
        let vote = motion();
        let result = calculate_results(&vote, &ballots(&vote, 6, 4, 0), Some(ThresholdKind::Simple));
        assert_eq!(result.yes, 6);
        assert_eq!(result.no, 4);
        assert_eq!(result.total, 10);
        assert_eq!(result.percentages.yes, 60.0);
        assert!(result.has_majority);
        assert_eq!(result.passed, Some(true));
    }

    #[test]
    fn six_to_four_fails_two_thirds() {
        let vote = motion();
        let result =
            calculate_results(&vote, &ballots(&vote, 6, 4, 0), Some(ThresholdKind::TwoThirds));
        assert!(!result.has_two_thirds);
        assert_eq!(result.passed, Some(false));
        assert_eq!(result.majority_threshold, Some(ThresholdKind::TwoThirds));
    }

    #[test]
    fn exactly_twice_as_many_yes_meets_two_thirds() {
        let vote = motion();
        let result =
            calculate_results(&vote, &ballots(&vote, 8, 4, 3), Some(ThresholdKind::TwoThirds));
        assert!(result.has_two_thirds);
        assert_eq!(result.yes_no_total, 12);
        assert_eq!(result.total, 15);
    }

    #[test]
    fn no_ballots_means_zero_percent_and_no_majority() {
        let vote = motion();
        let result = calculate_results(&vote, &[], Some(ThresholdKind::Simple));
        assert_eq!(result.total, 0);
        assert_eq!(result.percentages.yes, 0.0);
        assert_eq!(result.percentages.no, 0.0);
        assert_eq!(result.percentages.abstain, 0.0);
        assert!(!result.has_majority);
        assert!(!result.has_two_thirds);
        assert_eq!(result.passed, Some(false));
    }

    #[test]
    fn only_abstentions_never_carry_a_motion() {
        let vote = motion();
        let result = calculate_results(&vote, &ballots(&vote, 0, 0, 5), Some(ThresholdKind::Simple));
        assert_eq!(result.percentages.abstain, 100.0);
        assert!(!result.has_majority);
        assert!(!result.has_two_thirds);
    }

    #[test]
    fn missing_threshold_leaves_outcome_undetermined() {
        let vote = motion();
        let result = calculate_results(&vote, &ballots(&vote, 3, 1, 0), None);
        assert!(result.has_majority);
        assert_eq!(result.passed, None);
    }

    #[test]
    fn percentages_add_up_within_rounding() {
        let vote = motion();
        for (y, n, a) in [(1, 1, 1), (2, 3, 2), (7, 0, 4), (1, 5, 9)] {
            let r = calculate_results(&vote, &ballots(&vote, y, n, a), Some(ThresholdKind::Simple));
            let sum = r.percentages.yes + r.percentages.no + r.percentages.abstain;
            assert!((sum - 100.0).abs() <= 0.15, "{} {} {} summed to {}", y, n, a, sum);
        }
    }

    #[test]
    fn entries_outside_the_fixed_options_are_ignored() {
        let vote = motion();
        let mut entries = ballots(&vote, 1, 0, 0);
        entries.push(BallotEntry {
            voter_id: "stray".into(),
            option_id: "not-an-option".into(),
            value: 1,
            cast_at: Utc::now(),
        });
        let result = calculate_results(&vote, &entries, Some(ThresholdKind::Simple));
        assert_eq!(result.total, 1);
    }
}
