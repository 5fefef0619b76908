use crate::error::{Result, TallyError};
use crate::models::{
    BallotEntry, CandidateCount, Loser, RankedResult, RoundRecord, TieKind, Vote, Winner,
};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::ops::{AddAssign, Sub};

// Five decimal places of vote arithmetic.
const PRECISION: u64 = 100_000;

/// A vote count in fixed point, 1 vote == `PRECISION` units.
#[derive(Eq, PartialEq, Debug, Clone, Copy, PartialOrd, Ord, Hash, Default)]
struct Votes(u64);

impl Votes {
    const ZERO: Votes = Votes(0);

    fn whole(n: u64) -> Votes {
        Votes(n * PRECISION)
    }

    /// `self * num / den`, truncated.
    fn scaled(self, num: Votes, den: Votes) -> Votes {
        if den == Votes::ZERO {
            return Votes::ZERO;
        }
        Votes((u128::from(self.0) * u128::from(num.0) / u128::from(den.0)) as u64)
    }

    fn as_f64(self) -> f64 {
        self.0 as f64 / PRECISION as f64
    }
}

impl AddAssign for Votes {
    fn add_assign(&mut self, rhs: Votes) {
        self.0 += rhs.0;
    }
}

impl Sub for Votes {
    type Output = Votes;
    fn sub(self, rhs: Votes) -> Votes {
        Votes(self.0.saturating_sub(rhs.0))
    }
}

/// What a ranked count works from: candidate names in option order, and one
/// preference list (candidate indices, best first) per voter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedInput {
    pub option_ids: Vec<String>,
    pub names: Vec<String>,
    pub ballots: Vec<Vec<usize>>,
    pub seats: u32,
}

impl RankedInput {
    /// Groups stored entries into ballots. Entries that do not fit the vote
    /// mean the stored data is damaged and the count must not go on.
    pub fn from_entries(vote: &Vote, entries: &[BallotEntry], seats: u32) -> Result<Self> {
        let index: HashMap<&str, usize> = vote
            .options
            .iter()
            .enumerate()
            .map(|(i, o)| (o.id.as_str(), i))
            .collect();

        let mut by_voter: BTreeMap<&str, Vec<(i64, usize)>> = BTreeMap::new();
        for entry in entries {
            let cid = *index.get(entry.option_id.as_str()).ok_or_else(|| {
                TallyError::Corrupt(format!(
                    "ballot entry of voter {} references unknown option {}",
                    entry.voter_id, entry.option_id
                ))
            })?;
            if entry.value < 1 {
                return Err(TallyError::Corrupt(format!(
                    "ballot entry of voter {} has rank {}",
                    entry.voter_id, entry.value
                )));
            }
            by_voter
                .entry(entry.voter_id.as_str())
                .or_default()
                .push((entry.value, cid));
        }

        let mut ballots = Vec::with_capacity(by_voter.len());
        for (voter, mut prefs) in by_voter {
            prefs.sort();
            let ranked: Vec<usize> = prefs.iter().map(|(_, cid)| *cid).collect();
            let mut seen = ranked.clone();
            seen.sort_unstable();
            seen.dedup();
            if seen.len() != ranked.len() {
                return Err(TallyError::Corrupt(format!(
                    "voter {} ranked the same option twice",
                    voter
                )));
            }
            ballots.push(ranked);
        }

        Ok(RankedInput {
            option_ids: vote.options.iter().map(|o| o.id.clone()).collect(),
            names: vote.options.iter().map(|o| o.name.clone()).collect(),
            ballots,
            seats,
        })
    }
}

/// A decision the count cannot make on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tie {
    pub kind: TieKind,
    pub round: u32,
    /// Candidate indices, in option order.
    pub tied: Vec<usize>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    NeedsDecision(Tie),
    Finished(RankedResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Continuing,
    Elected { surplus_done: bool },
    Lost { round: u32 },
}

#[derive(Debug, Clone)]
struct Ballot {
    prefs: Vec<usize>,
    weight: Votes,
    // Index into `prefs` of the candidate currently holding the ballot.
    at: Option<usize>,
}

impl Ballot {
    fn holder(&self) -> Option<usize> {
        self.at.map(|i| self.prefs[i])
    }
}

/// Multi-seat single transferable vote count that stops whenever it needs an
/// outside decision and picks up exactly where it stopped.
///
/// Droop quota, weighted inclusive Gregory surplus transfers, five decimal
/// places with truncation.
#[derive(Debug, Clone)]
pub struct RankedTally {
    names: Vec<String>,
    seats: u32,
    num_ballots: u64,
    quota: Votes,
    ballots: Vec<Ballot>,
    counts: Vec<Votes>,
    status: Vec<Status>,
    exhausted: Votes,
    round: u32,
    winners: Vec<(usize, u32)>,
    rounds: Vec<RoundRecord>,
    open_round: Option<RoundRecord>,
    awaiting: Option<Tie>,
    finished: bool,
}

impl RankedTally {
    pub fn new(input: RankedInput) -> Result<Self> {
        if input.seats == 0 {
            return Err(TallyError::InvalidParameter(
                "number of seats must be at least 1".to_string(),
            ));
        }
        let num_candidates = input.names.len();
        let num_ballots = input.ballots.len() as u64;
        let quota = Votes::whole(num_ballots / (u64::from(input.seats) + 1) + 1);

        let mut counts = vec![Votes::ZERO; num_candidates];
        let mut ballots = Vec::with_capacity(input.ballots.len());
        for prefs in input.ballots {
            if let Some(&cid) = prefs.iter().find(|&&cid| cid >= num_candidates) {
                return Err(TallyError::Corrupt(format!("ballot names candidate {}", cid)));
            }
            let at = if prefs.is_empty() { None } else { Some(0) };
            if let Some(&first) = prefs.first() {
                counts[first] += Votes::whole(1);
            }
            ballots.push(Ballot {
                prefs,
                weight: Votes::whole(1),
                at,
            });
        }

        debug!(
            "Ranked count: {} candidates, {} ballots, {} seats, quota {}",
            num_candidates,
            num_ballots,
            input.seats,
            quota.as_f64()
        );

        Ok(Self {
            names: input.names,
            seats: input.seats,
            num_ballots,
            quota,
            ballots,
            counts,
            status: vec![Status::Continuing; num_candidates],
            exhausted: Votes::ZERO,
            round: 1,
            winners: Vec::new(),
            rounds: Vec::new(),
            open_round: None,
            awaiting: None,
            finished: false,
        })
    }

    /// Runs until the count is over or a tie needs deciding.
    pub fn advance(&mut self) -> Result<Progress> {
        loop {
            if let Some(tie) = &self.awaiting {
                return Ok(Progress::NeedsDecision(tie.clone()));
            }
            if self.finished {
                return Ok(Progress::Finished(self.result()));
            }
            self.step();
        }
    }

    /// Applies the answer to the pending tie. The next `advance` resumes from
    /// the round that raised it.
    pub fn decide(&mut self, chosen: usize) -> Result<()> {
        let Some(tie) = self.awaiting.take() else {
            return Err(TallyError::Aborted(
                "a decision was supplied but no tie is pending".to_string(),
            ));
        };
        if !tie.tied.contains(&chosen) {
            let shown = self
                .names
                .get(chosen)
                .cloned()
                .unwrap_or_else(|| chosen.to_string());
            self.awaiting = Some(tie);
            return Err(TallyError::InvalidTieChoice(shown));
        }

        let mut record = self.open_round.take().unwrap_or_else(|| self.snapshot());
        debug!(
            "Round {}: tie ({}) decided for {}",
            tie.round,
            tie.kind.as_str(),
            self.names[chosen]
        );
        match tie.kind {
            TieKind::Eliminate => self.eliminate(chosen, record),
            TieKind::FinalSeat => {
                self.elect(chosen, &mut record);
                self.finish(record);
            }
        }
        Ok(())
    }

    fn step(&mut self) {
        let mut record = self.snapshot();

        let mut reaching: Vec<usize> = self
            .continuing()
            .into_iter()
            .filter(|&c| self.counts[c] >= self.quota)
            .collect();
        self.sort_by_count_desc(&mut reaching);
        for c in reaching {
            if self.seats_left() == 0 {
                break;
            }
            self.elect(c, &mut record);
        }
        if self.seats_left() == 0 {
            self.finish(record);
            return;
        }

        let mut continuing = self.continuing();
        if continuing.len() <= self.seats_left() {
            self.sort_by_count_desc(&mut continuing);
            for c in continuing {
                self.elect(c, &mut record);
            }
            self.finish(record);
            return;
        }

        if let Some(c) = self.largest_surplus() {
            record.surplus_from = Some(self.names[c].clone());
            self.rounds.push(record);
            self.transfer_surplus(c);
            self.round += 1;
            return;
        }

        let lowest = self.lowest(&continuing);
        if self.seats_left() == 1 && lowest.len() == continuing.len() {
            self.await_decision(TieKind::FinalSeat, continuing, record);
        } else if lowest.len() > 1 {
            self.await_decision(TieKind::Eliminate, lowest, record);
        } else {
            self.eliminate(lowest[0], record);
        }
    }

    fn snapshot(&self) -> RoundRecord {
        RoundRecord {
            round: self.round,
            counts: self
                .names
                .iter()
                .zip(&self.counts)
                .map(|(name, votes)| CandidateCount {
                    name: name.clone(),
                    votes: votes.as_f64(),
                })
                .collect(),
            exhausted: self.exhausted.as_f64(),
            elected: Vec::new(),
            eliminated: Vec::new(),
            surplus_from: None,
        }
    }

    fn continuing(&self) -> Vec<usize> {
        (0..self.names.len())
            .filter(|&c| self.status[c] == Status::Continuing)
            .collect()
    }

    fn seats_left(&self) -> usize {
        (self.seats as usize).saturating_sub(self.winners.len())
    }

    fn sort_by_count_desc(&self, candidates: &mut [usize]) {
        candidates.sort_by(|&a, &b| self.counts[b].cmp(&self.counts[a]).then(a.cmp(&b)));
    }

    fn lowest(&self, continuing: &[usize]) -> Vec<usize> {
        let Some(min) = continuing.iter().map(|&c| self.counts[c]).min() else {
            return Vec::new();
        };
        continuing
            .iter()
            .copied()
            .filter(|&c| self.counts[c] == min)
            .collect()
    }

    fn largest_surplus(&self) -> Option<usize> {
        (0..self.names.len())
            .filter(|&c| {
                self.status[c] == Status::Elected { surplus_done: false }
                    && self.counts[c] > self.quota
            })
            .max_by(|&a, &b| {
                (self.counts[a] - self.quota)
                    .cmp(&(self.counts[b] - self.quota))
                    .then(b.cmp(&a))
            })
    }

    fn elect(&mut self, c: usize, record: &mut RoundRecord) {
        debug!("Round {}: {} elected", self.round, self.names[c]);
        self.status[c] = Status::Elected {
            surplus_done: self.counts[c] <= self.quota,
        };
        self.winners.push((c, self.round));
        record.elected.push(self.names[c].clone());
    }

    fn eliminate(&mut self, c: usize, mut record: RoundRecord) {
        debug!("Round {}: {} eliminated", self.round, self.names[c]);
        record.eliminated.push(self.names[c].clone());
        self.rounds.push(record);
        self.status[c] = Status::Lost { round: self.round };
        for b in 0..self.ballots.len() {
            if self.ballots[b].holder() == Some(c) {
                self.move_on(b);
            }
        }
        self.counts[c] = Votes::ZERO;
        self.round += 1;
    }

    fn transfer_surplus(&mut self, c: usize) {
        let total = self.counts[c];
        let surplus = total - self.quota;
        debug!(
            "Round {}: transferring surplus {} of {}",
            self.round,
            surplus.as_f64(),
            self.names[c]
        );
        for b in 0..self.ballots.len() {
            if self.ballots[b].holder() == Some(c) {
                let weight = self.ballots[b].weight.scaled(surplus, total);
                self.ballots[b].weight = weight;
                self.move_on(b);
            }
        }
        self.counts[c] = self.quota;
        self.status[c] = Status::Elected { surplus_done: true };
    }

    // Hands the ballot to its next continuing preference, or exhausts it.
    fn move_on(&mut self, b: usize) {
        let ballot = &self.ballots[b];
        let start = ballot.at.map_or(0, |i| i + 1);
        let next = (start..ballot.prefs.len())
            .find(|&i| self.status[ballot.prefs[i]] == Status::Continuing);
        let weight = ballot.weight;
        match next {
            Some(i) => {
                let cid = self.ballots[b].prefs[i];
                self.ballots[b].at = Some(i);
                self.counts[cid] += weight;
            }
            None => {
                self.ballots[b].at = None;
                self.exhausted += weight;
            }
        }
    }

    fn await_decision(&mut self, kind: TieKind, tied: Vec<usize>, record: RoundRecord) {
        debug!(
            "Round {}: tie ({}) between {:?}",
            self.round,
            kind.as_str(),
            tied.iter().map(|&c| &self.names[c]).collect::<Vec<_>>()
        );
        self.awaiting = Some(Tie {
            kind,
            round: self.round,
            tied,
            names: self.names.clone(),
        });
        self.open_round = Some(record);
    }

    fn finish(&mut self, record: RoundRecord) {
        for c in self.continuing() {
            self.status[c] = Status::Lost { round: self.round };
        }
        self.rounds.push(record);
        self.finished = true;
    }

    fn result(&self) -> RankedResult {
        let winners = self
            .winners
            .iter()
            .enumerate()
            .map(|(i, &(c, round))| Winner {
                name: self.names[c].clone(),
                order: i as u32 + 1,
                round,
            })
            .collect();

        let mut lost: Vec<(u32, usize)> = self
            .status
            .iter()
            .enumerate()
            .filter_map(|(c, s)| match s {
                Status::Lost { round } => Some((*round, c)),
                _ => None,
            })
            .collect();
        lost.sort();
        let losers = lost
            .into_iter()
            .map(|(round, c)| Loser {
                name: self.names[c].clone(),
                round,
            })
            .collect();

        RankedResult {
            winners,
            losers,
            seats: self.seats,
            num_ballots: self.num_ballots,
            quota: self.quota.as_f64(),
            rounds: self.rounds.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn input(names: &[&str], ballots: &[(Vec<usize>, usize)], seats: u32) -> RankedInput {
        let mut all = Vec::new();
        for (prefs, times) in ballots {
            for _ in 0..*times {
                all.push(prefs.clone());
            }
        }
        RankedInput {
            option_ids: names.iter().map(|n| format!("id-{}", n)).collect(),
            names: names.iter().map(|n| n.to_string()).collect(),
            ballots: all,
            seats,
        }
    }

    fn count_to_end<F>(input: RankedInput, mut decide: F) -> RankedResult
    where
        F: FnMut(&Tie) -> usize,
    {
        let mut tally = RankedTally::new(input).unwrap();
        loop {
            match tally.advance().unwrap() {
                Progress::Finished(result) => return result,
                Progress::NeedsDecision(tie) => tally.decide(decide(&tie)).unwrap(),
            }
        }
    }

    fn first_tied(tie: &Tie) -> usize {
        tie.tied[0]
    }

    fn names(winners: &[Winner]) -> Vec<&str> {
        winners.iter().map(|w| w.name.as_str()).collect()
    }

    #[test]
    fn single_seat_transfers_eliminated_votes() {
        let (a, b, c) = (0, 1, 2);
        let result = count_to_end(
            input(
                &["A", "B", "C"],
                &[(vec![a, b], 4), (vec![b, a], 3), (vec![c, b], 2)],
                1,
            ),
            first_tied,
        );
        assert_eq!(result.quota, 5.0);
        assert_eq!(names(&result.winners), vec!["B"]);
        assert_eq!(result.winners[0].round, 2);
        assert_eq!(
            result.losers,
            vec![
                Loser { name: "C".into(), round: 1 },
                Loser { name: "A".into(), round: 2 },
            ]
        );
        assert_eq!(result.rounds.len(), 2);
        assert_eq!(result.rounds[0].eliminated, vec!["C".to_string()]);
        assert_eq!(result.rounds[1].counts[1].votes, 5.0);
    }

    #[test]
    fn surplus_is_transferred_at_fractional_value() {
        let (a, b, c, d) = (0, 1, 2, 3);
        let result = count_to_end(
            input(
                &["A", "B", "C", "D"],
                &[(vec![a, b], 6), (vec![c], 2), (vec![d], 1)],
                2,
            ),
            first_tied,
        );
        assert_eq!(result.quota, 4.0);
        assert_eq!(names(&result.winners), vec!["A", "C"]);
        assert_eq!(result.winners[0].round, 1);
        assert_eq!(result.winners[1].round, 4);
        assert_eq!(result.winners[1].order, 2);

        assert_eq!(result.rounds[0].surplus_from.as_deref(), Some("A"));
        let round2 = &result.rounds[1];
        assert_eq!(round2.counts[0].votes, 4.0);
        assert_eq!(round2.counts[1].votes, 1.99998);
        assert_eq!(round2.eliminated, vec!["D".to_string()]);
        assert_eq!(result.rounds[2].eliminated, vec!["B".to_string()]);
        assert_eq!(result.rounds[3].exhausted, 2.99998);
    }

    #[test]
    fn continuing_counts_never_drop_between_rounds() {
        let (a, b, c, d) = (0, 1, 2, 3);
        let result = count_to_end(
            input(
                &["A", "B", "C", "D"],
                &[(vec![a, b, c], 6), (vec![c, b], 2), (vec![d, b], 1), (vec![b], 1)],
                2,
            ),
            first_tied,
        );
        let settled_by = |name: &str, round: u32| {
            result.winners.iter().any(|w| w.name == name && w.round <= round)
                || result.losers.iter().any(|l| l.name == name && l.round <= round)
        };
        for pair in result.rounds.windows(2) {
            for (before, after) in pair[0].counts.iter().zip(&pair[1].counts) {
                if !settled_by(&before.name, pair[0].round) {
                    assert!(after.votes >= before.votes, "{} dropped", before.name);
                }
            }
        }
    }

    #[test]
    fn tied_lowest_candidates_wait_for_a_decision() {
        let (a, b, c) = (0, 1, 2);
        let mut tally = RankedTally::new(input(
            &["A", "B", "C"],
            &[(vec![a], 2), (vec![b, a], 1), (vec![c, a], 1)],
            1,
        ))
        .unwrap();

        let tie = match tally.advance().unwrap() {
            Progress::NeedsDecision(tie) => tie,
            other => panic!("expected a tie, got {:?}", other),
        };
        assert_eq!(tie.kind, TieKind::Eliminate);
        assert_eq!(tie.round, 1);
        assert_eq!(tie.tied, vec![b, c]);
        assert_eq!(tie.names, vec!["A", "B", "C"]);

        // Asking again repeats the same question until answered.
        assert_eq!(tally.advance().unwrap(), Progress::NeedsDecision(tie.clone()));

        let err = tally.decide(a).unwrap_err();
        assert_eq!(err.kind(), "invalid_tie_choice");

        tally.decide(c).unwrap();
        let result = match tally.advance().unwrap() {
            Progress::Finished(result) => result,
            other => panic!("expected a result, got {:?}", other),
        };
        assert_eq!(names(&result.winners), vec!["A"]);
        assert_eq!(result.winners[0].round, 2);
        assert_eq!(result.losers[0], Loser { name: "C".into(), round: 1 });
        assert_eq!(result.losers[1], Loser { name: "B".into(), round: 2 });
    }

    #[test]
    fn all_tied_for_the_last_seat_asks_who_wins_it() {
        let (a, b) = (0, 1);
        let mut tally =
            RankedTally::new(input(&["A", "B"], &[(vec![a], 1), (vec![b], 1)], 1)).unwrap();
        let tie = match tally.advance().unwrap() {
            Progress::NeedsDecision(tie) => tie,
            other => panic!("expected a tie, got {:?}", other),
        };
        assert_eq!(tie.kind, TieKind::FinalSeat);
        assert_eq!(tie.tied, vec![a, b]);

        tally.decide(b).unwrap();
        let Progress::Finished(result) = tally.advance().unwrap() else {
            panic!("count should be over");
        };
        assert_eq!(names(&result.winners), vec!["B"]);
        assert_eq!(result.losers, vec![Loser { name: "A".into(), round: 1 }]);
    }

    #[test]
    fn decision_without_a_tie_is_refused() {
        let mut tally = RankedTally::new(input(&["A", "B"], &[(vec![0], 3)], 1)).unwrap();
        assert_eq!(tally.decide(0).unwrap_err().kind(), "aborted");
    }

    #[test]
    fn fewer_candidates_than_seats_elects_everyone() {
        let result = count_to_end(input(&["A", "B"], &[(vec![0, 1], 1)], 3), first_tied);
        assert_eq!(names(&result.winners), vec!["A", "B"]);
        assert!(result.losers.is_empty());
        assert_eq!(result.seats, 3);
    }

    #[test]
    fn winners_fill_every_seat_and_nobody_is_counted_twice() {
        let elections: Vec<RankedInput> = vec![
            input(
                &["N", "A", "B", "C", "D"],
                &[(vec![1, 2], 5), (vec![2, 3], 4), (vec![3], 3), (vec![4, 1], 2), (vec![0], 1)],
                2,
            ),
            input(&["N", "A", "B", "C"], &[(vec![1], 1), (vec![2], 1), (vec![3], 1)], 2),
            input(&["N", "A", "B"], &[], 1),
            input(
                &["A", "B", "C", "D", "E"],
                &[(vec![0, 1, 2], 7), (vec![1, 0], 6), (vec![2, 3, 4], 5), (vec![4, 3], 2)],
                3,
            ),
        ];
        for election in elections {
            let candidates = election.names.len();
            let seats = election.seats as usize;
            let result = count_to_end(election, first_tied);
            assert_eq!(result.winners.len(), seats.min(candidates));

            let mut seen = HashSet::new();
            for name in result
                .winners
                .iter()
                .map(|w| &w.name)
                .chain(result.losers.iter().map(|l| &l.name))
            {
                assert!(seen.insert(name.clone()), "{} appears twice", name);
            }
            assert_eq!(seen.len(), candidates);
        }
    }

    #[test]
    fn identical_input_and_decisions_give_identical_records() {
        let make = || {
            input(
                &["N", "A", "B", "C"],
                &[(vec![1, 2], 3), (vec![2, 1], 3), (vec![3, 1], 2), (vec![0], 2)],
                2,
            )
        };
        let first = serde_json::to_string(&count_to_end(make(), |t| *t.tied.last().unwrap())).unwrap();
        let second =
            serde_json::to_string(&count_to_end(make(), |t| *t.tied.last().unwrap())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_seats_is_rejected() {
        let err = RankedTally::new(input(&["A"], &[], 0)).unwrap_err();
        assert_eq!(err.kind(), "invalid_parameter");
    }

    #[test]
    fn entries_are_grouped_per_voter_in_rank_order() {
        use crate::models::{VoteMethod, VoteOption};
        use chrono::Utc;

        let mut vote = Vote::new("set".into(), "Board".into(), VoteMethod::Ranked);
        for (i, name) in ["A", "B"].iter().enumerate() {
            vote.options.push(VoteOption {
                id: name.to_string(),
                vote_id: vote.id.clone(),
                name: name.to_string(),
                position: i as i64 + 1,
            });
        }
        let entry = |voter: &str, option: &str, value: i64| BallotEntry {
            voter_id: voter.into(),
            option_id: option.into(),
            value,
            cast_at: Utc::now(),
        };
        let entries = vec![
            entry("v1", "B", 1),
            entry("v1", "A", 2),
            entry("v2", "A", 1),
        ];
        let input = RankedInput::from_entries(&vote, &entries, 1).unwrap();
        assert_eq!(input.names, vec!["None of the above", "A", "B"]);
        assert_eq!(input.ballots, vec![vec![2, 1], vec![1]]);

        let broken = vec![entry("v3", "ghost", 1)];
        let err = RankedInput::from_entries(&vote, &broken, 1).unwrap_err();
        assert_eq!(err.kind(), "storage");
    }
}
