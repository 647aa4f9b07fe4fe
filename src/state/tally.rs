//! Local score keeping and the per-round idempotence guards.

use crate::state::state_machine::MatchResult;

/// Outcome of one round from the local player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundResult {
    /// Local player won the round.
    Win,
    /// Opponent won the round.
    Lose,
    /// Nobody scored.
    Tie,
    /// Local player acted during the penalty delay; the opponent scores.
    EarlyTap,
}

/// Scores and round history of one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchTally {
    points_per_round: u32,
    own_score: u32,
    opponent_score: u32,
    results: Vec<RoundResult>,
}

impl MatchTally {
    /// Empty tally awarding `points_per_round` per round won.
    pub fn new(points_per_round: u32) -> Self {
        Self {
            points_per_round,
            own_score: 0,
            opponent_score: 0,
            results: Vec::new(),
        }
    }

    /// Append a round result and update the scores.
    pub fn record(&mut self, result: RoundResult) {
        match result {
            RoundResult::Win => self.own_score += self.points_per_round,
            RoundResult::Lose | RoundResult::EarlyTap => {
                self.opponent_score += self.points_per_round
            }
            RoundResult::Tie => {}
        }
        self.results.push(result);
    }

    /// Local player's score.
    pub fn own_score(&self) -> u32 {
        self.own_score
    }

    /// Opponent's score.
    pub fn opponent_score(&self) -> u32 {
        self.opponent_score
    }

    /// Ordered round history.
    pub fn results(&self) -> &[RoundResult] {
        &self.results
    }

    /// Number of rounds with a recorded result.
    pub fn completed_rounds(&self) -> u32 {
        self.results.len() as u32
    }

    /// Final result by strict score comparison.
    pub fn final_result(&self) -> MatchResult {
        match self.own_score.cmp(&self.opponent_score) {
            std::cmp::Ordering::Greater => MatchResult::Win,
            std::cmp::Ordering::Less => MatchResult::Lose,
            std::cmp::Ordering::Equal => MatchResult::Tie,
        }
    }
}

/// Local "already did it" markers for the round in progress.
///
/// Signals and flags are re-delivered freely; each guard turns the matching action into a
/// no-op after its first run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundGuards {
    /// Round these guards belong to.
    pub round: u32,
    /// `round_number` observed when the round's countdown started.
    pub last_synced_round: u32,
    /// Ready countdown finished and `requested_start_<self>` was written.
    pub countdown_done: bool,
    /// Host broadcast `START_MATCH` for this round.
    pub start_sent: bool,
    /// Host advanced `round_number` for this round.
    pub round_incremented: bool,
    /// A move (or an early tap) was submitted.
    pub input_taken: bool,
    /// The round result entered the tally.
    pub result_recorded: bool,
    /// `winner_displayed_<self>` was written.
    pub winner_marked: bool,
    /// The round-advance batch was sent.
    pub advance_sent: bool,
    /// `NEXT_ROUND` was handled.
    pub advanced: bool,
}

impl RoundGuards {
    /// Fresh guards for `round`, synced against the stored `round_number`.
    pub fn new(round: u32, last_synced_round: u32) -> Self {
        Self {
            round,
            last_synced_round,
            ..Self::default()
        }
    }

    /// Whether the host should advance `round_number` now.
    pub fn host_should_increment(&self, max_rounds: u32) -> bool {
        !self.round_incremented && self.round == self.last_synced_round && self.round < max_rounds
    }
}
