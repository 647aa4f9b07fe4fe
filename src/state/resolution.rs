//! Winner resolution for a single round.

use std::cmp::Ordering;

use crate::session::{MoveEntry, RoundWinner};

/// Decide a round from two submissions.
///
/// Different moves follow the beats cycle regardless of timing. Equal moves go to the
/// strictly earlier submission and tie when both landed on the same millisecond.
pub fn resolve_round(a: &MoveEntry, b: &MoveEntry) -> RoundWinner {
    if a.mv == b.mv {
        return match a.at.cmp(&b.at) {
            Ordering::Less => RoundWinner::Player(a.player.clone()),
            Ordering::Greater => RoundWinner::Player(b.player.clone()),
            Ordering::Equal => RoundWinner::Tie,
        };
    }

    if a.mv.beats(b.mv) {
        RoundWinner::Player(a.player.clone())
    } else {
        RoundWinner::Player(b.player.clone())
    }
}

/// Resolve a `moves` listing, `None` unless it holds exactly two distinct players.
pub fn resolve_moves(entries: &[MoveEntry]) -> Option<RoundWinner> {
    match entries {
        [a, b] if a.player != b.player => Some(resolve_round(a, b)),
        _ => None,
    }
}
