//! Pure duel logic: phase machine, round resolution and local tally.

pub mod resolution;
pub mod state_machine;
pub mod tally;

pub use self::resolution::{resolve_moves, resolve_round};
pub use self::state_machine::{
    DuelEvent, DuelPhase, DuelStateMachine, EndReason, InvalidTransition, MatchEnd, MatchResult,
    Snapshot,
};
pub use self::tally::{MatchTally, RoundGuards, RoundResult};
