use thiserror::Error;

use crate::session::{PlayerId, RejectionReason};

/// Lifecycle phases of a duel as seen by one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuelPhase {
    /// Host alone in the record, guest slot open.
    Waiting,
    /// Both seats are taken; confirmation screen not shown yet.
    Connected,
    /// Confirmation flags are being exchanged.
    Confirming,
    /// Confirmation failed; terminal.
    Rejected(RejectionReason),
    /// Both peers confirmed; the joint start delay runs.
    BothConfirmed,
    /// Ready countdown before a round.
    Countdown,
    /// Random penalty delay; any input loses the round.
    PenaltyDelay,
    /// Moves are accepted.
    Duel,
    /// Round result is displayed.
    RoundOver,
    /// Match finished; terminal.
    MatchOver(MatchEnd),
    /// Record disappeared; terminal.
    Closed,
}

impl DuelPhase {
    /// Whether no further event is accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DuelPhase::Rejected(_) | DuelPhase::MatchOver(_) | DuelPhase::Closed
        )
    }
}

/// Final outcome from the local player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Strictly higher score, or the opponent left.
    Win,
    /// Strictly lower score, or this player left.
    Lose,
    /// Equal scores.
    Tie,
}

/// Why the match ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Every round was played.
    Completed,
    /// `by` gave up.
    Forfeit {
        /// Player who forfeited.
        by: PlayerId,
    },
    /// A liveness monitor declared a peer gone.
    Disconnect,
}

/// Terminal outcome carried by [`DuelPhase::MatchOver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEnd {
    /// Local result.
    pub result: MatchResult,
    /// Cause.
    pub reason: EndReason,
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuelEvent {
    /// The guest seat got filled.
    OpponentJoined,
    /// The confirmation screen appeared.
    EnterConfirmation,
    /// Confirmation timed out or was voided by the other peer.
    Reject(RejectionReason),
    /// Two `confirmed_` flags are present.
    BothConfirmed,
    /// Joint start delay elapsed, or the next round begins.
    StartCountdown,
    /// `START_MATCH` observed.
    StartMatch,
    /// Penalty delay elapsed.
    OpenDuel,
    /// A round result is known locally.
    RoundDecided,
    /// `NEXT_ROUND` observed and rounds remain.
    NextRound,
    /// The match is over.
    FinishMatch(MatchEnd),
    /// The record was deleted.
    SessionClosed,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: DuelPhase,
    /// The event that cannot be applied from this phase.
    pub event: DuelEvent,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase of the state machine.
    pub phase: DuelPhase,
    /// Version number of the state machine (increments on each transition).
    pub version: u64,
}

/// Pure duel state machine. Timers and store callbacks are fed in as [`DuelEvent`]s.
#[derive(Debug, Clone)]
pub struct DuelStateMachine {
    phase: DuelPhase,
    version: u64,
}

impl Default for DuelStateMachine {
    fn default() -> Self {
        Self {
            phase: DuelPhase::Waiting,
            version: 0,
        }
    }
}

impl DuelStateMachine {
    /// Create a new state machine waiting for an opponent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> &DuelPhase {
        &self.phase
    }

    /// Number of applied transitions.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Create a snapshot of the current state machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase.clone(),
            version: self.version,
        }
    }

    /// Whether `event` would be accepted from the current phase.
    pub fn can_apply(&self, event: &DuelEvent) -> bool {
        self.compute_transition(event.clone()).is_ok()
    }

    /// Apply an event, moving to the next phase.
    pub fn apply(&mut self, event: DuelEvent) -> Result<DuelPhase, InvalidTransition> {
        let next = self.compute_transition(event)?;
        self.phase = next;
        self.version += 1;
        Ok(self.phase.clone())
    }

    fn compute_transition(&self, event: DuelEvent) -> Result<DuelPhase, InvalidTransition> {
        use DuelPhase as P;

        let next = match (&self.phase, event) {
            (from, event) if from.is_terminal() => {
                return Err(InvalidTransition {
                    from: from.clone(),
                    event,
                });
            }
            (_, DuelEvent::SessionClosed) => P::Closed,
            (_, DuelEvent::FinishMatch(end)) => P::MatchOver(end),
            (P::Waiting, DuelEvent::OpponentJoined) => P::Connected,
            (P::Connected, DuelEvent::EnterConfirmation) => P::Confirming,
            (
                P::Connected | P::Confirming | P::BothConfirmed | P::Countdown,
                DuelEvent::Reject(reason),
            ) => P::Rejected(reason),
            (P::Confirming, DuelEvent::BothConfirmed) => P::BothConfirmed,
            (P::BothConfirmed, DuelEvent::StartCountdown) => P::Countdown,
            (P::Countdown, DuelEvent::StartMatch) => P::PenaltyDelay,
            (P::PenaltyDelay, DuelEvent::OpenDuel) => P::Duel,
            (P::Countdown | P::PenaltyDelay | P::Duel, DuelEvent::RoundDecided) => P::RoundOver,
            (P::RoundOver, DuelEvent::NextRound) => P::Countdown,
            (from, event) => {
                return Err(InvalidTransition {
                    from: from.clone(),
                    event,
                });
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(sm: &mut DuelStateMachine, event: DuelEvent) -> DuelPhase {
        sm.apply(event).unwrap()
    }

    #[test]
    fn initial_state_is_waiting() {
        let sm = DuelStateMachine::new();
        assert_eq!(sm.phase(), &DuelPhase::Waiting);
        assert_eq!(sm.version(), 0);
    }

    #[test]
    fn full_happy_path_through_two_rounds() {
        let mut sm = DuelStateMachine::new();

        assert_eq!(apply(&mut sm, DuelEvent::OpponentJoined), DuelPhase::Connected);
        assert_eq!(apply(&mut sm, DuelEvent::EnterConfirmation), DuelPhase::Confirming);
        assert_eq!(apply(&mut sm, DuelEvent::BothConfirmed), DuelPhase::BothConfirmed);
        assert_eq!(apply(&mut sm, DuelEvent::StartCountdown), DuelPhase::Countdown);
        assert_eq!(apply(&mut sm, DuelEvent::StartMatch), DuelPhase::PenaltyDelay);
        assert_eq!(apply(&mut sm, DuelEvent::OpenDuel), DuelPhase::Duel);
        assert_eq!(apply(&mut sm, DuelEvent::RoundDecided), DuelPhase::RoundOver);
        assert_eq!(apply(&mut sm, DuelEvent::NextRound), DuelPhase::Countdown);
        assert_eq!(apply(&mut sm, DuelEvent::StartMatch), DuelPhase::PenaltyDelay);
        assert_eq!(apply(&mut sm, DuelEvent::RoundDecided), DuelPhase::RoundOver);

        let end = MatchEnd {
            result: MatchResult::Win,
            reason: EndReason::Completed,
        };
        assert_eq!(
            apply(&mut sm, DuelEvent::FinishMatch(end.clone())),
            DuelPhase::MatchOver(end)
        );
        assert_eq!(sm.snapshot().version, 11);
    }

    #[test]
    fn rejection_is_terminal() {
        let mut sm = DuelStateMachine::new();
        apply(&mut sm, DuelEvent::OpponentJoined);
        apply(&mut sm, DuelEvent::EnterConfirmation);
        assert_eq!(
            apply(&mut sm, DuelEvent::Reject(RejectionReason::Timeout)),
            DuelPhase::Rejected(RejectionReason::Timeout)
        );

        let err = sm.apply(DuelEvent::SessionClosed).unwrap_err();
        assert_eq!(err.from, DuelPhase::Rejected(RejectionReason::Timeout));
        assert_eq!(err.event, DuelEvent::SessionClosed);
    }

    #[test]
    fn invalid_transition_returns_error() {
        let mut sm = DuelStateMachine::new();
        let err = sm.apply(DuelEvent::OpenDuel).unwrap_err();
        assert_eq!(err.from, DuelPhase::Waiting);
        assert_eq!(err.event, DuelEvent::OpenDuel);
        assert_eq!(sm.version(), 0);
    }

    #[test]
    fn rejection_not_accepted_mid_duel() {
        let mut sm = DuelStateMachine::new();
        for event in [
            DuelEvent::OpponentJoined,
            DuelEvent::EnterConfirmation,
            DuelEvent::BothConfirmed,
            DuelEvent::StartCountdown,
            DuelEvent::StartMatch,
        ] {
            apply(&mut sm, event);
        }
        assert!(!sm.can_apply(&DuelEvent::Reject(RejectionReason::Timeout)));
        assert!(sm.can_apply(&DuelEvent::RoundDecided));
        assert!(sm.can_apply(&DuelEvent::SessionClosed));
    }
}
