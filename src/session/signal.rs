use std::{convert::Infallible, fmt, str::FromStr};

use crate::session::ids::PlayerId;

const FORFEIT_BY_PREFIX: &str = "FORFEIT_BY_";
const EARLY_TAP_BY_PREFIX: &str = "EARLY_TAP_BY_";

/// Value carried by the record's `signal` field.
///
/// A signal is a one-shot broadcast that stays in the field until somebody clears or
/// overwrites it, so handlers must tolerate seeing the same value again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Both players confirmed the match.
    Confirmed,
    /// Both players finished the ready countdown; the penalty delay starts.
    StartMatch,
    /// Both players displayed the round result; the next round (or the end) follows.
    NextRound,
    /// Legacy round-advance marker, only ever cleared.
    AdvanceRound,
    /// The last round is over.
    Victory,
    /// A liveness monitor declared the other player gone.
    OpponentDisconnected,
    /// `player` gave up.
    ForfeitBy(PlayerId),
    /// `player` acted during the penalty delay.
    EarlyTapBy(PlayerId),
    /// Anything this client does not understand.
    Other(String),
}

impl Signal {
    /// Prefix of the forfeit signal, for conditional clears.
    pub const FORFEIT_PREFIX: &'static str = FORFEIT_BY_PREFIX;
    /// Prefix of the early-tap signal, for conditional clears.
    pub const EARLY_TAP_PREFIX: &'static str = EARLY_TAP_BY_PREFIX;

    /// Actor encoded in a parameterised signal.
    pub fn actor(&self) -> Option<&PlayerId> {
        match self {
            Signal::ForfeitBy(player) | Signal::EarlyTapBy(player) => Some(player),
            _ => None,
        }
    }
}

impl FromStr for Signal {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let signal = match value {
            "CONFIRMED" => Signal::Confirmed,
            "START_MATCH" => Signal::StartMatch,
            "NEXT_ROUND" => Signal::NextRound,
            "ADVANCE_ROUND" => Signal::AdvanceRound,
            "VICTORY" => Signal::Victory,
            "OPPONENT_DISCONNECTED" => Signal::OpponentDisconnected,
            other => {
                if let Some(player) = other
                    .strip_prefix(FORFEIT_BY_PREFIX)
                    .filter(|player| !player.is_empty())
                {
                    Signal::ForfeitBy(PlayerId::new(player))
                } else if let Some(player) = other
                    .strip_prefix(EARLY_TAP_BY_PREFIX)
                    .filter(|player| !player.is_empty())
                {
                    Signal::EarlyTapBy(PlayerId::new(player))
                } else {
                    Signal::Other(other.to_owned())
                }
            }
        };
        Ok(signal)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Confirmed => f.write_str("CONFIRMED"),
            Signal::StartMatch => f.write_str("START_MATCH"),
            Signal::NextRound => f.write_str("NEXT_ROUND"),
            Signal::AdvanceRound => f.write_str("ADVANCE_ROUND"),
            Signal::Victory => f.write_str("VICTORY"),
            Signal::OpponentDisconnected => f.write_str("OPPONENT_DISCONNECTED"),
            Signal::ForfeitBy(player) => write!(f, "{FORFEIT_BY_PREFIX}{player}"),
            Signal::EarlyTapBy(player) => write!(f, "{EARLY_TAP_BY_PREFIX}{player}"),
            Signal::Other(raw) => f.write_str(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameterised_signals_carry_their_actor() {
        let parsed: Signal = "FORFEIT_BY_A1B2".parse().unwrap();
        assert_eq!(parsed, Signal::ForfeitBy(PlayerId::new("A1B2")));
        assert_eq!(parsed.to_string(), "FORFEIT_BY_A1B2");

        let parsed: Signal = "EARLY_TAP_BY_C3".parse().unwrap();
        assert_eq!(parsed.actor(), Some(&PlayerId::new("C3")));
    }

    #[test]
    fn unknown_and_truncated_values_are_kept_verbatim() {
        let parsed: Signal = "FORFEIT_BY_".parse().unwrap();
        assert_eq!(parsed, Signal::Other("FORFEIT_BY_".into()));
        let parsed: Signal = "HELLO".parse().unwrap();
        assert_eq!(parsed.to_string(), "HELLO");
    }
}
