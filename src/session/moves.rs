use thiserror::Error;

use crate::{
    clock::Timestamp,
    dao::models::Document,
    session::{fields, ids::PlayerId},
};

/// Move magnitude: the number of simultaneous touches, 1 to 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Move {
    /// One touch.
    One = 1,
    /// Two touches.
    Two = 2,
    /// Three touches.
    Three = 3,
}

/// Raw input outside `1..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("move must be between 1 and 3 (got {0})")]
pub struct InvalidMove(pub i64);

impl Move {
    /// Numeric value stored in the record.
    pub const fn value(self) -> i64 {
        self as i64
    }

    /// Cyclic beats relation: 1 beats 3, 2 beats 1, 3 beats 2.
    pub const fn beats(self, other: Move) -> bool {
        matches!(
            (self, other),
            (Move::One, Move::Three) | (Move::Two, Move::One) | (Move::Three, Move::Two)
        )
    }
}

impl TryFrom<i64> for Move {
    type Error = InvalidMove;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Move::One),
            2 => Ok(Move::Two),
            3 => Ok(Move::Three),
            other => Err(InvalidMove(other)),
        }
    }
}

impl TryFrom<u8> for Move {
    type Error = InvalidMove;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Move::try_from(i64::from(value))
    }
}

/// One player's submission for the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveEntry {
    /// Submitting player; also the identifier of the move document.
    pub player: PlayerId,
    /// Submitted move.
    pub mv: Move,
    /// Store-assigned submission time.
    pub at: Timestamp,
}

impl MoveEntry {
    /// Parse a `moves` document, skipping malformed or not yet stamped entries.
    pub fn from_document(document: &Document) -> Option<Self> {
        let mv = document
            .get(fields::MOVE)
            .and_then(|value| value.as_int())
            .and_then(|value| Move::try_from(value).ok())?;
        let at = document
            .get(fields::MOVE_TIMESTAMP)
            .and_then(|value| value.as_timestamp())?;
        Some(Self {
            player: PlayerId::new(document.id()),
            mv,
            at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::session_store::fields_from;

    #[test]
    fn beats_relation_is_cyclic() {
        let all = [Move::One, Move::Two, Move::Three];
        for a in all {
            assert!(!a.beats(a));
            for b in all {
                if a != b {
                    assert_ne!(a.beats(b), b.beats(a), "{a:?} vs {b:?}");
                }
            }
        }
        assert!(Move::One.beats(Move::Three));
    }

    #[test]
    fn out_of_range_input_is_rejected() {
        assert_eq!(Move::try_from(0_u8), Err(InvalidMove(0)));
        assert_eq!(Move::try_from(4_i64), Err(InvalidMove(4)));
        assert_eq!(Move::try_from(2_u8), Ok(Move::Two));
    }

    #[test]
    fn unstamped_move_documents_are_skipped() {
        let pending = Document::new("alice", fields_from([("move", 2_i64)]));
        assert_eq!(MoveEntry::from_document(&pending), None);

        let mut stamped = fields_from([("move", 2_i64)]);
        stamped.insert(
            "timestamp".into(),
            Timestamp::from_millis(5).into(),
        );
        let entry = MoveEntry::from_document(&Document::new("alice", stamped)).expect("entry");
        assert_eq!(entry.mv, Move::Two);
        assert_eq!(entry.player, PlayerId::new("alice"));
    }
}
