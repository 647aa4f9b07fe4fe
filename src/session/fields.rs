//! Field names of the session record.
//!
//! The store enforces no schema; every peer agrees on these names by convention.

use crate::session::ids::PlayerId;

pub const STATE: &str = "state";
pub const GAME_STATUS: &str = "gameStatus";
pub const PRIVATE: &str = "private";
pub const CREATOR_ID: &str = "creatorID";
pub const PLAYER1: &str = "player1";
pub const PLAYER2: &str = "player2";
pub const PLAYER1_NAME: &str = "player1Name";
pub const PLAYER2_NAME: &str = "player2Name";
pub const CREATED_AT: &str = "createdAt";
pub const SIGNAL: &str = "signal";
pub const ROUND_NUMBER: &str = "round_number";
pub const PHASE: &str = "phase";
pub const ROUND_WINNER: &str = "round_winner";
pub const PENALTY_COUNTDOWN: &str = "penalty_countdown";
pub const DUEL_START_TIME: &str = "duel_start_time";
pub const REJECTION_REASON: &str = "rejection_reason";

/// Sub-collection holding the per-round move submissions.
pub const MOVES_COLLECTION: &str = "moves";
pub const MOVE: &str = "move";
pub const MOVE_TIMESTAMP: &str = "timestamp";

pub const HEARTBEAT_PREFIX: &str = "heartbeat_";

/// `heartbeat_<player>`.
pub fn heartbeat_key(player: &PlayerId) -> String {
    format!("{HEARTBEAT_PREFIX}{player}")
}

/// Per-player rendezvous flag. A condition holds once two distinct players set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PlayerFlag {
    /// Player reached the confirmation screen.
    InConfirmView,
    /// Player confirmed the match.
    Confirmed,
    /// Player finished the ready countdown.
    RequestedStart,
    /// Player showed the round result.
    WinnerDisplayed,
}

impl PlayerFlag {
    /// Every flag kind.
    pub const ALL: [PlayerFlag; 4] = [
        PlayerFlag::InConfirmView,
        PlayerFlag::Confirmed,
        PlayerFlag::RequestedStart,
        PlayerFlag::WinnerDisplayed,
    ];

    /// Key prefix shared by every player's flag of this kind.
    pub const fn prefix(self) -> &'static str {
        match self {
            PlayerFlag::InConfirmView => "inConfirmView_",
            PlayerFlag::Confirmed => "confirmed_",
            PlayerFlag::RequestedStart => "requested_start_",
            PlayerFlag::WinnerDisplayed => "winner_displayed_",
        }
    }

    /// Full key of `player`'s flag.
    pub fn key(self, player: &PlayerId) -> String {
        format!("{}{player}", self.prefix())
    }

    /// Parse a record key into its flag kind and owner.
    pub fn parse_key(key: &str) -> Option<(PlayerFlag, PlayerId)> {
        Self::ALL.into_iter().find_map(|flag| {
            key.strip_prefix(flag.prefix())
                .filter(|owner| !owner.is_empty())
                .map(|owner| (flag, PlayerId::new(owner)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_keys_round_trip() {
        let player = PlayerId::new("A1B2");
        let key = PlayerFlag::WinnerDisplayed.key(&player);
        assert_eq!(key, "winner_displayed_A1B2");
        assert_eq!(
            PlayerFlag::parse_key(&key),
            Some((PlayerFlag::WinnerDisplayed, player))
        );
        assert_eq!(PlayerFlag::parse_key("confirmed_"), None);
        assert_eq!(PlayerFlag::parse_key("player1"), None);
    }
}
