use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use crate::{
    clock::Timestamp,
    dao::models::{Document, FieldValue, Update},
    session::{
        fields::{self, HEARTBEAT_PREFIX, PlayerFlag},
        ids::{PlayerId, Role, SessionId},
        signal::Signal,
    },
};

/// Coarse lobby marker (`state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    /// Host is alone and the guest slot is open.
    Waiting,
    /// Both slots are taken.
    Connected,
}

impl LobbyState {
    /// Stored value.
    pub const fn as_str(self) -> &'static str {
        match self {
            LobbyState::Waiting => "waiting",
            LobbyState::Connected => "connected",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(LobbyState::Waiting),
            "connected" => Some(LobbyState::Connected),
            _ => None,
        }
    }
}

/// Whether the match is still playable (`gameStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    /// Match in progress; signals are honoured.
    Active,
    /// Voided by a rejection or closed.
    Closed,
    /// A player forfeited.
    Forfeited,
}

impl GameStatus {
    /// Stored value.
    pub const fn as_str(self) -> &'static str {
        match self {
            GameStatus::Active => "active",
            GameStatus::Closed => "closed",
            GameStatus::Forfeited => "forfeited",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(GameStatus::Active),
            "closed" => Some(GameStatus::Closed),
            "forfeited" => Some(GameStatus::Forfeited),
            _ => None,
        }
    }
}

/// Whether the current round has been resolved (`phase`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPhase {
    /// Round still open.
    Active,
    /// `round_winner` holds the result.
    RoundOver,
}

impl RecordPhase {
    /// Stored value.
    pub const fn as_str(self) -> &'static str {
        match self {
            RecordPhase::Active => "active",
            RecordPhase::RoundOver => "ROUND_OVER",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(RecordPhase::Active),
            "ROUND_OVER" => Some(RecordPhase::RoundOver),
            _ => None,
        }
    }
}

/// Result written to `round_winner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundWinner {
    /// The named player won the round.
    Player(PlayerId),
    /// Nobody scores.
    Tie,
}

impl RoundWinner {
    const TIE: &'static str = "tie";

    /// Stored value.
    pub fn as_value(&self) -> String {
        match self {
            RoundWinner::Player(player) => player.to_string(),
            RoundWinner::Tie => Self::TIE.to_owned(),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "" => None,
            Self::TIE => Some(RoundWinner::Tie),
            player => Some(RoundWinner::Player(PlayerId::new(player))),
        }
    }
}

/// Reason recorded in `rejection_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// Confirmation did not complete in time.
    Timeout,
    /// The other player never reached the confirmation screen.
    DoubleTimeout,
    /// Written by a client this one does not know about.
    Other(String),
}

impl RejectionReason {
    /// Stored value.
    pub fn as_str(&self) -> &str {
        match self {
            RejectionReason::Timeout => "timeout",
            RejectionReason::DoubleTimeout => "double_timeout",
            RejectionReason::Other(reason) => reason,
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "timeout" => RejectionReason::Timeout,
            "double_timeout" => RejectionReason::DoubleTimeout,
            other => RejectionReason::Other(other.to_owned()),
        }
    }
}

/// One seat of the two-slot player structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSlot {
    /// Occupant.
    pub id: PlayerId,
    /// Display name, when provided.
    pub name: Option<String>,
}

/// Typed view over a session document.
///
/// Parsing is lenient: unknown values are ignored and missing fields fall back to
/// `None`, since any peer may write anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Record key.
    pub id: SessionId,
    /// Lobby marker.
    pub state: Option<LobbyState>,
    /// Match status.
    pub status: Option<GameStatus>,
    /// Whether the session was created with a private code.
    pub private: bool,
    /// Creator of the record.
    pub creator: Option<PlayerId>,
    /// Host and guest seats, indexed by [`Role::slot`].
    pub players: [Option<PlayerSlot>; 2],
    /// Server creation time.
    pub created_at: Option<Timestamp>,
    /// Current broadcast value; `None` when the field is empty or absent.
    pub signal: Option<Signal>,
    /// Shared round counter, 1 when absent.
    pub round_number: u32,
    /// Round resolution marker.
    pub phase: Option<RecordPhase>,
    /// Result of the current round.
    pub round_winner: Option<RoundWinner>,
    /// Penalty delay rolled by the host for this round.
    pub penalty_countdown: Option<u8>,
    /// When the duel window opened.
    pub duel_start_time: Option<Timestamp>,
    /// Why confirmation failed.
    pub rejection_reason: Option<RejectionReason>,
    heartbeats: BTreeMap<PlayerId, Timestamp>,
    flags: BTreeMap<PlayerFlag, BTreeSet<PlayerId>>,
}

impl SessionRecord {
    /// Parse a session document.
    pub fn from_document(document: &Document) -> Self {
        let text = |key: &str| document.get(key).and_then(FieldValue::as_str);
        let player = |id_key: &str, name_key: &str| {
            text(id_key)
                .filter(|id| !id.is_empty())
                .map(|id| PlayerSlot {
                    id: PlayerId::new(id),
                    name: text(name_key).map(str::to_owned),
                })
        };

        let mut heartbeats = BTreeMap::new();
        let mut flags: BTreeMap<PlayerFlag, BTreeSet<PlayerId>> = BTreeMap::new();
        for (key, value) in document.fields() {
            if let Some(owner) = key.strip_prefix(HEARTBEAT_PREFIX) {
                if let Some(stamp) = value.as_timestamp() {
                    heartbeats.insert(PlayerId::new(owner), stamp);
                }
            } else if let Some((flag, owner)) = PlayerFlag::parse_key(key) {
                if value.as_bool() != Some(false) {
                    flags.entry(flag).or_default().insert(owner);
                }
            }
        }

        Self {
            id: SessionId::new(document.id()),
            state: text(fields::STATE).and_then(LobbyState::parse),
            status: text(fields::GAME_STATUS).and_then(GameStatus::parse),
            private: document
                .get(fields::PRIVATE)
                .and_then(FieldValue::as_bool)
                .unwrap_or(false),
            creator: text(fields::CREATOR_ID).map(PlayerId::new),
            players: [
                player(fields::PLAYER1, fields::PLAYER1_NAME),
                player(fields::PLAYER2, fields::PLAYER2_NAME),
            ],
            created_at: document
                .get(fields::CREATED_AT)
                .and_then(FieldValue::as_timestamp),
            signal: text(fields::SIGNAL)
                .filter(|raw| !raw.is_empty())
                .and_then(|raw| raw.parse().ok()),
            round_number: document
                .get(fields::ROUND_NUMBER)
                .and_then(FieldValue::as_int)
                .and_then(|round| u32::try_from(round).ok())
                .unwrap_or(1),
            phase: text(fields::PHASE).and_then(RecordPhase::parse),
            round_winner: text(fields::ROUND_WINNER).and_then(RoundWinner::parse),
            penalty_countdown: document
                .get(fields::PENALTY_COUNTDOWN)
                .and_then(FieldValue::as_int)
                .and_then(|value| u8::try_from(value).ok()),
            duel_start_time: document
                .get(fields::DUEL_START_TIME)
                .and_then(FieldValue::as_timestamp),
            rejection_reason: text(fields::REJECTION_REASON)
                .filter(|reason| !reason.is_empty())
                .map(RejectionReason::parse),
            heartbeats,
            flags,
        }
    }

    /// Update creating a fresh waiting record hosted by `host`.
    pub fn creation(host: &PlayerId, host_name: &str, private: bool) -> Update {
        Update::new()
            .set(fields::STATE, LobbyState::Waiting.as_str())
            .set(fields::SIGNAL, "")
            .set(fields::GAME_STATUS, GameStatus::Active.as_str())
            .set(fields::PRIVATE, private)
            .set(fields::CREATOR_ID, host.as_str())
            .set(fields::PLAYER1, host.as_str())
            .set(fields::PLAYER1_NAME, host_name)
            .set(fields::ROUND_NUMBER, 1_i64)
            .server_timestamp(fields::CREATED_AT)
    }

    /// Seat of `player`, if seated.
    pub fn role_of(&self, player: &PlayerId) -> Option<Role> {
        [Role::Host, Role::Guest].into_iter().find(|role| {
            self.players[role.slot()]
                .as_ref()
                .is_some_and(|slot| &slot.id == player)
        })
    }

    /// Occupant of a seat.
    pub fn slot(&self, role: Role) -> Option<&PlayerSlot> {
        self.players[role.slot()].as_ref()
    }

    /// The seat opposite `player`, once occupied.
    pub fn opponent_of(&self, player: &PlayerId) -> Option<&PlayerSlot> {
        match self.role_of(player) {
            Some(role) => self.slot(role.other()),
            None => None,
        }
    }

    /// Whether the guest seat is taken.
    pub fn is_full(&self) -> bool {
        self.players[Role::Guest.slot()].is_some()
    }

    /// Whether signals should be honoured.
    pub fn is_active(&self) -> bool {
        self.status == Some(GameStatus::Active)
    }

    /// Whether the current round has a stored result.
    pub fn round_over(&self) -> bool {
        self.phase == Some(RecordPhase::RoundOver)
    }

    /// Last heartbeat written by `player`.
    pub fn heartbeat_of(&self, player: &PlayerId) -> Option<Timestamp> {
        self.heartbeats.get(player).copied()
    }

    /// Age of `player`'s heartbeat at `now`; `None` when it was never written.
    pub fn heartbeat_age(&self, player: &PlayerId, now: Timestamp) -> Option<Duration> {
        self.heartbeat_of(player)
            .map(|stamp| stamp.elapsed_until(now))
    }

    /// Whether `player` set `flag`.
    pub fn has_flag(&self, flag: PlayerFlag, player: &PlayerId) -> bool {
        self.flags
            .get(&flag)
            .is_some_and(|owners| owners.contains(player))
    }

    /// Number of distinct players that set `flag`.
    pub fn flag_count(&self, flag: PlayerFlag) -> usize {
        self.flags.get(&flag).map_or(0, BTreeSet::len)
    }

    /// Rendezvous condition: exactly two distinct players set `flag`.
    pub fn both_flagged(&self, flag: PlayerFlag) -> bool {
        self.flag_count(flag) == 2
    }

    /// Stored keys of every `flag` currently set.
    pub fn flag_keys(&self, flag: PlayerFlag) -> Vec<String> {
        self.flags
            .get(&flag)
            .map(|owners| owners.iter().map(|owner| flag.key(owner)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::{models::Fields, session_store::fields_from};

    fn document(fields: Fields) -> Document {
        Document::new("ABC123", fields)
    }

    #[test]
    fn creation_update_describes_a_waiting_record() {
        let mut fields = Fields::new();
        SessionRecord::creation(&PlayerId::new("HOST"), "Ada", true)
            .apply_to(&mut fields, Timestamp::from_millis(10));
        let record = SessionRecord::from_document(&document(fields));

        assert_eq!(record.state, Some(LobbyState::Waiting));
        assert!(record.is_active());
        assert!(record.private);
        assert_eq!(record.round_number, 1);
        assert_eq!(record.signal, None);
        assert_eq!(record.role_of(&PlayerId::new("HOST")), Some(Role::Host));
        assert!(!record.is_full());
        assert_eq!(record.created_at, Some(Timestamp::from_millis(10)));
    }

    #[test]
    fn both_flagged_requires_exactly_two_distinct_keys() {
        let mut fields = fields_from([("confirmed_A", true)]);
        assert!(!SessionRecord::from_document(&document(fields.clone()))
            .both_flagged(PlayerFlag::Confirmed));

        fields.insert("confirmed_B".into(), true.into());
        let record = SessionRecord::from_document(&document(fields.clone()));
        assert!(record.both_flagged(PlayerFlag::Confirmed));
        assert!(!record.both_flagged(PlayerFlag::RequestedStart));

        fields.insert("confirmed_C".into(), true.into());
        assert!(!SessionRecord::from_document(&document(fields))
            .both_flagged(PlayerFlag::Confirmed));
    }

    #[test]
    fn flag_order_of_arrival_does_not_matter() {
        let forward = fields_from([("winner_displayed_A", true), ("winner_displayed_B", true)]);
        let backward = fields_from([("winner_displayed_B", true), ("winner_displayed_A", true)]);
        let a = SessionRecord::from_document(&document(forward));
        let b = SessionRecord::from_document(&document(backward));
        assert_eq!(
            a.flag_keys(PlayerFlag::WinnerDisplayed),
            b.flag_keys(PlayerFlag::WinnerDisplayed)
        );
        assert!(a.both_flagged(PlayerFlag::WinnerDisplayed));
    }

    #[test]
    fn seats_and_heartbeats_are_resolved_per_player() {
        let mut fields = fields_from([
            ("player1", "HOST"),
            ("player2", "GUEST"),
            ("player2Name", "Bob"),
            ("signal", "FORFEIT_BY_GUEST"),
            ("round_winner", "tie"),
        ]);
        fields.insert(
            "heartbeat_GUEST".into(),
            Timestamp::from_millis(1_000).into(),
        );
        let record = SessionRecord::from_document(&document(fields));

        let host = PlayerId::new("HOST");
        let guest = PlayerId::new("GUEST");
        assert_eq!(
            record.opponent_of(&host).map(|slot| slot.name.as_deref()),
            Some(Some("Bob"))
        );
        assert_eq!(record.signal, Some(Signal::ForfeitBy(guest.clone())));
        assert_eq!(record.round_winner, Some(RoundWinner::Tie));
        assert_eq!(
            record.heartbeat_age(&guest, Timestamp::from_millis(4_000)),
            Some(Duration::from_secs(3))
        );
        assert_eq!(record.heartbeat_age(&host, Timestamp::from_millis(4_000)), None);
    }
}
