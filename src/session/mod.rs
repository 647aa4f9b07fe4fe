//! Session record model: naming convention and typed views over the shared document.

pub mod fields;
pub mod ids;
pub mod moves;
pub mod record;
pub mod signal;
pub mod validation;

pub use self::fields::PlayerFlag;
pub use self::ids::{PlayerId, Role, SessionId, SessionScope};
pub use self::moves::{InvalidMove, Move, MoveEntry};
pub use self::record::{
    GameStatus, LobbyState, PlayerSlot, RecordPhase, RejectionReason, RoundWinner, SessionRecord,
};
pub use self::signal::Signal;
