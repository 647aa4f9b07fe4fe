use std::{io, path::PathBuf};

use thiserror::Error;
use validator::ValidationError;

use crate::dao::storage::StoreError;

/// Typed failures of matchmaking operations, surfaced to the user.
#[derive(Debug, Error)]
pub enum MatchmakingError {
    /// The code is not a well-formed private session code.
    #[error("invalid session code `{code}`")]
    InvalidCode {
        /// Code as entered.
        code: String,
        /// Validation failure.
        #[source]
        source: ValidationError,
    },
    /// No record exists under the code.
    #[error("room `{code}` not found")]
    RoomNotFound {
        /// Requested code.
        code: String,
    },
    /// The guest seat is already taken.
    #[error("room `{code}` is full")]
    RoomFull {
        /// Requested code.
        code: String,
    },
    /// The caller created this room and cannot join it as guest.
    #[error("room `{code}` was created by this player")]
    OwnRoom {
        /// Requested code.
        code: String,
    },
    /// The match is no longer active.
    #[error("room `{code}` is closed")]
    RoomClosed {
        /// Requested code.
        code: String,
    },
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures while loading or persisting the local player identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing the identity file failed.
    #[error("failed to access identity file `{}`", path.display())]
    Io {
        /// Identity file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The identity file is not valid JSON.
    #[error("failed to parse identity file `{}`", path.display())]
    Parse {
        /// Identity file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// No per-user data directory is known on this platform.
    #[error("no data directory available for the identity file")]
    NoDataDir,
}
