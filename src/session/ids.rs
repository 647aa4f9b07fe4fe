use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characters a private session code is drawn from.
pub const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Length of a private session code.
pub const SESSION_CODE_LENGTH: usize = 6;

/// Stable per-installation player identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (uppercase UUID).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string().to_uppercase())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a session record: a UUID for public sessions, a 6-character code for private ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier for a public session.
    pub fn public() -> Self {
        Self(Uuid::new_v4().to_string().to_uppercase())
    }

    /// Random private session code.
    pub fn private_code<R: Rng>(rng: &mut R) -> Self {
        let code = (0..SESSION_CODE_LENGTH)
            .map(|_| {
                let index = rng.random_range(0..SESSION_CODE_ALPHABET.len());
                char::from(SESSION_CODE_ALPHABET[index])
            })
            .collect();
        Self(code)
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seat a player holds in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creator of the record (`player1`); owns round advancement and the penalty roll.
    Host,
    /// Joiner (`player2`).
    Guest,
}

impl Role {
    /// Index into the two-slot player array.
    pub const fn slot(self) -> usize {
        match self {
            Role::Host => 0,
            Role::Guest => 1,
        }
    }

    /// The other seat.
    pub const fn other(self) -> Role {
        match self {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        }
    }
}

/// Handle on the session a peer currently participates in.
///
/// Background writes check [`SessionScope::is_active`] before touching the record, so a
/// peer that already left never mutates the session again.
#[derive(Debug, Clone)]
pub struct SessionScope {
    id: SessionId,
    active: Arc<AtomicBool>,
}

impl SessionScope {
    /// Open a scope on `id`.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Session this scope guards.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Whether writes may still target the session.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Close the scope for every clone.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
    }
}
