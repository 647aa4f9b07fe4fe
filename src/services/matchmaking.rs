//! Matchmaking Engine: private codes, public pool matching and cooperative garbage collection.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, info, warn};

use crate::{
    clock::{SharedClock, Timestamp},
    config::DuelConfig,
    dao::{
        models::{Query, SortOrder, Update},
        session_store::SharedStore,
        storage::{StoreError, StoreResult},
    },
    error::MatchmakingError,
    services::{identity::Identity, liveness::LivenessMonitor},
    session::{
        GameStatus, LobbyState, Role, SessionId, SessionRecord, SessionScope, fields,
        validation::{normalize_session_code, validate_session_code},
    },
};

/// Seat obtained by matchmaking.
#[derive(Debug, Clone)]
pub struct MatchTicket {
    /// Session record key.
    pub session: SessionId,
    /// Seat held by this peer.
    pub role: Role,
    /// Whether the session was created with a private code.
    pub private: bool,
    scope: SessionScope,
}

impl MatchTicket {
    fn new(session: SessionId, role: Role, private: bool) -> Self {
        Self {
            scope: SessionScope::new(session.clone()),
            session,
            role,
            private,
        }
    }

    /// Scope guarding every background write into the session.
    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }
}

struct ActiveSession {
    ticket: MatchTicket,
    liveness: LivenessMonitor,
}

/// Finds or creates a session record and keeps its liveness monitor running.
///
/// Only one session is active at a time: creating or joining another one leaves the
/// previous session first.
pub struct Matchmaker {
    store: Arc<dyn SharedStore>,
    identity: Identity,
    clock: SharedClock,
    config: Arc<DuelConfig>,
    active: Mutex<Option<ActiveSession>>,
}

impl Matchmaker {
    /// Build a matchmaker playing as `identity`.
    pub fn new(
        store: Arc<dyn SharedStore>,
        identity: Identity,
        clock: SharedClock,
        config: Arc<DuelConfig>,
    ) -> Self {
        Self {
            store,
            identity,
            clock,
            config,
            active: Mutex::new(None),
        }
    }

    /// Local player.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Store the sessions live in.
    pub fn store(&self) -> Arc<dyn SharedStore> {
        self.store.clone()
    }

    /// Clock used for staleness checks.
    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Shared timing configuration.
    pub fn config(&self) -> Arc<DuelConfig> {
        self.config.clone()
    }

    /// Ticket of the session currently being played, if any.
    pub fn active_ticket(&self) -> Option<MatchTicket> {
        self.lock().as_ref().map(|active| active.ticket.clone())
    }

    /// Host a private session under a fresh 6-character code.
    ///
    /// Creation is best effort: a failed write is logged and the ticket is still returned.
    pub async fn create_private_session(&self) -> MatchTicket {
        let code = SessionId::private_code(&mut rand::rng());
        self.create_session(code, true).await
    }

    /// Host a session under an explicit key.
    pub async fn create_session(&self, session: SessionId, private: bool) -> MatchTicket {
        self.leave();
        let creation =
            SessionRecord::creation(&self.identity.player, &self.identity.display_name, private);
        match self.store.set(session.as_str(), creation).await {
            Ok(()) => info!(session = %session, private, "session created"),
            Err(err) => warn!(session = %session, error = %err, "failed to create session"),
        }
        self.begin(MatchTicket::new(session, Role::Host, private))
    }

    /// Join a private session as guest.
    pub async fn join_private_session(&self, code: &str) -> Result<MatchTicket, MatchmakingError> {
        let code = normalize_session_code(code);
        validate_session_code(&code).map_err(|source| MatchmakingError::InvalidCode {
            code: code.clone(),
            source,
        })?;

        let session = SessionId::new(code.clone());
        let Some(document) = self.store.get(session.as_str()).await? else {
            return Err(MatchmakingError::RoomNotFound { code });
        };
        let record = SessionRecord::from_document(&document);
        if record.role_of(&self.identity.player) == Some(Role::Guest) {
            debug!(session = %session, "already seated as guest; rejoining");
            self.leave();
            return Ok(self.begin(MatchTicket::new(session, Role::Guest, record.private)));
        }
        if record.creator.as_ref() == Some(&self.identity.player)
            || record.role_of(&self.identity.player) == Some(Role::Host)
        {
            return Err(MatchmakingError::OwnRoom { code });
        }
        if !record.is_active() {
            return Err(MatchmakingError::RoomClosed { code });
        }
        if record.is_full() {
            return Err(MatchmakingError::RoomFull { code });
        }

        self.leave();
        self.claim_guest_seat(&session).await?;
        info!(session = %session, player = %self.identity.player, "joined private session");
        Ok(self.begin(MatchTicket::new(session, Role::Guest, record.private)))
    }

    /// Join the oldest eligible public session, or host a new one when none is found.
    pub async fn auto_match(&self) -> Result<MatchTicket, MatchmakingError> {
        let query = Query::new()
            .where_eq(fields::STATE, LobbyState::Waiting.as_str())
            .where_eq(fields::PRIVATE, false)
            .where_eq(fields::GAME_STATUS, GameStatus::Active.as_str())
            .order_by(fields::CREATED_AT, SortOrder::Ascending);
        let candidates = self.store.query(query).await?;
        let now = self.clock.now();

        for document in candidates {
            let record = SessionRecord::from_document(&document);
            if !self.is_joinable(&record, now) {
                continue;
            }

            self.leave();
            match self.claim_guest_seat(&record.id).await {
                Ok(()) => {
                    info!(session = %record.id, player = %self.identity.player, "matched into public session");
                    return Ok(self.begin(MatchTicket::new(record.id, Role::Guest, false)));
                }
                Err(MatchmakingError::Store(err)) => {
                    warn!(session = %record.id, error = %err, "failed to join candidate session");
                }
                Err(err) => {
                    debug!(session = %record.id, error = %err, "candidate session taken; trying next");
                }
            }
        }

        Ok(self.create_session(SessionId::public(), false).await)
    }

    fn is_joinable(&self, record: &SessionRecord, now: Timestamp) -> bool {
        if record.creator.as_ref() == Some(&self.identity.player)
            || record.role_of(&self.identity.player).is_some()
        {
            return false;
        }
        if record.is_full() {
            return false;
        }
        let fresh = record
            .created_at
            .is_some_and(|created| created.elapsed_until(now) <= self.config.stale_after);
        if !fresh {
            debug!(session = %record.id, "skipping stale session");
            return false;
        }
        let alive = record.players.iter().flatten().all(|slot| {
            record
                .heartbeat_age(&slot.id, now)
                .is_some_and(|age| age <= self.config.heartbeat_timeout)
        });
        if !alive {
            debug!(session = %record.id, "skipping session with a silent player");
        }
        alive
    }

    /// Take `player2` only while it is still open.
    async fn claim_guest_seat(&self, session: &SessionId) -> Result<(), MatchmakingError> {
        let update = Update::new()
            .set(fields::PLAYER2, self.identity.player.as_str())
            .set(fields::PLAYER2_NAME, self.identity.display_name.as_str())
            .set(fields::STATE, LobbyState::Connected.as_str())
            .require_absent(fields::PLAYER2)
            .require_equals(fields::GAME_STATUS, GameStatus::Active.as_str());
        let code = session.to_string();
        match self.store.merge(session.as_str(), update).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { .. }) => Err(MatchmakingError::RoomNotFound { code }),
            Err(StoreError::PreconditionFailed { field, .. }) if field == fields::GAME_STATUS => {
                Err(MatchmakingError::RoomClosed { code })
            }
            Err(StoreError::PreconditionFailed { .. }) => Err(MatchmakingError::RoomFull { code }),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete this player's own waiting sessions that nobody joined.
    pub async fn cleanup_own_sessions(&self) -> StoreResult<usize> {
        let query = Query::new()
            .where_eq(fields::CREATOR_ID, self.identity.player.as_str())
            .where_eq(fields::GAME_STATUS, GameStatus::Active.as_str())
            .where_eq(fields::STATE, LobbyState::Waiting.as_str());
        let active = self.active_ticket().map(|ticket| ticket.session);
        let mut deleted = 0;
        for document in self.store.query(query).await? {
            let record = SessionRecord::from_document(&document);
            if record.is_full() || active.as_ref() == Some(&record.id) {
                continue;
            }
            match self.store.delete(record.id.as_str()).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(session = %record.id, error = %err, "failed to delete own session"),
            }
        }
        if deleted > 0 {
            info!(deleted, "removed abandoned own sessions");
        }
        Ok(deleted)
    }

    /// Delete every public waiting or connected session older than the staleness window.
    pub async fn cleanup_stale_sessions(&self) -> StoreResult<usize> {
        sweep_stale_sessions(self.store.as_ref(), self.clock.now(), self.config.stale_after).await
    }

    /// Run [`Matchmaker::cleanup_stale_sessions`] periodically in the background.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let period = self.config.sweep_interval;
        let stale_after = self.config.stale_after;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = sweep_stale_sessions(store.as_ref(), clock.now(), stale_after).await {
                    warn!(error = %err, "stale session sweep failed");
                }
            }
        })
    }

    /// Delete the active session record (explicit room closure) and leave it.
    pub async fn close_session(&self) -> StoreResult<bool> {
        let Some(ticket) = self.active_ticket() else {
            return Ok(false);
        };
        self.leave();
        let deleted = self.store.delete(ticket.session.as_str()).await?;
        info!(session = %ticket.session, deleted, "session closed");
        Ok(deleted)
    }

    /// Leave the active session; a hosted session nobody joined yet is deleted as well.
    pub async fn quit(&self) -> StoreResult<bool> {
        let Some(ticket) = self.active_ticket() else {
            return Ok(false);
        };
        if ticket.role == Role::Host {
            let unjoined = self
                .store
                .get(ticket.session.as_str())
                .await?
                .map(|document| SessionRecord::from_document(&document))
                .is_some_and(|record| !record.is_full());
            if unjoined {
                return self.close_session().await;
            }
        }
        self.leave();
        Ok(false)
    }

    /// Cancel a private session this player created.
    pub async fn cancel_private_session(&self, code: &str) -> Result<bool, MatchmakingError> {
        let code = normalize_session_code(code);
        let session = SessionId::new(code.clone());
        let Some(document) = self.store.get(session.as_str()).await? else {
            return Ok(false);
        };
        let record = SessionRecord::from_document(&document);
        if record.creator.as_ref() != Some(&self.identity.player) {
            debug!(session = %session, "not the creator; session left untouched");
            return Ok(false);
        }
        if self.active_ticket().is_some_and(|ticket| ticket.session == session) {
            self.leave();
        }
        let deleted = self.store.delete(session.as_str()).await?;
        info!(session = %session, deleted, "private session cancelled");
        Ok(deleted)
    }

    /// Stop heartbeating and close the scope of the active session.
    pub fn leave(&self) {
        if let Some(active) = self.lock().take() {
            active.ticket.scope.close();
            active.liveness.stop();
            debug!(session = %active.ticket.session, "left session");
        }
    }

    fn begin(&self, ticket: MatchTicket) -> MatchTicket {
        let liveness = LivenessMonitor::start(
            self.store.clone(),
            ticket.scope.clone(),
            self.identity.player.clone(),
            self.clock.clone(),
            self.config.clone(),
        );
        let mut slot = self.lock();
        if let Some(previous) = slot.take() {
            previous.ticket.scope.close();
        }
        *slot = Some(ActiveSession {
            ticket: ticket.clone(),
            liveness,
        });
        ticket
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Matchmaker {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Delete public `waiting`/`connected` records created more than `stale_after` before `now`.
pub async fn sweep_stale_sessions(
    store: &dyn SharedStore,
    now: Timestamp,
    stale_after: Duration,
) -> StoreResult<usize> {
    let cutoff = now.saturating_sub(stale_after);
    let mut deleted = 0;
    for state in [LobbyState::Waiting, LobbyState::Connected] {
        let query = Query::new()
            .where_eq(fields::STATE, state.as_str())
            .where_eq(fields::PRIVATE, false);
        for document in store.query(query).await? {
            let record = SessionRecord::from_document(&document);
            if !record.created_at.is_some_and(|created| created < cutoff) {
                continue;
            }
            match store.delete(record.id.as_str()).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(session = %record.id, error = %err, "failed to delete stale session"),
            }
        }
    }
    if deleted > 0 {
        info!(deleted, "swept stale sessions");
    }
    Ok(deleted)
}
