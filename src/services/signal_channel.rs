use std::sync::Arc;

use futures::{StreamExt, stream::BoxStream};
use tracing::debug;

use crate::{
    dao::{
        models::Update,
        session_store::SharedStore,
        storage::{StoreError, StoreResult},
    },
    session::{SessionRecord, SessionScope, Signal, fields},
};

/// One-shot broadcast over the record's `signal` field.
///
/// The field keeps its value until someone clears or overwrites it, and subscribers see
/// the whole record on every change, so handlers re-check relevance and tolerate
/// duplicates. Writes are skipped once the scope is closed.
#[derive(Clone)]
pub struct SignalChannel {
    store: Arc<dyn SharedStore>,
    scope: SessionScope,
}

impl SignalChannel {
    /// Bind the channel to a session.
    pub fn new(store: Arc<dyn SharedStore>, scope: SessionScope) -> Self {
        Self { store, scope }
    }

    /// Session scope guarding the writes.
    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    /// Broadcast `signal`, overwriting whatever the field holds.
    pub async fn send(&self, signal: &Signal) -> StoreResult<()> {
        if !self.scope.is_active() {
            debug!(session = %self.scope.id(), %signal, "session left; signal not sent");
            return Ok(());
        }
        self.store
            .merge(
                self.scope.id().as_str(),
                Update::new().set(fields::SIGNAL, signal.to_string()),
            )
            .await
    }

    /// Remove the current signal unconditionally.
    pub async fn clear(&self) -> StoreResult<()> {
        if !self.scope.is_active() {
            return Ok(());
        }
        self.store
            .merge(self.scope.id().as_str(), Update::new().delete(fields::SIGNAL))
            .await
    }

    /// Remove the signal only while it still equals `signal`. Returns whether it was removed.
    pub async fn clear_if_equals(&self, signal: &Signal) -> StoreResult<bool> {
        self.clear_exact(signal.to_string()).await
    }

    /// Remove the signal only while it starts with `prefix`. Returns whether it was removed.
    pub async fn clear_if_starts_with(&self, prefix: &str) -> StoreResult<bool> {
        if !self.scope.is_active() {
            return Ok(false);
        }
        let Some(document) = self.store.get(self.scope.id().as_str()).await? else {
            return Ok(false);
        };
        let current = document
            .get(fields::SIGNAL)
            .and_then(|value| value.as_str())
            .filter(|value| value.starts_with(prefix))
            .map(str::to_owned);
        match current {
            Some(current) => self.clear_exact(current).await,
            None => Ok(false),
        }
    }

    async fn clear_exact(&self, expected: String) -> StoreResult<bool> {
        if !self.scope.is_active() {
            return Ok(false);
        }
        let update = Update::new()
            .delete(fields::SIGNAL)
            .require_equals(fields::SIGNAL, expected);
        match self.store.merge(self.scope.id().as_str(), update).await {
            Ok(()) => Ok(true),
            Err(StoreError::PreconditionFailed { .. }) | Err(StoreError::NotFound { .. }) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Typed record feed: the current record first, then every change; `None` once deleted.
    pub fn subscribe(&self) -> BoxStream<'static, StoreResult<Option<SessionRecord>>> {
        self.store
            .subscribe(self.scope.id().as_str())
            .map(|item| item.map(|document| document.as_ref().map(SessionRecord::from_document)))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::session_store::{fields_from, memory::MemoryStore},
        session::{PlayerId, SessionId},
    };

    fn channel() -> (MemoryStore, SignalChannel) {
        let store = MemoryStore::new();
        store.seed("ABC123", fields_from([("gameStatus", "active")]));
        let scope = SessionScope::new(SessionId::new("ABC123"));
        (store.clone(), SignalChannel::new(Arc::new(store), scope))
    }

    async fn current(store: &MemoryStore) -> Option<Signal> {
        let document = store.get("ABC123").await.unwrap().unwrap();
        SessionRecord::from_document(&document).signal
    }

    #[tokio::test]
    async fn conditional_clear_leaves_newer_signals_alone() {
        let (store, channel) = channel();
        channel.send(&Signal::NextRound).await.unwrap();

        assert!(!channel.clear_if_equals(&Signal::StartMatch).await.unwrap());
        assert_eq!(current(&store).await, Some(Signal::NextRound));

        assert!(channel.clear_if_equals(&Signal::NextRound).await.unwrap());
        assert_eq!(current(&store).await, None);
    }

    #[tokio::test]
    async fn prefix_clear_matches_parameterised_signals() {
        let (store, channel) = channel();
        channel
            .send(&Signal::EarlyTapBy(PlayerId::new("A1")))
            .await
            .unwrap();
        assert!(!channel.clear_if_starts_with(Signal::FORFEIT_PREFIX).await.unwrap());
        assert!(channel.clear_if_starts_with(Signal::EARLY_TAP_PREFIX).await.unwrap());
        assert_eq!(current(&store).await, None);
    }

    #[tokio::test]
    async fn clear_removes_any_signal() {
        let (store, channel) = channel();
        channel
            .send(&Signal::ForfeitBy(PlayerId::new("A1")))
            .await
            .unwrap();
        channel.clear().await.unwrap();
        assert_eq!(current(&store).await, None);

        channel.clear().await.unwrap();
        assert_eq!(current(&store).await, None);
    }

    #[tokio::test]
    async fn closed_scope_suppresses_writes() {
        let (store, channel) = channel();
        channel.scope().close();
        channel.send(&Signal::Victory).await.unwrap();
        assert_eq!(current(&store).await, None);
    }

    #[tokio::test]
    async fn subscription_yields_typed_records() {
        let (_store, channel) = channel();
        let mut records = channel.subscribe();
        let first = records.next().await.unwrap().unwrap().unwrap();
        assert!(first.is_active());

        channel.send(&Signal::Confirmed).await.unwrap();
        let next = records.next().await.unwrap().unwrap().unwrap();
        assert_eq!(next.signal, Some(Signal::Confirmed));
    }
}
