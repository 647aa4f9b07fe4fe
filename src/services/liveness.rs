use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    clock::{SharedClock, Timestamp},
    config::DuelConfig,
    dao::{models::Update, session_store::SharedStore},
    services::signal_channel::SignalChannel,
    session::{PlayerId, SessionRecord, SessionScope, Signal, fields},
};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Opponent health as judged from one record snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    /// Guest seat still open; nothing to watch.
    NoOpponent,
    /// Opponent heartbeat is recent enough.
    Fresh,
    /// Opponent heartbeat is older than the timeout, or was never written.
    Stale,
}

/// Judge the opponent of `me` at `now`.
pub fn assess(
    record: &SessionRecord,
    me: &PlayerId,
    now: Timestamp,
    timeout: Duration,
) -> PeerHealth {
    let Some(opponent) = record.opponent_of(me) else {
        return PeerHealth::NoOpponent;
    };
    match record.heartbeat_age(&opponent.id, now) {
        Some(age) if age <= timeout => PeerHealth::Fresh,
        _ => PeerHealth::Stale,
    }
}

/// Whether a disconnect may still be declared on this record.
fn watching(record: &SessionRecord) -> bool {
    record.is_active()
        && !matches!(
            record.signal,
            Some(Signal::OpponentDisconnected | Signal::ForfeitBy(_) | Signal::Victory)
        )
}

/// Background heartbeat writer and two-phase disconnect detector.
///
/// Writes `heartbeat_<self>` right away and then periodically. Each record change
/// re-judges the opponent; a stale heartbeat is re-checked after a short delay before
/// `OPPONENT_DISCONNECTED` goes out. The task ends when the scope closes, the record is
/// deleted or the monitor is dropped.
pub struct LivenessMonitor {
    task: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Spawn the monitor for `me` in the session guarded by `scope`.
    pub fn start(
        store: Arc<dyn SharedStore>,
        scope: SessionScope,
        me: PlayerId,
        clock: SharedClock,
        config: Arc<DuelConfig>,
    ) -> Self {
        let task = tokio::spawn(run(store, scope, me, clock, config));
        Self { task }
    }

    /// Stop heartbeating and watching.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the background task already ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    store: Arc<dyn SharedStore>,
    scope: SessionScope,
    me: PlayerId,
    clock: SharedClock,
    config: Arc<DuelConfig>,
) {
    let channel = SignalChannel::new(store.clone(), scope.clone());
    let heartbeat_key = fields::heartbeat_key(&me);
    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut records = channel.subscribe();
    let mut recheck = None;
    let mut declared = false;

    loop {
        if !scope.is_active() {
            debug!(session = %scope.id(), "liveness monitor stopped with the session");
            break;
        }

        tokio::select! {
            _ = heartbeat.tick() => {
                let store = store.clone();
                let id = scope.id().clone();
                let update = Update::new().server_timestamp(heartbeat_key.clone());
                tokio::spawn(async move {
                    if let Err(err) = store.merge(id.as_str(), update).await {
                        warn!(session = %id, error = %err, "heartbeat write failed");
                    }
                });
            }
            item = records.next() => match item {
                Some(Ok(Some(record))) => {
                    if declared || recheck.is_some() || !watching(&record) {
                        continue;
                    }
                    if assess(&record, &me, clock.now(), config.heartbeat_timeout) == PeerHealth::Stale {
                        debug!(session = %scope.id(), "opponent heartbeat stale; re-checking");
                        recheck = Some(Box::pin(sleep(config.disconnect_recheck)));
                    }
                }
                Some(Ok(None)) => {
                    debug!(session = %scope.id(), "session record gone; liveness monitor stopped");
                    break;
                }
                Some(Err(err)) => {
                    warn!(session = %scope.id(), error = %err, "session subscription failed; resubscribing");
                    sleep(RESUBSCRIBE_DELAY).await;
                    records = channel.subscribe();
                }
                None => {
                    sleep(RESUBSCRIBE_DELAY).await;
                    records = channel.subscribe();
                }
            },
            _ = async {
                match recheck.as_mut() {
                    Some(timer) => timer.await,
                    None => std::future::pending().await,
                }
            }, if recheck.is_some() => {
                recheck = None;
                if confirm_disconnect(&store, &scope, &me, &clock, &config).await {
                    declared = true;
                    info!(session = %scope.id(), player = %me, "opponent disconnected");
                    if let Err(err) = channel.send(&Signal::OpponentDisconnected).await {
                        warn!(session = %scope.id(), error = %err, "failed to broadcast disconnect");
                        declared = false;
                    }
                }
            }
        }
    }
}

/// Second phase: re-read the record and confirm the opponent is still stale.
async fn confirm_disconnect(
    store: &Arc<dyn SharedStore>,
    scope: &SessionScope,
    me: &PlayerId,
    clock: &SharedClock,
    config: &DuelConfig,
) -> bool {
    match store.get(scope.id().as_str()).await {
        Ok(Some(document)) => {
            let record = SessionRecord::from_document(&document);
            watching(&record)
                && assess(&record, me, clock.now(), config.heartbeat_timeout) == PeerHealth::Stale
        }
        Ok(None) => false,
        Err(err) => {
            warn!(session = %scope.id(), error = %err, "disconnect re-check failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::TokioClock,
        dao::{models::Fields, session_store::{fields_from, memory::MemoryStore}},
        session::SessionId,
    };

    fn record(fields: Fields) -> SessionRecord {
        SessionRecord::from_document(&crate::dao::models::Document::new("ABC123", fields))
    }

    fn seated(host_beat: Option<i64>, guest_beat: Option<i64>) -> Fields {
        let mut fields = fields_from([
            ("player1", "HOST"),
            ("player2", "GUEST"),
            ("gameStatus", "active"),
        ]);
        if let Some(at) = host_beat {
            fields.insert("heartbeat_HOST".into(), Timestamp::from_millis(at).into());
        }
        if let Some(at) = guest_beat {
            fields.insert("heartbeat_GUEST".into(), Timestamp::from_millis(at).into());
        }
        fields
    }

    #[test]
    fn assessment_treats_missing_heartbeat_as_stale() {
        let host = PlayerId::new("HOST");
        let timeout = Duration::from_secs(10);
        let now = Timestamp::from_millis(20_000);

        let alone = record(fields_from([("player1", "HOST")]));
        assert_eq!(assess(&alone, &host, now, timeout), PeerHealth::NoOpponent);
        assert_eq!(
            assess(&record(seated(None, None)), &host, now, timeout),
            PeerHealth::Stale
        );
        assert_eq!(
            assess(&record(seated(None, Some(10_000))), &host, now, timeout),
            PeerHealth::Fresh
        );
        assert_eq!(
            assess(&record(seated(None, Some(9_999))), &host, now, timeout),
            PeerHealth::Stale
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_are_written_periodically() {
        let clock: SharedClock = Arc::new(TokioClock::starting_at(Timestamp::from_millis(0)));
        let store = MemoryStore::with_clock(clock.clone());
        store.seed("ABC123", seated(None, None));
        let monitor = LivenessMonitor::start(
            Arc::new(store.clone()),
            SessionScope::new(SessionId::new("ABC123")),
            PlayerId::new("HOST"),
            clock,
            Arc::new(DuelConfig::default()),
        );

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        let document = store.get("ABC123").await.unwrap().unwrap();
        let beat = SessionRecord::from_document(&document).heartbeat_of(&PlayerId::new("HOST"));
        assert_eq!(beat, Some(Timestamp::from_millis(6_000)));
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_opponent_is_declared_after_recheck() {
        let clock: SharedClock = Arc::new(TokioClock::starting_at(Timestamp::from_millis(0)));
        let store = MemoryStore::with_clock(clock.clone());
        store.seed("ABC123", seated(None, Some(0)));
        let _monitor = LivenessMonitor::start(
            Arc::new(store.clone()),
            SessionScope::new(SessionId::new("ABC123")),
            PlayerId::new("HOST"),
            clock,
            Arc::new(DuelConfig::default()),
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        let document = store.get("ABC123").await.unwrap().unwrap();
        assert_eq!(SessionRecord::from_document(&document).signal, None);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let document = store.get("ABC123").await.unwrap().unwrap();
        assert_eq!(
            SessionRecord::from_document(&document).signal,
            Some(Signal::OpponentDisconnected)
        );
    }
}
