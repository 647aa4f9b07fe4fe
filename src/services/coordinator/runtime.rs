use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
        watch,
    },
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, info, warn};

use super::engine::{
    CoordinatorInput, Effect, ListPurpose, MatchView, RoundCoordinator, StoreOp, Timer,
};
use crate::{
    dao::{
        models::Update,
        session_store::SharedStore,
        storage::{StoreError, StoreResult},
    },
    services::signal_channel::SignalChannel,
    session::{MoveEntry, PlayerId, fields},
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Event loop of one peer: record feed, timers and local input go through a single queue.
pub(super) async fn run(
    mut coordinator: RoundCoordinator,
    channel: SignalChannel,
    mut inputs: UnboundedReceiver<CoordinatorInput>,
    ops: UnboundedSender<StoreOp>,
    view: watch::Sender<MatchView>,
) {
    let mut records = channel.subscribe();
    let mut timers: JoinSet<Timer> = JoinSet::new();
    let mut delay = INITIAL_DELAY;

    loop {
        let input = tokio::select! {
            input = inputs.recv() => input.unwrap_or(CoordinatorInput::Shutdown),
            item = records.next() => match item {
                Some(Ok(record)) => {
                    delay = INITIAL_DELAY;
                    CoordinatorInput::Record(record)
                }
                Some(Err(err)) => {
                    warn!(session = %channel.scope().id(), error = %err, "record subscription failed; resubscribing");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                    records = channel.subscribe();
                    continue;
                }
                None => {
                    debug!(session = %channel.scope().id(), "record subscription ended; resubscribing");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                    records = channel.subscribe();
                    continue;
                }
            },
            Some(fired) = timers.join_next(), if !timers.is_empty() => match fired {
                Ok(timer) => CoordinatorInput::Timer(timer),
                Err(err) => {
                    debug!(error = %err, "timer task aborted");
                    continue;
                }
            },
        };

        for effect in coordinator.handle(input) {
            match effect {
                Effect::Schedule { timer, after } => {
                    timers.spawn(async move {
                        sleep(after).await;
                        timer
                    });
                }
                Effect::Store(op) => {
                    if ops.send(op).is_err() {
                        warn!(session = %channel.scope().id(), "store worker stopped; operation dropped");
                    }
                }
            }
        }

        let next = coordinator.view();
        view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });

        if coordinator.is_finished() {
            info!(session = %channel.scope().id(), phase = ?coordinator.phase(), "coordinator finished");
            break;
        }
    }
}

/// Executes store operations in submission order, off the event loop.
///
/// Every operation is checked against the session scope right before it runs; `Leave`
/// closes the scope after everything queued before it.
pub(super) async fn run_store_ops(
    store: Arc<dyn SharedStore>,
    channel: SignalChannel,
    me: PlayerId,
    mut ops: UnboundedReceiver<StoreOp>,
    feedback: WeakUnboundedSender<CoordinatorInput>,
) {
    while let Some(op) = ops.recv().await {
        let scope = channel.scope();
        if !scope.is_active() {
            debug!(session = %scope.id(), op = ?op, "session left; store operation skipped");
            continue;
        }
        let id = scope.id().as_str();

        let result = match op {
            StoreOp::Merge(update) => store.merge(id, update).await,
            StoreOp::Commit(batch) => store.commit(batch).await,
            StoreOp::SubmitMove(mv) => {
                let submission = Update::new()
                    .set(fields::MOVE, mv.value())
                    .server_timestamp(fields::MOVE_TIMESTAMP);
                match store
                    .set_child(id, fields::MOVES_COLLECTION, me.as_str(), submission)
                    .await
                {
                    Ok(()) => list_moves(store.as_ref(), id, ListPurpose::Resolve, &feedback).await,
                    Err(err) => Err(err),
                }
            }
            StoreOp::ListMoves(purpose) => list_moves(store.as_ref(), id, purpose, &feedback).await,
            StoreOp::Send(signal) => channel.send(&signal).await,
            StoreOp::ClearIfEquals(signal) => channel.clear_if_equals(&signal).await.map(|cleared| {
                debug!(session = %scope.id(), %signal, cleared, "conditional signal clear");
            }),
            StoreOp::ClearIfStartsWith(prefix) => {
                channel.clear_if_starts_with(prefix).await.map(|cleared| {
                    debug!(session = %scope.id(), prefix, cleared, "conditional signal clear");
                })
            }
            StoreOp::Leave => {
                scope.close();
                debug!(session = %scope.id(), "session scope closed");
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(StoreError::PreconditionFailed { field, .. }) => {
                debug!(session = %scope.id(), field = %field, "write superseded by another peer");
            }
            Err(err) => warn!(session = %scope.id(), error = %err, "session write failed"),
        }
    }
}

async fn list_moves(
    store: &dyn SharedStore,
    id: &str,
    purpose: ListPurpose,
    feedback: &WeakUnboundedSender<CoordinatorInput>,
) -> StoreResult<()> {
    let entries = store
        .list_children(id, fields::MOVES_COLLECTION)
        .await?
        .iter()
        .filter_map(MoveEntry::from_document)
        .collect();
    if let Some(sender) = feedback.upgrade() {
        if sender
            .send(CoordinatorInput::MovesListed { purpose, entries })
            .is_err()
        {
            debug!(session = %id, "coordinator gone; move listing dropped");
        }
    }
    Ok(())
}
