//! Round Coordinator: drives the duel lifecycle through the session record.
//!
//! [`engine`] holds the pure event handler; [`runtime`] feeds it record snapshots, timers
//! and local input on one serialized queue and executes the store operations it emits.

pub mod engine;
mod runtime;

use std::sync::Arc;

use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::debug;

pub use self::engine::{
    CoordinatorInput, Effect, ListPurpose, MatchView, RoundCoordinator, StoreOp, Timer, TimerKind,
};
use crate::{
    clock::SharedClock,
    config::DuelConfig,
    dao::session_store::SharedStore,
    services::{identity::Identity, matchmaking::MatchTicket, signal_channel::SignalChannel},
};

/// Handle on a running coordinator.
///
/// Dropping the handle stops the coordinator and closes the session scope.
pub struct CoordinatorHandle {
    inputs: mpsc::UnboundedSender<CoordinatorInput>,
    view: watch::Receiver<MatchView>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Spawn the coordinator for the seat described by `ticket`.
    pub fn spawn(
        store: Arc<dyn SharedStore>,
        ticket: &MatchTicket,
        identity: &Identity,
        config: Arc<DuelConfig>,
        clock: SharedClock,
    ) -> Self {
        let coordinator = RoundCoordinator::new(
            ticket.session.clone(),
            ticket.role,
            identity.player.clone(),
            identity.display_name.clone(),
            config,
            clock,
            StdRng::from_os_rng(),
        );
        Self::spawn_with(store, ticket, identity, coordinator)
    }

    /// Spawn an already built coordinator, e.g. one with a seeded random generator.
    pub fn spawn_with(
        store: Arc<dyn SharedStore>,
        ticket: &MatchTicket,
        identity: &Identity,
        coordinator: RoundCoordinator,
    ) -> Self {
        let channel = SignalChannel::new(store.clone(), ticket.scope().clone());
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(coordinator.view());

        tokio::spawn(runtime::run_store_ops(
            store,
            channel.clone(),
            identity.player.clone(),
            ops_rx,
            inputs.downgrade(),
        ));
        let task = tokio::spawn(runtime::run(coordinator, channel, input_rx, ops, view_tx));

        Self { inputs, view, task }
    }

    /// Presentation feed; changes whenever the view does.
    pub fn view(&self) -> watch::Receiver<MatchView> {
        self.view.clone()
    }

    /// Latest published view.
    pub fn current(&self) -> MatchView {
        self.view.borrow().clone()
    }

    /// The confirmation screen is shown.
    pub fn enter_confirmation(&self) {
        self.push(CoordinatorInput::EnterConfirmation);
    }

    /// Deliver a simultaneous-touch count.
    pub fn submit_input(&self, touches: u8) {
        self.push(CoordinatorInput::Tap(touches));
    }

    /// Give up the match.
    pub fn forfeit(&self) {
        self.push(CoordinatorInput::Forfeit);
    }

    /// The ready countdown finished on screen.
    pub fn countdown_complete(&self) {
        self.push(CoordinatorInput::CountdownComplete);
    }

    /// The round result was shown.
    pub fn winner_displayed(&self) {
        self.push(CoordinatorInput::WinnerDisplayed);
    }

    /// Stop coordinating and leave the session.
    pub fn shutdown(&self) {
        self.push(CoordinatorInput::Shutdown);
    }

    /// Whether the event loop ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the event loop to end.
    pub async fn finished(&mut self) {
        if let Err(err) = (&mut self.task).await {
            debug!(error = %err, "coordinator task ended abnormally");
        }
    }

    fn push(&self, input: CoordinatorInput) {
        if self.inputs.send(input).is_err() {
            debug!("coordinator already stopped; input dropped");
        }
    }
}
