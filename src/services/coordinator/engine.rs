use std::{sync::Arc, time::Duration};

use rand::{Rng, rngs::StdRng};
use tracing::{debug, info};

use crate::{
    clock::SharedClock,
    config::DuelConfig,
    dao::models::{Batch, Update},
    session::{
        GameStatus, Move, MoveEntry, PlayerFlag, PlayerId, RecordPhase, RejectionReason, Role,
        RoundWinner, SessionId, SessionRecord, Signal, fields,
    },
    state::{
        DuelEvent, DuelPhase, DuelStateMachine, EndReason, MatchEnd, MatchResult, MatchTally,
        RoundGuards, RoundResult, resolve_moves,
    },
};

/// Local timers owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Opponent never reached the confirmation screen.
    ConnectTimeout,
    /// Write `inConfirmView_<self>`.
    InConfirmMark,
    /// Write `confirmed_<self>`.
    ConfirmMark,
    /// Confirmation did not complete.
    ConfirmTimeout,
    /// Pause after both confirmations.
    JointStart,
    /// One second of the ready countdown.
    ReadyTick,
    /// One second of the penalty delay.
    PenaltyTick,
    /// Moves are due.
    DuelTimeout,
    /// Round result was shown long enough.
    ResultDisplay,
    /// Forfeit grace period elapsed.
    ForfeitGrace,
}

impl TimerKind {
    /// Whether a firing is dropped once the phase moved on since scheduling.
    fn version_bound(self) -> bool {
        !matches!(
            self,
            TimerKind::ConnectTimeout
                | TimerKind::InConfirmMark
                | TimerKind::ConfirmMark
                | TimerKind::ForfeitGrace
        )
    }
}

/// A scheduled timer, stamped with the state machine version it was armed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    /// What the timer is for.
    pub kind: TimerKind,
    /// State machine version at scheduling time.
    pub version: u64,
}

/// Why the `moves` sub-collection was listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPurpose {
    /// Right after this peer submitted its move.
    Resolve,
    /// The duel timeout fired.
    Timeout,
}

/// Everything the coordinator reacts to, serialized on one queue.
#[derive(Debug, Clone)]
pub enum CoordinatorInput {
    /// Latest session record; `None` once deleted.
    Record(Option<SessionRecord>),
    /// A timer fired.
    Timer(Timer),
    /// Presentation showed the confirmation screen.
    EnterConfirmation,
    /// Raw local input: simultaneous-touch count.
    Tap(u8),
    /// Local player gives up.
    Forfeit,
    /// Presentation finished the ready countdown early.
    CountdownComplete,
    /// Presentation finished showing the round result.
    WinnerDisplayed,
    /// Result of listing the `moves` sub-collection.
    MovesListed {
        /// Why the listing was requested.
        purpose: ListPurpose,
        /// Stamped submissions.
        entries: Vec<MoveEntry>,
    },
    /// Stop coordinating and leave the session.
    Shutdown,
}

/// Store operation requested by the coordinator, executed in order by the runtime.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Merge-update the session record.
    Merge(Update),
    /// Commit a batch.
    Commit(Batch),
    /// Write this peer's move, then list the sub-collection for resolution.
    SubmitMove(Move),
    /// List the sub-collection.
    ListMoves(ListPurpose),
    /// Broadcast a signal.
    Send(Signal),
    /// Clear the signal while it still equals the value.
    ClearIfEquals(Signal),
    /// Clear the signal while it starts with the prefix.
    ClearIfStartsWith(&'static str),
    /// Close the session scope; later writes are dropped.
    Leave,
}

/// Output of one handled input.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Arm a timer.
    Schedule {
        /// Timer to deliver back.
        timer: Timer,
        /// Delay before delivery.
        after: Duration,
    },
    /// Run a store operation.
    Store(StoreOp),
}

/// Presentation feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchView {
    /// Session being played.
    pub session: SessionId,
    /// Local seat.
    pub role: Role,
    /// Current phase.
    pub phase: DuelPhase,
    /// Round in progress, 1-based.
    pub round: u32,
    /// Rounds per match.
    pub max_rounds: u32,
    /// Local score.
    pub own_score: u32,
    /// Opponent score.
    pub opponent_score: u32,
    /// Ordered round history.
    pub results: Vec<RoundResult>,
    /// Remaining ready countdown seconds.
    pub countdown: Option<u8>,
    /// Remaining penalty delay seconds.
    pub penalty_countdown: Option<u8>,
    /// Result of the latest round.
    pub last_result: Option<RoundResult>,
    /// Local display name.
    pub own_name: String,
    /// Opponent display name, once seated.
    pub opponent_name: Option<String>,
    /// Final outcome once the match ended.
    pub outcome: Option<MatchEnd>,
    /// Short human-readable status line.
    pub notice: Option<String>,
}

/// Round Coordinator: drives one peer through a match.
///
/// Pure and synchronous: every [`CoordinatorInput`] yields a list of [`Effect`]s. Every
/// reaction to the record is guarded so that re-delivered snapshots and duplicate
/// signals leave the state unchanged.
pub struct RoundCoordinator {
    session: SessionId,
    role: Role,
    me: PlayerId,
    own_name: String,
    config: Arc<DuelConfig>,
    clock: SharedClock,
    rng: StdRng,
    machine: DuelStateMachine,
    tally: MatchTally,
    guards: RoundGuards,
    record: Option<SessionRecord>,
    countdown: Option<u8>,
    penalty: Option<u8>,
    last_result: Option<RoundResult>,
    pending_end: Option<MatchEnd>,
    notice: Option<String>,
    stopped: bool,
    effects: Vec<Effect>,
}

impl RoundCoordinator {
    /// Coordinator for `me` seated as `role` in `session`.
    pub fn new(
        session: SessionId,
        role: Role,
        me: PlayerId,
        own_name: impl Into<String>,
        config: Arc<DuelConfig>,
        clock: SharedClock,
        rng: StdRng,
    ) -> Self {
        Self {
            session,
            role,
            me,
            own_name: own_name.into(),
            tally: MatchTally::new(config.points_per_round),
            config,
            clock,
            rng,
            machine: DuelStateMachine::new(),
            guards: RoundGuards::new(1, 1),
            record: None,
            countdown: None,
            penalty: None,
            last_result: None,
            pending_end: None,
            notice: None,
            stopped: false,
            effects: Vec::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &DuelPhase {
        self.machine.phase()
    }

    /// Whether the coordinator will not react to anything anymore.
    pub fn is_finished(&self) -> bool {
        self.stopped || self.machine.phase().is_terminal()
    }

    /// Handle one input and return the resulting effects.
    pub fn handle(&mut self, input: CoordinatorInput) -> Vec<Effect> {
        if !self.is_finished() {
            match input {
                CoordinatorInput::Record(Some(record)) => self.record = Some(record),
                CoordinatorInput::Record(None) => self.on_record_deleted(),
                CoordinatorInput::Timer(timer) => self.on_timer(timer),
                CoordinatorInput::EnterConfirmation => self.on_enter_confirmation(),
                CoordinatorInput::Tap(value) => self.on_tap(value),
                CoordinatorInput::Forfeit => self.on_forfeit_requested(),
                CoordinatorInput::CountdownComplete => {
                    if self.phase() == &DuelPhase::Countdown {
                        self.finish_countdown();
                    }
                }
                CoordinatorInput::WinnerDisplayed => {
                    if self.phase() == &DuelPhase::RoundOver {
                        self.mark_winner_displayed();
                    }
                }
                CoordinatorInput::MovesListed { purpose, entries } => {
                    self.on_moves_listed(purpose, &entries)
                }
                CoordinatorInput::Shutdown => {
                    self.stopped = true;
                    self.notice = Some("left the session".to_owned());
                    self.store(StoreOp::Leave);
                }
            }
            if !self.is_finished() {
                self.evaluate();
            }
        }
        std::mem::take(&mut self.effects)
    }

    /// Snapshot for the presentation layer.
    pub fn view(&self) -> MatchView {
        let outcome = match self.machine.phase() {
            DuelPhase::MatchOver(end) => Some(end.clone()),
            _ => None,
        };
        MatchView {
            session: self.session.clone(),
            role: self.role,
            phase: self.machine.phase().clone(),
            round: self.guards.round.max(1),
            max_rounds: self.config.max_rounds,
            own_score: self.tally.own_score(),
            opponent_score: self.tally.opponent_score(),
            results: self.tally.results().to_vec(),
            countdown: self.countdown,
            penalty_countdown: self.penalty,
            last_result: self.last_result,
            own_name: self.own_name.clone(),
            opponent_name: self
                .record
                .as_ref()
                .and_then(|record| record.opponent_of(&self.me))
                .and_then(|slot| slot.name.clone()),
            outcome,
            notice: self.notice.clone(),
        }
    }

    fn store(&mut self, op: StoreOp) {
        self.effects.push(Effect::Store(op));
    }

    fn merge(&mut self, update: Update) {
        self.store(StoreOp::Merge(update));
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration) {
        let timer = Timer {
            kind,
            version: self.machine.version(),
        };
        self.effects.push(Effect::Schedule { timer, after });
    }

    fn transition(&mut self, event: DuelEvent) -> bool {
        match self.machine.apply(event) {
            Ok(phase) => {
                info!(session = %self.session, player = %self.me, phase = ?phase, "duel phase changed");
                true
            }
            Err(err) => {
                debug!(session = %self.session, error = %err, "transition skipped");
                false
            }
        }
    }

    fn set_own_flag(&mut self, flag: PlayerFlag) {
        self.merge(Update::new().set(flag.key(&self.me), true));
    }

    fn finish(&mut self, end: MatchEnd) {
        if self.transition(DuelEvent::FinishMatch(end)) {
            self.countdown = None;
            self.penalty = None;
            self.store(StoreOp::Leave);
        }
    }

    fn on_record_deleted(&mut self) {
        if self.transition(DuelEvent::SessionClosed) {
            self.notice = Some("session closed".to_owned());
            self.store(StoreOp::Leave);
        }
    }

    /// Re-check every record-driven condition against the latest snapshot.
    fn evaluate(&mut self) {
        let Some(record) = self.record.clone() else {
            return;
        };
        if self.pending_end.is_some() {
            return;
        }
        if record.role_of(&self.me).is_none() {
            info!(session = %self.session, player = %self.me, "no longer seated in the session");
            self.on_record_deleted();
            return;
        }

        match &record.signal {
            Some(Signal::ForfeitBy(by)) => {
                self.on_forfeit(by.clone());
                return;
            }
            Some(Signal::OpponentDisconnected) => {
                self.on_disconnect(&record);
                return;
            }
            _ => {}
        }

        if let Some(reason) = record.rejection_reason.clone() {
            let event = DuelEvent::Reject(reason);
            if self.machine.can_apply(&event) && self.transition(event) {
                self.notice = Some("match voided".to_owned());
                self.store(StoreOp::Leave);
                return;
            }
        }

        if !record.is_active() {
            return;
        }

        let phase = self.machine.phase().clone();
        match phase {
            DuelPhase::Waiting => {
                if record.is_full() && self.transition(DuelEvent::OpponentJoined) {
                    self.schedule(TimerKind::ConnectTimeout, self.config.connect_timeout);
                }
            }
            DuelPhase::Confirming => {
                let confirmed = record.has_flag(PlayerFlag::Confirmed, &self.me)
                    && record.both_flagged(PlayerFlag::Confirmed);
                if confirmed && self.transition(DuelEvent::BothConfirmed) {
                    if record.signal != Some(Signal::Confirmed) {
                        self.store(StoreOp::Send(Signal::Confirmed));
                    }
                    self.schedule(TimerKind::JointStart, self.config.joint_start_delay);
                }
            }
            DuelPhase::Countdown => self.on_countdown_record(&record),
            DuelPhase::PenaltyDelay | DuelPhase::Duel => self.on_round_record(&record),
            DuelPhase::RoundOver => self.on_round_over_record(&record),
            _ => {}
        }
    }

    fn on_forfeit(&mut self, by: PlayerId) {
        let result = if by == self.me {
            MatchResult::Lose
        } else {
            self.notice = Some("opponent forfeited".to_owned());
            MatchResult::Win
        };
        info!(session = %self.session, by = %by, "forfeit observed");
        self.pending_end = Some(MatchEnd {
            result,
            reason: EndReason::Forfeit { by },
        });
        self.schedule(TimerKind::ForfeitGrace, self.config.forfeit_grace);
    }

    fn on_forfeit_requested(&mut self) {
        if self.pending_end.is_some() {
            return;
        }
        self.merge(
            Update::new()
                .set(fields::SIGNAL, Signal::ForfeitBy(self.me.clone()).to_string())
                .set(fields::GAME_STATUS, GameStatus::Forfeited.as_str()),
        );
        self.notice = Some("you forfeited".to_owned());
        self.on_forfeit(self.me.clone());
    }

    fn on_disconnect(&mut self, record: &SessionRecord) {
        let own_age = record.heartbeat_age(&self.me, self.clock.now());
        let result = if own_age.is_some_and(|age| age <= self.config.heartbeat_timeout) {
            self.notice = Some("opponent disconnected".to_owned());
            MatchResult::Win
        } else {
            self.notice = Some("connection lost".to_owned());
            MatchResult::Lose
        };
        self.finish(MatchEnd {
            result,
            reason: EndReason::Disconnect,
        });
    }

    fn reject(&mut self, reason: RejectionReason) {
        self.merge(
            Update::new()
                .set(fields::REJECTION_REASON, reason.as_str())
                .set(fields::GAME_STATUS, GameStatus::Closed.as_str()),
        );
        if self.transition(DuelEvent::Reject(reason)) {
            self.notice = Some("confirmation timed out".to_owned());
            self.store(StoreOp::Leave);
        }
    }

    fn on_enter_confirmation(&mut self) {
        if self.transition(DuelEvent::EnterConfirmation) {
            self.schedule(TimerKind::InConfirmMark, self.config.in_confirm_mark_delay);
            self.schedule(TimerKind::ConfirmTimeout, self.config.confirm_timeout);
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        if timer.kind.version_bound() && timer.version != self.machine.version() {
            debug!(session = %self.session, timer = ?timer.kind, "stale timer ignored");
            return;
        }

        let phase = self.machine.phase().clone();
        match (timer.kind, phase) {
            (TimerKind::ConnectTimeout, DuelPhase::Connected | DuelPhase::Confirming) => {
                let opponent_arrived = self.record.as_ref().is_some_and(|record| {
                    record
                        .opponent_of(&self.me)
                        .is_some_and(|slot| record.has_flag(PlayerFlag::InConfirmView, &slot.id))
                });
                if !opponent_arrived {
                    self.reject(RejectionReason::DoubleTimeout);
                }
            }
            (TimerKind::InConfirmMark, DuelPhase::Confirming) => {
                self.set_own_flag(PlayerFlag::InConfirmView);
                self.schedule(TimerKind::ConfirmMark, self.config.confirm_mark_delay);
            }
            (TimerKind::ConfirmMark, DuelPhase::Confirming) => {
                self.set_own_flag(PlayerFlag::Confirmed);
            }
            (TimerKind::ConfirmTimeout, DuelPhase::Confirming) => {
                self.reject(RejectionReason::Timeout);
            }
            (TimerKind::JointStart, DuelPhase::BothConfirmed) => {
                if self.transition(DuelEvent::StartCountdown) {
                    self.enter_countdown();
                }
            }
            (TimerKind::ReadyTick, DuelPhase::Countdown) if !self.guards.countdown_done => {
                let left = self.countdown.unwrap_or(0).saturating_sub(1);
                self.countdown = Some(left);
                if left == 0 {
                    self.finish_countdown();
                } else {
                    self.schedule(TimerKind::ReadyTick, self.config.tick);
                }
            }
            (TimerKind::PenaltyTick, DuelPhase::PenaltyDelay) => {
                let left = self.penalty.unwrap_or(0).saturating_sub(1);
                self.penalty = Some(left);
                if left == 0 {
                    self.open_duel();
                } else {
                    self.schedule(TimerKind::PenaltyTick, self.config.tick);
                }
            }
            (TimerKind::DuelTimeout, DuelPhase::Duel) if !self.guards.result_recorded => {
                self.store(StoreOp::ListMoves(ListPurpose::Timeout));
            }
            (TimerKind::ResultDisplay, DuelPhase::RoundOver) => self.mark_winner_displayed(),
            (TimerKind::ForfeitGrace, _) => {
                if let Some(end) = self.pending_end.take() {
                    self.finish(end);
                }
            }
            (kind, phase) => {
                debug!(session = %self.session, timer = ?kind, phase = ?phase, "timer not applicable");
            }
        }
    }

    /// Start the ready countdown of the next round.
    fn enter_countdown(&mut self) {
        let round = (self.tally.completed_rounds() + 1).min(self.config.max_rounds);
        let synced = self.record.as_ref().map_or(1, |record| record.round_number);
        self.guards = RoundGuards::new(round, synced);
        self.last_result = None;
        self.penalty = None;

        self.store(StoreOp::ClearIfEquals(Signal::StartMatch));
        self.store(StoreOp::ClearIfEquals(Signal::AdvanceRound));
        self.store(StoreOp::ClearIfStartsWith(Signal::EARLY_TAP_PREFIX));

        self.countdown = Some(self.config.ready_countdown);
        if self.config.ready_countdown == 0 {
            self.finish_countdown();
        } else {
            self.schedule(TimerKind::ReadyTick, self.config.tick);
        }
    }

    fn finish_countdown(&mut self) {
        if self.guards.countdown_done {
            return;
        }
        self.guards.countdown_done = true;
        self.countdown = Some(0);
        self.set_own_flag(PlayerFlag::RequestedStart);
    }

    fn on_countdown_record(&mut self, record: &SessionRecord) {
        if self.role == Role::Host
            && !self.guards.start_sent
            && record.both_flagged(PlayerFlag::RequestedStart)
        {
            self.guards.start_sent = true;
            let penalty = self.rng.random_range(0..=self.config.penalty_max);
            let mut update = Update::new()
                .set(fields::PENALTY_COUNTDOWN, i64::from(penalty))
                .set(fields::SIGNAL, Signal::StartMatch.to_string());
            for key in record.flag_keys(PlayerFlag::RequestedStart) {
                update = update.delete(key.clone()).require_equals(key, true);
            }
            debug!(session = %self.session, penalty, "starting round");
            self.merge(update);
        }

        if !self.guards.countdown_done {
            return;
        }
        if record.signal == Some(Signal::StartMatch) && self.transition(DuelEvent::StartMatch) {
            self.enter_penalty(record);
            return;
        }
        self.on_round_record(record);
    }

    fn enter_penalty(&mut self, record: &SessionRecord) {
        self.countdown = None;
        let delay = record
            .penalty_countdown
            .unwrap_or(0)
            .min(self.config.penalty_max);
        self.penalty = Some(delay);

        if self.role == Role::Host && self.guards.host_should_increment(self.config.max_rounds) {
            self.guards.round_incremented = true;
            self.merge(
                Update::new()
                    .increment(fields::ROUND_NUMBER, 1)
                    .require_equals(fields::ROUND_NUMBER, i64::from(self.guards.last_synced_round)),
            );
        }

        if delay == 0 {
            self.open_duel();
        } else {
            self.schedule(TimerKind::PenaltyTick, self.config.tick);
        }
    }

    fn open_duel(&mut self) {
        if !self.transition(DuelEvent::OpenDuel) {
            return;
        }
        self.penalty = None;
        if self.role == Role::Host {
            self.merge(Update::new().server_timestamp(fields::DUEL_START_TIME));
        }
        self.schedule(TimerKind::DuelTimeout, self.config.duel_timeout);
    }

    fn on_tap(&mut self, value: u8) {
        let phase = self.machine.phase().clone();
        match phase {
            DuelPhase::PenaltyDelay if !self.guards.input_taken => {
                self.guards.input_taken = true;
                info!(session = %self.session, player = %self.me, "early tap");
                self.store(StoreOp::Send(Signal::EarlyTapBy(self.me.clone())));
                self.decide(RoundResult::EarlyTap);
            }
            DuelPhase::Duel if !self.guards.input_taken => match Move::try_from(value) {
                Ok(mv) => {
                    self.guards.input_taken = true;
                    debug!(session = %self.session, value, "move submitted");
                    self.store(StoreOp::SubmitMove(mv));
                }
                Err(err) => debug!(session = %self.session, error = %err, "input ignored"),
            },
            phase => debug!(session = %self.session, phase = ?phase, "input ignored"),
        }
    }

    fn on_moves_listed(&mut self, purpose: ListPurpose, entries: &[MoveEntry]) {
        if self.machine.phase() != &DuelPhase::Duel || self.guards.result_recorded {
            return;
        }
        let already_resolved = self.record.as_ref().is_some_and(SessionRecord::round_over);
        match (resolve_moves(entries), purpose) {
            (Some(winner), _) => {
                if !already_resolved {
                    self.write_result(&winner);
                }
            }
            (None, ListPurpose::Resolve) => {}
            (None, ListPurpose::Timeout) => {
                if !already_resolved {
                    info!(session = %self.session, submitted = entries.len(), "duel timed out; proposing a tie");
                    self.write_result(&RoundWinner::Tie);
                }
            }
        }
    }

    /// First resolver wins; later writes fail their precondition.
    fn write_result(&mut self, winner: &RoundWinner) {
        self.merge(
            Update::new()
                .set(fields::ROUND_WINNER, winner.as_value())
                .set(fields::PHASE, RecordPhase::RoundOver.as_str())
                .require_absent(fields::ROUND_WINNER),
        );
    }

    fn on_round_record(&mut self, record: &SessionRecord) {
        if self.guards.result_recorded {
            return;
        }
        if let Some(Signal::EarlyTapBy(by)) = &record.signal {
            if by != &self.me {
                self.notice = Some("opponent tapped early".to_owned());
                self.decide(RoundResult::Win);
                return;
            }
        }
        if record.round_over() {
            let result = match &record.round_winner {
                Some(RoundWinner::Player(winner)) if winner == &self.me => RoundResult::Win,
                Some(RoundWinner::Player(_)) => RoundResult::Lose,
                Some(RoundWinner::Tie) => RoundResult::Tie,
                None => return,
            };
            self.decide(result);
        }
    }

    fn decide(&mut self, result: RoundResult) {
        if self.guards.result_recorded {
            return;
        }
        self.guards.result_recorded = true;
        self.tally.record(result);
        self.last_result = Some(result);
        self.countdown = None;
        self.penalty = None;
        if self.transition(DuelEvent::RoundDecided) {
            self.schedule(TimerKind::ResultDisplay, self.config.result_display);
        }
    }

    fn mark_winner_displayed(&mut self) {
        if self.guards.winner_marked {
            return;
        }
        self.guards.winner_marked = true;
        self.set_own_flag(PlayerFlag::WinnerDisplayed);
    }

    fn on_round_over_record(&mut self, record: &SessionRecord) {
        match record.signal {
            Some(Signal::NextRound) if !self.guards.advanced => {
                self.guards.advanced = true;
                self.advance_round();
                return;
            }
            Some(Signal::Victory) if self.tally.completed_rounds() >= self.config.max_rounds => {
                self.finish(MatchEnd {
                    result: self.tally.final_result(),
                    reason: EndReason::Completed,
                });
                return;
            }
            _ => {}
        }

        if self.guards.winner_marked
            && !self.guards.advance_sent
            && record.has_flag(PlayerFlag::WinnerDisplayed, &self.me)
            && record.both_flagged(PlayerFlag::WinnerDisplayed)
        {
            self.guards.advance_sent = true;
            self.commit_round_advance(record);
        }
    }

    /// Clear the per-round state in one batch and broadcast `NEXT_ROUND`.
    fn commit_round_advance(&mut self, record: &SessionRecord) {
        let own_displayed = PlayerFlag::WinnerDisplayed.key(&self.me);
        let mut update = Update::new()
            .delete(fields::ROUND_WINNER)
            .delete(fields::PHASE)
            .set(fields::SIGNAL, Signal::NextRound.to_string())
            .require_equals(own_displayed, true);
        for flag in [PlayerFlag::WinnerDisplayed, PlayerFlag::RequestedStart] {
            for key in record.flag_keys(flag) {
                update = update.delete(key);
            }
        }

        let mut batch = Batch::new().merge(self.session.as_str(), update);
        for slot in record.players.iter().flatten() {
            batch = batch.delete_child(
                self.session.as_str(),
                fields::MOVES_COLLECTION,
                slot.id.as_str(),
            );
        }
        debug!(session = %self.session, round = self.guards.round, "advancing round");
        self.store(StoreOp::Commit(batch));
    }

    fn advance_round(&mut self) {
        if self.tally.completed_rounds() >= self.config.max_rounds {
            self.store(StoreOp::Send(Signal::Victory));
            self.finish(MatchEnd {
                result: self.tally.final_result(),
                reason: EndReason::Completed,
            });
        } else if self.transition(DuelEvent::NextRound) {
            self.enter_countdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        clock::{Clock, Timestamp},
        dao::{
            models::{Document, FieldOp, FieldValue, Fields},
            session_store::fields_from,
        },
    };

    #[derive(Debug)]
    struct FixedClock(Timestamp);

    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            self.0
        }
    }

    const NOW: i64 = 1_000_000;

    fn coordinator(role: Role) -> RoundCoordinator {
        let me = match role {
            Role::Host => "HOST",
            Role::Guest => "GUEST",
        };
        RoundCoordinator::new(
            SessionId::new("ABC123"),
            role,
            PlayerId::new(me),
            me,
            Arc::new(DuelConfig::default()),
            Arc::new(FixedClock(Timestamp::from_millis(NOW))),
            StdRng::seed_from_u64(7),
        )
    }

    fn base() -> Fields {
        let mut fields = fields_from([
            ("state", "connected"),
            ("gameStatus", "active"),
            ("player1", "HOST"),
            ("player2", "GUEST"),
            ("player2Name", "Guest"),
        ]);
        fields.insert("round_number".into(), FieldValue::Int(1));
        fields.insert(
            "heartbeat_HOST".into(),
            Timestamp::from_millis(NOW - 1_000).into(),
        );
        fields
    }

    fn with(mut fields: Fields, entries: &[(&str, FieldValue)]) -> Fields {
        for (key, value) in entries {
            fields.insert((*key).to_owned(), value.clone());
        }
        fields
    }

    fn record(fields: Fields) -> CoordinatorInput {
        CoordinatorInput::Record(Some(SessionRecord::from_document(&Document::new(
            "ABC123", fields,
        ))))
    }

    fn fire(coordinator: &mut RoundCoordinator, kind: TimerKind) -> Vec<Effect> {
        let version = coordinator.machine.version();
        coordinator.handle(CoordinatorInput::Timer(Timer { kind, version }))
    }

    fn merges(effects: &[Effect]) -> Vec<&Update> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Store(StoreOp::Merge(update)) => Some(update),
                _ => None,
            })
            .collect()
    }

    fn sends(effects: &[Effect], signal: &Signal) -> bool {
        effects
            .iter()
            .any(|effect| matches!(effect, Effect::Store(StoreOp::Send(sent)) if sent == signal))
    }

    /// Walk the host to the open duel window with a zero penalty.
    fn host_in_duel() -> (RoundCoordinator, Fields) {
        let mut host = coordinator(Role::Host);
        host.handle(record(base()));
        assert_eq!(host.phase(), &DuelPhase::Connected);
        host.handle(CoordinatorInput::EnterConfirmation);
        let confirmed = with(
            base(),
            &[
                ("confirmed_HOST", true.into()),
                ("confirmed_GUEST", true.into()),
            ],
        );
        host.handle(record(confirmed));
        assert_eq!(host.phase(), &DuelPhase::BothConfirmed);
        fire(&mut host, TimerKind::JointStart);
        assert_eq!(host.phase(), &DuelPhase::Countdown);
        host.handle(CoordinatorInput::CountdownComplete);

        let started = with(
            base(),
            &[
                ("signal", "START_MATCH".into()),
                ("penalty_countdown", FieldValue::Int(0)),
            ],
        );
        let effects = host.handle(record(started.clone()));
        assert_eq!(host.phase(), &DuelPhase::Duel);
        assert!(
            merges(&effects)
                .iter()
                .any(|update| update.ops().contains_key("round_number"))
        );
        (host, started)
    }

    #[test]
    fn both_confirmed_needs_two_distinct_flags_and_own() {
        let mut guest = coordinator(Role::Guest);
        guest.handle(record(base()));
        guest.handle(CoordinatorInput::EnterConfirmation);

        guest.handle(record(with(base(), &[("confirmed_HOST", true.into())])));
        assert_eq!(guest.phase(), &DuelPhase::Confirming);

        let effects = guest.handle(record(with(
            base(),
            &[
                ("confirmed_GUEST", true.into()),
                ("confirmed_HOST", true.into()),
            ],
        )));
        assert_eq!(guest.phase(), &DuelPhase::BothConfirmed);
        assert!(sends(&effects, &Signal::Confirmed));
    }

    #[test]
    fn confirmation_timeout_voids_the_match() {
        let mut guest = coordinator(Role::Guest);
        guest.handle(record(base()));
        guest.handle(CoordinatorInput::EnterConfirmation);
        let effects = fire(&mut guest, TimerKind::ConfirmTimeout);

        assert_eq!(
            guest.phase(),
            &DuelPhase::Rejected(RejectionReason::Timeout)
        );
        assert!(merges(&effects).iter().any(|update| {
            update.ops().get("rejection_reason") == Some(&FieldOp::Set("timeout".into()))
        }));
        assert!(guest.is_finished());
    }

    #[test]
    fn observed_rejection_moves_to_rejected() {
        let mut host = coordinator(Role::Host);
        host.handle(record(base()));
        host.handle(record(with(
            base(),
            &[
                ("rejection_reason", "double_timeout".into()),
                ("gameStatus", "closed".into()),
            ],
        )));
        assert_eq!(
            host.phase(),
            &DuelPhase::Rejected(RejectionReason::DoubleTimeout)
        );
    }

    #[test]
    fn host_starts_round_once_both_requested() {
        let mut host = coordinator(Role::Host);
        host.handle(record(base()));
        host.handle(CoordinatorInput::EnterConfirmation);
        host.handle(record(with(
            base(),
            &[
                ("confirmed_HOST", true.into()),
                ("confirmed_GUEST", true.into()),
            ],
        )));
        fire(&mut host, TimerKind::JointStart);
        host.handle(CoordinatorInput::CountdownComplete);

        let requested = with(
            base(),
            &[
                ("requested_start_HOST", true.into()),
                ("requested_start_GUEST", true.into()),
            ],
        );
        let first = host.handle(record(requested.clone()));
        let update = merges(&first)
            .into_iter()
            .find(|update| update.ops().contains_key("penalty_countdown"))
            .cloned()
            .expect("start update");
        let penalty = match update.ops().get("penalty_countdown") {
            Some(FieldOp::Set(FieldValue::Int(value))) => *value,
            other => panic!("unexpected penalty op {other:?}"),
        };
        assert!((0..=3).contains(&penalty));
        assert_eq!(update.preconditions().len(), 2);

        let second = host.handle(record(requested));
        assert!(merges(&second).is_empty());
    }

    #[test]
    fn early_tap_loses_immediately() {
        let mut guest = coordinator(Role::Guest);
        guest.handle(record(base()));
        guest.handle(CoordinatorInput::EnterConfirmation);
        guest.handle(record(with(
            base(),
            &[
                ("confirmed_HOST", true.into()),
                ("confirmed_GUEST", true.into()),
            ],
        )));
        fire(&mut guest, TimerKind::JointStart);
        guest.handle(CoordinatorInput::CountdownComplete);
        guest.handle(record(with(
            base(),
            &[
                ("signal", "START_MATCH".into()),
                ("penalty_countdown", FieldValue::Int(3)),
            ],
        )));
        assert_eq!(guest.phase(), &DuelPhase::PenaltyDelay);

        let effects = guest.handle(CoordinatorInput::Tap(2));
        assert!(sends(
            &effects,
            &Signal::EarlyTapBy(PlayerId::new("GUEST"))
        ));
        let view = guest.view();
        assert_eq!(view.phase, DuelPhase::RoundOver);
        assert_eq!(view.results, vec![RoundResult::EarlyTap]);
        assert_eq!(view.opponent_score, 100);
        assert_eq!(view.own_score, 0);
    }

    #[test]
    fn duel_timeout_with_one_move_is_a_tie() {
        let (mut host, started) = host_in_duel();
        host.handle(CoordinatorInput::Tap(1));

        let effects = fire(&mut host, TimerKind::DuelTimeout);
        assert!(effects.iter().any(|effect| matches!(
            effect,
            Effect::Store(StoreOp::ListMoves(ListPurpose::Timeout))
        )));

        let lonely = vec![MoveEntry {
            player: PlayerId::new("HOST"),
            mv: Move::One,
            at: Timestamp::from_millis(NOW),
        }];
        let effects = host.handle(CoordinatorInput::MovesListed {
            purpose: ListPurpose::Timeout,
            entries: lonely,
        });
        assert!(merges(&effects).iter().any(|update| {
            update.ops().get("round_winner") == Some(&FieldOp::Set("tie".into()))
        }));
        assert_eq!(host.phase(), &DuelPhase::Duel);

        host.handle(record(with(
            started,
            &[
                ("round_winner", "tie".into()),
                ("phase", "ROUND_OVER".into()),
            ],
        )));
        let view = host.view();
        assert_eq!(view.phase, DuelPhase::RoundOver);
        assert_eq!(view.last_result, Some(RoundResult::Tie));
        assert_eq!((view.own_score, view.opponent_score), (0, 0));
    }

    #[test]
    fn duel_timeout_defers_to_a_result_already_written() {
        let (mut host, started) = host_in_duel();
        fire(&mut host, TimerKind::DuelTimeout);
        host.handle(CoordinatorInput::MovesListed {
            purpose: ListPurpose::Timeout,
            entries: Vec::new(),
        });

        host.handle(record(with(
            started,
            &[
                ("round_winner", "GUEST".into()),
                ("phase", "ROUND_OVER".into()),
            ],
        )));
        let view = host.view();
        assert_eq!(view.last_result, Some(RoundResult::Lose));
        assert_eq!((view.own_score, view.opponent_score), (0, 100));
    }

    #[test]
    fn connect_timeout_rejects_when_the_opponent_never_arrived() {
        let mut host = coordinator(Role::Host);
        host.handle(record(base()));
        assert_eq!(host.phase(), &DuelPhase::Connected);

        let effects = fire(&mut host, TimerKind::ConnectTimeout);
        assert_eq!(
            host.phase(),
            &DuelPhase::Rejected(RejectionReason::DoubleTimeout)
        );
        assert!(merges(&effects).iter().any(|update| {
            update.ops().get("rejection_reason") == Some(&FieldOp::Set("double_timeout".into()))
                && update.ops().get("gameStatus") == Some(&FieldOp::Set("closed".into()))
        }));
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, Effect::Store(StoreOp::Leave)))
        );
    }

    #[test]
    fn connect_timeout_is_ignored_once_the_opponent_arrived() {
        let mut host = coordinator(Role::Host);
        host.handle(record(base()));
        host.handle(CoordinatorInput::EnterConfirmation);
        host.handle(record(with(base(), &[("inConfirmView_GUEST", true.into())])));

        let effects = fire(&mut host, TimerKind::ConnectTimeout);
        assert_eq!(host.phase(), &DuelPhase::Confirming);
        assert!(merges(&effects).is_empty());
    }

    #[test]
    fn resolution_writes_result_then_record_scores_it() {
        let (mut host, started) = host_in_duel();
        let effects = host.handle(CoordinatorInput::Tap(1));
        assert!(effects.iter().any(|effect| matches!(
            effect,
            Effect::Store(StoreOp::SubmitMove(Move::One))
        )));
        assert!(host.handle(CoordinatorInput::Tap(2)).is_empty());

        let both = vec![
            MoveEntry {
                player: PlayerId::new("HOST"),
                mv: Move::One,
                at: Timestamp::from_millis(NOW),
            },
            MoveEntry {
                player: PlayerId::new("GUEST"),
                mv: Move::Three,
                at: Timestamp::from_millis(NOW + 10),
            },
        ];
        let effects = host.handle(CoordinatorInput::MovesListed {
            purpose: ListPurpose::Resolve,
            entries: both,
        });
        let update = merges(&effects).into_iter().next().cloned().expect("result");
        assert_eq!(
            update.ops().get("round_winner"),
            Some(&FieldOp::Set("HOST".into()))
        );

        let resolved = with(
            started,
            &[("round_winner", "HOST".into()), ("phase", "ROUND_OVER".into())],
        );
        host.handle(record(resolved.clone()));
        let before = host.view();
        assert_eq!(before.own_score, 100);

        host.handle(record(resolved));
        assert_eq!(host.view(), before);
    }

    #[test]
    fn round_advance_batch_then_next_round() {
        let (mut host, started) = host_in_duel();
        let resolved = with(
            started.clone(),
            &[("round_winner", "GUEST".into()), ("phase", "ROUND_OVER".into())],
        );
        host.handle(record(resolved.clone()));
        assert_eq!(host.phase(), &DuelPhase::RoundOver);

        fire(&mut host, TimerKind::ResultDisplay);
        let displayed = with(
            resolved,
            &[
                ("winner_displayed_HOST", true.into()),
                ("winner_displayed_GUEST", true.into()),
            ],
        );
        let effects = host.handle(record(displayed.clone()));
        let batch = effects
            .iter()
            .find_map(|effect| match effect {
                Effect::Store(StoreOp::Commit(batch)) => Some(batch.clone()),
                _ => None,
            })
            .expect("advance batch");
        assert_eq!(batch.ops().len(), 3);
        assert!(host.handle(record(displayed)).is_empty());

        host.handle(record(with(
            base(),
            &[
                ("signal", "NEXT_ROUND".into()),
                ("round_number", FieldValue::Int(2)),
            ],
        )));
        let view = host.view();
        assert_eq!(view.phase, DuelPhase::Countdown);
        assert_eq!(view.round, 2);
        assert_eq!(view.opponent_score, 100);
    }

    #[test]
    fn opponent_forfeit_wins_after_grace() {
        let (mut host, started) = host_in_duel();
        host.handle(record(with(
            started,
            &[
                ("signal", "FORFEIT_BY_GUEST".into()),
                ("gameStatus", "forfeited".into()),
            ],
        )));
        assert_eq!(host.phase(), &DuelPhase::Duel);

        fire(&mut host, TimerKind::ForfeitGrace);
        assert_eq!(
            host.view().outcome,
            Some(MatchEnd {
                result: MatchResult::Win,
                reason: EndReason::Forfeit {
                    by: PlayerId::new("GUEST"),
                },
            })
        );
    }

    #[test]
    fn disconnect_signal_gives_surviving_peer_the_win() {
        let mut host = coordinator(Role::Host);
        host.handle(record(base()));
        host.handle(record(with(
            base(),
            &[("signal", "OPPONENT_DISCONNECTED".into())],
        )));
        assert_eq!(
            host.view().outcome.map(|end| end.result),
            Some(MatchResult::Win)
        );
    }

    #[test]
    fn deleted_record_closes_the_match() {
        let mut guest = coordinator(Role::Guest);
        guest.handle(record(base()));
        let effects = guest.handle(CoordinatorInput::Record(None));
        assert_eq!(guest.phase(), &DuelPhase::Closed);
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, Effect::Store(StoreOp::Leave)))
        );
    }

    #[test]
    fn stale_timers_are_dropped() {
        let mut guest = coordinator(Role::Guest);
        guest.handle(record(base()));
        guest.handle(CoordinatorInput::EnterConfirmation);
        let stale = Timer {
            kind: TimerKind::ConfirmTimeout,
            version: 0,
        };
        guest.handle(CoordinatorInput::Timer(stale));
        assert_eq!(guest.phase(), &DuelPhase::Confirming);
    }
}
