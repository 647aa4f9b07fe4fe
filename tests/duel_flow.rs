//! Two peers playing against each other through one in-process store.

use std::{sync::Arc, time::Duration};

use tap_duel::{
    clock::{Clock, SharedClock, Timestamp, TokioClock},
    config::DuelConfig,
    dao::{
        models::Fields,
        session_store::{SharedStore, fields_from, memory::MemoryStore},
    },
    services::{
        coordinator::{CoordinatorHandle, MatchView},
        identity::Identity,
        matchmaking::{MatchTicket, Matchmaker, sweep_stale_sessions},
    },
    session::{Role, SessionId, SessionRecord},
    state::{DuelPhase, EndReason, MatchResult, RoundResult},
};

struct Peer {
    matchmaker: Matchmaker,
    ticket: MatchTicket,
    handle: CoordinatorHandle,
}

impl Peer {
    fn start(matchmaker: Matchmaker, ticket: MatchTicket) -> Self {
        let handle = CoordinatorHandle::spawn(
            matchmaker.store(),
            &ticket,
            matchmaker.identity(),
            matchmaker.config(),
            matchmaker.clock(),
        );
        Self {
            matchmaker,
            ticket,
            handle,
        }
    }

    async fn wait_for(&self, what: &str, predicate: impl FnMut(&MatchView) -> bool) -> MatchView {
        let mut view = self.handle.view();
        tokio::time::timeout(Duration::from_secs(600), view.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("coordinator stopped")
            .clone()
    }

    /// Play along with the presentation: confirm as soon as the opponent shows up.
    async fn confirm(&self) {
        self.wait_for("opponent", |view| view.phase == DuelPhase::Connected)
            .await;
        self.handle.enter_confirmation();
    }
}

fn setup() -> (MemoryStore, SharedClock) {
    let clock: SharedClock = Arc::new(TokioClock::starting_at(Timestamp::from_millis(
        1_700_000_000_000,
    )));
    (MemoryStore::with_clock(clock.clone()), clock)
}

fn matchmaker(store: &MemoryStore, clock: &SharedClock, name: &str) -> Matchmaker {
    Matchmaker::new(
        Arc::new(store.clone()),
        Identity::ephemeral(Some(name)),
        clock.clone(),
        Arc::new(DuelConfig::default()),
    )
}

async fn paired(store: &MemoryStore, clock: &SharedClock) -> (Peer, Peer) {
    let host = matchmaker(store, clock, "Ada");
    let ticket = host.create_session(SessionId::new("ABC123"), true).await;
    let host = Peer::start(host, ticket);

    let guest = matchmaker(store, clock, "Grace");
    let ticket = guest
        .join_private_session("abc123")
        .await
        .expect("join private session");
    assert_eq!(ticket.role, Role::Guest);
    let guest = Peer::start(guest, ticket);

    tokio::join!(host.confirm(), guest.confirm());
    (host, guest)
}

async fn stored(store: &MemoryStore, id: &str) -> Option<SessionRecord> {
    store
        .get(id)
        .await
        .expect("get")
        .map(|document| SessionRecord::from_document(&document))
}

#[tokio::test(start_paused = true)]
async fn first_round_is_resolved_identically_on_both_peers() {
    let (store, clock) = setup();
    let (host, guest) = paired(&store, &clock).await;

    host.wait_for("host duel", |view| view.phase == DuelPhase::Duel)
        .await;
    guest
        .wait_for("guest duel", |view| view.phase == DuelPhase::Duel)
        .await;

    host.handle.submit_input(1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    guest.handle.submit_input(3);

    let host_view = host
        .wait_for("host result", |view| view.results.len() == 1)
        .await;
    let guest_view = guest
        .wait_for("guest result", |view| view.results.len() == 1)
        .await;

    assert_eq!(host_view.last_result, Some(RoundResult::Win));
    assert_eq!((host_view.own_score, host_view.opponent_score), (100, 0));
    assert_eq!(guest_view.last_result, Some(RoundResult::Lose));
    assert_eq!((guest_view.own_score, guest_view.opponent_score), (0, 100));

    let record = stored(&store, host.ticket.session.as_str())
        .await
        .expect("record");
    assert_eq!(record.round_number, 2);
    assert_eq!(record.penalty_countdown.map(|p| p <= 3), Some(true));
}

#[tokio::test(start_paused = true)]
async fn both_peers_move_on_to_the_next_round() {
    let (store, clock) = setup();
    let (host, guest) = paired(&store, &clock).await;

    host.wait_for("host duel", |view| view.phase == DuelPhase::Duel)
        .await;
    guest
        .wait_for("guest duel", |view| view.phase == DuelPhase::Duel)
        .await;
    guest.handle.submit_input(2);
    host.handle.submit_input(3);

    for peer in [&host, &guest] {
        let view = peer
            .wait_for("second round countdown", |view| {
                view.round == 2 && view.phase == DuelPhase::Countdown
            })
            .await;
        assert_eq!(view.results.len(), 1);
    }

    let record = stored(&store, host.ticket.session.as_str())
        .await
        .expect("record");
    assert!(record.round_winner.is_none());
}

#[tokio::test(start_paused = true)]
async fn full_match_ends_with_victory_for_the_higher_score() {
    let (store, clock) = setup();
    let (host, guest) = paired(&store, &clock).await;
    let max_rounds = DuelConfig::default().max_rounds;

    for round in 1..=max_rounds {
        for peer in [&host, &guest] {
            peer.wait_for("duel window", |view| {
                view.round == round && view.phase == DuelPhase::Duel
            })
            .await;
        }
        host.handle.submit_input(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        guest.handle.submit_input(3);
    }

    for (peer, expected, scores) in [
        (&host, MatchResult::Win, (700, 0)),
        (&guest, MatchResult::Lose, (0, 700)),
    ] {
        let view = peer
            .wait_for("match outcome", |view| view.outcome.is_some())
            .await;
        let outcome = view.outcome.expect("outcome");
        assert_eq!(outcome.result, expected);
        assert_eq!(outcome.reason, EndReason::Completed);
        assert_eq!((view.own_score, view.opponent_score), scores);
        assert_eq!(view.results.len(), max_rounds as usize);
    }

    let record = stored(&store, host.ticket.session.as_str())
        .await
        .expect("record");
    assert_eq!(record.round_number, max_rounds);
}

#[tokio::test(start_paused = true)]
async fn silent_duel_ends_in_a_tie() {
    let (store, clock) = setup();
    let (host, guest) = paired(&store, &clock).await;

    guest
        .wait_for("guest duel", |view| view.phase == DuelPhase::Duel)
        .await;
    guest.handle.submit_input(2);

    for peer in [&host, &guest] {
        let view = peer
            .wait_for("tied round", |view| view.results.len() == 1)
            .await;
        assert_eq!(view.last_result, Some(RoundResult::Tie));
        assert_eq!((view.own_score, view.opponent_score), (0, 0));
    }
}

#[tokio::test(start_paused = true)]
async fn crashed_host_hands_the_win_to_the_guest() {
    let (store, clock) = setup();
    let (host, guest) = paired(&store, &clock).await;

    host.wait_for("host countdown", |view| view.phase == DuelPhase::Countdown)
        .await;
    host.handle.shutdown();
    host.matchmaker.leave();

    let view = guest
        .wait_for("guest outcome", |view| view.outcome.is_some())
        .await;
    let outcome = view.outcome.expect("outcome");
    assert_eq!(outcome.result, MatchResult::Win);
    assert_eq!(outcome.reason, EndReason::Disconnect);
}

#[tokio::test(start_paused = true)]
async fn forfeit_ends_the_match_for_both_peers() {
    let (store, clock) = setup();
    let (host, guest) = paired(&store, &clock).await;

    guest
        .wait_for("guest countdown", |view| view.phase == DuelPhase::Countdown)
        .await;
    guest.handle.forfeit();

    let guest_id = guest.matchmaker.identity().player.clone();
    for (peer, expected) in [(&host, MatchResult::Win), (&guest, MatchResult::Lose)] {
        let view = peer
            .wait_for("forfeit outcome", |view| view.outcome.is_some())
            .await;
        let outcome = view.outcome.expect("outcome");
        assert_eq!(outcome.result, expected);
        assert_eq!(
            outcome.reason,
            EndReason::Forfeit {
                by: guest_id.clone()
            }
        );
    }
}

#[tokio::test(start_paused = true)]
async fn sweep_removes_only_stale_public_lobbies() {
    let (store, clock) = setup();
    let now = clock.now();
    let lobby = |state: &str, private: bool, age: Duration| -> Fields {
        let mut fields = fields_from([
            ("state", state),
            ("gameStatus", "active"),
            ("player1", "SOMEONE"),
        ]);
        fields.insert("private".into(), private.into());
        fields.insert("createdAt".into(), now.saturating_sub(age).into());
        fields
    };
    let old = Duration::from_secs(11 * 60);
    store.seed("OLDPUB", lobby("waiting", false, old));
    store.seed("OLDCON", lobby("connected", false, old));
    store.seed("OLDPRV", lobby("waiting", true, old));
    store.seed("FRESH1", lobby("waiting", false, Duration::from_secs(60)));

    let removed = sweep_stale_sessions(&store, now, DuelConfig::default().stale_after)
        .await
        .expect("sweep");

    assert_eq!(removed, 2);
    assert!(stored(&store, "OLDPUB").await.is_none());
    assert!(stored(&store, "OLDCON").await.is_none());
    assert!(stored(&store, "OLDPRV").await.is_some());
    assert!(stored(&store, "FRESH1").await.is_some());
}
