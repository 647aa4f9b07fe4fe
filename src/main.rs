//! tap-duel binary: matchmaking and a terminal duel against another peer.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tap_duel::{
    clock::{SharedClock, SystemClock},
    config::DuelConfig,
    dao::session_store::{SharedStore, memory::MemoryStore},
    services::{
        coordinator::{CoordinatorHandle, MatchView},
        identity::Identity,
        matchmaking::Matchmaker,
    },
    state::{DuelPhase, EndReason, MatchResult},
};

#[derive(Debug, Parser)]
#[command(name = "tap-duel", about = "Two-player simultaneous-move duel")]
struct Cli {
    /// Display name shown to the opponent.
    #[arg(long)]
    name: Option<String>,
    /// Identity file; defaults to the per-user data directory.
    #[arg(long)]
    identity: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Host a private session and print its code.
    Create,
    /// Join a private session by code.
    Join {
        /// Six-character session code.
        code: String,
    },
    /// Join the oldest open public session, or host one.
    Auto,
    /// Delete stale public sessions once and exit.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Arc::new(DuelConfig::load());
    let clock: SharedClock = Arc::new(SystemClock);
    let store = open_store(clock.clone()).await;
    let identity = load_identity(&cli)?;
    info!(player = %identity.player, name = %identity.display_name, "identity ready");

    let matchmaker = Matchmaker::new(store.clone(), identity, clock.clone(), config.clone());

    let ticket = match cli.command {
        Command::Sweep => {
            let removed = matchmaker
                .cleanup_stale_sessions()
                .await
                .context("sweeping stale sessions")?;
            println!("removed {removed} stale session(s)");
            return Ok(());
        }
        Command::Create => {
            cleanup_own(&matchmaker).await;
            let ticket = matchmaker.create_private_session().await;
            println!("session code: {}", ticket.session);
            ticket
        }
        Command::Join { code } => matchmaker
            .join_private_session(&code)
            .await
            .with_context(|| format!("joining session `{code}`"))?,
        Command::Auto => {
            cleanup_own(&matchmaker).await;
            matchmaker.auto_match().await.context("auto matching")?
        }
    };

    let sweeper = matchmaker.spawn_sweeper();
    let handle = CoordinatorHandle::spawn(
        store,
        &ticket,
        matchmaker.identity(),
        config,
        clock,
    );
    println!("playing as {:?}; type 1-3 to move, f to forfeit, q to quit", ticket.role);

    play(&handle).await;

    sweeper.abort();
    match matchmaker.quit().await {
        Ok(true) => info!(session = %ticket.session, "unjoined session deleted"),
        Ok(false) => {}
        Err(err) => warn!(session = %ticket.session, error = %err, "failed to close session"),
    }
    Ok(())
}

/// Pick the MongoDB backend when `MONGO_URI` is set, the in-process store otherwise.
async fn open_store(clock: SharedClock) -> Arc<dyn SharedStore> {
    if let Some(store) = open_mongo().await {
        return store;
    }
    info!("using in-memory session store; both players must share this process");
    Arc::new(MemoryStore::with_clock(clock))
}

#[cfg(feature = "mongo-store")]
async fn open_mongo() -> Option<Arc<dyn SharedStore>> {
    use tap_duel::dao::session_store::mongodb::{MongoConfig, MongoSessionStore};

    std::env::var_os("MONGO_URI")?;
    let connected = match MongoConfig::from_env().await {
        Ok(config) => MongoSessionStore::connect(config).await,
        Err(err) => Err(err),
    };
    match connected {
        Ok(store) => {
            info!("using MongoDB session store");
            Some(Arc::new(store))
        }
        Err(err) => {
            warn!(error = %err, "MongoDB unavailable; falling back to the in-memory store");
            None
        }
    }
}

#[cfg(not(feature = "mongo-store"))]
async fn open_mongo() -> Option<Arc<dyn SharedStore>> {
    None
}

fn load_identity(cli: &Cli) -> anyhow::Result<Identity> {
    let path = match &cli.identity {
        Some(path) => path.clone(),
        None => Identity::default_path().context("locating identity file")?,
    };
    let identity = Identity::load_or_create(&path)
        .with_context(|| format!("loading identity from `{}`", path.display()))?;
    Ok(match &cli.name {
        Some(name) => identity.with_display_name(name),
        None => identity,
    })
}

async fn cleanup_own(matchmaker: &Matchmaker) {
    if let Err(err) = matchmaker.cleanup_own_sessions().await {
        warn!(error = %err, "failed to clean up own sessions");
    }
}

/// Drive the duel from stdin until the match ends.
async fn play(handle: &CoordinatorHandle) {
    let mut view = handle.view();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut confirmation_shown = false;

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                render(&current);
                if current.phase == DuelPhase::Connected && !confirmation_shown {
                    confirmation_shown = true;
                    handle.enter_confirmation();
                }
                if current.phase.is_terminal() {
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "f" => handle.forfeit(),
                    "q" => {
                        handle.shutdown();
                        break;
                    }
                    other => match other.parse::<u8>() {
                        Ok(touches) => handle.submit_input(touches),
                        Err(_) => println!("type 1-3, f or q"),
                    },
                },
                Ok(None) | Err(_) => {
                    handle.shutdown();
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown();
                break;
            }
        }
    }
}

fn render(view: &MatchView) {
    let opponent = view.opponent_name.as_deref().unwrap_or("opponent");
    match &view.phase {
        DuelPhase::Waiting => println!("waiting for an opponent in {}", view.session),
        DuelPhase::Connected => println!("{opponent} joined"),
        DuelPhase::Confirming => println!("confirming match..."),
        DuelPhase::BothConfirmed => println!("both confirmed; get ready"),
        DuelPhase::Countdown => {
            if let Some(left) = view.countdown {
                println!("round {}/{} starts in {left}", view.round, view.max_rounds);
            }
        }
        DuelPhase::PenaltyDelay => println!("wait for it... (tapping now loses the round)"),
        DuelPhase::Duel => println!("GO! type 1, 2 or 3"),
        DuelPhase::RoundOver => println!(
            "round {}: {:?}  score {} - {}",
            view.round,
            view.last_result,
            view.own_score,
            view.opponent_score
        ),
        DuelPhase::Rejected(reason) => println!("match voided ({})", reason.as_str()),
        DuelPhase::MatchOver(end) => {
            let result = match end.result {
                MatchResult::Win => "you win",
                MatchResult::Lose => "you lose",
                MatchResult::Tie => "tie",
            };
            let reason = match &end.reason {
                EndReason::Completed => "all rounds played".to_owned(),
                EndReason::Forfeit { by } => format!("forfeit by {by}"),
                EndReason::Disconnect => "disconnect".to_owned(),
            };
            println!(
                "{result} ({reason}); final score {} - {}",
                view.own_score, view.opponent_score
            );
        }
        DuelPhase::Closed => println!("session closed"),
    }
    if let Some(notice) = &view.notice {
        info!(notice = %notice, "match notice");
    }
}

/// Configure tracing subscribers; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
