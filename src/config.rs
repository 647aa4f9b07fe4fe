//! Duel timings and limits, loaded from JSON with built-in defaults.

use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/duel.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "TAP_DUEL_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable timing configuration shared by every service of a peer.
pub struct DuelConfig {
    /// Period of `heartbeat_<self>` writes.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which the opponent is suspected gone.
    pub heartbeat_timeout: Duration,
    /// Delay before a suspicion is re-checked.
    pub disconnect_recheck: Duration,
    /// Age after which a waiting or connected record is considered abandoned.
    pub stale_after: Duration,
    /// Period of the cooperative garbage collection sweep.
    pub sweep_interval: Duration,
    /// Time allowed for both confirmations once the confirmation screen shows.
    pub confirm_timeout: Duration,
    /// Time allowed for the opponent to reach the confirmation screen.
    pub connect_timeout: Duration,
    /// Delay before writing `inConfirmView_<self>`.
    pub in_confirm_mark_delay: Duration,
    /// Delay before writing `confirmed_<self>`.
    pub confirm_mark_delay: Duration,
    /// Pause between both confirmations and the first countdown.
    pub joint_start_delay: Duration,
    /// Ready countdown length in seconds.
    pub ready_countdown: u8,
    /// Upper bound of the random penalty delay in seconds.
    pub penalty_max: u8,
    /// Length of one countdown or penalty tick.
    pub tick: Duration,
    /// Time allowed for both moves once the duel opens.
    pub duel_timeout: Duration,
    /// How long a round result is shown before `winner_displayed_<self>`.
    pub result_display: Duration,
    /// Delay between a forfeit and the final screen.
    pub forfeit_grace: Duration,
    /// Rounds per match.
    pub max_rounds: u32,
    /// Points awarded per round won.
    pub points_per_round: u32,
}

impl DuelConfig {
    /// Load the configuration from disk, falling back to the built-in defaults.
    pub fn load() -> Self {
        Self::load_from(&resolve_config_path())
    }

    /// Load the configuration from `path`, falling back to the built-in defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        max_rounds = config.max_rounds,
                        "loaded duel config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for DuelConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file; durations are in milliseconds.
struct RawConfig {
    heartbeat_interval_ms: u64,
    heartbeat_timeout_ms: u64,
    disconnect_recheck_ms: u64,
    stale_after_ms: u64,
    sweep_interval_ms: u64,
    confirm_timeout_ms: u64,
    connect_timeout_ms: u64,
    in_confirm_mark_delay_ms: u64,
    confirm_mark_delay_ms: u64,
    joint_start_delay_ms: u64,
    ready_countdown_secs: u8,
    penalty_max_secs: u8,
    tick_ms: u64,
    duel_timeout_ms: u64,
    result_display_ms: u64,
    forfeit_grace_ms: u64,
    max_rounds: u32,
    points_per_round: u32,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 3_000,
            heartbeat_timeout_ms: 10_000,
            disconnect_recheck_ms: 2_000,
            stale_after_ms: 600_000,
            sweep_interval_ms: 60_000,
            confirm_timeout_ms: 10_000,
            connect_timeout_ms: 20_000,
            in_confirm_mark_delay_ms: 500,
            confirm_mark_delay_ms: 1_000,
            joint_start_delay_ms: 3_000,
            ready_countdown_secs: 5,
            penalty_max_secs: 3,
            tick_ms: 1_000,
            duel_timeout_ms: 10_000,
            result_display_ms: 3_000,
            forfeit_grace_ms: 5_000,
            max_rounds: 7,
            points_per_round: 100,
        }
    }
}

impl From<RawConfig> for DuelConfig {
    fn from(value: RawConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(value.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(value.heartbeat_timeout_ms),
            disconnect_recheck: Duration::from_millis(value.disconnect_recheck_ms),
            stale_after: Duration::from_millis(value.stale_after_ms),
            sweep_interval: Duration::from_millis(value.sweep_interval_ms),
            confirm_timeout: Duration::from_millis(value.confirm_timeout_ms),
            connect_timeout: Duration::from_millis(value.connect_timeout_ms),
            in_confirm_mark_delay: Duration::from_millis(value.in_confirm_mark_delay_ms),
            confirm_mark_delay: Duration::from_millis(value.confirm_mark_delay_ms),
            joint_start_delay: Duration::from_millis(value.joint_start_delay_ms),
            ready_countdown: value.ready_countdown_secs,
            penalty_max: value.penalty_max_secs,
            tick: Duration::from_millis(value.tick_ms),
            duel_timeout: Duration::from_millis(value.duel_timeout_ms),
            result_display: Duration::from_millis(value.result_display_ms),
            forfeit_grace: Duration::from_millis(value.forfeit_grace_ms),
            max_rounds: value.max_rounds.max(1),
            points_per_round: value.points_per_round,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = DuelConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.stale_after, Duration::from_secs(600));
        assert_eq!(config.max_rounds, 7);
        assert_eq!(config.points_per_round, 100);
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "max_rounds": 3, "duel_timeout_ms": 2500 }}"#).expect("write");

        let config = DuelConfig::load_from(file.path());
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.duel_timeout, Duration::from_millis(2_500));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
    }

    #[test]
    fn broken_or_missing_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "not json").expect("write");
        assert_eq!(DuelConfig::load_from(file.path()), DuelConfig::default());

        let dir = tempfile::tempdir().expect("temp dir");
        assert_eq!(
            DuelConfig::load_from(&dir.path().join("absent.json")),
            DuelConfig::default()
        );
    }
}
