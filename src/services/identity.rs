//! Stable per-installation player identity.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::IdentityError, session::PlayerId};

/// Display name used when none was chosen.
pub const DEFAULT_DISPLAY_NAME: &str = "Player";

const IDENTITY_DIR: &str = "tap-duel";
const IDENTITY_FILE: &str = "identity.json";

/// Who this installation plays as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Identifier written into `player1`/`player2` and every per-player key.
    pub player: PlayerId,
    /// Name shown to the opponent.
    #[serde(default)]
    pub display_name: String,
}

impl Identity {
    /// In-memory identity, never persisted.
    pub fn ephemeral(display_name: Option<&str>) -> Self {
        Self {
            player: PlayerId::random(),
            display_name: display_or_default(display_name),
        }
    }

    /// Default identity file under the user data directory.
    pub fn default_path() -> Result<PathBuf, IdentityError> {
        dirs::data_dir()
            .map(|dir| dir.join(IDENTITY_DIR).join(IDENTITY_FILE))
            .ok_or(IdentityError::NoDataDir)
    }

    /// Read the identity stored at `path`, creating it on first use.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let mut identity: Identity =
                    serde_json::from_str(&contents).map_err(|source| IdentityError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                identity.display_name = display_or_default(Some(&identity.display_name));
                Ok(identity)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let identity = Self::ephemeral(None);
                identity.save(path)?;
                info!(path = %path.display(), player = %identity.player, "created player identity");
                Ok(identity)
            }
            Err(source) => Err(IdentityError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Same identity under another display name; blank names fall back to the default.
    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = display_or_default(Some(display_name));
        self
    }

    /// Persist to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let io_error = |source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(|source| IdentityError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, contents).map_err(io_error)
    }
}

fn display_or_default(name: Option<&str>) -> String {
    name.map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_DISPLAY_NAME)
        .to_owned()
}
