// Local anchor: which session this client is in and who it is.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PokerError, Result};
use crate::model::Session;

const SESSION_FILE: &str = "current-session.json";
const PARTICIPANT_FILE: &str = "current-user-id";

/// The session a client is attached to and the participant it acts as.
///
/// Passed explicitly to every reconciler operation instead of living in a
/// global.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalAnchor {
    pub session_id: String,
    pub participant_id: String,
}

impl LocalAnchor {
    pub fn new(session_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        LocalAnchor {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
        }
    }
}

/// File-backed storage for the two anchor values: the last known session
/// snapshot and the local participant id. Each can be set and cleared on its
/// own; only both together make a usable anchor.
#[derive(Debug, Clone)]
pub struct AnchorStore {
    dir: PathBuf,
}

impl AnchorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        AnchorStore { dir: dir.into() }
    }

    /// Anchor storage in the platform's per-user data directory, if one can be
    /// determined.
    pub fn in_user_data_dir() -> Option<Self> {
        ProjectDirs::from("dev", "pointing", "pointing-poker")
            .map(|dirs| AnchorStore::new(dirs.data_local_dir().join("anchor")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    fn participant_path(&self) -> PathBuf {
        self.dir.join(PARTICIPANT_FILE)
    }

    // ------------------------------------------------------------------
    // Session snapshot
    // ------------------------------------------------------------------

    pub fn set_session(&self, session: &Session) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string(session)?;
        fs::write(self.session_path(), json)?;
        Ok(())
    }

    /// The stored snapshot. An unreadable snapshot reads as absent.
    pub fn session(&self) -> Option<Session> {
        let raw = read_optional(&self.session_path()).ok()??;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!("Ignoring unreadable session snapshot: {e}");
                None
            }
        }
    }

    pub fn clear_session(&self) -> Result<()> {
        remove_optional(&self.session_path())
    }

    // ------------------------------------------------------------------
    // Participant id
    // ------------------------------------------------------------------

    pub fn set_participant_id(&self, participant_id: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.participant_path(), participant_id)?;
        Ok(())
    }

    pub fn participant_id(&self) -> Option<String> {
        read_optional(&self.participant_path())
            .ok()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn clear_participant_id(&self) -> Result<()> {
        remove_optional(&self.participant_path())
    }

    // ------------------------------------------------------------------
    // Both together
    // ------------------------------------------------------------------

    /// Record both values after creating or joining a session.
    pub fn attach(&self, session: &Session, participant_id: &str) -> Result<()> {
        self.set_session(session)?;
        self.set_participant_id(participant_id)?;
        info!(
            "Anchored to session {} as participant {}",
            session.id, participant_id
        );
        Ok(())
    }

    /// The anchor, when both the snapshot and the participant id are present.
    pub fn anchor(&self) -> Option<LocalAnchor> {
        let session = self.session()?;
        let participant_id = self.participant_id()?;
        Some(LocalAnchor::new(session.id, participant_id))
    }

    /// Returns `true` if either value is stored.
    pub fn has_any(&self) -> bool {
        self.session_path().exists() || self.participant_path().exists()
    }

    /// Remove both values.
    pub fn clear(&self) -> Result<()> {
        let session = self.clear_session();
        let participant = self.clear_participant_id();
        session.and(participant)?;
        debug!("Cleared local anchor in {}", self.dir.display());
        Ok(())
    }
}

fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PokerError::Anchor(e)),
    }
}
