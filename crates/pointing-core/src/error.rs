// Domain error types surfaced to the driver.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PokerError {
    /// No active session matches the room code or id.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Another participant already uses this name (ignoring case).
    #[error("a participant named `{name}` already exists in this session")]
    DuplicateName { name: String },

    /// A display name was blank after trimming.
    #[error("display name must not be empty")]
    EmptyName,

    /// The backing store rejected a read or write.
    #[error("session store failure: {0:#}")]
    Persistence(anyhow::Error),

    /// The local anchor points at a session or participant the store no
    /// longer recognizes.
    #[error("local session anchor is stale")]
    StaleLocalIdentity,

    #[error("local anchor storage failed: {0}")]
    Anchor(#[from] std::io::Error),

    #[error("local session snapshot is unreadable: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl PokerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PokerError::NotFound { what: what.into() }
    }

    /// Errors the user can fix by changing their input and retrying.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            PokerError::NotFound { .. }
                | PokerError::DuplicateName { .. }
                | PokerError::EmptyName
        )
    }
}

impl From<anyhow::Error> for PokerError {
    fn from(err: anyhow::Error) -> Self {
        PokerError::Persistence(err)
    }
}

pub type Result<T, E = PokerError> = std::result::Result<T, E>;
