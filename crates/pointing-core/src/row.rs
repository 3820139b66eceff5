// Persisted row representation of a session and the story blob codec.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{Session, UserStory, DEFAULT_STORY_TITLE};
use crate::scale::VotingScale;

/// Id given to the story synthesized from a legacy plain-text blob.
pub const LEGACY_STORY_ID: &str = "legacy-story";

// ---------------------------------------------------------------------------
// Story blob
// ---------------------------------------------------------------------------

/// Wire shape of the `current_story` column for rows written by this crate.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoryState {
    user_stories: Vec<UserStory>,
    #[serde(default)]
    current_story_index: Option<usize>,
}

/// Decoded contents of the `current_story` column.
///
/// Early rows stored the story as a bare description string; those decode to
/// [`StoryBlob::Legacy`] instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoryBlob {
    Structured {
        user_stories: Vec<UserStory>,
        current_story_index: usize,
    },
    Legacy(String),
    Empty,
}

impl StoryBlob {
    /// Classify a raw column value.
    pub fn decode(raw: Option<&str>) -> Self {
        let raw = match raw {
            Some(r) if !r.is_empty() => r,
            _ => return StoryBlob::Empty,
        };

        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) if value.get("userStories").is_some() => {
                match serde_json::from_value::<StoryState>(value) {
                    Ok(state) => StoryBlob::Structured {
                        user_stories: state.user_stories,
                        current_story_index: state.current_story_index.unwrap_or(0),
                    },
                    Err(e) => {
                        warn!("Malformed story blob, treating as legacy text: {e}");
                        StoryBlob::Legacy(raw.to_string())
                    }
                }
            }
            _ => StoryBlob::Legacy(raw.to_string()),
        }
    }

    /// Serialize stories and the current index into a column value.
    pub fn encode(user_stories: &[UserStory], current_story_index: usize) -> Result<String> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct StoryStateRef<'a> {
            user_stories: &'a [UserStory],
            current_story_index: usize,
        }
        serde_json::to_string(&StoryStateRef {
            user_stories,
            current_story_index,
        })
        .context("failed to serialize story blob")
    }

    /// Resolve into a story list and an index that is in range.
    pub fn into_stories(self) -> (Vec<UserStory>, usize) {
        match self {
            StoryBlob::Structured {
                user_stories,
                current_story_index,
            } => {
                if user_stories.is_empty() {
                    return (user_stories, 0);
                }
                let last = user_stories.len() - 1;
                if current_story_index > last {
                    warn!(
                        "Stored story index {} out of range for {} stories, clamping",
                        current_story_index,
                        user_stories.len()
                    );
                }
                let index = current_story_index.min(last);
                (user_stories, index)
            }
            StoryBlob::Legacy(description) => {
                let story = UserStory::new(LEGACY_STORY_ID, DEFAULT_STORY_TITLE, description);
                (vec![story], 0)
            }
            StoryBlob::Empty => (Vec::new(), 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Session row
// ---------------------------------------------------------------------------

/// A session as stored: nested values are JSON text columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub id: String,
    pub room_code: String,
    pub moderator_id: String,
    pub participants: String,
    pub current_story: Option<String>,
    pub voting_scale: String,
    pub votes_visible: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRow {
    /// Flatten a session into its row. The room code is stored uppercase.
    pub fn from_session(session: &Session, updated_at: DateTime<Utc>) -> Result<Self> {
        let participants = serde_json::to_string(&session.participants)
            .context("failed to serialize participants")?;
        let current_story =
            StoryBlob::encode(&session.user_stories, session.current_story_index)?;
        let voting_scale = serde_json::to_string(&session.voting_scale)
            .context("failed to serialize voting scale")?;

        Ok(SessionRow {
            id: session.id.clone(),
            room_code: session.room_code.to_ascii_uppercase(),
            moderator_id: session.moderator_id.clone(),
            participants,
            current_story: Some(current_story),
            voting_scale,
            votes_visible: session.votes_visible,
            is_active: session.is_active,
            created_at: session.created_at,
            updated_at,
        })
    }

    /// Rebuild the session aggregate from a stored row.
    pub fn into_session(self) -> Result<Session> {
        let participants = if self.participants.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&self.participants)
                .with_context(|| format!("failed to parse participants of session {}", self.id))?
        };
        let voting_scale: VotingScale = serde_json::from_str(&self.voting_scale)
            .with_context(|| format!("failed to parse voting scale of session {}", self.id))?;
        let (user_stories, current_story_index) =
            StoryBlob::decode(self.current_story.as_deref()).into_stories();

        Ok(Session {
            id: self.id,
            room_code: self.room_code,
            moderator_id: self.moderator_id,
            participants,
            user_stories,
            current_story_index,
            voting_scale,
            votes_visible: self.votes_visible,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}
