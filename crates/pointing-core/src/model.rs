// Session aggregate: participants, user stories, and vote state.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::scale::VotingScale;

/// Title given to stories created without one.
pub const DEFAULT_STORY_TITLE: &str = "User Story";

/// Description of the story attached to every freshly created session.
pub const PLACEHOLDER_STORY_DESCRIPTION: &str =
    "As a user, I want to estimate story points so that I can plan my sprint effectively.";

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// What a participant is allowed to do in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Controls reveal, reset, stories and membership. Does not vote.
    Moderator,
    /// Votes on stories.
    Participant,
    /// Watches without voting; excluded from vote counts.
    Observer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Moderator => "moderator",
            Role::Participant => "participant",
            Role::Observer => "observer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Opaque token generated by the joining client.
    pub id: String,
    /// Display name. Unique within a session, ignoring case.
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub has_voted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Participant {
            id: id.into(),
            name: name.into(),
            role,
            has_voted: false,
            vote: None,
        }
    }

    /// Drop any standing vote.
    pub fn clear_vote(&mut self) {
        self.vote = None;
        self.has_voted = false;
    }

    /// Case-insensitive name comparison used for join collisions.
    pub fn has_name(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.trim().to_lowercase()
    }
}

// ---------------------------------------------------------------------------
// UserStory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<String>,
    #[serde(default)]
    pub is_completed: bool,
}

impl UserStory {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        UserStory {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria: None,
            estimate: None,
            is_completed: false,
        }
    }

    /// The story every new session starts with.
    pub fn placeholder(id: impl Into<String>) -> Self {
        UserStory::new(id, DEFAULT_STORY_TITLE, PLACEHOLDER_STORY_DESCRIPTION)
    }
}

/// Field-wise update for a story. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoryPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub acceptance_criteria: Option<Option<String>>,
    pub estimate: Option<Option<String>>,
    pub is_completed: Option<bool>,
}

impl StoryPatch {
    pub fn apply(&self, story: &mut UserStory) {
        if let Some(title) = &self.title {
            story.title = title.clone();
        }
        if let Some(description) = &self.description {
            story.description = description.clone();
        }
        if let Some(criteria) = &self.acceptance_criteria {
            story.acceptance_criteria = criteria.clone();
        }
        if let Some(estimate) = &self.estimate {
            story.estimate = estimate.clone();
        }
        if let Some(done) = self.is_completed {
            story.is_completed = done;
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The shared state of one planning poker room.
///
/// Every client holds a full copy. Changes are made by producing a whole new
/// value and saving it; the store's change feed then hands the saved value to
/// every subscribed client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub room_code: String,
    pub moderator_id: String,
    pub participants: Vec<Participant>,
    pub user_stories: Vec<UserStory>,
    pub current_story_index: usize,
    pub voting_scale: VotingScale,
    pub votes_visible: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Build a fresh, active session owned by `moderator`.
    ///
    /// The moderator's role is forced to [`Role::Moderator`] and a single
    /// placeholder story is attached.
    pub fn create(
        id: impl Into<String>,
        room_code: impl Into<String>,
        mut moderator: Participant,
        voting_scale: VotingScale,
        first_story: UserStory,
    ) -> Self {
        moderator.role = Role::Moderator;
        moderator.clear_vote();
        Session {
            id: id.into(),
            room_code: room_code.into(),
            moderator_id: moderator.id.clone(),
            participants: vec![moderator],
            user_stories: vec![first_story],
            current_story_index: 0,
            voting_scale,
            votes_visible: false,
            is_active: true,
            // Stored rows keep millisecond precision.
            created_at: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    /// Returns `true` if `id` is this session's moderator.
    pub fn is_moderator(&self, id: &str) -> bool {
        self.moderator_id == id
            && self
                .participant(id)
                .is_some_and(|p| p.role == Role::Moderator)
    }

    /// Find a participant other than `except_id` whose name matches `name`
    /// ignoring case.
    pub fn name_taken_by_other(&self, name: &str, except_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.has_name(name) && p.id != except_id)
    }

    pub fn current_story(&self) -> Option<&UserStory> {
        self.user_stories.get(self.current_story_index)
    }

    pub fn has_next_story(&self) -> bool {
        self.current_story_index + 1 < self.user_stories.len()
    }

    /// Clear every participant's vote and hide the votes.
    pub fn clear_votes(&mut self) {
        for p in &mut self.participants {
            p.clear_vote();
        }
        self.votes_visible = false;
    }

    /// Returns `true` when exactly one participant is a moderator and it is
    /// the one named by `moderator_id`.
    pub fn moderator_is_consistent(&self) -> bool {
        let mut moderators = self
            .participants
            .iter()
            .filter(|p| p.role == Role::Moderator);
        matches!(
            (moderators.next(), moderators.next()),
            (Some(m), None) if m.id == self.moderator_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session::create(
            "s1",
            "ABC123",
            Participant::new("alice", "Alice", Role::Participant),
            VotingScale::default(),
            UserStory::placeholder("story-1"),
        )
    }

    #[test]
    fn create_sets_moderator_and_placeholder_story() {
        let session = sample();
        assert_eq!(session.participants.len(), 1);
        assert_eq!(session.participants[0].role, Role::Moderator);
        assert_eq!(session.moderator_id, "alice");
        assert_eq!(session.user_stories.len(), 1);
        assert_eq!(session.current_story_index, 0);
        assert_eq!(
            session.current_story().unwrap().description,
            PLACEHOLDER_STORY_DESCRIPTION
        );
        assert!(!session.votes_visible);
        assert!(session.is_active);
        assert!(session.moderator_is_consistent());
    }

    #[test]
    fn name_lookup_ignores_case_and_self() {
        let mut session = sample();
        session
            .participants
            .push(Participant::new("bob", "Bob", Role::Participant));
        assert_eq!(session.name_taken_by_other("BOB", "x").unwrap().id, "bob");
        assert!(session.name_taken_by_other("bob", "bob").is_none());
        assert!(session.name_taken_by_other("Carol", "x").is_none());
    }

    #[test]
    fn moderator_consistency_detects_second_moderator() {
        let mut session = sample();
        session
            .participants
            .push(Participant::new("eve", "Eve", Role::Moderator));
        assert!(!session.moderator_is_consistent());
    }

    #[test]
    fn story_patch_only_touches_given_fields() {
        let mut story = UserStory::new("s", "Login", "As a user I log in");
        StoryPatch {
            estimate: Some(Some("5".into())),
            ..StoryPatch::default()
        }
        .apply(&mut story);
        assert_eq!(story.title, "Login");
        assert_eq!(story.estimate.as_deref(), Some("5"));
        assert!(!story.is_completed);
    }

    #[test]
    fn participant_serializes_camel_case_and_lowercase_role() {
        let mut p = Participant::new("p1", "Bob", Role::Observer);
        p.has_voted = true;
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["role"], "observer");
        assert_eq!(json["hasVoted"], true);
        assert!(json.get("vote").is_none());
    }
}
