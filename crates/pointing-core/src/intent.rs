// User intents as pure session transitions.
//
// Every function takes the current session and returns the complete next
// session. Intents the actor is not allowed to perform return an unchanged
// copy; the driver is expected not to offer them in the first place.

use tracing::debug;

use crate::error::{PokerError, Result};
use crate::model::{Participant, Role, Session, StoryPatch, UserStory};
use crate::scale::VotingScale;
use crate::tally;

/// Something a participant asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    CastVote { value: String },
    ToggleVotesVisible,
    ResetVotes,
    ChangeVotingScale { scale: VotingScale },
    NextStory,
    UpdateStory { story_id: String, patch: StoryPatch },
    AddStory { story: UserStory },
    CompleteCurrentStory,
    ToggleObserver { participant_id: String },
    RemoveParticipant { participant_id: String },
}

impl Intent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Intent::CastVote { .. } => "cast_vote",
            Intent::ToggleVotesVisible => "toggle_votes_visible",
            Intent::ResetVotes => "reset_votes",
            Intent::ChangeVotingScale { .. } => "change_voting_scale",
            Intent::NextStory => "next_story",
            Intent::UpdateStory { .. } => "update_story",
            Intent::AddStory { .. } => "add_story",
            Intent::CompleteCurrentStory => "complete_current_story",
            Intent::ToggleObserver { .. } => "toggle_observer",
            Intent::RemoveParticipant { .. } => "remove_participant",
        }
    }
}

/// Apply `intent` on behalf of `actor_id`.
pub fn apply(session: &Session, actor_id: &str, intent: &Intent) -> Session {
    match intent {
        Intent::CastVote { value } => cast_vote(session, actor_id, value),
        Intent::ToggleVotesVisible => toggle_votes_visible(session, actor_id),
        Intent::ResetVotes => reset_votes(session, actor_id),
        Intent::ChangeVotingScale { scale } => change_voting_scale(session, actor_id, scale),
        Intent::NextStory => next_story(session, actor_id),
        Intent::UpdateStory { story_id, patch } => {
            update_story(session, actor_id, story_id, patch)
        }
        Intent::AddStory { story } => add_story(session, actor_id, story.clone()),
        Intent::CompleteCurrentStory => complete_current_story(session, actor_id),
        Intent::ToggleObserver { participant_id } => {
            toggle_observer(session, actor_id, participant_id)
        }
        Intent::RemoveParticipant { participant_id } => {
            remove_participant(session, actor_id, participant_id)
        }
    }
}

fn moderator_only(session: &Session, actor_id: &str, what: &str) -> bool {
    let allowed = session.is_moderator(actor_id);
    if !allowed {
        debug!("Ignoring {what} from non-moderator {actor_id}");
    }
    allowed
}

// ---------------------------------------------------------------------------
// Voting
// ---------------------------------------------------------------------------

/// Record `value` as the actor's vote.
///
/// Ignored once votes are revealed, for anyone whose role is not
/// [`Role::Participant`], and for values not on the session's scale.
pub fn cast_vote(session: &Session, actor_id: &str, value: &str) -> Session {
    let mut next = session.clone();
    if session.votes_visible {
        debug!("Ignoring vote from {actor_id}: votes already revealed");
        return next;
    }
    if !session.voting_scale.contains(value) {
        debug!("Ignoring vote `{value}` from {actor_id}: not on the current scale");
        return next;
    }
    match next.participant_mut(actor_id) {
        Some(p) if p.role == Role::Participant => {
            p.vote = Some(value.to_string());
            p.has_voted = true;
        }
        Some(p) => debug!("Ignoring vote from {} with role {}", actor_id, p.role),
        None => debug!("Ignoring vote from unknown participant {actor_id}"),
    }
    next
}

/// Reveal or hide the votes.
pub fn toggle_votes_visible(session: &Session, actor_id: &str) -> Session {
    let mut next = session.clone();
    if moderator_only(session, actor_id, "reveal toggle") {
        next.votes_visible = !session.votes_visible;
    }
    next
}

/// Clear every vote and hide the results.
pub fn reset_votes(session: &Session, actor_id: &str) -> Session {
    let mut next = session.clone();
    if moderator_only(session, actor_id, "vote reset") {
        next.clear_votes();
    }
    next
}

/// Swap the voting scale. Existing votes may not exist on the new scale, so
/// they are reset as well.
pub fn change_voting_scale(session: &Session, actor_id: &str, scale: &VotingScale) -> Session {
    if !moderator_only(session, actor_id, "scale change") {
        return session.clone();
    }
    let mut next = session.clone();
    next.voting_scale = scale.clone();
    reset_votes(&next, actor_id)
}

// ---------------------------------------------------------------------------
// Stories
// ---------------------------------------------------------------------------

/// Move to the next story with a clean slate of votes. No-op on the last
/// story.
pub fn next_story(session: &Session, actor_id: &str) -> Session {
    let mut next = session.clone();
    if !moderator_only(session, actor_id, "next story") {
        return next;
    }
    if !session.has_next_story() {
        debug!("Already on the last story, not advancing");
        return next;
    }
    next.current_story_index += 1;
    next.clear_votes();
    next
}

/// Patch the story with `story_id`.
pub fn update_story(
    session: &Session,
    actor_id: &str,
    story_id: &str,
    patch: &StoryPatch,
) -> Session {
    let mut next = session.clone();
    if !moderator_only(session, actor_id, "story update") {
        return next;
    }
    match next.user_stories.iter_mut().find(|s| s.id == story_id) {
        Some(story) => patch.apply(story),
        None => debug!("No story {story_id} to update"),
    }
    next
}

/// Mark the story with `story_id` completed.
pub fn mark_story_completed(session: &Session, actor_id: &str, story_id: &str) -> Session {
    let patch = StoryPatch {
        is_completed: Some(true),
        ..StoryPatch::default()
    };
    update_story(session, actor_id, story_id, &patch)
}

/// Append a story to the backlog.
pub fn add_story(session: &Session, actor_id: &str, story: UserStory) -> Session {
    let mut next = session.clone();
    if !moderator_only(session, actor_id, "story add") {
        return next;
    }
    if next.user_stories.iter().any(|s| s.id == story.id) {
        debug!("Story {} already exists, not adding", story.id);
        return next;
    }
    next.user_stories.push(story);
    next
}

/// Close out the current story once votes are revealed: mark it completed,
/// record the consensus value as its estimate when there is one, and move to
/// the next story.
pub fn complete_current_story(session: &Session, actor_id: &str) -> Session {
    if !moderator_only(session, actor_id, "story completion") {
        return session.clone();
    }
    if !session.votes_visible {
        debug!("Votes are hidden, not completing the current story");
        return session.clone();
    }
    let Some(story) = session.current_story() else {
        return session.clone();
    };

    let estimate = tally::consensus(session)
        .filter(|c| c.is_majority || c.is_plurality)
        .map(|c| c.value);
    let patch = StoryPatch {
        is_completed: Some(true),
        estimate: estimate.map(Some),
        ..StoryPatch::default()
    };
    let completed = update_story(session, actor_id, &story.id, &patch);
    next_story(&completed, actor_id)
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Flip a non-moderator between participant and observer. Their vote no
/// longer applies either way, so it is cleared.
pub fn toggle_observer(session: &Session, actor_id: &str, participant_id: &str) -> Session {
    let mut next = session.clone();
    if !moderator_only(session, actor_id, "role toggle") {
        return next;
    }
    match next.participant_mut(participant_id) {
        Some(p) if p.role != Role::Moderator => {
            p.role = match p.role {
                Role::Observer => Role::Participant,
                _ => Role::Observer,
            };
            p.clear_vote();
        }
        Some(_) => debug!("Moderator role cannot be toggled"),
        None => debug!("No participant {participant_id} to toggle"),
    }
    next
}

/// Remove a participant. The moderator cannot be removed this way; the
/// moderator leaving ends the session instead.
pub fn remove_participant(session: &Session, actor_id: &str, participant_id: &str) -> Session {
    if !moderator_only(session, actor_id, "participant removal") {
        return session.clone();
    }
    if participant_id == session.moderator_id {
        debug!("Refusing to remove the moderator from their own session");
        return session.clone();
    }
    without_participant(session, participant_id)
}

/// The session minus `participant_id`, with no permission check. Used when a
/// participant leaves on their own.
pub fn without_participant(session: &Session, participant_id: &str) -> Session {
    let mut next = session.clone();
    next.participants.retain(|p| p.id != participant_id);
    next
}

/// Insert a joining participant, or update them in place when their id is
/// already present (a reconnect).
///
/// Fails with [`PokerError::DuplicateName`] when a different participant
/// already uses the name, ignoring case. A reconnect keeps the existing role
/// and vote and only refreshes the name.
pub fn upsert_participant(session: &Session, participant: Participant) -> Result<Session> {
    if let Some(other) = session.name_taken_by_other(&participant.name, &participant.id) {
        return Err(PokerError::DuplicateName {
            name: other.name.clone(),
        });
    }
    let mut next = session.clone();
    match next.participant_mut(&participant.id) {
        Some(existing) => existing.name = participant.name,
        None => {
            let mut joining = participant;
            // Only the creation flow makes moderators.
            if joining.role == Role::Moderator {
                joining.role = Role::Participant;
            }
            next.participants.push(joining);
        }
    }
    Ok(next)
}

/// The session, logically ended.
pub fn end_session(session: &Session) -> Session {
    let mut next = session.clone();
    next.is_active = false;
    next
}
