// Session reconciler: turns intents into saved sessions and folds remote
// changes into the local view.
//
// Flow for a local intent:
// 1. Compute the next session with `intent::apply`
// 2. Swap it into the local view (optimistic)
// 3. Save it; on failure restore the previous view and report the error
// 4. The store's change feed echoes the saved session to every subscriber,
//    this client included, and each one runs `apply_remote`
//
// Conflicting writes from different clients resolve as last-write-wins on
// the whole session.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::anchor::{AnchorStore, LocalAnchor};
use crate::db::{SessionStore, SessionSubscription};
use crate::error::{PokerError, Result};
use crate::ids::{self, normalize_room_code};
use crate::intent::{self, Intent};
use crate::model::{Participant, Role, Session, UserStory};
use crate::scale::VotingScale;

/// Default number of random room codes tried before accepting a collision.
pub const DEFAULT_ROOM_CODE_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Local view
// ---------------------------------------------------------------------------

/// This client's view of its session and who it is in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub session: Session,
    pub participant_id: String,
}

impl ClientSession {
    pub fn new(session: Session, participant_id: impl Into<String>) -> Self {
        ClientSession {
            session,
            participant_id: participant_id.into(),
        }
    }

    /// The local participant as currently known.
    pub fn me(&self) -> Option<&Participant> {
        self.session.participant(&self.participant_id)
    }

    pub fn is_moderator(&self) -> bool {
        self.session.is_moderator(&self.participant_id)
    }

    pub fn anchor(&self) -> LocalAnchor {
        LocalAnchor::new(self.session.id.clone(), self.participant_id.clone())
    }
}

/// Why a client lost its place in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartReason {
    /// The participant is no longer listed.
    Removed,
    /// The session was ended.
    SessionEnded,
}

/// Result of folding a remote change into the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The local view now holds the incoming session.
    Updated,
    /// The local participant is gone; the anchor has been cleared and the
    /// view should be dropped.
    Departed(DepartReason),
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    anchors: AnchorStore,
    room_code_attempts: u32,
}

impl Reconciler {
    pub fn new(store: Arc<dyn SessionStore>, anchors: AnchorStore) -> Self {
        Reconciler {
            store,
            anchors,
            room_code_attempts: DEFAULT_ROOM_CODE_ATTEMPTS,
        }
    }

    pub fn with_room_code_attempts(mut self, attempts: u32) -> Self {
        self.room_code_attempts = attempts;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn anchors(&self) -> &AnchorStore {
        &self.anchors
    }

    /// Subscribe to remote changes of the client's session. Cancel the
    /// subscription when leaving the session view.
    pub fn subscribe(&self, client: &ClientSession) -> SessionSubscription {
        self.store.subscribe(&client.session.id)
    }

    // ------------------------------------------------------------------
    // Entering a session
    // ------------------------------------------------------------------

    /// Start a new session moderated by `moderator_name`.
    pub async fn create_session(
        &self,
        moderator_name: &str,
        voting_scale: VotingScale,
    ) -> Result<ClientSession> {
        let name = moderator_name.trim();
        if name.is_empty() {
            return Err(PokerError::EmptyName);
        }

        let participant_id = ids::generate_id();
        let room_code =
            ids::allocate_room_code(self.store.as_ref(), self.room_code_attempts).await;
        let session = Session::create(
            ids::generate_id(),
            room_code,
            Participant::new(participant_id.clone(), name, Role::Moderator),
            voting_scale,
            UserStory::placeholder(ids::generate_story_id()),
        );

        self.store.save(&session).await?;
        info!(
            "Created session {} with room code {} (scale: {})",
            session.id, session.room_code, session.voting_scale.name
        );
        self.remember(&session, &participant_id);
        Ok(ClientSession::new(session, participant_id))
    }

    /// Join the session with `room_code` under a fresh participant id.
    pub async fn join(&self, room_code: &str, name: &str) -> Result<ClientSession> {
        self.join_as(room_code, name, &ids::generate_id()).await
    }

    /// Join with a known participant id. If the id is already in the session
    /// (a reconnect) the participant is updated in place.
    pub async fn join_as(
        &self,
        room_code: &str,
        name: &str,
        participant_id: &str,
    ) -> Result<ClientSession> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PokerError::EmptyName);
        }
        let code = normalize_room_code(room_code);
        let found = self
            .store
            .find_by_room_code(&code)
            .await
            .ok_or_else(|| PokerError::not_found(format!("session with room code {code}")))?;

        // Re-read right before writing to narrow the window for lost updates.
        let latest = self
            .store
            .find_by_id(&found.id)
            .await
            .ok_or_else(|| PokerError::not_found(format!("session {}", found.id)))?;

        let joining = Participant::new(participant_id, name, Role::Participant);
        let session = intent::upsert_participant(&latest, joining)?;
        self.store.save(&session).await?;
        info!(
            "Participant {} ({}) joined session {}",
            name, participant_id, session.id
        );
        self.remember(&session, participant_id);
        Ok(ClientSession::new(session, participant_id))
    }

    /// Re-attach to the session recorded in the local anchor, as on startup.
    ///
    /// Returns `Ok(None)` when there is no anchor. When the anchor is partial
    /// or the store no longer knows the session or participant, the anchor is
    /// cleared and [`PokerError::StaleLocalIdentity`] is returned.
    pub async fn reattach(&self) -> Result<Option<ClientSession>> {
        let snapshot = self.anchors.session();
        let participant_id = self.anchors.participant_id();

        let (snapshot, participant_id) = match (snapshot, participant_id) {
            (None, None) => return Ok(None),
            (Some(s), Some(p)) => (s, p),
            _ => {
                warn!("Partial local anchor found, clearing it");
                self.forget();
                return Err(PokerError::StaleLocalIdentity);
            }
        };

        match self.store.find_by_id(&snapshot.id).await {
            Some(session) if session.participant(&participant_id).is_some() => {
                info!(
                    "Re-attached to session {} as {}",
                    session.id, participant_id
                );
                self.remember(&session, &participant_id);
                Ok(Some(ClientSession::new(session, participant_id)))
            }
            Some(_) => {
                warn!(
                    "Participant {} is no longer in session {}, clearing anchor",
                    participant_id, snapshot.id
                );
                self.forget();
                Err(PokerError::StaleLocalIdentity)
            }
            None => {
                warn!("Session {} no longer active, clearing anchor", snapshot.id);
                self.forget();
                Err(PokerError::StaleLocalIdentity)
            }
        }
    }

    // ------------------------------------------------------------------
    // Acting in a session
    // ------------------------------------------------------------------

    /// Apply `intent` as the local participant and save the result.
    ///
    /// Returns `Ok(false)` when the intent changed nothing (including intents
    /// the participant is not allowed to perform); nothing is written then.
    /// On a failed save the local view is rolled back and the error returned;
    /// the caller decides whether to resubmit.
    pub async fn submit(&self, client: &mut ClientSession, intent: &Intent) -> Result<bool> {
        let next = intent::apply(&client.session, &client.participant_id, intent);
        if next == client.session {
            debug!("Intent {} left session {} unchanged", intent.name(), next.id);
            return Ok(false);
        }

        let previous = std::mem::replace(&mut client.session, next);
        if let Err(e) = self.store.save(&client.session).await {
            client.session = previous;
            return Err(e);
        }
        debug!(
            "Applied {} from {} to session {}",
            intent.name(),
            client.participant_id,
            client.session.id
        );
        self.remember_snapshot(&client.session);
        Ok(true)
    }

    /// Leave the session.
    ///
    /// A moderator leaving ends the session for everyone; anyone else is
    /// removed from the latest stored copy. The local anchor is cleared even
    /// when the remote write fails; the write error is still returned.
    pub async fn leave(&self, client: ClientSession) -> Result<()> {
        let result = self.leave_remote(&client).await;
        if let Err(e) = &result {
            warn!("Leaving session {} failed remotely: {e}", client.session.id);
        }
        self.forget();
        result
    }

    async fn leave_remote(&self, client: &ClientSession) -> Result<()> {
        let latest = self.store.find_by_id(&client.session.id).await;

        if client.is_moderator() {
            let base = latest.unwrap_or_else(|| client.session.clone());
            let ended = intent::end_session(&base);
            self.store.save(&ended).await?;
            info!("Moderator ended session {}", ended.id);
            return Ok(());
        }

        let Some(latest) = latest else {
            debug!(
                "Session {} already gone, nothing to leave",
                client.session.id
            );
            return Ok(());
        };
        if latest.participant(&client.participant_id).is_none() {
            return Ok(());
        }
        let remaining = intent::without_participant(&latest, &client.participant_id);
        self.store.save(&remaining).await?;
        info!(
            "Participant {} left session {}",
            client.participant_id, remaining.id
        );
        Ok(())
    }

    /// Fold a session received from the change feed into the local view.
    ///
    /// The local participant is looked up again by id. If it is missing, or
    /// the session has ended, the client is treated as having left: the
    /// anchor is cleared and no further remove is attempted.
    pub fn apply_remote(&self, client: &mut ClientSession, incoming: Session) -> RemoteOutcome {
        if incoming.id != client.session.id {
            debug!(
                "Ignoring change for session {} while in {}",
                incoming.id, client.session.id
            );
            return RemoteOutcome::Updated;
        }

        let reason = if !incoming.is_active {
            Some(DepartReason::SessionEnded)
        } else if incoming.participant(&client.participant_id).is_none() {
            Some(DepartReason::Removed)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                info!(
                    "Participant {} departed session {}: {:?}",
                    client.participant_id, incoming.id, reason
                );
                self.forget();
                client.session = incoming;
                RemoteOutcome::Departed(reason)
            }
            None => {
                client.session = incoming;
                self.remember_snapshot(&client.session);
                RemoteOutcome::Updated
            }
        }
    }

    // ------------------------------------------------------------------
    // Anchor bookkeeping
    // ------------------------------------------------------------------

    fn remember(&self, session: &Session, participant_id: &str) {
        if let Err(e) = self.anchors.attach(session, participant_id) {
            warn!("Failed to record local anchor: {e}");
        }
    }

    fn remember_snapshot(&self, session: &Session) {
        if let Err(e) = self.anchors.set_session(session) {
            warn!("Failed to update local session snapshot: {e}");
        }
    }

    fn forget(&self) {
        if let Err(e) = self.anchors.clear() {
            warn!("Failed to clear local anchor: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::scale;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(":memory:").unwrap());
        let reconciler = Reconciler::new(db.clone(), AnchorStore::new(dir.path().join("a")));
        Fixture {
            _dir: dir,
            db,
            reconciler,
        }
    }

    /// A second client sharing the same store but with its own anchor.
    fn other_client(f: &Fixture, name: &str) -> Reconciler {
        Reconciler::new(f.db.clone(), AnchorStore::new(f._dir.path().join(name)))
    }

    #[tokio::test]
    async fn create_session_scenario() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("  Alice ", scale::FIBONACCI.to_scale())
            .await
            .unwrap();

        let s = &alice.session;
        assert_eq!(s.participants.len(), 1);
        assert_eq!(s.participants[0].name, "Alice");
        assert_eq!(s.participants[0].role, Role::Moderator);
        assert_eq!(s.moderator_id, alice.participant_id);
        assert_eq!(s.user_stories.len(), 1);
        assert_eq!(s.current_story_index, 0);
        assert!(!s.votes_visible);
        assert!(ids::is_room_code(&s.room_code));

        assert_eq!(f.db.find_by_id(&s.id).await.as_ref(), Some(s));
        assert_eq!(f.reconciler.anchors().anchor(), Some(alice.anchor()));
    }

    #[tokio::test]
    async fn create_rejects_blank_name() {
        let f = fixture();
        let err = f
            .reconciler
            .create_session("   ", VotingScale::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PokerError::EmptyName));
    }

    #[tokio::test]
    async fn join_unknown_room_is_not_found() {
        let f = fixture();
        let err = f.reconciler.join("NOPE00", "Bob").await.unwrap_err();
        assert!(matches!(err, PokerError::NotFound { .. }));
        assert!(err.is_user_correctable());
    }

    #[tokio::test]
    async fn join_duplicate_name_leaves_store_unchanged() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let before = f.db.find_by_id(&alice.session.id).await.unwrap();

        let bob_client = other_client(&f, "bob");
        let err = bob_client
            .join(&alice.session.room_code, "ALICE")
            .await
            .unwrap_err();
        assert!(matches!(err, PokerError::DuplicateName { .. }));
        assert_eq!(f.db.find_by_id(&alice.session.id).await.unwrap(), before);
        assert!(bob_client.anchors().anchor().is_none());
    }

    #[tokio::test]
    async fn rejoin_with_same_id_updates_in_place() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let bob_client = other_client(&f, "bob");
        let bob = bob_client
            .join(&alice.session.room_code, "Bob")
            .await
            .unwrap();

        let again = bob_client
            .join_as(
                &alice.session.room_code.to_lowercase(),
                "bob",
                &bob.participant_id,
            )
            .await
            .unwrap();
        assert_eq!(again.session.participants.len(), 2);
        assert_eq!(again.me().unwrap().name, "bob");
    }

    #[tokio::test]
    async fn submit_no_op_writes_nothing() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let bob_client = other_client(&f, "bob");
        let mut bob = bob_client
            .join(&alice.session.room_code, "Bob")
            .await
            .unwrap();

        let mut sub = f.db.subscribe(&bob.session.id);
        let changed = bob_client
            .submit(&mut bob, &Intent::ToggleVotesVisible)
            .await
            .unwrap();
        assert!(!changed);
        let nothing = tokio::time::timeout(std::time::Duration::from_millis(20), sub.next()).await;
        assert!(nothing.is_err(), "no-op intent must not be broadcast");
    }

    /// A store whose writes always fail.
    struct ReadOnlyStore(Arc<Database>);

    #[async_trait::async_trait]
    impl SessionStore for ReadOnlyStore {
        async fn save(&self, session: &Session) -> Result<()> {
            Err(anyhow::anyhow!("read-only store, cannot save {}", session.id).into())
        }

        async fn find_by_room_code(&self, room_code: &str) -> Option<Session> {
            self.0.find_by_room_code(room_code).await
        }

        async fn find_by_id(&self, session_id: &str) -> Option<Session> {
            self.0.find_by_id(session_id).await
        }

        fn subscribe(&self, session_id: &str) -> SessionSubscription {
            self.0.subscribe(session_id)
        }
    }

    #[tokio::test]
    async fn submit_failure_rolls_back_local_view() {
        let f = fixture();
        let mut alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let before = alice.session.clone();

        let reconciler = Reconciler::new(
            Arc::new(ReadOnlyStore(f.db.clone())),
            f.reconciler.anchors().clone(),
        );
        let err = reconciler
            .submit(&mut alice, &Intent::ToggleVotesVisible)
            .await
            .unwrap_err();
        assert!(matches!(err, PokerError::Persistence(_)));
        assert_eq!(alice.session, before);
        assert_eq!(f.db.find_by_id(&before.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn leave_clears_anchor_even_when_write_fails() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let reconciler = Reconciler::new(
            Arc::new(ReadOnlyStore(f.db.clone())),
            f.reconciler.anchors().clone(),
        );

        assert!(reconciler.leave(alice).await.is_err());
        assert!(!f.reconciler.anchors().has_any());
    }

    #[tokio::test]
    async fn remote_removal_departs_and_clears_anchor() {
        let f = fixture();
        let mut alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let bob_client = other_client(&f, "bob");
        let mut bob = bob_client
            .join(&alice.session.room_code, "Bob")
            .await
            .unwrap();
        f.reconciler
            .apply_remote(&mut alice, f.db.find_by_id(&bob.session.id).await.unwrap());

        let mut bob_sub = bob_client.subscribe(&bob);
        f.reconciler
            .submit(
                &mut alice,
                &Intent::RemoveParticipant {
                    participant_id: bob.participant_id.clone(),
                },
            )
            .await
            .unwrap();

        let incoming = bob_sub.next().await.unwrap();
        let outcome = bob_client.apply_remote(&mut bob, incoming);
        assert_eq!(outcome, RemoteOutcome::Departed(DepartReason::Removed));
        assert!(bob_client.anchors().anchor().is_none());
        // The moderator is unaffected.
        assert!(f.reconciler.anchors().anchor().is_some());
    }

    #[tokio::test]
    async fn remote_update_refreshes_view_and_snapshot() {
        let f = fixture();
        let mut alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let bob_client = other_client(&f, "bob");
        let mut bob = bob_client
            .join(&alice.session.room_code, "Bob")
            .await
            .unwrap();
        let mut bob_sub = bob_client.subscribe(&bob);

        let latest = f.db.find_by_id(&alice.session.id).await.unwrap();
        f.reconciler.apply_remote(&mut alice, latest);
        f.reconciler
            .submit(&mut alice, &Intent::ToggleVotesVisible)
            .await
            .unwrap();

        let incoming = bob_sub.next().await.unwrap();
        assert_eq!(bob_client.apply_remote(&mut bob, incoming), RemoteOutcome::Updated);
        assert!(bob.session.votes_visible);
        assert!(bob_client.anchors().session().unwrap().votes_visible);
    }

    #[tokio::test]
    async fn moderator_leave_ends_session() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let id = alice.session.id.clone();
        let code = alice.session.room_code.clone();

        f.reconciler.leave(alice).await.unwrap();
        assert!(f.db.find_by_id(&id).await.is_none());
        assert!(f.db.find_by_room_code(&code).await.is_none());
        assert!(!f.reconciler.anchors().has_any());
    }

    #[tokio::test]
    async fn participant_leave_removes_only_them() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let bob_client = other_client(&f, "bob");
        let bob = bob_client
            .join(&alice.session.room_code, "Bob")
            .await
            .unwrap();

        bob_client.leave(bob).await.unwrap();
        let stored = f.db.find_by_id(&alice.session.id).await.unwrap();
        assert!(stored.is_active);
        assert_eq!(stored.participants.len(), 1);
        assert!(!bob_client.anchors().has_any());
    }

    #[tokio::test]
    async fn reattach_without_anchor_is_none() {
        let f = fixture();
        assert!(f.reconciler.reattach().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reattach_restores_fresh_session() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let bob_client = other_client(&f, "bob");
        bob_client
            .join(&alice.session.room_code, "Bob")
            .await
            .unwrap();

        let restored = f.reconciler.reattach().await.unwrap().unwrap();
        assert_eq!(restored.participant_id, alice.participant_id);
        assert_eq!(restored.session.participants.len(), 2);
    }

    #[tokio::test]
    async fn reattach_to_ended_session_is_stale() {
        let f = fixture();
        let alice = f
            .reconciler
            .create_session("Alice", VotingScale::default())
            .await
            .unwrap();
        let bob_client = other_client(&f, "bob");
        bob_client
            .join(&alice.session.room_code, "Bob")
            .await
            .unwrap();
        f.reconciler.leave(alice).await.unwrap();

        let err = bob_client.reattach().await.unwrap_err();
        assert!(matches!(err, PokerError::StaleLocalIdentity));
        assert!(!bob_client.anchors().has_any());
    }

    #[tokio::test]
    async fn partial_anchor_is_cleared() {
        let f = fixture();
        f.reconciler.anchors().set_participant_id("ghost").unwrap();
        let err = f.reconciler.reattach().await.unwrap_err();
        assert!(matches!(err, PokerError::StaleLocalIdentity));
        assert!(!f.reconciler.anchors().has_any());
    }
}
