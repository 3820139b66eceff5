// Integration tests for the session engine.
//
// Several clients, each with its own reconciler and anchor directory, share
// one store the way separate browser tabs share one backend. They verify that
// intents, the change feed and local anchors work together end to end.

use std::sync::Arc;
use std::time::Duration;

use pointing_core::anchor::AnchorStore;
use pointing_core::db::{Database, SessionStore, SessionSubscription};
use pointing_core::error::PokerError;
use pointing_core::ids;
use pointing_core::intent::Intent;
use pointing_core::model::{Role, Session};
use pointing_core::reconciler::{ClientSession, DepartReason, Reconciler, RemoteOutcome};
use pointing_core::scale;
use pointing_core::tally;

use tempfile::TempDir;

// ===========================================================================
// Test helpers
// ===========================================================================

struct World {
    dir: TempDir,
    db: Arc<Database>,
}

impl World {
    fn new() -> Self {
        World {
            dir: tempfile::tempdir().unwrap(),
            db: Arc::new(Database::open(":memory:").unwrap()),
        }
    }

    /// A client with its own anchor directory.
    fn client(&self, name: &str) -> Reconciler {
        Reconciler::new(self.db.clone(), AnchorStore::new(self.dir.path().join(name)))
    }
}

async fn next_change(sub: &mut SessionSubscription) -> Session {
    tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("change expected")
        .expect("feed open")
}

/// Apply every change already queued on `sub`.
async fn catch_up(
    reconciler: &Reconciler,
    client: &mut ClientSession,
    sub: &mut SessionSubscription,
) -> Option<RemoteOutcome> {
    let mut last = None;
    while let Ok(Some(session)) = tokio::time::timeout(Duration::from_millis(20), sub.next()).await
    {
        last = Some(reconciler.apply_remote(client, session));
    }
    last
}

// ===========================================================================
// Alice and Bob
// ===========================================================================

#[tokio::test]
async fn alice_and_bob_estimate_a_story() {
    let world = World::new();
    let alice_rc = world.client("alice");
    let bob_rc = world.client("bob");

    // Alice creates a Fibonacci session.
    let mut alice = alice_rc
        .create_session("Alice", scale::FIBONACCI.to_scale())
        .await
        .unwrap();
    assert_eq!(alice.session.participants.len(), 1);
    assert_eq!(alice.me().unwrap().role, Role::Moderator);
    assert_eq!(alice.session.user_stories.len(), 1);
    assert_eq!(alice.session.current_story_index, 0);
    assert!(!alice.session.votes_visible);
    let mut alice_sub = alice_rc.subscribe(&alice);

    // Bob joins with the room code.
    let mut bob = bob_rc
        .join(&alice.session.room_code.to_lowercase(), "Bob")
        .await
        .unwrap();
    let mut bob_sub = bob_rc.subscribe(&bob);
    assert_eq!(bob.session.participants.len(), 2);
    let bob_id = bob.participant_id.clone();
    {
        let me = bob.me().unwrap();
        assert_eq!(me.role, Role::Participant);
        assert!(!me.has_voted);
    }

    let joined = next_change(&mut alice_sub).await;
    assert_eq!(
        alice_rc.apply_remote(&mut alice, joined),
        RemoteOutcome::Updated
    );
    assert_eq!(alice.session.participants.len(), 2);

    // Bob votes 5; Alice sees that he voted but not what.
    assert!(bob_rc
        .submit(&mut bob, &Intent::CastVote { value: "5".into() })
        .await
        .unwrap());
    let me = bob.me().unwrap();
    assert!(me.has_voted);
    assert_eq!(me.vote.as_deref(), Some("5"));
    assert!(!bob.session.votes_visible);

    let voted = next_change(&mut alice_sub).await;
    alice_rc.apply_remote(&mut alice, voted);
    let bob_in_alice_view = alice.session.participant(&bob_id).unwrap();
    assert!(bob_in_alice_view.has_voted);
    assert_eq!(
        tally::visible_vote(&alice.session, &alice.participant_id, bob_in_alice_view),
        None
    );

    // Carol joins but does not vote; Alice reveals anyway.
    let carol_rc = world.client("carol");
    carol_rc
        .join(&alice.session.room_code, "Carol")
        .await
        .unwrap();
    catch_up(&alice_rc, &mut alice, &mut alice_sub).await;
    assert!(!tally::all_voted(&alice.session));

    assert!(alice_rc
        .submit(&mut alice, &Intent::ToggleVotesVisible)
        .await
        .unwrap());
    assert!(alice.session.votes_visible);

    catch_up(&bob_rc, &mut bob, &mut bob_sub).await;
    assert!(bob.session.votes_visible);
    assert_eq!(bob.session.participants.len(), 3);
    let consensus = tally::consensus(&bob.session).unwrap();
    assert_eq!(consensus.value, "5");
    assert!(consensus.is_majority);

    // Alice leaves, which ends the session for everyone.
    let session_id = alice.session.id.clone();
    let room_code = alice.session.room_code.clone();
    alice_rc.leave(alice).await.unwrap();

    assert!(world.db.find_by_id(&session_id).await.is_none());
    assert!(world.db.find_by_room_code(&room_code).await.is_none());

    let outcome = catch_up(&bob_rc, &mut bob, &mut bob_sub).await;
    assert_eq!(
        outcome,
        Some(RemoteOutcome::Departed(DepartReason::SessionEnded))
    );
    assert!(!bob_rc.anchors().has_any());
    assert!(matches!(
        bob_rc.join(&room_code, "Bob").await,
        Err(PokerError::NotFound { .. })
    ));
}

// ===========================================================================
// Membership
// ===========================================================================

#[tokio::test]
async fn duplicate_name_join_leaves_store_unchanged() {
    let world = World::new();
    let alice = world
        .client("alice")
        .create_session("Alice", scale::FIBONACCI.to_scale())
        .await
        .unwrap();
    let before = world.db.load_any(&alice.session.id).unwrap().unwrap();

    let err = world
        .client("imposter")
        .join(&alice.session.room_code, " alice ")
        .await
        .unwrap_err();
    assert!(matches!(err, PokerError::DuplicateName { .. }));
    assert_eq!(world.db.load_any(&alice.session.id).unwrap().unwrap(), before);
}

#[tokio::test]
async fn moderator_removes_participant_who_then_departs() {
    let world = World::new();
    let alice_rc = world.client("alice");
    let bob_rc = world.client("bob");

    let mut alice = alice_rc
        .create_session("Alice", scale::T_SHIRT_SIZES.to_scale())
        .await
        .unwrap();
    let mut alice_sub = alice_rc.subscribe(&alice);
    let mut bob = bob_rc.join(&alice.session.room_code, "Bob").await.unwrap();
    let mut bob_sub = bob_rc.subscribe(&bob);
    catch_up(&alice_rc, &mut alice, &mut alice_sub).await;

    // Bob cannot remove the moderator.
    assert!(!bob_rc
        .submit(
            &mut bob,
            &Intent::RemoveParticipant {
                participant_id: alice.participant_id.clone()
            }
        )
        .await
        .unwrap());

    assert!(alice_rc
        .submit(
            &mut alice,
            &Intent::RemoveParticipant {
                participant_id: bob.participant_id.clone()
            }
        )
        .await
        .unwrap());

    let outcome = catch_up(&bob_rc, &mut bob, &mut bob_sub).await;
    assert_eq!(outcome, Some(RemoteOutcome::Departed(DepartReason::Removed)));
    assert!(bob_rc.anchors().anchor().is_none());

    let stored = world.db.find_by_id(&alice.session.id).await.unwrap();
    assert_eq!(stored.participants.len(), 1);
    assert!(stored.moderator_is_consistent());
}

#[tokio::test]
async fn observer_is_excluded_from_vote_progress() {
    let world = World::new();
    let alice_rc = world.client("alice");
    let mut alice = alice_rc
        .create_session("Alice", scale::FIBONACCI.to_scale())
        .await
        .unwrap();
    let mut alice_sub = alice_rc.subscribe(&alice);
    let bob_rc = world.client("bob");
    let mut bob = bob_rc.join(&alice.session.room_code, "Bob").await.unwrap();
    let carol = world
        .client("carol")
        .join(&alice.session.room_code, "Carol")
        .await
        .unwrap();
    catch_up(&alice_rc, &mut alice, &mut alice_sub).await;

    alice_rc
        .submit(
            &mut alice,
            &Intent::ToggleObserver {
                participant_id: carol.participant_id.clone(),
            },
        )
        .await
        .unwrap();
    let mut bob_sub = bob_rc.subscribe(&bob);
    // Bob's view predates the observer change; refresh it from the store.
    let latest = world.db.find_by_id(&bob.session.id).await.unwrap();
    bob_rc.apply_remote(&mut bob, latest);
    bob_rc
        .submit(&mut bob, &Intent::CastVote { value: "8".into() })
        .await
        .unwrap();

    catch_up(&alice_rc, &mut alice, &mut alice_sub).await;
    assert_eq!(tally::vote_progress(&alice.session), (1, 1));
    assert!(tally::all_voted(&alice.session));
    assert_eq!(
        alice.session.participant(&carol.participant_id).unwrap().role,
        Role::Observer
    );
    bob_sub.unsubscribe();
}

// ===========================================================================
// Stories
// ===========================================================================

#[tokio::test]
async fn complete_story_records_estimate_and_advances() {
    let world = World::new();
    let alice_rc = world.client("alice");
    let mut alice = alice_rc
        .create_session("Alice", scale::FIBONACCI.to_scale())
        .await
        .unwrap();
    let bob_rc = world.client("bob");
    let mut bob = bob_rc.join(&alice.session.room_code, "Bob").await.unwrap();
    bob_rc
        .submit(&mut bob, &Intent::CastVote { value: "3".into() })
        .await
        .unwrap();

    let latest = world.db.find_by_id(&alice.session.id).await.unwrap();
    alice_rc.apply_remote(&mut alice, latest);
    alice_rc
        .submit(
            &mut alice,
            &Intent::AddStory {
                story: pointing_core::model::UserStory::new(
                    ids::generate_story_id(),
                    "Second",
                    "Another story",
                ),
            },
        )
        .await
        .unwrap();
    alice_rc
        .submit(&mut alice, &Intent::ToggleVotesVisible)
        .await
        .unwrap();
    alice_rc
        .submit(&mut alice, &Intent::CompleteCurrentStory)
        .await
        .unwrap();

    let stored = world.db.find_by_id(&alice.session.id).await.unwrap();
    assert_eq!(stored.current_story_index, 1);
    assert!(stored.user_stories[0].is_completed);
    assert_eq!(stored.user_stories[0].estimate.as_deref(), Some("3"));
    assert!(!stored.votes_visible);
    assert!(stored.participants.iter().all(|p| !p.has_voted));
}

// ===========================================================================
// Restart and room codes
// ===========================================================================

#[tokio::test]
async fn restart_reattaches_through_anchor() {
    let world = World::new();
    let alice = world
        .client("alice")
        .create_session("Alice", scale::FIBONACCI.to_scale())
        .await
        .unwrap();

    // A fresh reconciler over the same anchor directory, as after a restart.
    let restored = world.client("alice").reattach().await.unwrap().unwrap();
    assert_eq!(restored.participant_id, alice.participant_id);
    assert_eq!(restored.session, alice.session);
}

#[tokio::test]
async fn room_codes_avoid_active_sessions() {
    let world = World::new();
    let code = ids::allocate_room_code(world.db.as_ref(), 5).await;
    assert!(ids::is_room_code(&code));

    let alice = world
        .client("alice")
        .create_session("Alice", scale::FIBONACCI.to_scale())
        .await
        .unwrap();
    for _ in 0..20 {
        let next = ids::allocate_room_code(world.db.as_ref(), 5).await;
        assert_ne!(next, alice.session.room_code);
    }
}

// ===========================================================================
// Cross-process feed
// ===========================================================================

#[tokio::test]
async fn poller_delivers_changes_between_processes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let path = path.to_str().unwrap();
    let ours = Arc::new(Database::open(path).unwrap());
    let theirs = Arc::new(Database::open(path).unwrap());

    let alice_rc = Reconciler::new(ours.clone(), AnchorStore::new(dir.path().join("alice")));
    let mut alice = alice_rc
        .create_session("Alice", scale::FIBONACCI.to_scale())
        .await
        .unwrap();
    let mut alice_sub = alice_rc.subscribe(&alice);
    let _poller = ours.spawn_change_poller(Duration::from_millis(10));

    let bob_rc = Reconciler::new(theirs.clone(), AnchorStore::new(dir.path().join("bob")));
    bob_rc.join(&alice.session.room_code, "Bob").await.unwrap();

    let incoming = next_change(&mut alice_sub).await;
    assert_eq!(
        alice_rc.apply_remote(&mut alice, incoming),
        RemoteOutcome::Updated
    );
    assert_eq!(alice.session.participants.len(), 2);
}
