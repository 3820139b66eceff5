// Driver state and main event loop.

use pointing_core::db::SessionSubscription;
use pointing_core::error::PokerError;
use pointing_core::ids;
use pointing_core::intent::Intent;
use pointing_core::model::{Session, StoryPatch, UserStory};
use pointing_core::reconciler::{ClientSession, DepartReason, Reconciler, RemoteOutcome};
use pointing_core::route;
use pointing_core::scale::{self, VotingScale};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::command::HELP;
use crate::protocol::{UiUpdate, UserCommand};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AppState {
    reconciler: Reconciler,
    default_scale: VotingScale,
    client: Option<ClientSession>,
    subscription: Option<SessionSubscription>,
}

impl AppState {
    pub fn new(reconciler: Reconciler, default_scale: VotingScale) -> Self {
        AppState {
            reconciler,
            default_scale,
            client: None,
            subscription: None,
        }
    }

    pub fn client(&self) -> Option<&ClientSession> {
        self.client.as_ref()
    }

    fn attach(&mut self, client: ClientSession) {
        if let Some(mut old) = self.subscription.take() {
            old.unsubscribe();
        }
        self.subscription = Some(self.reconciler.subscribe(&client));
        self.client = Some(client);
    }

    fn detach(&mut self) -> Option<ClientSession> {
        if let Some(mut sub) = self.subscription.take() {
            sub.unsubscribe();
        }
        self.client.take()
    }

    fn snapshot(&self) -> Option<UiUpdate> {
        self.client
            .as_ref()
            .map(|c| UiUpdate::Snapshot(Box::new(c.clone())))
    }
}

/// Re-attach to the session from the local anchor, if any.
///
/// Returns `Ok(true)` when a session was restored. A stale anchor is cleared
/// and reported as `Ok(false)`.
pub async fn restore(state: &mut AppState) -> anyhow::Result<bool> {
    match state.reconciler.reattach().await {
        Ok(Some(client)) => {
            state.attach(client);
            Ok(true)
        }
        Ok(None) => Ok(false),
        Err(PokerError::StaleLocalIdentity) => {
            warn!("Stored session is gone, starting without one");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the main event loop.
///
/// Listens with `tokio::select!` on user commands and, while in a session, on
/// the session's change feed. Everything shown to the user goes through
/// `ui_tx`.
pub async fn run(
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
    mut state: AppState,
) -> anyhow::Result<()> {
    info!("Application event loop started");

    if let Some(update) = state.snapshot() {
        let _ = ui_tx.send(update).await;
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UserCommand::Quit) => {
                        info!("Quit command received, shutting down");
                        break;
                    }
                    Some(cmd) => handle_user_command(&mut state, cmd, &ui_tx).await,
                    None => {
                        info!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            remote = next_remote(&mut state.subscription), if state.subscription.is_some() => {
                handle_remote(&mut state, remote, &ui_tx).await;
            }
        }
    }

    // The session stays joined; the anchor lets the next start re-attach.
    if let Some(mut sub) = state.subscription.take() {
        sub.unsubscribe();
    }
    info!("Application event loop exiting");
    Ok(())
}

async fn next_remote(subscription: &mut Option<SessionSubscription>) -> Option<Session> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

/// Fold a change from the feed into the local view.
async fn handle_remote(
    state: &mut AppState,
    remote: Option<Session>,
    ui_tx: &mpsc::Sender<UiUpdate>,
) {
    let Some(incoming) = remote else {
        warn!("Session change feed closed");
        state.subscription = None;
        let _ = ui_tx
            .send(UiUpdate::Error("lost the session change feed".into()))
            .await;
        return;
    };
    let Some(client) = state.client.as_mut() else {
        return;
    };

    match state.reconciler.apply_remote(client, incoming) {
        RemoteOutcome::Updated => {
            if let Some(update) = state.snapshot() {
                let _ = ui_tx.send(update).await;
            }
        }
        RemoteOutcome::Departed(reason) => {
            state.detach();
            let message = match reason {
                DepartReason::Removed => "You were removed from the session",
                DepartReason::SessionEnded => "The moderator ended the session",
            };
            let _ = ui_tx.send(UiUpdate::Notice(message.into())).await;
        }
    }
}

/// Handle a command from the input task.
async fn handle_user_command(
    state: &mut AppState,
    cmd: UserCommand,
    ui_tx: &mpsc::Sender<UiUpdate>,
) {
    let update = match cmd {
        UserCommand::Help => UiUpdate::Notice(HELP.into()),
        UserCommand::Create { name, scale } => create(state, &name, scale.as_deref()).await,
        UserCommand::Join { room_code, name } => join(state, &room_code, &name).await,
        UserCommand::Show => state
            .snapshot()
            .unwrap_or_else(|| UiUpdate::Notice("Not in a session".into())),
        UserCommand::Leave => leave(state).await,
        UserCommand::Quit => return,
        other => session_command(state, other).await,
    };
    let _ = ui_tx.send(update).await;
}

async fn create(state: &mut AppState, name: &str, scale_name: Option<&str>) -> UiUpdate {
    if let Some(client) = &state.client {
        return already_in(client);
    }
    let voting_scale = match scale_name {
        Some(n) => match scale::find(n) {
            Some(s) => s,
            None => return UiUpdate::Error(unknown_scale(n)),
        },
        None => state.default_scale.clone(),
    };
    match state.reconciler.create_session(name, voting_scale).await {
        Ok(client) => {
            let code = client.session.room_code.clone();
            state.attach(client);
            UiUpdate::Notice(format!(
                "Created room {code}. Share {} to invite others",
                route::share_path(&code)
            ))
        }
        Err(e) => report(e),
    }
}

async fn join(state: &mut AppState, room_code: &str, name: &str) -> UiUpdate {
    if let Some(client) = &state.client {
        return already_in(client);
    }
    let code = route::room_code_from_input(room_code);
    match state.reconciler.join(&code, name).await {
        Ok(client) => {
            state.attach(client);
            UiUpdate::Notice(format!("Joined room {code}"))
        }
        Err(e) => report(e),
    }
}

async fn leave(state: &mut AppState) -> UiUpdate {
    let Some(client) = state.detach() else {
        return UiUpdate::Notice("Not in a session".into());
    };
    let ending = client.is_moderator();
    match state.reconciler.leave(client).await {
        Ok(()) if ending => UiUpdate::Notice("Session ended".into()),
        Ok(()) => UiUpdate::Notice("Left the session".into()),
        Err(e) => UiUpdate::Error(format!("left locally, but the session was not updated: {e}")),
    }
}

/// Commands that act inside the current session.
async fn session_command(state: &mut AppState, cmd: UserCommand) -> UiUpdate {
    let Some(client) = state.client.as_mut() else {
        return UiUpdate::Error("Not in a session; use `create` or `join` first".into());
    };
    let intent = match intent_for(&client.session, cmd) {
        Ok(intent) => intent,
        Err(message) => return UiUpdate::Error(message),
    };
    match state.reconciler.submit(client, &intent).await {
        // The change feed echoes the saved session back.
        Ok(true) => UiUpdate::Notice("ok".into()),
        Ok(false) => UiUpdate::Notice("Nothing changed".into()),
        Err(e) => report(e),
    }
}

fn intent_for(session: &Session, cmd: UserCommand) -> Result<Intent, String> {
    let intent = match cmd {
        UserCommand::Vote { value } => Intent::CastVote { value },
        UserCommand::Reveal => Intent::ToggleVotesVisible,
        UserCommand::Reset => Intent::ResetVotes,
        UserCommand::Scale { name } => Intent::ChangeVotingScale {
            scale: scale::find(&name).ok_or_else(|| unknown_scale(&name))?,
        },
        UserCommand::Next => Intent::NextStory,
        UserCommand::Complete => Intent::CompleteCurrentStory,
        UserCommand::EditStory { title, description } => {
            let story = session
                .current_story()
                .ok_or_else(|| "There is no current story".to_string())?;
            Intent::UpdateStory {
                story_id: story.id.clone(),
                patch: StoryPatch {
                    title: Some(title),
                    description,
                    ..StoryPatch::default()
                },
            }
        }
        UserCommand::AddStory { title, description } => Intent::AddStory {
            story: UserStory::new(
                ids::generate_story_id(),
                title,
                description.unwrap_or_default(),
            ),
        },
        UserCommand::ToggleObserver { who } => Intent::ToggleObserver {
            participant_id: resolve_participant(session, &who)?,
        },
        UserCommand::Remove { who } => Intent::RemoveParticipant {
            participant_id: resolve_participant(session, &who)?,
        },
        other => return Err(format!("{other:?} is not a session command")),
    };
    Ok(intent)
}

/// Find a participant by exact id or case-insensitive name.
fn resolve_participant(session: &Session, who: &str) -> Result<String, String> {
    session
        .participants
        .iter()
        .find(|p| p.id == who)
        .or_else(|| session.participants.iter().find(|p| p.has_name(who)))
        .map(|p| p.id.clone())
        .ok_or_else(|| format!("No participant named `{who}`"))
}

/// Input mistakes go back to the user as-is; anything else is logged too.
fn report(err: PokerError) -> UiUpdate {
    if !err.is_user_correctable() {
        error!("Command failed: {err}");
    }
    UiUpdate::Error(err.to_string())
}

fn already_in(client: &ClientSession) -> UiUpdate {
    UiUpdate::Error(format!(
        "Already in room {}; `leave` first",
        client.session.room_code
    ))
}

fn unknown_scale(name: &str) -> String {
    let known: Vec<&str> = scale::PRESETS.iter().map(|p| p.name).collect();
    format!("Unknown scale `{name}`, expected one of: {}", known.join(", "))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
