// Messages between the input task, the event loop and the output task.

use pointing_core::reconciler::ClientSession;

/// A parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Create {
        name: String,
        scale: Option<String>,
    },
    Join {
        room_code: String,
        name: String,
    },
    Vote {
        value: String,
    },
    /// Show or hide the votes.
    Reveal,
    Reset,
    Scale {
        name: String,
    },
    Next,
    Complete,
    EditStory {
        title: String,
        description: Option<String>,
    },
    AddStory {
        title: String,
        description: Option<String>,
    },
    /// Toggle a participant between voter and observer, by id or name.
    ToggleObserver {
        who: String,
    },
    Remove {
        who: String,
    },
    Show,
    Leave,
    Help,
    Quit,
}

/// Output for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiUpdate {
    Snapshot(Box<ClientSession>),
    Notice(String),
    Error(String),
}
