// Pointing poker driver entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Open database and start the change poller
// 4. Re-attach to the session in the local anchor, if any
// 5. Create mpsc channels
// 6. Spawn output and input tasks
// 7. Run the event loop until `quit` or end of input
// 8. Cleanup on exit

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pointing_app::app::{self, AppState};
use pointing_app::command;
use pointing_app::protocol::{UiUpdate, UserCommand};
use pointing_app::view;
use pointing_core::anchor::AnchorStore;
use pointing_core::config;
use pointing_core::db::Database;
use pointing_core::reconciler::Reconciler;
use pointing_core::route;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing (log to file, not terminal)
    init_tracing()?;
    info!("Pointing poker starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: database={}, default scale={}",
        config.database.path, config.session.default_scale
    );

    // 3. Open database and start the change poller
    let db = Arc::new(
        Database::open_with_capacity(&config.database.path, config.feed.channel_capacity)
            .context("failed to open database")?,
    );
    info!("Database opened at {}", config.database.path);
    let poller = db.spawn_change_poller(config.poll_interval());

    // 4. Re-attach to the session in the local anchor
    let anchors = match &config.anchor.dir {
        Some(dir) => AnchorStore::new(dir),
        None => AnchorStore::in_user_data_dir()
            .context("could not determine a data directory for the local anchor")?,
    };
    info!("Local anchor at {}", anchors.dir().display());
    let reconciler =
        Reconciler::new(db.clone(), anchors).with_room_code_attempts(config.room_code.max_attempts);
    let mut state = AppState::new(reconciler, config.default_scale());
    match app::restore(&mut state).await {
        Ok(true) => {
            if let Some(client) = state.client() {
                info!("Re-attached to room {}", client.session.room_code);
            }
        }
        Ok(false) => info!("No session to re-attach"),
        Err(e) => {
            error!("Re-attach failed: {e:#}");
            return Err(e.context("re-attach failed"));
        }
    }

    // 5. Create mpsc channels
    let (cmd_tx, cmd_rx) = mpsc::channel::<UserCommand>(64);
    let (ui_tx, ui_rx) = mpsc::channel::<UiUpdate>(256);

    // 6. Spawn output and input tasks
    let output_handle = tokio::spawn(print_updates(ui_rx));

    if let Some(link) = std::env::args().nth(1).as_deref().and_then(route::parse_join_path) {
        let _ = ui_tx
            .send(UiUpdate::Notice(format!(
                "Join link for room {}: type `join {} <name>`",
                link.room_code, link.room_code
            )))
            .await;
    }
    let _ = ui_tx
        .send(UiUpdate::Notice("Type `help` for commands".into()))
        .await;

    let input_handle = tokio::spawn(read_commands(cmd_tx, ui_tx.clone()));

    // 7. Run the event loop
    if let Err(e) = app::run(cmd_rx, ui_tx, state).await {
        error!("Application loop error: {e:#}");
    }

    // 8. Cleanup: stop reading stdin so the output task sees its channel close
    input_handle.abort();
    let _ = input_handle.await;
    let _ = tokio::time::timeout(Duration::from_secs(2), output_handle).await;
    poller.abort();

    info!("Pointing poker shut down cleanly");
    Ok(())
}

/// Forward parsed stdin lines to the event loop. Parse errors go straight to
/// the output.
async fn read_commands(cmd_tx: mpsc::Sender<UserCommand>, ui_tx: mpsc::Sender<UiUpdate>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match command::parse(&line) {
                Ok(Some(cmd)) => {
                    if cmd_tx.send(cmd).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = ui_tx.send(UiUpdate::Error(e.to_string())).await;
                }
            },
            Ok(None) => {
                info!("End of input");
                let _ = cmd_tx.send(UserCommand::Quit).await;
                break;
            }
            Err(e) => {
                error!("Failed to read input: {e}");
                let _ = cmd_tx.send(UserCommand::Quit).await;
                break;
            }
        }
    }
}

async fn print_updates(mut ui_rx: mpsc::Receiver<UiUpdate>) {
    while let Some(update) = ui_rx.recv().await {
        match update {
            UiUpdate::Snapshot(client) => println!("{}", view::render(&client)),
            UiUpdate::Notice(message) => println!("{message}"),
            UiUpdate::Error(message) => eprintln!("error: {message}"),
        }
    }
}

/// Initialize tracing to log to a file (stdout carries the session view).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("pointing-poker.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pointing_core=info,pointing_app=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
