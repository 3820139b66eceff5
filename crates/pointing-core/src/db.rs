// SQLite-backed session store and its change feed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::stream::{self, Stream};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PokerError;
use crate::ids::normalize_room_code;
use crate::model::Session;
use crate::row::SessionRow;

/// Default capacity of the in-process change feed.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Persistence and change notification for sessions.
///
/// Lookups only ever return active sessions. A lookup that fails at the
/// transport level is logged and reported as "not found"; a failed save is
/// always returned to the caller.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or overwrite the whole session row.
    async fn save(&self, session: &Session) -> Result<(), PokerError>;

    /// Find an active session by room code (compared uppercase).
    async fn find_by_room_code(&self, room_code: &str) -> Option<Session>;

    /// Find an active session by id.
    async fn find_by_id(&self, session_id: &str) -> Option<Session>;

    /// Subscribe to every future change of the row for `session_id`.
    fn subscribe(&self, session_id: &str) -> SessionSubscription;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A cancellable feed of session snapshots for a single session id.
///
/// Yields the session each time its row changes, including the change that
/// ends it (`is_active == false`). After [`unsubscribe`](Self::unsubscribe)
/// or once the store is dropped, [`next`](Self::next) returns `None`.
pub struct SessionSubscription {
    session_id: String,
    rx: Option<broadcast::Receiver<Session>>,
}

impl SessionSubscription {
    pub fn new(session_id: impl Into<String>, rx: broadcast::Receiver<Session>) -> Self {
        SessionSubscription {
            session_id: session_id.into(),
            rx: Some(rx),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns `true` until the subscription is cancelled or the feed closes.
    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Wait for the next snapshot of this session.
    pub async fn next(&mut self) -> Option<Session> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(session) if session.id == self.session_id => return Some(session),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscription for session {} lagged, skipped {} changes",
                        self.session_id, skipped
                    );
                }
                Err(RecvError::Closed) => {
                    debug!("Change feed closed for session {}", self.session_id);
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Stop receiving changes. Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            info!("Unsubscribed from session {}", self.session_id);
        }
    }

    /// A fresh subscription to the same session, starting from the current
    /// point of the feed. `None` if this one was already cancelled.
    pub fn resubscribe(&self) -> Option<SessionSubscription> {
        self.rx
            .as_ref()
            .map(|rx| SessionSubscription::new(self.session_id.clone(), rx.resubscribe()))
    }

    /// Adapt into a [`Stream`] of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = Session> {
        stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|session| (session, sub))
        })
    }
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

const SELECT_COLUMNS: &str = "id, room_code, moderator_id, participants, current_story,
     voting_scale, votes_visible, is_active, created_at, updated_at, revision";

/// SQLite persistence for sessions.
///
/// Every successful save is broadcast to in-process subscribers right away.
/// Writes made by other processes sharing the database file are picked up by
/// [`poll_changes`](Self::poll_changes), usually driven by
/// [`spawn_change_poller`](Self::spawn_change_poller).
pub struct Database {
    conn: Mutex<Connection>,
    feed: broadcast::Sender<Session>,
    /// Highest revision the poller has looked at.
    poll_cursor: Mutex<i64>,
    /// Revisions written by this process and already broadcast.
    delivered: Mutex<HashSet<i64>>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure the schema
    /// exists. Pass `":memory:"` for an ephemeral database (useful for tests).
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_capacity(path, DEFAULT_FEED_CAPACITY)
    }

    /// Like [`open`](Self::open) with an explicit change-feed capacity.
    pub fn open_with_capacity(path: &str, feed_capacity: usize) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id            TEXT PRIMARY KEY,
                room_code     TEXT NOT NULL,
                moderator_id  TEXT NOT NULL,
                participants  TEXT NOT NULL DEFAULT '[]',
                current_story TEXT,
                voting_scale  TEXT NOT NULL,
                votes_visible INTEGER NOT NULL DEFAULT 0,
                is_active     INTEGER NOT NULL DEFAULT 1,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_room_code ON sessions(room_code);
            ",
        )
        .context("failed to create database schema")?;

        // Migration: add the revision column to databases created before the
        // cross-process change feed existed. Fails harmlessly when present.
        conn.execute_batch(
            "ALTER TABLE sessions ADD COLUMN revision INTEGER NOT NULL DEFAULT 0;",
        )
        .ok();

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_sessions_revision ON sessions(revision);",
        )
        .context("failed to create revision index")?;

        let cursor: i64 = conn
            .query_row("SELECT COALESCE(MAX(revision), 0) FROM sessions", [], |row| {
                row.get(0)
            })
            .context("failed to read latest revision")?;

        let (feed, _) = broadcast::channel(feed_capacity.max(1));

        Ok(Self {
            conn: Mutex::new(conn),
            feed,
            poll_cursor: Mutex::new(cursor),
            delivered: Mutex::new(HashSet::new()),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    fn delivered(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.delivered.lock().expect("delivered-set mutex poisoned")
    }

    /// Upsert a session row and return the revision it was stored under.
    ///
    /// Revisions are store-wide and strictly increasing, so a poller can ask
    /// for "everything after N". The revision is marked delivered before the
    /// connection is released so the poller never re-broadcasts it.
    fn write_session(&self, session: &Session) -> Result<i64> {
        let row = SessionRow::from_session(session, Utc::now())?;
        let conn = self.conn();
        let revision: i64 = conn
            .query_row(
                "INSERT INTO sessions
                    (id, room_code, moderator_id, participants, current_story, voting_scale,
                     votes_visible, is_active, created_at, updated_at, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     (SELECT COALESCE(MAX(revision), 0) + 1 FROM sessions))
                 ON CONFLICT(id) DO UPDATE SET
                    room_code     = excluded.room_code,
                    moderator_id  = excluded.moderator_id,
                    participants  = excluded.participants,
                    current_story = excluded.current_story,
                    voting_scale  = excluded.voting_scale,
                    votes_visible = excluded.votes_visible,
                    is_active     = excluded.is_active,
                    created_at    = excluded.created_at,
                    updated_at    = excluded.updated_at,
                    revision      = excluded.revision
                 RETURNING revision",
                params![
                    row.id,
                    row.room_code,
                    row.moderator_id,
                    row.participants,
                    row.current_story,
                    row.voting_scale,
                    row.votes_visible,
                    row.is_active,
                    format_timestamp(&row.created_at),
                    format_timestamp(&row.updated_at),
                ],
                |r| r.get(0),
            )
            .with_context(|| format!("failed to save session {}", session.id))?;
        self.delivered().insert(revision);
        Ok(revision)
    }

    /// Load the active session matching `column = value`.
    fn load_active(&self, column: &str, value: &str) -> Result<Option<Session>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sessions
             WHERE {column} = ?1 AND is_active = 1
             ORDER BY revision DESC LIMIT 1"
        );
        let row = conn
            .query_row(&sql, params![value], read_row)
            .optional()
            .with_context(|| format!("failed to query session by {column}"))?;
        drop(conn);

        row.map(|(row, _)| row.into_session()).transpose()
    }

    /// Load any session by id, active or not.
    pub fn load_any(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id],
                read_row,
            )
            .optional()
            .context("failed to query session by id")?;
        drop(conn);

        row.map(|(row, _)| row.into_session()).transpose()
    }

    /// Broadcast rows written since the last poll by other processes.
    ///
    /// Rows this process wrote itself were already broadcast by `save` and are
    /// skipped. Returns the number of snapshots broadcast.
    pub fn poll_changes(&self) -> Result<usize> {
        let mut cursor = self.poll_cursor.lock().expect("poll cursor mutex poisoned");
        let conn = self.conn();
        let rows = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM sessions
                     WHERE revision > ?1 ORDER BY revision"
                ))
                .context("failed to prepare change poll query")?;
            let rows = stmt
                .query_map(params![*cursor], read_row)
                .context("failed to poll session changes")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to map polled session rows")?;
            rows
        };
        let mut delivered = self.delivered();
        drop(conn);

        let mut broadcast_count = 0;
        for (row, revision) in rows {
            *cursor = (*cursor).max(revision);
            if delivered.remove(&revision) {
                continue;
            }
            let session_id = row.id.clone();
            match row.into_session() {
                Ok(session) => {
                    debug!("Polled change for session {session_id} at revision {revision}");
                    let _ = self.feed.send(session);
                    broadcast_count += 1;
                }
                Err(e) => warn!("Skipping unreadable session row {session_id}: {e:#}"),
            }
        }
        // Our own revisions that were overwritten before being polled never
        // show up in the query; forget them once the cursor passes them.
        let seen = *cursor;
        delivered.retain(|rev| *rev > seen);

        Ok(broadcast_count)
    }

    /// Spawn a task calling [`poll_changes`](Self::poll_changes) every
    /// `interval`. The task exits once the store is dropped.
    pub fn spawn_change_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Session store dropped, stopping change poller");
                    break;
                };
                if let Err(e) = store.poll_changes() {
                    warn!("Change poll failed: {e:#}");
                }
            }
        })
    }

    /// Number of live subscriptions on the change feed.
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn save(&self, session: &Session) -> Result<(), PokerError> {
        match self.write_session(session) {
            Ok(revision) => {
                debug!(
                    "Saved session {} (room {}) at revision {}",
                    session.id, session.room_code, revision
                );
                // No receivers is fine: nobody is watching this session yet.
                let _ = self.feed.send(session.clone());
                Ok(())
            }
            Err(e) => {
                error!("Failed to save session {}: {e:#}", session.id);
                Err(PokerError::Persistence(e))
            }
        }
    }

    async fn find_by_room_code(&self, room_code: &str) -> Option<Session> {
        let code = normalize_room_code(room_code);
        match self.load_active("room_code", &code) {
            Ok(found) => {
                if found.is_none() {
                    debug!("No active session with room code {code}");
                }
                found
            }
            Err(e) => {
                error!("Failed to fetch session by room code {code}: {e:#}");
                None
            }
        }
    }

    async fn find_by_id(&self, session_id: &str) -> Option<Session> {
        match self.load_active("id", session_id) {
            Ok(found) => found,
            Err(e) => {
                error!("Failed to fetch session {session_id}: {e:#}");
                None
            }
        }
    }

    fn subscribe(&self, session_id: &str) -> SessionSubscription {
        info!("Subscribing to changes for session {session_id}");
        SessionSubscription::new(session_id, self.feed.subscribe())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a row selected with [`SELECT_COLUMNS`] to a session row and its
/// revision.
fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(SessionRow, i64)> {
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok((
        SessionRow {
            id: row.get(0)?,
            room_code: row.get(1)?,
            moderator_id: row.get(2)?,
            participants: row.get(3)?,
            current_story: row.get(4)?,
            voting_scale: row.get(5)?,
            votes_visible: row.get(6)?,
            is_active: row.get(7)?,
            created_at: parse_timestamp(8, &created_at)?,
            updated_at: parse_timestamp(9, &updated_at)?,
        },
        row.get(10)?,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
