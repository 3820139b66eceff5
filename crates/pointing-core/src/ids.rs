// Room code and identifier allocation.

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::SessionStore;

/// Number of characters in a room code.
pub const ROOM_CODE_LEN: usize = 6;

const ROOM_CODE_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a random room code: [`ROOM_CODE_LEN`] characters of uppercase
/// `[0-9A-Z]`. Does not check for collisions; see [`allocate_room_code`].
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_CHARSET[rng.gen_range(0..ROOM_CODE_CHARSET.len())] as char)
        .collect()
}

/// Returns `true` if `code` has the shape of a room code.
pub fn is_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

/// Uppercase and trim user input so it can be compared against stored codes.
pub fn normalize_room_code(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

/// Generate an opaque identifier for a session or participant.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate an identifier for a user story.
pub fn generate_story_id() -> String {
    format!("story-{}", Uuid::new_v4().simple())
}

/// Pick a room code not used by any active session in `store`.
///
/// Tries up to `max_attempts` random codes. If every attempt collides the last
/// generated code is returned anyway; with 36^6 codes that only happens when
/// the store itself is failing lookups.
pub async fn allocate_room_code(store: &dyn SessionStore, max_attempts: u32) -> String {
    let mut code = generate_room_code();
    for attempt in 1..=max_attempts.max(1) {
        if store.find_by_room_code(&code).await.is_none() {
            debug!("Allocated room code {code} on attempt {attempt}");
            return code;
        }
        debug!("Room code {code} already in use, retrying");
        code = generate_room_code();
    }
    warn!("Room code allocation exhausted {max_attempts} attempts, using {code}");
    code
}
