// Join-by-link paths: `/room/<CODE>`.

use crate::ids::{is_room_code, normalize_room_code};

const ROOM_PREFIX: &str = "/room/";

/// A join link parsed from a path: the room code to prefill and the path the
/// location should be rewritten to so a reload does not re-trigger the join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinLink {
    pub room_code: String,
    pub rewritten_path: &'static str,
}

/// Parse `/room/ABC123` into a join link. Only exact six-character
/// uppercase alphanumeric codes match; anything else is not a join link.
pub fn parse_join_path(path: &str) -> Option<JoinLink> {
    let code = path.strip_prefix(ROOM_PREFIX)?;
    if !is_room_code(code) {
        return None;
    }
    Some(JoinLink {
        room_code: code.to_string(),
        rewritten_path: "/",
    })
}

/// The shareable path for a room.
pub fn share_path(room_code: &str) -> String {
    format!("{ROOM_PREFIX}{}", normalize_room_code(room_code))
}

/// Accept either a bare room code or a join path. Used by the driver's
/// `join` command.
pub fn room_code_from_input(input: &str) -> String {
    let input = input.trim();
    match parse_join_path(input) {
        Some(link) => link.room_code,
        None => normalize_room_code(input),
    }
}
