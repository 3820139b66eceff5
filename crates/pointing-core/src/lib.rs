// Library root: the session synchronization engine behind the pointing poker
// driver. Re-exports all modules so integration tests and the binary can
// reach the public API.

pub mod anchor;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod intent;
pub mod model;
pub mod reconciler;
pub mod route;
pub mod row;
pub mod scale;
pub mod tally;
