// Library root for the pointing poker driver: command parsing, the event
// loop and text rendering. `main.rs` wires them to stdin and stdout.

pub mod app;
pub mod command;
pub mod protocol;
pub mod view;
