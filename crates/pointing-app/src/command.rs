// Line-oriented command parsing.

use thiserror::Error;

use crate::protocol::UserCommand;

pub const HELP: &str = "\
commands:
  create <name> [| <scale>]       start a session as moderator
  join <code|/room/CODE> <name>   join a session
  vote <value>                    vote on the current story
  reveal                          show or hide votes (moderator)
  reset                           clear all votes (moderator)
  scale <name>                    change the voting scale (moderator)
  next                            move to the next story (moderator)
  complete                        record the estimate and move on (moderator)
  story <title> [| <description>] edit the current story (moderator)
  add <title> [| <description>]   add a story (moderator)
  observer <name|id>              toggle observer role (moderator)
  remove <name|id>                remove a participant (moderator)
  show                            print the session
  leave                           leave the session
  quit                            exit";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command `{0}`, type `help` for a list")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<UserCommand>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    let cmd = match head.to_ascii_lowercase().as_str() {
        "create" => {
            let (name, scale) = split_pipe(rest);
            UserCommand::Create {
                name: required(name, "create <name> [| <scale>]")?,
                scale,
            }
        }
        "join" => {
            let usage = "join <code|/room/CODE> <name>";
            let (code, name) = rest
                .split_once(char::is_whitespace)
                .ok_or(CommandError::Usage(usage))?;
            UserCommand::Join {
                room_code: code.to_string(),
                name: required(name.trim(), usage)?,
            }
        }
        "vote" => UserCommand::Vote {
            value: required(rest, "vote <value>")?,
        },
        "reveal" => UserCommand::Reveal,
        "reset" => UserCommand::Reset,
        "scale" => UserCommand::Scale {
            name: required(rest, "scale <name>")?,
        },
        "next" => UserCommand::Next,
        "complete" => UserCommand::Complete,
        "story" => {
            let (title, description) = split_pipe(rest);
            UserCommand::EditStory {
                title: required(title, "story <title> [| <description>]")?,
                description,
            }
        }
        "add" => {
            let (title, description) = split_pipe(rest);
            UserCommand::AddStory {
                title: required(title, "add <title> [| <description>]")?,
                description,
            }
        }
        "observer" => UserCommand::ToggleObserver {
            who: required(rest, "observer <name|id>")?,
        },
        "remove" => UserCommand::Remove {
            who: required(rest, "remove <name|id>")?,
        },
        "show" => UserCommand::Show,
        "leave" => UserCommand::Leave,
        "help" | "?" => UserCommand::Help,
        "quit" | "exit" => UserCommand::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

fn required(value: &str, usage: &'static str) -> Result<String, CommandError> {
    if value.is_empty() {
        Err(CommandError::Usage(usage))
    } else {
        Ok(value.to_string())
    }
}

/// Split `a | b` into `("a", Some("b"))`. A missing or blank right side is
/// `None`.
fn split_pipe(input: &str) -> (&str, Option<String>) {
    match input.split_once('|') {
        Some((left, right)) => {
            let right = right.trim();
            (left.trim(), (!right.is_empty()).then(|| right.to_string()))
        }
        None => (input.trim(), None),
    }
}
