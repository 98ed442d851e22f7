//! Special commands parser for interactive chat
//!
//! Lines starting with `/` control the session instead of being sent to
//! the model:
//! - Start a new session or branch the current one
//! - Switch to another stored session
//! - Rename or pin the current session
//! - Display help and exit
//!
//! Commands are case-insensitive; arguments keep their case.

use thiserror::Error;

/// Errors that can occur when parsing special commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown command was entered
    #[error("Unknown command: {0}\n\nType '/help' to see available commands")]
    UnknownCommand(String),

    /// Command requires an argument but none was provided
    #[error("Command {command} requires an argument\n\nUsage: {usage}")]
    MissingArgument { command: String, usage: String },
}

/// Special commands that can be executed during interactive chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialCommand {
    /// Start a fresh session on the next message
    New,

    /// Branch the current session into a new one
    ///
    /// With a message id prefix, the fork ends at that message.
    Fork(Option<String>),

    /// Continue a stored session
    Resume(String),

    /// Rename the current session
    Rename(String),

    /// Toggle the pinned flag of the current session
    Pin,

    /// Display help information
    Help,

    /// Exit the interactive session
    Exit,

    /// Not a special command; send the line to the model
    None,
}

/// Parse a user input string into a special command
///
/// # Errors
///
/// Returns `CommandError::UnknownCommand` for an unrecognized `/` command
/// and `CommandError::MissingArgument` when a required argument is absent.
///
/// # Examples
///
/// ```
/// use chatflow::commands::special_commands::{parse_special_command, SpecialCommand};
///
/// assert_eq!(parse_special_command("/new").unwrap(), SpecialCommand::New);
/// assert_eq!(
///     parse_special_command("/fork 1a2b3c4d").unwrap(),
///     SpecialCommand::Fork(Some("1a2b3c4d".to_string()))
/// );
/// assert_eq!(parse_special_command("hello").unwrap(), SpecialCommand::None);
/// assert!(parse_special_command("/foo").is_err());
/// ```
pub fn parse_special_command(input: &str) -> Result<SpecialCommand, CommandError> {
    let trimmed = input.trim();
    let lower = trimmed.to_lowercase();

    if !trimmed.starts_with('/') && lower != "exit" && lower != "quit" {
        return Ok(SpecialCommand::None);
    }

    let (command, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command.to_lowercase(), rest.trim()),
        None => (lower.clone(), ""),
    };

    match command.as_str() {
        "/new" => Ok(SpecialCommand::New),
        "/fork" if arg.is_empty() => Ok(SpecialCommand::Fork(None)),
        "/fork" => Ok(SpecialCommand::Fork(Some(arg.to_string()))),
        "/resume" if arg.is_empty() => Err(CommandError::MissingArgument {
            command: "/resume".to_string(),
            usage: "/resume <session_id>".to_string(),
        }),
        "/resume" => Ok(SpecialCommand::Resume(arg.to_string())),
        "/rename" if arg.is_empty() => Err(CommandError::MissingArgument {
            command: "/rename".to_string(),
            usage: "/rename <title>".to_string(),
        }),
        "/rename" => Ok(SpecialCommand::Rename(arg.to_string())),
        "/pin" => Ok(SpecialCommand::Pin),
        "/help" | "/?" => Ok(SpecialCommand::Help),
        "/exit" | "/quit" | "exit" | "quit" => Ok(SpecialCommand::Exit),
        _ => Err(CommandError::UnknownCommand(trimmed.to_string())),
    }
}

/// Print the special command reference
pub fn print_help() {
    println!(
        r#"
Special Commands for Interactive Chat
=====================================

SESSIONS:
  /new              - Start a new session with the next message
  /fork [MSG_ID]    - Branch the current session (optionally up to a message)
  /resume <ID>      - Continue a stored session (full id or prefix)
  /rename <TITLE>   - Rename the current session
  /pin              - Pin or unpin the current session

OTHER:
  /help             - Show this help message
  /exit, exit, quit - Leave chat

While a response is streaming, press Ctrl-C to stop it. The partial
response stays in the session and is not counted against your quota.
"#
    );
}
