//! Command validation applied before a health check is persisted.
//!
//! Two independent filters must both pass: the trimmed command has to start
//! with an allow-listed verb, and it must not contain any shell
//! metacharacter. The verb match is a plain string-prefix test, so
//! `"pingx"` is accepted because it starts with `"ping"`. Existing stored
//! definitions may rely on that, so it is kept as is.

use thiserror::Error;

/// Verbs a command may start with.
pub const COMMAND_WHITELIST: &[&str] = &["ping", "nslookup", "wget", "echo"];

/// Characters that would let a command escape `sh -c` into a second command.
pub const SHELL_METACHARACTERS: &[char] = &[';', '|', '`', '&', '<', '>'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRejected {
    #[error("empty command")]
    Empty,

    #[error("command is not whitelisted; must start with one of: {}", COMMAND_WHITELIST.join(", "))]
    NotWhitelisted,

    #[error("command contains forbidden shell metacharacters")]
    ForbiddenMetacharacters,
}

/// Accept or reject `command`.
pub fn validate(command: &str) -> Result<(), CommandRejected> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(CommandRejected::Empty);
    }

    if !COMMAND_WHITELIST.iter().any(|verb| trimmed.starts_with(verb)) {
        return Err(CommandRejected::NotWhitelisted);
    }

    if trimmed.contains(SHELL_METACHARACTERS) {
        return Err(CommandRejected::ForbiddenMetacharacters);
    }

    Ok(())
}
