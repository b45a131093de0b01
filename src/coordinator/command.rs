//! Client line protocol: command classification and fixed response lines

use std::borrow::Cow;

/// Prefix that marks a command as a write (matched case-insensitively)
pub const WRITE_PREFIX: &str = "PUT";

/// Leading token of a successful storage engine or peer response
pub const SUCCESS_TOKEN: &str = "OK";

/// Command that authenticates a replication link when a shared secret is set
pub const AUTH_COMMAND: &str = "AUTH";

pub const ERR_WRITE_ON_SECONDARY: &str =
    "ERROR: Write operations are only allowed on the primary node.";
pub const ERR_INTERNAL: &str = "ERROR: Could not process command internally.";
pub const ERR_REPLICATION_FAILED: &str =
    "ERROR: Write succeeded locally but failed to replicate to secondary.";
pub const ERR_AUTH_FAILED: &str = "ERROR: Authentication failed.";
pub const ERR_INVALID_ENCODING: &str = "ERROR: Command is not valid UTF-8.";
pub const OK_AUTHENTICATED: &str = "OK: Authenticated.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Write,
    Read,
}

impl CommandKind {
    /// Classify a trimmed command line
    pub fn classify(command: &str) -> Self {
        let is_write = command
            .as_bytes()
            .get(..WRITE_PREFIX.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(WRITE_PREFIX.as_bytes()));

        if is_write {
            CommandKind::Write
        } else {
            CommandKind::Read
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, CommandKind::Write)
    }
}

/// Does a storage engine or peer response report success?
pub fn is_success(response: &str) -> bool {
    response.starts_with(SUCCESS_TOKEN)
}

/// Secret carried by an `AUTH <secret>` line, if the line is one
pub fn auth_secret(command: &str) -> Option<&str> {
    let (verb, rest) = match command.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (command, ""),
    };
    verb.eq_ignore_ascii_case(AUTH_COMMAND).then_some(rest)
}

/// Command as it may appear in logs: `AUTH` secrets are masked
pub fn loggable(command: &str) -> Cow<'_, str> {
    match auth_secret(command) {
        Some(_) => Cow::Owned(format!("{} ***", AUTH_COMMAND)),
        None => Cow::Borrowed(command),
    }
}
