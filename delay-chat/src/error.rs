//! Errors reported back to clients.
//!
//! Every failure a client can cause is a [`UserError`]; malformed lines are a
//! [`ParseError`] wrapped inside it. Both map to a wire reply whose command is
//! the severity and whose `PROBLEM` argument is a stable error-kind token.
//! Transport failures never show up here: they end the connection instead.

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fail,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fail => "FAIL",
        }
    }
}

/// A line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("multiple commands in one line")]
    MultipleCommands,
    #[error("argument key {0:?} must consist of ASCII letters")]
    InvalidKeyword(String),
    #[error("{0} is an unknown escape sequence")]
    UnknownEscape(String),
    #[error("argument key {0} appears more than once")]
    KeyCollision(String),
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

impl ParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::MultipleCommands => "ERR_MULTIPLE_CMDS",
            ParseError::InvalidKeyword(_) => "ERR_INVALID_KEYWORD",
            ParseError::UnknownEscape(_) => "ERR_UNKNOWN_ESCAPE",
            ParseError::KeyCollision(_) => "ERR_REDUNDANT_KEYS",
            ParseError::InvalidUtf8 => "ERR_INVALID_UTF8",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{0} is an unknown command")]
    UnknownCommand(String),
    #[error("{command} requires an argument with the key {key}")]
    MissingArgument {
        command: &'static str,
        key: &'static str,
    },
    #[error("you must log in before using {0}")]
    NotLoggedIn(&'static str),
    #[error("you are already logged in as {0}")]
    AlreadyLoggedIn(String),
    // Unknown account and wrong password share this message on purpose.
    #[error("invalid username or password")]
    LoginFailed,
    #[error("the target {0} does not exist")]
    NonexistentTarget(String),
    #[error("{0}")]
    Undeliverable(String),
}

impl UserError {
    pub fn severity(&self) -> Severity {
        match self {
            UserError::LoginFailed => Severity::Fail,
            _ => Severity::Error,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UserError::Parse(err) => err.kind(),
            UserError::UnknownCommand(_) => "ERR_UNKNOWN_COMMAND",
            UserError::MissingArgument { .. } => "ERR_MISSING_ARGUMENT",
            UserError::NotLoggedIn(_) => "ERR_NOT_LOGGED_IN",
            UserError::AlreadyLoggedIn(_) => "ERR_ALREADY_LOGGED_IN",
            UserError::LoginFailed => "ERR_LOGIN_FAILED",
            UserError::NonexistentTarget(_) => "ERR_NONEXISTENT_TARGET",
            UserError::Undeliverable(_) => "ERR_MSG_UNDELIVERABLE",
        }
    }

    /// Builds the reply line sent to the session that caused the error.
    pub fn to_reply(&self, label: Option<&str>) -> Message {
        Message::new(self.severity().as_str())
            .with("PROBLEM", self.kind())
            .with("COMMENT", self.to_string())
            .with_opt("LABEL", label)
    }
}
