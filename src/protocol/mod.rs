//! Protocol definitions for client-server communication
//!
//! Every message is one UTF-8 line terminated by `\n`. Fields are separated by
//! `|`, records inside a list by `||`. Replies that carry a single scalar use
//! `TAG:value`.

mod message;

pub use message::{
    list_records, Command, CommandKind, Envelope, Greeting, LoginReply,
    Notice, Participant, Reply,
};

use thiserror::Error;

/// Port the server listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 5090;

/// Field separator
pub const FIELD_SEP: char = '|';

/// Record separator inside list payloads
pub const RECORD_SEP: &str = "||";

/// Greeting prefix used by a second connection to resume an existing session
pub const SESSION_AUTH: &str = "SESSION_AUTH";

/// Protocol-specific errors. `Display` is the reason sent after `FAIL:`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid command format")]
    InvalidFormat,

    #[error("Unknown command")]
    UnknownCommand,

    #[error("Invalid duration format")]
    InvalidDuration,

    #[error("Malformed login data")]
    MalformedLogin,

    #[error("Invalid user ID")]
    InvalidUserId,

    #[error("Invalid role")]
    InvalidRole,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Join fields with `|`
pub fn join_fields<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEP);
        }
        out.push_str(field.as_ref());
    }
    out
}

/// Join already-encoded records with `||`
pub fn join_records<I>(records: I) -> String
where
    I: IntoIterator<Item = String>,
{
    records.into_iter().collect::<Vec<_>>().join(RECORD_SEP)
}

/// Split a list body into records of fields
pub fn split_records(body: &str) -> Vec<Vec<&str>> {
    if body.is_empty() {
        return Vec::new();
    }
    body.split(RECORD_SEP)
        .map(|record| record.split(FIELD_SEP).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_split() {
        let a = join_fields(["T1", "Intro"]);
        let b = join_fields(["T2", "Advanced"]);
        let body = join_records([a, b]);
        assert_eq!(body, "T1|Intro||T2|Advanced");
        assert_eq!(
            split_records(&body),
            vec![vec!["T1", "Intro"], vec!["T2", "Advanced"]]
        );
        assert!(split_records("").is_empty());
    }

    #[test]
    fn test_error_reasons() {
        assert_eq!(ProtocolError::InvalidFormat.to_string(), "Invalid command format");
        assert_eq!(
            ProtocolError::InvalidDuration.to_string(),
            "Invalid duration format"
        );
    }
}
