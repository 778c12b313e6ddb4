//! Records held by the persistence store

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// User role, selects the command table a connection is served with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Tutor,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Tutor => "tutor",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "tutor" => Ok(Role::Tutor),
            "student" => Ok(Role::Student),
            other => Err(other.to_string()),
        }
    }
}

/// A registered user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub password_hash: String,
    pub role: Role,
    pub avatar_url: String,
}

/// Input for [`crate::store::Store::create_user`]. The password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub name: String,
    pub password_hash: String,
    pub role: Role,
    pub avatar_url: String,
}

impl From<NewUser> for User {
    fn from(new: NewUser) -> Self {
        Self {
            id: new.id,
            name: new.name,
            password_hash: new.password_hash,
            role: new.role,
            avatar_url: new.avatar_url,
        }
    }
}

/// Id and name pair used in listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tutorial {
    pub id: String,
    pub name: String,
}

/// Id and name of a user enrolled in a tutorial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub name: String,
}

/// The single running chat session of a tutorial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChat {
    pub tutorial_id: String,
    pub tutor_id: String,
    pub chat_session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ActiveChat {
    /// Whole seconds left until `end_time`, never negative
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }
}

/// Presence bookkeeping for one student in one chat session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub chat_session_id: String,
    pub tutorial_id: String,
    pub student_id: String,
    pub first_join_time: Option<DateTime<Utc>>,
    pub last_seen_time: Option<DateTime<Utc>>,
    /// Seconds spent present over all completed visits
    pub accumulated_secs: i64,
    pub is_present: bool,
}

impl AttendanceRecord {
    /// A row for a student who has not joined yet
    pub fn absent(chat_session_id: &str, tutorial_id: &str, student_id: &str) -> Self {
        Self {
            chat_session_id: chat_session_id.to_string(),
            tutorial_id: tutorial_id.to_string(),
            student_id: student_id.to_string(),
            first_join_time: None,
            last_seen_time: None,
            accumulated_secs: 0,
            is_present: false,
        }
    }
}

/// Truncate to whole seconds, the precision the stores keep
pub(crate) fn to_secs(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}

pub(crate) fn from_secs(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}
