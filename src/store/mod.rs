//! Persistence collaborator - users, tutorials, assignments, active chats, attendance
//!
//! The server only talks to the [`Store`] trait. Two implementations ship with
//! the crate: [`MemoryStore`] (tests, throwaway servers) and [`SqliteStore`].

mod memory;
mod model;
mod sqlite;

pub use memory::MemoryStore;
pub use model::{ActiveChat, AttendanceRecord, Member, NewUser, Role, Tutorial, User};
pub use sqlite::SqliteStore;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} already exists: {1}")]
    AlreadyExists(&'static str, String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Data-access interface used by the command handlers, presence tracker and timer.
///
/// Calls are synchronous and expected to be quick; every implementation must be
/// safe to share between connection tasks.
pub trait Store: Send + Sync {
    fn find_user(&self, id: &str) -> StoreResult<Option<User>>;

    /// Fails with [`StoreError::AlreadyExists`] if the id is taken
    fn create_user(&self, user: NewUser) -> StoreResult<User>;

    fn user_role(&self, id: &str) -> StoreResult<Option<Role>> {
        Ok(self.find_user(id)?.map(|u| u.role))
    }

    fn create_tutorial(&self, id: &str, name: &str) -> StoreResult<Tutorial>;

    fn find_tutorial(&self, id: &str) -> StoreResult<Option<Tutorial>>;

    /// Fails with [`StoreError::AlreadyExists`] if the pair is already assigned
    fn assign_user(&self, user_id: &str, tutorial_id: &str) -> StoreResult<()>;

    fn is_tutor_already_assigned(&self, tutorial_id: &str) -> StoreResult<bool>;

    fn tutorials_for_user(&self, user_id: &str) -> StoreResult<Vec<Tutorial>>;

    fn students_in_tutorial(&self, tutorial_id: &str) -> StoreResult<Vec<Member>>;

    fn is_enrolled(&self, user_id: &str, tutorial_id: &str) -> StoreResult<bool> {
        Ok(self
            .tutorials_for_user(user_id)?
            .iter()
            .any(|t| t.id == tutorial_id))
    }

    /// Creates the active chat of a tutorial. Returns `None` if one is already active.
    fn start_chat(
        &self,
        tutorial_id: &str,
        tutor_id: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ActiveChat>>;

    fn active_chat(&self, tutorial_id: &str) -> StoreResult<Option<ActiveChat>>;

    /// Returns whether an active chat was removed
    fn end_chat(&self, tutorial_id: &str) -> StoreResult<bool>;

    /// Drops every active chat record; rooms do not survive a restart
    fn clear_active_chats(&self) -> StoreResult<usize>;

    /// Creates absent rows for every student enrolled in the tutorial
    fn init_attendance(&self, chat_session_id: &str, tutorial_id: &str) -> StoreResult<usize>;

    fn attendance(
        &self,
        chat_session_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<AttendanceRecord>>;

    /// Inserts or replaces the record keyed by (chat_session_id, student_id)
    fn save_attendance(&self, record: &AttendanceRecord) -> StoreResult<()>;

    fn attendance_for_session(&self, chat_session_id: &str)
        -> StoreResult<Vec<AttendanceRecord>>;
}

/// Ids travel inside pipe-delimited messages, so they are restricted to a safe alphabet
pub fn is_valid_id(id: &str) -> bool {
    static ID_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    ID_PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,50}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(id))
}

/// DiceBear avatar reference for a user
pub fn avatar_url(style: &str, user_id: &str) -> String {
    format!("https://api.dicebear.com/6.x/{}/png?seed={}", style, user_id)
}
