//! In-memory store

use super::{
    ActiveChat, AttendanceRecord, Member, NewUser, Role, Store, StoreError, StoreResult, Tutorial,
    User,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: BTreeMap<String, User>,
    tutorials: BTreeMap<String, Tutorial>,
    /// (tutorial_id, user_id)
    assignments: BTreeSet<(String, String)>,
    active_chats: BTreeMap<String, ActiveChat>,
    /// keyed by (chat_session_id, student_id)
    attendance: BTreeMap<(String, String), AttendanceRecord>,
}

/// Store backed by in-process maps. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn find_user(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(self.tables()?.users.get(id).cloned())
    }

    fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let mut tables = self.tables()?;
        if tables.users.contains_key(&user.id) {
            return Err(StoreError::AlreadyExists("User", user.id));
        }
        let user = User::from(user);
        tables.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    fn create_tutorial(&self, id: &str, name: &str) -> StoreResult<Tutorial> {
        let mut tables = self.tables()?;
        if tables.tutorials.contains_key(id) {
            return Err(StoreError::AlreadyExists("Tutorial", id.to_string()));
        }
        let tutorial = Tutorial {
            id: id.to_string(),
            name: name.to_string(),
        };
        tables.tutorials.insert(id.to_string(), tutorial.clone());
        Ok(tutorial)
    }

    fn find_tutorial(&self, id: &str) -> StoreResult<Option<Tutorial>> {
        Ok(self.tables()?.tutorials.get(id).cloned())
    }

    fn assign_user(&self, user_id: &str, tutorial_id: &str) -> StoreResult<()> {
        let mut tables = self.tables()?;
        if !tables.users.contains_key(user_id) {
            return Err(StoreError::NotFound("User", user_id.to_string()));
        }
        if !tables.tutorials.contains_key(tutorial_id) {
            return Err(StoreError::NotFound("Tutorial", tutorial_id.to_string()));
        }
        let inserted = tables
            .assignments
            .insert((tutorial_id.to_string(), user_id.to_string()));
        if !inserted {
            return Err(StoreError::AlreadyExists(
                "Assignment",
                format!("{} -> {}", user_id, tutorial_id),
            ));
        }
        Ok(())
    }

    fn is_tutor_already_assigned(&self, tutorial_id: &str) -> StoreResult<bool> {
        let tables = self.tables()?;
        Ok(tables
            .assignments
            .iter()
            .filter(|(tid, _)| tid == tutorial_id)
            .any(|(_, uid)| {
                tables
                    .users
                    .get(uid)
                    .is_some_and(|u| u.role == Role::Tutor)
            }))
    }

    fn tutorials_for_user(&self, user_id: &str) -> StoreResult<Vec<Tutorial>> {
        let tables = self.tables()?;
        Ok(tables
            .assignments
            .iter()
            .filter(|(_, uid)| uid == user_id)
            .filter_map(|(tid, _)| tables.tutorials.get(tid).cloned())
            .collect())
    }

    fn students_in_tutorial(&self, tutorial_id: &str) -> StoreResult<Vec<Member>> {
        let tables = self.tables()?;
        Ok(tables
            .assignments
            .iter()
            .filter(|(tid, _)| tid == tutorial_id)
            .filter_map(|(_, uid)| tables.users.get(uid))
            .filter(|u| u.role == Role::Student)
            .map(|u| Member {
                id: u.id.clone(),
                name: u.name.clone(),
            })
            .collect())
    }

    fn start_chat(
        &self,
        tutorial_id: &str,
        tutor_id: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ActiveChat>> {
        let mut tables = self.tables()?;
        if tables.active_chats.contains_key(tutorial_id) {
            return Ok(None);
        }
        let chat = ActiveChat {
            tutorial_id: tutorial_id.to_string(),
            tutor_id: tutor_id.to_string(),
            chat_session_id: Uuid::new_v4().to_string(),
            start_time: now,
            end_time: now + duration,
        };
        tables
            .active_chats
            .insert(tutorial_id.to_string(), chat.clone());
        Ok(Some(chat))
    }

    fn active_chat(&self, tutorial_id: &str) -> StoreResult<Option<ActiveChat>> {
        Ok(self.tables()?.active_chats.get(tutorial_id).cloned())
    }

    fn end_chat(&self, tutorial_id: &str) -> StoreResult<bool> {
        Ok(self.tables()?.active_chats.remove(tutorial_id).is_some())
    }

    fn clear_active_chats(&self) -> StoreResult<usize> {
        let mut tables = self.tables()?;
        let count = tables.active_chats.len();
        tables.active_chats.clear();
        Ok(count)
    }

    fn init_attendance(&self, chat_session_id: &str, tutorial_id: &str) -> StoreResult<usize> {
        let students = self.students_in_tutorial(tutorial_id)?;
        let mut tables = self.tables()?;
        let mut created = 0;
        for student in students {
            let key = (chat_session_id.to_string(), student.id.clone());
            if tables.attendance.contains_key(&key) {
                continue;
            }
            tables.attendance.insert(
                key,
                AttendanceRecord::absent(chat_session_id, tutorial_id, &student.id),
            );
            created += 1;
        }
        Ok(created)
    }

    fn attendance(
        &self,
        chat_session_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<AttendanceRecord>> {
        let key = (chat_session_id.to_string(), student_id.to_string());
        Ok(self.tables()?.attendance.get(&key).cloned())
    }

    fn save_attendance(&self, record: &AttendanceRecord) -> StoreResult<()> {
        let key = (record.chat_session_id.clone(), record.student_id.clone());
        self.tables()?.attendance.insert(key, record.clone());
        Ok(())
    }

    fn attendance_for_session(
        &self,
        chat_session_id: &str,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        Ok(self
            .tables()?
            .attendance
            .values()
            .filter(|r| r.chat_session_id == chat_session_id)
            .cloned()
            .collect())
    }
}
