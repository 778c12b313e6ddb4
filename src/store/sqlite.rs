//! SQLite store
//!
//! Times are kept as INTEGER unix seconds.

use super::model::{from_secs, to_secs};
use super::{
    ActiveChat, AttendanceRecord, Member, NewUser, Role, Store, StoreError, StoreResult, Tutorial,
    User,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Store backed by a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Private in-memory database, gone when the store is dropped
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file path, `None` for an in-memory store
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

/// Create tables if they do not exist yet
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            avatar_url TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS tutorials (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS assignments (
            user_id TEXT NOT NULL REFERENCES users(id),
            tutorial_id TEXT NOT NULL REFERENCES tutorials(id),
            PRIMARY KEY (user_id, tutorial_id)
        );

        CREATE TABLE IF NOT EXISTS active_chats (
            tutorial_id TEXT PRIMARY KEY REFERENCES tutorials(id),
            tutor_id TEXT NOT NULL,
            chat_session_id TEXT NOT NULL UNIQUE,
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attendance (
            chat_session_id TEXT NOT NULL,
            tutorial_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            first_join_time INTEGER,
            last_seen_time INTEGER,
            accumulated_secs INTEGER NOT NULL DEFAULT 0,
            is_present INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (chat_session_id, student_id)
        );

        CREATE INDEX IF NOT EXISTS idx_assignments_tutorial ON assignments(tutorial_id);",
    )
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.and_then(from_secs))
}

fn required_time(secs: i64, column: &str) -> StoreResult<DateTime<Utc>> {
    from_secs(secs).ok_or_else(|| StoreError::Corrupt(format!("{} out of range: {}", column, secs)))
}

fn parse_role(raw: &str) -> StoreResult<Role> {
    raw.parse()
        .map_err(|bad| StoreError::Corrupt(format!("unknown role '{}'", bad)))
}

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        chat_session_id: row.get(0)?,
        tutorial_id: row.get(1)?,
        student_id: row.get(2)?,
        first_join_time: time_column(row, 3)?,
        last_seen_time: time_column(row, 4)?,
        accumulated_secs: row.get(5)?,
        is_present: row.get(6)?,
    })
}

const ATTENDANCE_COLUMNS: &str = "chat_session_id, tutorial_id, student_id, first_join_time, \
     last_seen_time, accumulated_secs, is_present";

impl Store for SqliteStore {
    fn find_user(&self, id: &str) -> StoreResult<Option<User>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, password_hash, role, avatar_url FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, name, password_hash, role, avatar_url)| {
            Ok(User {
                id,
                name,
                password_hash,
                role: parse_role(&role)?,
                avatar_url,
            })
        })
        .transpose()
    }

    fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, name, password_hash, role, avatar_url)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.name,
                user.password_hash,
                user.role.as_str(),
                user.avatar_url
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists("User", user.id));
        }
        Ok(User::from(user))
    }

    fn create_tutorial(&self, id: &str, name: &str) -> StoreResult<Tutorial> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tutorials (id, name) VALUES (?1, ?2)",
            params![id, name],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists("Tutorial", id.to_string()));
        }
        Ok(Tutorial {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    fn find_tutorial(&self, id: &str) -> StoreResult<Option<Tutorial>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id, name FROM tutorials WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Tutorial {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    fn assign_user(&self, user_id: &str, tutorial_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let user_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![user_id],
            |row| row.get(0),
        )?;
        if !user_exists {
            return Err(StoreError::NotFound("User", user_id.to_string()));
        }
        let tutorial_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tutorials WHERE id = ?1)",
            params![tutorial_id],
            |row| row.get(0),
        )?;
        if !tutorial_exists {
            return Err(StoreError::NotFound("Tutorial", tutorial_id.to_string()));
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO assignments (user_id, tutorial_id) VALUES (?1, ?2)",
            params![user_id, tutorial_id],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(
                "Assignment",
                format!("{} -> {}", user_id, tutorial_id),
            ));
        }
        Ok(())
    }

    fn is_tutor_already_assigned(&self, tutorial_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM assignments a JOIN users u ON u.id = a.user_id
                WHERE a.tutorial_id = ?1 AND u.role = 'tutor'
            )",
            params![tutorial_id],
            |row| row.get(0),
        )?)
    }

    fn tutorials_for_user(&self, user_id: &str) -> StoreResult<Vec<Tutorial>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name FROM tutorials t
             JOIN assignments a ON a.tutorial_id = t.id
             WHERE a.user_id = ?1
             ORDER BY t.id",
        )?;
        let tutorials = stmt
            .query_map(params![user_id], |row| {
                Ok(Tutorial {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tutorials)
    }

    fn students_in_tutorial(&self, tutorial_id: &str) -> StoreResult<Vec<Member>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name FROM users u
             JOIN assignments a ON a.user_id = u.id
             WHERE a.tutorial_id = ?1 AND u.role = 'student'
             ORDER BY u.id",
        )?;
        let members = stmt
            .query_map(params![tutorial_id], |row| {
                Ok(Member {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    fn start_chat(
        &self,
        tutorial_id: &str,
        tutor_id: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ActiveChat>> {
        let chat = ActiveChat {
            tutorial_id: tutorial_id.to_string(),
            tutor_id: tutor_id.to_string(),
            chat_session_id: Uuid::new_v4().to_string(),
            start_time: now,
            end_time: now + duration,
        };

        let conn = self.conn()?;
        // The primary key on tutorial_id makes the insert the existence check
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO active_chats
                (tutorial_id, tutor_id, chat_session_id, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chat.tutorial_id,
                chat.tutor_id,
                chat.chat_session_id,
                to_secs(chat.start_time),
                to_secs(chat.end_time)
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(chat))
    }

    fn active_chat(&self, tutorial_id: &str) -> StoreResult<Option<ActiveChat>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT tutorial_id, tutor_id, chat_session_id, start_time, end_time
                 FROM active_chats WHERE tutorial_id = ?1",
                params![tutorial_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(tutorial_id, tutor_id, chat_session_id, start, end)| {
            Ok(ActiveChat {
                tutorial_id,
                tutor_id,
                chat_session_id,
                start_time: required_time(start, "start_time")?,
                end_time: required_time(end, "end_time")?,
            })
        })
        .transpose()
    }

    fn end_chat(&self, tutorial_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM active_chats WHERE tutorial_id = ?1",
            params![tutorial_id],
        )?;
        Ok(removed > 0)
    }

    fn clear_active_chats(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM active_chats", [])?)
    }

    fn init_attendance(&self, chat_session_id: &str, tutorial_id: &str) -> StoreResult<usize> {
        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO attendance (chat_session_id, tutorial_id, student_id)
             SELECT ?1, a.tutorial_id, a.user_id FROM assignments a
             JOIN users u ON u.id = a.user_id
             WHERE a.tutorial_id = ?2 AND u.role = 'student'",
            params![chat_session_id, tutorial_id],
        )?;
        Ok(created)
    }

    fn attendance(
        &self,
        chat_session_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<AttendanceRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM attendance WHERE chat_session_id = ?1 AND student_id = ?2",
            ATTENDANCE_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![chat_session_id, student_id], attendance_from_row)
            .optional()?)
    }

    fn save_attendance(&self, record: &AttendanceRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO attendance
                (chat_session_id, tutorial_id, student_id, first_join_time,
                 last_seen_time, accumulated_secs, is_present)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(chat_session_id, student_id) DO UPDATE SET
                tutorial_id = excluded.tutorial_id,
                first_join_time = excluded.first_join_time,
                last_seen_time = excluded.last_seen_time,
                accumulated_secs = excluded.accumulated_secs,
                is_present = excluded.is_present",
            params![
                record.chat_session_id,
                record.tutorial_id,
                record.student_id,
                record.first_join_time.map(to_secs),
                record.last_seen_time.map(to_secs),
                record.accumulated_secs,
                record.is_present
            ],
        )?;
        Ok(())
    }

    fn attendance_for_session(
        &self,
        chat_session_id: &str,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM attendance WHERE chat_session_id = ?1 ORDER BY student_id",
            ATTENDANCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![chat_session_id], attendance_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
