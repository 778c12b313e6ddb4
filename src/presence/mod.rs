//! Presence and attendance tracking
//!
//! Each (chat session, student) pair moves between Absent and Present. Time
//! spent present is folded into `accumulated_secs` on every Present -> Absent
//! transition, so the total only ever grows.

use crate::store::{AttendanceRecord, Store, StoreResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One student's attendance as reported to the tutor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceReport {
    pub student_id: String,
    pub name: String,
    pub is_present: bool,
    pub first_join_time: Option<DateTime<Utc>>,
    pub last_seen_time: Option<DateTime<Utc>>,
    /// Seconds over completed visits
    pub total_secs: i64,
    /// `total_secs` plus the running visit, if any
    pub current_secs: i64,
}

/// Serializes attendance transitions on top of the store
pub struct PresenceTracker {
    store: Arc<dyn Store>,
    lock: Mutex<()>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Absent rows for every enrolled student
    pub async fn init_session(&self, chat_session_id: &str, tutorial_id: &str) -> StoreResult<usize> {
        let _guard = self.lock.lock().await;
        self.store.init_attendance(chat_session_id, tutorial_id)
    }

    /// Absent -> Present. A student already present is left untouched.
    pub async fn mark_present(
        &self,
        chat_session_id: &str,
        tutorial_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<AttendanceRecord> {
        let _guard = self.lock.lock().await;
        let mut record = self
            .store
            .attendance(chat_session_id, student_id)?
            .unwrap_or_else(|| AttendanceRecord::absent(chat_session_id, tutorial_id, student_id));

        if record.is_present {
            return Ok(record);
        }

        if record.first_join_time.is_none() {
            record.first_join_time = Some(now);
        }
        record.last_seen_time = Some(now);
        record.is_present = true;
        self.store.save_attendance(&record)?;

        tracing::debug!("{} present in chat {}", student_id, chat_session_id);
        Ok(record)
    }

    /// Present -> Absent. Missing or already absent records are left untouched.
    pub async fn mark_absent(
        &self,
        chat_session_id: &str,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<AttendanceRecord>> {
        let _guard = self.lock.lock().await;
        let Some(mut record) = self.store.attendance(chat_session_id, student_id)? else {
            return Ok(None);
        };
        if !record.is_present {
            return Ok(Some(record));
        }

        leave(&mut record, now);
        self.store.save_attendance(&record)?;

        tracing::debug!(
            "{} absent from chat {} ({}s total)",
            student_id,
            chat_session_id,
            record.accumulated_secs
        );
        Ok(Some(record))
    }

    /// Mark everyone still present as absent; used when the chat ends
    pub async fn close_out(&self, chat_session_id: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let _guard = self.lock.lock().await;
        let mut closed = 0;
        for mut record in self.store.attendance_for_session(chat_session_id)? {
            if record.is_present {
                leave(&mut record, now);
                self.store.save_attendance(&record)?;
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Attendance of every student recorded for the chat session
    pub async fn report(
        &self,
        chat_session_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<AttendanceReport>> {
        let _guard = self.lock.lock().await;
        let mut rows = Vec::new();
        for record in self.store.attendance_for_session(chat_session_id)? {
            let name = self
                .store
                .find_user(&record.student_id)?
                .map(|u| u.name)
                .unwrap_or_else(|| record.student_id.clone());
            rows.push(AttendanceReport {
                current_secs: current_secs(&record, now),
                student_id: record.student_id,
                name,
                is_present: record.is_present,
                first_join_time: record.first_join_time,
                last_seen_time: record.last_seen_time,
                total_secs: record.accumulated_secs,
            });
        }
        rows.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        Ok(rows)
    }
}

fn leave(record: &mut AttendanceRecord, now: DateTime<Utc>) {
    let since = record.last_seen_time.unwrap_or(now);
    record.accumulated_secs += (now - since).num_seconds().max(0);
    record.last_seen_time = Some(now);
    record.is_present = false;
}

/// Accumulated time plus the running visit
pub fn current_secs(record: &AttendanceRecord, now: DateTime<Utc>) -> i64 {
    match (record.is_present, record.last_seen_time) {
        (true, Some(since)) => record.accumulated_secs + (now - since).num_seconds().max(0),
        _ => record.accumulated_secs,
    }
}
