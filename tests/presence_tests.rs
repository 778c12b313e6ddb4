//! Integration tests for presence and attendance accounting

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use tutorchat::presence::{current_secs, PresenceTracker};
use tutorchat::store::{MemoryStore, NewUser, Role, Store};

const CHAT: &str = "chat-1";

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn tracker() -> (Arc<dyn Store>, PresenceTracker) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.create_tutorial("T1", "Intro").unwrap();
    for (id, name) in [("S1", "Ana"), ("S2", "Ben")] {
        store
            .create_user(NewUser {
                id: id.to_string(),
                name: name.to_string(),
                password_hash: String::new(),
                role: Role::Student,
                avatar_url: String::new(),
            })
            .unwrap();
        store.assign_user(id, "T1").unwrap();
    }
    let tracker = PresenceTracker::new(Arc::clone(&store));
    (store, tracker)
}

#[tokio::test]
async fn test_init_session_creates_absent_rows() {
    let (store, tracker) = tracker();
    assert_eq!(tracker.init_session(CHAT, "T1").await.unwrap(), 2);

    let rows = tracker.report(CHAT, t0()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| !r.is_present && r.total_secs == 0));
    assert_eq!(rows[0].name, "Ana");
    assert!(store.attendance(CHAT, "S2").unwrap().is_some());
}

#[tokio::test]
async fn test_rejoin_keeps_accumulated_time() {
    let (_store, tracker) = tracker();
    tracker.init_session(CHAT, "T1").await.unwrap();

    let first = tracker.mark_present(CHAT, "T1", "S1", t0()).await.unwrap();
    assert!(first.is_present);
    assert_eq!(first.first_join_time, Some(t0()));

    let left = tracker
        .mark_absent(CHAT, "S1", t0() + Duration::seconds(90))
        .await
        .unwrap()
        .unwrap();
    assert!(!left.is_present);
    assert_eq!(left.accumulated_secs, 90);

    let back = tracker
        .mark_present(CHAT, "T1", "S1", t0() + Duration::seconds(300))
        .await
        .unwrap();
    assert!(back.is_present);
    assert_eq!(back.accumulated_secs, 90);
    assert_eq!(back.first_join_time, Some(t0()));
    assert_eq!(back.last_seen_time, Some(t0() + Duration::seconds(300)));

    let rows = tracker
        .report(CHAT, t0() + Duration::seconds(330))
        .await
        .unwrap();
    let ana = &rows[0];
    assert_eq!(ana.student_id, "S1");
    assert_eq!(ana.total_secs, 90);
    assert_eq!(ana.current_secs, 120);
}

#[tokio::test]
async fn test_repeated_transitions_are_no_ops() {
    let (_store, tracker) = tracker();
    tracker.init_session(CHAT, "T1").await.unwrap();

    tracker.mark_present(CHAT, "T1", "S1", t0()).await.unwrap();
    let again = tracker
        .mark_present(CHAT, "T1", "S1", t0() + Duration::seconds(50))
        .await
        .unwrap();
    assert_eq!(again.last_seen_time, Some(t0()));

    tracker
        .mark_absent(CHAT, "S1", t0() + Duration::seconds(60))
        .await
        .unwrap();
    let twice = tracker
        .mark_absent(CHAT, "S1", t0() + Duration::seconds(500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(twice.accumulated_secs, 60);

    assert!(tracker
        .mark_absent(CHAT, "nobody", t0())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_join_without_row_creates_one() {
    let (store, tracker) = tracker();
    let record = tracker.mark_present(CHAT, "T1", "S2", t0()).await.unwrap();
    assert!(record.is_present);
    assert_eq!(store.attendance(CHAT, "S2").unwrap(), Some(record));
}

#[tokio::test]
async fn test_close_out_stops_every_clock() {
    let (_store, tracker) = tracker();
    tracker.init_session(CHAT, "T1").await.unwrap();
    tracker.mark_present(CHAT, "T1", "S1", t0()).await.unwrap();
    tracker
        .mark_present(CHAT, "T1", "S2", t0() + Duration::seconds(10))
        .await
        .unwrap();

    let closed = tracker
        .close_out(CHAT, t0() + Duration::seconds(100))
        .await
        .unwrap();
    assert_eq!(closed, 2);

    let rows = tracker
        .report(CHAT, t0() + Duration::seconds(1000))
        .await
        .unwrap();
    let totals: Vec<(bool, i64, i64)> = rows
        .iter()
        .map(|r| (r.is_present, r.total_secs, r.current_secs))
        .collect();
    assert_eq!(totals, vec![(false, 100, 100), (false, 90, 90)]);
}

proptest! {
    #[test]
    fn accumulated_time_never_decreases(steps in proptest::collection::vec((any::<bool>(), 0i64..600), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let (store, tracker) = tracker();
            tracker.init_session(CHAT, "T1").await.unwrap();

            let mut now = t0();
            let mut last_total = 0;
            let mut last_current = 0;
            for (join, gap) in steps {
                now += Duration::seconds(gap);
                if join {
                    tracker.mark_present(CHAT, "T1", "S1", now).await.unwrap();
                } else {
                    tracker.mark_absent(CHAT, "S1", now).await.unwrap();
                }

                let record = store.attendance(CHAT, "S1").unwrap().unwrap();
                prop_assert!(record.accumulated_secs >= last_total);
                let current = current_secs(&record, now);
                prop_assert!(current >= last_current);
                prop_assert!(current <= (now - t0()).num_seconds());
                last_total = record.accumulated_secs;
                last_current = current;
            }
            Ok(())
        })?;
    }
}
