//! Session timer tests, run on a paused clock

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tutorchat::config::Config;
use tutorchat::room::Slot;
use tutorchat::server::{ClientConnection, ServerState, SessionTimer, TimerOutcome};
use tutorchat::store::{ActiveChat, MemoryStore, NewUser, Role, Store};

fn state() -> Arc<ServerState> {
    let store = Arc::new(MemoryStore::new());
    store.create_tutorial("T1", "Intro").unwrap();
    store
        .create_user(NewUser {
            id: "S1".into(),
            name: "Ana".into(),
            password_hash: String::new(),
            role: Role::Student,
            avatar_url: String::new(),
        })
        .unwrap();
    store.assign_user("S1", "T1").unwrap();
    ServerState::new(Config::default(), store)
}

async fn start(state: &ServerState, minutes: i64) -> ActiveChat {
    let chat = state
        .store
        .start_chat("T1", "tut1", chrono::Duration::minutes(minutes), Utc::now())
        .unwrap()
        .unwrap();
    assert!(state.rooms.open_room("T1", &chat.chat_session_id).await);
    chat
}

async fn listener(state: &ServerState, user_id: &str) -> (ClientConnection, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(16);
    let conn = ClientConnection::new(tx);
    state
        .rooms
        .attach_socket("T1", user_id, conn.clone(), Slot::Chat)
        .await;
    (conn, rx)
}

#[tokio::test(start_paused = true)]
async fn test_warning_then_expiry() {
    let state = state();
    let chat = start(&state, 10).await;
    let (conn, mut rx) = listener(&state, "S1").await;
    state
        .presence
        .init_session(&chat.chat_session_id, "T1")
        .await
        .unwrap();
    state
        .presence
        .mark_present(&chat.chat_session_id, "T1", "S1", Utc::now())
        .await
        .unwrap();

    let begin = Instant::now();
    let timer = SessionTimer::spawn(
        Arc::clone(&state),
        "T1".into(),
        chat.chat_session_id.clone(),
        Duration::from_secs(600),
    );

    assert_eq!(rx.recv().await.as_deref(), Some("WARNING|5 minutes remaining"));
    let warned = begin.elapsed();
    assert!(warned >= Duration::from_secs(300) && warned < Duration::from_secs(301));

    assert_eq!(rx.recv().await.as_deref(), Some("CHAT_ENDED"));
    assert!(begin.elapsed() >= Duration::from_secs(600));

    assert_eq!(timer.await.unwrap(), TimerOutcome::Expired);
    assert!(state.store.active_chat("T1").unwrap().is_none());
    assert!(!state.rooms.hosts_chat("T1", &chat.chat_session_id).await);
    assert!(conn.is_closed());

    let record = state
        .store
        .attendance(&chat.chat_session_id, "S1")
        .unwrap()
        .unwrap();
    assert!(!record.is_present);
}

#[tokio::test(start_paused = true)]
async fn test_short_chat_skips_warning() {
    let state = state();
    let chat = start(&state, 3).await;
    let (_conn, mut rx) = listener(&state, "S1").await;

    let begin = Instant::now();
    let timer = SessionTimer::spawn(
        Arc::clone(&state),
        "T1".into(),
        chat.chat_session_id.clone(),
        Duration::from_secs(180),
    );

    assert_eq!(rx.recv().await.as_deref(), Some("CHAT_ENDED"));
    assert!(begin.elapsed() >= Duration::from_secs(180));
    assert_eq!(timer.await.unwrap(), TimerOutcome::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_manually_ended_chat_is_left_alone() {
    let state = state();
    let chat = start(&state, 10).await;
    let (_conn, mut rx) = listener(&state, "S1").await;

    let timer = SessionTimer::spawn(
        Arc::clone(&state),
        "T1".into(),
        chat.chat_session_id.clone(),
        Duration::from_secs(600),
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    state.store.end_chat("T1").unwrap();
    state.rooms.close_room("T1").await;

    assert_eq!(timer.await.unwrap(), TimerOutcome::AlreadyEnded);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stale_timer_ignores_newer_chat() {
    let state = state();
    let old = start(&state, 10).await;
    let timer = SessionTimer::spawn(
        Arc::clone(&state),
        "T1".into(),
        old.chat_session_id.clone(),
        Duration::from_secs(600),
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    state.store.end_chat("T1").unwrap();
    state.rooms.close_room("T1").await;
    let newer = start(&state, 30).await;
    let (_conn, mut rx) = listener(&state, "S1").await;

    assert_eq!(timer.await.unwrap(), TimerOutcome::AlreadyEnded);
    assert!(rx.try_recv().is_err());
    let active = state.store.active_chat("T1").unwrap().unwrap();
    assert_eq!(active.chat_session_id, newer.chat_session_id);
    assert!(state.rooms.hosts_chat("T1", &newer.chat_session_id).await);
}
