//! Integration tests for the server module, over real TCP connections

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tutorchat::auth::hash_password;
use tutorchat::client::ChatClient;
use tutorchat::config::Config;
use tutorchat::protocol::list_records;
use tutorchat::server::{ServerListener, ServerState};
use tutorchat::store::{avatar_url, MemoryStore, NewUser, Role, Store};

const PASSWORD: &str = "pw";
const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _shutdown: mpsc::Sender<()>,
}

fn password_hash() -> String {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password(PASSWORD).unwrap()).clone()
}

fn seed(store: &dyn Store) {
    let users = [
        ("admin", "Root", Role::Admin),
        ("tut1", "Tina", Role::Tutor),
        ("tut2", "Tom", Role::Tutor),
        ("S1", "Ana", Role::Student),
        ("S2", "Ben", Role::Student),
        ("S9", "Zed", Role::Student),
    ];
    for (id, name, role) in users {
        store
            .create_user(NewUser {
                id: id.to_string(),
                name: name.to_string(),
                password_hash: password_hash(),
                role,
                avatar_url: avatar_url("adventurer", id),
            })
            .unwrap();
    }
    store.create_tutorial("T1", "Intro").unwrap();
    for id in ["tut1", "S1", "S2"] {
        store.assign_user(id, "T1").unwrap();
    }
}

async fn start_server() -> TestServer {
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref());

    let mut config = Config::default();
    config.server.port = 0;
    config.server.read_timeout_secs = 1;

    let server = ServerListener::bind(config, store).await.unwrap();
    let addr = server.local_addr().unwrap();
    let state = server.state();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move { server.run(shutdown_rx).await });

    TestServer {
        addr,
        state,
        _shutdown: shutdown_tx,
    }
}

async fn login(server: &TestServer, user_id: &str) -> ChatClient {
    let mut client = ChatClient::connect(server.addr).await.unwrap();
    client.login(user_id, PASSWORD).await.unwrap();
    client
}

/// Second connection resumed from `primary`'s session
async fn resume(server: &TestServer, primary: &ChatClient) -> ChatClient {
    let token = primary.token().unwrap().to_string();
    let mut client = ChatClient::connect(server.addr).await.unwrap();
    client.resume(&token).await.unwrap();
    client
}

/// Read until a line starts with `prefix`
async fn wait_for(client: &mut ChatClient, prefix: &str) -> String {
    let found = timeout(WAIT, async {
        loop {
            match client.recv(WAIT).await.unwrap() {
                Some(line) if line.starts_with(prefix) => return line,
                Some(_) => continue,
                None => panic!("no line starting with {}", prefix),
            }
        }
    })
    .await;
    found.unwrap()
}

/// Everything that arrives before the connection goes quiet
async fn drain(client: &mut ChatClient) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(Some(line)) = client.recv(QUIET).await {
        lines.push(line);
    }
    lines
}

fn attendance_row<'a>(line: &'a str, student_id: &str) -> Vec<&'a str> {
    list_records(line, "ATTENDANCE_UPDATE")
        .unwrap()
        .into_iter()
        .find(|r| r.first() == Some(&student_id))
        .unwrap()
}

#[tokio::test]
async fn test_login_failures() {
    let server = start_server().await;

    let mut client = ChatClient::connect(server.addr).await.unwrap();
    let err = client.login("ghost", PASSWORD).await.unwrap_err();
    assert!(err.to_string().contains("FAIL:User not found"), "{}", err);

    let mut client = ChatClient::connect(server.addr).await.unwrap();
    let err = client.login("S1", "wrong").await.unwrap_err();
    assert!(err.to_string().contains("FAIL:Incorrect password"), "{}", err);

    let mut client = ChatClient::connect(server.addr).await.unwrap();
    client.send_line("no-separator").await.unwrap();
    assert_eq!(
        client.recv(WAIT).await.unwrap().as_deref(),
        Some("FAIL:Malformed login data")
    );

    let mut client = ChatClient::connect(server.addr).await.unwrap();
    let err = client.resume("not-a-token").await.unwrap_err();
    assert!(err.to_string().contains("FAIL:Invalid session"), "{}", err);
}

#[tokio::test]
async fn test_login_success_and_duplicate() {
    let server = start_server().await;

    let mut first = ChatClient::connect(server.addr).await.unwrap();
    let reply = first.login("tut1", PASSWORD).await.unwrap();
    assert_eq!(reply.role, Role::Tutor);
    assert_eq!(reply.name, "Tina");
    assert_eq!(reply.avatar_url, avatar_url("adventurer", "tut1"));
    assert!(server.state.sessions.has_session("tut1").await);

    let mut second = ChatClient::connect(server.addr).await.unwrap();
    let err = second.login("tut1", PASSWORD).await.unwrap_err();
    assert!(err.to_string().contains("FAIL:Already logged in"), "{}", err);

    // Closing the primary connection ends the session
    drop(first);
    timeout(WAIT, async {
        while server.state.sessions.has_session("tut1").await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    login(&server, "tut1").await;
}

#[tokio::test]
async fn test_admin_commands() {
    let server = start_server().await;
    let mut admin = login(&server, "admin").await;

    let create = |role: &'static str| ["S3", "Sam", "pw3", role];
    assert_eq!(
        admin.request("CREATE_USER", &create("student")).await.unwrap(),
        "USER_CREATED"
    );
    assert_eq!(
        admin.request("CREATE_USER", &create("student")).await.unwrap(),
        "FAIL:User ID already exists"
    );
    assert_eq!(
        admin.request("CREATE_USER", &["S4", "X", "p", "wizard"]).await.unwrap(),
        "FAIL:Invalid role"
    );
    assert_eq!(
        admin.request("CREATE_USER", &["a|b", "X", "p", "tutor"]).await.unwrap(),
        "FAIL:Invalid command format"
    );

    assert_eq!(
        admin.request("CREATE_TUTORIAL", &["T2", "Advanced"]).await.unwrap(),
        "TUTORIAL_CREATED"
    );
    assert_eq!(
        admin.request("CREATE_TUTORIAL", &["T2", "Again"]).await.unwrap(),
        "FAIL:Tutorial ID already exists"
    );

    assert_eq!(admin.request("ASSIGN", &["S3", "T2"]).await.unwrap(), "ASSIGNED");
    assert_eq!(
        admin.request("ASSIGN", &["S3", "T2"]).await.unwrap(),
        "FAIL:User already assigned to this tutorial"
    );
    assert_eq!(
        admin.request("ASSIGN", &["tut2", "T1"]).await.unwrap(),
        "FAIL:Tutor already assigned to this tutorial"
    );
    assert_eq!(
        admin.request("ASSIGN", &["ghost", "T1"]).await.unwrap(),
        "FAIL:User not found"
    );
    assert_eq!(
        admin.request("ASSIGN", &["S3", "T9"]).await.unwrap(),
        "FAIL:Tutorial not found"
    );
    assert_eq!(
        admin.request("START_CHAT", &["T1", "10"]).await.unwrap(),
        "FAIL:Unknown command"
    );

    let mut sam = ChatClient::connect(server.addr).await.unwrap();
    sam.login("S3", "pw3").await.unwrap();
    assert_eq!(
        sam.request("ASSIGNED_TUTORIALS", &[]).await.unwrap(),
        "TUTORIALS|T2|Advanced"
    );
}

#[tokio::test]
async fn test_command_rejections() {
    let server = start_server().await;
    let mut student = login(&server, "S1").await;

    student.send_line("bogus|ASSIGNED_TUTORIALS").await.unwrap();
    assert_eq!(
        student.recv(WAIT).await.unwrap().as_deref(),
        Some("FAIL:Invalid session")
    );

    student.send_line("lonely").await.unwrap();
    assert_eq!(
        student.recv(WAIT).await.unwrap().as_deref(),
        Some("FAIL:Invalid command format")
    );

    for command in ["FOO", "END_CHAT", "CREATE_TUTORIAL", "GET_ATTENDANCE"] {
        assert_eq!(
            student.request(command, &["T1", "x"]).await.unwrap(),
            "FAIL:Unknown command",
            "{}",
            command
        );
    }

    assert_eq!(
        student.request("CHAT_MESSAGE", &["T1", "hello"]).await.unwrap(),
        "FAIL:Not in chat room"
    );
    assert_eq!(
        student.request("POLL_TUTOR_TUTORIALS", &[]).await.unwrap(),
        "TUTORIALS|T1|Intro"
    );
    assert_eq!(
        student.request("TUTORIAL_STUDENTS", &["T1"]).await.unwrap(),
        "STUDENTS|S1|Ana||S2|Ben"
    );

    let mut outsider = login(&server, "S9").await;
    assert_eq!(outsider.request("ASSIGNED_TUTORIALS", &[]).await.unwrap(), "NONE");
    assert_eq!(
        outsider.request("TUTORIAL_STUDENTS", &["T1"]).await.unwrap(),
        "FAIL:Not authorized for this tutorial"
    );
}

#[tokio::test]
async fn test_start_and_check_chat() {
    let server = start_server().await;
    let mut tutor = login(&server, "tut1").await;
    let mut other_tutor = login(&server, "tut2").await;
    let mut student = login(&server, "S1").await;
    let mut outsider = login(&server, "S9").await;

    assert_eq!(student.request("CHECK_CHAT", &["T1"]).await.unwrap(), "NO_ACTIVE_CHAT");
    assert_eq!(
        tutor.request("START_CHAT", &["T1", "abc"]).await.unwrap(),
        "FAIL:Invalid duration format"
    );
    assert_eq!(
        tutor.request("START_CHAT", &["T9", "10"]).await.unwrap(),
        "FAIL:Tutorial not found"
    );
    assert_eq!(
        student.request("JOIN_CHAT", &["T1"]).await.unwrap(),
        "FAIL:No active chat for this tutorial"
    );

    let started = tutor.request("START_CHAT", &["T1", "10"]).await.unwrap();
    let chat_id = started.strip_prefix("CHAT_STARTED:").unwrap().to_string();
    assert_eq!(
        tutor.request("START_CHAT", &["T1", "10"]).await.unwrap(),
        "FAIL:Chat session already active"
    );

    let active = format!("CHAT_ACTIVE:{}", chat_id);
    assert_eq!(student.request("CHECK_CHAT", &["T1"]).await.unwrap(), active);
    assert_eq!(tutor.request("CHECK_CHAT", &["T1"]).await.unwrap(), active);
    assert_eq!(
        other_tutor.request("CHECK_CHAT", &["T1"]).await.unwrap(),
        "FAIL:Chat exists but was started by another tutor"
    );
    assert_eq!(
        other_tutor.request("END_CHAT", &["T1"]).await.unwrap(),
        "FAIL:Not authorized for this chat"
    );
    assert_eq!(
        outsider.request("CHECK_CHAT", &["T1"]).await.unwrap(),
        "FAIL:Not enrolled in this tutorial"
    );
    assert_eq!(
        outsider.request("JOIN_CHAT", &["T1"]).await.unwrap(),
        "FAIL:Not authorized for this tutorial"
    );

    // Every enrolled student starts absent
    let rows = server.state.store.attendance_for_session(&chat_id).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| !r.is_present));
}

#[tokio::test]
async fn test_chat_room_flow() {
    let server = start_server().await;

    let mut tutor = login(&server, "tut1").await;
    let started = tutor.request("START_CHAT", &["T1", "10"]).await.unwrap();
    let chat_id = started.strip_prefix("CHAT_STARTED:").unwrap().to_string();

    // No chat socket yet
    assert_eq!(
        tutor.request("GET_ATTENDANCE", &[&chat_id, "T1"]).await.unwrap(),
        "FAIL:No chat socket available"
    );

    let mut tutor_chat = resume(&server, &tutor).await;
    let connected = tutor_chat.request("CHAT_AUTH", &["T1"]).await.unwrap();
    let remaining: i64 = connected
        .strip_prefix("CHAT_CONNECTED:")
        .unwrap()
        .parse()
        .unwrap();
    assert!((590..=600).contains(&remaining), "{}", remaining);

    // Student joins on the primary connection
    let mut student = login(&server, "S1").await;
    assert_eq!(
        student.request("JOIN_CHAT", &["T1"]).await.unwrap(),
        format!("CHAT_JOINED|tut1|{}", chat_id)
    );
    let update = wait_for(&mut tutor_chat, "ATTENDANCE_UPDATE|").await;
    assert_eq!(attendance_row(&update, "S1")[2], "1");
    assert_eq!(attendance_row(&update, "S2")[2], "0");
    let joined = wait_for(&mut tutor_chat, "USER_JOINED|").await;
    assert_eq!(
        joined,
        format!("USER_JOINED|S1|Ana|{}", avatar_url("adventurer", "S1"))
    );

    // Then opens the chat window
    let mut student_chat = resume(&server, &student).await;
    assert!(student_chat
        .request("CHAT_AUTH", &["T1"])
        .await
        .unwrap()
        .starts_with("CHAT_CONNECTED:"));
    let participants = wait_for(&mut student_chat, "PARTICIPANTS|").await;
    assert_eq!(
        participants,
        format!("PARTICIPANTS|tut1|Tina|{}", avatar_url("adventurer", "tut1"))
    );

    // A message reaches each other participant once, on the chat socket
    student.send("CHAT_MESSAGE", &["T1", "is it a|b?"]).await.unwrap();
    let message = wait_for(&mut tutor_chat, "MESSAGE|").await;
    assert!(message.starts_with("MESSAGE|Ana|S1|"), "{}", message);
    assert!(message.ends_with(&format!("|is it a|b?|{}", avatar_url("adventurer", "S1"))));
    assert!(!drain(&mut tutor_chat).await.iter().any(|l| l.starts_with("MESSAGE|")));
    assert!(!drain(&mut tutor).await.iter().any(|l| l.starts_with("MESSAGE|")));
    assert!(!drain(&mut student_chat).await.iter().any(|l| l.starts_with("MESSAGE|")));

    tutor.send("CHAT_MESSAGE", &["T1", "welcome"]).await.unwrap();
    let message = wait_for(&mut student_chat, "MESSAGE|").await;
    assert!(message.starts_with("MESSAGE|Tina|tut1|"), "{}", message);
    assert!(!drain(&mut student).await.iter().any(|l| l.starts_with("MESSAGE|")));

    // Leave and rejoin keeps the first join time
    let first_join = server
        .state
        .store
        .attendance(&chat_id, "S1")
        .unwrap()
        .unwrap()
        .first_join_time;
    student.send("LEAVE_CHAT", &["T1"]).await.unwrap();
    assert_eq!(
        wait_for(&mut tutor_chat, "USER_LEFT|").await,
        "USER_LEFT|S1|Ana"
    );
    let update = wait_for(&mut tutor_chat, "ATTENDANCE_UPDATE|").await;
    assert_eq!(attendance_row(&update, "S1")[2], "0");
    drop(student_chat);
    // The closed chat window does not announce a second departure
    assert!(!drain(&mut tutor_chat).await.iter().any(|l| l.starts_with("USER_LEFT|")));

    assert!(student.request("JOIN_CHAT", &["T1"]).await.unwrap().starts_with("CHAT_JOINED|"));
    let record = server.state.store.attendance(&chat_id, "S1").unwrap().unwrap();
    assert!(record.is_present);
    assert_eq!(record.first_join_time, first_join);

    // Attendance on request goes to the chat socket only
    drain(&mut tutor_chat).await;
    tutor.send("GET_ATTENDANCE", &[&chat_id, "T1"]).await.unwrap();
    let update = wait_for(&mut tutor_chat, "ATTENDANCE_UPDATE|").await;
    let row = attendance_row(&update, "S1");
    assert_eq!(&row[..3], &["S1", "Ana", "1"]);
    assert!(!drain(&mut tutor).await.iter().any(|l| l.starts_with("ATTENDANCE_UPDATE|")));

    // Ending the chat reaches every socket and closes the room
    tutor.send("END_CHAT", &["T1"]).await.unwrap();
    assert_eq!(wait_for(&mut tutor_chat, "CHAT_ENDED").await, "CHAT_ENDED");
    assert_eq!(wait_for(&mut student, "CHAT_ENDED").await, "CHAT_ENDED");
    assert!(server.state.store.active_chat("T1").unwrap().is_none());
    timeout(WAIT, async {
        while server.state.rooms.hosts_chat("T1", &chat_id).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let record = server.state.store.attendance(&chat_id, "S1").unwrap().unwrap();
    assert!(!record.is_present);
}

#[tokio::test]
async fn test_leave_on_resumed_connection_closes_it() {
    let server = start_server().await;
    let mut tutor = login(&server, "tut1").await;
    tutor.request("START_CHAT", &["T1", "10"]).await.unwrap();

    let mut student = login(&server, "S2").await;
    student.request("JOIN_CHAT", &["T1"]).await.unwrap();
    let mut student_chat = resume(&server, &student).await;
    student_chat.request("CHAT_AUTH", &["T1"]).await.unwrap();
    drain(&mut student_chat).await;

    student_chat.send("LEAVE_CHAT", &["T1"]).await.unwrap();
    let closed = timeout(WAIT, student_chat.recv(WAIT)).await.unwrap();
    assert!(closed.is_err());

    // The session itself survives on the primary connection
    assert!(server.state.sessions.has_session("S2").await);
    assert!(!server.state.rooms.has_user("T1", "S2").await);
    assert!(student
        .request("CHECK_CHAT", &["T1"])
        .await
        .unwrap()
        .starts_with("CHAT_ACTIVE:"));
}

#[tokio::test]
async fn test_disconnect_without_leave_departs() {
    let server = start_server().await;
    let mut tutor = login(&server, "tut1").await;
    let started = tutor.request("START_CHAT", &["T1", "10"]).await.unwrap();
    let chat_id = started.strip_prefix("CHAT_STARTED:").unwrap().to_string();
    let mut tutor_chat = resume(&server, &tutor).await;
    tutor_chat.request("CHAT_AUTH", &["T1"]).await.unwrap();

    let mut student = login(&server, "S1").await;
    student.request("JOIN_CHAT", &["T1"]).await.unwrap();
    let mut student_chat = resume(&server, &student).await;
    student_chat.request("CHAT_AUTH", &["T1"]).await.unwrap();
    wait_for(&mut tutor_chat, "USER_JOINED|").await;
    drain(&mut tutor_chat).await;

    // Both windows close without LEAVE_CHAT
    drop(student_chat);
    drop(student);

    assert_eq!(
        wait_for(&mut tutor_chat, "USER_LEFT|").await,
        "USER_LEFT|S1|Ana"
    );
    let update = wait_for(&mut tutor_chat, "ATTENDANCE_UPDATE|").await;
    assert_eq!(attendance_row(&update, "S1")[2], "0");
    assert!(!drain(&mut tutor_chat).await.iter().any(|l| l.starts_with("USER_LEFT|")));

    let record = server.state.store.attendance(&chat_id, "S1").unwrap().unwrap();
    assert!(!record.is_present);
    assert!(record.first_join_time.is_some());
    assert!(!server.state.rooms.has_user("T1", "S1").await);
    timeout(WAIT, async {
        while server.state.sessions.has_session("S1").await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_oversized_line_keeps_connection() {
    let server = start_server().await;
    let mut student = login(&server, "S1").await;
    let token = student.token().unwrap().to_string();

    let long = format!("{}|CHAT_MESSAGE|T1|{}", token, "x".repeat(9000));
    student.send_line(&long).await.unwrap();
    let reply = student.recv(WAIT).await.unwrap().unwrap();
    assert!(reply.starts_with("FAIL:Message too large"), "{}", reply);

    // The rest of the long line is skipped, the session carries on
    assert_eq!(
        student.request("ASSIGNED_TUTORIALS", &[]).await.unwrap(),
        "TUTORIALS|T1|Intro"
    );
    assert!(server.state.sessions.has_session("S1").await);
}
