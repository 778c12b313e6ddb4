//! Per-connection state machine: authenticate, serve commands, tear down

use super::connection::{client_writer_task, ClientConnection, MessageReader, RecvStatus};
use super::handlers::{self, CommandError};
use super::listener::ServerState;
use super::session::{SessionError, SessionIdentity};
use crate::auth;
use crate::protocol::{Command, CommandKind, Envelope, Greeting, LoginReply, ProtocolError, Reply};
use crate::store::Role;
use anyhow::Result;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// How the connection was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnMode {
    /// Credential login; owns the session
    Primary,
    /// `SESSION_AUTH`; borrows an existing session
    Resumed,
}

/// What the serve loop does after a command
#[derive(Debug)]
pub(crate) enum Outcome {
    Reply(Reply),
    /// The handler already sent everything it needed to
    Silent,
    Exit,
}

/// Everything the handlers know about the connection they serve
pub(crate) struct ConnContext {
    pub conn: ClientConnection,
    pub token: String,
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    pub avatar_url: String,
    pub mode: ConnMode,
    /// Rooms this connection holds a slot in
    pub joined: HashSet<String>,
}

/// Handle a single client connection
pub(crate) async fn handle_client(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let max = state.config.server.max_message_size;
    let mut reader = MessageReader::new(BufReader::new(read_half), max);

    // Create message channel for this client
    let (tx, rx) = mpsc::channel::<String>(state.config.server.outbound_buffer.max(1));
    let conn = ClientConnection::with_limits(tx, peer, max);
    let mut writer_handle = tokio::spawn(client_writer_task(write_half, rx, conn.clone()));

    tracing::info!("Client connected: {} ({:?})", conn.id(), peer);

    if let Some(mut ctx) = authenticate(&state, &mut reader, &conn).await {
        serve(&state, &mut reader, &mut ctx).await;
        teardown(&state, &mut ctx).await;
    }

    // Let the writer flush what is queued, but never wait on a stalled peer forever
    conn.close();
    if tokio::time::timeout(Duration::from_secs(5), &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    tracing::info!("Client handler finished: {}", conn.id());
    Ok(())
}

async fn reply(state: &ServerState, conn: &ClientConnection, reply: &Reply) -> bool {
    conn.send(&reply.to_string(), state.config.send_timeout())
        .await
        .is_ok()
}

/// Read and check the greeting line. `None` means the connection must close.
async fn authenticate<R>(
    state: &Arc<ServerState>,
    reader: &mut MessageReader<R>,
    conn: &ClientConnection,
) -> Option<ConnContext>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let line = match reader.recv(state.config.auth_timeout()).await {
        RecvStatus::Message(line) => line,
        RecvStatus::Invalid(e) => {
            tracing::warn!("Unreadable login data from {}: {}", conn.id(), e);
            reply(state, conn, &Reply::fail(e)).await;
            return None;
        }
        status => {
            tracing::warn!("No login data from {}: {:?}", conn.id(), status);
            return None;
        }
    };

    let greeting = match Greeting::parse(&line) {
        Ok(greeting) => greeting,
        Err(e) => {
            tracing::warn!("Malformed login data from {}", conn.id());
            reply(state, conn, &Reply::fail(e)).await;
            return None;
        }
    };

    match greeting {
        Greeting::Resume { token } => {
            let Some(session) = state.sessions.lookup_by_token(&token).await else {
                tracing::warn!("Invalid session resume attempt from {}", conn.id());
                reply(state, conn, &Reply::fail("Invalid session")).await;
                return None;
            };
            state.sessions.rebind_socket(&token, conn).await;
            if !reply(state, conn, &Reply::SessionResumed).await {
                return None;
            }

            tracing::info!("Session resumed for {} on {}", session.user_id, conn.id());
            Some(ConnContext {
                conn: conn.clone(),
                token,
                user_id: session.user_id,
                role: session.role,
                display_name: session.display_name,
                avatar_url: session.avatar_url,
                mode: ConnMode::Resumed,
                joined: HashSet::new(),
            })
        }
        Greeting::Login { user_id, password } => {
            tracing::info!("Login attempt for user: {}", user_id);
            match login(state, conn, &user_id, password).await {
                Ok(ctx) => Some(ctx),
                Err(reason) => {
                    tracing::warn!("Login failed for {}: {}", user_id, reason);
                    reply(state, conn, &Reply::fail(reason)).await;
                    None
                }
            }
        }
    }
}

async fn login(
    state: &Arc<ServerState>,
    conn: &ClientConnection,
    user_id: &str,
    password: String,
) -> Result<ConnContext, String> {
    let user = state
        .store
        .find_user(user_id)
        .map_err(|e| format!("Internal error: {}", e))?
        .ok_or_else(|| "User not found".to_string())?;

    let stored_hash = user.password_hash.clone();
    let verified =
        tokio::task::spawn_blocking(move || auth::verify_password(&password, &stored_hash))
            .await
            .map_err(|e| format!("Internal error: {}", e))?;
    if !verified {
        return Err("Incorrect password".to_string());
    }

    let identity = SessionIdentity {
        user_id: user.id.clone(),
        role: user.role,
        display_name: user.name.clone(),
        avatar_url: user.avatar_url.clone(),
    };
    let session = state
        .sessions
        .create_session(identity, conn.clone())
        .await
        .map_err(|e: SessionError| e.to_string())?;

    let success = Reply::LoginSuccess(LoginReply {
        role: session.role,
        name: session.display_name.clone(),
        token: session.token.clone(),
        avatar_url: session.avatar_url.clone(),
    });
    if !reply(state, conn, &success).await {
        state.sessions.end_session(&session.token).await;
        return Err("Connection lost".to_string());
    }

    tracing::info!("User {} ({}) logged in", user.id, user.role);
    Ok(ConnContext {
        conn: conn.clone(),
        token: session.token,
        user_id: session.user_id,
        role: session.role,
        display_name: session.display_name,
        avatar_url: session.avatar_url,
        mode: ConnMode::Primary,
        joined: HashSet::new(),
    })
}

/// Command loop; returns when the connection reaches a terminal state
async fn serve<R>(state: &Arc<ServerState>, reader: &mut MessageReader<R>, ctx: &mut ConnContext)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let read_timeout = state.config.read_timeout();
    loop {
        let status = tokio::select! {
            status = reader.recv(read_timeout) => status,
            _ = ctx.conn.closed() => {
                tracing::debug!("Connection {} closed by server", ctx.conn.id());
                break;
            }
        };

        let line = match status {
            RecvStatus::Message(line) => line,
            RecvStatus::Timeout => continue,
            RecvStatus::Closed => {
                tracing::info!("Client disconnected: {} ({:?})", ctx.user_id, ctx.conn.peer());
                break;
            }
            RecvStatus::Invalid(e) => {
                tracing::warn!("Unreadable line from {}: {}", ctx.user_id, e);
                if !reply(state, &ctx.conn, &Reply::fail(e)).await {
                    break;
                }
                continue;
            }
            RecvStatus::Error(e) => {
                tracing::warn!("Error reading from {}: {}", ctx.user_id, e);
                break;
            }
        };

        match dispatch_line(state, ctx, &line).await {
            Outcome::Reply(r) => {
                if !reply(state, &ctx.conn, &r).await {
                    break;
                }
            }
            Outcome::Silent => {}
            Outcome::Exit => break,
        }
    }
}

/// Decode, authorize and run one command line
async fn dispatch_line(state: &Arc<ServerState>, ctx: &mut ConnContext, line: &str) -> Outcome {
    let envelope = match Envelope::parse(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Invalid message format from {}", ctx.user_id);
            return Outcome::Reply(Reply::fail(e));
        }
    };

    if envelope.token != ctx.token || state.sessions.lookup_by_token(&envelope.token).await.is_none()
    {
        tracing::warn!("Invalid session attempt from {}", ctx.user_id);
        return Outcome::Reply(Reply::fail("Invalid session"));
    }

    let Some(kind) = CommandKind::from_name(&envelope.name).filter(|k| k.allowed_for(ctx.role))
    else {
        tracing::warn!("Unknown {} command: {}", ctx.role, envelope.name);
        return Outcome::Reply(Reply::fail(ProtocolError::UnknownCommand));
    };

    let command = match Command::decode(kind, &envelope) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!("Rejected {} from {}: {}", kind, ctx.user_id, e);
            return Outcome::Reply(Reply::fail(e));
        }
    };

    tracing::debug!("{} command from {}: {}", ctx.role, ctx.user_id, kind);

    let result = AssertUnwindSafe(handlers::handle(state, ctx, command))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            match &e {
                CommandError::Internal(detail) => {
                    tracing::error!("Error handling {} for {}: {}", kind, ctx.user_id, detail)
                }
                _ => tracing::warn!("{} from {} failed: {}", kind, ctx.user_id, e),
            }
            Outcome::Reply(Reply::fail(e))
        }
        Err(panic) => {
            let detail = panic_detail(panic.as_ref());
            tracing::error!("Handler for {} panicked: {}", kind, detail);
            Outcome::Reply(Reply::fail(CommandError::Internal(detail)))
        }
    }
}

fn panic_detail(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Release the session binding and every room slot this connection holds
async fn teardown(state: &Arc<ServerState>, ctx: &mut ConnContext) {
    match ctx.mode {
        ConnMode::Primary => {
            state.sessions.end_session(&ctx.token).await;
        }
        ConnMode::Resumed => {
            state.sessions.release_socket(&ctx.token, &ctx.conn).await;
        }
    }

    for tutorial_id in ctx.joined.drain() {
        let emptied = state.rooms.detach_dead_socket(&tutorial_id, &ctx.conn).await;
        // A failed send may already have dropped the user without a departure
        let stranded = state.rooms.take_stranded(&tutorial_id, &ctx.user_id).await;
        // Users who already left, or still hold another slot, do not depart again
        if !emptied.contains(&ctx.user_id) && !stranded {
            continue;
        }
        if let Err(e) = handlers::depart(
            state,
            &tutorial_id,
            &ctx.user_id,
            &ctx.display_name,
            ctx.role,
        )
        .await
        {
            tracing::error!("Failed to record departure of {}: {}", ctx.user_id, e);
        }
    }
}
