//! Command handlers, one per [`Command`] variant

use super::connection::SendStatus;
use super::dispatch::{ConnContext, ConnMode, Outcome};
use super::listener::ServerState;
use super::timer::SessionTimer;
use crate::auth::{self, AuthError};
use crate::protocol::{Command, Notice, Participant, ProtocolError, Reply};
use crate::room::{Slot, SlotPreference};
use crate::store::{avatar_url, ActiveChat, NewUser, Role, StoreError};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

/// Why a command failed. `Display` is the reason sent after `FAIL:`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Delivery(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists("User", _) => CommandError::Conflict("User ID already exists"),
            StoreError::AlreadyExists("Tutorial", _) => {
                CommandError::Conflict("Tutorial ID already exists")
            }
            StoreError::AlreadyExists("Assignment", _) => {
                CommandError::Conflict("User already assigned to this tutorial")
            }
            StoreError::NotFound("User", _) => CommandError::NotFound("User not found"),
            StoreError::NotFound("Tutorial", _) => CommandError::NotFound("Tutorial not found"),
            other => CommandError::Internal(other.to_string()),
        }
    }
}

impl From<AuthError> for CommandError {
    fn from(e: AuthError) -> Self {
        CommandError::Internal(e.to_string())
    }
}

type HandlerResult = Result<Outcome, CommandError>;

/// Run one decoded command for the connection described by `ctx`
pub(crate) async fn handle(
    state: &Arc<ServerState>,
    ctx: &mut ConnContext,
    command: Command,
) -> HandlerResult {
    match command {
        Command::CreateUser {
            user_id,
            name,
            password,
            role,
        } => create_user(state, user_id, name, password, role).await,
        Command::CreateTutorial { tutorial_id, name } => {
            if state.store.find_tutorial(&tutorial_id)?.is_some() {
                return Err(CommandError::Conflict("Tutorial ID already exists"));
            }
            state.store.create_tutorial(&tutorial_id, &name)?;
            tracing::info!("Tutorial created: {} ({})", tutorial_id, name);
            Ok(Outcome::Reply(Reply::TutorialCreated))
        }
        Command::Assign {
            user_id,
            tutorial_id,
        } => assign(state, &user_id, &tutorial_id),
        Command::AssignedTutorials => Ok(Outcome::Reply(Reply::Tutorials(
            state.store.tutorials_for_user(&ctx.user_id)?,
        ))),
        Command::TutorialStudents { tutorial_id } => {
            if ctx.role == Role::Student && !state.store.is_enrolled(&ctx.user_id, &tutorial_id)? {
                return Err(CommandError::Unauthorized("Not authorized for this tutorial"));
            }
            Ok(Outcome::Reply(Reply::Students(
                state.store.students_in_tutorial(&tutorial_id)?,
            )))
        }
        Command::StartChat {
            tutorial_id,
            duration_minutes,
        } => start_chat(state, ctx, &tutorial_id, duration_minutes).await,
        Command::CheckChat { tutorial_id } => check_chat(state, ctx, &tutorial_id),
        Command::JoinChat { tutorial_id } => join_chat(state, ctx, &tutorial_id).await,
        Command::ChatAuth { tutorial_id } => chat_auth(state, ctx, &tutorial_id).await,
        Command::ChatMessage { tutorial_id, text } => {
            chat_message(state, ctx, &tutorial_id, text).await
        }
        Command::LeaveChat { tutorial_id } => {
            depart(state, &tutorial_id, &ctx.user_id, &ctx.display_name, ctx.role).await?;
            ctx.joined.remove(&tutorial_id);
            tracing::info!("{} left chat room {}", ctx.user_id, tutorial_id);
            match ctx.mode {
                ConnMode::Resumed => Ok(Outcome::Exit),
                ConnMode::Primary => Ok(Outcome::Silent),
            }
        }
        Command::EndChat { tutorial_id } => {
            let chat = owned_chat(state, ctx, &tutorial_id)?;
            finish_chat(state, &chat).await?;
            tracing::info!("Chat for tutorial {} ended by {}", tutorial_id, ctx.user_id);
            Ok(Outcome::Silent)
        }
        Command::GetAttendance {
            chat_session_id,
            tutorial_id,
        } => {
            let rows = state.presence.report(&chat_session_id, Utc::now()).await?;
            let payload = Notice::AttendanceUpdate(rows).to_string();
            match state
                .rooms
                .send_to(&tutorial_id, &ctx.user_id, Slot::Chat, &payload)
                .await
            {
                None => Err(CommandError::NotFound("No chat socket available")),
                Some(SendStatus::Ok) => Ok(Outcome::Silent),
                Some(status) => {
                    tracing::warn!("Attendance send to {} failed: {:?}", ctx.user_id, status);
                    Err(CommandError::Delivery("Error sending attendance data"))
                }
            }
        }
    }
}

async fn create_user(
    state: &Arc<ServerState>,
    user_id: String,
    name: String,
    password: String,
    role: Role,
) -> HandlerResult {
    if state.store.find_user(&user_id)?.is_some() {
        return Err(CommandError::Conflict("User ID already exists"));
    }

    let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| CommandError::Internal(e.to_string()))??;

    let user = state.store.create_user(NewUser {
        avatar_url: avatar_url(&state.config.chat.avatar_style, &user_id),
        id: user_id,
        name,
        password_hash,
        role,
    })?;

    tracing::info!("User created: {} ({})", user.id, user.role);
    Ok(Outcome::Reply(Reply::UserCreated))
}

fn assign(state: &Arc<ServerState>, user_id: &str, tutorial_id: &str) -> HandlerResult {
    let role = state
        .store
        .user_role(user_id)?
        .ok_or(CommandError::NotFound("User not found"))?;
    if state.store.find_tutorial(tutorial_id)?.is_none() {
        return Err(CommandError::NotFound("Tutorial not found"));
    }
    if role == Role::Tutor && state.store.is_tutor_already_assigned(tutorial_id)? {
        return Err(CommandError::Conflict(
            "Tutor already assigned to this tutorial",
        ));
    }

    state.store.assign_user(user_id, tutorial_id)?;
    tracing::info!("Assigned {} to {}", user_id, tutorial_id);
    Ok(Outcome::Reply(Reply::Assigned))
}

async fn start_chat(
    state: &Arc<ServerState>,
    ctx: &mut ConnContext,
    tutorial_id: &str,
    duration_minutes: u32,
) -> HandlerResult {
    if state.store.find_tutorial(tutorial_id)?.is_none() {
        return Err(CommandError::NotFound("Tutorial not found"));
    }

    let duration = chrono::Duration::minutes(i64::from(duration_minutes));
    let chat = state
        .store
        .start_chat(tutorial_id, &ctx.user_id, duration, Utc::now())?
        .ok_or(CommandError::Conflict("Chat session already active"))?;

    if !state.rooms.open_room(tutorial_id, &chat.chat_session_id).await {
        // Leftover room from an earlier chat of this tutorial
        state.rooms.close_room(tutorial_id).await;
        state.rooms.open_room(tutorial_id, &chat.chat_session_id).await;
    }
    state
        .rooms
        .attach_socket(tutorial_id, &ctx.user_id, ctx.conn.clone(), Slot::Primary)
        .await;
    ctx.joined.insert(tutorial_id.to_string());

    let rows = state
        .presence
        .init_session(&chat.chat_session_id, tutorial_id)
        .await?;

    SessionTimer::spawn(
        Arc::clone(state),
        chat.tutorial_id.clone(),
        chat.chat_session_id.clone(),
        std::time::Duration::from_secs(u64::from(duration_minutes) * 60),
    );

    tracing::info!(
        "Chat {} started for tutorial {} by {} ({} min, {} students)",
        chat.chat_session_id,
        tutorial_id,
        ctx.user_id,
        duration_minutes,
        rows
    );
    Ok(Outcome::Reply(Reply::ChatStarted {
        chat_session_id: chat.chat_session_id,
    }))
}

fn check_chat(state: &Arc<ServerState>, ctx: &ConnContext, tutorial_id: &str) -> HandlerResult {
    let Some(chat) = state.store.active_chat(tutorial_id)? else {
        return Ok(Outcome::Reply(Reply::NoActiveChat));
    };

    match ctx.role {
        Role::Tutor if chat.tutor_id != ctx.user_id => Err(CommandError::Unauthorized(
            "Chat exists but was started by another tutor",
        )),
        Role::Student if !state.store.is_enrolled(&ctx.user_id, tutorial_id)? => {
            Err(CommandError::Unauthorized("Not enrolled in this tutorial"))
        }
        _ => Ok(Outcome::Reply(Reply::ChatActive {
            chat_session_id: chat.chat_session_id,
        })),
    }
}

/// Active chat of the tutorial, which must have been started by the caller
fn owned_chat(
    state: &Arc<ServerState>,
    ctx: &ConnContext,
    tutorial_id: &str,
) -> Result<ActiveChat, CommandError> {
    let chat = state
        .store
        .active_chat(tutorial_id)?
        .ok_or(CommandError::NotFound("No active chat for this tutorial"))?;
    if chat.tutor_id != ctx.user_id {
        return Err(CommandError::Unauthorized("Not authorized for this chat"));
    }
    Ok(chat)
}

async fn join_chat(
    state: &Arc<ServerState>,
    ctx: &mut ConnContext,
    tutorial_id: &str,
) -> HandlerResult {
    let chat = match ctx.role {
        Role::Student => {
            if !state.store.is_enrolled(&ctx.user_id, tutorial_id)? {
                return Err(CommandError::Unauthorized("Not authorized for this tutorial"));
            }
            state
                .store
                .active_chat(tutorial_id)?
                .ok_or(CommandError::NotFound("No active chat for this tutorial"))?
        }
        _ => owned_chat(state, ctx, tutorial_id)?,
    };

    state
        .rooms
        .attach_socket(tutorial_id, &ctx.user_id, ctx.conn.clone(), Slot::Primary)
        .await;
    ctx.joined.insert(tutorial_id.to_string());

    if ctx.role == Role::Student {
        state
            .presence
            .mark_present(&chat.chat_session_id, tutorial_id, &ctx.user_id, Utc::now())
            .await?;
        push_attendance(state, &chat).await;
    }

    let joined = Notice::UserJoined {
        user_id: ctx.user_id.clone(),
        name: ctx.display_name.clone(),
        avatar_url: ctx.avatar_url.clone(),
    };
    state
        .rooms
        .broadcast(
            tutorial_id,
            &joined.to_string(),
            Some(&ctx.user_id),
            SlotPreference::ChatFirst,
        )
        .await;

    tracing::info!("{} joined chat room {}", ctx.user_id, tutorial_id);
    Ok(Outcome::Reply(Reply::ChatJoined {
        tutor_id: chat.tutor_id,
        chat_session_id: chat.chat_session_id,
    }))
}

async fn chat_auth(
    state: &Arc<ServerState>,
    ctx: &mut ConnContext,
    tutorial_id: &str,
) -> HandlerResult {
    let chat = state
        .store
        .active_chat(tutorial_id)?
        .ok_or(CommandError::NotFound("Chat room not found"))?;
    match ctx.role {
        Role::Tutor if chat.tutor_id != ctx.user_id => {
            return Err(CommandError::Unauthorized("Not authorized for this chat"));
        }
        Role::Student if !state.store.is_enrolled(&ctx.user_id, tutorial_id)? => {
            return Err(CommandError::Unauthorized("Not enrolled in this tutorial"));
        }
        _ => {}
    }

    state
        .rooms
        .attach_socket(tutorial_id, &ctx.user_id, ctx.conn.clone(), Slot::Chat)
        .await;
    ctx.joined.insert(tutorial_id.to_string());

    let timeout = state.config.send_timeout();
    let connected = Reply::ChatConnected {
        remaining_secs: chat.remaining_secs(Utc::now()),
    };
    if !ctx.conn.send(&connected.to_string(), timeout).await.is_ok() {
        return Ok(Outcome::Exit);
    }

    let mut participants = Vec::new();
    for user_id in state.rooms.participants(tutorial_id).await {
        if user_id == ctx.user_id {
            continue;
        }
        if let Some(user) = state.store.find_user(&user_id)? {
            participants.push(Participant {
                user_id: user.id,
                name: user.name,
                avatar_url: user.avatar_url,
            });
        }
    }
    if !participants.is_empty() {
        let snapshot = Notice::Participants(participants).to_string();
        ctx.conn.send(&snapshot, timeout).await;
    }

    if state.config.chat.replay_history {
        for line in state.rooms.history(tutorial_id).await {
            if !ctx.conn.send(&line, timeout).await.is_ok() {
                break;
            }
        }
    }

    tracing::info!("Chat socket registered for {} in {}", ctx.user_id, tutorial_id);
    Ok(Outcome::Silent)
}

async fn chat_message(
    state: &Arc<ServerState>,
    ctx: &ConnContext,
    tutorial_id: &str,
    text: String,
) -> HandlerResult {
    if !state.rooms.has_user(tutorial_id, &ctx.user_id).await {
        return Err(CommandError::Unauthorized("Not in chat room"));
    }

    let message = Notice::Message {
        sender_name: ctx.display_name.clone(),
        sender_id: ctx.user_id.clone(),
        time: chrono::Local::now().format("%H:%M").to_string(),
        text,
        avatar_url: ctx.avatar_url.clone(),
    };
    let report = state
        .rooms
        .broadcast(
            tutorial_id,
            &message.to_string(),
            Some(&ctx.user_id),
            SlotPreference::ChatFirst,
        )
        .await;

    tracing::debug!(
        "Message from {} in {}: {} delivered, {} via primary",
        ctx.user_id,
        tutorial_id,
        report.delivered,
        report.fallbacks
    );
    Ok(Outcome::Silent)
}

/// A user leaves a room: notify the others, stop the student's attendance clock, drop the entry
pub(crate) async fn depart(
    state: &Arc<ServerState>,
    tutorial_id: &str,
    user_id: &str,
    display_name: &str,
    role: Role,
) -> Result<(), CommandError> {
    let left = Notice::UserLeft {
        user_id: user_id.to_string(),
        name: display_name.to_string(),
    };
    state
        .rooms
        .broadcast(
            tutorial_id,
            &left.to_string(),
            Some(user_id),
            SlotPreference::ChatFirst,
        )
        .await;

    if role == Role::Student {
        if let Some(chat) = state.store.active_chat(tutorial_id)? {
            state
                .presence
                .mark_absent(&chat.chat_session_id, user_id, Utc::now())
                .await?;
            push_attendance(state, &chat).await;
        }
    }

    state.rooms.remove_user(tutorial_id, user_id).await;
    Ok(())
}

/// Send the current attendance to the owning tutor's chat socket, if connected
async fn push_attendance(state: &Arc<ServerState>, chat: &ActiveChat) {
    let rows = match state.presence.report(&chat.chat_session_id, Utc::now()).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("Failed to build attendance for {}: {}", chat.chat_session_id, e);
            return;
        }
    };
    let payload = Notice::AttendanceUpdate(rows).to_string();
    match state
        .rooms
        .send_to(&chat.tutorial_id, &chat.tutor_id, Slot::Chat, &payload)
        .await
    {
        Some(SendStatus::Ok) => {}
        Some(status) => tracing::warn!("Attendance push to {} failed: {:?}", chat.tutor_id, status),
        None => tracing::debug!("No chat socket for tutor {}", chat.tutor_id),
    }
}

/// End a chat: drop the active record, close out attendance, notify every socket, close the room
pub(crate) async fn finish_chat(state: &ServerState, chat: &ActiveChat) -> Result<(), StoreError> {
    state.store.end_chat(&chat.tutorial_id)?;
    state
        .presence
        .close_out(&chat.chat_session_id, Utc::now())
        .await?;

    let report = state
        .rooms
        .broadcast(
            &chat.tutorial_id,
            &Notice::ChatEnded.to_string(),
            None,
            SlotPreference::All,
        )
        .await;
    state.rooms.close_room(&chat.tutorial_id).await;

    tracing::info!(
        "Chat {} of tutorial {} finished ({} sockets notified)",
        chat.chat_session_id,
        chat.tutorial_id,
        report.delivered
    );
    Ok(())
}
