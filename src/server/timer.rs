//! Session timer - warns before a chat expires and ends it on expiry

use super::handlers::finish_chat;
use super::listener::ServerState;
use crate::protocol::Notice;
use crate::room::SlotPreference;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How a timer task finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The timer ended the chat
    Expired,
    /// The chat was gone before the timer got to it
    AlreadyEnded,
}

pub struct SessionTimer;

impl SessionTimer {
    /// Spawn the timer of one chat session.
    ///
    /// With a duration longer than the warning lead, sleeps until the lead,
    /// broadcasts the warning, then sleeps the lead; otherwise sleeps the whole
    /// duration. At each wake-up the chat must still own its room.
    pub fn spawn(
        state: Arc<ServerState>,
        tutorial_id: String,
        chat_session_id: String,
        duration: Duration,
    ) -> JoinHandle<TimerOutcome> {
        tokio::spawn(async move {
            let outcome = run(&state, &tutorial_id, &chat_session_id, duration).await;
            tracing::info!(
                "Timer for chat {} of tutorial {} finished: {:?}",
                chat_session_id,
                tutorial_id,
                outcome
            );
            outcome
        })
    }
}

async fn run(
    state: &ServerState,
    tutorial_id: &str,
    chat_session_id: &str,
    duration: Duration,
) -> TimerOutcome {
    let lead = state.config.warning_lead();

    if !lead.is_zero() && duration > lead {
        tokio::time::sleep(duration - lead).await;
        if !state.rooms.hosts_chat(tutorial_id, chat_session_id).await {
            return TimerOutcome::AlreadyEnded;
        }

        let warning = Notice::Warning(format!(
            "{} minutes remaining",
            state.config.chat.warning_lead_minutes
        ));
        let report = state
            .rooms
            .broadcast(
                tutorial_id,
                &warning.to_string(),
                None,
                SlotPreference::ChatFirst,
            )
            .await;
        tracing::info!(
            "Expiry warning sent in {} ({} delivered)",
            tutorial_id,
            report.delivered
        );

        tokio::time::sleep(lead).await;
    } else {
        tokio::time::sleep(duration).await;
    }

    if !state.rooms.hosts_chat(tutorial_id, chat_session_id).await {
        return TimerOutcome::AlreadyEnded;
    }

    let chat = match state.store.active_chat(tutorial_id) {
        Ok(Some(chat)) if chat.chat_session_id == chat_session_id => chat,
        Ok(_) => return TimerOutcome::AlreadyEnded,
        Err(e) => {
            tracing::error!("Timer could not load chat {}: {}", chat_session_id, e);
            return TimerOutcome::AlreadyEnded;
        }
    };

    if let Err(e) = finish_chat(state, &chat).await {
        tracing::error!("Timer failed to end chat {}: {}", chat_session_id, e);
    }
    TimerOutcome::Expired
}
