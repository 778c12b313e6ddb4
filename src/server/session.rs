//! Session registry - tracks who is logged in and on which connection

use super::connection::ClientConnection;
use crate::store::Role;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Already logged in")]
    AlreadyActive,
}

/// Who a session belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    pub avatar_url: String,
}

/// A logged-in user
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque token the client echoes in every command
    pub token: String,

    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    pub avatar_url: String,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// Connection the session is currently bound to
    pub socket: Option<ClientConnection>,
}

#[derive(Default)]
struct Indices {
    sessions: HashMap<String, Session>,
    by_user: HashMap<String, String>,
    by_socket: HashMap<Uuid, String>,
}

/// All live sessions. Every operation is atomic under one lock.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Indices>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `identity` bound to `socket`.
    ///
    /// Fails if the user already has a live session.
    pub async fn create_session(
        &self,
        identity: SessionIdentity,
        socket: ClientConnection,
    ) -> Result<Session, SessionError> {
        let mut inner = self.inner.write().await;
        if inner.by_user.contains_key(&identity.user_id) {
            return Err(SessionError::AlreadyActive);
        }

        let token = Uuid::new_v4().to_string();
        let session = Session {
            token: token.clone(),
            user_id: identity.user_id,
            role: identity.role,
            display_name: identity.display_name,
            avatar_url: identity.avatar_url,
            created_at: Utc::now(),
            socket: Some(socket.clone()),
        };

        inner
            .by_user
            .insert(session.user_id.clone(), token.clone());
        inner.by_socket.insert(socket.id(), token.clone());
        inner.sessions.insert(token, session.clone());

        tracing::info!(
            "Session created for {} ({})",
            session.user_id,
            session.role
        );
        Ok(session)
    }

    pub async fn lookup_by_token(&self, token: &str) -> Option<Session> {
        self.inner.read().await.sessions.get(token).cloned()
    }

    pub async fn lookup_by_socket(&self, socket: &ClientConnection) -> Option<Session> {
        let inner = self.inner.read().await;
        inner
            .by_socket
            .get(&socket.id())
            .and_then(|token| inner.sessions.get(token))
            .cloned()
    }

    /// Bind `socket` to the session in place of the previous one.
    /// Returns false for an unknown token.
    pub async fn rebind_socket(&self, token: &str, socket: &ClientConnection) -> bool {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let Some(session) = inner.sessions.get_mut(token) else {
            return false;
        };
        if let Some(old) = session.socket.replace(socket.clone()) {
            inner.by_socket.remove(&old.id());
        }
        inner.by_socket.insert(socket.id(), token.to_string());
        true
    }

    /// Unbind `socket` from the session, leaving the session alive.
    /// Returns false if the socket was not bound to this token.
    pub async fn release_socket(&self, token: &str, socket: &ClientConnection) -> bool {
        let mut inner = self.inner.write().await;
        if inner.by_socket.get(&socket.id()).map(String::as_str) != Some(token) {
            return false;
        }
        inner.by_socket.remove(&socket.id());

        if let Some(session) = inner.sessions.get_mut(token) {
            if session.socket.as_ref() == Some(socket) {
                session.socket = None;
            }
        }
        true
    }

    /// Remove the session and every index pointing at it. Idempotent.
    pub async fn end_session(&self, token: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.remove(token) else {
            return false;
        };
        inner.by_user.remove(&session.user_id);
        inner.by_socket.retain(|_, t| t != token);

        tracing::info!("Session ended for {}", session.user_id);
        true
    }

    pub async fn has_session(&self, user_id: &str) -> bool {
        self.inner.read().await.by_user.contains_key(user_id)
    }

    /// Number of live sessions
    pub async fn active_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
