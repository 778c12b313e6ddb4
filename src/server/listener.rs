//! TCP listener and server main loop

use super::dispatch::handle_client;
use super::session::SessionRegistry;
use crate::config::Config;
use crate::presence::PresenceTracker;
use crate::room::RoomDirectory;
use crate::store::Store;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Server state shared across connections and timers
pub struct ServerState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub sessions: SessionRegistry,
    pub rooms: RoomDirectory,
    pub presence: PresenceTracker,
}

impl ServerState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Arc<Self> {
        let rooms = RoomDirectory::new(config.send_timeout(), config.chat.history_limit);
        Arc::new(Self {
            sessions: SessionRegistry::new(),
            rooms,
            presence: PresenceTracker::new(Arc::clone(&store)),
            store,
            config,
        })
    }
}

/// TCP server listener
pub struct ServerListener {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl ServerListener {
    /// Bind the configured address. Port 0 picks an ephemeral port.
    pub async fn bind(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let addr = config.addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            listener,
            state: ServerState::new(config, store),
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        tracing::info!("Server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                // Accept new connections
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state).await {
                                    tracing::error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Server stopped with {} live session(s)",
            self.state.sessions.active_count().await
        );
        Ok(())
    }
}
