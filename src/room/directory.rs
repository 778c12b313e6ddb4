//! Room directory - orchestrates every open chat room

use super::{BroadcastReport, Slot, SlotPreference, Slots};
use crate::server::{ClientConnection, SendStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

struct Room {
    /// Chat session the room was opened for, `None` if created implicitly
    chat_session_id: Option<String>,
    users: HashMap<String, Slots>,
    /// Users dropped because their last socket failed a send, not yet departed
    stranded: HashSet<String>,
    /// Most recent broadcast payloads
    log: VecDeque<String>,
}

impl Room {
    fn new(chat_session_id: Option<String>) -> Self {
        Self {
            chat_session_id,
            users: HashMap::new(),
            stranded: HashSet::new(),
            log: VecDeque::new(),
        }
    }
}

/// All rooms, keyed by tutorial id. Sends never happen under the lock.
#[derive(Clone)]
pub struct RoomDirectory {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    send_timeout: Duration,
    history_limit: usize,
}

impl RoomDirectory {
    /// Create a new room directory
    pub fn new(send_timeout: Duration, history_limit: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            send_timeout,
            history_limit,
        }
    }

    /// Open the room of a tutorial for a chat session.
    /// Returns false if the tutorial already has a room bound to a chat session.
    pub async fn open_room(&self, tutorial_id: &str, chat_session_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(tutorial_id.to_string())
            .or_insert_with(|| Room::new(None));
        if room.chat_session_id.is_some() {
            return false;
        }
        room.chat_session_id = Some(chat_session_id.to_string());
        tracing::info!("Room {} opened for chat {}", tutorial_id, chat_session_id);
        true
    }

    /// Put `socket` in the user's slot, creating room and user entry as needed.
    ///
    /// A different socket already in that slot is closed and returned.
    pub async fn attach_socket(
        &self,
        tutorial_id: &str,
        user_id: &str,
        socket: ClientConnection,
        slot: Slot,
    ) -> Option<ClientConnection> {
        let replaced = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(tutorial_id.to_string())
                .or_insert_with(|| Room::new(None));
            room.stranded.remove(user_id);
            let slots = room.users.entry(user_id.to_string()).or_default();
            let previous = slots.get_mut(slot).replace(socket.clone());
            previous.filter(|old| *old != socket)
        };

        if let Some(old) = &replaced {
            tracing::debug!(
                "Replacing {:?} socket of {} in room {}",
                slot,
                user_id,
                tutorial_id
            );
            old.close();
        }
        replaced
    }

    /// Detach a socket from every slot it holds in the room and close it.
    ///
    /// Users left without any slot are removed; their ids are returned.
    pub async fn detach_dead_socket(
        &self,
        tutorial_id: &str,
        socket: &ClientConnection,
    ) -> Vec<String> {
        self.detach(tutorial_id, socket, false).await
    }

    /// Detach after a failed send. Emptied users are remembered as stranded
    /// until the owning connection collects them with [`take_stranded`](Self::take_stranded).
    async fn detach_failed(&self, tutorial_id: &str, socket: &ClientConnection) {
        let stranded = self.detach(tutorial_id, socket, true).await;
        if !stranded.is_empty() {
            tracing::debug!("Stranded in room {}: {:?}", tutorial_id, stranded);
        }
    }

    async fn detach(
        &self,
        tutorial_id: &str,
        socket: &ClientConnection,
        strand: bool,
    ) -> Vec<String> {
        let mut emptied = Vec::new();
        {
            let mut rooms = self.rooms.write().await;
            if let Some(room) = rooms.get_mut(tutorial_id) {
                for (user_id, slots) in room.users.iter_mut() {
                    if slots.release(socket) && slots.is_empty() {
                        emptied.push(user_id.clone());
                    }
                }
                for user_id in &emptied {
                    room.users.remove(user_id);
                    if strand {
                        room.stranded.insert(user_id.clone());
                    }
                }
            }
        }
        socket.close();
        emptied
    }

    /// Clear the stranded mark of a user; true if it was set
    pub async fn take_stranded(&self, tutorial_id: &str, user_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms
            .get_mut(tutorial_id)
            .is_some_and(|room| room.stranded.remove(user_id))
    }

    /// Remove a user entry without touching its sockets
    pub async fn remove_user(&self, tutorial_id: &str, user_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms
            .get_mut(tutorial_id)
            .map(|room| room.users.remove(user_id).is_some())
            .unwrap_or(false)
    }

    /// Deliver `payload` to every participant except `exclude_user_id`.
    ///
    /// The payload is appended to the room log even when nobody receives it.
    pub async fn broadcast(
        &self,
        tutorial_id: &str,
        payload: &str,
        exclude_user_id: Option<&str>,
        preference: SlotPreference,
    ) -> BroadcastReport {
        let targets: Vec<(String, Slots)> = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(tutorial_id) else {
                return BroadcastReport::default();
            };

            room.log.push_back(payload.to_string());
            while room.log.len() > self.history_limit {
                room.log.pop_front();
            }

            room.users
                .iter()
                .filter(|(user_id, _)| Some(user_id.as_str()) != exclude_user_id)
                .map(|(user_id, slots)| (user_id.clone(), slots.clone()))
                .collect()
        };

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        for (user_id, slots) in targets {
            match preference {
                SlotPreference::ChatFirst => {
                    if let Some(chat) = &slots.chat {
                        if self.deliver(chat, payload).await {
                            report.delivered += 1;
                            continue;
                        }
                        dead.push(chat.clone());
                    }
                    if let Some(primary) = &slots.primary {
                        if self.deliver(primary, payload).await {
                            report.delivered += 1;
                            report.fallbacks += 1;
                        } else {
                            dead.push(primary.clone());
                        }
                    }
                }
                SlotPreference::Chat | SlotPreference::Primary => {
                    let slot = if preference == SlotPreference::Chat {
                        Slot::Chat
                    } else {
                        Slot::Primary
                    };
                    if let Some(socket) = slots.get(slot) {
                        if self.deliver(socket, payload).await {
                            report.delivered += 1;
                        } else {
                            dead.push(socket.clone());
                        }
                    }
                }
                SlotPreference::All => {
                    // One connection may hold both slots
                    let chat = slots.chat.as_ref().filter(|c| slots.primary.as_ref() != Some(*c));
                    for socket in [slots.primary.as_ref(), chat].into_iter().flatten() {
                        if self.deliver(socket, payload).await {
                            report.delivered += 1;
                        } else {
                            dead.push(socket.clone());
                        }
                    }
                }
            }
            tracing::trace!("Broadcast to {} in room {}", user_id, tutorial_id);
        }

        for socket in &dead {
            self.detach_failed(tutorial_id, socket).await;
        }
        report.detached = dead.len();

        if !dead.is_empty() {
            tracing::warn!(
                "Broadcast in room {} detached {} dead socket(s)",
                tutorial_id,
                dead.len()
            );
        }
        report
    }

    async fn deliver(&self, socket: &ClientConnection, payload: &str) -> bool {
        socket.send(payload, self.send_timeout).await.is_ok()
    }

    /// Send to one slot of one user. `None` if that slot is empty.
    pub async fn send_to(
        &self,
        tutorial_id: &str,
        user_id: &str,
        slot: Slot,
        payload: &str,
    ) -> Option<SendStatus> {
        let socket = self.slot(tutorial_id, user_id, slot).await?;
        let status = socket.send(payload, self.send_timeout).await;
        if !status.is_ok() {
            self.detach_failed(tutorial_id, &socket).await;
        }
        Some(status)
    }

    /// Close every socket in the room and delete it
    pub async fn close_room(&self, tutorial_id: &str) -> bool {
        let Some(room) = self.rooms.write().await.remove(tutorial_id) else {
            return false;
        };

        for slots in room.users.values() {
            for socket in [&slots.primary, &slots.chat].into_iter().flatten() {
                socket.close();
            }
        }
        tracing::info!("Room {} closed", tutorial_id);
        true
    }

    /// Room exists and has at least one user
    pub async fn is_active(&self, tutorial_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(tutorial_id)
            .is_some_and(|room| !room.users.is_empty())
    }

    /// Room exists and was opened for `chat_session_id`
    pub async fn hosts_chat(&self, tutorial_id: &str, chat_session_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(tutorial_id)
            .is_some_and(|room| room.chat_session_id.as_deref() == Some(chat_session_id))
    }

    /// User ids in the room, sorted
    pub async fn participants(&self, tutorial_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut users: Vec<String> = rooms
            .get(tutorial_id)
            .map(|room| room.users.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub async fn has_user(&self, tutorial_id: &str, user_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(tutorial_id)
            .is_some_and(|room| room.users.contains_key(user_id))
    }

    pub async fn slots(&self, tutorial_id: &str, user_id: &str) -> Option<Slots> {
        self.rooms
            .read()
            .await
            .get(tutorial_id)
            .and_then(|room| room.users.get(user_id))
            .cloned()
    }

    async fn slot(&self, tutorial_id: &str, user_id: &str, slot: Slot) -> Option<ClientConnection> {
        self.slots(tutorial_id, user_id)
            .await
            .and_then(|slots| slots.get(slot).cloned())
    }

    /// Logged broadcast payloads, oldest first
    pub async fn history(&self, tutorial_id: &str) -> Vec<String> {
        self.rooms
            .read()
            .await
            .get(tutorial_id)
            .map(|room| room.log.iter().cloned().collect())
            .unwrap_or_default()
    }
}
