//! Chat rooms - per-tutorial participant sockets and message fan-out

mod directory;

pub use directory::RoomDirectory;

use crate::server::ClientConnection;

/// Which of a participant's two sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Command connection that joined the room
    Primary,
    /// Dedicated receive-only chat connection
    Chat,
}

/// Socket selection for a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPreference {
    /// Each recipient's chat slot, falling back to that recipient's primary slot
    ChatFirst,
    Chat,
    Primary,
    /// Both slots of every recipient
    All,
}

/// Sockets a participant holds in a room
#[derive(Debug, Clone, Default)]
pub struct Slots {
    pub primary: Option<ClientConnection>,
    pub chat: Option<ClientConnection>,
}

impl Slots {
    pub fn get(&self, slot: Slot) -> Option<&ClientConnection> {
        match slot {
            Slot::Primary => self.primary.as_ref(),
            Slot::Chat => self.chat.as_ref(),
        }
    }

    fn get_mut(&mut self, slot: Slot) -> &mut Option<ClientConnection> {
        match slot {
            Slot::Primary => &mut self.primary,
            Slot::Chat => &mut self.chat,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.chat.is_none()
    }

    /// Clear every slot holding `socket`; true if any did
    fn release(&mut self, socket: &ClientConnection) -> bool {
        let mut released = false;
        for slot in [&mut self.primary, &mut self.chat] {
            if slot.as_ref() == Some(socket) {
                *slot = None;
                released = true;
            }
        }
        released
    }
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Successful sends
    pub delivered: usize,
    /// Sends that went to a primary slot because the chat slot was missing or failed
    pub fallbacks: usize,
    /// Sockets detached after a failed send
    pub detached: usize,
}

impl BroadcastReport {
    pub fn any_delivered(&self) -> bool {
        self.delivered > 0
    }
}
