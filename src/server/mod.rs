//! Server module - TCP listener, connection state machine and command handling

mod connection;
mod dispatch;
mod handlers;
mod listener;
mod session;
mod timer;

pub use connection::{
    client_writer_task, write_message, ClientConnection, MessageReader, RecvStatus, SendStatus,
    DEFAULT_MAX_MESSAGE_SIZE,
};
pub use handlers::CommandError;
pub use listener::{ServerListener, ServerState};
pub use session::{Session, SessionError, SessionIdentity, SessionRegistry};
pub use timer::{SessionTimer, TimerOutcome};
