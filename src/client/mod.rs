//! Client - async wire-protocol client and the operator commands built on it

use crate::protocol::{join_fields, list_records, LoginReply, SESSION_AUTH};
use crate::server::{write_message, MessageReader, RecvStatus, DEFAULT_MAX_MESSAGE_SIZE};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// How long a request waits for its reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Tags of lines the server pushes without being asked
const NOTIFICATION_TAGS: &[&str] = &[
    "MESSAGE|",
    "USER_JOINED|",
    "USER_LEFT|",
    "WARNING|",
    "PARTICIPANTS|",
    "ATTENDANCE_UPDATE|",
];

/// Whether `line` is a server push rather than a reply
pub fn is_notification(line: &str) -> bool {
    line == "CHAT_ENDED" || NOTIFICATION_TAGS.iter().any(|tag| line.starts_with(tag))
}

/// One connection to a tutorchat server
pub struct ChatClient {
    reader: MessageReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    /// Notifications that arrived while waiting for a reply
    pending: VecDeque<String>,
    token: Option<String>,
}

impl ChatClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to server")?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: MessageReader::new(BufReader::new(read_half), DEFAULT_MAX_MESSAGE_SIZE),
            writer: write_half,
            pending: VecDeque::new(),
            token: None,
        })
    }

    /// Session token, once logged in or resumed
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Credential login. A `FAIL:` reply becomes the error.
    pub async fn login(&mut self, user_id: &str, password: &str) -> Result<LoginReply> {
        self.send_line(&join_fields([user_id, password])).await?;
        let line = self.recv_reply(REPLY_TIMEOUT).await?;
        let login = LoginReply::parse(&line).map_err(|reply| anyhow!("Login failed: {}", reply))?;
        self.token = Some(login.token.clone());
        Ok(login)
    }

    /// Attach this connection to an existing session
    pub async fn resume(&mut self, token: &str) -> Result<()> {
        self.send_line(&join_fields([SESSION_AUTH, token])).await?;
        let line = self.recv_reply(REPLY_TIMEOUT).await?;
        if !line.starts_with("SUCCESS") {
            bail!("Resume failed: {}", line);
        }
        self.token = Some(token.to_string());
        Ok(())
    }

    /// Write one raw line
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        write_message(&mut self.writer, line).await
    }

    /// Send `token|command|args...` without waiting for anything
    pub async fn send(&mut self, command: &str, args: &[&str]) -> Result<()> {
        let token = self
            .token
            .clone()
            .ok_or_else(|| anyhow!("Not logged in"))?;
        let mut fields = vec![token.as_str(), command];
        fields.extend_from_slice(args);
        self.send_line(&join_fields(fields)).await
    }

    /// Send a command and return its reply, queueing notifications seen meanwhile
    pub async fn request(&mut self, command: &str, args: &[&str]) -> Result<String> {
        self.send(command, args).await?;
        self.recv_reply(REPLY_TIMEOUT).await
    }

    /// Next line that is not a notification
    async fn recv_reply(&mut self, timeout: Duration) -> Result<String> {
        loop {
            let line = self.read_line(timeout).await?;
            if is_notification(&line) {
                self.pending.push_back(line);
            } else {
                return Ok(line);
            }
        }
    }

    /// Next line of any kind, queued notifications first. `None` on timeout.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<String>> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }
        match self.reader.recv(timeout).await {
            RecvStatus::Message(line) => Ok(Some(line)),
            RecvStatus::Timeout => Ok(None),
            RecvStatus::Closed => bail!("Connection closed by server"),
            RecvStatus::Invalid(e) => bail!("Unreadable line from server: {}", e),
            RecvStatus::Error(e) => bail!("Connection error: {}", e),
        }
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        match self.reader.recv(timeout).await {
            RecvStatus::Message(line) => Ok(line),
            RecvStatus::Timeout => bail!("Timed out waiting for the server"),
            RecvStatus::Closed => bail!("Connection closed by server"),
            RecvStatus::Invalid(e) => bail!("Unreadable line from server: {}", e),
            RecvStatus::Error(e) => bail!("Connection error: {}", e),
        }
    }
}

/// Log in and issue one command, returning the reply
async fn run_command(
    addr: &str,
    user_id: &str,
    password: &str,
    command: &str,
    args: &[&str],
) -> Result<String> {
    let mut client = ChatClient::connect(addr).await?;
    let login = client.login(user_id, password).await?;
    tracing::debug!("Logged in as {} ({})", login.name, login.role);
    client.request(command, args).await
}

fn expect_reply(reply: String, expected: &str) -> Result<()> {
    if reply == expected {
        Ok(())
    } else {
        Err(anyhow!("{}", reply.strip_prefix("FAIL:").unwrap_or(&reply).to_string()))
    }
}

/// Create a user through an admin login
pub async fn create_user(
    addr: &str,
    admin: (&str, &str),
    user: (&str, &str, &str, &str),
) -> Result<()> {
    let (id, name, password, role) = user;
    let reply = run_command(addr, admin.0, admin.1, "CREATE_USER", &[id, name, password, role])
        .await?;
    expect_reply(reply, "USER_CREATED")?;
    println!("User '{}' created.", id);
    Ok(())
}

/// Create a tutorial through an admin login
pub async fn create_tutorial(addr: &str, admin: (&str, &str), id: &str, name: &str) -> Result<()> {
    let reply = run_command(addr, admin.0, admin.1, "CREATE_TUTORIAL", &[id, name]).await?;
    expect_reply(reply, "TUTORIAL_CREATED")?;
    println!("Tutorial '{}' created.", id);
    Ok(())
}

/// Assign a user to a tutorial through an admin login
pub async fn assign(addr: &str, admin: (&str, &str), user_id: &str, tutorial_id: &str) -> Result<()> {
    let reply = run_command(addr, admin.0, admin.1, "ASSIGN", &[user_id, tutorial_id]).await?;
    expect_reply(reply, "ASSIGNED")?;
    println!("Assigned '{}' to '{}'.", user_id, tutorial_id);
    Ok(())
}

/// List the tutorials of a tutor or student
pub async fn list_tutorials(addr: &str, user_id: &str, password: &str) -> Result<()> {
    let reply = run_command(addr, user_id, password, "ASSIGNED_TUTORIALS", &[]).await?;
    let records = list_records(&reply, "TUTORIALS")
        .ok_or_else(|| anyhow!("{}", reply.strip_prefix("FAIL:").unwrap_or(&reply)))?;

    if records.is_empty() {
        println!("No tutorials assigned.");
        return Ok(());
    }
    for record in records {
        match record.as_slice() {
            [id, name, ..] => println!("{}\t{}", id, name),
            other => println!("{}", other.join("|")),
        }
    }
    Ok(())
}
