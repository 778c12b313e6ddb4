//! Message types for the tutorchat protocol

use super::{join_fields, join_records, split_records, ProtocolError, FIELD_SEP, SESSION_AUTH};
use crate::presence::AttendanceReport;
use crate::store::{is_valid_id, Member, Role, Tutorial};
use std::fmt;

/// First line sent on a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Greeting {
    /// `SESSION_AUTH|token` - attach to an existing session
    Resume { token: String },

    /// `user_id|password`
    Login { user_id: String, password: String },
}

impl Greeting {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let prefix = format!("{}{}", SESSION_AUTH, FIELD_SEP);
        if let Some(rest) = line.strip_prefix(&prefix) {
            let token = rest.split(FIELD_SEP).next().unwrap_or_default();
            return Ok(Greeting::Resume {
                token: token.to_string(),
            });
        }

        let mut parts = line.split(FIELD_SEP);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user_id), Some(password), None) => Ok(Greeting::Login {
                user_id: user_id.to_string(),
                password: password.to_string(),
            }),
            _ => Err(ProtocolError::MalformedLogin),
        }
    }
}

/// `token|COMMAND|args...` split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub token: String,
    pub name: String,
    /// Pipe-separated arguments after the command name
    pub args: Vec<String>,
    /// Everything after the command name, unsplit
    pub rest: String,
}

impl Envelope {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.trim().splitn(3, FIELD_SEP);
        let token = parts.next().unwrap_or_default();
        let name = parts.next().ok_or(ProtocolError::InvalidFormat)?;
        let rest = parts.next();

        Ok(Self {
            token: token.to_string(),
            name: name.to_string(),
            args: rest
                .map(|r| r.split(FIELD_SEP).map(str::to_string).collect())
                .unwrap_or_default(),
            rest: rest.unwrap_or_default().to_string(),
        })
    }

    fn arg(&self, idx: usize) -> Result<&str, ProtocolError> {
        self.args
            .get(idx)
            .map(String::as_str)
            .ok_or(ProtocolError::InvalidFormat)
    }

    fn exact(&self, n: usize) -> Result<(), ProtocolError> {
        if self.args.len() == n {
            Ok(())
        } else {
            Err(ProtocolError::InvalidFormat)
        }
    }
}

/// Every command name the server understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateUser,
    CreateTutorial,
    Assign,
    AssignedTutorials,
    TutorialStudents,
    StartChat,
    CheckChat,
    JoinChat,
    ChatAuth,
    ChatMessage,
    LeaveChat,
    EndChat,
    GetAttendance,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "CREATE_USER" => CommandKind::CreateUser,
            "CREATE_TUTORIAL" => CommandKind::CreateTutorial,
            "ASSIGN" => CommandKind::Assign,
            "ASSIGNED_TUTORIALS" | "POLL_TUTOR_TUTORIALS" => CommandKind::AssignedTutorials,
            "TUTORIAL_STUDENTS" => CommandKind::TutorialStudents,
            "START_CHAT" => CommandKind::StartChat,
            "CHECK_CHAT" => CommandKind::CheckChat,
            "JOIN_CHAT" => CommandKind::JoinChat,
            "CHAT_AUTH" => CommandKind::ChatAuth,
            "CHAT_MESSAGE" => CommandKind::ChatMessage,
            "LEAVE_CHAT" => CommandKind::LeaveChat,
            "END_CHAT" => CommandKind::EndChat,
            "GET_ATTENDANCE" => CommandKind::GetAttendance,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::CreateUser => "CREATE_USER",
            CommandKind::CreateTutorial => "CREATE_TUTORIAL",
            CommandKind::Assign => "ASSIGN",
            CommandKind::AssignedTutorials => "ASSIGNED_TUTORIALS",
            CommandKind::TutorialStudents => "TUTORIAL_STUDENTS",
            CommandKind::StartChat => "START_CHAT",
            CommandKind::CheckChat => "CHECK_CHAT",
            CommandKind::JoinChat => "JOIN_CHAT",
            CommandKind::ChatAuth => "CHAT_AUTH",
            CommandKind::ChatMessage => "CHAT_MESSAGE",
            CommandKind::LeaveChat => "LEAVE_CHAT",
            CommandKind::EndChat => "END_CHAT",
            CommandKind::GetAttendance => "GET_ATTENDANCE",
        }
    }

    /// Role command tables
    pub fn allowed_for(&self, role: Role) -> bool {
        use CommandKind::*;
        match role {
            Role::Admin => matches!(self, CreateUser | CreateTutorial | Assign),
            Role::Tutor => !matches!(self, CreateUser | CreateTutorial | Assign),
            Role::Student => matches!(
                self,
                AssignedTutorials
                    | TutorialStudents
                    | CheckChat
                    | JoinChat
                    | ChatAuth
                    | ChatMessage
                    | LeaveChat
            ),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded command with typed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateUser {
        user_id: String,
        name: String,
        password: String,
        role: Role,
    },
    CreateTutorial {
        tutorial_id: String,
        name: String,
    },
    Assign {
        user_id: String,
        tutorial_id: String,
    },
    AssignedTutorials,
    TutorialStudents {
        tutorial_id: String,
    },
    StartChat {
        tutorial_id: String,
        duration_minutes: u32,
    },
    CheckChat {
        tutorial_id: String,
    },
    JoinChat {
        tutorial_id: String,
    },
    ChatAuth {
        tutorial_id: String,
    },
    ChatMessage {
        tutorial_id: String,
        text: String,
    },
    LeaveChat {
        tutorial_id: String,
    },
    EndChat {
        tutorial_id: String,
    },
    GetAttendance {
        chat_session_id: String,
        tutorial_id: String,
    },
}

impl Command {
    /// Decode the arguments of `envelope` for a command of `kind`
    pub fn decode(kind: CommandKind, envelope: &Envelope) -> Result<Self, ProtocolError> {
        let tutorial = |idx: usize| envelope.arg(idx).map(str::to_string);

        let command = match kind {
            CommandKind::CreateUser => {
                envelope.exact(4)?;
                let user_id = envelope.arg(0)?;
                if !is_valid_id(user_id) {
                    return Err(ProtocolError::InvalidUserId);
                }
                let role = envelope
                    .arg(3)?
                    .parse::<Role>()
                    .map_err(|_| ProtocolError::InvalidRole)?;
                Command::CreateUser {
                    user_id: user_id.to_string(),
                    name: envelope.arg(1)?.to_string(),
                    password: envelope.arg(2)?.to_string(),
                    role,
                }
            }
            CommandKind::CreateTutorial => {
                envelope.exact(2)?;
                Command::CreateTutorial {
                    tutorial_id: tutorial(0)?,
                    name: envelope.arg(1)?.to_string(),
                }
            }
            CommandKind::Assign => {
                envelope.exact(2)?;
                Command::Assign {
                    user_id: envelope.arg(0)?.to_string(),
                    tutorial_id: tutorial(1)?,
                }
            }
            CommandKind::AssignedTutorials => Command::AssignedTutorials,
            CommandKind::TutorialStudents => Command::TutorialStudents {
                tutorial_id: tutorial(0)?,
            },
            CommandKind::StartChat => {
                let tutorial_id = tutorial(0)?;
                let duration_minutes = envelope
                    .arg(1)?
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|m| *m > 0)
                    .ok_or(ProtocolError::InvalidDuration)?;
                Command::StartChat {
                    tutorial_id,
                    duration_minutes,
                }
            }
            CommandKind::CheckChat => Command::CheckChat {
                tutorial_id: tutorial(0)?,
            },
            CommandKind::JoinChat => Command::JoinChat {
                tutorial_id: tutorial(0)?,
            },
            CommandKind::ChatAuth => Command::ChatAuth {
                tutorial_id: tutorial(0)?,
            },
            CommandKind::ChatMessage => {
                // Text is the remainder of the line and may itself contain separators
                let (tutorial_id, text) = envelope
                    .rest
                    .split_once(FIELD_SEP)
                    .ok_or(ProtocolError::InvalidFormat)?;
                Command::ChatMessage {
                    tutorial_id: tutorial_id.to_string(),
                    text: text.to_string(),
                }
            }
            CommandKind::LeaveChat => Command::LeaveChat {
                tutorial_id: tutorial(0)?,
            },
            CommandKind::EndChat => Command::EndChat {
                tutorial_id: tutorial(0)?,
            },
            CommandKind::GetAttendance => Command::GetAttendance {
                chat_session_id: envelope.arg(0)?.to_string(),
                tutorial_id: tutorial(1)?,
            },
        };
        Ok(command)
    }
}

/// Direct answers to a greeting or command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    LoginSuccess(LoginReply),
    SessionResumed,
    UserCreated,
    TutorialCreated,
    Assigned,
    Tutorials(Vec<Tutorial>),
    Students(Vec<Member>),
    ChatStarted { chat_session_id: String },
    NoActiveChat,
    ChatActive { chat_session_id: String },
    ChatJoined { tutor_id: String, chat_session_id: String },
    ChatConnected { remaining_secs: i64 },
    Fail(String),
}

impl Reply {
    pub fn fail(reason: impl fmt::Display) -> Self {
        Reply::Fail(reason.to_string())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::LoginSuccess(login) => write!(f, "{}", login),
            Reply::SessionResumed => f.write_str("SUCCESS:Session authenticated"),
            Reply::UserCreated => f.write_str("USER_CREATED"),
            Reply::TutorialCreated => f.write_str("TUTORIAL_CREATED"),
            Reply::Assigned => f.write_str("ASSIGNED"),
            Reply::Tutorials(list) if list.is_empty() => f.write_str("NONE"),
            Reply::Tutorials(list) => write!(
                f,
                "TUTORIALS|{}",
                join_records(list.iter().map(|t| join_fields([&t.id, &t.name])))
            ),
            Reply::Students(list) if list.is_empty() => f.write_str("NONE"),
            Reply::Students(list) => write!(
                f,
                "STUDENTS|{}",
                join_records(list.iter().map(|m| join_fields([&m.id, &m.name])))
            ),
            Reply::ChatStarted { chat_session_id } => write!(f, "CHAT_STARTED:{}", chat_session_id),
            Reply::NoActiveChat => f.write_str("NO_ACTIVE_CHAT"),
            Reply::ChatActive { chat_session_id } => write!(f, "CHAT_ACTIVE:{}", chat_session_id),
            Reply::ChatJoined {
                tutor_id,
                chat_session_id,
            } => write!(f, "CHAT_JOINED|{}|{}", tutor_id, chat_session_id),
            Reply::ChatConnected { remaining_secs } => {
                write!(f, "CHAT_CONNECTED:{}", remaining_secs)
            }
            Reply::Fail(reason) => write!(f, "FAIL:{}", reason),
        }
    }
}

/// Fields of a successful credential login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReply {
    pub role: Role,
    pub name: String,
    pub token: String,
    pub avatar_url: String,
}

impl LoginReply {
    /// Parse `SUCCESS|role|name|token|avatar_url`; anything else is returned as the error
    pub fn parse(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.trim().split(FIELD_SEP).collect();
        match fields.as_slice() {
            ["SUCCESS", role, name, token, avatar_url] => Ok(Self {
                role: role.parse()?,
                name: name.to_string(),
                token: token.to_string(),
                avatar_url: avatar_url.to_string(),
            }),
            _ => Err(line.trim().to_string()),
        }
    }
}

impl fmt::Display for LoginReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SUCCESS|{}|{}|{}|{}",
            self.role, self.name, self.token, self.avatar_url
        )
    }
}

/// Room member as listed in `PARTICIPANTS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub name: String,
    pub avatar_url: String,
}

/// Server-pushed notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Message {
        sender_name: String,
        sender_id: String,
        /// `HH:MM`
        time: String,
        text: String,
        avatar_url: String,
    },
    UserJoined {
        user_id: String,
        name: String,
        avatar_url: String,
    },
    UserLeft {
        user_id: String,
        name: String,
    },
    Warning(String),
    ChatEnded,
    Participants(Vec<Participant>),
    AttendanceUpdate(Vec<AttendanceReport>),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Message {
                sender_name,
                sender_id,
                time,
                text,
                avatar_url,
            } => write!(
                f,
                "MESSAGE|{}|{}|{}|{}|{}",
                sender_name, sender_id, time, text, avatar_url
            ),
            Notice::UserJoined {
                user_id,
                name,
                avatar_url,
            } => write!(f, "USER_JOINED|{}|{}|{}", user_id, name, avatar_url),
            Notice::UserLeft { user_id, name } => write!(f, "USER_LEFT|{}|{}", user_id, name),
            Notice::Warning(text) => write!(f, "WARNING|{}", text),
            Notice::ChatEnded => f.write_str("CHAT_ENDED"),
            Notice::Participants(list) => write!(
                f,
                "PARTICIPANTS|{}",
                join_records(
                    list.iter()
                        .map(|p| join_fields([&p.user_id, &p.name, &p.avatar_url]))
                )
            ),
            Notice::AttendanceUpdate(rows) => write!(
                f,
                "ATTENDANCE_UPDATE|{}",
                join_records(rows.iter().map(encode_attendance))
            ),
        }
    }
}

fn encode_attendance(row: &AttendanceReport) -> String {
    // Unset times are 0; an empty field would read as a record separator
    let time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map_or(0, |t| t.timestamp()).to_string()
    };
    join_fields([
        row.student_id.clone(),
        row.name.clone(),
        if row.is_present { "1" } else { "0" }.to_string(),
        time(row.first_join_time),
        time(row.last_seen_time),
        row.total_secs.to_string(),
        row.current_secs.to_string(),
    ])
}

/// Records of a `TAG|record||record` list line, empty for `NONE`
pub fn list_records<'a>(line: &'a str, tag: &str) -> Option<Vec<Vec<&'a str>>> {
    if line == "NONE" {
        return Some(Vec::new());
    }
    let body = line.strip_prefix(tag)?.strip_prefix(FIELD_SEP)?;
    Some(split_records(body))
}
