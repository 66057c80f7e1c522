use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Length of generated bearer tokens (channel and user secrets).
pub const SECRET_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat: uid already registered in this chat")]
    AlreadyRegistered,
    #[error("chat: not a member of this channel")]
    NotRegistered,
    #[error("chat: invalid secret")]
    InvalidSecret,
}

/// Generate a 20-character bearer token.
pub fn generate_secret() -> String {
    let hex = format!("{:032x}", uuid::Uuid::new_v4().as_u128());
    hex[..SECRET_LEN].to_string()
}

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub display_name: String,
    pub email: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub time: i64,
    pub seq: u64,
    pub text: String,
    pub from_uid: String,
    pub from_name: String,
}

impl Message {
    /// Binary encoding used on the wire between broker, log and store.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Message, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// A channel: a named topic with a member set and an optional shared
/// secret gating registration. Public channels have an empty secret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub name: String,
    pub secret: String,
    pub members: HashMap<String, User>,
}

impl Chat {
    pub fn new(name: &str, private: bool) -> Chat {
        Chat {
            name: name.to_string(),
            secret: if private { generate_secret() } else { String::new() },
            members: HashMap::new(),
        }
    }

    /// Registers a user and returns the secret the client must present on
    /// subsequent joins. A user arriving without a preset secret gets a
    /// generated one.
    pub fn register(&mut self, mut user: User) -> Result<String, ChatError> {
        if self.members.contains_key(&user.uid) {
            return Err(ChatError::AlreadyRegistered);
        }
        if user.secret.is_empty() {
            user.secret = generate_secret();
        }
        let secret = user.secret.clone();
        self.members.insert(user.uid.clone(), user);
        Ok(secret)
    }

    /// Authenticates a member. The returned copy has its secret cleared,
    /// as does the member held by this in-memory chat; the authoritative
    /// stored copy is untouched.
    pub fn join(&mut self, uid: &str, secret: &str) -> Result<User, ChatError> {
        let member = self.members.get_mut(uid).ok_or(ChatError::NotRegistered)?;
        if member.secret != secret {
            return Err(ChatError::InvalidSecret);
        }
        member.secret.clear();
        Ok(member.clone())
    }

    /// Idempotent removal.
    pub fn leave(&mut self, uid: &str) {
        self.members.remove(uid);
    }

    /// All members with their secrets elided. Iteration order is
    /// unspecified.
    pub fn list_members(&self) -> Vec<User> {
        self.members
            .values()
            .map(|u| User {
                secret: String::new(),
                ..u.clone()
            })
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Chat, bincode::Error> {
        bincode::deserialize(data)
    }
}
