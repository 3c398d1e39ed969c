//! Remote command vocabulary

use std::fmt;

/// A command received over the command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Check for a newer workload version and update to it
    Update,

    /// Stop the agent main loop so the supervisor restarts the process
    Restart,

    /// Publish the aggregate status
    Status,

    /// Anything else, kept verbatim for logging
    Unknown(String),
}

impl Command {
    /// Decode a raw payload. Never fails: unrecognised payloads map to `Unknown`.
    pub fn parse(payload: &str) -> Self {
        match payload.trim() {
            "update" => Command::Update,
            "restart" => Command::Restart,
            "status" => Command::Status,
            other => Command::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Update => f.write_str("update"),
            Command::Restart => f.write_str("restart"),
            Command::Status => f.write_str("status"),
            Command::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}
