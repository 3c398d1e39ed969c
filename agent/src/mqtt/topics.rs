//! MQTT topic definitions

/// Default per-device topics, used when none are configured
pub struct Topics;

impl Topics {
    /// Topic the agent receives commands on
    pub fn command(device_id: u64) -> String {
        format!("agent/{}/cmd", device_id)
    }

    /// Topic the agent publishes status and replies on
    pub fn status(device_id: u64) -> String {
        format!("agent/{}/status", device_id)
    }
}
