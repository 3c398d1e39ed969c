//! MQTT command transport

pub mod client;
pub mod topics;
