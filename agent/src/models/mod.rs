//! Data models shared across the agent

pub mod command;
pub mod container;
pub mod identity;
