//! Long-running workers

pub mod commands;
pub mod scheduler;
