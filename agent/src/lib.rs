//! IoT Agent Library
//!
//! Keeps one containerized workload on a device up to date and reports on it
//! to a central backend.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod mqtt;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod utils;
pub mod workers;
