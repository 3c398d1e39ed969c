//! HTTP clients for the backend and the image registry

pub mod backend;
pub mod client;
pub mod registry;
