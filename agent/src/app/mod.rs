//! Agent application: wiring, shared state and the controller

pub mod controller;
pub mod options;
pub mod run;
pub mod state;
