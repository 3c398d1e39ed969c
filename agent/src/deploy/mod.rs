//! Workload deployment: versions, container lifecycle and update orchestration

pub mod docker;
pub mod fsm;
pub mod lifecycle;
pub mod orchestrator;
pub mod policy;
pub mod version;
