//! Subsystems built on the core store.

pub mod audit;
pub mod capability;
pub mod contradiction;
pub mod documents;
pub mod drift;
pub mod export;
pub mod remediation;
pub mod session;
