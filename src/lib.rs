//! Fleet agent: pulls jobs from the fleet server, resolves their packages
//! and runs them in isolated executions.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod identity;
pub mod package;
pub mod runner;
pub mod screenshot;
pub mod workspace;
