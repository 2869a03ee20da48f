//! Deployment lifecycle orchestration.

mod manager;

pub use manager::{resolve_env, DeployReceipt, DeployRequest, DeploymentManager};
