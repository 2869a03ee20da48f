//! Aviary Control Plane
//!
//! This crate provides the backend for hosting third-party bots on an
//! external deployment platform, gated by a coin economy. It coordinates
//! three things:
//!
//! - **Account allocation**: picking a deployment-capable platform account
//!   with spare capacity from a pool, least utilised first, with a
//!   max-headroom fallback when everything is saturated
//! - **Deployment lifecycle**: charging the user, driving the external
//!   application through `pending → configuring → active`, and compensating
//!   (refund + capacity release) when provisioning fails
//! - **The ledger**: an append-only record of every coin movement with an
//!   atomically-maintained denormalised balance
//!
//! # State Machine
//!
//! Deployments follow a strict state machine enforced at compile time using
//! the typestate pattern:
//!
//! ```text
//! Pending ──▶ Configuring ──▶ Active ──▶ Stopped
//!    │             │
//!    ▼             ▼
//!  Failed        Failed
//! ```
//!
//! The creation endpoint returns as soon as the charge is committed;
//! provisioning runs as a detached task and reports through the
//! deployment's status and log journal.

#![forbid(unsafe_code)]

pub mod allocator;
pub mod api;
pub mod config;
pub mod deployment;
pub mod error;
pub mod ledger;
pub mod mailer;
pub mod paas;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::{DeployReceipt, DeployRequest, DeploymentManager};
pub use error::{ControlError, ControlResult};
pub use ledger::Ledger;
pub use state::{Active, AnyDeployment, Configuring, Deployment, Failed, Pending, Stopped};
pub use store::{DeploymentFilter, EntryFilter, MemoryStore, PlatformStore, PostgresStore};
pub use types::{
    AccountId, AccountRecord, BotId, BotRecord, DeploymentData, DeploymentId, DeploymentRecord,
    DeploymentStatus, EntryKind, EnvVarSpec, LedgerEntry, UserId, UserRecord,
};
