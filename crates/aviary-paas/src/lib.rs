//! Client for the external PaaS deployment API.
//!
//! Aviary runs every bot as an application on a third-party platform. This
//! crate wraps the slice of that platform's HTTP API the control plane
//! consumes:
//!
//! - application lifecycle (create, delete)
//! - source builds (repository URL + branch)
//! - configuration variables (key/value map)
//! - restart, implemented by the platform as dyno deletion
//! - log sessions (list, delete)
//! - account info lookup, used to validate credentials before an account
//!   joins the deployment pool
//!
//! Credentials are passed per call rather than held by the client: each
//! deployment account in the pool carries its own API token.

#![forbid(unsafe_code)]

mod client;
mod error;
mod types;

pub use client::PaasClient;
pub use error::{PaasError, PaasResult};
pub use types::{AccountInfo, AppInfo, BuildInfo, ConfigVars, LogSession};
