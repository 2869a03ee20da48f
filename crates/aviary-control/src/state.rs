//! Typestate pattern for the deployment state machine.
//!
//! Deployment states are encoded in the type system so invalid transitions
//! are a compile-time error rather than a runtime one. The persisted status
//! column remains the source of truth across restarts; [`AnyDeployment`]
//! bridges the two when loading from the store.
//!
//! ```text
//! Pending ──▶ Configuring ──▶ Active ──▶ Stopped
//!    │             │
//!    ▼             ▼
//!  Failed        Failed
//! ```

use std::marker::PhantomData;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentData, DeploymentId, DeploymentStatus};

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status representation.
    fn persisted() -> DeploymentStatus;

    /// Get the state name for error messages.
    fn name() -> &'static str;
}

mod private {
    pub trait Sealed {}
}

/// Deployment created and charged, waiting for provisioning to start.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// External application and build in progress.
#[derive(Debug, Clone, Copy)]
pub struct Configuring;

/// Deployment is live.
#[derive(Debug, Clone, Copy)]
pub struct Active;

/// Provisioning failed; coins were refunded.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

/// Stopped by an operator.
#[derive(Debug, Clone, Copy)]
pub struct Stopped;

impl private::Sealed for Pending {}
impl private::Sealed for Configuring {}
impl private::Sealed for Active {}
impl private::Sealed for Failed {}
impl private::Sealed for Stopped {}

impl DeploymentState for Pending {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Pending
    }
    fn name() -> &'static str {
        "pending"
    }
}

impl DeploymentState for Configuring {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Configuring
    }
    fn name() -> &'static str {
        "configuring"
    }
}

impl DeploymentState for Active {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Active
    }
    fn name() -> &'static str {
        "active"
    }
}

impl DeploymentState for Failed {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Failed
    }
    fn name() -> &'static str {
        "failed"
    }
}

impl DeploymentState for Stopped {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Stopped
    }
    fn name() -> &'static str {
        "stopped"
    }
}

/// A deployment in a specific state.
///
/// The state parameter `S` determines which transitions are available.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current state as a persisted value.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::persisted()
    }

    /// Convert into the underlying data (consuming the deployment).
    #[must_use]
    pub fn into_data(self) -> DeploymentData {
        self.data
    }

    /// Internal helper to transition to a new state.
    fn transition<T: DeploymentState>(self) -> Deployment<T> {
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }

    /// Internal helper to transition with data modification.
    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.data.updated_at = chrono::Utc::now();
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }
}

impl Deployment<Pending> {
    /// Create a new deployment in the pending state.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Begin provisioning the external application.
    #[must_use]
    pub fn start_configuring(self) -> Deployment<Configuring> {
        self.transition()
    }

    /// Fail before provisioning started.
    #[must_use]
    pub fn fail(self, error: String) -> Deployment<Failed> {
        self.transition_with(|data| {
            data.error = Some(error);
        })
    }
}

impl Deployment<Configuring> {
    /// Mark the deployment live.
    #[must_use]
    pub fn activate(self) -> Deployment<Active> {
        self.transition()
    }

    /// Fail during provisioning.
    #[must_use]
    pub fn fail(self, error: String) -> Deployment<Failed> {
        self.transition_with(|data| {
            data.error = Some(error);
        })
    }
}

impl Deployment<Active> {
    /// Stop the deployment (operator action).
    #[must_use]
    pub fn stop(self) -> Deployment<Stopped> {
        self.transition()
    }
}

/// A type-erased deployment that can be in any state.
///
/// Used when loading from the store, where the status is not known at
/// compile time.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment in pending state.
    Pending(Deployment<Pending>),
    /// Deployment in configuring state.
    Configuring(Deployment<Configuring>),
    /// Deployment in active state.
    Active(Deployment<Active>),
    /// Deployment in failed state.
    Failed(Deployment<Failed>),
    /// Deployment in stopped state.
    Stopped(Deployment<Stopped>),
}

impl AnyDeployment {
    /// Create an `AnyDeployment` from data and a persisted status.
    #[must_use]
    pub const fn from_persisted(data: DeploymentData, status: DeploymentStatus) -> Self {
        match status {
            DeploymentStatus::Pending => Self::Pending(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Configuring => Self::Configuring(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Active => Self::Active(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Failed => Self::Failed(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Stopped => Self::Stopped(Deployment {
                data,
                _state: PhantomData,
            }),
        }
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Pending(d) => d.data(),
            Self::Configuring(d) => d.data(),
            Self::Active(d) => d.data(),
            Self::Failed(d) => d.data(),
            Self::Stopped(d) => d.data(),
        }
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Pending(_) => DeploymentStatus::Pending,
            Self::Configuring(_) => DeploymentStatus::Configuring,
            Self::Active(_) => DeploymentStatus::Active,
            Self::Failed(_) => DeploymentStatus::Failed,
            Self::Stopped(_) => DeploymentStatus::Stopped,
        }
    }

    /// Try to extract a pending deployment.
    pub fn try_into_pending(self) -> ControlResult<Deployment<Pending>> {
        match self {
            Self::Pending(d) => Ok(d),
            other => Err(ControlError::InvalidStateTransition {
                from: other.status().as_str(),
                to: "pending",
            }),
        }
    }

    /// Try to extract an active deployment.
    pub fn try_into_active(self) -> ControlResult<Deployment<Active>> {
        match self {
            Self::Active(d) => Ok(d),
            other => Err(ControlError::InvalidStateTransition {
                from: other.status().as_str(),
                to: "active",
            }),
        }
    }

    /// Check if the deployment is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Stopped(_))
    }
}
