//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Deployment management (create, query, reconfigure, restart, delete, stop)
//! - The coin economy (daily claim, transfers, grants, history)
//! - User registration and verification (referral rewards hang off the latter)
//! - Bot submission and moderation
//! - The deployment account pool
//! - Health and readiness checks, plus a plaintext metrics gauge
//!
//! Authentication is out of scope; callers identify themselves with explicit
//! user ids.

mod accounts;
mod bots;
mod deployments;
mod users;

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use crate::deployment::DeploymentManager;
use crate::error::ControlError;
use crate::ledger::Ledger;
use crate::mailer::Mailer;
use crate::paas::PaasProvider;
use crate::store::{DeploymentFilter, PlatformStore};
use crate::types::DeploymentStatus;

pub use accounts::{AccountResponse, CreateAccountRequest};
pub use bots::{BotResponse, SubmitBotRequest, UpdateBotRequest};
pub use deployments::{
    CreateDeploymentRequest, CreateDeploymentResponse, DeploymentResponse, ListDeploymentsQuery,
};
pub use users::{RegisterRequest, RegisterResponse, TransferRequest, UserResponse};

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Deployment manager for lifecycle operations.
    pub manager: Arc<DeploymentManager>,
    /// Coin economy service.
    pub ledger: Arc<Ledger>,
    /// Store for direct queries.
    pub store: Arc<dyn PlatformStore>,
    /// PaaS seam, used to validate account credentials synchronously.
    pub paas: Arc<dyn PaasProvider>,
    /// Fire-and-forget notification mailer.
    pub mailer: Arc<dyn Mailer>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Users and the coin economy
        .route("/users", post(users::register))
        .route("/users/{id}", get(users::get_user))
        .route("/users/{id}/verify", post(users::verify_user))
        .route("/users/{id}/claim-daily", post(users::claim_daily))
        .route("/users/{id}/transfer", post(users::transfer))
        .route("/users/{id}/grant", post(users::grant))
        .route("/users/{id}/ledger", get(users::list_ledger))
        // Bots
        .route("/bots", post(bots::submit_bot))
        .route("/bots", get(bots::list_bots))
        .route("/bots/{id}", get(bots::get_bot))
        .route("/bots/{id}", put(bots::update_bot))
        .route("/bots/{id}/approve", post(bots::approve_bot))
        .route("/bots/{id}/reject", post(bots::reject_bot))
        // Deployment account pool
        .route("/accounts", post(accounts::create_account))
        .route("/accounts", get(accounts::list_accounts))
        // Deployments
        .route("/deployments", post(deployments::create_deployment))
        .route("/deployments", get(deployments::list_deployments))
        .route("/deployments/{id}", get(deployments::get_deployment))
        .route("/deployments/{id}", delete(deployments::delete_deployment))
        .route("/deployments/{id}/config", put(deployments::reconfigure))
        .route("/deployments/{id}/restart", post(deployments::restart))
        .route("/deployments/{id}/stop", post(deployments::stop))
        // Metrics
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

/// Map a control error to an HTTP status code.
pub(crate) const fn error_to_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::UserNotFound(_)
        | ControlError::BotNotFound(_)
        | ControlError::DeploymentNotFound(_)
        | ControlError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        ControlError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        ControlError::BotNotApproved(_) => StatusCode::FORBIDDEN,
        ControlError::NoCapacityAvailable => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::Validation(_) | ControlError::Config(_) => StatusCode::BAD_REQUEST,
        ControlError::DailyCooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
        ControlError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        ControlError::Paas(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn a control error into the standard error response pair.
pub(crate) fn failure(error: &ControlError) -> (StatusCode, Json<ErrorResponse>) {
    (
        error_to_status(error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadyResponse>) {
    let filter = DeploymentFilter::new().with_status(DeploymentStatus::Active);

    match state.store.list_deployments(&filter).await {
        Ok(deployments) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                active_deployments: deployments.len(),
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                active_deployments: 0,
            }),
        ),
    }
}

/// Metrics endpoint.
async fn metrics(State(state): State<AppState>) -> String {
    let mut output = String::new();

    output.push_str("# HELP control_deployments_total Number of deployments by status\n");
    output.push_str("# TYPE control_deployments_total gauge\n");

    for status in DeploymentStatus::all() {
        let filter = DeploymentFilter::new().with_status(status);
        let count = state
            .store
            .list_deployments(&filter)
            .await
            .map(|d| d.len())
            .unwrap_or(0);
        let _ = writeln!(
            output,
            "control_deployments_total{{status=\"{status}\"}} {count}"
        );
    }

    output
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    active_deployments: usize,
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::config::{DeploymentConfig, EconomyConfig, PaasConfig};
    use crate::mailer::NoopMailer;
    use crate::paas::MockPaas;
    use crate::store::MemoryStore;

    let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
    let paas: Arc<dyn PaasProvider> = Arc::new(MockPaas::new());

    let manager = Arc::new(DeploymentManager::new(
        Arc::clone(&store),
        Arc::clone(&paas),
        PaasConfig::default(),
        DeploymentConfig::default(),
    ));
    let ledger = Arc::new(Ledger::new(Arc::clone(&store), EconomyConfig::default()));

    AppState {
        manager,
        ledger,
        store,
        paas,
        mailer: Arc::new(NoopMailer),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint() {
        let app = router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint() {
        let app = router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let app = router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            error_to_status(&ControlError::InsufficientBalance { needed: 10 }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            error_to_status(&ControlError::NoCapacityAvailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_to_status(&ControlError::DailyCooldown {
                remaining_minutes: 5
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            error_to_status(&ControlError::DeploymentNotFound("x".to_owned())),
            StatusCode::NOT_FOUND
        );
    }
}
