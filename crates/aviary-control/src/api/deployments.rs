//! Deployment management endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deployment::DeployRequest;
use crate::store::DeploymentFilter;
use crate::types::{BotId, DeploymentId, DeploymentRecord, UserId};

use super::{failure, AppState, ErrorResponse};

/// Request to create a new deployment.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    /// Deploying user.
    pub user_id: String,
    /// Bot template to deploy.
    pub bot_id: String,
    /// Environment variable overrides.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Response for creating a deployment.
#[derive(Debug, Serialize)]
pub struct CreateDeploymentResponse {
    /// The assigned deployment ID.
    pub id: String,
    /// Provisional application name on the external platform.
    pub app_name: String,
    /// Initial status.
    pub status: String,
}

/// Query parameters for listing deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Filter by owning user.
    pub user_id: Option<String>,
    /// Filter by status.
    pub status: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Response for a deployment.
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    /// Deployment ID.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Deployed bot.
    pub bot_id: String,
    /// Application name on the external platform.
    pub app_name: String,
    /// Current status.
    pub status: String,
    /// Coins charged.
    pub cost: i64,
    /// Applied environment variables.
    pub vars: BTreeMap<String, String>,
    /// Provisioning journal.
    pub log: String,
    /// Error message (if failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// Request body carrying the acting user for reconfiguration.
#[derive(Debug, Deserialize)]
pub struct ReconfigureRequest {
    /// Acting user (must own the deployment).
    pub user_id: String,
    /// New environment variable values.
    pub vars: BTreeMap<String, String>,
}

/// Request body carrying the acting user.
#[derive(Debug, Deserialize)]
pub struct ActingUserRequest {
    /// Acting user (must own the deployment).
    pub user_id: String,
}

/// Query carrying the acting user for deletion.
#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    /// Acting user (must own the deployment).
    pub user_id: String,
}

/// Create a new deployment.
///
/// Returns `202 Accepted` once the charge is committed; provisioning runs
/// detached and is observed through status polling.
pub async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<CreateDeploymentResponse>), (StatusCode, Json<ErrorResponse>)> {
    let deploy_request = DeployRequest {
        user_id: UserId::new(&request.user_id),
        bot_id: BotId::new(&request.bot_id),
        vars: request.vars,
    };

    info!(
        user_id = %request.user_id,
        bot_id = %request.bot_id,
        "creating deployment via API"
    );

    let receipt = state
        .manager
        .create(deploy_request)
        .await
        .map_err(|e| failure(&e))?;

    Arc::clone(&state.manager).spawn_provisioning(receipt.id.clone());

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateDeploymentResponse {
            id: receipt.id.to_string(),
            app_name: receipt.app_name,
            status: "pending".to_owned(),
        }),
    ))
}

/// Get a deployment by ID.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentResponse>, (StatusCode, Json<ErrorResponse>)> {
    let deployment_id = DeploymentId::new(&id);

    match state.manager.get(&deployment_id).await {
        Ok(Some(record)) => Ok(Json(record_to_response(record))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("deployment not found: {id}"),
            }),
        )),
        Err(e) => Err(failure(&e)),
    }
}

/// List deployments with optional filters.
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<DeploymentResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let mut filter = DeploymentFilter::new();

    if let Some(user_id) = query.user_id {
        filter = filter.with_user(UserId::new(&user_id));
    }
    if let Some(status_str) = query.status {
        if let Ok(status) = status_str.parse() {
            filter = filter.with_status(status);
        }
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    let records = state
        .manager
        .list(&filter)
        .await
        .map_err(|e| failure(&e))?;

    Ok(Json(records.into_iter().map(record_to_response).collect()))
}

/// Reconfigure an active deployment. Paid operation.
pub async fn reconfigure(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReconfigureRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let deployment_id = DeploymentId::new(&id);
    let user_id = UserId::new(&request.user_id);

    state
        .manager
        .reconfigure(&deployment_id, &user_id, &request.vars)
        .await
        .map_err(|e| failure(&e))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Restart the external application.
pub async fn restart(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActingUserRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let deployment_id = DeploymentId::new(&id);
    let user_id = UserId::new(&request.user_id);

    state
        .manager
        .restart(&deployment_id, &user_id)
        .await
        .map_err(|e| failure(&e))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Emergency stop by an operator.
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let deployment_id = DeploymentId::new(&id);

    info!(deployment_id = %id, "stopping deployment via API");

    state
        .manager
        .stop(&deployment_id)
        .await
        .map_err(|e| failure(&e))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Delete a deployment. No refund.
pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let deployment_id = DeploymentId::new(&id);
    let user_id = UserId::new(&query.user_id);

    info!(deployment_id = %id, user_id = %query.user_id, "deleting deployment via API");

    state
        .manager
        .delete(&deployment_id, &user_id)
        .await
        .map_err(|e| failure(&e))?;

    Ok(StatusCode::NO_CONTENT)
}

fn record_to_response(record: DeploymentRecord) -> DeploymentResponse {
    DeploymentResponse {
        id: record.data.id.to_string(),
        user_id: record.data.user_id.to_string(),
        bot_id: record.data.bot_id.to_string(),
        app_name: record.data.app_name,
        status: record.status.as_str().to_owned(),
        cost: record.data.cost,
        vars: record.data.vars,
        log: record.data.log,
        error: record.data.error,
        created_at: record.data.created_at.to_rfc3339(),
        updated_at: record.data.updated_at.to_rfc3339(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::{router, test_state};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use crate::types::{AccountRecord, BotRecord, UserRecord};

    #[tokio::test]
    async fn list_deployments_empty() {
        let app = router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_deployment_not_found() {
        let app = router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments/nonexistent-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_deployment_not_found() {
        let app = router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/deployments/nonexistent-id?user_id=nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_deployment_is_accepted() {
        let state = test_state();

        let mut user = UserRecord::new("deployer@example.com", "hash", None);
        user.coins = 50;
        state.store.insert_user(&user).await.unwrap();

        let mut bot = BotRecord::new(
            user.id.clone(),
            "echo-bot",
            "",
            "https://github.com/acme/echo-bot",
            "main",
            vec![],
            10,
        );
        bot.approved = true;
        state.store.insert_bot(&bot).await.unwrap();

        let account = AccountRecord::new("pool-1", "token", 5);
        state.store.insert_account(&account).await.unwrap();

        let app = router(state);

        let body = format!(
            r#"{{"user_id": "{}", "bot_id": "{}"}}"#,
            user.id, bot.id
        );
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/deployments")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn create_deployment_rejects_unknown_bot() {
        let state = test_state();

        let mut user = UserRecord::new("deployer@example.com", "hash", None);
        user.coins = 50;
        state.store.insert_user(&user).await.unwrap();

        let app = router(state);

        let body = format!(r#"{{"user_id": "{}", "bot_id": "missing"}}"#, user.id);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/deployments")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
