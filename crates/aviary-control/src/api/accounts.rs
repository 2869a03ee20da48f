//! Deployment account pool endpoints (operator surface).

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ControlError;
use crate::types::AccountRecord;

use super::{failure, AppState, ErrorResponse};

/// Request to add a deployment account to the pool.
#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    /// Operator-facing label.
    pub name: String,
    /// Platform API token. Validated against the platform before insert.
    pub credential: String,
    /// Capacity ceiling.
    pub max_deployments: i32,
}

/// Response for an account. Never carries the credential.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    /// Account ID.
    pub id: String,
    /// Label.
    pub name: String,
    /// Whether the account participates in allocation.
    pub active: bool,
    /// Live deployments currently assigned.
    pub used_count: i32,
    /// Capacity ceiling.
    pub max_deployments: i32,
}

/// Add an account to the pool.
///
/// The credential is validated synchronously against the platform's
/// account-info endpoint; a platform failure here surfaces to the caller.
pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), (StatusCode, Json<ErrorResponse>)> {
    if request.name.trim().is_empty() {
        return Err(failure(&ControlError::validation(
            "account name must not be empty",
        )));
    }
    if request.max_deployments < 1 {
        return Err(failure(&ControlError::validation(
            "max_deployments must be at least one",
        )));
    }

    let platform_account = state
        .paas
        .account_info(&request.credential)
        .await
        .map_err(|e| failure(&e))?;

    let account = AccountRecord::new(&request.name, &request.credential, request.max_deployments);
    state
        .store
        .insert_account(&account)
        .await
        .map_err(|e| failure(&e))?;

    info!(
        account_id = %account.id,
        name = %account.name,
        platform_email = %platform_account.email,
        max_deployments = account.max_deployments,
        "deployment account added to pool"
    );

    Ok((StatusCode::CREATED, Json(account_to_response(&account))))
}

/// List the account pool.
pub async fn list_accounts(
    State(state): State<AppState>,
) -> Result<Json<Vec<AccountResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let accounts = state
        .store
        .list_accounts()
        .await
        .map_err(|e| failure(&e))?;

    Ok(Json(
        accounts.iter().map(account_to_response).collect(),
    ))
}

fn account_to_response(account: &AccountRecord) -> AccountResponse {
    AccountResponse {
        id: account.id.to_string(),
        name: account.name.clone(),
        active: account.active,
        used_count: account.used_count,
        max_deployments: account.max_deployments,
    }
}
