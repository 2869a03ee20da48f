//! Bot submission and moderation endpoints.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};
use crate::mailer::EmailMessage;
use crate::types::{BotId, BotRecord, EnvVarSpec, UserId};

use super::{failure, AppState, ErrorResponse};

/// Request to submit a new bot.
#[derive(Debug, Deserialize)]
pub struct SubmitBotRequest {
    /// Submitting user.
    pub owner_id: String,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Source repository the platform builds from.
    pub repo_url: String,
    /// Branch to build. Defaults to `main`.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Declared environment variable schema.
    #[serde(default)]
    pub env_schema: Vec<EnvVarSpec>,
    /// Deployment cost in coins.
    pub cost: i64,
}

fn default_branch() -> String {
    "main".to_owned()
}

/// Request to edit a bot. Editing resets approval.
#[derive(Debug, Deserialize)]
pub struct UpdateBotRequest {
    /// Acting user (must own the bot).
    pub owner_id: String,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Source repository.
    pub repo_url: String,
    /// Branch to build.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Declared environment variable schema.
    #[serde(default)]
    pub env_schema: Vec<EnvVarSpec>,
    /// Deployment cost in coins.
    pub cost: i64,
}

/// Query parameters for listing bots.
#[derive(Debug, Default, Deserialize)]
pub struct ListBotsQuery {
    /// When false, include unapproved bots. Defaults to approved only.
    pub approved: Option<bool>,
}

/// Response for a bot.
#[derive(Debug, Serialize)]
pub struct BotResponse {
    /// Bot ID.
    pub id: String,
    /// Owning user.
    pub owner_id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Source repository.
    pub repo_url: String,
    /// Branch.
    pub branch: String,
    /// Environment variable schema.
    pub env_schema: Vec<EnvVarSpec>,
    /// Deployment cost in coins.
    pub cost: i64,
    /// Whether the bot is approved for deployment.
    pub approved: bool,
}

/// Validate bot fields shared by submission and edit.
fn validate_bot(
    name: &str,
    repo_url: &str,
    branch: &str,
    env_schema: &[EnvVarSpec],
    cost: i64,
) -> ControlResult<()> {
    if name.trim().is_empty() {
        return Err(ControlError::validation("bot name must not be empty"));
    }
    if !(repo_url.starts_with("https://")
        || repo_url.starts_with("http://")
        || repo_url.starts_with("git@"))
    {
        return Err(ControlError::validation(
            "malformed repository reference: expected an http(s) or git URL",
        ));
    }
    if branch.trim().is_empty() {
        return Err(ControlError::validation("branch must not be empty"));
    }
    if cost < 1 {
        return Err(ControlError::validation(
            "deployment cost must be at least one coin",
        ));
    }

    let mut seen = HashSet::new();
    for spec in env_schema {
        if spec.key.trim().is_empty() {
            return Err(ControlError::validation(
                "environment variable names must not be empty",
            ));
        }
        if !seen.insert(spec.key.as_str()) {
            return Err(ControlError::validation(format!(
                "duplicate environment variable: {}",
                spec.key
            )));
        }
    }

    Ok(())
}

/// Submit a new bot. It starts unapproved.
pub async fn submit_bot(
    State(state): State<AppState>,
    Json(request): Json<SubmitBotRequest>,
) -> Result<(StatusCode, Json<BotResponse>), (StatusCode, Json<ErrorResponse>)> {
    validate_bot(
        &request.name,
        &request.repo_url,
        &request.branch,
        &request.env_schema,
        request.cost,
    )
    .map_err(|e| failure(&e))?;

    let owner_id = UserId::new(&request.owner_id);
    state
        .store
        .get_user(&owner_id)
        .await
        .map_err(|e| failure(&e))?
        .ok_or_else(|| failure(&ControlError::UserNotFound(request.owner_id.clone())))?;

    let bot = BotRecord::new(
        owner_id,
        &request.name,
        &request.description,
        &request.repo_url,
        &request.branch,
        request.env_schema,
        request.cost,
    );

    state
        .store
        .insert_bot(&bot)
        .await
        .map_err(|e| failure(&e))?;

    info!(bot_id = %bot.id, name = %bot.name, "bot submitted for moderation");

    Ok((StatusCode::CREATED, Json(bot_to_response(bot))))
}

/// List bots. Approved only by default.
pub async fn list_bots(
    State(state): State<AppState>,
    Query(query): Query<ListBotsQuery>,
) -> Result<Json<Vec<BotResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let approved_only = query.approved.unwrap_or(true);

    let bots = state
        .store
        .list_bots(approved_only)
        .await
        .map_err(|e| failure(&e))?;

    Ok(Json(bots.into_iter().map(bot_to_response).collect()))
}

/// Get a bot by ID.
pub async fn get_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BotResponse>, (StatusCode, Json<ErrorResponse>)> {
    let bot_id = BotId::new(&id);

    let bot = state
        .store
        .get_bot(&bot_id)
        .await
        .map_err(|e| failure(&e))?
        .ok_or_else(|| failure(&ControlError::BotNotFound(id)))?;

    Ok(Json(bot_to_response(bot)))
}

/// Edit a bot. Resets approval so the change goes back through moderation.
pub async fn update_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateBotRequest>,
) -> Result<Json<BotResponse>, (StatusCode, Json<ErrorResponse>)> {
    validate_bot(
        &request.name,
        &request.repo_url,
        &request.branch,
        &request.env_schema,
        request.cost,
    )
    .map_err(|e| failure(&e))?;

    let bot_id = BotId::new(&id);
    let mut bot = state
        .store
        .get_bot(&bot_id)
        .await
        .map_err(|e| failure(&e))?
        .ok_or_else(|| failure(&ControlError::BotNotFound(id.clone())))?;

    // Someone else's bot looks like a missing one.
    if bot.owner.as_str() != request.owner_id {
        return Err(failure(&ControlError::BotNotFound(id)));
    }

    bot.name = request.name;
    bot.description = request.description;
    bot.repo_url = request.repo_url;
    bot.branch = request.branch;
    bot.env_schema = request.env_schema;
    bot.cost = request.cost;
    bot.approved = false;
    bot.updated_at = chrono::Utc::now();

    state
        .store
        .update_bot(&bot)
        .await
        .map_err(|e| failure(&e))?;

    info!(bot_id = %bot.id, "bot edited, approval reset");

    Ok(Json(bot_to_response(bot)))
}

/// Approve a bot for deployment.
pub async fn approve_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    moderate(&state, &id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Reject a bot.
pub async fn reject_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    moderate(&state, &id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn moderate(
    state: &AppState,
    id: &str,
    approved: bool,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let bot_id = BotId::new(id);

    let bot = state
        .store
        .get_bot(&bot_id)
        .await
        .map_err(|e| failure(&e))?
        .ok_or_else(|| failure(&ControlError::BotNotFound(id.to_owned())))?;

    state
        .store
        .set_bot_approval(&bot_id, approved)
        .await
        .map_err(|e| failure(&e))?;

    info!(bot_id = %id, approved, "bot moderated");

    if let Ok(Some(owner)) = state.store.get_user(&bot.owner).await {
        let (subject, verdict) = if approved {
            ("Your bot was approved", "approved and is now deployable")
        } else {
            ("Your bot was rejected", "rejected by a moderator")
        };
        let message = EmailMessage {
            to: owner.email,
            subject: subject.to_owned(),
            body: format!("Your bot {} was {verdict}.", bot.name),
        };
        if let Err(e) = state.mailer.send(&message).await {
            warn!(error = %e, "failed to send moderation notification");
        }
    }

    Ok(())
}

fn bot_to_response(bot: BotRecord) -> BotResponse {
    BotResponse {
        id: bot.id.to_string(),
        owner_id: bot.owner.to_string(),
        name: bot.name,
        description: bot.description,
        repo_url: bot.repo_url,
        branch: bot.branch,
        env_schema: bot.env_schema,
        cost: bot.cost,
        approved: bot.approved,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::{router, test_state};
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use crate::types::UserRecord;

    #[test]
    fn validation_catches_malformed_input() {
        assert!(validate_bot("echo", "https://github.com/a/b", "main", &[], 1).is_ok());
        assert!(validate_bot("echo", "git@github.com:a/b.git", "main", &[], 1).is_ok());

        assert!(validate_bot("", "https://github.com/a/b", "main", &[], 1).is_err());
        assert!(validate_bot("echo", "ftp://nope", "main", &[], 1).is_err());
        assert!(validate_bot("echo", "https://github.com/a/b", "", &[], 1).is_err());
        assert!(validate_bot("echo", "https://github.com/a/b", "main", &[], 0).is_err());

        let duplicated = vec![
            EnvVarSpec {
                key: "A".to_owned(),
                default: None,
                required: false,
            },
            EnvVarSpec {
                key: "A".to_owned(),
                default: None,
                required: true,
            },
        ];
        assert!(validate_bot("echo", "https://github.com/a/b", "main", &duplicated, 1).is_err());
    }

    #[tokio::test]
    async fn submit_then_moderate() {
        let state = test_state();
        let store = state.store.clone();

        let owner = UserRecord::new("owner@example.com", "hash", None);
        store.insert_user(&owner).await.unwrap();

        let app = router(state);

        let body = format!(
            r#"{{
                "owner_id": "{}",
                "name": "echo-bot",
                "repo_url": "https://github.com/acme/echo-bot",
                "cost": 10
            }}"#,
            owner.id
        );
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/bots")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let bot: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(bot["approved"], false);
        let bot_id = bot["id"].as_str().unwrap();

        // Unapproved bots stay off the default listing.
        let listing = app
            .clone()
            .oneshot(Request::builder().uri("/bots").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(listing.into_body(), usize::MAX)
            .await
            .unwrap();
        let listed: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert!(listed.is_empty());

        let approve = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/bots/{bot_id}/approve"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(approve.status(), StatusCode::NO_CONTENT);

        let listing = app
            .oneshot(Request::builder().uri("/bots").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(listing.into_body(), usize::MAX)
            .await
            .unwrap();
        let listed: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn edit_resets_approval() {
        let state = test_state();
        let store = state.store.clone();

        let owner = UserRecord::new("owner@example.com", "hash", None);
        store.insert_user(&owner).await.unwrap();

        let mut bot = BotRecord::new(
            owner.id.clone(),
            "echo-bot",
            "",
            "https://github.com/acme/echo-bot",
            "main",
            vec![],
            10,
        );
        bot.approved = true;
        store.insert_bot(&bot).await.unwrap();

        let app = router(state);

        let body = format!(
            r#"{{
                "owner_id": "{}",
                "name": "echo-bot",
                "repo_url": "https://github.com/acme/echo-bot",
                "cost": 12
            }}"#,
            owner.id
        );
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/bots/{}", bot.id))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = store.get_bot(&bot.id).await.unwrap().unwrap();
        assert!(!stored.approved);
        assert_eq!(stored.cost, 12);
    }
}
