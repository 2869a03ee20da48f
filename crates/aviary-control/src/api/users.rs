//! User, verification and coin economy endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ControlError;
use crate::mailer::EmailMessage;
use crate::store::EntryFilter;
use crate::types::{LedgerEntry, UserId, UserRecord};

use super::{failure, AppState, ErrorResponse};

/// Request to register a user.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Email address (unique).
    pub email: String,
    /// Pre-hashed credential. Authentication mechanics live elsewhere.
    pub password_hash: String,
    /// Another user's referral code, if the signup was invited.
    pub referral_code: Option<String>,
}

/// Response after registration.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    /// New user's ID.
    pub id: String,
    /// The user's own referral code to share.
    pub referral_code: String,
}

/// Public user profile.
#[derive(Debug, Serialize)]
pub struct UserResponse {
    /// User ID.
    pub id: String,
    /// Email address.
    pub email: String,
    /// Current coin balance.
    pub coins: i64,
    /// Referral code to share.
    pub referral_code: String,
    /// Whether the user completed verification.
    pub verified: bool,
}

/// Request for a peer-to-peer transfer.
#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    /// Receiving user.
    pub receiver_id: String,
    /// Coins to move.
    pub amount: i64,
}

/// Request for an operator grant.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    /// Coins to credit.
    pub amount: i64,
    /// Reason recorded on the ledger entry.
    #[serde(default)]
    pub description: String,
}

/// Query parameters for the coin history listing.
#[derive(Debug, Default, Deserialize)]
pub struct LedgerQuery {
    /// Filter by entry kind.
    pub kind: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// One coin movement in a history listing.
#[derive(Debug, Serialize)]
pub struct LedgerEntryResponse {
    /// Entry ID.
    pub id: String,
    /// Debited user, if any.
    pub sender: Option<String>,
    /// Credited user, if any.
    pub receiver: Option<String>,
    /// Coins moved.
    pub amount: i64,
    /// Kind of movement.
    pub kind: String,
    /// Description.
    pub description: String,
    /// When the entry was written.
    pub created_at: String,
}

/// Verification outcome.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    /// User ID.
    pub id: String,
    /// Always true after a successful call.
    pub verified: bool,
}

/// Register a new user, optionally attributed to a referrer.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), (StatusCode, Json<ErrorResponse>)> {
    if !request.email.contains('@') {
        return Err(failure(&ControlError::validation("malformed email address")));
    }
    if request.password_hash.is_empty() {
        return Err(failure(&ControlError::validation(
            "credential hash must not be empty",
        )));
    }

    let existing = state
        .store
        .get_user_by_email(&request.email)
        .await
        .map_err(|e| failure(&e))?;
    if existing.is_some() {
        return Err(failure(&ControlError::validation(
            "email already registered",
        )));
    }

    let referred_by = match request.referral_code {
        Some(ref code) => {
            let referrer = state
                .store
                .get_user_by_referral_code(code)
                .await
                .map_err(|e| failure(&e))?
                .ok_or_else(|| failure(&ControlError::validation("unknown referral code")))?;
            Some(referrer.id)
        }
        None => None,
    };

    let user = UserRecord::new(&request.email, &request.password_hash, referred_by);
    state
        .store
        .insert_user(&user)
        .await
        .map_err(|e| failure(&e))?;

    info!(user_id = %user.id, referred = user.referred_by.is_some(), "user registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user.id.to_string(),
            referral_code: user.referral_code,
        }),
    ))
}

/// Get a user's profile and balance.
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user_id = UserId::new(&id);
    let user = state
        .store
        .get_user(&user_id)
        .await
        .map_err(|e| failure(&e))?
        .ok_or_else(|| failure(&ControlError::UserNotFound(id)))?;

    Ok(Json(user_to_response(&user)))
}

/// Mark a user verified.
///
/// The first successful call credits referral rewards when the user was
/// referred; later calls are no-ops so the rewards cannot double-fire.
pub async fn verify_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VerifyResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user_id = UserId::new(&id);

    let changed = state
        .store
        .mark_verified(&user_id)
        .await
        .map_err(|e| failure(&e))?;

    if changed {
        let user = state
            .store
            .get_user(&user_id)
            .await
            .map_err(|e| failure(&e))?
            .ok_or_else(|| failure(&ControlError::UserNotFound(id.clone())))?;

        if let Some(ref referrer_id) = user.referred_by {
            state
                .ledger
                .grant_referral_rewards(referrer_id, &user)
                .await
                .map_err(|e| failure(&e))?;

            notify_referrer(&state, referrer_id, &user.email).await;
        }
    }

    Ok(Json(VerifyResponse { id, verified: true }))
}

/// Claim the daily coin credit.
pub async fn claim_daily(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LedgerEntryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user_id = UserId::new(&id);

    let entry = state
        .ledger
        .claim_daily(&user_id)
        .await
        .map_err(|e| failure(&e))?;

    Ok(Json(entry_to_response(entry)))
}

/// Transfer coins to another user.
pub async fn transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<LedgerEntryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let sender_id = UserId::new(&id);
    let receiver_id = UserId::new(&request.receiver_id);

    let entry = state
        .ledger
        .transfer(&sender_id, &receiver_id, request.amount)
        .await
        .map_err(|e| failure(&e))?;

    Ok(Json(entry_to_response(entry)))
}

/// Operator credit.
pub async fn grant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<GrantRequest>,
) -> Result<(StatusCode, Json<LedgerEntryResponse>), (StatusCode, Json<ErrorResponse>)> {
    let user_id = UserId::new(&id);

    let description = if request.description.is_empty() {
        "operator grant".to_owned()
    } else {
        request.description
    };

    let entry = state
        .ledger
        .admin_grant(&user_id, request.amount, description)
        .await
        .map_err(|e| failure(&e))?;

    Ok((StatusCode::CREATED, Json(entry_to_response(entry))))
}

/// List the user's coin history, newest first.
pub async fn list_ledger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<Vec<LedgerEntryResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let user_id = UserId::new(&id);

    let mut filter = EntryFilter::new();
    if let Some(ref kind_str) = query.kind {
        match kind_str.parse() {
            Ok(kind) => filter = filter.with_kind(kind),
            Err(_) => {
                return Err(failure(&ControlError::validation(format!(
                    "unknown entry kind: {kind_str}"
                ))));
            }
        }
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    let entries = state
        .ledger
        .history(&user_id, &filter)
        .await
        .map_err(|e| failure(&e))?;

    Ok(Json(entries.into_iter().map(entry_to_response).collect()))
}

async fn notify_referrer(state: &AppState, referrer_id: &UserId, referred_email: &str) {
    let referrer = match state.store.get_user(referrer_id).await {
        Ok(Some(referrer)) => referrer,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "failed to load referrer for notification");
            return;
        }
    };

    let message = EmailMessage {
        to: referrer.email,
        subject: "You earned referral coins".to_owned(),
        body: format!(
            "{referred_email} just verified their account. Referral rewards \
             were credited to your balance."
        ),
    };

    if let Err(e) = state.mailer.send(&message).await {
        warn!(error = %e, "failed to send referral notification");
    }
}

fn user_to_response(user: &UserRecord) -> UserResponse {
    UserResponse {
        id: user.id.to_string(),
        email: user.email.clone(),
        coins: user.coins,
        referral_code: user.referral_code.clone(),
        verified: user.verified,
    }
}

fn entry_to_response(entry: LedgerEntry) -> LedgerEntryResponse {
    LedgerEntryResponse {
        id: entry.id.to_string(),
        sender: entry.sender.map(|s| s.to_string()),
        receiver: entry.receiver.map(|r| r.to_string()),
        amount: entry.amount,
        kind: entry.kind.as_str().to_owned(),
        description: entry.description,
        created_at: entry.created_at.to_rfc3339(),
    }
}
