//! Storage backends for the control plane.
//!
//! The primary implementation uses PostgreSQL; an in-memory implementation
//! backs the tests. Multi-resource operations the lifecycle depends on
//! (charge + deployment insert, failure + refund + capacity release, ledger
//! append + balance delta) are single trait methods so each backend can make
//! them atomic: one transaction in PostgreSQL, one lock section in memory.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{
    AccountId, AccountRecord, BotId, BotRecord, DeploymentId, DeploymentRecord, DeploymentStatus,
    EntryKind, LedgerEntry, UserId, UserRecord,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by owning user.
    pub user_id: Option<UserId>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            user_id: None,
            status: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by owning user.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Filter criteria for listing ledger entries.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    /// Filter by entry kind.
    pub kind: Option<EntryKind>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl EntryFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Backend for all control-plane state.
#[async_trait]
pub trait PlatformStore: Send + Sync {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert a new user.
    async fn insert_user(&self, user: &UserRecord) -> ControlResult<()>;

    /// Get a user by ID.
    async fn get_user(&self, id: &UserId) -> ControlResult<Option<UserRecord>>;

    /// Get a user by email address.
    async fn get_user_by_email(&self, email: &str) -> ControlResult<Option<UserRecord>>;

    /// Get a user by referral code.
    async fn get_user_by_referral_code(&self, code: &str) -> ControlResult<Option<UserRecord>>;

    /// Mark a user verified.
    ///
    /// Returns `true` only when the flag actually flipped, so referral
    /// rewards stay idempotent under repeated verification calls.
    async fn mark_verified(&self, id: &UserId) -> ControlResult<bool>;

    // ------------------------------------------------------------------
    // Bots
    // ------------------------------------------------------------------

    /// Insert a new bot.
    async fn insert_bot(&self, bot: &BotRecord) -> ControlResult<()>;

    /// Get a bot by ID.
    async fn get_bot(&self, id: &BotId) -> ControlResult<Option<BotRecord>>;

    /// List bots, optionally only approved ones. Newest first.
    async fn list_bots(&self, approved_only: bool) -> ControlResult<Vec<BotRecord>>;

    /// Replace a bot's mutable fields.
    async fn update_bot(&self, bot: &BotRecord) -> ControlResult<()>;

    /// Set a bot's approval flag.
    async fn set_bot_approval(&self, id: &BotId, approved: bool) -> ControlResult<()>;

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Insert a new deployment account.
    async fn insert_account(&self, account: &AccountRecord) -> ControlResult<()>;

    /// Get an account by ID.
    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<AccountRecord>>;

    /// List all accounts.
    async fn list_accounts(&self) -> ControlResult<Vec<AccountRecord>>;

    /// List active accounts ordered by `used_count` ascending.
    async fn active_accounts(&self) -> ControlResult<Vec<AccountRecord>>;

    /// Atomically reserve one deployment slot on the account.
    ///
    /// Increments `used_count` only while `used_count < max_deployments`,
    /// and returns whether the reservation won. Safe to retry on another
    /// candidate when it loses a concurrent race.
    async fn reserve_account(&self, id: &AccountId) -> ControlResult<bool>;

    /// Unconditionally take a slot on the account (saturated fallback).
    async fn force_reserve_account(&self, id: &AccountId) -> ControlResult<()>;

    /// Release one deployment slot. `used_count` never goes below zero.
    async fn release_account(&self, id: &AccountId) -> ControlResult<()>;

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    /// Get a deployment by ID.
    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// List deployments matching the filter. Newest first.
    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>>;

    /// Update a deployment's status and optionally its error message.
    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<()>;

    /// Append one line to the deployment's provisioning journal.
    async fn append_deployment_log(&self, id: &DeploymentId, line: &str) -> ControlResult<()>;

    /// Persist the applied environment variable map.
    async fn set_deployment_vars(
        &self,
        id: &DeploymentId,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()>;

    /// Delete a deployment record.
    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()>;

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    /// Append a ledger entry and apply its balance deltas atomically.
    ///
    /// Debits are guarded: the sender's balance must cover the amount or
    /// the whole operation fails with `InsufficientBalance` and nothing is
    /// written.
    async fn append_entry(&self, entry: &LedgerEntry) -> ControlResult<()>;

    /// List entries where the user is sender or receiver. Newest first.
    async fn list_entries(
        &self,
        user: &UserId,
        filter: &EntryFilter,
    ) -> ControlResult<Vec<LedgerEntry>>;

    /// Most recent entry of the given kind involving the user.
    async fn last_entry_of_kind(
        &self,
        user: &UserId,
        kind: EntryKind,
    ) -> ControlResult<Option<LedgerEntry>>;

    // ------------------------------------------------------------------
    // Composite lifecycle operations
    // ------------------------------------------------------------------

    /// Insert the deployment row and apply the coin charge atomically.
    ///
    /// Nothing is written when the charge cannot be covered.
    async fn charge_and_insert_deployment(
        &self,
        record: &DeploymentRecord,
        charge: &LedgerEntry,
    ) -> ControlResult<()>;

    /// Mark a deployment failed and compensate, atomically: persist the
    /// error and log line, apply the refund entry, and release the
    /// account's capacity.
    async fn fail_deployment_with_refund(
        &self,
        id: &DeploymentId,
        error: &str,
        log_line: &str,
        refund: &LedgerEntry,
        account: &AccountId,
    ) -> ControlResult<()>;
}
