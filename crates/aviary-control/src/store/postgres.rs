//! PostgreSQL store implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::config::DatabaseConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{
    AccountId, AccountRecord, BotId, BotRecord, DeploymentData, DeploymentId, DeploymentRecord,
    DeploymentStatus, EntryId, EntryKind, EnvVarSpec, LedgerEntry, UserId, UserRecord,
};

use super::{DeploymentFilter, EntryFilter, PlatformStore};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(config: &DatabaseConfig) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                coins BIGINT NOT NULL DEFAULT 0,
                referral_code TEXT NOT NULL UNIQUE,
                referred_by TEXT REFERENCES users(id),
                verified BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                repo_url TEXT NOT NULL,
                branch TEXT NOT NULL,
                env_schema JSONB NOT NULL,
                cost BIGINT NOT NULL,
                approved BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                credential TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                used_count INTEGER NOT NULL DEFAULT 0,
                max_deployments INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                bot_id TEXT NOT NULL REFERENCES bots(id),
                account_id TEXT NOT NULL REFERENCES accounts(id),
                app_name TEXT NOT NULL,
                cost BIGINT NOT NULL,
                vars JSONB NOT NULL,
                log TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                sender TEXT REFERENCES users(id),
                receiver TEXT REFERENCES users(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                kind TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_deployments_user ON deployments (user_id)",
            "CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments (status)",
            "CREATE INDEX IF NOT EXISTS idx_deployments_created_at ON deployments (created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_pool ON accounts (active, used_count)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_sender ON ledger_entries (sender)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_receiver ON ledger_entries (receiver)",
            "CREATE INDEX IF NOT EXISTS idx_ledger_created_at ON ledger_entries (created_at DESC)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_user(row: &PgRow) -> UserRecord {
        UserRecord {
            id: UserId::new(row.get::<String, _>("id")),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            coins: row.get("coins"),
            referral_code: row.get("referral_code"),
            referred_by: row
                .get::<Option<String>, _>("referred_by")
                .map(UserId::new),
            verified: row.get("verified"),
            created_at: row.get("created_at"),
        }
    }

    fn row_to_bot(row: &PgRow) -> ControlResult<BotRecord> {
        let env_schema: Vec<EnvVarSpec> = serde_json::from_value(row.get("env_schema"))
            .map_err(|e| {
                ControlError::Serialisation(format!("failed to deserialise env schema: {e}"))
            })?;

        Ok(BotRecord {
            id: BotId::new(row.get::<String, _>("id")),
            owner: UserId::new(row.get::<String, _>("owner")),
            name: row.get("name"),
            description: row.get("description"),
            repo_url: row.get("repo_url"),
            branch: row.get("branch"),
            env_schema,
            cost: row.get("cost"),
            approved: row.get("approved"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_account(row: &PgRow) -> AccountRecord {
        AccountRecord {
            id: AccountId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            credential: row.get("credential"),
            active: row.get("active"),
            used_count: row.get("used_count"),
            max_deployments: row.get("max_deployments"),
            created_at: row.get("created_at"),
        }
    }

    fn row_to_deployment(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let vars: BTreeMap<String, String> =
            serde_json::from_value(row.get("vars")).map_err(|e| {
                ControlError::Serialisation(format!("failed to deserialise vars: {e}"))
            })?;

        let status_str: String = row.get("status");
        let status: DeploymentStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        Ok(DeploymentRecord {
            data: DeploymentData {
                id: DeploymentId::new(row.get::<String, _>("id")),
                user_id: UserId::new(row.get::<String, _>("user_id")),
                bot_id: BotId::new(row.get::<String, _>("bot_id")),
                account_id: AccountId::new(row.get::<String, _>("account_id")),
                app_name: row.get("app_name"),
                cost: row.get("cost"),
                vars,
                log: row.get("log"),
                error: row.get("error"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            },
            status,
        })
    }

    fn row_to_entry(row: &PgRow) -> ControlResult<LedgerEntry> {
        let kind_str: String = row.get("kind");
        let kind: EntryKind = kind_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse entry kind '{kind_str}': {e}"))
        })?;

        Ok(LedgerEntry {
            id: EntryId::new(row.get::<String, _>("id")),
            sender: row.get::<Option<String>, _>("sender").map(UserId::new),
            receiver: row.get::<Option<String>, _>("receiver").map(UserId::new),
            amount: row.get("amount"),
            kind,
            description: row.get("description"),
            created_at: row.get("created_at"),
        })
    }

    /// Apply a ledger entry inside a transaction: guarded balance deltas
    /// plus the entry insert.
    async fn apply_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: &LedgerEntry,
    ) -> ControlResult<()> {
        if entry.amount <= 0 {
            return Err(ControlError::validation("ledger amount must be positive"));
        }

        if let Some(ref sender) = entry.sender {
            let result =
                sqlx::query("UPDATE users SET coins = coins - $1 WHERE id = $2 AND coins >= $1")
                    .bind(entry.amount)
                    .bind(sender.as_str())
                    .execute(&mut **tx)
                    .await?;

            if result.rows_affected() == 0 {
                let exists = sqlx::query("SELECT 1 FROM users WHERE id = $1")
                    .bind(sender.as_str())
                    .fetch_optional(&mut **tx)
                    .await?;
                return Err(if exists.is_some() {
                    ControlError::InsufficientBalance {
                        needed: entry.amount,
                    }
                } else {
                    ControlError::UserNotFound(sender.to_string())
                });
            }
        }

        if let Some(ref receiver) = entry.receiver {
            let result = sqlx::query("UPDATE users SET coins = coins + $1 WHERE id = $2")
                .bind(entry.amount)
                .bind(receiver.as_str())
                .execute(&mut **tx)
                .await?;

            if result.rows_affected() == 0 {
                return Err(ControlError::UserNotFound(receiver.to_string()));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, sender, receiver, amount, kind, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id.as_str())
        .bind(entry.sender.as_ref().map(UserId::as_str))
        .bind(entry.receiver.as_ref().map(UserId::as_str))
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn insert_deployment_row(
        tx: &mut Transaction<'_, Postgres>,
        record: &DeploymentRecord,
    ) -> ControlResult<()> {
        let vars_json = serde_json::to_value(&record.data.vars)
            .map_err(|e| ControlError::Serialisation(format!("failed to serialise vars: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, user_id, bot_id, account_id, app_name, cost,
                vars, log, status, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.data.id.as_str())
        .bind(record.data.user_id.as_str())
        .bind(record.data.bot_id.as_str())
        .bind(record.data.account_id.as_str())
        .bind(&record.data.app_name)
        .bind(record.data.cost)
        .bind(&vars_json)
        .bind(&record.data.log)
        .bind(record.status.as_str())
        .bind(&record.data.error)
        .bind(record.data.created_at)
        .bind(record.data.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PlatformStore for PostgresStore {
    async fn insert_user(&self, user: &UserRecord) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, email, password_hash, coins, referral_code,
                referred_by, verified, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user.id.as_str())
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.coins)
        .bind(&user.referral_code)
        .bind(user.referred_by.as_ref().map(UserId::as_str))
        .bind(user.verified)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_user(&self, id: &UserId) -> ControlResult<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_user))
    }

    async fn get_user_by_email(&self, email: &str) -> ControlResult<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_user))
    }

    async fn get_user_by_referral_code(&self, code: &str) -> ControlResult<Option<UserRecord>> {
        let row = sqlx::query("SELECT * FROM users WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_user))
    }

    async fn mark_verified(&self, id: &UserId) -> ControlResult<bool> {
        let result =
            sqlx::query("UPDATE users SET verified = TRUE WHERE id = $1 AND verified = FALSE")
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM users WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        if exists.is_none() {
            return Err(ControlError::UserNotFound(id.to_string()));
        }

        Ok(false)
    }

    async fn insert_bot(&self, bot: &BotRecord) -> ControlResult<()> {
        let schema_json = serde_json::to_value(&bot.env_schema).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise env schema: {e}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO bots (
                id, owner, name, description, repo_url, branch,
                env_schema, cost, approved, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(bot.id.as_str())
        .bind(bot.owner.as_str())
        .bind(&bot.name)
        .bind(&bot.description)
        .bind(&bot.repo_url)
        .bind(&bot.branch)
        .bind(&schema_json)
        .bind(bot.cost)
        .bind(bot.approved)
        .bind(bot.created_at)
        .bind(bot.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_bot(&self, id: &BotId) -> ControlResult<Option<BotRecord>> {
        let row = sqlx::query("SELECT * FROM bots WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_bot(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_bots(&self, approved_only: bool) -> ControlResult<Vec<BotRecord>> {
        let query = if approved_only {
            "SELECT * FROM bots WHERE approved ORDER BY created_at DESC"
        } else {
            "SELECT * FROM bots ORDER BY created_at DESC"
        };

        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_bot).collect()
    }

    async fn update_bot(&self, bot: &BotRecord) -> ControlResult<()> {
        let schema_json = serde_json::to_value(&bot.env_schema).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise env schema: {e}"))
        })?;

        let result = sqlx::query(
            r#"
            UPDATE bots
            SET name = $1, description = $2, repo_url = $3, branch = $4,
                env_schema = $5, cost = $6, approved = $7, updated_at = NOW()
            WHERE id = $8
            "#,
        )
        .bind(&bot.name)
        .bind(&bot.description)
        .bind(&bot.repo_url)
        .bind(&bot.branch)
        .bind(&schema_json)
        .bind(bot.cost)
        .bind(bot.approved)
        .bind(bot.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::BotNotFound(bot.id.to_string()));
        }

        Ok(())
    }

    async fn set_bot_approval(&self, id: &BotId, approved: bool) -> ControlResult<()> {
        let result = sqlx::query("UPDATE bots SET approved = $1, updated_at = NOW() WHERE id = $2")
            .bind(approved)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::BotNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn insert_account(&self, account: &AccountRecord) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, name, credential, active, used_count, max_deployments, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account.id.as_str())
        .bind(&account.name)
        .bind(&account.credential)
        .bind(account.active)
        .bind(account.used_count)
        .bind(account.max_deployments)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<AccountRecord>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_account))
    }

    async fn list_accounts(&self) -> ControlResult<Vec<AccountRecord>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(Self::row_to_account).collect())
    }

    async fn active_accounts(&self) -> ControlResult<Vec<AccountRecord>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE active ORDER BY used_count ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(Self::row_to_account).collect())
    }

    async fn reserve_account(&self, id: &AccountId) -> ControlResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET used_count = used_count + 1
            WHERE id = $1 AND active AND used_count < max_deployments
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn force_reserve_account(&self, id: &AccountId) -> ControlResult<()> {
        let result = sqlx::query("UPDATE accounts SET used_count = used_count + 1 WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::AccountNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn release_account(&self, id: &AccountId) -> ControlResult<()> {
        let result = sqlx::query(
            "UPDATE accounts SET used_count = GREATEST(used_count - 1, 0) WHERE id = $1",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::AccountNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_deployment(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = String::from("SELECT * FROM deployments WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(ref user_id) = filter.user_id {
            params.push(user_id.as_str().to_owned());
            query.push_str(&format!(" AND user_id = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, error = COALESCE($2, error), updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn append_deployment_log(&self, id: &DeploymentId, line: &str) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET log = log || $1 || E'\n', updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(line)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn set_deployment_vars(
        &self,
        id: &DeploymentId,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()> {
        let vars_json = serde_json::to_value(vars)
            .map_err(|e| ControlError::Serialisation(format!("failed to serialise vars: {e}")))?;

        let result =
            sqlx::query("UPDATE deployments SET vars = $1, updated_at = NOW() WHERE id = $2")
                .bind(&vars_json)
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn append_entry(&self, entry: &LedgerEntry) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::apply_entry(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_entries(
        &self,
        user: &UserId,
        filter: &EntryFilter,
    ) -> ControlResult<Vec<LedgerEntry>> {
        let mut query =
            String::from("SELECT * FROM ledger_entries WHERE (sender = $1 OR receiver = $1)");
        let mut params: Vec<String> = vec![user.as_str().to_owned()];

        if let Some(kind) = filter.kind {
            params.push(kind.as_str().to_owned());
            query.push_str(&format!(" AND kind = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn last_entry_of_kind(
        &self,
        user: &UserId,
        kind: EntryKind,
    ) -> ControlResult<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM ledger_entries
            WHERE (sender = $1 OR receiver = $1) AND kind = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_entry(&r)?)),
            None => Ok(None),
        }
    }

    async fn charge_and_insert_deployment(
        &self,
        record: &DeploymentRecord,
        charge: &LedgerEntry,
    ) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::apply_entry(&mut tx, charge).await?;
        Self::insert_deployment_row(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail_deployment_with_refund(
        &self,
        id: &DeploymentId,
        error: &str,
        log_line: &str,
        refund: &LedgerEntry,
        account: &AccountId,
    ) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'failed', error = $1, log = log || $2 || E'\n', updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(error)
        .bind(log_line)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }

        Self::apply_entry(&mut tx, refund).await?;

        sqlx::query("UPDATE accounts SET used_count = GREATEST(used_count - 1, 0) WHERE id = $1")
            .bind(account.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
