//! Core deployment lifecycle logic.
//!
//! Creation is synchronous and returns once the user has been charged and a
//! capacity slot reserved; the external provisioning sequence runs as a
//! detached task and reports through the deployment's status and log
//! journal. Every external call is wrapped in a bounded timeout so a hung
//! platform call cannot pin a deployment in `configuring` forever.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::allocator::{self, AccountSnapshot, Selection};
use crate::config::{DeploymentConfig, PaasConfig};
use crate::error::{ControlError, ControlResult};
use crate::paas::PaasProvider;
use crate::state::{AnyDeployment, Deployment, Pending};
use crate::store::{DeploymentFilter, PlatformStore};
use crate::types::{
    AccountId, AccountRecord, BotId, BotRecord, DeploymentData, DeploymentId, DeploymentRecord,
    DeploymentStatus, EntryKind, EnvVarSpec, LedgerEntry, UserId,
};

/// Request to deploy a bot.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Deploying user.
    pub user_id: UserId,
    /// Bot template to deploy.
    pub bot_id: BotId,
    /// Environment variable overrides for the bot's declared schema.
    pub vars: BTreeMap<String, String>,
}

/// What the caller gets back before provisioning starts.
#[derive(Debug, Clone)]
pub struct DeployReceipt {
    /// The new deployment's identifier.
    pub id: DeploymentId,
    /// Provisional application name on the external platform.
    pub app_name: String,
}

/// Resolve a deployment's environment variables against the bot's schema.
///
/// Overrides must name declared variables; declared variables fall back to
/// their schema defaults; required variables must resolve to a value one
/// way or the other.
pub fn resolve_env(
    schema: &[EnvVarSpec],
    overrides: &BTreeMap<String, String>,
) -> ControlResult<BTreeMap<String, String>> {
    for key in overrides.keys() {
        if !schema.iter().any(|spec| &spec.key == key) {
            return Err(ControlError::validation(format!(
                "unknown environment variable: {key}"
            )));
        }
    }

    let mut resolved = BTreeMap::new();
    for spec in schema {
        match overrides
            .get(&spec.key)
            .cloned()
            .or_else(|| spec.default.clone())
        {
            Some(value) => {
                resolved.insert(spec.key.clone(), value);
            }
            None if spec.required => {
                return Err(ControlError::validation(format!(
                    "missing required environment variable: {}",
                    spec.key
                )));
            }
            None => {}
        }
    }

    Ok(resolved)
}

/// Orchestrates the deployment lifecycle.
pub struct DeploymentManager {
    store: Arc<dyn PlatformStore>,
    paas: Arc<dyn PaasProvider>,
    paas_config: PaasConfig,
    deployment_config: DeploymentConfig,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn PlatformStore>,
        paas: Arc<dyn PaasProvider>,
        paas_config: PaasConfig,
        deployment_config: DeploymentConfig,
    ) -> Self {
        Self {
            store,
            paas,
            paas_config,
            deployment_config,
        }
    }

    /// Create a deployment: validate, allocate capacity, charge.
    ///
    /// Returns as soon as the charge and the deployment row are committed;
    /// the caller is expected to hand the receipt's id to
    /// [`Self::spawn_provisioning`]. The reservation is the only step
    /// outside the charge transaction and is released if the charge fails.
    pub async fn create(&self, request: DeployRequest) -> ControlResult<DeployReceipt> {
        let user = self
            .store
            .get_user(&request.user_id)
            .await?
            .ok_or_else(|| ControlError::UserNotFound(request.user_id.to_string()))?;

        let bot = self
            .store
            .get_bot(&request.bot_id)
            .await?
            .ok_or_else(|| ControlError::BotNotFound(request.bot_id.to_string()))?;

        if !bot.approved {
            return Err(ControlError::BotNotApproved(bot.name.clone()));
        }

        let vars = resolve_env(&bot.env_schema, &request.vars)?;

        // Early reject so an obviously broke user never touches the pool.
        // The authoritative guard is the conditional debit in the charge
        // transaction.
        if user.coins < bot.cost {
            return Err(ControlError::InsufficientBalance { needed: bot.cost });
        }

        let pool = self.store.active_accounts().await?;
        let snapshots: Vec<AccountSnapshot> = pool.iter().map(AccountSnapshot::from).collect();
        let account_id = self.reserve_from_pool(&snapshots).await?;

        let data = DeploymentData::new(
            user.id.clone(),
            bot.id.clone(),
            account_id.clone(),
            self.generate_app_name(),
            bot.cost,
            vars,
        );

        let pending = Deployment::<Pending>::create(data);
        let record = DeploymentRecord::new(pending.into_data());

        let charge = LedgerEntry::debit(
            user.id.clone(),
            bot.cost,
            EntryKind::Deployment,
            format!("deployment of {}", bot.name),
        );

        if let Err(e) = self
            .store
            .charge_and_insert_deployment(&record, &charge)
            .await
        {
            if let Err(release_err) = self.store.release_account(&account_id).await {
                warn!(
                    account_id = %account_id,
                    error = %release_err,
                    "failed to release reservation after charge failure"
                );
            }
            return Err(e);
        }

        info!(
            deployment_id = %record.data.id,
            user_id = %user.id,
            bot = %bot.name,
            account_id = %account_id,
            cost = bot.cost,
            "deployment created and charged"
        );

        Ok(DeployReceipt {
            id: record.data.id.clone(),
            app_name: record.data.app_name.clone(),
        })
    }

    /// Detach the provisioning sequence from the caller.
    ///
    /// Failures end up in the deployment's status and log; the task holds
    /// no other result channel.
    pub fn spawn_provisioning(self: Arc<Self>, id: DeploymentId) {
        tokio::spawn(async move {
            if let Err(e) = self.provision(&id).await {
                error!(deployment_id = %id, error = %e, "provisioning task ended with error");
            }
        });
    }

    /// Drive a pending deployment through provisioning.
    ///
    /// On any external failure the deployment is marked failed and the
    /// charge is refunded with the account slot released, atomically.
    pub async fn provision(&self, id: &DeploymentId) -> ControlResult<()> {
        let record = self.require_deployment(id).await?;

        let pending =
            AnyDeployment::from_persisted(record.data.clone(), record.status).try_into_pending()?;

        let account = self
            .store
            .get_account(&record.data.account_id)
            .await?
            .ok_or_else(|| ControlError::AccountNotFound(record.data.account_id.to_string()))?;

        let bot = self
            .store
            .get_bot(&record.data.bot_id)
            .await?
            .ok_or_else(|| ControlError::BotNotFound(record.data.bot_id.to_string()))?;

        let configuring = pending.start_configuring();
        self.store
            .update_deployment_status(id, configuring.status(), None)
            .await?;

        let setup = self
            .run_external_setup(configuring.data(), &account, &bot)
            .await;

        match setup {
            Ok(()) => {
                let active = configuring.activate();
                self.store
                    .update_deployment_status(id, active.status(), None)
                    .await?;
                self.store
                    .append_deployment_log(id, "deployment is live")
                    .await?;
                info!(deployment_id = %id, app_name = %record.data.app_name, "deployment completed successfully");
                Ok(())
            }
            Err(e) => {
                error!(deployment_id = %id, error = %e, "provisioning failed, refunding");

                let refund = LedgerEntry::credit(
                    record.data.user_id.clone(),
                    record.data.cost,
                    EntryKind::Refund,
                    format!("refund for failed deployment {id}"),
                );

                if let Err(compensation_err) = self
                    .store
                    .fail_deployment_with_refund(
                        id,
                        &e.to_string(),
                        &format!("provisioning failed: {e}"),
                        &refund,
                        &account.id,
                    )
                    .await
                {
                    // The deployment is now failed-but-uncompensated; an
                    // operator has to reconcile it by hand.
                    error!(
                        deployment_id = %id,
                        error = %compensation_err,
                        "compensation failed after provisioning error"
                    );
                }

                Err(e)
            }
        }
    }

    /// Reconfigure an active deployment's environment variables.
    ///
    /// This is a paid operation: the deployment's cost is charged a second
    /// time. An external failure after the charge refunds it.
    pub async fn reconfigure(
        &self,
        id: &DeploymentId,
        user_id: &UserId,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()> {
        let record = self.owned_deployment(id, user_id).await?;

        if record.status != DeploymentStatus::Active {
            return Err(ControlError::InvalidStateTransition {
                from: record.status.as_str(),
                to: "active",
            });
        }

        let bot = self
            .store
            .get_bot(&record.data.bot_id)
            .await?
            .ok_or_else(|| ControlError::BotNotFound(record.data.bot_id.to_string()))?;

        let resolved = resolve_env(&bot.env_schema, vars)?;

        let account = self
            .store
            .get_account(&record.data.account_id)
            .await?
            .ok_or_else(|| ControlError::AccountNotFound(record.data.account_id.to_string()))?;

        let charge = LedgerEntry::debit(
            user_id.clone(),
            record.data.cost,
            EntryKind::Deployment,
            format!("reconfigure of {}", record.data.app_name),
        );
        self.store.append_entry(&charge).await?;

        if let Err(e) = self
            .push_config(&account, &record.data.app_name, &resolved)
            .await
        {
            warn!(deployment_id = %id, error = %e, "reconfigure push failed, refunding");

            let refund = LedgerEntry::credit(
                user_id.clone(),
                record.data.cost,
                EntryKind::Refund,
                format!("refund for failed reconfigure of {}", record.data.app_name),
            );
            if let Err(refund_err) = self.store.append_entry(&refund).await {
                error!(
                    deployment_id = %id,
                    error = %refund_err,
                    "refund failed after reconfigure error"
                );
            }
            self.store
                .append_deployment_log(id, &format!("reconfigure failed: {e}"))
                .await?;

            return Err(e);
        }

        self.store.set_deployment_vars(id, &resolved).await?;
        self.store
            .append_deployment_log(id, "configuration updated, application restarted")
            .await?;

        info!(deployment_id = %id, "deployment reconfigured");
        Ok(())
    }

    /// Restart the external application. Persisted status is unchanged.
    pub async fn restart(&self, id: &DeploymentId, user_id: &UserId) -> ControlResult<()> {
        let record = self.owned_deployment(id, user_id).await?;

        if record.status != DeploymentStatus::Active {
            return Err(ControlError::InvalidStateTransition {
                from: record.status.as_str(),
                to: "active",
            });
        }

        let account = self
            .store
            .get_account(&record.data.account_id)
            .await?
            .ok_or_else(|| ControlError::AccountNotFound(record.data.account_id.to_string()))?;

        self.bounded(
            "restart application",
            self.paas.restart_app(&account.credential, &record.data.app_name),
        )
        .await?;

        self.store
            .append_deployment_log(id, "application restarted")
            .await?;
        Ok(())
    }

    /// Delete a deployment.
    ///
    /// External teardown is best-effort: a platform failure is logged and
    /// the local record still goes away. No refund.
    pub async fn delete(&self, id: &DeploymentId, user_id: &UserId) -> ControlResult<()> {
        let record = self.owned_deployment(id, user_id).await?;

        if let Some(account) = self.store.get_account(&record.data.account_id).await? {
            if let Err(e) = self.teardown(&account, &record.data.app_name).await {
                warn!(
                    deployment_id = %id,
                    app_name = %record.data.app_name,
                    error = %e,
                    "external teardown failed, continuing with deletion"
                );
            }
        }

        self.store.delete_deployment(id).await?;

        // Failed and stopped deployments already gave their slot back.
        let already_released = matches!(
            record.status,
            DeploymentStatus::Failed | DeploymentStatus::Stopped
        );
        if !already_released {
            self.store.release_account(&record.data.account_id).await?;
        }

        info!(deployment_id = %id, "deployment deleted");
        Ok(())
    }

    /// Emergency stop by an operator. Terminal; no refund.
    pub async fn stop(&self, id: &DeploymentId) -> ControlResult<()> {
        let record = self.require_deployment(id).await?;

        let active =
            AnyDeployment::from_persisted(record.data.clone(), record.status).try_into_active()?;

        let account = self
            .store
            .get_account(&record.data.account_id)
            .await?
            .ok_or_else(|| ControlError::AccountNotFound(record.data.account_id.to_string()))?;

        if let Err(e) = self.teardown(&account, &record.data.app_name).await {
            warn!(
                deployment_id = %id,
                error = %e,
                "external teardown failed during stop, continuing"
            );
        }

        let stopped = active.stop();
        self.store
            .update_deployment_status(id, stopped.status(), None)
            .await?;
        self.store
            .append_deployment_log(id, "stopped by operator")
            .await?;
        self.store.release_account(&account.id).await?;

        info!(deployment_id = %id, "deployment stopped by operator");
        Ok(())
    }

    /// Get a deployment by ID.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.store.get_deployment(id).await
    }

    /// List deployments matching the filter.
    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list_deployments(filter).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn run_external_setup(
        &self,
        data: &DeploymentData,
        account: &AccountRecord,
        bot: &BotRecord,
    ) -> ControlResult<()> {
        let app_id = self
            .bounded(
                "create application",
                self.paas.create_app(&account.credential, &data.app_name),
            )
            .await?;
        self.store
            .append_deployment_log(
                &data.id,
                &format!("created application {} ({app_id})", data.app_name),
            )
            .await?;

        let build_id = self
            .bounded(
                "create build",
                self.paas
                    .create_build(&account.credential, &data.app_name, &bot.repo_url, &bot.branch),
            )
            .await?;
        self.store
            .append_deployment_log(
                &data.id,
                &format!("build {build_id} started from {}#{}", bot.repo_url, bot.branch),
            )
            .await?;

        self.bounded(
            "set config vars",
            self.paas
                .set_config_vars(&account.credential, &data.app_name, &data.vars),
        )
        .await?;
        self.store.set_deployment_vars(&data.id, &data.vars).await?;
        self.store
            .append_deployment_log(
                &data.id,
                &format!("applied {} config var(s)", data.vars.len()),
            )
            .await?;

        Ok(())
    }

    async fn push_config(
        &self,
        account: &AccountRecord,
        app_name: &str,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()> {
        self.bounded(
            "set config vars",
            self.paas.set_config_vars(&account.credential, app_name, vars),
        )
        .await?;

        self.bounded(
            "restart application",
            self.paas.restart_app(&account.credential, app_name),
        )
        .await
    }

    async fn teardown(&self, account: &AccountRecord, app_name: &str) -> ControlResult<()> {
        self.bounded(
            "purge log sessions",
            self.paas.purge_log_sessions(&account.credential, app_name),
        )
        .await?;

        self.bounded(
            "delete application",
            self.paas.delete_app(&account.credential, app_name),
        )
        .await
    }

    /// Reserve a slot, retrying down the preference order on races and
    /// overcommitting the best fallback when the whole pool is saturated.
    async fn reserve_from_pool(&self, pool: &[AccountSnapshot]) -> ControlResult<AccountId> {
        match allocator::select_account(pool)? {
            Selection::Preferred(_) => {
                for candidate in allocator::preference_order(pool) {
                    if self.store.reserve_account(&candidate.id).await? {
                        return Ok(candidate.id);
                    }
                }

                // Every conditional reservation lost a concurrent race.
                let fallback = pool
                    .iter()
                    .max_by_key(|a| a.spare())
                    .ok_or(ControlError::NoCapacityAvailable)?;
                let id = fallback.id.clone();
                self.store.force_reserve_account(&id).await?;
                warn!(account_id = %id, "pool exhausted by concurrent reservations, overcommitting");
                Ok(id)
            }
            Selection::Saturated(id) => {
                self.store.force_reserve_account(&id).await?;
                warn!(account_id = %id, "account pool saturated, overcommitting");
                Ok(id)
            }
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = ControlResult<T>> + Send,
    ) -> ControlResult<T> {
        let limit = Duration::from_secs(self.deployment_config.call_timeout_secs);
        match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::paas(format!(
                "{op} timed out after {}s",
                limit.as_secs()
            ))),
        }
    }

    fn generate_app_name(&self) -> String {
        // Platform application names are capped at 30 characters; the tail
        // of a ULID keeps enough entropy for uniqueness per prefix.
        let suffix = ulid::Ulid::new().to_string().to_lowercase();
        let tail = &suffix[suffix.len() - 12..];
        format!("{}-{tail}", self.paas_config.app_prefix)
    }

    async fn require_deployment(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))
    }

    /// Fetch a deployment, treating someone else's deployment as missing.
    async fn owned_deployment(
        &self,
        id: &DeploymentId,
        user_id: &UserId,
    ) -> ControlResult<DeploymentRecord> {
        let record = self.require_deployment(id).await?;
        if &record.data.user_id != user_id {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }
        Ok(record)
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::paas::MockPaas;
    use crate::store::MemoryStore;
    use crate::types::UserRecord;

    struct Fixture {
        store: Arc<dyn PlatformStore>,
        paas: Arc<MockPaas>,
        manager: DeploymentManager,
        user: UserRecord,
        bot: BotRecord,
        account: AccountRecord,
    }

    async fn fixture(coins: i64, account_capacity: i32) -> Fixture {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let paas = Arc::new(MockPaas::new());

        let mut user = UserRecord::new("deployer@example.com", "hash", None);
        user.coins = coins;
        user.verified = true;
        store.insert_user(&user).await.unwrap();

        let mut bot = BotRecord::new(
            user.id.clone(),
            "echo-bot",
            "repeats what you say",
            "https://github.com/acme/echo-bot",
            "main",
            vec![
                EnvVarSpec {
                    key: "GREETING".to_owned(),
                    default: Some("hello".to_owned()),
                    required: false,
                },
                EnvVarSpec {
                    key: "API_TOKEN".to_owned(),
                    default: None,
                    required: true,
                },
            ],
            10,
        );
        bot.approved = true;
        store.insert_bot(&bot).await.unwrap();

        let account = AccountRecord::new("pool-1", "token-1", account_capacity);
        store.insert_account(&account).await.unwrap();

        let manager = DeploymentManager::new(
            Arc::clone(&store),
            Arc::clone(&paas) as Arc<dyn PaasProvider>,
            PaasConfig::default(),
            DeploymentConfig::default(),
        );

        Fixture {
            store,
            paas,
            manager,
            user,
            bot,
            account,
        }
    }

    fn request(f: &Fixture) -> DeployRequest {
        DeployRequest {
            user_id: f.user.id.clone(),
            bot_id: f.bot.id.clone(),
            vars: BTreeMap::from([("API_TOKEN".to_owned(), "secret".to_owned())]),
        }
    }

    async fn balance(f: &Fixture) -> i64 {
        f.store.get_user(&f.user.id).await.unwrap().unwrap().coins
    }

    async fn used_count(f: &Fixture) -> i32 {
        f.store
            .get_account(&f.account.id)
            .await
            .unwrap()
            .unwrap()
            .used_count
    }

    #[test]
    fn resolve_env_applies_defaults_and_overrides() {
        let schema = vec![
            EnvVarSpec {
                key: "A".to_owned(),
                default: Some("1".to_owned()),
                required: false,
            },
            EnvVarSpec {
                key: "B".to_owned(),
                default: None,
                required: true,
            },
        ];

        let overrides = BTreeMap::from([("B".to_owned(), "2".to_owned())]);
        let resolved = resolve_env(&schema, &overrides).unwrap();
        assert_eq!(resolved.get("A").map(String::as_str), Some("1"));
        assert_eq!(resolved.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn resolve_env_rejects_missing_required_and_unknown_keys() {
        let schema = vec![EnvVarSpec {
            key: "B".to_owned(),
            default: None,
            required: true,
        }];

        assert!(matches!(
            resolve_env(&schema, &BTreeMap::new()),
            Err(ControlError::Validation(_))
        ));

        let unknown = BTreeMap::from([("NOPE".to_owned(), "x".to_owned())]);
        assert!(matches!(
            resolve_env(&schema, &unknown),
            Err(ControlError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn create_charges_immediately_and_stays_pending() {
        let f = fixture(15, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();

        // Charged up front, regardless of eventual provisioning outcome.
        assert_eq!(balance(&f).await, 5);
        assert_eq!(used_count(&f).await, 1);

        let record = f.store.get_deployment(&receipt.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Pending);
        assert!(receipt.app_name.starts_with("avy-"));
        // Nothing external happened yet.
        assert!(!f.paas.has_app(&receipt.app_name));
    }

    #[tokio::test]
    async fn provision_reaches_active() {
        let f = fixture(15, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();
        f.manager.provision(&receipt.id).await.unwrap();

        let record = f.store.get_deployment(&receipt.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Active);
        assert!(f.paas.has_app(&receipt.app_name));
        assert_eq!(
            f.paas
                .vars_for(&receipt.app_name)
                .unwrap()
                .get("API_TOKEN")
                .map(String::as_str),
            Some("secret")
        );
        assert!(record.data.log.contains("created application"));
        assert!(record.data.log.contains("build "));
        assert!(record.data.log.contains("deployment is live"));
        assert_eq!(balance(&f).await, 5);
        assert_eq!(used_count(&f).await, 1);
    }

    #[tokio::test]
    async fn provisioning_failure_is_net_zero() {
        let f = fixture(15, 5).await;
        f.paas.fail_on("create_build");

        let receipt = f.manager.create(request(&f)).await.unwrap();
        assert_eq!(balance(&f).await, 5);

        let result = f.manager.provision(&receipt.id).await;
        assert!(result.is_err());

        let record = f.store.get_deployment(&receipt.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.data.log.contains("provisioning failed"));
        assert!(record.data.error.is_some());

        // Charge plus refund nets to the starting balance, and the slot
        // was given back exactly once.
        assert_eq!(balance(&f).await, 15);
        assert_eq!(used_count(&f).await, 0);
    }

    #[tokio::test]
    async fn create_rejects_unapproved_bot() {
        let f = fixture(15, 5).await;
        f.store
            .set_bot_approval(&f.bot.id, false)
            .await
            .unwrap();

        let result = f.manager.create(request(&f)).await;
        assert!(matches!(result, Err(ControlError::BotNotApproved(_))));
        assert_eq!(balance(&f).await, 15);
        assert_eq!(used_count(&f).await, 0);
    }

    #[tokio::test]
    async fn create_rejects_insufficient_balance() {
        let f = fixture(9, 5).await;

        let result = f.manager.create(request(&f)).await;
        assert!(matches!(
            result,
            Err(ControlError::InsufficientBalance { needed: 10 })
        ));
        assert_eq!(used_count(&f).await, 0);
    }

    #[tokio::test]
    async fn create_rejects_missing_required_var() {
        let f = fixture(15, 5).await;

        let mut bad = request(&f);
        bad.vars.clear();
        let result = f.manager.create(bad).await;
        assert!(matches!(result, Err(ControlError::Validation(_))));
    }

    #[tokio::test]
    async fn empty_pool_is_a_hard_error() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let paas: Arc<dyn PaasProvider> = Arc::new(MockPaas::new());

        let mut user = UserRecord::new("deployer@example.com", "hash", None);
        user.coins = 100;
        store.insert_user(&user).await.unwrap();

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
        store.insert_bot(&bot).await.unwrap();

        let manager = DeploymentManager::new(
            Arc::clone(&store),
            paas,
            PaasConfig::default(),
            DeploymentConfig::default(),
        );

        let result = manager
            .create(DeployRequest {
                user_id: user.id,
                bot_id: bot.id,
                vars: BTreeMap::new(),
            })
            .await;
        assert!(matches!(result, Err(ControlError::NoCapacityAvailable)));
    }

    #[tokio::test]
    async fn saturated_pool_overcommits_instead_of_failing() {
        let f = fixture(15, 1).await;
        assert!(f.store.reserve_account(&f.account.id).await.unwrap());
        assert_eq!(used_count(&f).await, 1);

        // Pool fully saturated: the fallback still takes the deployment.
        let receipt = f.manager.create(request(&f)).await;
        assert!(receipt.is_ok());
        assert_eq!(used_count(&f).await, 2);
    }

    #[tokio::test]
    async fn reconfigure_charges_again() {
        let f = fixture(30, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();
        f.manager.provision(&receipt.id).await.unwrap();
        assert_eq!(balance(&f).await, 20);

        let vars = BTreeMap::from([
            ("API_TOKEN".to_owned(), "rotated".to_owned()),
            ("GREETING".to_owned(), "hi".to_owned()),
        ]);
        f.manager
            .reconfigure(&receipt.id, &f.user.id, &vars)
            .await
            .unwrap();

        assert_eq!(balance(&f).await, 10);
        assert_eq!(
            f.paas
                .vars_for(&receipt.app_name)
                .unwrap()
                .get("API_TOKEN")
                .map(String::as_str),
            Some("rotated")
        );

        let record = f.store.get_deployment(&receipt.id).await.unwrap().unwrap();
        assert_eq!(
            record.data.vars.get("GREETING").map(String::as_str),
            Some("hi")
        );
    }

    #[tokio::test]
    async fn failed_reconfigure_refunds_the_second_charge() {
        let f = fixture(30, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();
        f.manager.provision(&receipt.id).await.unwrap();
        assert_eq!(balance(&f).await, 20);

        f.paas.fail_on("restart_app");
        let vars = BTreeMap::from([("API_TOKEN".to_owned(), "rotated".to_owned())]);
        let result = f.manager.reconfigure(&receipt.id, &f.user.id, &vars).await;
        assert!(result.is_err());

        // Second charge refunded, net unchanged.
        assert_eq!(balance(&f).await, 20);
    }

    #[tokio::test]
    async fn reconfigure_requires_active_status() {
        let f = fixture(30, 5).await;
        let receipt = f.manager.create(request(&f)).await.unwrap();

        // Still pending.
        let vars = BTreeMap::from([("API_TOKEN".to_owned(), "rotated".to_owned())]);
        let result = f.manager.reconfigure(&receipt.id, &f.user.id, &vars).await;
        assert!(matches!(
            result,
            Err(ControlError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn delete_gives_no_refund_and_releases_capacity() {
        let f = fixture(15, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();
        f.manager.provision(&receipt.id).await.unwrap();

        f.manager.delete(&receipt.id, &f.user.id).await.unwrap();

        assert!(f
            .store
            .get_deployment(&receipt.id)
            .await
            .unwrap()
            .is_none());
        assert!(!f.paas.has_app(&receipt.app_name));
        assert_eq!(used_count(&f).await, 0);
        // User-initiated deletion keeps the charge.
        assert_eq!(balance(&f).await, 5);
    }

    #[tokio::test]
    async fn delete_tolerates_teardown_failure() {
        let f = fixture(15, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();
        f.manager.provision(&receipt.id).await.unwrap();

        f.paas.fail_on("delete_app");
        f.manager.delete(&receipt.id, &f.user.id).await.unwrap();
        assert!(f
            .store
            .get_deployment(&receipt.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(used_count(&f).await, 0);
    }

    #[tokio::test]
    async fn delete_after_failure_does_not_release_twice() {
        let f = fixture(15, 5).await;
        f.paas.fail_on("create_app");

        let receipt = f.manager.create(request(&f)).await.unwrap();
        let _ = f.manager.provision(&receipt.id).await;
        assert_eq!(used_count(&f).await, 0);

        f.manager.delete(&receipt.id, &f.user.id).await.unwrap();
        assert_eq!(used_count(&f).await, 0);
    }

    #[tokio::test]
    async fn other_users_deployments_are_invisible() {
        let f = fixture(15, 5).await;
        let receipt = f.manager.create(request(&f)).await.unwrap();

        let stranger = UserRecord::new("stranger@example.com", "hash", None);
        f.store.insert_user(&stranger).await.unwrap();

        let result = f.manager.delete(&receipt.id, &stranger.id).await;
        assert!(matches!(result, Err(ControlError::DeploymentNotFound(_))));
    }

    #[tokio::test]
    async fn stop_is_operator_terminal() {
        let f = fixture(15, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();
        f.manager.provision(&receipt.id).await.unwrap();

        f.manager.stop(&receipt.id).await.unwrap();

        let record = f.store.get_deployment(&receipt.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Stopped);
        assert!(record.data.log.contains("stopped by operator"));
        assert_eq!(used_count(&f).await, 0);
        // No refund on stop.
        assert_eq!(balance(&f).await, 5);

        // Stopping twice is an invalid transition.
        assert!(matches!(
            f.manager.stop(&receipt.id).await,
            Err(ControlError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn restart_leaves_status_untouched() {
        let f = fixture(15, 5).await;

        let receipt = f.manager.create(request(&f)).await.unwrap();
        f.manager.provision(&receipt.id).await.unwrap();

        f.manager.restart(&receipt.id, &f.user.id).await.unwrap();

        let record = f.store.get_deployment(&receipt.id).await.unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Active);
        assert!(record.data.log.contains("application restarted"));
        assert_eq!(balance(&f).await, 5);
    }
}
