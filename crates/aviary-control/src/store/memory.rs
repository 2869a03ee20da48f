//! In-memory store for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    AccountId, AccountRecord, BotId, BotRecord, DeploymentId, DeploymentRecord, DeploymentStatus,
    EntryKind, LedgerEntry, UserId, UserRecord,
};

use super::{DeploymentFilter, EntryFilter, PlatformStore};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    bots: HashMap<String, BotRecord>,
    accounts: HashMap<String, AccountRecord>,
    deployments: HashMap<String, DeploymentRecord>,
    entries: Vec<LedgerEntry>,
}

impl Inner {
    /// Apply a ledger entry: balance guards plus the append itself.
    ///
    /// Runs inside one lock section so composite operations stay atomic.
    fn apply_entry(&mut self, entry: &LedgerEntry) -> ControlResult<()> {
        if entry.amount <= 0 {
            return Err(ControlError::validation("ledger amount must be positive"));
        }

        if let Some(ref sender) = entry.sender {
            let user = self
                .users
                .get(sender.as_str())
                .ok_or_else(|| ControlError::UserNotFound(sender.to_string()))?;
            if user.coins < entry.amount {
                return Err(ControlError::InsufficientBalance {
                    needed: entry.amount,
                });
            }
        }
        if let Some(ref receiver) = entry.receiver {
            if !self.users.contains_key(receiver.as_str()) {
                return Err(ControlError::UserNotFound(receiver.to_string()));
            }
        }

        if let Some(ref sender) = entry.sender {
            if let Some(user) = self.users.get_mut(sender.as_str()) {
                user.coins -= entry.amount;
            }
        }
        if let Some(ref receiver) = entry.receiver {
            if let Some(user) = self.users.get_mut(receiver.as_str()) {
                user.coins += entry.amount;
            }
        }

        self.entries.push(entry.clone());
        Ok(())
    }

    fn release_account(&mut self, id: &AccountId) -> ControlResult<()> {
        let account = self
            .accounts
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::AccountNotFound(id.to_string()))?;
        account.used_count = (account.used_count - 1).max(0);
        Ok(())
    }
}

/// In-memory store for testing.
///
/// Data is lost when the process exits; not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

fn paginate<T>(items: Vec<T>, limit: Option<u32>, offset: Option<u32>) -> Vec<T> {
    let offset = offset.unwrap_or(0) as usize;
    let items: Vec<T> = items.into_iter().skip(offset).collect();
    match limit {
        Some(limit) => items.into_iter().take(limit as usize).collect(),
        None => items,
    }
}

#[allow(clippy::significant_drop_tightening)]
#[async_trait]
impl PlatformStore for MemoryStore {
    async fn insert_user(&self, user: &UserRecord) -> ControlResult<()> {
        let mut inner = self.write()?;
        if inner.users.contains_key(user.id.as_str()) {
            return Err(ControlError::internal(format!(
                "user {} already exists",
                user.id
            )));
        }
        if inner.users.values().any(|u| u.email == user.email) {
            return Err(ControlError::validation("email already registered"));
        }
        inner.users.insert(user.id.as_str().to_owned(), user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &UserId) -> ControlResult<Option<UserRecord>> {
        Ok(self.read()?.users.get(id.as_str()).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> ControlResult<Option<UserRecord>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn get_user_by_referral_code(&self, code: &str) -> ControlResult<Option<UserRecord>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.referral_code == code)
            .cloned())
    }

    async fn mark_verified(&self, id: &UserId) -> ControlResult<bool> {
        let mut inner = self.write()?;
        let user = inner
            .users
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::UserNotFound(id.to_string()))?;
        if user.verified {
            return Ok(false);
        }
        user.verified = true;
        Ok(true)
    }

    async fn insert_bot(&self, bot: &BotRecord) -> ControlResult<()> {
        let mut inner = self.write()?;
        if inner.bots.contains_key(bot.id.as_str()) {
            return Err(ControlError::internal(format!(
                "bot {} already exists",
                bot.id
            )));
        }
        inner.bots.insert(bot.id.as_str().to_owned(), bot.clone());
        Ok(())
    }

    async fn get_bot(&self, id: &BotId) -> ControlResult<Option<BotRecord>> {
        Ok(self.read()?.bots.get(id.as_str()).cloned())
    }

    async fn list_bots(&self, approved_only: bool) -> ControlResult<Vec<BotRecord>> {
        let inner = self.read()?;
        let mut bots: Vec<_> = inner
            .bots
            .values()
            .filter(|b| !approved_only || b.approved)
            .cloned()
            .collect();
        bots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(bots)
    }

    async fn update_bot(&self, bot: &BotRecord) -> ControlResult<()> {
        let mut inner = self.write()?;
        if !inner.bots.contains_key(bot.id.as_str()) {
            return Err(ControlError::BotNotFound(bot.id.to_string()));
        }
        inner.bots.insert(bot.id.as_str().to_owned(), bot.clone());
        Ok(())
    }

    async fn set_bot_approval(&self, id: &BotId, approved: bool) -> ControlResult<()> {
        let mut inner = self.write()?;
        let bot = inner
            .bots
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::BotNotFound(id.to_string()))?;
        bot.approved = approved;
        bot.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn insert_account(&self, account: &AccountRecord) -> ControlResult<()> {
        let mut inner = self.write()?;
        if inner.accounts.contains_key(account.id.as_str()) {
            return Err(ControlError::internal(format!(
                "account {} already exists",
                account.id
            )));
        }
        inner
            .accounts
            .insert(account.id.as_str().to_owned(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<AccountRecord>> {
        Ok(self.read()?.accounts.get(id.as_str()).cloned())
    }

    async fn list_accounts(&self) -> ControlResult<Vec<AccountRecord>> {
        let inner = self.read()?;
        let mut accounts: Vec<_> = inner.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(accounts)
    }

    async fn active_accounts(&self) -> ControlResult<Vec<AccountRecord>> {
        let inner = self.read()?;
        let mut accounts: Vec<_> = inner
            .accounts
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.used_count);
        Ok(accounts)
    }

    async fn reserve_account(&self, id: &AccountId) -> ControlResult<bool> {
        let mut inner = self.write()?;
        let account = inner
            .accounts
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::AccountNotFound(id.to_string()))?;
        if !account.active || account.used_count >= account.max_deployments {
            return Ok(false);
        }
        account.used_count += 1;
        Ok(true)
    }

    async fn force_reserve_account(&self, id: &AccountId) -> ControlResult<()> {
        let mut inner = self.write()?;
        let account = inner
            .accounts
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::AccountNotFound(id.to_string()))?;
        account.used_count += 1;
        Ok(())
    }

    async fn release_account(&self, id: &AccountId) -> ControlResult<()> {
        self.write()?.release_account(id)
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        Ok(self.read()?.deployments.get(id.as_str()).cloned())
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        let inner = self.read()?;
        let mut results: Vec<_> = inner
            .deployments
            .values()
            .filter(|r| {
                if let Some(ref user_id) = filter.user_id {
                    if &r.data.user_id != user_id {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    if r.status != status {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| b.data.created_at.cmp(&a.data.created_at));
        Ok(paginate(results, filter.limit, filter.offset))
    }

    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<()> {
        let mut inner = self.write()?;
        let record = inner
            .deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
        record.status = status;
        if let Some(error) = error {
            record.data.error = Some(error.to_owned());
        }
        record.data.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn append_deployment_log(&self, id: &DeploymentId, line: &str) -> ControlResult<()> {
        let mut inner = self.write()?;
        let record = inner
            .deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
        record.data.log.push_str(line);
        record.data.log.push('\n');
        record.data.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_deployment_vars(
        &self,
        id: &DeploymentId,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()> {
        let mut inner = self.write()?;
        let record = inner
            .deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
        record.data.vars = vars.clone();
        record.data.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()> {
        let mut inner = self.write()?;
        if inner.deployments.remove(id.as_str()).is_none() {
            return Err(ControlError::DeploymentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn append_entry(&self, entry: &LedgerEntry) -> ControlResult<()> {
        self.write()?.apply_entry(entry)
    }

    async fn list_entries(
        &self,
        user: &UserId,
        filter: &EntryFilter,
    ) -> ControlResult<Vec<LedgerEntry>> {
        let inner = self.read()?;
        let mut results: Vec<_> = inner
            .entries
            .iter()
            .filter(|e| {
                let involved = e.sender.as_ref() == Some(user) || e.receiver.as_ref() == Some(user);
                let kind_matches = filter.kind.is_none_or(|k| e.kind == k);
                involved && kind_matches
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(results, filter.limit, filter.offset))
    }

    async fn last_entry_of_kind(
        &self,
        user: &UserId,
        kind: EntryKind,
    ) -> ControlResult<Option<LedgerEntry>> {
        let inner = self.read()?;
        Ok(inner
            .entries
            .iter()
            .filter(|e| {
                e.kind == kind
                    && (e.sender.as_ref() == Some(user) || e.receiver.as_ref() == Some(user))
            })
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn charge_and_insert_deployment(
        &self,
        record: &DeploymentRecord,
        charge: &LedgerEntry,
    ) -> ControlResult<()> {
        let mut inner = self.write()?;
        if inner.deployments.contains_key(record.data.id.as_str()) {
            return Err(ControlError::internal(format!(
                "deployment {} already exists",
                record.data.id
            )));
        }
        inner.apply_entry(charge)?;
        inner
            .deployments
            .insert(record.data.id.as_str().to_owned(), record.clone());
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
        let mut inner = self.write()?;
        {
            let record = inner
                .deployments
                .get_mut(id.as_str())
                .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
            record.status = DeploymentStatus::Failed;
            record.data.error = Some(error.to_owned());
            record.data.log.push_str(log_line);
            record.data.log.push('\n');
            record.data.updated_at = chrono::Utc::now();
        }
        inner.apply_entry(refund)?;
        inner.release_account(account)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{DeploymentData, EntryKind};

    fn seeded_user(coins: i64) -> UserRecord {
        let mut user = UserRecord::new(
            format!("{}@example.com", UserId::generate()),
            "hash",
            None,
        );
        user.coins = coins;
        user
    }

    fn test_deployment(user: &UserId, account: &AccountId, cost: i64) -> DeploymentRecord {
        let data = DeploymentData::new(
            user.clone(),
            BotId::generate(),
            account.clone(),
            "avy-echo-01",
            cost,
            BTreeMap::new(),
        );
        DeploymentRecord::new(data)
    }

    #[tokio::test]
    async fn user_crud_and_lookup() {
        let store = MemoryStore::new();
        let user = seeded_user(0);
        let id = user.id.clone();
        let code = user.referral_code.clone();

        store.insert_user(&user).await.unwrap();
        assert!(store.get_user(&id).await.unwrap().is_some());
        assert!(store
            .get_user_by_email(&user.email)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_user_by_referral_code(&code)
            .await
            .unwrap()
            .is_some());

        assert!(store.mark_verified(&id).await.unwrap());
        // Second call reports no change.
        assert!(!store.mark_verified(&id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let store = MemoryStore::new();
        let user = UserRecord::new("dup@example.com", "hash", None);
        let clash = UserRecord::new("dup@example.com", "hash", None);

        store.insert_user(&user).await.unwrap();
        assert!(store.insert_user(&clash).await.is_err());
    }

    #[tokio::test]
    async fn entry_updates_balances() {
        let store = MemoryStore::new();
        let user = seeded_user(0);
        let id = user.id.clone();
        store.insert_user(&user).await.unwrap();

        store
            .append_entry(&LedgerEntry::credit(id.clone(), 20, EntryKind::Admin, "seed"))
            .await
            .unwrap();
        assert_eq!(store.get_user(&id).await.unwrap().unwrap().coins, 20);

        store
            .append_entry(&LedgerEntry::debit(
                id.clone(),
                7,
                EntryKind::Deployment,
                "charge",
            ))
            .await
            .unwrap();
        assert_eq!(store.get_user(&id).await.unwrap().unwrap().coins, 13);
    }

    #[tokio::test]
    async fn guarded_debit_rejects_overdraft() {
        let store = MemoryStore::new();
        let user = seeded_user(5);
        let id = user.id.clone();
        store.insert_user(&user).await.unwrap();

        let result = store
            .append_entry(&LedgerEntry::debit(
                id.clone(),
                10,
                EntryKind::Deployment,
                "charge",
            ))
            .await;
        assert!(matches!(
            result,
            Err(ControlError::InsufficientBalance { needed: 10 })
        ));
        // Nothing was written.
        assert_eq!(store.get_user(&id).await.unwrap().unwrap().coins, 5);
        assert!(store
            .list_entries(&id, &EntryFilter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reserve_respects_capacity() {
        let store = MemoryStore::new();
        let mut account = AccountRecord::new("pool-1", "token", 2);
        account.used_count = 1;
        let id = account.id.clone();
        store.insert_account(&account).await.unwrap();

        assert!(store.reserve_account(&id).await.unwrap());
        // Now saturated.
        assert!(!store.reserve_account(&id).await.unwrap());

        store.force_reserve_account(&id).await.unwrap();
        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.used_count, 3);

        store.release_account(&id).await.unwrap();
        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.used_count, 2);
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let store = MemoryStore::new();
        let account = AccountRecord::new("pool-1", "token", 2);
        let id = account.id.clone();
        store.insert_account(&account).await.unwrap();

        store.release_account(&id).await.unwrap();
        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.used_count, 0);
    }

    #[tokio::test]
    async fn active_accounts_ordered_by_utilisation() {
        let store = MemoryStore::new();
        let mut a = AccountRecord::new("a", "t", 5);
        a.used_count = 3;
        let mut b = AccountRecord::new("b", "t", 5);
        b.used_count = 1;
        let mut c = AccountRecord::new("c", "t", 5);
        c.active = false;

        for account in [&a, &b, &c] {
            store.insert_account(account).await.unwrap();
        }

        let active = store.active_accounts().await.unwrap();
        let names: Vec<_> = active.iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn charge_and_insert_is_atomic() {
        let store = MemoryStore::new();
        let user = seeded_user(5);
        let user_id = user.id.clone();
        store.insert_user(&user).await.unwrap();

        let account = AccountRecord::new("pool-1", "token", 5);
        store.insert_account(&account).await.unwrap();

        let record = test_deployment(&user_id, &account.id, 10);
        let charge = LedgerEntry::debit(user_id.clone(), 10, EntryKind::Deployment, "deploy");

        // Balance 5 < cost 10: the charge fails and no deployment appears.
        assert!(store
            .charge_and_insert_deployment(&record, &charge)
            .await
            .is_err());
        assert!(store
            .get_deployment(&record.data.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn fail_with_refund_restores_everything() {
        let store = MemoryStore::new();
        let user = seeded_user(15);
        let user_id = user.id.clone();
        store.insert_user(&user).await.unwrap();

        let account = AccountRecord::new("pool-1", "token", 5);
        let account_id = account.id.clone();
        store.insert_account(&account).await.unwrap();
        assert!(store.reserve_account(&account_id).await.unwrap());

        let record = test_deployment(&user_id, &account_id, 10);
        let deployment_id = record.data.id.clone();
        let charge = LedgerEntry::debit(user_id.clone(), 10, EntryKind::Deployment, "deploy");
        store
            .charge_and_insert_deployment(&record, &charge)
            .await
            .unwrap();
        assert_eq!(store.get_user(&user_id).await.unwrap().unwrap().coins, 5);

        let refund = LedgerEntry::credit(user_id.clone(), 10, EntryKind::Refund, "refund");
        store
            .fail_deployment_with_refund(
                &deployment_id,
                "build rejected",
                "provisioning failed: build rejected",
                &refund,
                &account_id,
            )
            .await
            .unwrap();

        let user = store.get_user(&user_id).await.unwrap().unwrap();
        assert_eq!(user.coins, 15);

        let account = store.get_account(&account_id).await.unwrap().unwrap();
        assert_eq!(account.used_count, 0);

        let deployment = store.get_deployment(&deployment_id).await.unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert!(deployment.data.log.contains("provisioning failed"));
    }

    #[tokio::test]
    async fn entry_listing_filters_and_paginates() {
        let store = MemoryStore::new();
        let user = seeded_user(100);
        let id = user.id.clone();
        store.insert_user(&user).await.unwrap();

        for i in 0..3 {
            store
                .append_entry(&LedgerEntry::debit(
                    id.clone(),
                    1,
                    EntryKind::Deployment,
                    format!("charge {i}"),
                ))
                .await
                .unwrap();
        }
        store
            .append_entry(&LedgerEntry::credit(id.clone(), 5, EntryKind::Daily, "daily"))
            .await
            .unwrap();

        let all = store.list_entries(&id, &EntryFilter::new()).await.unwrap();
        assert_eq!(all.len(), 4);

        let daily = store
            .list_entries(&id, &EntryFilter::new().with_kind(EntryKind::Daily))
            .await
            .unwrap();
        assert_eq!(daily.len(), 1);

        let page = store
            .list_entries(&id, &EntryFilter::new().with_limit(2).with_offset(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let last = store
            .last_entry_of_kind(&id, EntryKind::Daily)
            .await
            .unwrap();
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn deployment_log_is_append_only() {
        let store = MemoryStore::new();
        let user = seeded_user(100);
        store.insert_user(&user).await.unwrap();
        let account = AccountRecord::new("pool-1", "token", 5);
        store.insert_account(&account).await.unwrap();

        let record = test_deployment(&user.id, &account.id, 1);
        let id = record.data.id.clone();
        let charge = LedgerEntry::debit(user.id.clone(), 1, EntryKind::Deployment, "deploy");
        store
            .charge_and_insert_deployment(&record, &charge)
            .await
            .unwrap();

        store
            .append_deployment_log(&id, "created application avy-echo-01")
            .await
            .unwrap();
        store
            .append_deployment_log(&id, "build started")
            .await
            .unwrap();

        let record = store.get_deployment(&id).await.unwrap().unwrap();
        assert_eq!(
            record.data.log,
            "created application avy-echo-01\nbuild started\n"
        );
    }
}
