//! Coin economy operations over the store.
//!
//! Every coin movement goes through [`PlatformStore::append_entry`], which
//! applies the entry and the denormalised balance delta atomically. This
//! module adds the business rules on top: cooldowns, transfer constraints,
//! referral reward timing.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use crate::config::EconomyConfig;
use crate::error::{ControlError, ControlResult};
use crate::store::{EntryFilter, PlatformStore};
use crate::types::{EntryKind, LedgerEntry, UserId, UserRecord};

/// Coin economy service.
pub struct Ledger {
    store: Arc<dyn PlatformStore>,
    economy: EconomyConfig,
}

impl Ledger {
    /// Create a new ledger service.
    #[must_use]
    pub fn new(store: Arc<dyn PlatformStore>, economy: EconomyConfig) -> Self {
        Self { store, economy }
    }

    /// Claim the daily coin credit.
    ///
    /// Gated by a 24-hour cooldown measured from the user's most recent
    /// `daily` entry.
    pub async fn claim_daily(&self, user_id: &UserId) -> ControlResult<LedgerEntry> {
        self.require_user(user_id).await?;

        if let Some(last) = self
            .store
            .last_entry_of_kind(user_id, EntryKind::Daily)
            .await?
        {
            let elapsed = Utc::now().signed_duration_since(last.created_at);
            let cooldown = Duration::hours(24);
            if elapsed < cooldown {
                let remaining = cooldown - elapsed;
                return Err(ControlError::DailyCooldown {
                    remaining_minutes: remaining.num_minutes().max(1),
                });
            }
        }

        let entry = LedgerEntry::credit(
            user_id.clone(),
            self.economy.daily_amount,
            EntryKind::Daily,
            "daily claim",
        );
        self.store.append_entry(&entry).await?;

        info!(user_id = %user_id, amount = entry.amount, "daily claim credited");
        Ok(entry)
    }

    /// Transfer coins between users.
    ///
    /// The sender must differ from the receiver, the receiver must be
    /// verified, and the sender's balance must cover the amount. The
    /// balance guard itself lives in the store's atomic append.
    pub async fn transfer(
        &self,
        sender_id: &UserId,
        receiver_id: &UserId,
        amount: i64,
    ) -> ControlResult<LedgerEntry> {
        if amount <= 0 {
            return Err(ControlError::validation("transfer amount must be positive"));
        }
        if sender_id == receiver_id {
            return Err(ControlError::validation("cannot transfer to yourself"));
        }

        self.require_user(sender_id).await?;
        let receiver = self.require_user(receiver_id).await?;
        if !receiver.verified {
            return Err(ControlError::validation(
                "receiver has not completed verification",
            ));
        }

        let entry = LedgerEntry::transfer(
            sender_id.clone(),
            receiver_id.clone(),
            amount,
            format!("transfer to {}", receiver.email),
        );
        self.store.append_entry(&entry).await?;

        info!(
            sender = %sender_id,
            receiver = %receiver_id,
            amount,
            "transfer completed"
        );
        Ok(entry)
    }

    /// Credit referral rewards after a referred user verifies.
    ///
    /// Writes two entries: the referrer's reward and the referred user's
    /// bonus. The caller is responsible for invoking this at most once per
    /// referred user (the verification flip is the idempotency gate).
    pub async fn grant_referral_rewards(
        &self,
        referrer_id: &UserId,
        referred: &UserRecord,
    ) -> ControlResult<()> {
        let reward = LedgerEntry::credit(
            referrer_id.clone(),
            self.economy.referral_reward,
            EntryKind::Referral,
            format!("referral reward for inviting {}", referred.email),
        );
        self.store.append_entry(&reward).await?;

        let bonus = LedgerEntry::credit(
            referred.id.clone(),
            self.economy.referral_bonus,
            EntryKind::ReferralBonus,
            "welcome bonus for joining via referral",
        );
        self.store.append_entry(&bonus).await?;

        info!(
            referrer = %referrer_id,
            referred = %referred.id,
            reward = self.economy.referral_reward,
            bonus = self.economy.referral_bonus,
            "referral rewards credited"
        );
        Ok(())
    }

    /// Operator-issued credit. Unconstrained.
    pub async fn admin_grant(
        &self,
        user_id: &UserId,
        amount: i64,
        description: impl Into<String>,
    ) -> ControlResult<LedgerEntry> {
        if amount <= 0 {
            return Err(ControlError::validation("grant amount must be positive"));
        }
        self.require_user(user_id).await?;

        let entry = LedgerEntry::credit(user_id.clone(), amount, EntryKind::Admin, description);
        self.store.append_entry(&entry).await?;

        info!(user_id = %user_id, amount, "operator grant credited");
        Ok(entry)
    }

    /// Paginated coin history for a user, newest first.
    pub async fn history(
        &self,
        user_id: &UserId,
        filter: &EntryFilter,
    ) -> ControlResult<Vec<LedgerEntry>> {
        self.require_user(user_id).await?;
        self.store.list_entries(user_id, filter).await
    }

    async fn require_user(&self, id: &UserId) -> ControlResult<UserRecord> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| ControlError::UserNotFound(id.to_string()))
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn seeded(store: &Arc<dyn PlatformStore>, coins: i64, verified: bool) -> UserRecord {
        let mut user = UserRecord::new(
            format!("{}@example.com", UserId::generate()),
            "hash",
            None,
        );
        user.coins = coins;
        user.verified = verified;
        store.insert_user(&user).await.unwrap();
        user
    }

    fn ledger(store: &Arc<dyn PlatformStore>) -> Ledger {
        Ledger::new(Arc::clone(store), EconomyConfig::default())
    }

    #[tokio::test]
    async fn daily_claim_credits_configured_amount() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let user = seeded(&store, 0, true).await;

        let entry = ledger.claim_daily(&user.id).await.unwrap();
        assert_eq!(entry.kind, EntryKind::Daily);
        assert_eq!(entry.amount, 5);

        let balance = store.get_user(&user.id).await.unwrap().unwrap().coins;
        assert_eq!(balance, 5);
    }

    #[tokio::test]
    async fn daily_claim_enforces_cooldown() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let user = seeded(&store, 0, true).await;

        ledger.claim_daily(&user.id).await.unwrap();

        let second = ledger.claim_daily(&user.id).await;
        assert!(matches!(second, Err(ControlError::DailyCooldown { .. })));
    }

    #[tokio::test]
    async fn daily_claim_allowed_after_cooldown_elapsed() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let user = seeded(&store, 0, true).await;

        // Backdate a prior claim past the cooldown window.
        let mut stale = LedgerEntry::credit(user.id.clone(), 5, EntryKind::Daily, "daily claim");
        stale.created_at = Utc::now() - Duration::hours(25);
        store.append_entry(&stale).await.unwrap();

        assert!(ledger.claim_daily(&user.id).await.is_ok());
    }

    #[tokio::test]
    async fn transfer_moves_coins_between_users() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let sender = seeded(&store, 20, true).await;
        let receiver = seeded(&store, 0, true).await;

        ledger.transfer(&sender.id, &receiver.id, 8).await.unwrap();

        assert_eq!(store.get_user(&sender.id).await.unwrap().unwrap().coins, 12);
        assert_eq!(store.get_user(&receiver.id).await.unwrap().unwrap().coins, 8);
    }

    #[tokio::test]
    async fn transfer_rejects_overdraft() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let sender = seeded(&store, 5, true).await;
        let receiver = seeded(&store, 0, true).await;

        let result = ledger.transfer(&sender.id, &receiver.id, 6).await;
        assert!(matches!(
            result,
            Err(ControlError::InsufficientBalance { .. })
        ));
        assert_eq!(store.get_user(&sender.id).await.unwrap().unwrap().coins, 5);
        assert_eq!(store.get_user(&receiver.id).await.unwrap().unwrap().coins, 0);
    }

    #[tokio::test]
    async fn transfer_rejects_unverified_receiver_and_self() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let sender = seeded(&store, 20, true).await;
        let unverified = seeded(&store, 0, false).await;

        assert!(matches!(
            ledger.transfer(&sender.id, &unverified.id, 5).await,
            Err(ControlError::Validation(_))
        ));
        assert!(matches!(
            ledger.transfer(&sender.id, &sender.id, 5).await,
            Err(ControlError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn referral_rewards_credit_both_sides() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let referrer = seeded(&store, 0, true).await;
        let referred = seeded(&store, 0, true).await;

        ledger
            .grant_referral_rewards(&referrer.id, &referred)
            .await
            .unwrap();

        assert_eq!(
            store.get_user(&referrer.id).await.unwrap().unwrap().coins,
            10
        );
        assert_eq!(store.get_user(&referred.id).await.unwrap().unwrap().coins, 5);

        let reward = store
            .last_entry_of_kind(&referrer.id, EntryKind::Referral)
            .await
            .unwrap();
        assert!(reward.is_some());
    }

    #[tokio::test]
    async fn admin_grant_requires_positive_amount() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let user = seeded(&store, 0, true).await;

        assert!(ledger.admin_grant(&user.id, 0, "zero").await.is_err());
        assert!(ledger.admin_grant(&user.id, 100, "top-up").await.is_ok());
        assert_eq!(store.get_user(&user.id).await.unwrap().unwrap().coins, 100);
    }

    #[tokio::test]
    async fn history_lists_newest_first() {
        let store: Arc<dyn PlatformStore> = Arc::new(MemoryStore::new());
        let ledger = ledger(&store);
        let user = seeded(&store, 0, true).await;

        ledger.admin_grant(&user.id, 10, "first").await.unwrap();
        ledger.admin_grant(&user.id, 20, "second").await.unwrap();

        let entries = ledger.history(&user.id, &EntryFilter::new()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].created_at >= entries[1].created_at);
    }
}
