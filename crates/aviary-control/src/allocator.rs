//! Deployment account selection.
//!
//! Selection is a pure function over an immutable snapshot of the account
//! pool, so it can be tested without a store. Capacity bookkeeping is the
//! store's job: the caller reserves the selected account with an atomic
//! conditional increment and retries down the preference order when it
//! loses the race.

use crate::error::{ControlError, ControlResult};
use crate::types::{AccountId, AccountRecord};

/// Capacity snapshot of one account, as seen at selection time.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    /// Account identifier.
    pub id: AccountId,
    /// Live deployments currently assigned.
    pub used_count: i32,
    /// Capacity ceiling.
    pub max_deployments: i32,
}

impl AccountSnapshot {
    /// Spare capacity; negative when the account is overcommitted.
    #[must_use]
    pub const fn spare(&self) -> i32 {
        self.max_deployments - self.used_count
    }

    /// Whether the account can take another deployment.
    #[must_use]
    pub const fn has_capacity(&self) -> bool {
        self.used_count < self.max_deployments
    }
}

impl From<&AccountRecord> for AccountSnapshot {
    fn from(record: &AccountRecord) -> Self {
        Self {
            id: record.id.clone(),
            used_count: record.used_count,
            max_deployments: record.max_deployments,
        }
    }
}

/// Outcome of an allocation decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// An account with spare capacity, least utilised first.
    Preferred(AccountId),
    /// Every account is at or over capacity; this one has the most spare
    /// headroom (possibly none). Capacity is a soft guarantee: the caller
    /// may overcommit rather than refuse the deployment.
    Saturated(AccountId),
}

impl Selection {
    /// The selected account, regardless of how it was chosen.
    #[must_use]
    pub const fn account_id(&self) -> &AccountId {
        match self {
            Self::Preferred(id) | Self::Saturated(id) => id,
        }
    }
}

/// Select an account for a new deployment.
///
/// Accounts with spare capacity are preferred, least `used_count` first.
/// When every account is saturated the one maximising spare capacity is
/// returned instead of failing outright. An empty pool is the only hard
/// error.
pub fn select_account(pool: &[AccountSnapshot]) -> ControlResult<Selection> {
    if pool.is_empty() {
        return Err(ControlError::NoCapacityAvailable);
    }

    let preferred = pool
        .iter()
        .filter(|a| a.has_capacity())
        .min_by_key(|a| a.used_count);

    if let Some(account) = preferred {
        return Ok(Selection::Preferred(account.id.clone()));
    }

    let fallback = pool
        .iter()
        .max_by_key(|a| a.spare())
        .ok_or(ControlError::NoCapacityAvailable)?;

    Ok(Selection::Saturated(fallback.id.clone()))
}

/// Accounts with spare capacity in preference order (least utilised first).
///
/// Used by the caller to retry reservation when the first choice loses a
/// concurrent race.
#[must_use]
pub fn preference_order(pool: &[AccountSnapshot]) -> Vec<AccountSnapshot> {
    let mut candidates: Vec<_> = pool.iter().filter(|a| a.has_capacity()).cloned().collect();
    candidates.sort_by_key(|a| a.used_count);
    candidates
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn snapshot(id: &str, used: i32, max: i32) -> AccountSnapshot {
        AccountSnapshot {
            id: AccountId::new(id),
            used_count: used,
            max_deployments: max,
        }
    }

    #[test]
    fn empty_pool_has_no_capacity() {
        let result = select_account(&[]);
        assert!(matches!(result, Err(ControlError::NoCapacityAvailable)));
    }

    #[test]
    fn prefers_least_utilised_account_with_spare_capacity() {
        let pool = [snapshot("a", 5, 5), snapshot("b", 2, 5)];
        let selection = select_account(&pool).unwrap();
        assert_eq!(selection, Selection::Preferred(AccountId::new("b")));
    }

    #[test]
    fn never_prefers_a_saturated_account_while_spare_exists() {
        let pool = [
            snapshot("a", 5, 5),
            snapshot("b", 4, 5),
            snapshot("c", 3, 3),
        ];
        let selection = select_account(&pool).unwrap();
        assert_eq!(selection, Selection::Preferred(AccountId::new("b")));
    }

    #[test]
    fn saturated_pool_falls_back_rather_than_failing() {
        let pool = [snapshot("a", 5, 5), snapshot("b", 5, 5)];
        let selection = select_account(&pool).unwrap();
        // Zero spare capacity everywhere: the tie is non-deterministic by
        // design, any member is acceptable.
        assert!(matches!(selection, Selection::Saturated(_)));
    }

    #[test]
    fn fallback_maximises_headroom() {
        // Overcommitted pool: b is less overcommitted than a.
        let pool = [snapshot("a", 8, 5), snapshot("b", 6, 5)];
        let selection = select_account(&pool).unwrap();
        assert_eq!(selection, Selection::Saturated(AccountId::new("b")));
    }

    #[test]
    fn preference_order_sorts_by_utilisation() {
        let pool = [
            snapshot("a", 3, 5),
            snapshot("b", 1, 5),
            snapshot("c", 5, 5),
            snapshot("d", 2, 5),
        ];
        let order: Vec<_> = preference_order(&pool)
            .into_iter()
            .map(|a| a.id.as_str().to_owned())
            .collect();
        assert_eq!(order, vec!["b", "d", "a"]);
    }
}
