//! Core types for aviary-control.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an ID from an existing string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique ID using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type! {
    /// Unique identifier for a user.
    UserId
}

id_type! {
    /// Unique identifier for a bot template.
    BotId
}

id_type! {
    /// Unique identifier for a deployment account.
    AccountId
}

id_type! {
    /// Unique identifier for a deployment.
    DeploymentId
}

id_type! {
    /// Unique identifier for a ledger entry.
    EntryId
}

/// A platform user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Unique user identifier.
    pub id: UserId,
    /// Email address (unique).
    pub email: String,
    /// Opaque credential hash. Authentication mechanics live elsewhere.
    pub password_hash: String,
    /// Denormalised coin balance, kept in sync with the ledger.
    pub coins: i64,
    /// Invitation code other users can sign up with.
    pub referral_code: String,
    /// The user whose invitation code was used at signup, if any.
    pub referred_by: Option<UserId>,
    /// Whether the user completed email verification.
    pub verified: bool,
    /// When the user registered.
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// Create a new unverified user with a zero balance.
    #[must_use]
    pub fn new(
        email: impl Into<String>,
        password_hash: impl Into<String>,
        referred_by: Option<UserId>,
    ) -> Self {
        Self {
            id: UserId::generate(),
            email: email.into(),
            password_hash: password_hash.into(),
            coins: 0,
            referral_code: ulid::Ulid::new().to_string().to_lowercase(),
            referred_by,
            verified: false,
            created_at: Utc::now(),
        }
    }
}

/// One declared environment variable in a bot's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    /// Variable name.
    pub key: String,
    /// Default value applied when the deployer provides none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Whether a value must be present at deploy time.
    #[serde(default)]
    pub required: bool,
}

/// A deployable bot template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRecord {
    /// Unique bot identifier.
    pub id: BotId,
    /// User who submitted the bot.
    pub owner: UserId,
    /// Display name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Source repository the platform builds from.
    pub repo_url: String,
    /// Branch to build.
    pub branch: String,
    /// Declared environment variable schema.
    pub env_schema: Vec<EnvVarSpec>,
    /// Deployment cost in coins.
    pub cost: i64,
    /// Whether a moderator approved the bot for deployment.
    pub approved: bool,
    /// When the bot was submitted.
    pub created_at: DateTime<Utc>,
    /// When the bot was last edited.
    pub updated_at: DateTime<Utc>,
}

impl BotRecord {
    /// Create a new unapproved bot.
    #[must_use]
    pub fn new(
        owner: UserId,
        name: impl Into<String>,
        description: impl Into<String>,
        repo_url: impl Into<String>,
        branch: impl Into<String>,
        env_schema: Vec<EnvVarSpec>,
        cost: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BotId::generate(),
            owner,
            name: name.into(),
            description: description.into(),
            repo_url: repo_url.into(),
            branch: branch.into(),
            env_schema,
            cost,
            approved: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A deployment-capable account on the external platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Unique account identifier.
    pub id: AccountId,
    /// Operator-facing label.
    pub name: String,
    /// API token for the platform. Never exposed over the HTTP surface.
    pub credential: String,
    /// Whether the account participates in allocation.
    pub active: bool,
    /// Number of live deployments currently assigned to this account.
    pub used_count: i32,
    /// Capacity ceiling.
    pub max_deployments: i32,
    /// When the account was added to the pool.
    pub created_at: DateTime<Utc>,
}

impl AccountRecord {
    /// Create a new active account with no assigned deployments.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        credential: impl Into<String>,
        max_deployments: i32,
    ) -> Self {
        Self {
            id: AccountId::generate(),
            name: name.into(),
            credential: credential.into(),
            active: true,
            used_count: 0,
            max_deployments,
            created_at: Utc::now(),
        }
    }
}

/// Persisted deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Deployment created and charged, waiting for provisioning to start.
    Pending,
    /// Provisioning: external application and build in progress.
    Configuring,
    /// Deployment is live.
    Active,
    /// Provisioning failed; coins were refunded.
    Failed,
    /// Stopped by an operator.
    Stopped,
}

impl DeploymentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Configuring => "configuring",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// All statuses, in lifecycle order.
    #[must_use]
    pub const fn all() -> [Self; 5] {
        [
            Self::Pending,
            Self::Configuring,
            Self::Active,
            Self::Failed,
            Self::Stopped,
        ]
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "configuring" => Ok(Self::Configuring),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Common data shared across all deployment states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Owning user.
    pub user_id: UserId,
    /// Bot template this deployment runs.
    pub bot_id: BotId,
    /// Deployment account carrying the external application.
    pub account_id: AccountId,
    /// Name of the application on the external platform.
    pub app_name: String,
    /// Coins charged for this deployment.
    pub cost: i64,
    /// Environment variable values applied to the application.
    pub vars: BTreeMap<String, String>,
    /// Append-only human-readable provisioning journal.
    pub log: String,
    /// Error message if the deployment failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentData {
    /// Create new deployment data.
    #[must_use]
    pub fn new(
        user_id: UserId,
        bot_id: BotId,
        account_id: AccountId,
        app_name: impl Into<String>,
        cost: i64,
        vars: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            user_id,
            bot_id,
            account_id,
            app_name: app_name.into(),
            cost,
            vars,
            log: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A deployment record as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current status.
    pub status: DeploymentStatus,
}

impl DeploymentRecord {
    /// Create a new deployment record in the pending status.
    #[must_use]
    pub const fn new(data: DeploymentData) -> Self {
        Self {
            data,
            status: DeploymentStatus::Pending,
        }
    }
}

/// Kind of a coin movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Debit charged for a deployment creation or paid reconfigure.
    Deployment,
    /// Credit compensating a failed deployment or reconfigure.
    Refund,
    /// Peer-to-peer transfer between users.
    Transfer,
    /// Credit to the referrer when a referred signup verifies.
    Referral,
    /// Credit to the referred user when they verify.
    ReferralBonus,
    /// Daily claim credit.
    Daily,
    /// Operator-issued credit.
    Admin,
}

impl EntryKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Refund => "refund",
            Self::Transfer => "transfer",
            Self::Referral => "referral",
            Self::ReferralBonus => "referral_bonus",
            Self::Daily => "daily",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deployment" => Ok(Self::Deployment),
            "refund" => Ok(Self::Refund),
            "transfer" => Ok(Self::Transfer),
            "referral" => Ok(Self::Referral),
            "referral_bonus" => Ok(Self::ReferralBonus),
            "daily" => Ok(Self::Daily),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("unknown entry kind: {s}")),
        }
    }
}

/// An immutable record of a coin movement.
///
/// `sender = None` is a system credit; `receiver = None` is a system debit.
/// Amounts are always positive; direction comes from the sender/receiver
/// roles. For every user the intended invariant is
/// `coins == sum(amount where receiver) - sum(amount where sender)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry identifier.
    pub id: EntryId,
    /// Debited user, if any.
    pub sender: Option<UserId>,
    /// Credited user, if any.
    pub receiver: Option<UserId>,
    /// Coins moved. Always positive.
    pub amount: i64,
    /// Kind of movement.
    pub kind: EntryKind,
    /// Human-readable description.
    pub description: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// System-to-user credit.
    #[must_use]
    pub fn credit(
        receiver: UserId,
        amount: i64,
        kind: EntryKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            sender: None,
            receiver: Some(receiver),
            amount,
            kind,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// User-to-system debit.
    #[must_use]
    pub fn debit(
        sender: UserId,
        amount: i64,
        kind: EntryKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            sender: Some(sender),
            receiver: None,
            amount,
            kind,
            description: description.into(),
            created_at: Utc::now(),
        }
    }

    /// User-to-user transfer.
    #[must_use]
    pub fn transfer(
        sender: UserId,
        receiver: UserId,
        amount: i64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            sender: Some(sender),
            receiver: Some(receiver),
            amount,
            kind: EntryKind::Transfer,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}
