//! Configuration for swap-bot.
//!
//! Supports loading from a TOML file with environment variable overrides
//! for secrets. Per-account settings fall back to the `[defaults]` table.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use swap_common::{CollectionKey, Credentials};

use crate::engine::{RetryPolicy, WatchConfig};

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Logging level.
    pub log_level: String,

    /// Fallbacks for fields an account does not set.
    pub defaults: AccountDefaults,

    /// Tracked accounts.
    pub accounts: Vec<AccountConfig>,
}

/// Shared per-account defaults.
#[derive(Debug, Clone)]
pub struct AccountDefaults {
    /// Time before an unresolved offer is force-checked.
    pub cancel_time: Duration,

    /// Margin on top of `cancel_time` for the watch deadline.
    pub watch_grace: Duration,

    /// Periodic full inventory re-scan; `None` disables it.
    pub refresh_interval: Option<Duration>,

    /// Retries per failure category before an offer is failed terminally.
    pub retry_cap: u32,

    pub exchange_details_backoff: Duration,
    pub rollback_failed_backoff: Duration,
    pub escrow_decline_backoff: Duration,
    pub not_complete_backoff: Duration,
}

impl Default for AccountDefaults {
    fn default() -> Self {
        Self {
            cancel_time: Duration::from_secs(300),
            watch_grace: Duration::from_secs(30),
            refresh_interval: None,
            retry_cap: 5,
            exchange_details_backoff: Duration::from_secs(5),
            rollback_failed_backoff: Duration::from_secs(15),
            escrow_decline_backoff: Duration::from_secs(5),
            not_complete_backoff: Duration::from_secs(10),
        }
    }
}

/// One tracked account.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub id: String,
    pub credentials: Credentials,

    /// (collection, sub-collection) pairs to track.
    pub tracked: Vec<CollectionKey>,

    /// Per-account overrides; `None` falls back to the defaults table.
    pub cancel_time: Option<Duration>,
    pub refresh_interval: Option<Duration>,
}

/// Account settings with defaults applied, ready to hand to the worker.
#[derive(Debug, Clone)]
pub struct ResolvedAccountConfig {
    pub id: String,
    pub credentials: Credentials,
    pub tracked: Vec<CollectionKey>,
    pub watch: WatchConfig,
    pub policy: RetryPolicy,
    pub refresh_interval: Option<Duration>,
}

impl AccountConfig {
    /// Merge this account's settings over the defaults table.
    pub fn resolve(&self, defaults: &AccountDefaults) -> ResolvedAccountConfig {
        ResolvedAccountConfig {
            id: self.id.clone(),
            credentials: self.credentials.clone(),
            tracked: self.tracked.clone(),
            watch: WatchConfig {
                cancel_after: self.cancel_time.unwrap_or(defaults.cancel_time),
                grace: defaults.watch_grace,
            },
            policy: RetryPolicy {
                cap: defaults.retry_cap,
                exchange_details_backoff: defaults.exchange_details_backoff,
                rollback_failed_backoff: defaults.rollback_failed_backoff,
                escrow_decline_backoff: defaults.escrow_decline_backoff,
                not_complete_backoff: defaults.not_complete_backoff,
            },
            refresh_interval: self.refresh_interval.or(defaults.refresh_interval),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            defaults: AccountDefaults::default(),
            accounts: vec![AccountConfig {
                id: "demo".to_string(),
                credentials: Credentials {
                    username: "demo".to_string(),
                    password: String::new(),
                    shared_secret: String::new(),
                    identity_secret: String::new(),
                },
                tracked: vec![CollectionKey::new("440", "2")],
                cancel_time: None,
                refresh_interval: None,
            }],
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides for secrets. Only fields left
    /// empty by the config file are filled in.
    pub fn apply_env_overrides(&mut self) {
        for account in &mut self.accounts {
            if account.credentials.password.is_empty() {
                if let Ok(password) = std::env::var("SWAP_BOT_PASSWORD") {
                    account.credentials.password = password;
                }
            }
            if account.credentials.shared_secret.is_empty() {
                if let Ok(secret) = std::env::var("SWAP_BOT_SHARED_SECRET") {
                    account.credentials.shared_secret = secret;
                }
            }
            if account.credentials.identity_secret.is_empty() {
                if let Ok(secret) = std::env::var("SWAP_BOT_IDENTITY_SECRET") {
                    account.credentials.identity_secret = secret;
                }
            }
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("At least one account must be configured");
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.id.is_empty() {
                bail!("Account id must not be empty");
            }
            if !seen.insert(&account.id) {
                bail!("Duplicate account id: {}", account.id);
            }
            if account.credentials.username.is_empty() {
                bail!("Account {} has no username", account.id);
            }
            if account.tracked.is_empty() {
                bail!("Account {} tracks no inventories", account.id);
            }
        }

        if self.defaults.retry_cap == 0 {
            bail!("retry_cap must be at least 1");
        }
        if self.defaults.cancel_time.is_zero() {
            bail!("cancel_time_secs must be positive");
        }
        for (name, backoff) in [
            ("exchange_details_backoff_secs", self.defaults.exchange_details_backoff),
            ("rollback_failed_backoff_secs", self.defaults.rollback_failed_backoff),
            ("escrow_decline_backoff_secs", self.defaults.escrow_decline_backoff),
            ("not_complete_backoff_secs", self.defaults.not_complete_backoff),
        ] {
            if backoff.is_zero() {
                bail!("{name} must be positive");
            }
        }

        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    defaults: DefaultsToml,
    #[serde(default)]
    accounts: Vec<AccountToml>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DefaultsToml {
    cancel_time_secs: u64,
    watch_grace_secs: u64,
    /// 0 disables the periodic re-scan.
    refresh_interval_secs: u64,
    retry_cap: u32,
    exchange_details_backoff_secs: u64,
    rollback_failed_backoff_secs: u64,
    escrow_decline_backoff_secs: u64,
    not_complete_backoff_secs: u64,
}

impl Default for DefaultsToml {
    fn default() -> Self {
        Self {
            cancel_time_secs: 300,
            watch_grace_secs: 30,
            refresh_interval_secs: 0,
            retry_cap: 5,
            exchange_details_backoff_secs: 5,
            rollback_failed_backoff_secs: 15,
            escrow_decline_backoff_secs: 5,
            not_complete_backoff_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccountToml {
    id: String,
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    shared_secret: String,
    #[serde(default)]
    identity_secret: String,
    /// collection id -> sub-collection ids.
    #[serde(default)]
    tracked: BTreeMap<String, Vec<String>>,
    cancel_time_secs: Option<u64>,
    refresh_interval_secs: Option<u64>,
}

fn interval_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl From<TomlConfig> for ManagerConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            log_level: toml.log_level,
            defaults: AccountDefaults {
                cancel_time: Duration::from_secs(toml.defaults.cancel_time_secs),
                watch_grace: Duration::from_secs(toml.defaults.watch_grace_secs),
                refresh_interval: interval_from_secs(toml.defaults.refresh_interval_secs),
                retry_cap: toml.defaults.retry_cap,
                exchange_details_backoff: Duration::from_secs(
                    toml.defaults.exchange_details_backoff_secs,
                ),
                rollback_failed_backoff: Duration::from_secs(
                    toml.defaults.rollback_failed_backoff_secs,
                ),
                escrow_decline_backoff: Duration::from_secs(
                    toml.defaults.escrow_decline_backoff_secs,
                ),
                not_complete_backoff: Duration::from_secs(
                    toml.defaults.not_complete_backoff_secs,
                ),
            },
            accounts: toml
                .accounts
                .into_iter()
                .map(|account| AccountConfig {
                    tracked: account
                        .tracked
                        .iter()
                        .flat_map(|(collection, subs)| {
                            subs.iter()
                                .map(|sub| CollectionKey::new(collection.clone(), sub.clone()))
                        })
                        .collect(),
                    credentials: Credentials {
                        username: account.username,
                        password: account.password,
                        shared_secret: account.shared_secret,
                        identity_secret: account.identity_secret,
                    },
                    id: account.id,
                    cancel_time: account.cancel_time_secs.map(Duration::from_secs),
                    refresh_interval: account.refresh_interval_secs.and_then(interval_from_secs),
                })
                .collect(),
        }
    }
}
