use crate::{
    tier::GrantSchedule,
    types::Coins,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A purchasable coin bundle. Store-side pricing lives with the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoinPackage {
    pub package_id: String,
    pub coins: Coins,
}

/// A coin reward (first match, daily login, ...). A `one_time` reward is
/// credited at most once per account, whatever claim key the caller sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardConfig {
    pub reward_id: String,
    pub coins: Coins,
    #[serde(default)]
    pub one_time: bool,
}

/// Bounded retry for optimistic conflicts and SQLite lock contention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5,
            max_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerConfigFile {
    lot_lifetime_days: i64,
    warning_lookahead_days: i64,
    batch_size: usize,
    #[serde(default)]
    max_batches_per_run: Option<usize>,
    #[serde(default)]
    retry: RetryConfig,
    grant_schedule: GrantSchedule,
    packages: Vec<CoinPackage>,
    rewards: Vec<RewardConfig>,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Days from acquisition until a lot expires.
    pub lot_lifetime_days: i64,
    /// How far ahead of expiry the warning notifier looks.
    pub warning_lookahead_days: i64,
    /// Page size for every batch scan.
    pub batch_size: usize,
    /// Upper bound on pages per job invocation; `None` runs to completion.
    pub max_batches_per_run: Option<usize>,
    pub retry: RetryConfig,
    pub grant_schedule: GrantSchedule,
    pub packages: HashMap<String, CoinPackage>,
    pub rewards: HashMap<String, RewardConfig>,
}

impl LedgerConfig {
    /// Load from `{data_dir}/ledger/ledger.json`.
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/ledger/ledger.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config = Self::from_json(&content)
            .map_err(|e| anyhow::anyhow!("Invalid ledger config {path}: {e}"))?;
        log::info!(
            "ledger config loaded from {path}: lifetime={}d lookahead={}d batch={}",
            config.lot_lifetime_days,
            config.warning_lookahead_days,
            config.batch_size
        );
        Ok(config)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let file: LedgerConfigFile = serde_json::from_str(content)?;
        let config = Self {
            lot_lifetime_days: file.lot_lifetime_days,
            warning_lookahead_days: file.warning_lookahead_days,
            batch_size: file.batch_size,
            max_batches_per_run: file.max_batches_per_run,
            retry: file.retry,
            grant_schedule: file.grant_schedule,
            packages: file
                .packages
                .into_iter()
                .map(|p| (p.package_id.clone(), p))
                .collect(),
            rewards: file
                .rewards
                .into_iter()
                .map(|r| (r.reward_id.clone(), r))
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.lot_lifetime_days > 0, "lot_lifetime_days must be positive");
        anyhow::ensure!(
            self.warning_lookahead_days >= 0,
            "warning_lookahead_days must not be negative"
        );
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(
            self.max_batches_per_run != Some(0),
            "max_batches_per_run must be positive when set"
        );
        anyhow::ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be positive");
        let schedule = self.grant_schedule;
        anyhow::ensure!(
            schedule.basic >= 0 && schedule.silver >= 0 && schedule.gold >= 0,
            "grant_schedule amounts must not be negative"
        );
        for package in self.packages.values() {
            anyhow::ensure!(
                package.coins > 0,
                "package '{}' must grant a positive amount",
                package.package_id
            );
        }
        for reward in self.rewards.values() {
            anyhow::ensure!(
                reward.coins > 0,
                "reward '{}' must grant a positive amount",
                reward.reward_id
            );
        }
        Ok(())
    }

    pub fn package(&self, package_id: &str) -> Option<&CoinPackage> {
        self.packages.get(package_id)
    }

    pub fn reward(&self, reward_id: &str) -> Option<&RewardConfig> {
        self.rewards.get(reward_id)
    }
}

impl Default for LedgerConfig {
    /// Mirrors `data/ledger/ledger.json`.
    fn default() -> Self {
        let packages = [
            ("starter", 100),
            ("popular", 500),
            ("value", 1000),
            ("premium", 5000),
        ];
        let rewards = [
            ("first_match", 50, true),
            ("complete_profile", 100, true),
            ("daily_login", 10, false),
            ("week_streak", 50, false),
            ("month_streak", 200, false),
            ("first_message", 25, false),
            ("photo_verification", 75, true),
            ("refer_friend", 100, false),
        ];
        Self {
            lot_lifetime_days: 365,
            warning_lookahead_days: 30,
            batch_size: 500,
            max_batches_per_run: None,
            retry: RetryConfig::default(),
            grant_schedule: GrantSchedule::default(),
            packages: packages
                .into_iter()
                .map(|(id, coins)| {
                    (
                        id.to_string(),
                        CoinPackage {
                            package_id: id.to_string(),
                            coins,
                        },
                    )
                })
                .collect(),
            rewards: rewards
                .into_iter()
                .map(|(id, coins, one_time)| {
                    (
                        id.to_string(),
                        RewardConfig {
                            reward_id: id.to_string(),
                            coins,
                            one_time,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LedgerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.package("premium").map(|p| p.coins), Some(5000));
        assert_eq!(config.reward("daily_login").map(|r| r.coins), Some(10));
        assert!(config.reward("first_match").is_some_and(|r| r.one_time));
        assert!(!config.reward("daily_login").is_some_and(|r| r.one_time));
        assert!(config.package("mega").is_none());
    }

    #[test]
    fn shipped_file_matches_defaults() {
        let content = include_str!("../../data/ledger/ledger.json");
        let loaded = LedgerConfig::from_json(content).unwrap();
        let defaults = LedgerConfig::default();
        assert_eq!(loaded.lot_lifetime_days, defaults.lot_lifetime_days);
        assert_eq!(loaded.warning_lookahead_days, defaults.warning_lookahead_days);
        assert_eq!(loaded.batch_size, defaults.batch_size);
        assert_eq!(loaded.retry, defaults.retry);
        assert_eq!(loaded.grant_schedule, defaults.grant_schedule);
        assert_eq!(loaded.packages, defaults.packages);
        assert_eq!(loaded.rewards, defaults.rewards);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let content = r#"{
            "lot_lifetime_days": 365,
            "warning_lookahead_days": 7,
            "batch_size": 0,
            "grant_schedule": { "basic": 0, "silver": 100, "gold": 250 },
            "packages": [],
            "rewards": []
        }"#;
        assert!(LedgerConfig::from_json(content).is_err());
    }
}
