//! Deterministic synthetic traffic.
//!
//! RULE: Nothing here calls a platform RNG. Every stream is derived from one
//! master seed, so a seed reproduces the same accounts, tiers and daily
//! commands.
//!
//! Each concern draws from its own stream, seeded from
//! (master_seed XOR stream index). Adding a stream never changes the others.

use crate::{
    command::LedgerCommand,
    config::LedgerConfig,
    tier::{Subscriber, SubscriptionTier},
    types::{AccountId, Coins},
};
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG stream.
pub struct WorkloadRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl WorkloadRng {
    pub fn new(master_seed: u64, stream: WorkloadStream) -> Self {
        let derived_seed = master_seed ^ (stream as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            name: stream.name(),
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n). `n` of zero yields zero.
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.next_u64_below(items.len() as u64) as usize;
        items.get(idx)
    }
}

/// Stable stream assignments.
/// NEVER reorder or remove entries — only append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum WorkloadStream {
    Tiers = 0,
    Traffic = 1,
}

impl WorkloadStream {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tiers => "tiers",
            Self::Traffic => "traffic",
        }
    }
}

/// Per-account, per-day probabilities.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadProfile {
    pub purchase_probability: f64,
    pub reward_probability: f64,
    pub spend_probability: f64,
    pub max_spend: Coins,
}

impl Default for WorkloadProfile {
    fn default() -> Self {
        Self {
            purchase_probability: 0.03,
            reward_probability: 0.10,
            spend_probability: 0.25,
            max_spend: 120,
        }
    }
}

pub struct WorkloadGenerator {
    seed: u64,
    rng: WorkloadRng,
    accounts: Vec<AccountId>,
    packages: Vec<String>,
    rewards: Vec<String>,
    profile: WorkloadProfile,
    sequence: u64,
}

impl WorkloadGenerator {
    /// Accounts are named `user-0000`, `user-0001`, ...
    pub fn new(seed: u64, account_count: usize, config: &LedgerConfig) -> Self {
        let accounts = (0..account_count).map(|i| format!("user-{i:04}")).collect();
        // Catalog maps iterate in arbitrary order; sort for reproducibility.
        let mut packages: Vec<String> = config.packages.keys().cloned().collect();
        packages.sort();
        let mut rewards: Vec<String> = config.rewards.keys().cloned().collect();
        rewards.sort();
        Self {
            seed,
            rng: WorkloadRng::new(seed, WorkloadStream::Traffic),
            accounts,
            packages,
            rewards,
            profile: WorkloadProfile::default(),
            sequence: 0,
        }
    }

    pub fn with_profile(mut self, profile: WorkloadProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn accounts(&self) -> &[AccountId] {
        &self.accounts
    }

    /// Tier per account: half basic, 30% silver, 20% gold.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        let mut rng = WorkloadRng::new(self.seed, WorkloadStream::Tiers);
        self.accounts
            .iter()
            .map(|account_id| {
                let roll = rng.next_f64();
                let tier = if roll < 0.5 {
                    SubscriptionTier::Basic
                } else if roll < 0.8 {
                    SubscriptionTier::Silver
                } else {
                    SubscriptionTier::Gold
                };
                Subscriber {
                    account_id: account_id.clone(),
                    tier,
                }
            })
            .collect()
    }

    /// One simulated day of on-demand traffic.
    pub fn commands_for_day(&mut self, day: u64) -> Vec<LedgerCommand> {
        let mut commands = Vec::new();
        for account_id in &self.accounts {
            if self.rng.chance(self.profile.purchase_probability) {
                if let Some(package_id) = self.rng.pick(&self.packages) {
                    self.sequence += 1;
                    commands.push(LedgerCommand::Purchase {
                        account_id: account_id.clone(),
                        package_id: package_id.clone(),
                        store_transaction_id: format!("sim-{}-{}", self.seed, self.sequence),
                    });
                }
            }
            if self.rng.chance(self.profile.reward_probability) {
                if let Some(reward_id) = self.rng.pick(&self.rewards) {
                    commands.push(LedgerCommand::ClaimReward {
                        account_id: account_id.clone(),
                        reward_id: reward_id.clone(),
                        claim_key: format!("day-{day}"),
                    });
                }
            }
            if self.rng.chance(self.profile.spend_probability) {
                let amount = 1 + self.rng.next_u64_below(self.profile.max_spend.max(1) as u64) as Coins;
                commands.push(LedgerCommand::Spend {
                    account_id: account_id.clone(),
                    amount,
                    memo: None,
                });
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_traffic() {
        let config = LedgerConfig::default();
        let mut a = WorkloadGenerator::new(42, 20, &config);
        let mut b = WorkloadGenerator::new(42, 20, &config);
        for day in 0..10 {
            assert_eq!(a.commands_for_day(day), b.commands_for_day(day));
        }
        assert_eq!(a.subscribers(), b.subscribers());
    }

    #[test]
    fn different_seeds_diverge() {
        let config = LedgerConfig::default();
        let mut a = WorkloadGenerator::new(1, 50, &config);
        let mut b = WorkloadGenerator::new(2, 50, &config);
        let days_a: Vec<_> = (0..5).flat_map(|d| a.commands_for_day(d)).collect();
        let days_b: Vec<_> = (0..5).flat_map(|d| b.commands_for_day(d)).collect();
        assert_ne!(days_a, days_b);
    }

    #[test]
    fn streams_are_independent() {
        let mut tiers = WorkloadRng::new(7, WorkloadStream::Tiers);
        let mut traffic = WorkloadRng::new(7, WorkloadStream::Traffic);
        assert_ne!(tiers.next_f64(), traffic.next_f64());
        assert_eq!(tiers.name, "tiers");
    }
}
