//! The coin ledger's on-demand surface.
//!
//! RULE: Callers never touch lots directly. Credits go through the lot
//! store, debits through the spend processor, reads through the balance
//! aggregator. `CoinLedger` wires the three to one connection, one config
//! and one clock.

use crate::{
    balance::{BalanceAggregator, BalanceAudit, BalanceBreakdown},
    clock::LedgerClock,
    command::{CommandOutcome, LedgerCommand},
    config::LedgerConfig,
    error::{LedgerError, LedgerResult},
    retry::RetryPolicy,
    spend_processor::SpendProcessor,
    store::{CreateLotOutcome, LedgerStore, LedgerTransaction, Lot, LotDebit, NewLot},
    types::{Coins, LotSource},
};
use chrono::Duration;
use std::sync::Arc;

pub struct CoinLedger {
    store:  LedgerStore,
    config: LedgerConfig,
    clock:  Arc<dyn LedgerClock>,
    retry:  RetryPolicy,
}

impl CoinLedger {
    pub fn new(store: LedgerStore, config: LedgerConfig, clock: Arc<dyn LedgerClock>) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            store,
            config,
            clock,
            retry,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn lifetime(&self) -> Duration {
        Duration::days(self.config.lot_lifetime_days)
    }

    // ── Lot store ───────────────────────────────────────────────

    /// Record an acquisition at the current clock time.
    pub fn create_lot(
        &self,
        account_id: &str,
        amount: Coins,
        source: LotSource,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<CreateLotOutcome> {
        let mut new = NewLot::new(account_id, amount, source);
        new.idempotency_key = idempotency_key.map(str::to_string);
        self.create(&new)
    }

    pub fn create(&self, new: &NewLot) -> LedgerResult<CreateLotOutcome> {
        let now = self.clock.now();
        self.retry
            .run("create lot", |_| self.store.create_lot(new, now, self.lifetime()))
    }

    /// Credit a catalog package. The store's transaction id is the key, so
    /// a replayed receipt credits once.
    pub fn purchase_package(
        &self,
        account_id: &str,
        package_id: &str,
        store_transaction_id: &str,
    ) -> LedgerResult<CreateLotOutcome> {
        let package = self
            .config
            .package(package_id)
            .ok_or_else(|| LedgerError::UnknownPackage {
                package_id: package_id.to_string(),
            })?;
        let new = NewLot::new(account_id, package.coins, LotSource::Purchase)
            .with_key(format!("purchase:{store_transaction_id}"))
            .with_memo(format!("package {package_id}"));
        let outcome = self.create(&new)?;
        if outcome.is_new() {
            log::info!(
                "purchase: account={account_id} package={package_id} coins={} lot={}",
                package.coins,
                outcome.lot().lot_id
            );
        }
        Ok(outcome)
    }

    /// Credit a reward, at most once per `claim_key`. One-time rewards ignore
    /// the claim key and are credited at most once per account.
    pub fn claim_reward(&self, account_id: &str, reward_id: &str, claim_key: &str) -> LedgerResult<CreateLotOutcome> {
        let reward = self
            .config
            .reward(reward_id)
            .ok_or_else(|| LedgerError::UnknownReward {
                reward_id: reward_id.to_string(),
            })?;
        let key = if reward.one_time {
            format!("reward:{reward_id}")
        } else {
            format!("reward:{reward_id}:{claim_key}")
        };
        let new = NewLot::new(account_id, reward.coins, LotSource::Reward)
            .with_key(key)
            .with_memo(format!("reward {reward_id}"));
        let outcome = self.create(&new)?;
        if outcome.is_new() {
            log::info!(
                "reward: account={account_id} reward={reward_id} coins={} lot={}",
                reward.coins,
                outcome.lot().lot_id
            );
        } else if reward.one_time {
            log::info!("reward: account={account_id} reward={reward_id} already claimed");
        }
        Ok(outcome)
    }

    pub fn active_lots(&self, account_id: &str) -> LedgerResult<Vec<Lot>> {
        self.store.active_lots(account_id)
    }

    pub fn lots(&self, account_id: &str) -> LedgerResult<Vec<Lot>> {
        self.store.lots_for(account_id)
    }

    pub fn transactions(&self, account_id: &str) -> LedgerResult<Vec<LedgerTransaction>> {
        self.store.transactions_for(account_id)
    }

    // ── Spend ───────────────────────────────────────────────────

    pub fn spend(&self, account_id: &str, amount: Coins) -> LedgerResult<Vec<LotDebit>> {
        SpendProcessor::new(&self.store, &self.retry).spend(account_id, amount, self.clock.now())
    }

    pub fn spend_with_memo(&self, account_id: &str, amount: Coins, memo: &str) -> LedgerResult<Vec<LotDebit>> {
        SpendProcessor::new(&self.store, &self.retry).spend_with_memo(
            account_id,
            amount,
            Some(memo),
            self.clock.now(),
        )
    }

    // ── Balance ─────────────────────────────────────────────────

    pub fn get_balance(&self, account_id: &str) -> LedgerResult<Coins> {
        BalanceAggregator::new(&self.store).get_balance(account_id)
    }

    pub fn balance_breakdown(&self, account_id: &str) -> LedgerResult<BalanceBreakdown> {
        BalanceAggregator::new(&self.store).breakdown(account_id)
    }

    pub fn audit(&self, account_id: &str) -> LedgerResult<BalanceAudit> {
        BalanceAggregator::new(&self.store).audit(account_id)
    }

    pub fn audit_all(&self) -> LedgerResult<Vec<BalanceAudit>> {
        BalanceAggregator::new(&self.store).audit_all()
    }

    pub fn repair(&self, account_id: &str) -> LedgerResult<BalanceAudit> {
        BalanceAggregator::new(&self.store).repair(account_id)
    }

    // ── Commands ────────────────────────────────────────────────

    pub fn apply(&self, command: &LedgerCommand) -> LedgerResult<CommandOutcome> {
        match command {
            LedgerCommand::Purchase {
                account_id,
                package_id,
                store_transaction_id,
            } => {
                let outcome = self.purchase_package(account_id, package_id, store_transaction_id)?;
                Ok(CommandOutcome::credited(&outcome, self.get_balance(account_id)?))
            }
            LedgerCommand::ClaimReward {
                account_id,
                reward_id,
                claim_key,
            } => {
                let outcome = self.claim_reward(account_id, reward_id, claim_key)?;
                Ok(CommandOutcome::credited(&outcome, self.get_balance(account_id)?))
            }
            LedgerCommand::Spend {
                account_id,
                amount,
                memo,
            } => {
                let debits = match memo {
                    Some(memo) => self.spend_with_memo(account_id, *amount, memo)?,
                    None => self.spend(account_id, *amount)?,
                };
                Ok(CommandOutcome::Spent {
                    debits,
                    balance: self.get_balance(account_id)?,
                })
            }
        }
    }
}
