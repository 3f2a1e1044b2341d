//! Spend processor.
//!
//! RULE: A spend is all-or-nothing. Either every lot debit, every spend row
//! and the cached balance change commit together, or nothing does.
//!
//! Lots are consumed FIFO: oldest acquisition first, lot id breaking ties.
//! Each touched lot gets its own spend row so the audit log shows exactly
//! which coins were used.

use crate::{
    error::{LedgerError, LedgerResult},
    retry::RetryPolicy,
    store::{LedgerStore, Lot, LotDebit, TransactionEntry},
    types::{Coins, TransactionKind},
};
use chrono::{DateTime, Utc};

pub struct SpendProcessor<'a> {
    store: &'a LedgerStore,
    retry: &'a RetryPolicy,
}

impl<'a> SpendProcessor<'a> {
    pub fn new(store: &'a LedgerStore, retry: &'a RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Debit `amount` coins from the account's active lots, oldest first.
    /// Returns the per-lot breakdown.
    pub fn spend(&self, account_id: &str, amount: Coins, now: DateTime<Utc>) -> LedgerResult<Vec<LotDebit>> {
        self.spend_with_memo(account_id, amount, None, now)
    }

    pub fn spend_with_memo(
        &self,
        account_id: &str,
        amount: Coins,
        memo: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<LotDebit>> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        let debits = self
            .retry
            .run("spend", |_| self.try_spend(account_id, amount, memo, now))?;
        log::info!(
            "spend: account={account_id} amount={amount} lots={}",
            debits.len()
        );
        Ok(debits)
    }

    fn try_spend(
        &self,
        account_id: &str,
        amount: Coins,
        memo: Option<&str>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<LotDebit>> {
        self.store.atomic(|unit| {
            let account = unit.require_account(account_id)?;
            let lots = unit.active_lots(account_id)?;
            let out_of_range = || LedgerError::BalanceOutOfRange {
                account_id: account_id.to_string(),
                balance: account.cached_balance,
                delta: -amount,
            };
            let available = lots
                .iter()
                .try_fold(0 as Coins, |sum, lot| sum.checked_add(lot.amount_remaining))
                .ok_or_else(out_of_range)?;
            if amount > available {
                return Err(LedgerError::InsufficientBalance {
                    account_id: account_id.to_string(),
                    requested: amount,
                    available,
                });
            }
            if available != account.cached_balance {
                log::warn!(
                    "spend: account={account_id} cached balance {} disagrees with active lots {available}",
                    account.cached_balance
                );
            }

            let debits = plan_fifo(&lots, amount);
            let mut running = account.cached_balance;
            for debit in &debits {
                let lot = lots
                    .iter()
                    .find(|lot| lot.lot_id == debit.lot_id)
                    .ok_or(LedgerError::LotNotFound { lot_id: debit.lot_id })?;
                unit.debit_lot(lot, debit.amount)?;
                running = running.checked_sub(debit.amount).ok_or_else(out_of_range)?;
                unit.append_transaction(&TransactionEntry {
                    account_id,
                    lot_id: Some(debit.lot_id),
                    kind: TransactionKind::Spend,
                    amount: -debit.amount,
                    balance_after: running,
                    memo,
                    idempotency_key: None,
                    created_at: now,
                })?;
            }
            unit.apply_balance_delta(&account, -amount)?;
            Ok(debits)
        })
    }
}

/// Split `amount` across `lots` (already in FIFO order). Stops at the first
/// lot that covers the rest, so the result is a prefix of `lots`.
/// The caller guarantees the lots hold at least `amount`.
pub fn plan_fifo(lots: &[Lot], amount: Coins) -> Vec<LotDebit> {
    let mut left = amount;
    let mut debits = Vec::new();
    for lot in lots {
        if left == 0 {
            break;
        }
        let take = lot.amount_remaining.min(left);
        if take <= 0 {
            continue;
        }
        debits.push(LotDebit {
            lot_id: lot.lot_id,
            amount: take,
        });
        left -= take;
    }
    debits
}
