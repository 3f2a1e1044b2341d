//! Balance aggregator.
//!
//! RULE: The aggregator never writes lots. The cached balance on the account
//! row is the answer to "what is my balance"; it is maintained by the same
//! atomic unit that changes a lot. This module reads it, and checks it
//! against the two independent derivations:
//!   - Σ amount_remaining over active lots
//!   - Σ amount over the transaction log

use crate::{
    error::LedgerResult,
    store::LedgerStore,
    types::{AccountId, Coins, LotId, LotSource},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three views of one account's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAudit {
    pub account_id: AccountId,
    pub cached_balance: Coins,
    pub active_lot_total: Coins,
    pub transaction_total: Coins,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.cached_balance == self.active_lot_total && self.cached_balance == self.transaction_total
    }
}

/// The soonest upcoming expiry on an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingExpiry {
    pub lot_id: LotId,
    pub amount: Coins,
    pub expires_at: DateTime<Utc>,
}

/// Balance split by how the coins were acquired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceBreakdown {
    pub total: Coins,
    pub granted: Coins,
    pub purchased: Coins,
    pub rewarded: Coins,
    pub next_expiry: Option<UpcomingExpiry>,
}

pub struct BalanceAggregator<'a> {
    store: &'a LedgerStore,
}

impl<'a> BalanceAggregator<'a> {
    pub fn new(store: &'a LedgerStore) -> Self {
        Self { store }
    }

    /// Cached balance, one primary-key read. Unknown accounts hold 0.
    pub fn get_balance(&self, account_id: &str) -> LedgerResult<Coins> {
        Ok(self.store.cached_balance(account_id)?.unwrap_or(0))
    }

    /// Read all three totals in one read transaction so they describe the
    /// same instant. Unknown accounts audit as all zeros.
    pub fn audit(&self, account_id: &str) -> LedgerResult<BalanceAudit> {
        self.store.read(|unit| {
            let cached_balance = unit
                .account(account_id)?
                .map(|account| account.cached_balance)
                .unwrap_or(0);
            Ok(BalanceAudit {
                account_id: account_id.to_string(),
                cached_balance,
                active_lot_total: unit.active_lot_total(account_id)?,
                transaction_total: unit.transaction_sum(account_id)?,
            })
        })
    }

    /// Audit every known account.
    pub fn audit_all(&self) -> LedgerResult<Vec<BalanceAudit>> {
        let audits = self
            .store
            .account_ids()?
            .iter()
            .map(|account_id| self.audit(account_id))
            .collect::<LedgerResult<Vec<_>>>()?;
        let drifted = audits.iter().filter(|a| !a.is_consistent()).count();
        if drifted > 0 {
            log::warn!("audit: {drifted} of {} accounts inconsistent", audits.len());
        } else {
            log::info!("audit: {} accounts consistent", audits.len());
        }
        Ok(audits)
    }

    /// Rewrite the cached balance from the transaction log. Returns the audit
    /// taken after the rewrite.
    ///
    /// Only the cache is rebuilt. When the lots themselves disagree with the
    /// log the drift is logged and left for manual reconciliation.
    pub fn repair(&self, account_id: &str) -> LedgerResult<BalanceAudit> {
        self.store.atomic(|unit| {
            let account = unit.require_account(account_id)?;
            let logged = unit.transaction_sum(account_id)?;
            if account.cached_balance != logged {
                log::warn!(
                    "repair: account={account_id} cached={} rebuilt={logged}",
                    account.cached_balance
                );
                unit.reset_cached_balance(&account, logged)?;
            }
            let active = unit.active_lot_total(account_id)?;
            if active != logged {
                log::error!(
                    "repair: account={account_id} active lots hold {active} but the log sums to {logged}"
                );
            }
            Ok(BalanceAudit {
                account_id: account_id.to_string(),
                cached_balance: logged,
                active_lot_total: active,
                transaction_total: logged,
            })
        })
    }

    pub fn breakdown(&self, account_id: &str) -> LedgerResult<BalanceBreakdown> {
        let mut breakdown = BalanceBreakdown::default();
        for (source, coins) in self.store.active_totals_by_source(account_id)? {
            match source {
                LotSource::Grant => breakdown.granted += coins,
                LotSource::Purchase => breakdown.purchased += coins,
                LotSource::Reward => breakdown.rewarded += coins,
            }
            breakdown.total += coins;
        }
        breakdown.next_expiry = self
            .store
            .next_expiring_lot(account_id)?
            .map(|lot| UpcomingExpiry {
                lot_id: lot.lot_id,
                amount: lot.amount_remaining,
                expires_at: lot.expires_at,
            });
        Ok(breakdown)
    }
}
