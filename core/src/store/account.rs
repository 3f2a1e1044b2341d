use super::{millis, timestamp_at, Account, LedgerStore, LedgerUnit};
use crate::{
    error::{LedgerError, LedgerResult},
    retry::conflict,
    tier::{GrantPeriod, SubscriptionTier},
    types::{AccountId, Coins},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const ACCOUNT_COLUMNS: &str =
    "account_id, tier, cached_balance, version, next_grant_period, created_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        account_id: row.get(0)?,
        tier: row.get(1)?,
        cached_balance: row.get(2)?,
        version: row.get(3)?,
        next_grant_period: row.get(4)?,
        created_at: timestamp_at(row, 5)?,
    })
}

fn query_account(conn: &Connection, account_id: &str) -> LedgerResult<Option<Account>> {
    let account = conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM account WHERE account_id = ?1"),
            params![account_id],
            account_from_row,
        )
        .optional()?;
    Ok(account)
}

impl LedgerStore {
    // ── Account ───────────────────────────────────────────────────

    pub fn account(&self, account_id: &str) -> LedgerResult<Option<Account>> {
        query_account(&self.conn, account_id)
    }

    /// Single-row primary-key read of the cached balance.
    pub fn cached_balance(&self, account_id: &str) -> LedgerResult<Option<Coins>> {
        let balance = self
            .conn
            .query_row(
                "SELECT cached_balance FROM account WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }

    pub fn account_ids(&self) -> LedgerResult<Vec<AccountId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT account_id FROM account ORDER BY account_id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn account_count(&self) -> LedgerResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM account", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn total_cached_balance(&self) -> LedgerResult<Coins> {
        let total = self.conn.query_row(
            "SELECT COALESCE(SUM(cached_balance), 0) FROM account",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

impl LedgerUnit<'_> {
    pub fn account(&self, account_id: &str) -> LedgerResult<Option<Account>> {
        query_account(&self.tx, account_id)
    }

    pub fn require_account(&self, account_id: &str) -> LedgerResult<Account> {
        self.account(account_id)?
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    /// Create the account on its first coin-affecting event.
    pub fn ensure_account(&self, account_id: &str, at: DateTime<Utc>) -> LedgerResult<Account> {
        self.tx.execute(
            "INSERT OR IGNORE INTO account (account_id, created_at) VALUES (?1, ?2)",
            params![account_id, millis(at)],
        )?;
        self.require_account(account_id)
    }

    /// Apply `delta` to the cached balance, guarded by the version read into
    /// `account`. Returns the new balance, which must stay within `0..=i64::MAX`.
    pub fn apply_balance_delta(&self, account: &Account, delta: Coins) -> LedgerResult<Coins> {
        let balance = account
            .cached_balance
            .checked_add(delta)
            .filter(|balance| *balance >= 0)
            .ok_or_else(|| LedgerError::BalanceOutOfRange {
                account_id: account.account_id.clone(),
                balance: account.cached_balance,
                delta,
            })?;
        let updated = self.tx.execute(
            "UPDATE account
             SET cached_balance = ?1, version = version + 1
             WHERE account_id = ?2 AND version = ?3",
            params![balance, account.account_id, account.version],
        )?;
        if updated == 0 {
            return Err(conflict("account", &account.account_id));
        }
        Ok(balance)
    }

    /// Overwrite the cached balance. Only the repair path uses this.
    pub fn reset_cached_balance(&self, account: &Account, balance: Coins) -> LedgerResult<()> {
        let updated = self.tx.execute(
            "UPDATE account
             SET cached_balance = ?1, version = version + 1
             WHERE account_id = ?2 AND version = ?3",
            params![balance, account.account_id, account.version],
        )?;
        if updated == 0 {
            return Err(conflict("account", &account.account_id));
        }
        Ok(())
    }

    pub fn set_tier(&self, account_id: &str, tier: SubscriptionTier) -> LedgerResult<()> {
        self.tx.execute(
            "UPDATE account SET tier = ?1 WHERE account_id = ?2",
            params![tier, account_id],
        )?;
        Ok(())
    }

    /// Move the grant cursor forward to `next`. Never moves it backwards.
    /// Returns false when the cursor was already at or past `next`.
    pub fn advance_grant_period(&self, account_id: &str, next: GrantPeriod) -> LedgerResult<bool> {
        let updated = self.tx.execute(
            "UPDATE account SET next_grant_period = ?1
             WHERE account_id = ?2
               AND (next_grant_period IS NULL OR next_grant_period < ?1)",
            params![next, account_id],
        )?;
        Ok(updated > 0)
    }
}
