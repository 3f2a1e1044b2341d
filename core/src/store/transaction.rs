use super::{millis, timestamp_at, LedgerStore, LedgerTransaction, LedgerUnit};
use crate::{
    error::LedgerResult,
    types::{Coins, LotId, TransactionId, TransactionKind},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

const TRANSACTION_COLUMNS: &str =
    "txn_id, account_id, lot_id, kind, amount, balance_after, memo, idempotency_key, created_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerTransaction> {
    Ok(LedgerTransaction {
        txn_id: row.get(0)?,
        account_id: row.get(1)?,
        lot_id: row.get(2)?,
        kind: row.get(3)?,
        amount: row.get(4)?,
        balance_after: row.get(5)?,
        memo: row.get(6)?,
        idempotency_key: row.get(7)?,
        created_at: timestamp_at(row, 8)?,
    })
}

fn query_transaction_sum(conn: &Connection, account_id: &str) -> LedgerResult<Coins> {
    let total = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_transaction WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Fields of an audit row; the store assigns `txn_id`.
#[derive(Debug, Clone)]
pub(crate) struct TransactionEntry<'a> {
    pub account_id: &'a str,
    pub lot_id: Option<LotId>,
    pub kind: TransactionKind,
    pub amount: Coins,
    pub balance_after: Coins,
    pub memo: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

impl LedgerStore {
    // ── Transaction log ─────────────────────────────────────────

    /// Full audit history for an account, oldest first.
    pub fn transactions_for(&self, account_id: &str) -> LedgerResult<Vec<LedgerTransaction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transaction
             WHERE account_id = ?1 ORDER BY txn_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![account_id], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Σ amount over the account's log. Always equals the cached balance.
    pub fn transaction_sum(&self, account_id: &str) -> LedgerResult<Coins> {
        query_transaction_sum(&self.conn, account_id)
    }

    pub fn transaction_count(&self) -> LedgerResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_transaction", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Row count and Σ amount per transaction kind, across all accounts.
    pub fn transaction_totals_by_kind(&self) -> LedgerResult<Vec<(TransactionKind, i64, Coins)>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, COUNT(*), COALESCE(SUM(amount), 0)
             FROM ledger_transaction GROUP BY kind ORDER BY kind ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl LedgerUnit<'_> {
    pub(crate) fn append_transaction(&self, entry: &TransactionEntry<'_>) -> LedgerResult<TransactionId> {
        self.tx.execute(
            "INSERT INTO ledger_transaction
             (account_id, lot_id, kind, amount, balance_after, memo, idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.account_id,
                entry.lot_id,
                entry.kind,
                entry.amount,
                entry.balance_after,
                entry.memo,
                entry.idempotency_key,
                millis(entry.created_at),
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn transaction_sum(&self, account_id: &str) -> LedgerResult<Coins> {
        query_transaction_sum(&self.tx, account_id)
    }
}
