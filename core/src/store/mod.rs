//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call store methods and [`LedgerUnit`] methods; they never
//! execute SQL directly.
//!
//! Every balance-affecting write happens inside [`LedgerStore::atomic`], a
//! `BEGIN IMMEDIATE` transaction: lot change, audit row, cached balance and any
//! outbox event commit together or not at all.

use crate::{
    error::LedgerResult,
    tier::{GrantPeriod, SubscriptionTier},
    types::{AccountId, Coins, LotId, LotSource, LotStatus, TransactionId, TransactionKind},
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod account;
mod job;
mod lot;
mod outbox;
mod transaction;

pub use job::{JobCheckpoint, JobRunRow, ScanCursor};
pub(crate) use transaction::TransactionEntry;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for a private :memory: database
}

impl LedgerStore {
    /// Open (or create) the ledger database at `path`. Accepts SQLite URIs.
    pub fn open(path: &str) -> LedgerResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open a private in-memory database. `reopen` on it yields a fresh,
    /// unrelated database; use `open_shared_memory` when several components
    /// need to see the same data.
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open a named in-memory database shared by every connection in this
    /// process that uses the same name. It lives as long as one connection does.
    pub fn open_shared_memory(name: &str) -> LedgerResult<Self> {
        Self::open(&format!("file:{name}?mode=memory&cache=shared"))
    }

    /// Open another connection to the same database.
    pub fn reopen(&self) -> LedgerResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_ledger.sql"))?;
        Ok(())
    }

    /// Run `f` as one atomic unit. An `Err` from `f` rolls everything back.
    pub fn atomic<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&LedgerUnit<'_>) -> LedgerResult<T>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let unit = LedgerUnit { tx };
        let value = f(&unit)?;
        unit.tx.commit()?;
        Ok(value)
    }
}

impl LedgerStore {
    /// Run `f` in a deferred transaction: one consistent snapshot for several
    /// reads, without taking the write lock. `f` must only read.
    pub fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&LedgerUnit<'_>) -> LedgerResult<T>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Deferred)?;
        let unit = LedgerUnit { tx };
        let value = f(&unit)?;
        unit.tx.commit()?;
        Ok(value)
    }
}

/// Write access inside one atomic unit. Dropping it without commit rolls back.
pub struct LedgerUnit<'conn> {
    tx: Transaction<'conn>,
}

// ── Records ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub tier: SubscriptionTier,
    pub cached_balance: Coins,
    /// Bumped on every balance change; the optimistic-concurrency token.
    pub version: i64,
    /// First period the grant scheduler still owes this account.
    pub next_grant_period: Option<GrantPeriod>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub lot_id: LotId,
    pub account_id: AccountId,
    pub amount_original: Coins,
    pub amount_remaining: Coins,
    pub source: LotSource,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: LotStatus,
    pub warned: bool,
    pub idempotency_key: Option<String>,
}

impl Lot {
    pub fn is_active(&self) -> bool {
        self.status == LotStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub txn_id: TransactionId,
    pub account_id: AccountId,
    pub lot_id: Option<LotId>,
    pub kind: TransactionKind,
    /// Signed: credits positive, spends and expiries negative.
    pub amount: Coins,
    pub balance_after: Coins,
    pub memo: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A request to record a new acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLot {
    pub account_id: AccountId,
    pub amount: Coins,
    pub source: LotSource,
    pub idempotency_key: Option<String>,
    pub memo: Option<String>,
}

impl NewLot {
    pub fn new(account_id: &str, amount: Coins, source: LotSource) -> Self {
        Self {
            account_id: account_id.to_string(),
            amount,
            source,
            idempotency_key: None,
            memo: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// Result of `create_lot`. A duplicate idempotency key is not a failure: the
/// lot recorded under that key comes back as `Existing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateLotOutcome {
    Created(Lot),
    Existing(Lot),
}

impl CreateLotOutcome {
    pub fn lot(&self) -> &Lot {
        match self {
            Self::Created(lot) | Self::Existing(lot) => lot,
        }
    }

    pub fn into_lot(self) -> Lot {
        match self {
            Self::Created(lot) | Self::Existing(lot) => lot,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// One lot touched by a spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotDebit {
    pub lot_id: LotId,
    pub amount: Coins,
}

// ── Column helpers ─────────────────────────────────────────────

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

pub(crate) fn optional_timestamp_at(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => timestamp_at(row, idx).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
