use super::{
    is_unique_violation, millis, timestamp_at, transaction::TransactionEntry, CreateLotOutcome,
    LedgerStore, LedgerUnit, Lot, NewLot, ScanCursor,
};
use crate::{
    error::{LedgerError, LedgerResult},
    retry::conflict,
    types::{Coins, LotId, LotSource, LotStatus},
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const LOT_COLUMNS: &str = "lot_id, account_id, amount_original, amount_remaining, source, \
     acquired_at, expires_at, status, warned, idempotency_key";

fn lot_from_row(row: &Row<'_>) -> rusqlite::Result<Lot> {
    Ok(Lot {
        lot_id: row.get(0)?,
        account_id: row.get(1)?,
        amount_original: row.get(2)?,
        amount_remaining: row.get(3)?,
        source: row.get(4)?,
        acquired_at: timestamp_at(row, 5)?,
        expires_at: timestamp_at(row, 6)?,
        status: row.get(7)?,
        warned: row.get::<_, i32>(8)? != 0,
        idempotency_key: row.get(9)?,
    })
}

fn query_lot(conn: &Connection, lot_id: LotId) -> LedgerResult<Option<Lot>> {
    let lot = conn
        .query_row(
            &format!("SELECT {LOT_COLUMNS} FROM lot WHERE lot_id = ?1"),
            params![lot_id],
            lot_from_row,
        )
        .optional()?;
    Ok(lot)
}

fn query_lot_by_key(conn: &Connection, account_id: &str, key: &str) -> LedgerResult<Option<Lot>> {
    let lot = conn
        .query_row(
            &format!("SELECT {LOT_COLUMNS} FROM lot WHERE account_id = ?1 AND idempotency_key = ?2"),
            params![account_id, key],
            lot_from_row,
        )
        .optional()?;
    Ok(lot)
}

fn query_purchase_by_key(conn: &Connection, key: &str) -> LedgerResult<Option<Lot>> {
    let lot = conn
        .query_row(
            &format!("SELECT {LOT_COLUMNS} FROM lot WHERE source = 'purchase' AND idempotency_key = ?1"),
            params![key],
            lot_from_row,
        )
        .optional()?;
    Ok(lot)
}

/// FIFO order: oldest acquisition first, lot id breaks ties.
fn query_active_lots(conn: &Connection, account_id: &str) -> LedgerResult<Vec<Lot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOT_COLUMNS} FROM lot
         WHERE account_id = ?1 AND status = 'active'
         ORDER BY acquired_at ASC, lot_id ASC"
    ))?;
    let lots = stmt
        .query_map(params![account_id], lot_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lots)
}

fn query_active_lot_total(conn: &Connection, account_id: &str) -> LedgerResult<Coins> {
    let total = conn.query_row(
        "SELECT COALESCE(SUM(amount_remaining), 0) FROM lot
         WHERE account_id = ?1 AND status = 'active'",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// `(expires_at, lot_id)` strictly after the cursor; from the start without one.
fn cursor_bounds(after: Option<&ScanCursor>) -> (i64, LotId) {
    match after {
        Some(cursor) => (millis(cursor.expires_at), cursor.lot_id),
        None => (i64::MIN, LotId::MIN),
    }
}

impl LedgerStore {
    // ── Lot store ─────────────────────────────────────────────────

    /// Record a new acquisition: lot, credit transaction, and balance bump in
    /// one atomic unit. A key already used on this account returns the lot
    /// recorded under it and writes nothing. A purchase key credited to a
    /// different account is refused with `ReceiptClaimed`.
    pub fn create_lot(
        &self,
        new: &NewLot,
        acquired_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> LedgerResult<CreateLotOutcome> {
        if new.amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount: new.amount });
        }
        if new.source.requires_idempotency_key() && new.idempotency_key.is_none() {
            return Err(LedgerError::MissingIdempotencyKey {
                lot_source: new.source,
            });
        }

        let result = self.atomic(|unit| {
            let account = unit.ensure_account(&new.account_id, acquired_at)?;
            let lot = unit.insert_lot(new, acquired_at, acquired_at + lifetime)?;
            let balance_after = unit.apply_balance_delta(&account, new.amount)?;
            unit.append_transaction(&TransactionEntry {
                account_id: &new.account_id,
                lot_id: Some(lot.lot_id),
                kind: new.source.credit_kind(),
                amount: new.amount,
                balance_after,
                memo: new.memo.as_deref(),
                idempotency_key: new.idempotency_key.as_deref(),
                created_at: acquired_at,
            })?;
            Ok(lot)
        });

        match result {
            Ok(lot) => {
                log::debug!(
                    "lot created: account={} lot={} amount={} source={}",
                    lot.account_id,
                    lot.lot_id,
                    lot.amount_original,
                    lot.source
                );
                Ok(CreateLotOutcome::Created(lot))
            }
            Err(LedgerError::DuplicateIdempotencyKey { account_id, key }) => {
                let Some(existing) = self.lot_by_key(&account_id, &key)? else {
                    return match self.purchase_by_key(&key)? {
                        Some(owner) => {
                            log::warn!(
                                "purchase key replayed on another account: key={key} account={account_id} owner={}",
                                owner.account_id
                            );
                            Err(LedgerError::ReceiptClaimed {
                                account_id: owner.account_id,
                                key,
                            })
                        }
                        None => Err(anyhow::anyhow!(
                            "lot for idempotency key '{key}' vanished after conflict"
                        )
                        .into()),
                    };
                };
                if existing.amount_original != new.amount || existing.source != new.source {
                    log::warn!(
                        "idempotency key reused with different terms: account={account_id} key={key} \
                         existing=({}, {}) requested=({}, {})",
                        existing.amount_original,
                        existing.source,
                        new.amount,
                        new.source
                    );
                } else {
                    log::debug!("duplicate idempotency key: account={account_id} key={key} lot={}", existing.lot_id);
                }
                Ok(CreateLotOutcome::Existing(existing))
            }
            Err(e) => Err(e),
        }
    }

    pub fn lot(&self, lot_id: LotId) -> LedgerResult<Option<Lot>> {
        query_lot(&self.conn, lot_id)
    }

    pub fn lot_by_key(&self, account_id: &str, key: &str) -> LedgerResult<Option<Lot>> {
        query_lot_by_key(&self.conn, account_id, key)
    }

    /// The purchase lot credited under `key`, on any account.
    pub fn purchase_by_key(&self, key: &str) -> LedgerResult<Option<Lot>> {
        query_purchase_by_key(&self.conn, key)
    }

    /// Active lots in FIFO spend order.
    pub fn active_lots(&self, account_id: &str) -> LedgerResult<Vec<Lot>> {
        query_active_lots(&self.conn, account_id)
    }

    /// Every lot the account ever held, in acquisition order.
    pub fn lots_for(&self, account_id: &str) -> LedgerResult<Vec<Lot>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOT_COLUMNS} FROM lot WHERE account_id = ?1
             ORDER BY acquired_at ASC, lot_id ASC"
        ))?;
        let lots = stmt
            .query_map(params![account_id], lot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lots)
    }

    pub fn active_lot_total(&self, account_id: &str) -> LedgerResult<Coins> {
        query_active_lot_total(&self.conn, account_id)
    }

    /// Remaining coins per source over active lots.
    pub fn active_totals_by_source(&self, account_id: &str) -> LedgerResult<Vec<(LotSource, Coins)>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, SUM(amount_remaining) FROM lot
             WHERE account_id = ?1 AND status = 'active'
             GROUP BY source ORDER BY source ASC",
        )?;
        let rows = stmt
            .query_map(params![account_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The active lot that expires soonest.
    pub fn next_expiring_lot(&self, account_id: &str) -> LedgerResult<Option<Lot>> {
        let lot = self
            .conn
            .query_row(
                &format!(
                    "SELECT {LOT_COLUMNS} FROM lot
                     WHERE account_id = ?1 AND status = 'active'
                     ORDER BY expires_at ASC, lot_id ASC LIMIT 1"
                ),
                params![account_id],
                lot_from_row,
            )
            .optional()?;
        Ok(lot)
    }

    /// One page of active lots with `expires_at <= now`, ordered by
    /// `(expires_at, lot_id)` and strictly after `after`.
    pub fn expirable_lots(
        &self,
        now: DateTime<Utc>,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<Lot>> {
        let (after_ts, after_id) = cursor_bounds(after);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOT_COLUMNS} FROM lot
             WHERE status = 'active' AND expires_at <= ?1
               AND (expires_at > ?2 OR (expires_at = ?2 AND lot_id > ?3))
             ORDER BY expires_at ASC, lot_id ASC
             LIMIT ?4"
        ))?;
        let lots = stmt
            .query_map(
                params![millis(now), after_ts, after_id, limit as i64],
                lot_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lots)
    }

    /// One page of active, not-yet-warned lots expiring in `(now, horizon]`.
    pub fn warnable_lots(
        &self,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        after: Option<&ScanCursor>,
        limit: usize,
    ) -> LedgerResult<Vec<Lot>> {
        let (after_ts, after_id) = cursor_bounds(after);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOT_COLUMNS} FROM lot
             WHERE status = 'active' AND warned = 0
               AND expires_at > ?1 AND expires_at <= ?2
               AND (expires_at > ?3 OR (expires_at = ?3 AND lot_id > ?4))
             ORDER BY expires_at ASC, lot_id ASC
             LIMIT ?5"
        ))?;
        let lots = stmt
            .query_map(
                params![millis(now), millis(horizon), after_ts, after_id, limit as i64],
                lot_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lots)
    }

    /// Lot count and remaining coins per status, across all accounts.
    pub fn lot_status_counts(&self) -> LedgerResult<Vec<(LotStatus, i64, Coins)>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(amount_remaining), 0)
             FROM lot GROUP BY status ORDER BY status ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl LedgerUnit<'_> {
    pub fn lot(&self, lot_id: LotId) -> LedgerResult<Option<Lot>> {
        query_lot(&self.tx, lot_id)
    }

    pub fn require_lot(&self, lot_id: LotId) -> LedgerResult<Lot> {
        self.lot(lot_id)?.ok_or(LedgerError::LotNotFound { lot_id })
    }

    pub fn active_lots(&self, account_id: &str) -> LedgerResult<Vec<Lot>> {
        query_active_lots(&self.tx, account_id)
    }

    pub fn active_lot_total(&self, account_id: &str) -> LedgerResult<Coins> {
        query_active_lot_total(&self.tx, account_id)
    }

    pub(crate) fn insert_lot(
        &self,
        new: &NewLot,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> LedgerResult<Lot> {
        let inserted = self.tx.execute(
            "INSERT INTO lot
             (account_id, amount_original, amount_remaining, source,
              acquired_at, expires_at, status, warned, idempotency_key)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, 'active', 0, ?6)",
            params![
                new.account_id,
                new.amount,
                new.source,
                millis(acquired_at),
                millis(expires_at),
                new.idempotency_key,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(LedgerError::DuplicateIdempotencyKey {
                    account_id: new.account_id.clone(),
                    key: new.idempotency_key.clone().unwrap_or_default(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        let lot_id = self.tx.last_insert_rowid();
        self.require_lot(lot_id)
    }

    /// Debit `amount` from an active lot, compare-and-set on the remaining
    /// amount read into `lot`. Returns the lot's resulting status.
    pub fn debit_lot(&self, lot: &Lot, amount: Coins) -> LedgerResult<LotStatus> {
        if amount <= 0 || amount > lot.amount_remaining {
            return Err(LedgerError::InvalidAmount { amount });
        }
        let remaining = lot.amount_remaining - amount;
        let status = if remaining == 0 {
            LotStatus::Exhausted
        } else {
            LotStatus::Active
        };
        let updated = self.tx.execute(
            "UPDATE lot SET amount_remaining = ?1, status = ?2
             WHERE lot_id = ?3 AND status = 'active' AND amount_remaining = ?4",
            params![remaining, status, lot.lot_id, lot.amount_remaining],
        )?;
        if updated == 0 {
            return Err(conflict("lot", lot.lot_id));
        }
        Ok(status)
    }

    /// Transition an active lot to expired and zero it, compare-and-set on
    /// the state read into `lot`.
    pub fn expire_lot(&self, lot: &Lot) -> LedgerResult<()> {
        let updated = self.tx.execute(
            "UPDATE lot SET amount_remaining = 0, status = 'expired'
             WHERE lot_id = ?1 AND status = 'active' AND amount_remaining = ?2",
            params![lot.lot_id, lot.amount_remaining],
        )?;
        if updated == 0 {
            return Err(conflict("lot", lot.lot_id));
        }
        Ok(())
    }

    /// Set the warned flag. Returns false when the lot was already warned or
    /// is no longer active.
    pub fn mark_warned(&self, lot_id: LotId) -> LedgerResult<bool> {
        let updated = self.tx.execute(
            "UPDATE lot SET warned = 1 WHERE lot_id = ?1 AND status = 'active' AND warned = 0",
            params![lot_id],
        )?;
        Ok(updated > 0)
    }
}
