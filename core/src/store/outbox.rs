use super::{millis, optional_timestamp_at, timestamp_at, LedgerStore, LedgerUnit};
use crate::{
    error::LedgerResult,
    event::{LedgerEvent, OutboxEntry},
    types::LotId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

const OUTBOX_COLUMNS: &str =
    "outbox_id, event_id, event_type, payload, created_at, attempts, last_error, delivered_at";

fn outbox_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        outbox_id: row.get(0)?,
        event_id: row.get(1)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        created_at: timestamp_at(row, 4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        delivered_at: optional_timestamp_at(row, 7)?,
    })
}

impl LedgerStore {
    // ── Event outbox ───────────────────────────────────────────

    /// Undelivered events with `outbox_id > after`, oldest first.
    pub fn pending_events(&self, after: i64, limit: usize) -> LedgerResult<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM event_outbox
             WHERE delivered_at IS NULL AND outbox_id > ?1
             ORDER BY outbox_id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![after, limit as i64], outbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every event ever queued for a lot, oldest first.
    pub fn events_for_lot(&self, lot_id: LotId) -> LedgerResult<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM event_outbox
             WHERE lot_id = ?1 ORDER BY outbox_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![lot_id], outbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn event_count(&self, event_type: &str) -> LedgerResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM event_outbox WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn mark_event_delivered(&self, outbox_id: i64, at: DateTime<Utc>) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE event_outbox
             SET delivered_at = ?1, attempts = attempts + 1, last_error = NULL
             WHERE outbox_id = ?2 AND delivered_at IS NULL",
            params![millis(at), outbox_id],
        )?;
        Ok(())
    }

    pub fn record_delivery_failure(&self, outbox_id: i64, error: &str) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE event_outbox SET attempts = attempts + 1, last_error = ?1
             WHERE outbox_id = ?2",
            params![error, outbox_id],
        )?;
        Ok(())
    }
}

impl LedgerUnit<'_> {
    /// Queue an event in this atomic unit. Returns its event id.
    pub fn enqueue_event(&self, event: &LedgerEvent, at: DateTime<Utc>) -> LedgerResult<String> {
        let event_id = Uuid::new_v4().to_string();
        self.tx.execute(
            "INSERT INTO event_outbox (event_id, account_id, lot_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event_id,
                event.account_id(),
                event.lot_id(),
                event.type_name(),
                serde_json::to_string(event)?,
                millis(at),
            ],
        )?;
        Ok(event_id)
    }
}
