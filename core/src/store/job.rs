use super::{millis, timestamp_at, LedgerStore};
use crate::{error::LedgerResult, types::LotId};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Position in an `(expires_at, lot_id)`-ordered scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub expires_at: DateTime<Utc>,
    pub lot_id: LotId,
}

/// A batch job's resume point. `run_key` names the invocation it belongs to
/// (the trigger date); a checkpoint from another run is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCheckpoint {
    pub job: String,
    pub run_key: String,
    pub cursor: ScanCursor,
    pub updated_at: DateTime<Utc>,
}

/// One recorded trigger invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunRow {
    pub run_id: String,
    pub job: String,
    pub schedule: String,
    pub triggered_at: DateTime<Utc>,
    pub status: String, // "completed" | "partial" | "failed"
    pub report: Option<String>,
}

impl LedgerStore {
    // ── Checkpoints ────────────────────────────────────────────

    pub fn load_checkpoint(&self, job: &str) -> LedgerResult<Option<JobCheckpoint>> {
        let checkpoint = self
            .conn
            .query_row(
                "SELECT job, run_key, cursor_ts, cursor_id, updated_at
                 FROM job_checkpoint WHERE job = ?1",
                params![job],
                |row| {
                    Ok(JobCheckpoint {
                        job: row.get(0)?,
                        run_key: row.get(1)?,
                        cursor: ScanCursor {
                            expires_at: timestamp_at(row, 2)?,
                            lot_id: row.get(3)?,
                        },
                        updated_at: timestamp_at(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    pub fn save_checkpoint(
        &self,
        job: &str,
        run_key: &str,
        cursor: &ScanCursor,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO job_checkpoint (job, run_key, cursor_ts, cursor_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(job) DO UPDATE SET
                run_key = excluded.run_key,
                cursor_ts = excluded.cursor_ts,
                cursor_id = excluded.cursor_id,
                updated_at = excluded.updated_at",
            params![job, run_key, millis(cursor.expires_at), cursor.lot_id, millis(at)],
        )?;
        Ok(())
    }

    pub fn clear_checkpoint(&self, job: &str) -> LedgerResult<()> {
        self.conn
            .execute("DELETE FROM job_checkpoint WHERE job = ?1", params![job])?;
        Ok(())
    }

    // ── Job runs ───────────────────────────────────────────────

    pub fn insert_job_run(&self, run: &JobRunRow) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO job_run (run_id, job, schedule, triggered_at, status, report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id,
                run.job,
                run.schedule,
                millis(run.triggered_at),
                run.status,
                run.report,
            ],
        )?;
        Ok(())
    }

    pub fn job_runs(&self, job: &str) -> LedgerResult<Vec<JobRunRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, job, schedule, triggered_at, status, report
             FROM job_run WHERE job = ?1
             ORDER BY triggered_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![job], |row| {
                Ok(JobRunRow {
                    run_id: row.get(0)?,
                    job: row.get(1)?,
                    schedule: row.get(2)?,
                    triggered_at: timestamp_at(row, 3)?,
                    status: row.get(4)?,
                    report: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
