//! Scheduled job trait and the shared checkpointed scan.
//!
//! RULE: Every scheduled component implements LedgerJob.
//! The engine calls run() on each registered job whose schedule matches
//! the trigger, in registration order.
//! Execution order is fixed and documented in engine.rs.

use crate::{
    error::LedgerResult,
    store::{LedgerStore, Lot, ScanCursor},
    types::Coins,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Daily,
    Monthly,
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Daily => "daily",
            Schedule::Monthly => "monthly",
        }
    }
}

/// What one job invocation did. Persisted as JSON on the job_run row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    /// The invocation this report belongs to (trigger date or grant period).
    pub run_key: String,
    pub scanned: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Coins moved by the applied records.
    pub coins: Coins,
    /// False when the run stopped at its batch bound with work left.
    pub complete: bool,
}

impl JobReport {
    pub fn new(job: &str, run_key: &str) -> Self {
        Self {
            job: job.to_string(),
            run_key: run_key.to_string(),
            ..Self::default()
        }
    }
}

/// The contract every scheduled component fulfills.
pub trait LedgerJob: Send {
    /// Unique stable name; also the checkpoint key.
    fn name(&self) -> &'static str;

    fn schedule(&self) -> Schedule;

    /// Called by the engine when its schedule fires. Record-level failures
    /// are counted in the report; an `Err` means the job itself could not run.
    fn run(&mut self, now: DateTime<Utc>) -> LedgerResult<JobReport>;
}

/// Outcome of applying one scanned lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LotOutcome {
    /// State changed; carries the coins moved.
    Applied(Coins),
    /// Nothing left to do for this lot (already handled or no longer eligible).
    Skipped,
}

/// A resumable `(expires_at, lot_id)`-ordered scan over lots, checkpointed
/// after every page under `job`.
pub(crate) struct CheckpointedScan<'a> {
    pub store: &'a LedgerStore,
    pub job: &'static str,
    pub batch_size: usize,
    pub max_batches: Option<usize>,
}

impl CheckpointedScan<'_> {
    /// Walk every page `fetch` yields, calling `apply` on each lot.
    ///
    /// A checkpoint left by an interrupted run with the same `run_key` is
    /// resumed from; one from another run is discarded. The checkpoint is
    /// cleared once the scan runs dry.
    pub fn run<F, A>(&self, run_key: &str, now: DateTime<Utc>, mut fetch: F, mut apply: A) -> LedgerResult<JobReport>
    where
        F: FnMut(Option<&ScanCursor>, usize) -> LedgerResult<Vec<Lot>>,
        A: FnMut(&Lot) -> LedgerResult<LotOutcome>,
    {
        let mut report = JobReport::new(self.job, run_key);
        let mut cursor = match self.store.load_checkpoint(self.job)? {
            Some(cp) if cp.run_key == run_key => {
                log::info!(
                    "{}: resuming run {run_key} after lot {} ({})",
                    self.job,
                    cp.cursor.lot_id,
                    cp.cursor.expires_at
                );
                Some(cp.cursor)
            }
            Some(cp) => {
                log::info!("{}: discarding stale checkpoint from run {}", self.job, cp.run_key);
                None
            }
            None => None,
        };

        let batch_size = self.batch_size.max(1);
        let mut batches = 0;
        loop {
            if self.max_batches.is_some_and(|max| batches >= max) {
                log::info!(
                    "{}: batch bound reached after {batches} batches, {} lots scanned",
                    self.job,
                    report.scanned
                );
                return Ok(report);
            }

            let page = fetch(cursor.as_ref(), batch_size)?;
            let Some(last) = page.last() else {
                break;
            };
            batches += 1;

            for lot in &page {
                report.scanned += 1;
                match apply(lot) {
                    Ok(LotOutcome::Applied(coins)) => {
                        report.applied += 1;
                        report.coins += coins;
                    }
                    Ok(LotOutcome::Skipped) => report.skipped += 1,
                    Err(e) if e.is_record_fault() => {
                        log::warn!("{}: skipping lot {}: {e}", self.job, lot.lot_id);
                        report.failed += 1;
                    }
                    Err(e) => {
                        log::error!("{}: lot {} failed: {e}", self.job, lot.lot_id);
                        report.failed += 1;
                    }
                }
            }

            let next = ScanCursor {
                expires_at: last.expires_at,
                lot_id: last.lot_id,
            };
            self.store.save_checkpoint(self.job, run_key, &next, now)?;
            let exhausted = page.len() < batch_size;
            cursor = Some(next);
            if exhausted {
                break;
            }
        }

        self.store.clear_checkpoint(self.job)?;
        report.complete = true;
        Ok(report)
    }
}
