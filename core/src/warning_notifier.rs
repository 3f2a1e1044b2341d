//! Warning notifier.
//!
//! RULE: A lot is warned at most once. Setting the `warned` flag and queuing
//! the `expiry_warning` event happen in one atomic unit, so a crash can
//! neither lose the warning nor queue it twice.

use crate::{
    config::LedgerConfig,
    error::LedgerResult,
    event::LedgerEvent,
    job::{CheckpointedScan, JobReport, LedgerJob, LotOutcome, Schedule},
    retry::RetryPolicy,
    store::LedgerStore,
    types::LotId,
};
use chrono::{DateTime, Duration, Utc};

pub const JOB_NAME: &str = "warning_notifier";

pub struct WarningNotifier {
    store: LedgerStore,
    lookahead: Duration,
    batch_size: usize,
    max_batches: Option<usize>,
    retry: RetryPolicy,
}

impl WarningNotifier {
    pub fn new(store: LedgerStore, config: &LedgerConfig) -> Self {
        Self {
            store,
            lookahead: Duration::days(config.warning_lookahead_days),
            batch_size: config.batch_size,
            max_batches: config.max_batches_per_run,
            retry: RetryPolicy::from(&config.retry),
        }
    }

    pub fn with_max_batches(mut self, max_batches: Option<usize>) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Warn about every active, unwarned lot expiring in `(now, now + lookahead]`.
    pub fn notify(&self, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        let run_key = now.date_naive().to_string();
        let horizon = now + self.lookahead;
        let scan = CheckpointedScan {
            store: &self.store,
            job: JOB_NAME,
            batch_size: self.batch_size,
            max_batches: self.max_batches,
        };
        let report = scan.run(
            &run_key,
            now,
            |after, limit| self.store.warnable_lots(now, horizon, after, limit),
            |lot| {
                self.retry
                    .run("warn lot", |_| self.warn_lot(lot.lot_id, now, horizon))
            },
        )?;
        log::info!(
            "{JOB_NAME}: run={run_key} horizon={horizon} scanned={} warned={} skipped={} failed={}",
            report.scanned,
            report.applied,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    pub(crate) fn warn_lot(
        &self,
        lot_id: LotId,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
    ) -> LedgerResult<LotOutcome> {
        self.store.atomic(|unit| {
            let lot = unit.require_lot(lot_id)?;
            if !lot.is_active() || lot.warned || lot.expires_at <= now || lot.expires_at > horizon {
                return Ok(LotOutcome::Skipped);
            }
            if !unit.mark_warned(lot_id)? {
                return Ok(LotOutcome::Skipped);
            }
            let event_id = unit.enqueue_event(
                &LedgerEvent::ExpiryWarning {
                    account_id: lot.account_id.clone(),
                    lot_id,
                    amount_remaining: lot.amount_remaining,
                    expires_at: lot.expires_at,
                },
                now,
            )?;
            log::debug!(
                "{JOB_NAME}: lot={lot_id} account={} remaining={} expires_at={} event={event_id}",
                lot.account_id,
                lot.amount_remaining,
                lot.expires_at
            );
            Ok(LotOutcome::Applied(lot.amount_remaining))
        })
    }
}

impl LedgerJob for WarningNotifier {
    fn name(&self) -> &'static str {
        JOB_NAME
    }

    fn schedule(&self) -> Schedule {
        Schedule::Daily
    }

    fn run(&mut self, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        self.notify(now)
    }
}
