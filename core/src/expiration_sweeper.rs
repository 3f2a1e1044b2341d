//! Expiration sweeper.
//!
//! RULE: Each lot expires in its own atomic unit: status flip, expire row,
//! cached balance and the `coins_expired` outbox event commit together.
//! A lot that a concurrent spend exhausted between scan and expiry is
//! re-read inside the unit and skipped.
//!
//! The scan walks active lots past their expiry in `(expires_at, lot_id)`
//! order, in pages of `batch_size`, checkpointing after every page so an
//! interrupted run resumes where it stopped.

use crate::{
    config::LedgerConfig,
    error::LedgerResult,
    event::LedgerEvent,
    job::{CheckpointedScan, JobReport, LedgerJob, LotOutcome, Schedule},
    retry::RetryPolicy,
    store::{LedgerStore, TransactionEntry},
    types::{LotId, TransactionKind},
};
use chrono::{DateTime, Utc};

pub const JOB_NAME: &str = "expiration_sweeper";

pub struct ExpirationSweeper {
    store: LedgerStore,
    batch_size: usize,
    max_batches: Option<usize>,
    retry: RetryPolicy,
}

impl ExpirationSweeper {
    pub fn new(store: LedgerStore, config: &LedgerConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size,
            max_batches: config.max_batches_per_run,
            retry: RetryPolicy::from(&config.retry),
        }
    }

    /// Bound the number of pages one invocation may process.
    pub fn with_max_batches(mut self, max_batches: Option<usize>) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Expire every active lot with `expires_at <= now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        let run_key = now.date_naive().to_string();
        let scan = CheckpointedScan {
            store: &self.store,
            job: JOB_NAME,
            batch_size: self.batch_size,
            max_batches: self.max_batches,
        };
        let report = scan.run(
            &run_key,
            now,
            |after, limit| self.store.expirable_lots(now, after, limit),
            |lot| self.retry.run("expire lot", |_| self.expire_lot(lot.lot_id, now)),
        )?;
        log::info!(
            "{JOB_NAME}: run={run_key} scanned={} expired={} skipped={} failed={} coins={} complete={}",
            report.scanned,
            report.applied,
            report.skipped,
            report.failed,
            report.coins,
            report.complete
        );
        Ok(report)
    }

    /// Expire one lot if it is still active and due.
    pub(crate) fn expire_lot(&self, lot_id: LotId, now: DateTime<Utc>) -> LedgerResult<LotOutcome> {
        self.store.atomic(|unit| {
            let lot = unit.require_lot(lot_id)?;
            if !lot.is_active() || lot.expires_at > now {
                return Ok(LotOutcome::Skipped);
            }
            let account = unit.require_account(&lot.account_id)?;
            let amount = lot.amount_remaining;

            unit.expire_lot(&lot)?;
            let balance_after = unit.apply_balance_delta(&account, -amount)?;
            unit.append_transaction(&TransactionEntry {
                account_id: &lot.account_id,
                lot_id: Some(lot.lot_id),
                kind: TransactionKind::Expire,
                amount: -amount,
                balance_after,
                memo: None,
                idempotency_key: None,
                created_at: now,
            })?;
            unit.enqueue_event(
                &LedgerEvent::CoinsExpired {
                    account_id: lot.account_id.clone(),
                    lot_id: lot.lot_id,
                    amount_expired: amount,
                    expired_at: now,
                },
                now,
            )?;
            log::debug!(
                "{JOB_NAME}: lot={} account={} expired={amount}",
                lot.lot_id,
                lot.account_id
            );
            Ok(LotOutcome::Applied(amount))
        })
    }
}

impl LedgerJob for ExpirationSweeper {
    fn name(&self) -> &'static str {
        JOB_NAME
    }

    fn schedule(&self) -> Schedule {
        Schedule::Daily
    }

    fn run(&mut self, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        self.sweep(now)
    }
}
