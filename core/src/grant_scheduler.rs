//! Grant scheduler: the monthly tier allowance.
//!
//! RULE: A grant is created through the lot store with the period-scoped
//! key `grant:{account}:{YYYY-MM}`. Running the same period twice therefore
//! yields one lot and one transaction per account, whatever crashed in
//! between.
//!
//! The account's `next_grant_period` cursor is advanced only after the lot
//! is durably created, in its own atomic unit. A crash between the two
//! leaves the cursor behind; the rerun collides on the key and moves it.

use crate::{
    config::LedgerConfig,
    error::LedgerResult,
    job::{JobReport, LedgerJob, Schedule},
    retry::RetryPolicy,
    store::{LedgerStore, NewLot},
    tier::{GrantPeriod, GrantSchedule, Subscriber, SubscriptionDirectory},
    types::{Coins, LotSource},
};
use chrono::{DateTime, Duration, Utc};

pub const JOB_NAME: &str = "grant_scheduler";

/// What happened to one subscriber in a period run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted(Coins),
    /// The period's key was already used; nothing written.
    AlreadyGranted,
    /// The account's cursor is past this period.
    CursorAhead,
    /// The tier carries no allowance.
    NoAllowance,
}

pub struct GrantScheduler {
    store: LedgerStore,
    directory: Box<dyn SubscriptionDirectory>,
    schedule: GrantSchedule,
    lifetime: Duration,
    retry: RetryPolicy,
}

impl GrantScheduler {
    pub fn new(store: LedgerStore, directory: Box<dyn SubscriptionDirectory>, config: &LedgerConfig) -> Self {
        Self {
            store,
            directory,
            schedule: config.grant_schedule,
            lifetime: Duration::days(config.lot_lifetime_days),
            retry: RetryPolicy::from(&config.retry),
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Grant every subscriber its allowance for `period`. One account's
    /// failure is logged and counted; the run carries on.
    pub fn run_period(&mut self, period: GrantPeriod, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        let mut report = JobReport::new(JOB_NAME, &period.to_string());
        let subscribers = self.directory.subscribers(period)?;
        log::info!("{JOB_NAME}: period={period} subscribers={}", subscribers.len());

        for subscriber in &subscribers {
            report.scanned += 1;
            match self.grant_account(subscriber, period, now) {
                Ok(GrantOutcome::Granted(coins)) => {
                    report.applied += 1;
                    report.coins += coins;
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    log::error!(
                        "{JOB_NAME}: period={period} account={} failed: {e}",
                        subscriber.account_id
                    );
                    report.failed += 1;
                }
            }
        }

        report.complete = true;
        log::info!(
            "{JOB_NAME}: period={period} granted={} skipped={} failed={} coins={}",
            report.applied,
            report.skipped,
            report.failed,
            report.coins
        );
        Ok(report)
    }

    pub fn grant_account(
        &self,
        subscriber: &Subscriber,
        period: GrantPeriod,
        now: DateTime<Utc>,
    ) -> LedgerResult<GrantOutcome> {
        let account_id = subscriber.account_id.as_str();
        let cursor = self
            .store
            .account(account_id)?
            .and_then(|account| account.next_grant_period);
        if cursor.is_some_and(|next| next > period) {
            log::debug!("{JOB_NAME}: account={account_id} cursor past {period}");
            return Ok(GrantOutcome::CursorAhead);
        }

        let amount = self.schedule.monthly_amount(subscriber.tier);
        if amount <= 0 {
            return Ok(GrantOutcome::NoAllowance);
        }

        let new = NewLot::new(account_id, amount, LotSource::Grant)
            .with_key(period.grant_key(account_id))
            .with_memo(format!("{} allowance {period}", subscriber.tier));
        let outcome = self
            .retry
            .run("grant", |_| self.store.create_lot(&new, now, self.lifetime))?;

        self.retry.run("grant cursor", |_| {
            self.store.atomic(|unit| {
                unit.set_tier(account_id, subscriber.tier)?;
                unit.advance_grant_period(account_id, period.next())
            })
        })?;

        if outcome.is_new() {
            Ok(GrantOutcome::Granted(amount))
        } else {
            Ok(GrantOutcome::AlreadyGranted)
        }
    }
}

impl LedgerJob for GrantScheduler {
    fn name(&self) -> &'static str {
        JOB_NAME
    }

    fn schedule(&self) -> Schedule {
        Schedule::Monthly
    }

    fn run(&mut self, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        self.run_period(GrantPeriod::containing(now), now)
    }
}
