//! The ledger engine: scheduled trigger handling.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   Monthly trigger:
//!     1. Grant scheduler
//!   Daily trigger:
//!     2. Expiration sweeper
//!     3. Warning notifier   (after the sweep, so nothing it warns is already due)
//!     4. Outbox dispatch    (last, so the day's events go out the same run)
//!
//! RULES:
//!   - Jobs execute in registration order, filtered by schedule.
//!   - Jobs never call each other; they share state only through the store.
//!   - Every invocation is recorded in job_run with its report.
//!   - Wall-clock scheduling lives outside; callers fire triggers.

use crate::{
    config::LedgerConfig,
    error::LedgerResult,
    expiration_sweeper::ExpirationSweeper,
    grant_scheduler::GrantScheduler,
    job::{JobReport, LedgerJob, Schedule},
    notification::{DispatchJob, NotificationSink, OutboxDispatcher},
    store::{JobRunRow, LedgerStore},
    tier::SubscriptionDirectory,
    warning_notifier::WarningNotifier,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub struct LedgerEngine {
    store:  LedgerStore,
    jobs:   Vec<Box<dyn LedgerJob>>,
}

impl LedgerEngine {
    pub fn new(store: LedgerStore) -> Self {
        Self {
            store,
            jobs: Vec::new(),
        }
    }

    /// Build a fully wired engine with every job registered. Each job gets
    /// its own connection from `store.reopen()`, so `store` must be a file
    /// or shared-memory database.
    pub fn build(
        store: LedgerStore,
        config: &LedgerConfig,
        directory: Box<dyn SubscriptionDirectory>,
        sink: Box<dyn NotificationSink>,
    ) -> LedgerResult<Self> {
        let grants = GrantScheduler::new(store.reopen()?, directory, config);
        let sweeper = ExpirationSweeper::new(store.reopen()?, config);
        let notifier = WarningNotifier::new(store.reopen()?, config);
        let dispatch = DispatchJob::new(OutboxDispatcher::new(store.reopen()?, config), sink);

        let mut engine = LedgerEngine::new(store);
        // EXECUTION ORDER — fixed, documented, never reordered.
        engine.register(Box::new(grants));
        engine.register(Box::new(sweeper));
        engine.register(Box::new(notifier));
        engine.register(Box::new(dispatch));
        Ok(engine)
    }

    /// Register a job. Call in the documented execution order.
    pub fn register(&mut self, job: Box<dyn LedgerJob>) {
        self.jobs.push(job);
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    /// Run every job on `schedule`, in order. A job that cannot run is
    /// recorded as failed and stops the trigger; later jobs wait for the
    /// next one.
    pub fn trigger(&mut self, schedule: Schedule, now: DateTime<Utc>) -> LedgerResult<Vec<JobReport>> {
        let mut reports = Vec::new();
        for job in self.jobs.iter_mut().filter(|job| job.schedule() == schedule) {
            let name = job.name();
            let run_id = Uuid::new_v4().to_string();
            match job.run(now) {
                Ok(report) => {
                    let status = if report.complete { "completed" } else { "partial" };
                    self.store.insert_job_run(&JobRunRow {
                        run_id,
                        job: name.to_string(),
                        schedule: schedule.as_str().to_string(),
                        triggered_at: now,
                        status: status.to_string(),
                        report: Some(serde_json::to_string(&report)?),
                    })?;
                    reports.push(report);
                }
                Err(e) => {
                    log::error!("engine: job={name} trigger={} failed: {e}", schedule.as_str());
                    self.store.insert_job_run(&JobRunRow {
                        run_id,
                        job: name.to_string(),
                        schedule: schedule.as_str().to_string(),
                        triggered_at: now,
                        status: "failed".to_string(),
                        report: Some(e.to_string()),
                    })?;
                    return Err(e);
                }
            }
        }
        log::debug!(
            "engine: trigger={} at={now} jobs={}",
            schedule.as_str(),
            reports.len()
        );
        Ok(reports)
    }

    pub fn run_daily(&mut self, now: DateTime<Utc>) -> LedgerResult<Vec<JobReport>> {
        self.trigger(Schedule::Daily, now)
    }

    pub fn run_monthly(&mut self, now: DateTime<Utc>) -> LedgerResult<Vec<JobReport>> {
        self.trigger(Schedule::Monthly, now)
    }
}
