//! Outbox delivery to the notification collaborator.
//!
//! RULE: A row is marked delivered only after the sink accepts it. A sink
//! failure bumps `attempts`, records `last_error` and leaves the row pending
//! for the next dispatch. Delivery is therefore at-least-once; consumers
//! deduplicate on the event id.

use crate::{
    config::LedgerConfig,
    error::LedgerResult,
    event::LedgerEvent,
    job::{JobReport, LedgerJob, Schedule},
    store::LedgerStore,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub const JOB_NAME: &str = "outbox_dispatch";

/// Receives ledger events. Implemented by the push/email integration.
pub trait NotificationSink: Send {
    fn deliver(&mut self, event_id: &str, event: &LedgerEvent) -> anyhow::Result<()>;
}

/// Writes every event to the log and accepts it.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&mut self, event_id: &str, event: &LedgerEvent) -> anyhow::Result<()> {
        log::info!(
            "notify: event={event_id} type={} account={} lot={}",
            event.type_name(),
            event.account_id(),
            event.lot_id()
        );
        Ok(())
    }
}

/// Keeps delivered events in memory. Clones share the same buffer, so a
/// caller can hand one clone to the engine and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    delivered: Arc<Mutex<Vec<(String, LedgerEvent)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(String, LedgerEvent)> {
        match self.delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationSink for MemorySink {
    fn deliver(&mut self, event_id: &str, event: &LedgerEvent) -> anyhow::Result<()> {
        let mut delivered = self
            .delivered
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?;
        delivered.push((event_id.to_string(), event.clone()));
        Ok(())
    }
}

pub struct OutboxDispatcher {
    store: LedgerStore,
    batch_size: usize,
    max_batches: Option<usize>,
}

impl OutboxDispatcher {
    pub fn new(store: LedgerStore, config: &LedgerConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size,
            max_batches: config.max_batches_per_run,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Offer every pending row to `sink`, oldest first. Each row is tried
    /// once per dispatch.
    pub fn dispatch(&self, sink: &mut dyn NotificationSink, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        let mut report = JobReport::new(JOB_NAME, &now.date_naive().to_string());
        let batch_size = self.batch_size.max(1);
        let mut after = 0;
        let mut batches = 0;

        loop {
            if self.max_batches.is_some_and(|max| batches >= max) {
                log::info!("{JOB_NAME}: batch bound reached, {} rows offered", report.scanned);
                return Ok(report);
            }
            let page = self.store.pending_events(after, batch_size)?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.outbox_id;
            batches += 1;

            for entry in &page {
                report.scanned += 1;
                let delivered = entry
                    .event()
                    .map_err(anyhow::Error::from)
                    .and_then(|event| sink.deliver(&entry.event_id, &event));
                match delivered {
                    Ok(()) => {
                        self.store.mark_event_delivered(entry.outbox_id, now)?;
                        report.applied += 1;
                    }
                    Err(e) => {
                        log::warn!(
                            "{JOB_NAME}: event={} type={} attempt={} failed: {e:#}",
                            entry.event_id,
                            entry.event_type,
                            entry.attempts + 1
                        );
                        self.store
                            .record_delivery_failure(entry.outbox_id, &format!("{e:#}"))?;
                        report.failed += 1;
                    }
                }
            }

            if page.len() < batch_size {
                break;
            }
        }

        report.complete = true;
        if report.scanned > 0 {
            log::info!(
                "{JOB_NAME}: delivered={} failed={}",
                report.applied,
                report.failed
            );
        }
        Ok(report)
    }
}

/// The dispatcher bound to its sink, as the engine runs it.
pub struct DispatchJob {
    dispatcher: OutboxDispatcher,
    sink: Box<dyn NotificationSink>,
}

impl DispatchJob {
    pub fn new(dispatcher: OutboxDispatcher, sink: Box<dyn NotificationSink>) -> Self {
        Self { dispatcher, sink }
    }
}

impl LedgerJob for DispatchJob {
    fn name(&self) -> &'static str {
        JOB_NAME
    }

    fn schedule(&self) -> Schedule {
        Schedule::Daily
    }

    fn run(&mut self, now: DateTime<Utc>) -> LedgerResult<JobReport> {
        self.dispatcher.dispatch(self.sink.as_mut(), now)
    }
}
