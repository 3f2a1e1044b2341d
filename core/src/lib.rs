//! Coin ledger: per-account virtual-currency balances built from expiring,
//! FIFO-consumed lots, with monthly tier grants, a daily expiration sweep and
//! expiry warnings delivered through an outbox.

pub mod balance;
pub mod clock;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod expiration_sweeper;
pub mod grant_scheduler;
pub mod job;
pub mod ledger;
pub mod notification;
pub mod retry;
pub mod spend_processor;
pub mod store;
pub mod tier;
pub mod types;
pub mod warning_notifier;
pub mod workload;
