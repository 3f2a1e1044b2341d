//! Ledger-wide invariants under a seeded random workload.
//!
//! For every account, at every checkpoint:
//!   cached_balance == Σ active amount_remaining == Σ transaction amount
//! For every lot:
//!   0 <= amount_remaining <= amount_original, terminal lots hold nothing,
//!   and no lot is active past its expiry once the daily sweep has run.

use chrono::{Datelike, TimeZone, Utc};
use coin_ledger_core::{
    clock::{LedgerClock, ManualClock},
    config::LedgerConfig,
    engine::LedgerEngine,
    error::LedgerError,
    ledger::CoinLedger,
    notification::LogSink,
    store::LedgerStore,
    tier::StaticDirectory,
    types::LotStatus,
    workload::WorkloadGenerator,
};
use std::sync::Arc;

fn check_invariants(ledger: &CoinLedger, now: chrono::DateTime<Utc>) {
    for audit in ledger.audit_all().unwrap() {
        assert!(audit.is_consistent(), "balance drift at {now}: {audit:?}");
        assert!(audit.cached_balance >= 0);
    }
    for account_id in ledger.store().account_ids().unwrap() {
        for lot in ledger.lots(&account_id).unwrap() {
            assert!(lot.amount_remaining >= 0 && lot.amount_remaining <= lot.amount_original);
            match lot.status {
                LotStatus::Active => {
                    assert!(lot.amount_remaining > 0, "active lot {} is empty", lot.lot_id);
                    assert!(lot.expires_at > now, "lot {} outlived its expiry", lot.lot_id);
                }
                LotStatus::Exhausted | LotStatus::Expired => assert_eq!(lot.amount_remaining, 0),
            }
        }
    }
}

/// Run `days` of seeded traffic. Returns the ledger plus applied and rejected command counts.
fn simulate(seed: u64, days: u64) -> (CoinLedger, u64, u64) {
    let _ = env_logger::builder().is_test(true).try_init();
    let name = format!("inv_{seed}_{}", uuid::Uuid::new_v4().simple());
    let store = LedgerStore::open_shared_memory(&name).expect("shared store");
    store.migrate().expect("migration");
    let config = LedgerConfig {
        lot_lifetime_days: 60,
        warning_lookahead_days: 7,
        batch_size: 7,
        ..LedgerConfig::default()
    };

    let mut workload = WorkloadGenerator::new(seed, 25, &config);
    let directory = StaticDirectory::new();
    for subscriber in workload.subscribers() {
        directory.set_tier(&subscriber.account_id, subscriber.tier);
    }
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
    let ledger = CoinLedger::new(store.reopen().unwrap(), config.clone(), clock.clone());
    let mut engine = LedgerEngine::build(store, &config, Box::new(directory), Box::new(LogSink)).unwrap();

    let (mut applied, mut rejected) = (0, 0);
    for day in 0..days {
        let midnight = clock.now();
        if midnight.day() == 1 {
            engine.run_monthly(midnight).unwrap();
        }
        engine.run_daily(midnight).unwrap();
        check_invariants(&ledger, midnight);

        clock.advance(chrono::Duration::hours(12));
        for command in workload.commands_for_day(day) {
            match ledger.apply(&command) {
                Ok(_) => applied += 1,
                Err(LedgerError::InsufficientBalance { .. } | LedgerError::AccountNotFound { .. }) => {
                    rejected += 1
                }
                Err(e) => panic!("day {day}: {command:?} failed: {e}"),
            }
        }
        clock.advance(chrono::Duration::hours(12));
    }
    (ledger, applied, rejected)
}

#[test]
fn random_workload_preserves_invariants() {
    let (ledger, applied, rejected) = simulate(0xC0FF_EE00, 150);
    assert!(applied > 0, "workload produced no successful commands");
    assert!(rejected > 0, "workload never hit an insufficient balance");
    assert!(ledger.store().event_count("coins_expired").unwrap() > 0);
    assert!(ledger.store().event_count("expiry_warning").unwrap() > 0);
}

#[test]
fn same_seed_same_ledger() {
    let (a, ..) = simulate(7, 60);
    let (b, ..) = simulate(7, 60);
    let ids = a.store().account_ids().unwrap();
    assert_eq!(ids, b.store().account_ids().unwrap());
    for account_id in &ids {
        assert_eq!(a.get_balance(account_id).unwrap(), b.get_balance(account_id).unwrap());
        let amounts_a: Vec<_> = a.transactions(account_id).unwrap().iter().map(|t| (t.kind, t.amount)).collect();
        let amounts_b: Vec<_> = b.transactions(account_id).unwrap().iter().map(|t| (t.kind, t.amount)).collect();
        assert_eq!(amounts_a, amounts_b);
    }
}

#[test]
fn repair_rebuilds_a_drifted_cache() {
    let (ledger, ..) = simulate(11, 30);
    let account_id = ledger
        .store()
        .account_ids()
        .unwrap()
        .into_iter()
        .find(|id| ledger.get_balance(id).unwrap() > 0)
        .expect("an account with coins");
    let expected = ledger.get_balance(&account_id).unwrap();

    // Knock the cache off by hand, the way a bad manual fix would.
    ledger
        .store()
        .atomic(|unit| {
            let account = unit.require_account(&account_id)?;
            unit.reset_cached_balance(&account, expected + 999)
        })
        .unwrap();
    assert!(!ledger.audit(&account_id).unwrap().is_consistent());

    let repaired = ledger.repair(&account_id).unwrap();
    assert!(repaired.is_consistent());
    assert_eq!(ledger.get_balance(&account_id).unwrap(), expected);
}
