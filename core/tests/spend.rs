//! Integration tests for the spend processor.
//!
//! 1. FIFO consumption across lots, with one spend row per lot
//! 2. Insufficient balance and invalid amounts mutate nothing
//! 3. Exhausted lots never contribute again
//! 4. Concurrent spends on one account never overdraw it

use chrono::{TimeZone, Utc};
use coin_ledger_core::{
    clock::ManualClock,
    config::LedgerConfig,
    error::LedgerError,
    ledger::CoinLedger,
    store::{LedgerStore, LotDebit},
    types::{LotSource, LotStatus, TransactionKind},
};
use std::sync::Arc;

fn build() -> (CoinLedger, Arc<ManualClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = LedgerStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()));
    (CoinLedger::new(store, LedgerConfig::default(), clock.clone()), clock)
}

/// Lot A (50) on day 0, lot B (30) on day 10.
fn two_lots(ledger: &CoinLedger, clock: &ManualClock) -> (i64, i64) {
    let a = ledger
        .create_lot("u1", 50, LotSource::Purchase, Some("purchase:a"))
        .unwrap()
        .into_lot();
    clock.advance_days(10);
    let b = ledger
        .create_lot("u1", 30, LotSource::Purchase, Some("purchase:b"))
        .unwrap()
        .into_lot();
    (a.lot_id, b.lot_id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: FIFO
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn spend_drains_oldest_lot_first() {
    let (ledger, clock) = build();
    let (a, b) = two_lots(&ledger, &clock);

    let debits = ledger.spend("u1", 60).unwrap();
    assert_eq!(
        debits,
        vec![
            LotDebit { lot_id: a, amount: 50 },
            LotDebit { lot_id: b, amount: 10 },
        ]
    );

    let lots = ledger.lots("u1").unwrap();
    assert_eq!(lots[0].status, LotStatus::Exhausted);
    assert_eq!(lots[0].amount_remaining, 0);
    assert_eq!(lots[1].status, LotStatus::Active);
    assert_eq!(lots[1].amount_remaining, 20);
    assert_eq!(ledger.get_balance("u1").unwrap(), 20);

    let spends: Vec<_> = ledger
        .transactions("u1")
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionKind::Spend)
        .collect();
    assert_eq!(spends.len(), 2);
    assert_eq!((spends[0].lot_id, spends[0].amount, spends[0].balance_after), (Some(a), -50, 30));
    assert_eq!((spends[1].lot_id, spends[1].amount, spends[1].balance_after), (Some(b), -10, 20));
    assert!(ledger.audit("u1").unwrap().is_consistent());
}

#[test]
fn same_instant_lots_break_ties_by_id() {
    let (ledger, _) = build();
    let first = ledger.create_lot("u1", 10, LotSource::Reward, None).unwrap().into_lot();
    let second = ledger.create_lot("u1", 10, LotSource::Reward, None).unwrap().into_lot();
    assert_eq!(first.acquired_at, second.acquired_at);

    let debits = ledger.spend("u1", 5).unwrap();
    assert_eq!(debits, vec![LotDebit { lot_id: first.lot_id, amount: 5 }]);
}

#[test]
fn exact_balance_spend_exhausts_everything() {
    let (ledger, clock) = build();
    two_lots(&ledger, &clock);
    ledger.spend("u1", 80).unwrap();
    assert_eq!(ledger.get_balance("u1").unwrap(), 0);
    assert!(ledger.active_lots("u1").unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: rejections
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn insufficient_balance_changes_nothing() {
    let (ledger, clock) = build();
    two_lots(&ledger, &clock);
    let before = ledger.lots("u1").unwrap();

    let err = ledger.spend("u1", 81).unwrap_err();
    match err {
        LedgerError::InsufficientBalance {
            requested,
            available,
            ..
        } => {
            assert_eq!(requested, 81);
            assert_eq!(available, 80);
        }
        other => panic!("expected InsufficientBalance, got {other:?}"),
    }

    assert_eq!(ledger.lots("u1").unwrap(), before);
    assert_eq!(ledger.get_balance("u1").unwrap(), 80);
    assert_eq!(ledger.transactions("u1").unwrap().len(), 2);
}

#[test]
fn invalid_amounts_and_unknown_accounts_are_rejected() {
    let (ledger, clock) = build();
    two_lots(&ledger, &clock);
    assert!(matches!(
        ledger.spend("u1", 0).unwrap_err(),
        LedgerError::InvalidAmount { amount: 0 }
    ));
    assert!(matches!(
        ledger.spend("u1", -3).unwrap_err(),
        LedgerError::InvalidAmount { .. }
    ));
    assert!(matches!(
        ledger.spend("ghost", 1).unwrap_err(),
        LedgerError::AccountNotFound { .. }
    ));
    assert_eq!(ledger.get_balance("u1").unwrap(), 80);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: exhausted lots stay out
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn exhausted_lot_is_never_debited_again() {
    let (ledger, clock) = build();
    let (a, b) = two_lots(&ledger, &clock);
    ledger.spend("u1", 50).unwrap();

    clock.advance_days(1);
    ledger.create_lot("u1", 40, LotSource::Reward, None).unwrap();
    let debits = ledger.spend("u1", 35).unwrap();
    assert!(debits.iter().all(|d| d.lot_id != a));
    assert_eq!(debits[0], LotDebit { lot_id: b, amount: 30 });
    assert_eq!(debits[1].amount, 5);
    assert_eq!(ledger.get_balance("u1").unwrap(), 35);
}

#[test]
fn memo_is_recorded_on_spend_rows() {
    let (ledger, clock) = build();
    two_lots(&ledger, &clock);
    ledger.spend_with_memo("u1", 10, "super like").unwrap();
    let last = ledger.transactions("u1").unwrap().pop().unwrap();
    assert_eq!(last.memo.as_deref(), Some("super like"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_spends_never_overdraw() {
    let path = std::env::temp_dir().join(format!("coin-ledger-spend-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();
    let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

    {
        let store = LedgerStore::open(&path).unwrap();
        store.migrate().unwrap();
        let ledger = CoinLedger::new(store, LedgerConfig::default(), Arc::new(ManualClock::new(start)));
        for i in 0..10 {
            ledger
                .create_lot("u1", 10, LotSource::Purchase, Some(&format!("purchase:{i}")))
                .unwrap();
        }
    }

    let mut config = LedgerConfig::default();
    config.retry.max_attempts = 50;
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            let config = config.clone();
            std::thread::spawn(move || {
                let store = LedgerStore::open(&path).unwrap();
                let ledger = CoinLedger::new(store, config, Arc::new(ManualClock::new(start)));
                let mut spent = 0;
                for _ in 0..5 {
                    match ledger.spend("u1", 7) {
                        Ok(_) => spent += 7,
                        Err(LedgerError::InsufficientBalance { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                spent
            })
        })
        .collect();
    let spent: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let store = LedgerStore::open(&path).unwrap();
    let ledger = CoinLedger::new(store, LedgerConfig::default(), Arc::new(ManualClock::new(start)));
    let audit = ledger.audit("u1").unwrap();
    assert!(audit.is_consistent(), "{audit:?}");
    assert_eq!(audit.cached_balance, 100 - spent);
    assert!(audit.cached_balance >= 0);
    assert!(audit.cached_balance < 7, "spends stopped early: {audit:?}");

    drop(ledger);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{path}-wal"));
    let _ = std::fs::remove_file(format!("{path}-shm"));
}
