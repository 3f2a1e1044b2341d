//! Integration tests for the grant scheduler.
//!
//! 1. Each tier receives its monthly allowance as a grant lot
//! 2. Re-running a period is a no-op
//! 3. The cursor advances and blocks older periods
//! 4. A crash between lot creation and cursor advance is repaired on rerun
//! 5. One failing account is counted and the run carries on

use chrono::{DateTime, Duration, TimeZone, Utc};
use coin_ledger_core::{
    config::LedgerConfig,
    grant_scheduler::{GrantOutcome, GrantScheduler},
    store::{LedgerStore, NewLot},
    tier::{GrantPeriod, StaticDirectory, Subscriber, SubscriptionTier},
    types::{LotSource, TransactionKind},
};

fn build() -> (GrantScheduler, StaticDirectory, LedgerStore) {
    let name = format!("grants_{}", uuid::Uuid::new_v4().simple());
    let store = LedgerStore::open_shared_memory(&name).expect("shared store");
    store.migrate().expect("migration");
    let directory = StaticDirectory::new();
    let scheduler = GrantScheduler::new(
        store.reopen().expect("reopen"),
        Box::new(directory.clone()),
        &LedgerConfig::default(),
    );
    (scheduler, directory, store)
}

fn first_of(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 5, 0).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: tier allowances
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn tiers_receive_their_allowance() {
    let (mut scheduler, directory, store) = build();
    directory.set_tier("basic-user", SubscriptionTier::Basic);
    directory.set_tier("silver-user", SubscriptionTier::Silver);
    directory.set_tier("gold-user", SubscriptionTier::Gold);

    let now = first_of(2025, 4);
    let period = GrantPeriod::containing(now);
    let report = scheduler.run_period(period, now).unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.coins, 350);
    assert!(report.complete);

    assert_eq!(store.cached_balance("silver-user").unwrap(), Some(100));
    assert_eq!(store.cached_balance("gold-user").unwrap(), Some(250));
    assert_eq!(store.cached_balance("basic-user").unwrap(), None);

    let lot = &store.active_lots("gold-user").unwrap()[0];
    assert_eq!(lot.source, LotSource::Grant);
    assert_eq!(lot.idempotency_key.as_deref(), Some("grant:gold-user:2025-04"));
    assert_eq!(lot.expires_at, now + Duration::days(365));

    let txns = store.transactions_for("gold-user").unwrap();
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].kind, TransactionKind::Grant);

    let account = store.account("gold-user").unwrap().unwrap();
    assert_eq!(account.tier, SubscriptionTier::Gold);
    assert_eq!(account.next_grant_period, Some(period.next()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: idempotent reruns
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rerunning_a_period_grants_once() {
    let (mut scheduler, directory, store) = build();
    directory.set_tier("u1", SubscriptionTier::Silver);

    let now = first_of(2025, 4);
    let period = GrantPeriod::containing(now);
    scheduler.run_period(period, now).unwrap();
    let second = scheduler.run_period(period, now + Duration::hours(3)).unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.skipped, 1);

    assert_eq!(store.lots_for("u1").unwrap().len(), 1);
    assert_eq!(store.transactions_for("u1").unwrap().len(), 1);
    assert_eq!(store.cached_balance("u1").unwrap(), Some(100));
}

#[test]
fn consecutive_months_each_grant() {
    let (mut scheduler, directory, store) = build();
    directory.set_tier("u1", SubscriptionTier::Gold);

    for month in [11, 12] {
        let now = first_of(2025, month);
        scheduler.run_period(GrantPeriod::containing(now), now).unwrap();
    }
    let jan = first_of(2026, 1);
    scheduler.run_period(GrantPeriod::containing(jan), jan).unwrap();

    assert_eq!(store.cached_balance("u1").unwrap(), Some(750));
    let account = store.account("u1").unwrap().unwrap();
    assert_eq!(account.next_grant_period, Some(GrantPeriod::new(2026, 2).unwrap()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: cursor
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn cursor_ahead_skips_older_period() {
    let (mut scheduler, directory, store) = build();
    directory.set_tier("u1", SubscriptionTier::Silver);

    let may = first_of(2025, 5);
    scheduler.run_period(GrantPeriod::containing(may), may).unwrap();

    let april = GrantPeriod::new(2025, 4).unwrap();
    let outcome = scheduler
        .grant_account(
            &Subscriber {
                account_id: "u1".into(),
                tier: SubscriptionTier::Silver,
            },
            april,
            may,
        )
        .unwrap();
    assert_eq!(outcome, GrantOutcome::CursorAhead);
    assert_eq!(store.cached_balance("u1").unwrap(), Some(100));
}

#[test]
fn tier_change_applies_next_period() {
    let (mut scheduler, directory, store) = build();
    directory.set_tier("u1", SubscriptionTier::Silver);
    let jun = first_of(2025, 6);
    scheduler.run_period(GrantPeriod::containing(jun), jun).unwrap();

    directory.set_tier("u1", SubscriptionTier::Gold);
    let jul = first_of(2025, 7);
    scheduler.run_period(GrantPeriod::containing(jul), jul).unwrap();

    assert_eq!(store.cached_balance("u1").unwrap(), Some(350));
    assert_eq!(store.account("u1").unwrap().unwrap().tier, SubscriptionTier::Gold);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: crash between lot and cursor
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn lot_without_cursor_advance_is_repaired_on_rerun() {
    let (mut scheduler, directory, store) = build();
    directory.set_tier("u1", SubscriptionTier::Gold);
    let now = first_of(2025, 8);
    let period = GrantPeriod::containing(now);

    // The lot landed but the process died before the cursor moved.
    store
        .create_lot(
            &NewLot::new("u1", 250, LotSource::Grant).with_key(period.grant_key("u1")),
            now,
            Duration::days(365),
        )
        .unwrap();
    assert_eq!(store.account("u1").unwrap().unwrap().next_grant_period, None);

    let report = scheduler.run_period(period, now).unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.lots_for("u1").unwrap().len(), 1);
    assert_eq!(
        store.account("u1").unwrap().unwrap().next_grant_period,
        Some(period.next())
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: a failing account
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn failing_account_does_not_stop_the_run() {
    let (mut scheduler, directory, store) = build();
    let now = first_of(2025, 6);
    let period = GrantPeriod::containing(now);

    // A balance one grant cannot be added to.
    store
        .create_lot(
            &NewLot::new("maxed", i64::MAX - 100, LotSource::Reward),
            now - Duration::days(3),
            Duration::days(365),
        )
        .unwrap();
    directory.set_tier("maxed", SubscriptionTier::Gold);
    directory.set_tier("gold-user", SubscriptionTier::Gold);
    directory.set_tier("silver-user", SubscriptionTier::Silver);

    let report = scheduler.run_period(period, now).unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 2);
    assert_eq!(report.coins, 350);
    assert!(report.complete);

    assert_eq!(store.cached_balance("maxed").unwrap(), Some(i64::MAX - 100));
    assert_eq!(store.lots_for("maxed").unwrap().len(), 1);
    assert_eq!(store.account("maxed").unwrap().unwrap().next_grant_period, None);
    assert_eq!(store.cached_balance("gold-user").unwrap(), Some(250));
    assert_eq!(store.cached_balance("silver-user").unwrap(), Some(100));
}
