//! ledger-runner: headless coin-ledger simulator.
//!
//! Usage:
//!   ledger-runner --seed 12345 --days 400 --accounts 200 --db ledger.db
//!   ledger-runner --seed 12345 --start 2025-01-01 --ipc-mode

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use coin_ledger_core::{
    clock::{LedgerClock, ManualClock},
    command::{CommandOutcome, LedgerCommand},
    config::LedgerConfig,
    engine::LedgerEngine,
    error::{LedgerError, LedgerResult},
    ledger::CoinLedger,
    notification::LogSink,
    store::LedgerStore,
    tier::StaticDirectory,
    types::Coins,
    workload::WorkloadGenerator,
};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcRequest {
    GetState,
    Balance { account_id: String },
    Ledger { command: LedgerCommand },
    AdvanceDays { count: u64 },
    Audit,
    Quit,
}

#[derive(serde::Serialize)]
struct UiState {
    now: DateTime<Utc>,
    accounts: i64,
    total_balance: Coins,
    transactions: i64,
    warnings_queued: i64,
    expiries_queued: i64,
}

/// Running counts for one simulation.
#[derive(Default)]
struct Tally {
    applied: u64,
    rejected_insufficient: u64,
    rejected_no_account: u64,
    rejected_other: u64,
    coins_spent: Coins,
}

impl Tally {
    /// Count one command result. Returns the error for rejections outside the
    /// expected insufficient-balance and no-account cases.
    fn record<'a>(&mut self, result: &'a LedgerResult<CommandOutcome>) -> Option<&'a LedgerError> {
        match result {
            Ok(CommandOutcome::Spent { debits, .. }) => {
                self.applied += 1;
                self.coins_spent += debits.iter().map(|d| d.amount).sum::<Coins>();
            }
            Ok(CommandOutcome::Credited { .. }) => self.applied += 1,
            Err(LedgerError::InsufficientBalance { .. }) => self.rejected_insufficient += 1,
            Err(LedgerError::AccountNotFound { .. }) => self.rejected_no_account += 1,
            Err(e) => {
                self.rejected_other += 1;
                return Some(e);
            }
        }
        None
    }
}

struct Simulation {
    ledger: CoinLedger,
    engine: LedgerEngine,
    clock: Arc<ManualClock>,
    workload: WorkloadGenerator,
    tally: Tally,
    day: u64,
}

impl Simulation {
    /// Fire the triggers due at midnight, then replay the day's traffic at noon.
    fn run_day(&mut self) -> Result<()> {
        let midnight = self.clock.now();
        if midnight.day() == 1 {
            self.engine.run_monthly(midnight)?;
        }
        self.engine.run_daily(midnight)?;

        self.clock.set(midnight + Duration::hours(12));
        for command in self.workload.commands_for_day(self.day) {
            let result = self.ledger.apply(&command);
            if let Some(e) = self.tally.record(&result) {
                log::warn!("day={} account={} rejected: {e}", self.day, command.account_id());
            }
        }

        self.clock.set(midnight + Duration::days(1));
        self.day += 1;
        Ok(())
    }

    fn state(&self) -> Result<UiState> {
        let store = self.ledger.store();
        Ok(UiState {
            now: self.clock.now(),
            accounts: store.account_count()?,
            total_balance: store.total_cached_balance()?,
            transactions: store.transaction_count()?,
            warnings_queued: store.event_count("expiry_warning")?,
            expiries_queued: store.event_count("coins_expired")?,
        })
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let days = parse_arg(&args, "--days", 400u64);
    let accounts = parse_arg(&args, "--accounts", 100usize);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = string_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = string_arg(&args, "--data-dir").unwrap_or("./data");
    let start = match string_arg(&args, "--start") {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("bad --start '{s}'"))?,
        None => NaiveDate::from_ymd_opt(2025, 1, 1).context("default start date")?,
    };

    if !ipc_mode {
        println!("Coin ledger — ledger-runner");
        println!("  seed:      {seed}");
        println!("  days:      {days}");
        println!("  accounts:  {accounts}");
        println!("  start:     {start}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    let config = LedgerConfig::load(data_dir)?;

    // For :memory: use SQLite shared-memory URI so the engine's job
    // connections and the ledger's connection share one database.
    let store = if db == ":memory:" {
        LedgerStore::open_shared_memory(&format!("ledger_{seed}_{}", unix_secs()))?
    } else {
        LedgerStore::open(db)?
    };
    store.migrate()?;

    let start_at = start
        .and_hms_opt(0, 0, 0)
        .context("start midnight")?
        .and_utc();
    let clock = Arc::new(ManualClock::new(start_at));
    let workload = WorkloadGenerator::new(seed, accounts, &config);
    let directory = StaticDirectory::new();
    for subscriber in workload.subscribers() {
        directory.set_tier(&subscriber.account_id, subscriber.tier);
    }

    let ledger = CoinLedger::new(store.reopen()?, config.clone(), clock.clone());
    let engine = LedgerEngine::build(store, &config, Box::new(directory), Box::new(LogSink))?;
    let mut sim = Simulation {
        ledger,
        engine,
        clock,
        workload,
        tally: Tally::default(),
        day: 0,
    };

    if ipc_mode {
        run_ipc_loop(&mut sim)?;
    } else {
        for _ in 0..days {
            sim.run_day()?;
        }
        print_summary(&sim, days)?;
    }

    Ok(())
}

fn run_ipc_loop(sim: &mut Simulation) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }

        let request: IpcRequest = match serde_json::from_str(&buffer) {
            Ok(r) => r,
            Err(e) => {
                let err_json = serde_json::json!({ "error": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };

        let response = match request {
            IpcRequest::Quit => break,
            IpcRequest::GetState => serde_json::to_value(sim.state()?)?,
            IpcRequest::Balance { account_id } => serde_json::json!({
                "account_id": account_id,
                "balance": sim.ledger.get_balance(&account_id)?,
                "breakdown": sim.ledger.balance_breakdown(&account_id)?,
            }),
            IpcRequest::Ledger { command } => match sim.ledger.apply(&command) {
                Ok(outcome) => serde_json::to_value(outcome)?,
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            },
            IpcRequest::AdvanceDays { count } => {
                for _ in 0..count {
                    sim.run_day()?;
                }
                serde_json::to_value(sim.state()?)?
            }
            IpcRequest::Audit => {
                let audits = sim.ledger.audit_all()?;
                let drifted: Vec<_> = audits.into_iter().filter(|a| !a.is_consistent()).collect();
                serde_json::json!({ "inconsistent": drifted })
            }
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn print_summary(sim: &Simulation, days: u64) -> Result<()> {
    let state = sim.state()?;
    let store = sim.ledger.store();

    println!("=== RUN SUMMARY ===");
    println!("  days run:       {days}");
    println!("  final clock:    {}", state.now);
    println!("  accounts:       {}", state.accounts);
    println!("  total balance:  {}", state.total_balance);
    println!("  transactions:   {}", state.transactions);
    println!("  commands ok:    {}", sim.tally.applied);
    println!("  insufficient:   {}", sim.tally.rejected_insufficient);
    println!("  no account:     {}", sim.tally.rejected_no_account);
    println!("  other rejects:  {}", sim.tally.rejected_other);
    println!("  coins spent:    {}", sim.tally.coins_spent);
    println!("  warnings:       {}", state.warnings_queued);
    println!("  expiries:       {}", state.expiries_queued);

    println!();
    println!("=== LOTS ===");
    for (status, count, remaining) in store.lot_status_counts()? {
        println!("  {status:<10} {count:>8} lots  {remaining:>10} coins");
    }

    println!();
    println!("=== TRANSACTIONS ===");
    for (kind, count, total) in store.transaction_totals_by_kind()? {
        println!("  {kind:<10} {count:>8} rows  {total:>10} coins");
    }

    println!();
    println!("=== AUDIT ===");
    let audits = sim.ledger.audit_all()?;
    let drifted: Vec<_> = audits.iter().filter(|a| !a.is_consistent()).collect();
    if drifted.is_empty() {
        println!("  all {} accounts consistent", audits.len());
    } else {
        for audit in drifted {
            println!(
                "  {} cached={} lots={} log={}",
                audit.account_id, audit.cached_balance, audit.active_lot_total, audit.transaction_total
            );
        }
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn unix_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
