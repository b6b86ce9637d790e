//! Common test utilities for reconciliation engine integration tests.

use chrono::NaiveDate;
use recon_engine::config::EngineConfig;
use recon_engine::engine::ReconciliationEngine;
use recon_engine::models::{
    BankRecord, InstrumentAmounts, InstrumentCode, LedgerPosting, TransactionKind,
};
use recon_engine::repository::memory::InMemoryRepository;
use recon_engine::services::grouping::generate_group_code;
use rust_decimal::Decimal;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,recon_engine=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Test engine wrapper holding the engine and its backing repository.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: ReconciliationEngine,
    pub repo: Arc<InMemoryRepository>,
}

/// Build an engine over a fresh in-memory repository with default config.
pub fn spawn_engine() -> TestEngine {
    init_tracing();
    let repo = Arc::new(InMemoryRepository::new());
    let engine = ReconciliationEngine::new(repo.clone(), EngineConfig::default());
    TestEngine { engine, repo }
}

#[allow(dead_code)]
pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[allow(dead_code)]
pub fn dec(units: i64) -> Decimal {
    Decimal::from(units)
}

/// Bank record carrying the full amount on money market. Goal and source ids
/// must not contain `-` so the matching group codes stay well formed.
#[allow(dead_code)]
pub fn bank_record(
    goal: &str,
    source: &str,
    kind: TransactionKind,
    on: NaiveDate,
    amount: Decimal,
) -> BankRecord {
    BankRecord::new(
        goal,
        source,
        kind,
        on,
        amount,
        InstrumentAmounts::new().with(InstrumentCode::MoneyMarket, amount),
    )
}

#[allow(dead_code)]
pub fn deposit_record(goal: &str, source: &str, on: NaiveDate, amount: Decimal) -> BankRecord {
    bank_record(goal, source, TransactionKind::Deposit, on, amount)
}

/// Ledger posting under the canonical group code for its goal transaction,
/// booked to money market.
#[allow(dead_code)]
pub fn posting(
    goal: &str,
    source: &str,
    kind: TransactionKind,
    on: NaiveDate,
    amount: Decimal,
) -> LedgerPosting {
    posting_in(goal, source, kind, on, amount, InstrumentCode::MoneyMarket)
}

#[allow(dead_code)]
pub fn posting_in(
    goal: &str,
    source: &str,
    kind: TransactionKind,
    on: NaiveDate,
    amount: Decimal,
    instrument: InstrumentCode,
) -> LedgerPosting {
    let code = generate_group_code(on, "acct-001", goal, source, "ach");
    LedgerPosting::new(goal, source, kind, on, amount, instrument, code)
}

#[allow(dead_code)]
pub fn deposit_posting(goal: &str, source: &str, on: NaiveDate, amount: Decimal) -> LedgerPosting {
    posting(goal, source, TransactionKind::Deposit, on, amount)
}
