//! Domain models for the reconciliation engine.

#![allow(clippy::should_implement_trait)]

use anyhow::anyhow;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ReconError;

// ============================================================================
// Transaction Kind & Instrument Models
// ============================================================================

/// Cash movement categories shared by bank records and ledger postings.
///
/// Amounts are signed by kind: deposits and interest are positive,
/// withdrawals and fees are negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Interest,
    Fee,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Interest => "interest",
            Self::Fee => "fee",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "deposit" => Self::Deposit,
            "withdrawal" => Self::Withdrawal,
            "interest" => Self::Interest,
            "fee" => Self::Fee,
            _ => Self::Deposit,
        }
    }

    /// Kind a reversal of this movement would carry, if one exists.
    /// Interest and fees are one-directional and have no reversal kind.
    pub fn opposite(&self) -> Option<Self> {
        match self {
            Self::Deposit => Some(Self::Withdrawal),
            Self::Withdrawal => Some(Self::Deposit),
            Self::Interest | Self::Fee => None,
        }
    }

    pub fn is_inflow(&self) -> bool {
        matches!(self, Self::Deposit | Self::Interest)
    }
}

/// Instrument buckets a goal portfolio allocates across.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum InstrumentCode {
    MoneyMarket,
    FixedIncome,
    TreasuryBills,
    Equities,
}

impl InstrumentCode {
    pub const ALL: [InstrumentCode; 4] = [
        Self::MoneyMarket,
        Self::FixedIncome,
        Self::TreasuryBills,
        Self::Equities,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MoneyMarket => "money_market",
            Self::FixedIncome => "fixed_income",
            Self::TreasuryBills => "treasury_bills",
            Self::Equities => "equities",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "money_market" => Some(Self::MoneyMarket),
            "fixed_income" => Some(Self::FixedIncome),
            "treasury_bills" => Some(Self::TreasuryBills),
            "equities" => Some(Self::Equities),
            _ => None,
        }
    }
}

/// Per-instrument amount breakdown. Missing instruments read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentAmounts(BTreeMap<InstrumentCode, Decimal>);

impl InstrumentAmounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for fixtures.
    pub fn with(mut self, instrument: InstrumentCode, amount: Decimal) -> Self {
        self.set(instrument, amount);
        self
    }

    pub fn get(&self, instrument: InstrumentCode) -> Decimal {
        self.0.get(&instrument).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn set(&mut self, instrument: InstrumentCode, amount: Decimal) {
        self.0.insert(instrument, amount);
    }

    pub fn add(&mut self, instrument: InstrumentCode, amount: Decimal) {
        let entry = self.0.entry(instrument).or_insert(Decimal::ZERO);
        *entry += amount;
    }

    /// Accumulate another breakdown into this one.
    pub fn merge(&mut self, other: &InstrumentAmounts) {
        for (instrument, amount) in other.iter() {
            self.add(instrument, amount);
        }
    }

    pub fn total(&self) -> Decimal {
        self.0.values().copied().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstrumentCode, Decimal)> + '_ {
        self.0.iter().map(|(code, amount)| (*code, *amount))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Status, Review & Severity Models
// ============================================================================

/// Lifecycle of a bank record through the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    Unmatched,
    Matched,
    AutoApproved,
    ManualReview,
    MissingInLedger,
    MissingInBank,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Matched => "matched",
            Self::AutoApproved => "auto_approved",
            Self::ManualReview => "manual_review",
            Self::MissingInLedger => "missing_in_ledger",
            Self::MissingInBank => "missing_in_bank",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "unmatched" => Self::Unmatched,
            "matched" => Self::Matched,
            "auto_approved" => Self::AutoApproved,
            "manual_review" => Self::ManualReview,
            "missing_in_ledger" => Self::MissingInLedger,
            "missing_in_bank" => Self::MissingInBank,
            _ => Self::Unmatched,
        }
    }
}

/// Operator-facing review tags carried by flagged records and postings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ReviewTag {
    MissingInLedger,
    MissingInBank,
    TimingDifference,
    Approved,
    Disputed,
}

impl ReviewTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingInLedger => "missing_in_ledger",
            Self::MissingInBank => "missing_in_bank",
            Self::TimingDifference => "timing_difference",
            Self::Approved => "approved",
            Self::Disputed => "disputed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "missing_in_ledger" => Some(Self::MissingInLedger),
            "missing_in_bank" => Some(Self::MissingInBank),
            "timing_difference" => Some(Self::TimingDifference),
            "approved" => Some(Self::Approved),
            "disputed" => Some(Self::Disputed),
            _ => None,
        }
    }
}

/// Variance severity, ordered from least to most serious.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Points subtracted from the match score per variance of this severity.
    pub fn penalty(&self) -> i32 {
        match self {
            Self::Low => 5,
            Self::Medium => 15,
            Self::High => 30,
            Self::Critical => 50,
        }
    }
}

// ============================================================================
// Match Reference Models
// ============================================================================

/// How a match was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    Exact,
    Amount,
    SplitBankToGroup,
    SplitGroupToBank,
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Amount => "amount",
            Self::SplitBankToGroup => "split_bank_to_group",
            Self::SplitGroupToBank => "split_group_to_bank",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "exact" => Self::Exact,
            "amount" => Self::Amount,
            "split_bank_to_group" => Self::SplitBankToGroup,
            "split_group_to_bank" => Self::SplitGroupToBank,
            "manual" => Self::Manual,
            _ => Self::Exact,
        }
    }

    pub fn is_split(&self) -> bool {
        matches!(self, Self::SplitBankToGroup | Self::SplitGroupToBank)
    }
}

/// Typed link from a bank record to the ledger group(s) covering it.
///
/// Manual references are persisted by operators and survive re-runs of the
/// matcher; algorithmic references are re-derived on every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReference {
    pub match_type: MatchType,
    pub group_codes: Vec<String>,
    pub matched_by: Option<String>,
}

impl MatchReference {
    pub fn manual(group_codes: Vec<String>, matched_by: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Manual,
            group_codes,
            matched_by: Some(matched_by.into()),
        }
    }

    pub fn algorithmic(match_type: MatchType, group_codes: Vec<String>) -> Self {
        Self {
            match_type,
            group_codes,
            matched_by: None,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.match_type == MatchType::Manual
    }

    pub fn references_group(&self, group_code: &str) -> bool {
        self.group_codes.iter().any(|code| code == group_code)
    }
}

// ============================================================================
// Bank Record Models
// ============================================================================

/// One external money movement reported by the bank for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankRecord {
    pub record_id: Uuid,
    pub goal_id: String,
    pub source_txn_id: String,
    pub kind: TransactionKind,
    pub txn_date: NaiveDate,
    pub amount: Decimal,
    pub instrument_amounts: InstrumentAmounts,
    pub match_ref: Option<MatchReference>,
    pub matched_at: Option<DateTime<Utc>>,
    pub match_score: Option<i32>,
    pub status: ReconciliationStatus,
    pub review_tag: Option<ReviewTag>,
    pub review_notes: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub variance_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_reason: Option<String>,
    pub reversal_partner_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

impl BankRecord {
    pub fn new(
        goal_id: impl Into<String>,
        source_txn_id: impl Into<String>,
        kind: TransactionKind,
        txn_date: NaiveDate,
        amount: Decimal,
        instrument_amounts: InstrumentAmounts,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            goal_id: goal_id.into(),
            source_txn_id: source_txn_id.into(),
            kind,
            txn_date,
            amount,
            instrument_amounts,
            match_ref: None,
            matched_at: None,
            match_score: None,
            status: ReconciliationStatus::Unmatched,
            review_tag: None,
            review_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            variance_resolved: false,
            resolved_at: None,
            resolved_reason: None,
            reversal_partner_id: None,
            created_utc: Utc::now(),
        }
    }

    pub fn is_matched(&self) -> bool {
        self.match_ref.is_some()
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.goal_id.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "bank record {} has an empty goal id",
                self.record_id
            )));
        }
        if self.source_txn_id.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "bank record {} has an empty source transaction id",
                self.record_id
            )));
        }
        if self.amount == Decimal::ZERO {
            return Err(ReconError::Validation(anyhow!(
                "bank record {} has a zero amount",
                self.record_id
            )));
        }
        if self.amount.is_sign_positive() != self.kind.is_inflow() {
            return Err(ReconError::Validation(anyhow!(
                "bank record {} amount {} has the wrong sign for kind {}",
                self.record_id,
                self.amount,
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Ledger Posting Models
// ============================================================================

/// One instrument-level ledger movement belonging to a goal transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub posting_id: Uuid,
    pub goal_id: String,
    pub source_txn_id: String,
    pub kind: TransactionKind,
    pub txn_date: NaiveDate,
    pub amount: Decimal,
    pub units: Option<Decimal>,
    pub instrument: InstrumentCode,
    pub group_code: String,
    pub review_tag: Option<ReviewTag>,
    pub review_notes: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub variance_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_reason: Option<String>,
    pub posted_utc: DateTime<Utc>,
}

impl LedgerPosting {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        goal_id: impl Into<String>,
        source_txn_id: impl Into<String>,
        kind: TransactionKind,
        txn_date: NaiveDate,
        amount: Decimal,
        instrument: InstrumentCode,
        group_code: impl Into<String>,
    ) -> Self {
        Self {
            posting_id: Uuid::new_v4(),
            goal_id: goal_id.into(),
            source_txn_id: source_txn_id.into(),
            kind,
            txn_date,
            amount,
            units: None,
            instrument,
            group_code: group_code.into(),
            review_tag: None,
            review_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            variance_resolved: false,
            resolved_at: None,
            resolved_reason: None,
            posted_utc: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.goal_id.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "ledger posting {} has an empty goal id",
                self.posting_id
            )));
        }
        if self.source_txn_id.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "ledger posting {} has an empty source transaction id",
                self.posting_id
            )));
        }
        if self.amount == Decimal::ZERO {
            return Err(ReconError::Validation(anyhow!(
                "ledger posting {} has a zero amount",
                self.posting_id
            )));
        }
        if self.amount.is_sign_positive() != self.kind.is_inflow() {
            return Err(ReconError::Validation(anyhow!(
                "ledger posting {} amount {} has the wrong sign for kind {}",
                self.posting_id,
                self.amount,
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Goal Transaction Group Models
// ============================================================================

/// Ledger postings aggregated under one canonical group code.
///
/// All postings in a group share goal, source transaction id, kind and date;
/// the group is the ledger-side unit the matcher works with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalTransactionGroup {
    pub group_code: String,
    pub goal_id: String,
    pub source_txn_id: String,
    pub kind: TransactionKind,
    pub txn_date: NaiveDate,
    pub net_amount: Decimal,
    pub net_instrument_amounts: InstrumentAmounts,
    pub posting_ids: Vec<Uuid>,
}

// ============================================================================
// Match Result Models
// ============================================================================

/// Outcome of matching one or more bank records against one or more groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_type: MatchType,
    pub bank_record_ids: Vec<Uuid>,
    pub group_codes: Vec<String>,
    pub posting_ids: Vec<Uuid>,
    pub confidence: f64,
    pub bank_total: Decimal,
    pub group_total: Decimal,
    pub variances: Vec<DetectedVariance>,
    pub status: ReconciliationStatus,
    pub match_score: i32,
}

impl MatchResult {
    /// A fresh result straight out of a matching pass, before variance
    /// classification has run over it.
    pub fn unclassified(
        match_type: MatchType,
        bank_record_ids: Vec<Uuid>,
        group_codes: Vec<String>,
        posting_ids: Vec<Uuid>,
        confidence: f64,
        bank_total: Decimal,
        group_total: Decimal,
    ) -> Self {
        Self {
            match_type,
            bank_record_ids,
            group_codes,
            posting_ids,
            confidence,
            bank_total,
            group_total,
            variances: Vec::new(),
            status: ReconciliationStatus::Matched,
            match_score: 100,
        }
    }
}

// ============================================================================
// Variance Models
// ============================================================================

/// What kind of discrepancy a variance describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarianceKind {
    TotalAmount,
    InstrumentAmount,
    InstrumentDistribution,
    DateDifference,
    MissingInLedger,
    MissingInBank,
}

impl VarianceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalAmount => "total_amount",
            Self::InstrumentAmount => "instrument_amount",
            Self::InstrumentDistribution => "instrument_distribution",
            Self::DateDifference => "date_difference",
            Self::MissingInLedger => "missing_in_ledger",
            Self::MissingInBank => "missing_in_bank",
        }
    }
}

/// A classified discrepancy between the bank side and the ledger side of a
/// match (or the absence of one side entirely).
///
/// For `DateDifference` the expected/actual/difference fields carry day
/// counts rather than amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedVariance {
    pub kind: VarianceKind,
    pub severity: Severity,
    pub instrument: Option<InstrumentCode>,
    pub expected: Decimal,
    pub actual: Decimal,
    pub difference: Decimal,
    pub difference_pct: Option<Decimal>,
    pub description: String,
    pub auto_approved: bool,
    pub approval_reason: Option<String>,
}

// ============================================================================
// Repository Write Payloads
// ============================================================================

/// Match annotations written to every bank record in a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchAnnotations {
    pub match_ref: MatchReference,
    pub matched_at: DateTime<Utc>,
    pub match_score: i32,
    pub status: ReconciliationStatus,
}

/// Review annotations applied to a bank record or ledger posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAnnotations {
    pub tag: ReviewTag,
    pub notes: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Resolution marker for a flagged record. Resolution is monotonic: the
/// engine only ever sets it, never clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAnnotations {
    pub resolved_at: DateTime<Utc>,
    pub reason: String,
}

// ============================================================================
// Date Range Models
// ============================================================================

/// Inclusive date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Window of `days` on each side of `date`.
    pub fn around(date: NaiveDate, days: i64) -> Self {
        Self {
            start: date - Duration::days(days),
            end: date + Duration::days(days),
        }
    }

    /// Widest representable window.
    pub fn unbounded() -> Self {
        Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

// ============================================================================
// Run Outcome Models
// ============================================================================

/// Per-record failure collected during a best-effort pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub record_id: Uuid,
    pub message: String,
}

impl RunError {
    pub fn new(record_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            record_id,
            message: message.into(),
        }
    }
}

/// Counters accumulated over one matching run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchRunStats {
    pub bank_records_seen: usize,
    pub postings_seen: usize,
    pub groups_seen: usize,
    pub exact_matches: usize,
    pub amount_matches: usize,
    pub split_matches: usize,
    pub manual_matches: usize,
    pub low_variances: usize,
    pub medium_variances: usize,
    pub high_variances: usize,
    pub critical_variances: usize,
}

impl MatchRunStats {
    pub fn count_match(&mut self, match_type: MatchType) {
        match match_type {
            MatchType::Exact => self.exact_matches += 1,
            MatchType::Amount => self.amount_matches += 1,
            MatchType::SplitBankToGroup | MatchType::SplitGroupToBank => {
                self.split_matches += 1
            }
            MatchType::Manual => self.manual_matches += 1,
        }
    }

    pub fn count_variance(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low_variances += 1,
            Severity::Medium => self.medium_variances += 1,
            Severity::High => self.high_variances += 1,
            Severity::Critical => self.critical_variances += 1,
        }
    }
}

/// Everything one `match_goal` invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRunOutcome {
    pub goal_id: String,
    pub range: DateRange,
    pub matches: Vec<MatchResult>,
    pub unmatched_bank_records: Vec<Uuid>,
    pub unmatched_groups: Vec<String>,
    pub stats: MatchRunStats,
    pub errors: Vec<RunError>,
}

/// Everything one resolution sweep invocation produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub processed: usize,
    pub resolved_count: usize,
    pub by_tag: BTreeMap<String, usize>,
    pub remaining: u64,
    pub more_pending: bool,
    pub errors: Vec<RunError>,
}

/// Point-in-time reconciliation posture of one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub goal_id: String,
    pub range: DateRange,
    pub total_bank_records: usize,
    pub unmatched: usize,
    pub matched: usize,
    pub auto_approved: usize,
    pub manual_review: usize,
    pub missing_in_ledger: usize,
    pub missing_in_bank: usize,
    pub flagged_postings: usize,
    pub by_review_tag: BTreeMap<String, usize>,
    pub resolved_variances: usize,
}
