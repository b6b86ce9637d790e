//! Canonical group codes and ledger posting aggregation.
//!
//! A group code names one goal-level transaction on the ledger side:
//! `YYYY-MM-DD-{account}-{goal}-{sourceTxnId}-{channel}`. Postings sharing a
//! code are aggregated into one [`GoalTransactionGroup`] before matching.

use anyhow::anyhow;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::ReconError;
use crate::models::{GoalTransactionGroup, InstrumentAmounts, LedgerPosting, RunError};

pub const GROUP_CODE_DELIMITER: &str = "-";

/// Minimum number of delimiter-separated fields in a well-formed code:
/// three for the date plus account, goal, source id and channel.
const MIN_CODE_FIELDS: usize = 7;

/// Decomposed group code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCodeParts {
    pub txn_date: NaiveDate,
    pub account_id: String,
    pub goal_id: String,
    pub source_txn_id: String,
    pub channel: String,
}

/// Build the canonical code for one goal-level transaction.
///
/// The code is positional, so identifiers containing the delimiter survive a
/// round trip only for the account field; goal, source and channel
/// identifiers must not contain `-`.
pub fn generate_group_code(
    txn_date: NaiveDate,
    account_id: &str,
    goal_id: &str,
    source_txn_id: &str,
    channel: &str,
) -> String {
    let date = txn_date.format("%Y-%m-%d").to_string();
    [date.as_str(), account_id, goal_id, source_txn_id, channel].join(GROUP_CODE_DELIMITER)
}

/// Parse a canonical group code back into its parts.
///
/// The first three fields form the date, the last three are channel, source
/// transaction id and goal (right to left), and everything between belongs
/// to the account id.
pub fn parse_group_code(code: &str) -> Result<GroupCodeParts, ReconError> {
    let fields: Vec<&str> = code.split(GROUP_CODE_DELIMITER).collect();
    if fields.len() < MIN_CODE_FIELDS {
        return Err(ReconError::Validation(anyhow!(
            "group code '{}' has {} fields, expected at least {}",
            code,
            fields.len(),
            MIN_CODE_FIELDS
        )));
    }

    let date_str = fields[..3].join(GROUP_CODE_DELIMITER);
    let txn_date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").map_err(|_| {
        ReconError::Validation(anyhow!(
            "group code '{}' does not start with a YYYY-MM-DD date",
            code
        ))
    })?;

    let len = fields.len();
    let channel = fields[len - 1];
    let source_txn_id = fields[len - 2];
    let goal_id = fields[len - 3];
    let account_id = fields[3..len - 3].join(GROUP_CODE_DELIMITER);

    for (label, value) in [
        ("account", account_id.as_str()),
        ("goal", goal_id),
        ("source transaction id", source_txn_id),
        ("channel", channel),
    ] {
        if value.is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "group code '{}' has an empty {} field",
                code,
                label
            )));
        }
    }

    Ok(GroupCodeParts {
        txn_date,
        account_id,
        goal_id: goal_id.to_string(),
        source_txn_id: source_txn_id.to_string(),
        channel: channel.to_string(),
    })
}

/// Aggregate postings into goal transaction groups, preserving first-seen
/// order of group codes.
///
/// Postings under one code must agree on goal, source transaction id, kind
/// and date. A group with conflicting members is dropped whole and reported,
/// since its net amount could not be trusted.
pub fn build_groups(
    postings: &[LedgerPosting],
) -> (Vec<GoalTransactionGroup>, Vec<RunError>) {
    let mut order: Vec<&str> = Vec::new();
    let mut members: HashMap<&str, Vec<&LedgerPosting>> = HashMap::new();
    for posting in postings {
        let entry = members.entry(posting.group_code.as_str()).or_default();
        if entry.is_empty() {
            order.push(posting.group_code.as_str());
        }
        entry.push(posting);
    }

    let mut groups = Vec::new();
    let mut errors = Vec::new();

    'codes: for code in order {
        let list = &members[code];
        let first = list[0];
        for posting in &list[1..] {
            if posting.goal_id != first.goal_id
                || posting.source_txn_id != first.source_txn_id
                || posting.kind != first.kind
                || posting.txn_date != first.txn_date
            {
                errors.push(RunError::new(
                    posting.posting_id,
                    format!(
                        "posting disagrees with group {} on goal/source/kind/date; group skipped",
                        code
                    ),
                ));
                continue 'codes;
            }
        }

        let mut net_amount = Decimal::ZERO;
        let mut net_instrument_amounts = InstrumentAmounts::new();
        let mut posting_ids = Vec::with_capacity(list.len());
        for posting in list {
            net_amount += posting.amount;
            net_instrument_amounts.add(posting.instrument, posting.amount);
            posting_ids.push(posting.posting_id);
        }

        groups.push(GoalTransactionGroup {
            group_code: code.to_string(),
            goal_id: first.goal_id.clone(),
            source_txn_id: first.source_txn_id.clone(),
            kind: first.kind,
            txn_date: first.txn_date,
            net_amount,
            net_instrument_amounts,
            posting_ids,
        });
    }

    (groups, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstrumentCode, TransactionKind};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn posting(
        group_code: &str,
        instrument: InstrumentCode,
        amount: Decimal,
    ) -> LedgerPosting {
        LedgerPosting::new(
            "goal-1",
            "src-1",
            TransactionKind::Deposit,
            date(2024, 3, 15),
            amount,
            instrument,
            group_code,
        )
    }

    #[test]
    fn test_generate_and_parse_round_trip() {
        let code = generate_group_code(date(2024, 3, 15), "acct9", "goal1", "srcA", "mobile");
        assert_eq!(code, "2024-03-15-acct9-goal1-srcA-mobile");

        let parts = parse_group_code(&code).unwrap();
        assert_eq!(parts.txn_date, date(2024, 3, 15));
        assert_eq!(parts.account_id, "acct9");
        assert_eq!(parts.goal_id, "goal1");
        assert_eq!(parts.source_txn_id, "srcA");
        assert_eq!(parts.channel, "mobile");
    }

    #[test]
    fn test_dashed_account_ids_survive_round_trip() {
        let code = generate_group_code(date(2024, 1, 2), "acct-uk-92", "g7", "s33", "web");
        let parts = parse_group_code(&code).unwrap();
        assert_eq!(parts.account_id, "acct-uk-92");
        assert_eq!(parts.goal_id, "g7");
        assert_eq!(parts.source_txn_id, "s33");
        assert_eq!(parts.channel, "web");
    }

    #[test]
    fn test_parse_rejects_short_codes() {
        let err = parse_group_code("2024-03-15-acct-goal").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_parse_rejects_bad_dates() {
        let err = parse_group_code("2024-13-99-acct-goal-src-web").unwrap_err();
        assert!(err.is_validation());
        let err = parse_group_code("notadate-x-y-acct-goal-src-web").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_parse_rejects_empty_components() {
        let err = parse_group_code("2024-03-15-acct--src-web").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_build_groups_aggregates_amounts_and_instruments() {
        let code = "2024-03-15-acct-goal-src-web";
        let postings = vec![
            posting(code, InstrumentCode::MoneyMarket, Decimal::from(600)),
            posting(code, InstrumentCode::FixedIncome, Decimal::from(300)),
            posting(code, InstrumentCode::MoneyMarket, Decimal::from(100)),
        ];

        let (groups, errors) = build_groups(&postings);
        assert!(errors.is_empty());
        assert_eq!(groups.len(), 1);

        let group = &groups[0];
        assert_eq!(group.net_amount, Decimal::from(1_000));
        assert_eq!(
            group.net_instrument_amounts.get(InstrumentCode::MoneyMarket),
            Decimal::from(700)
        );
        assert_eq!(
            group.net_instrument_amounts.get(InstrumentCode::FixedIncome),
            Decimal::from(300)
        );
        assert_eq!(group.posting_ids.len(), 3);
        assert_eq!(group.kind, TransactionKind::Deposit);
    }

    #[test]
    fn test_build_groups_preserves_first_seen_order() {
        let postings = vec![
            posting("2024-03-15-acct-goal-srcB-web", InstrumentCode::Equities, Decimal::from(50)),
            posting("2024-03-15-acct-goal-srcA-web", InstrumentCode::Equities, Decimal::from(70)),
            posting("2024-03-15-acct-goal-srcB-web", InstrumentCode::Equities, Decimal::from(25)),
        ];

        let (groups, _) = build_groups(&postings);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_code, "2024-03-15-acct-goal-srcB-web");
        assert_eq!(groups[1].group_code, "2024-03-15-acct-goal-srcA-web");
    }

    #[test]
    fn test_build_groups_drops_inconsistent_groups() {
        let code = "2024-03-15-acct-goal-src-web";
        let good = posting("2024-03-15-acct-goal-other-web", InstrumentCode::Equities, Decimal::from(10));
        let a = posting(code, InstrumentCode::MoneyMarket, Decimal::from(100));
        let mut b = posting(code, InstrumentCode::FixedIncome, Decimal::from(-40));
        b.kind = TransactionKind::Withdrawal;

        let (groups, errors) = build_groups(&[a, b, good]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_code, "2024-03-15-acct-goal-other-web");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("group skipped"));
    }
}
