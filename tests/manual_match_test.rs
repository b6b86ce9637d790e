//! Integration tests for manual match creation, removal and candidates.

mod common;

use common::{date, dec, deposit_posting, deposit_record, posting, spawn_engine};
use recon_engine::models::{MatchType, ReconciliationStatus, TransactionKind};
use recon_engine::repository::ReconRepository;
use recon_engine::services::grouping::generate_group_code;
use uuid::Uuid;

fn code_for(goal: &str, source: &str, day: u32) -> String {
    generate_group_code(date(2025, 3, day), "acct-001", goal, source, "ach")
}

#[tokio::test]
async fn create_requires_records_groups_and_actor() {
    let app = spawn_engine();

    let err = app
        .engine
        .create_manual_match(&[], &["x".to_string()], "ops")
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = app
        .engine
        .create_manual_match(&[Uuid::new_v4()], &[], "ops")
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = app
        .engine
        .create_manual_match(&[Uuid::new_v4()], &["x".to_string()], "  ")
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn create_rejects_unknown_records_and_groups() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(5_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;
    app.repo
        .insert_posting(deposit_posting("goal1", "lsrc", date(2025, 3, 10), dec(5_000)))
        .await;
    let code = code_for("goal1", "lsrc", 10);

    let ghost = Uuid::new_v4();
    let err = app
        .engine
        .create_manual_match(&[record_id, ghost], &[code.clone()], "ops")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains(&ghost.to_string()));

    let err = app
        .engine
        .create_manual_match(&[record_id], &["2025-03-10-acct-goal1-ghost-ach".to_string()], "ops")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn create_enforces_the_tolerance_band() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(10_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;
    app.repo
        .insert_posting(deposit_posting("goal1", "lsrc", date(2025, 3, 10), dec(8_000)))
        .await;
    let code = code_for("goal1", "lsrc", 10);

    // 2,000 apart against a band of 1% of 10,000.
    let err = app
        .engine
        .create_manual_match(&[record_id], &[code], "ops")
        .await
        .unwrap_err();
    assert!(err.is_consistency());

    // A rejected create leaves the record exactly as it was.
    let stored = app.repo.bank_record(record_id).await.unwrap().unwrap();
    assert!(stored.match_ref.is_none());
    assert!(stored.matched_at.is_none());
    assert!(stored.match_score.is_none());
    assert_eq!(stored.status, ReconciliationStatus::Unmatched);
}

#[tokio::test]
async fn create_accepts_totals_inside_the_band_and_persists() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(10_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;
    app.repo
        .insert_posting(deposit_posting("goal1", "lsrc", date(2025, 3, 12), dec(9_950)))
        .await;
    let code = code_for("goal1", "lsrc", 12);

    let result = app
        .engine
        .create_manual_match(&[record_id], &[code.clone()], "ops@example.com")
        .await
        .unwrap();

    assert_eq!(result.match_type, MatchType::Manual);
    assert_eq!(result.bank_total, dec(10_000));
    assert_eq!(result.group_total, dec(9_950));
    assert_eq!(result.match_score, 100);

    let stored = app.repo.bank_record(record_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ReconciliationStatus::Matched);
    let match_ref = stored.match_ref.unwrap();
    assert!(match_ref.is_manual());
    assert_eq!(match_ref.group_codes, vec![code]);
    assert_eq!(match_ref.matched_by.as_deref(), Some("ops@example.com"));
}

#[tokio::test]
async fn create_rejects_records_already_manually_matched() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(5_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;
    app.repo
        .insert_posting(deposit_posting("goal1", "lsrc", date(2025, 3, 10), dec(5_000)))
        .await;
    app.repo
        .insert_posting(deposit_posting("goal1", "other", date(2025, 3, 11), dec(5_000)))
        .await;

    app.engine
        .create_manual_match(&[record_id], &[code_for("goal1", "lsrc", 10)], "ops")
        .await
        .unwrap();

    let err = app
        .engine
        .create_manual_match(&[record_id], &[code_for("goal1", "other", 11)], "ops")
        .await
        .unwrap_err();
    assert!(err.is_consistency());
}

#[tokio::test]
async fn create_rejects_matches_spanning_goals() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(5_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;
    app.repo
        .insert_posting(deposit_posting("goal2", "lsrc", date(2025, 3, 10), dec(5_000)))
        .await;

    let err = app
        .engine
        .create_manual_match(&[record_id], &[code_for("goal2", "lsrc", 10)], "ops")
        .await
        .unwrap_err();
    assert!(err.is_consistency());
}

#[tokio::test]
async fn remove_by_record_id_reverts_to_unmatched() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(5_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;
    app.repo
        .insert_posting(deposit_posting("goal1", "lsrc", date(2025, 3, 10), dec(5_000)))
        .await;
    app.engine
        .create_manual_match(&[record_id], &[code_for("goal1", "lsrc", 10)], "ops")
        .await
        .unwrap();

    let cleared = app
        .engine
        .remove_manual_match(&[record_id], &[])
        .await
        .unwrap();
    assert_eq!(cleared, 1);

    let stored = app.repo.bank_record(record_id).await.unwrap().unwrap();
    assert!(stored.match_ref.is_none());
    assert!(stored.matched_at.is_none());
    assert!(stored.match_score.is_none());
    assert_eq!(stored.status, ReconciliationStatus::Unmatched);
}

#[tokio::test]
async fn remove_by_group_code_clears_the_whole_bundle() {
    let app = spawn_engine();
    let a = deposit_record("goal1", "srca", date(2025, 3, 10), dec(3_000));
    let b = deposit_record("goal1", "srcb", date(2025, 3, 10), dec(2_000));
    let (a_id, b_id) = (a.record_id, b.record_id);
    app.repo.insert_bank_record(a).await;
    app.repo.insert_bank_record(b).await;
    app.repo
        .insert_posting(deposit_posting("goal1", "lsrc", date(2025, 3, 10), dec(5_000)))
        .await;
    let code = code_for("goal1", "lsrc", 10);
    app.engine
        .create_manual_match(&[a_id, b_id], &[code.clone()], "ops")
        .await
        .unwrap();

    let cleared = app.engine.remove_manual_match(&[], &[code]).await.unwrap();
    assert_eq!(cleared, 2);

    for id in [a_id, b_id] {
        let stored = app.repo.bank_record(id).await.unwrap().unwrap();
        assert!(stored.match_ref.is_none());
    }
}

#[tokio::test]
async fn remove_skips_records_without_a_manual_match() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(5_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;

    let cleared = app
        .engine
        .remove_manual_match(&[record_id], &[])
        .await
        .unwrap();
    assert_eq!(cleared, 0);

    let err = app.engine.remove_manual_match(&[], &[]).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn candidates_rank_by_amount_gap_and_exclude_claimed() {
    let app = spawn_engine();
    let record = deposit_record("goal1", "banksrc", date(2025, 3, 15), dec(5_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;

    app.repo
        .insert_posting(deposit_posting("goal1", "exact", date(2025, 3, 15), dec(5_000)))
        .await;
    app.repo
        .insert_posting(deposit_posting("goal1", "close", date(2025, 3, 14), dec(5_050)))
        .await;
    app.repo
        .insert_posting(deposit_posting("goal1", "far", date(2025, 3, 16), dec(7_000)))
        .await;
    // Wrong kind: never a candidate for a deposit.
    app.repo
        .insert_posting(posting(
            "goal1",
            "outflow",
            TransactionKind::Withdrawal,
            date(2025, 3, 15),
            dec(-5_000),
        ))
        .await;
    // Outside the seven-day window.
    app.repo
        .insert_posting(deposit_posting("goal1", "late", date(2025, 3, 30), dec(5_000)))
        .await;
    // Claimed by another record's manual match.
    let other = deposit_record("goal1", "othersrc", date(2025, 3, 15), dec(5_000));
    let other_id = other.record_id;
    app.repo.insert_bank_record(other).await;
    app.repo
        .insert_posting(deposit_posting("goal1", "claimed", date(2025, 3, 15), dec(5_000)))
        .await;
    app.engine
        .create_manual_match(&[other_id], &[code_for("goal1", "claimed", 15)], "ops")
        .await
        .unwrap();

    let candidates = app.engine.match_candidates(record_id, None).await.unwrap();

    let sources: Vec<&str> = candidates
        .iter()
        .map(|c| c.group.source_txn_id.as_str())
        .collect();
    assert_eq!(sources, vec!["exact", "close", "far"]);
    assert_eq!(candidates[0].amount_gap, dec(0));
    assert_eq!(candidates[1].amount_gap, dec(50));
    assert_eq!(candidates[1].days_apart, 1);
}

#[tokio::test]
async fn candidates_validate_input() {
    let app = spawn_engine();

    let err = app
        .engine
        .match_candidates(Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let record = deposit_record("goal1", "src1", date(2025, 3, 10), dec(5_000));
    let record_id = record.record_id;
    app.repo.insert_bank_record(record).await;
    let err = app
        .engine
        .match_candidates(record_id, Some(-1))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}
