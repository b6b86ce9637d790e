//! Reconciliation engine facade.
//!
//! One `ReconciliationEngine` owns the repository handle, the tolerance
//! policy and the workflow services, and exposes the operations callers
//! drive: the matching run, manual overrides, reversal links, operator
//! review, the resolution sweep and the goal summary.

use anyhow::anyhow;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::ReconError;
use crate::models::{
    BankRecord, DateRange, GoalTransactionGroup, LedgerPosting, MatchAnnotations,
    MatchReference, MatchResult, MatchRunOutcome, MatchRunStats, MatchType,
    ReconciliationStatus, ReconciliationSummary, ReviewAnnotations, ReviewTag, RunError,
    SweepOutcome,
};
use crate::repository::ReconRepository;
use crate::services::grouping::{build_groups, parse_group_code};
use crate::services::manual::{ManualOverrideRegistry, MatchCandidate};
use crate::services::matching::run_matching_passes;
use crate::services::metrics::{self, OPERATION_DURATION};
use crate::services::reversal::ReversalLinker;
use crate::services::sweep::ResolutionSweep;
use crate::services::tolerance::TolerancePolicy;
use crate::services::variance::{
    classify_match, missing_in_bank_variance, missing_in_ledger_variance, resolve_status,
};

pub struct ReconciliationEngine {
    repo: Arc<dyn ReconRepository>,
    policy: TolerancePolicy,
    manual: ManualOverrideRegistry,
    reversal: ReversalLinker,
    sweep: ResolutionSweep,
    // One async mutex per goal keeps concurrent matching runs for the same
    // goal from claiming the same records twice.
    goal_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ReconciliationEngine {
    pub fn new(repo: Arc<dyn ReconRepository>, config: EngineConfig) -> Self {
        let policy = TolerancePolicy::new(config.tolerance);
        Self {
            manual: ManualOverrideRegistry::new(Arc::clone(&repo), policy.clone()),
            reversal: ReversalLinker::new(Arc::clone(&repo)),
            sweep: ResolutionSweep::new(Arc::clone(&repo), policy.clone(), config.sweep),
            repo,
            policy,
            goal_locks: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Matching run
    // ========================================================================

    /// Run the full matching pipeline for one goal over `range`: load and
    /// validate both sides, group the ledger postings, run the matching
    /// passes, classify variances, persist the results and flag whatever is
    /// left unmatched.
    ///
    /// Per-record failures are collected into the outcome's error list; the
    /// run itself only fails when a side cannot be loaded at all.
    #[instrument(skip(self), fields(goal_id = %goal_id))]
    pub async fn match_goal(
        &self,
        goal_id: &str,
        range: DateRange,
    ) -> Result<MatchRunOutcome, ReconError> {
        if goal_id.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "goal id must not be empty"
            )));
        }
        if range.start > range.end {
            return Err(ReconError::Validation(anyhow!(
                "date range starts {} after it ends {}",
                range.start,
                range.end
            )));
        }

        let lock = self.goal_lock(goal_id);
        let _guard = lock.lock().await;

        let timer = OPERATION_DURATION
            .with_label_values(&["match_goal"])
            .start_timer();

        let mut errors: Vec<RunError> = Vec::new();

        let mut records = self.repo.bank_records_for_goal(goal_id, &range).await?;
        records.retain(|record| match record.validate() {
            Ok(()) => true,
            Err(err) => {
                metrics::record_error("invalid_bank_record");
                errors.push(RunError::new(record.record_id, err.to_string()));
                false
            }
        });
        records.sort_by(|a, b| (a.txn_date, a.record_id).cmp(&(b.txn_date, b.record_id)));

        let mut postings = self.repo.postings_for_goal(goal_id, &range).await?;
        postings.retain(|posting| {
            let checked = posting
                .validate()
                .and_then(|()| parse_group_code(&posting.group_code).map(|_| ()));
            match checked {
                Ok(()) => true,
                Err(err) => {
                    metrics::record_error("invalid_posting");
                    errors.push(RunError::new(posting.posting_id, err.to_string()));
                    false
                }
            }
        });
        postings.sort_by(|a, b| (a.txn_date, a.posting_id).cmp(&(b.txn_date, b.posting_id)));

        let (mut groups, group_errors) = build_groups(&postings);
        errors.extend(group_errors);
        // Group order decides pass preference between same-date candidates;
        // sorting by code keeps it stable across reloads.
        groups.sort_by(|a, b| (a.txn_date, &a.group_code).cmp(&(b.txn_date, &b.group_code)));

        let mut stats = MatchRunStats {
            bank_records_seen: records.len(),
            postings_seen: postings.len(),
            groups_seen: groups.len(),
            ..MatchRunStats::default()
        };

        let pass = run_matching_passes(&records, &groups, &self.policy);

        let record_index: HashMap<Uuid, &BankRecord> =
            records.iter().map(|r| (r.record_id, r)).collect();
        let group_index: HashMap<&str, &GoalTransactionGroup> =
            groups.iter().map(|g| (g.group_code.as_str(), g)).collect();
        let posting_index: HashMap<Uuid, &LedgerPosting> =
            postings.iter().map(|p| (p.posting_id, p)).collect();

        let mut matches: Vec<MatchResult> = Vec::with_capacity(pass.matches.len());
        for result in pass.matches {
            let result = self
                .finish_match(result, &record_index, &group_index, &mut stats, &mut errors)
                .await;
            matches.push(result);
        }

        self.flag_unmatched_records(
            &pass.unmatched_bank_records,
            &record_index,
            &mut stats,
            &mut errors,
        )
        .await;
        self.flag_unmatched_groups(
            &pass.unmatched_groups,
            &group_index,
            &posting_index,
            &mut stats,
            &mut errors,
        )
        .await;

        let run_status = if errors.is_empty() {
            "completed"
        } else {
            "completed_with_errors"
        };
        metrics::record_match_run(run_status);
        timer.observe_duration();

        info!(
            goal_id,
            matches = matches.len(),
            unmatched_records = pass.unmatched_bank_records.len(),
            unmatched_groups = pass.unmatched_groups.len(),
            errors = errors.len(),
            "Matching run finished"
        );

        Ok(MatchRunOutcome {
            goal_id: goal_id.to_string(),
            range,
            matches,
            unmatched_bank_records: pass.unmatched_bank_records,
            unmatched_groups: pass.unmatched_groups,
            stats,
            errors,
        })
    }

    /// Classify, count and persist one pass result. Manual matches are
    /// already persisted and keep their stored classification.
    async fn finish_match(
        &self,
        mut result: MatchResult,
        record_index: &HashMap<Uuid, &BankRecord>,
        group_index: &HashMap<&str, &GoalTransactionGroup>,
        stats: &mut MatchRunStats,
        errors: &mut Vec<RunError>,
    ) -> MatchResult {
        if result.match_type != MatchType::Manual {
            let bank_side: Vec<&BankRecord> = result
                .bank_record_ids
                .iter()
                .filter_map(|id| record_index.get(id).copied())
                .collect();
            let group_side: Vec<&GoalTransactionGroup> = result
                .group_codes
                .iter()
                .filter_map(|code| group_index.get(code.as_str()).copied())
                .collect();

            if !bank_side.is_empty() && !group_side.is_empty() {
                result.variances = classify_match(&bank_side, &group_side, &self.policy);
                let resolution = resolve_status(&result.variances);
                result.status = resolution.status;
                result.match_score = self.policy.match_score(&result.variances);
            }

            let annotations = MatchAnnotations {
                match_ref: MatchReference::algorithmic(
                    result.match_type,
                    result.group_codes.clone(),
                ),
                matched_at: Utc::now(),
                match_score: result.match_score,
                status: result.status,
            };
            for record_id in &result.bank_record_ids {
                if let Err(err) = self
                    .repo
                    .save_match_annotations(*record_id, &annotations)
                    .await
                {
                    metrics::record_error("persist_match");
                    errors.push(RunError::new(*record_id, err.to_string()));
                }
            }
        }

        stats.count_match(result.match_type);
        metrics::record_match(result.match_type.as_str());
        for variance in &result.variances {
            stats.count_variance(variance.severity);
            metrics::record_variance(variance.kind.as_str(), variance.severity.as_str());
        }
        result
    }

    /// Flag bank records no pass claimed as missing in ledger. Records an
    /// operator already resolved, reversal-linked or tagged keep their
    /// annotations.
    async fn flag_unmatched_records(
        &self,
        record_ids: &[Uuid],
        record_index: &HashMap<Uuid, &BankRecord>,
        stats: &mut MatchRunStats,
        errors: &mut Vec<RunError>,
    ) {
        for record_id in record_ids {
            let Some(record) = record_index.get(record_id) else {
                continue;
            };
            if record.variance_resolved || record.reversal_partner_id.is_some() {
                continue;
            }

            let variance = missing_in_ledger_variance(record);
            stats.count_variance(variance.severity);
            metrics::record_variance(variance.kind.as_str(), variance.severity.as_str());

            if record.review_tag.is_some() {
                continue;
            }
            if let Err(err) = self
                .repo
                .save_bank_status(*record_id, ReconciliationStatus::MissingInLedger)
                .await
            {
                metrics::record_error("persist_flag");
                errors.push(RunError::new(*record_id, err.to_string()));
                continue;
            }
            let review = ReviewAnnotations {
                tag: ReviewTag::MissingInLedger,
                notes: Some(variance.description.clone()),
                reviewed_by: None,
                reviewed_at: Utc::now(),
            };
            if let Err(err) = self.repo.save_bank_review(*record_id, &review).await {
                metrics::record_error("persist_flag");
                errors.push(RunError::new(*record_id, err.to_string()));
            }
        }
    }

    /// Flag every posting of an unclaimed group as missing in bank, skipping
    /// postings already resolved or tagged.
    async fn flag_unmatched_groups(
        &self,
        group_codes: &[String],
        group_index: &HashMap<&str, &GoalTransactionGroup>,
        posting_index: &HashMap<Uuid, &LedgerPosting>,
        stats: &mut MatchRunStats,
        errors: &mut Vec<RunError>,
    ) {
        for code in group_codes {
            let Some(group) = group_index.get(code.as_str()) else {
                continue;
            };

            let variance = missing_in_bank_variance(group);
            stats.count_variance(variance.severity);
            metrics::record_variance(variance.kind.as_str(), variance.severity.as_str());

            let review = ReviewAnnotations {
                tag: ReviewTag::MissingInBank,
                notes: Some(variance.description.clone()),
                reviewed_by: None,
                reviewed_at: Utc::now(),
            };
            for posting_id in &group.posting_ids {
                if let Some(posting) = posting_index.get(posting_id) {
                    if posting.variance_resolved || posting.review_tag.is_some() {
                        continue;
                    }
                }
                if let Err(err) = self.repo.save_posting_review(*posting_id, &review).await {
                    metrics::record_error("persist_flag");
                    errors.push(RunError::new(*posting_id, err.to_string()));
                }
            }
        }
    }

    fn goal_lock(&self, goal_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .goal_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            locks
                .entry(goal_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    // ========================================================================
    // Manual overrides
    // ========================================================================

    /// Bind bank records and ledger groups into a manual match on an
    /// operator's authority.
    pub async fn create_manual_match(
        &self,
        bank_record_ids: &[Uuid],
        group_codes: &[String],
        actor: &str,
    ) -> Result<MatchResult, ReconError> {
        self.manual.create(bank_record_ids, group_codes, actor).await
    }

    /// Undo manual matches by record id or referenced group code. Returns
    /// how many records were reverted to unmatched.
    pub async fn remove_manual_match(
        &self,
        bank_record_ids: &[Uuid],
        group_codes: &[String],
    ) -> Result<usize, ReconError> {
        self.manual.remove(bank_record_ids, group_codes).await
    }

    /// Unclaimed same-kind ledger groups near a bank record, closest amount
    /// first, for an operator picking a manual match.
    pub async fn match_candidates(
        &self,
        bank_record_id: Uuid,
        window_days: Option<i64>,
    ) -> Result<Vec<MatchCandidate>, ReconError> {
        self.manual.candidates(bank_record_id, window_days).await
    }

    // ========================================================================
    // Reversal links
    // ========================================================================

    /// Unlinked records that exactly negate the given one.
    pub async fn find_reversal_candidates(
        &self,
        bank_record_id: Uuid,
        range: Option<&DateRange>,
    ) -> Result<Vec<BankRecord>, ReconError> {
        self.reversal.find_candidates(bank_record_id, range).await
    }

    /// Mark two records as mutual reversals so neither is flagged missing.
    pub async fn link_reversal(
        &self,
        record_id_a: Uuid,
        record_id_b: Uuid,
        actor: &str,
    ) -> Result<(), ReconError> {
        self.reversal.link(record_id_a, record_id_b, actor).await
    }

    /// Break a reversal link. Returns the former partner's id.
    pub async fn unlink_reversal(&self, bank_record_id: Uuid) -> Result<Uuid, ReconError> {
        self.reversal.unlink(bank_record_id).await
    }

    // ========================================================================
    // Operator review
    // ========================================================================

    /// Apply an operator's review tag and notes to a bank record or ledger
    /// posting, whichever the id names.
    #[instrument(skip(self, notes), fields(target_id = %target_id, tag = %tag.as_str()))]
    pub async fn review_record(
        &self,
        target_id: Uuid,
        tag: ReviewTag,
        notes: Option<String>,
        actor: &str,
    ) -> Result<(), ReconError> {
        if actor.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "reviewer must be identified"
            )));
        }
        let review = ReviewAnnotations {
            tag,
            notes,
            reviewed_by: Some(actor.to_string()),
            reviewed_at: Utc::now(),
        };

        if self.repo.bank_record(target_id).await?.is_some() {
            self.repo.save_bank_review(target_id, &review).await?;
            info!(target_id = %target_id, tag = tag.as_str(), "Bank record reviewed");
            return Ok(());
        }
        if self.repo.posting(target_id).await?.is_some() {
            self.repo.save_posting_review(target_id, &review).await?;
            info!(target_id = %target_id, tag = tag.as_str(), "Ledger posting reviewed");
            return Ok(());
        }

        warn!(target_id = %target_id, "Review target not found");
        Err(ReconError::NotFound(anyhow!(
            "no bank record or ledger posting with id {}",
            target_id
        )))
    }

    // ========================================================================
    // Resolution sweep
    // ========================================================================

    /// Re-examine one chunk of flagged records and resolve those whose
    /// counterpart has since appeared.
    pub async fn run_resolution_sweep(
        &self,
        range: Option<&DateRange>,
    ) -> Result<SweepOutcome, ReconError> {
        self.sweep.run(range).await
    }

    // ========================================================================
    // Summary
    // ========================================================================

    /// Point-in-time reconciliation posture of one goal over `range`.
    #[instrument(skip(self), fields(goal_id = %goal_id))]
    pub async fn goal_summary(
        &self,
        goal_id: &str,
        range: DateRange,
    ) -> Result<ReconciliationSummary, ReconError> {
        if goal_id.trim().is_empty() {
            return Err(ReconError::Validation(anyhow!(
                "goal id must not be empty"
            )));
        }
        if range.start > range.end {
            return Err(ReconError::Validation(anyhow!(
                "date range starts {} after it ends {}",
                range.start,
                range.end
            )));
        }

        let records = self.repo.bank_records_for_goal(goal_id, &range).await?;
        let postings = self.repo.postings_for_goal(goal_id, &range).await?;

        let mut summary = ReconciliationSummary {
            goal_id: goal_id.to_string(),
            range,
            total_bank_records: records.len(),
            unmatched: 0,
            matched: 0,
            auto_approved: 0,
            manual_review: 0,
            missing_in_ledger: 0,
            missing_in_bank: 0,
            flagged_postings: 0,
            by_review_tag: BTreeMap::new(),
            resolved_variances: 0,
        };

        for record in &records {
            match record.status {
                ReconciliationStatus::Unmatched => summary.unmatched += 1,
                ReconciliationStatus::Matched => summary.matched += 1,
                ReconciliationStatus::AutoApproved => summary.auto_approved += 1,
                ReconciliationStatus::ManualReview => summary.manual_review += 1,
                ReconciliationStatus::MissingInLedger => summary.missing_in_ledger += 1,
                ReconciliationStatus::MissingInBank => summary.missing_in_bank += 1,
            }
            if record.variance_resolved {
                summary.resolved_variances += 1;
            } else if let Some(tag) = record.review_tag {
                *summary
                    .by_review_tag
                    .entry(tag.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        let mut missing_groups: HashSet<&str> = HashSet::new();
        for posting in &postings {
            if posting.variance_resolved {
                summary.resolved_variances += 1;
                continue;
            }
            if let Some(tag) = posting.review_tag {
                summary.flagged_postings += 1;
                *summary
                    .by_review_tag
                    .entry(tag.as_str().to_string())
                    .or_insert(0) += 1;
                if tag == ReviewTag::MissingInBank {
                    missing_groups.insert(posting.group_code.as_str());
                }
            }
        }
        summary.missing_in_bank += missing_groups.len();

        Ok(summary)
    }
}
