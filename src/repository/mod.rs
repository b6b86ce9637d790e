//! Storage abstraction for reconciliation state.
//!
//! The engine is storage-agnostic: everything it reads or writes goes
//! through [`ReconRepository`]. Implementations are expected to return
//! query results in a stable order (by transaction date, then id) so that
//! matching runs are deterministic for a fixed data set.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ReconError;
use crate::models::{
    BankRecord, DateRange, LedgerPosting, MatchAnnotations, ReconciliationStatus,
    ResolutionAnnotations, ReviewAnnotations, ReviewTag,
};

#[async_trait]
pub trait ReconRepository: Send + Sync {
    // ------------------------------------------------------------------
    // Bank record reads
    // ------------------------------------------------------------------

    async fn bank_record(&self, record_id: Uuid) -> Result<Option<BankRecord>, ReconError>;

    /// Fetch a batch by id. Unknown ids are simply absent from the result;
    /// callers that care compare lengths.
    async fn bank_records_by_ids(
        &self,
        record_ids: &[Uuid],
    ) -> Result<Vec<BankRecord>, ReconError>;

    async fn bank_records_for_goal(
        &self,
        goal_id: &str,
        range: &DateRange,
    ) -> Result<Vec<BankRecord>, ReconError>;

    /// Records of the goal with no match reference, whatever their status.
    async fn unmatched_bank_records_for_goal(
        &self,
        goal_id: &str,
    ) -> Result<Vec<BankRecord>, ReconError>;

    /// Unresolved records carrying one of `tags`, oldest first, at most
    /// `limit` of them. `range` restricts by transaction date when given.
    async fn bank_records_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
        limit: usize,
    ) -> Result<Vec<BankRecord>, ReconError>;

    async fn count_bank_records_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
    ) -> Result<u64, ReconError>;

    /// Records whose persisted manual reference names `group_code`.
    async fn bank_records_referencing_group(
        &self,
        group_code: &str,
    ) -> Result<Vec<BankRecord>, ReconError>;

    /// Every group code referenced by any persisted match on the goal.
    async fn matched_group_codes_for_goal(
        &self,
        goal_id: &str,
    ) -> Result<Vec<String>, ReconError>;

    // ------------------------------------------------------------------
    // Bank record writes
    // ------------------------------------------------------------------

    async fn save_match_annotations(
        &self,
        record_id: Uuid,
        annotations: &MatchAnnotations,
    ) -> Result<(), ReconError>;

    /// Drop match reference, timestamp and score; the record goes back to
    /// unmatched.
    async fn clear_match_annotations(&self, record_id: Uuid) -> Result<(), ReconError>;

    async fn save_bank_status(
        &self,
        record_id: Uuid,
        status: ReconciliationStatus,
    ) -> Result<(), ReconError>;

    async fn save_bank_review(
        &self,
        record_id: Uuid,
        review: &ReviewAnnotations,
    ) -> Result<(), ReconError>;

    async fn save_bank_resolution(
        &self,
        record_id: Uuid,
        resolution: &ResolutionAnnotations,
    ) -> Result<(), ReconError>;

    /// Set or clear the reversal pairing marker.
    async fn save_reversal_marker(
        &self,
        record_id: Uuid,
        partner_id: Option<Uuid>,
    ) -> Result<(), ReconError>;

    // ------------------------------------------------------------------
    // Ledger posting reads
    // ------------------------------------------------------------------

    async fn posting(&self, posting_id: Uuid) -> Result<Option<LedgerPosting>, ReconError>;

    async fn postings_for_goal(
        &self,
        goal_id: &str,
        range: &DateRange,
    ) -> Result<Vec<LedgerPosting>, ReconError>;

    async fn postings_by_group_codes(
        &self,
        group_codes: &[String],
    ) -> Result<Vec<LedgerPosting>, ReconError>;

    /// Unresolved postings carrying one of `tags`, oldest first, at most
    /// `limit` of them.
    async fn postings_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
        limit: usize,
    ) -> Result<Vec<LedgerPosting>, ReconError>;

    async fn count_postings_by_tags(
        &self,
        tags: &[ReviewTag],
        range: Option<&DateRange>,
    ) -> Result<u64, ReconError>;

    // ------------------------------------------------------------------
    // Ledger posting writes
    // ------------------------------------------------------------------

    async fn save_posting_review(
        &self,
        posting_id: Uuid,
        review: &ReviewAnnotations,
    ) -> Result<(), ReconError>;

    async fn save_posting_resolution(
        &self,
        posting_id: Uuid,
        resolution: &ResolutionAnnotations,
    ) -> Result<(), ReconError>;
}
