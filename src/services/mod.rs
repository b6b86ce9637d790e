//! Services module for the reconciliation engine.

pub mod grouping;
pub mod manual;
pub mod matching;
pub mod metrics;
pub mod reversal;
pub mod sweep;
pub mod tolerance;
pub mod variance;

pub use grouping::{build_groups, generate_group_code, parse_group_code, GroupCodeParts};
pub use manual::{ManualOverrideRegistry, MatchCandidate};
pub use matching::run_matching_passes;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_match, record_match_run,
    record_sweep_resolution, record_variance,
};
pub use reversal::ReversalLinker;
pub use sweep::ResolutionSweep;
pub use tolerance::TolerancePolicy;
pub use variance::{classify_match, resolve_status, StatusResolution};
