//! A front end for the `wperf` sampling profiler.
//!
//! A `SamplingSession` runs wperf as a supervised child process and reports, on a channel, how
//! each run ended. Successful runs carry wperf's JSON output parsed into a `SamplingRecord`,
//! which a `SamplingTreeBuilder` turns into a tree of events, functions and source lines
//! annotated with their share of the samples. Saved results go through the same parser and
//! builder, see `load_from_file`.
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

use std::path::Path;

pub mod core;
pub mod sampler;
pub mod storage;
pub mod tree;
pub mod ui;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::core::output::{OutputLine, StreamKind};
pub use crate::core::process::{ProcessExit, ProcessSupervisor, StopOutcome, DEFAULT_GRACE_PERIOD};
pub use crate::core::types::{Pid, RunOutcome, RunRequest, SamplingError};
pub use crate::sampler::{
    EventSpec, SamplingSession, SamplingSettings, SessionEvent, SessionState, MAX_FORCE_LOCK_RETRIES,
};
pub use crate::storage::{RecordKind, SamplingRecord};
pub use crate::tree::{
    CurrentResult, OverheadMode, SamplingSection, SamplingTree, SamplingTreeBuilder, SectionId, SectionType,
};
pub use crate::ui::overhead::{Hsla, Severity};

/// Loads a saved wperf result, plain or gzipped JSON of either schema, and builds its tree.
pub fn load_from_file(path: &Path, mode: OverheadMode) -> Result<SamplingTree, SamplingError> {
    let record = storage::load_from_file(path)?;
    Ok(SamplingTreeBuilder::new(mode).build(record))
}

/// The severity bucket of an overhead percentage.
pub fn classify_overhead(percentage: f64) -> Severity {
    ui::overhead::classify(percentage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fixture_path, EVENT_RECORD, MALFORMED_RECORD, SPE_RECORD};

    #[test]
    fn loads_either_schema() {
        let event = load_from_file(&fixture_path(EVENT_RECORD), OverheadMode::Relative).unwrap();
        assert_eq!(event.root_info().unwrap().kind, RecordKind::Event);
        let spe = load_from_file(&fixture_path(SPE_RECORD), OverheadMode::Absolute).unwrap();
        assert_eq!(spe.root_info().unwrap().kind.feature_name(), Some("SPE"));
        assert_eq!(spe[spe.root()].hits, 963 + 321 + 128);
    }

    #[test]
    fn malformed_file_is_reported() {
        match load_from_file(&fixture_path(MALFORMED_RECORD), OverheadMode::Relative) {
            Err(SamplingError::MalformedOutput { .. }) => {}
            other => panic!("expected MalformedOutput, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn classify_overhead_uses_fixed_thresholds() {
        assert_eq!(classify_overhead(32.9), Severity::Low);
        assert_eq!(classify_overhead(33.0), Severity::Medium);
        assert_eq!(classify_overhead(65.9), Severity::Medium);
        assert_eq!(classify_overhead(66.0), Severity::High);
        assert_eq!(classify_overhead(150.0), Severity::High);
    }
}
