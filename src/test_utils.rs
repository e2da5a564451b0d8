use std::path::{Path, PathBuf};

use crate::sampler::{EventSpec, SamplingSettings};
use crate::storage::{self, SamplingRecord};
use crate::tree::{OverheadMode, SamplingTree, SamplingTreeBuilder};

pub const EVENT_RECORD: &str = "wperf-record.json";
pub const SPE_RECORD: &str = "wperf-spe.json";
pub const MALFORMED_RECORD: &str = "wperf-truncated.json";

const TESTDATA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/ci/testdata");

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(TESTDATA).join(name)
}

pub fn read_fixture(name: &str) -> String {
    let path = fixture_path(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("couldn't read {}: {}", path.display(), e))
}

/// The event sampling fixture: ld_spec with 400 hits, vfp_spec with 100 and a br_mis_pred event
/// that was never hit.
pub fn event_record() -> SamplingRecord {
    storage::parse(&read_fixture(EVENT_RECORD)).expect("couldn't parse fixture")
}

pub fn event_tree(mode: OverheadMode) -> SamplingTree {
    SamplingTreeBuilder::new(mode).build(event_record())
}

/// Minimal valid settings for running `wperf`.
pub fn settings_for(wperf: &Path) -> SamplingSettings {
    SamplingSettings {
        wperf_path: wperf.to_path_buf(),
        events: vec![EventSpec::new("ld_spec", Some(100000))],
        pe_file: Some(PathBuf::from("app.exe")),
        ..Default::default()
    }
}

/// Writes an executable shell script standing in for wperf. It ignores its arguments unless
/// `body` looks at them.
#[cfg(unix)]
pub fn fake_wperf(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNT: AtomicUsize = AtomicUsize::new(0);
    let path = dir.join(format!("wperf-{}.sh", COUNT.fetch_add(1, Ordering::SeqCst)));
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("couldn't write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("couldn't make script executable");
    path
}
