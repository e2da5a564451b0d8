use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::core::types::{RunRequest, SamplingError};

/// One sampled event, optionally with its own sampling interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpec {
    pub name: String,
    #[serde(default)]
    pub frequency: Option<u64>,
}

impl EventSpec {
    pub fn new(name: impl Into<String>, frequency: Option<u64>) -> Self {
        EventSpec {
            name: name.into(),
            frequency,
        }
    }

    /// Parses `name` or `name:frequency`, the form wperf itself accepts.
    pub fn parse(spec: &str) -> Result<Self, SamplingError> {
        let spec = spec.trim();
        match spec.rsplit_once(':') {
            Some((name, frequency)) if !name.is_empty() => {
                let frequency = parse_frequency(frequency).ok_or_else(|| {
                    SamplingError::InvalidSettings(format!("bad frequency in event `{}`", spec))
                })?;
                Ok(EventSpec::new(name, Some(frequency)))
            }
            None if !spec.is_empty() => Ok(EventSpec::new(spec, None)),
            _ => Err(SamplingError::InvalidSettings(format!("bad event `{}`", spec))),
        }
    }

    fn to_arg(&self, default_frequency: Option<u64>) -> String {
        match self.frequency.or(default_frequency) {
            Some(frequency) => format!("{}:{}", self.name, frequency),
            None => self.name.clone(),
        }
    }
}

// wperf prints intervals in hex, so accept that form back
fn parse_frequency(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// A configuration bundle for one sampling run. Usually built from command-line flags, a JSON
/// settings file, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    /// The wperf executable. Default: `wperf`, looked up on `PATH`.
    pub wperf_path: PathBuf,
    /// Events to sample. Ignored for SPE runs.
    pub events: Vec<EventSpec>,
    /// Sampling interval for events that don't carry their own.
    pub frequency: Option<u64>,
    /// The core to sample on.
    pub core: Option<u32>,
    /// How long wperf should record before stopping by itself. Default: until interrupted.
    pub timeout_secs: Option<u64>,
    /// The image being profiled. Required.
    pub pe_file: Option<PathBuf>,
    pub pdb_file: Option<PathBuf>,
    /// Process image name to filter samples on, when it differs from the PE file name.
    pub image_name: Option<String>,
    /// When set, record with the Arm statistical profiling extension using this filter instead
    /// of sampling `events`.
    pub spe_filter: Option<String>,
    /// Ask wperf for per source line hits. Default: `true`.
    pub annotate: bool,
    /// Ask wperf for the disassembly around sampled instructions. Default: `true`.
    pub disassemble: bool,
    /// Bit mask of CPUs wperf itself may run on.
    pub cpu_affinity: Option<u64>,
    /// Take the driver lock away from another wperf process.
    pub force_lock: bool,
    /// Passed through to wperf unchanged, after everything else.
    pub extra_args: Vec<String>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        SamplingSettings {
            wperf_path: PathBuf::from("wperf"),
            events: vec![],
            frequency: None,
            core: None,
            timeout_secs: None,
            pe_file: None,
            pdb_file: None,
            image_name: None,
            spe_filter: None,
            annotate: true,
            disassemble: true,
            cpu_affinity: None,
            force_lock: false,
            extra_args: vec![],
        }
    }
}

impl SamplingSettings {
    /// Loads settings from a JSON file. Fields missing from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, SamplingError> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            SamplingError::InvalidSettings(format!("{}: {}", path.display(), e))
        })
    }

    pub fn is_spe(&self) -> bool {
        self.spe_filter.is_some()
    }

    pub fn validate(&self) -> Result<(), SamplingError> {
        let invalid = |reason: &str| Err(SamplingError::InvalidSettings(reason.to_string()));

        if self.wperf_path.as_os_str().is_empty() {
            return invalid("no wperf executable given");
        }
        if self.events.is_empty() && !self.is_spe() {
            return invalid("no events to sample");
        }
        if self.pe_file.is_none() {
            return invalid("no PE file given");
        }
        if self.frequency == Some(0) || self.events.iter().any(|e| e.frequency == Some(0)) {
            return invalid("sampling frequency must be greater than zero");
        }
        if self.cpu_affinity == Some(0) {
            return invalid("CPU affinity mask selects no CPUs");
        }
        Ok(())
    }

    /// The `-e` argument: a comma separated event list, or the SPE pseudo event.
    pub fn event_list(&self) -> String {
        match &self.spe_filter {
            Some(filter) => format!("arm_spe_0/{}/", filter),
            None => self
                .events
                .iter()
                .map(|e| e.to_arg(self.frequency))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Validates the settings and builds the wperf command line for them.
    pub fn to_run_request(&self) -> Result<RunRequest, SamplingError> {
        self.validate()?;
        if self.is_spe() && !self.events.is_empty() {
            warn!("Recording with SPE, ignoring {} configured events", self.events.len());
        }

        let mut args = vec!["record".to_string(), "-e".to_string(), self.event_list()];
        if let Some(core) = self.core {
            args.push("-c".to_string());
            args.push(core.to_string());
        }
        if let Some(timeout) = self.timeout_secs {
            args.push("--timeout".to_string());
            args.push(timeout.to_string());
        }
        if let Some(pe_file) = &self.pe_file {
            args.push("--pe_file".to_string());
            args.push(pe_file.display().to_string());
        }
        if let Some(pdb_file) = &self.pdb_file {
            args.push("--pdb_file".to_string());
            args.push(pdb_file.display().to_string());
        }
        if let Some(image_name) = &self.image_name {
            args.push("--image_name".to_string());
            args.push(image_name.clone());
        }
        if self.annotate {
            args.push("--annotate".to_string());
        }
        if self.disassemble {
            args.push("--disassemble".to_string());
        }
        args.push("--json".to_string());
        args.extend(self.extra_args.iter().cloned());

        let mut request = RunRequest::new(self.wperf_path.clone(), args);
        request.cpu_affinity = self.cpu_affinity;
        request.force_lock = self.force_lock;
        Ok(request)
    }

    /// A short description of a run for display, e.g. `ld_spec:100000 @ 2026-10-17 12:00:00`.
    /// SPE runs are named after their feature instead of the event list.
    pub fn label(&self, feature_name: Option<&str>, at: DateTime<Local>) -> String {
        let what = match feature_name {
            Some(feature) => feature.to_string(),
            None => self.event_list(),
        };
        format!("{} @ {}", what, at.format("%Y-%m-%d %H:%M:%S"))
    }
}
