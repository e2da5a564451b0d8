//! Reading and writing wperf's JSON sampling output.
//!
//! wperf emits one of two documents: plain event sampling, or sampling with the Arm statistical
//! profiling extension (SPE). Both wrap the same `sampling` object; an SPE document additionally
//! names its feature in a top-level `feature_name` string, and that field alone decides which
//! schema a document is read with. Both are parsed into a single `SamplingRecord`.
//!
//! Files ending in `.gz` are gzip compressed on save and decompressed on load.
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::core::types::SamplingError;

pub(crate) mod event;
pub(crate) mod spe;

/// Which schema a record was read from, and must be written back as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Event,
    Spe { feature_name: String },
}

impl RecordKind {
    pub fn feature_name(&self) -> Option<&str> {
        match self {
            RecordKind::Event => None,
            RecordKind::Spe { feature_name } => Some(feature_name),
        }
    }
}

/// The parsed output of one wperf run.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingRecord {
    pub kind: RecordKind,
    pub pe_file: String,
    pub pdb_file: String,
    /// How many functions per event wperf was asked to print.
    pub sample_display_row: Option<u64>,
    pub samples_generated: u64,
    pub samples_dropped: u64,
    pub modules: Vec<ModuleInfo>,
    pub module_symbols: Vec<ModuleSymbols>,
    /// In the order wperf printed them.
    pub events: Vec<SampledEvent>,
}

/// A module loaded in the profiled process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub address: Option<u64>,
    pub path: Option<String>,
}

/// The symbol files wperf resolved for a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSymbols {
    pub name: String,
    pub pdb_file: Option<String>,
    pub pe_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledEvent {
    pub name: String,
    /// The sampling interval. Absent for SPE.
    pub frequency: Option<u64>,
    pub printed_sample_num: Option<u64>,
    pub samples: Vec<FunctionHits>,
    pub annotations: Vec<FunctionSource>,
}

impl SampledEvent {
    pub fn total_hits(&self) -> u64 {
        self.samples.iter().map(|s| s.count).fold(0, u64::saturating_add)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionHits {
    pub symbol: String,
    pub count: u64,
    /// The percentage wperf computed itself. Kept for export only.
    pub overhead: f64,
}

/// Per source line hits of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSource {
    pub function_name: String,
    pub lines: Vec<SourceHits>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHits {
    pub filename: String,
    pub line_number: u64,
    pub hits: u64,
    /// Hex address of the sampled instruction, without a `0x` prefix.
    pub instruction_address: String,
    pub disassembly: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: String,
    pub text: String,
}

/// A JSON document layout that can be converted to and from a `SamplingRecord`.
pub(crate) trait Schema: Sized {
    fn from_value(value: Value) -> Result<Self, serde_json::Error>;
    fn into_record(self) -> SamplingRecord;
    fn from_record(record: &SamplingRecord) -> Self;
}

/// Parses wperf's JSON output. Fails with `MalformedOutput` unless the whole document is valid.
pub fn parse(text: &str) -> Result<SamplingRecord, SamplingError> {
    let value: Value = serde_json::from_str(text).map_err(|e| SamplingError::malformed(text, e))?;
    let is_spe = match value.as_object() {
        Some(object) => object.contains_key("feature_name"),
        None => return Err(SamplingError::malformed(text, "expected a JSON object")),
    };
    let record = if is_spe {
        spe::Document::from_value(value).map(Schema::into_record)
    } else {
        event::Document::from_value(value).map(Schema::into_record)
    };
    let record = record.map_err(|e| SamplingError::malformed(text, e))?;
    debug!(
        "Parsed {} record with {} events",
        record.kind.feature_name().unwrap_or("event sampling"),
        record.events.len()
    );
    Ok(record)
}

/// Serializes a record with the schema it was read from.
pub fn to_json(record: &SamplingRecord) -> Result<String, SamplingError> {
    let json = match record.kind {
        RecordKind::Event => serde_json::to_string_pretty(&event::Document::from_record(record)),
        RecordKind::Spe { .. } => serde_json::to_string_pretty(&spe::Document::from_record(record)),
    };
    json.map_err(|e| SamplingError::Io(e.into()))
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

pub fn load_from_file(path: &Path) -> Result<SamplingRecord, SamplingError> {
    let file = File::open(path)?;
    let mut text = String::new();
    if is_gzip(path) {
        GzDecoder::new(BufReader::new(file)).read_to_string(&mut text)?;
    } else {
        BufReader::new(file).read_to_string(&mut text)?;
    }
    parse(&text)
}

pub fn save_to_file(record: &SamplingRecord, path: &Path) -> Result<(), SamplingError> {
    save_json(&to_json(record)?, path)
}

/// Writes an already serialized document, such as wperf's own stdout.
pub fn save_json(json: &str, path: &Path) -> Result<(), SamplingError> {
    let file = File::create(path)?;
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(json.as_bytes())?;
        encoder.finish()?;
    } else {
        let mut writer = BufWriter::new(file);
        writer.write_all(json.as_bytes())?;
        writer.flush()?;
    }
    info!("Wrote sampling record to {}", path.display());
    Ok(())
}
