//! The event sampling document, `wperf record --json`. Its `sampling` body is shared with the SPE
//! document.
use serde_json::Value;

use super::*;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Document {
    pub sampling: Body,
}

impl Schema for Document {
    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    fn into_record(self) -> SamplingRecord {
        self.sampling.into_record(RecordKind::Event)
    }

    fn from_record(record: &SamplingRecord) -> Self {
        Document {
            sampling: Body::from_record(record),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Body {
    #[serde(default)]
    pe_file: String,
    #[serde(default)]
    pdb_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sample_display_row: Option<u64>,
    #[serde(default)]
    samples_generated: u64,
    #[serde(default)]
    samples_dropped: u64,
    #[serde(default)]
    modules: Vec<Module>,
    #[serde(default)]
    modules_info: Vec<ModuleSymbolFiles>,
    #[serde(default)]
    events: Vec<Event>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Module {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModuleSymbolFiles {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pdb_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pe_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    printed_sample_num: Option<u64>,
    #[serde(default)]
    samples: Vec<Sample>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    annotate: Vec<Annotation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sample {
    #[serde(default)]
    overhead: f64,
    count: u64,
    symbol: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Annotation {
    function_name: String,
    #[serde(default)]
    source_code: Vec<SourceLine>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SourceLine {
    filename: String,
    line_number: u64,
    hits: u64,
    #[serde(default)]
    instruction_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    disassembled_line: Option<Disassembly>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Disassembly {
    #[serde(default)]
    disassemble: Vec<DisassembledInstruction>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DisassembledInstruction {
    address: String,
    instruction: String,
}

impl Body {
    pub(crate) fn into_record(self, kind: RecordKind) -> SamplingRecord {
        SamplingRecord {
            kind,
            pe_file: self.pe_file,
            pdb_file: self.pdb_file,
            sample_display_row: self.sample_display_row,
            samples_generated: self.samples_generated,
            samples_dropped: self.samples_dropped,
            modules: self
                .modules
                .into_iter()
                .map(|m| ModuleInfo {
                    name: m.name,
                    address: m.address,
                    path: m.path,
                })
                .collect(),
            module_symbols: self
                .modules_info
                .into_iter()
                .map(|m| ModuleSymbols {
                    name: m.name,
                    pdb_file: m.pdb_file,
                    pe_name: m.pe_name,
                })
                .collect(),
            events: self.events.into_iter().map(Event::into_sampled).collect(),
        }
    }

    pub(crate) fn from_record(record: &SamplingRecord) -> Self {
        Body {
            pe_file: record.pe_file.clone(),
            pdb_file: record.pdb_file.clone(),
            sample_display_row: record.sample_display_row,
            samples_generated: record.samples_generated,
            samples_dropped: record.samples_dropped,
            modules: record
                .modules
                .iter()
                .map(|m| Module {
                    name: m.name.clone(),
                    address: m.address,
                    path: m.path.clone(),
                })
                .collect(),
            modules_info: record
                .module_symbols
                .iter()
                .map(|m| ModuleSymbolFiles {
                    name: m.name.clone(),
                    pdb_file: m.pdb_file.clone(),
                    pe_name: m.pe_name.clone(),
                })
                .collect(),
            events: record.events.iter().map(Event::from_sampled).collect(),
        }
    }
}

impl Event {
    fn into_sampled(self) -> SampledEvent {
        SampledEvent {
            name: self.name,
            frequency: self.interval,
            printed_sample_num: self.printed_sample_num,
            samples: self
                .samples
                .into_iter()
                .map(|s| FunctionHits {
                    symbol: s.symbol,
                    count: s.count,
                    overhead: s.overhead,
                })
                .collect(),
            annotations: self
                .annotate
                .into_iter()
                .map(|a| FunctionSource {
                    function_name: a.function_name,
                    lines: a.source_code.into_iter().map(SourceLine::into_hits).collect(),
                })
                .collect(),
        }
    }

    fn from_sampled(event: &SampledEvent) -> Self {
        Event {
            name: event.name.clone(),
            interval: event.frequency,
            printed_sample_num: event.printed_sample_num,
            samples: event
                .samples
                .iter()
                .map(|s| Sample {
                    overhead: s.overhead,
                    count: s.count,
                    symbol: s.symbol.clone(),
                })
                .collect(),
            annotate: event
                .annotations
                .iter()
                .map(|a| Annotation {
                    function_name: a.function_name.clone(),
                    source_code: a.lines.iter().map(SourceLine::from_hits).collect(),
                })
                .collect(),
        }
    }
}

impl SourceLine {
    fn into_hits(self) -> SourceHits {
        SourceHits {
            filename: self.filename,
            line_number: self.line_number,
            hits: self.hits,
            instruction_address: self.instruction_address,
            disassembly: self
                .disassembled_line
                .map(|d| d.disassemble)
                .unwrap_or_default()
                .into_iter()
                .map(|i| Instruction {
                    address: i.address,
                    text: i.instruction,
                })
                .collect(),
        }
    }

    fn from_hits(hits: &SourceHits) -> Self {
        let disassembled_line = if hits.disassembly.is_empty() {
            None
        } else {
            Some(Disassembly {
                disassemble: hits
                    .disassembly
                    .iter()
                    .map(|i| DisassembledInstruction {
                        address: i.address.clone(),
                        instruction: i.text.clone(),
                    })
                    .collect(),
            })
        };
        SourceLine {
            filename: hits.filename.clone(),
            line_number: hits.line_number,
            hits: hits.hits,
            instruction_address: hits.instruction_address.clone(),
            disassembled_line,
        }
    }
}
