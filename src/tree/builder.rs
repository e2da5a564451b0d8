use std::collections::HashMap;
use std::path::Path;

use super::{AssemblyLine, RootInfo, SamplingSection, SamplingTree, SectionId, SectionType};
use crate::storage::{SamplingRecord, SourceHits};

/// What Function and SourceLine overhead is a percentage of. Event overhead is always relative
/// to the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverheadMode {
    /// Hits of the owning event.
    #[default]
    Relative,
    /// Hits of the whole run.
    Absolute,
}

/// Answers whether a source file is available locally.
pub trait FileProbe {
    fn exists(&self, path: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskProbe;

impl FileProbe for DiskProbe {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }
}

/// Turns a `SamplingRecord` into a `SamplingTree`. Building is deterministic: sections keep the
/// order wperf emitted them in.
#[derive(Debug, Clone)]
pub struct SamplingTreeBuilder<P = DiskProbe> {
    mode: OverheadMode,
    probe: P,
}

impl SamplingTreeBuilder {
    pub fn new(mode: OverheadMode) -> Self {
        SamplingTreeBuilder::with_probe(mode, DiskProbe)
    }
}

impl<P: FileProbe> SamplingTreeBuilder<P> {
    pub fn with_probe(mode: OverheadMode, probe: P) -> Self {
        SamplingTreeBuilder { mode, probe }
    }

    pub fn mode(&self) -> OverheadMode {
        self.mode
    }

    pub fn build(&self, record: SamplingRecord) -> SamplingTree {
        let mut arena = Arena::new(&self.probe);

        let root = arena.push(None, SectionType::Root, record.pe_file.clone());
        arena.sections[root.0].root_info = Some(Box::new(RootInfo {
            kind: record.kind.clone(),
            pe_file: record.pe_file.clone(),
            pdb_file: record.pdb_file.clone(),
            samples_generated: record.samples_generated,
            samples_dropped: record.samples_dropped,
            modules: record.modules.clone(),
            module_symbols: record.module_symbols.clone(),
        }));

        for event in &record.events {
            let event_id = arena.push(Some(root), SectionType::Event, event.name.clone());
            arena.sections[event_id.0].frequency = event.frequency;

            let mut functions: HashMap<&str, SectionId> = HashMap::new();
            for sample in &event.samples {
                let function = match functions.get(sample.symbol.as_str()) {
                    Some(&id) => id,
                    None => {
                        let id = arena.push(Some(event_id), SectionType::Function, sample.symbol.clone());
                        functions.insert(&sample.symbol, id);
                        id
                    }
                };
                arena.add_hits(function, sample.count);
                arena.add_hits(event_id, sample.count);
            }

            let mut lines: HashMap<(SectionId, &str, u64), usize> = HashMap::new();
            let mut sampled: Vec<(SectionId, Vec<&str>)> = vec![];
            for annotation in &event.annotations {
                let function = match functions.get(annotation.function_name.as_str()) {
                    Some(&id) => id,
                    None => {
                        debug!(
                            "{}: no samples for annotated function {}, skipping its source lines",
                            event.name, annotation.function_name
                        );
                        continue;
                    }
                };
                for hit in &annotation.lines {
                    let key = (function, hit.filename.as_str(), hit.line_number);
                    let slot = match lines.get(&key) {
                        Some(&slot) => slot,
                        None => {
                            let id = arena.push_source_line(function, hit);
                            sampled.push((id, vec![]));
                            lines.insert(key, sampled.len() - 1);
                            sampled.len() - 1
                        }
                    };
                    let (id, addresses) = &mut sampled[slot];
                    arena.add_source_hits(*id, hit);
                    if !hit.instruction_address.is_empty() {
                        addresses.push(&hit.instruction_address);
                    }
                }
            }

            for (id, addresses) in sampled {
                for line in arena.sections[id.0].assembly.iter_mut() {
                    line.is_highlighted = addresses.iter().any(|a| same_address(a, &line.address));
                }
            }
        }

        let total = arena.sections[root.0]
            .children
            .iter()
            .map(|id| arena.sections[id.0].hits)
            .fold(0, u64::saturating_add);
        arena.sections[root.0].hits = total;

        let mut tree = SamplingTree {
            sections: arena.sections,
            record,
            mode: self.mode,
        };
        self.assign_overhead(&mut tree);
        tree
    }

    fn assign_overhead(&self, tree: &mut SamplingTree) {
        let root_hits = tree[tree.root()].hits;
        for index in 0..tree.sections.len() {
            let id = SectionId(index);
            let denominator = match (tree[id].section_type, self.mode) {
                (SectionType::Root, _) | (SectionType::Event, _) | (_, OverheadMode::Absolute) => root_hits,
                (_, OverheadMode::Relative) => tree.owning_event(id).map_or(0, |event| tree[event].hits),
            };
            let overhead = overhead_percentage(tree[id].hits, denominator);
            if overhead.clamped {
                warn!(
                    "{} has {} hits out of {}, clamping overhead to 100%",
                    tree[id].label(),
                    tree[id].hits,
                    denominator
                );
            }
            tree.sections[index].overhead_percentage = overhead.value;
        }
    }
}

struct Overhead {
    value: f64,
    clamped: bool,
}

fn overhead_percentage(hits: u64, denominator: u64) -> Overhead {
    if denominator == 0 {
        return Overhead {
            value: 0.0,
            clamped: false,
        };
    }
    let value = 100.0 * hits as f64 / denominator as f64;
    Overhead {
        value: value.clamp(0.0, 100.0),
        clamped: value > 100.0,
    }
}

/// Compares instruction addresses as numbers when both are hex, as text otherwise.
fn same_address(a: &str, b: &str) -> bool {
    match (parse_hex(a), parse_hex(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}

fn parse_hex(address: &str) -> Option<u64> {
    let address = address.trim();
    let digits = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    u64::from_str_radix(digits, 16).ok()
}

/// Sections under construction, plus the file probe answers seen so far.
struct Arena<'a, P> {
    sections: Vec<SamplingSection>,
    probe: &'a P,
    probed: HashMap<String, bool>,
}

impl<'a, P: FileProbe> Arena<'a, P> {
    fn new(probe: &'a P) -> Self {
        Arena {
            sections: vec![],
            probe,
            probed: HashMap::new(),
        }
    }

    fn push(&mut self, parent: Option<SectionId>, section_type: SectionType, name: String) -> SectionId {
        let id = SectionId(self.sections.len());
        let mut section = SamplingSection::new(section_type, name, parent);
        if let Some(parent) = parent {
            section.frequency = self.sections[parent.0].frequency;
            self.sections[parent.0].children.push(id);
        }
        self.sections.push(section);
        id
    }

    fn push_source_line(&mut self, function: SectionId, hit: &SourceHits) -> SectionId {
        let id = self.push(Some(function), SectionType::SourceLine, hit.filename.clone());
        let exists = self.file_exists(&hit.filename);
        let section = &mut self.sections[id.0];
        section.line_number = Some(hit.line_number);
        section.file_exists = Some(exists);
        id
    }

    // Counts come straight from wperf's JSON and may add up past u64::MAX
    fn add_hits(&mut self, id: SectionId, hits: u64) {
        let section = &mut self.sections[id.0];
        section.hits = section.hits.saturating_add(hits);
    }

    fn add_source_hits(&mut self, id: SectionId, hit: &SourceHits) {
        self.add_hits(id, hit.hits);
        let section = &mut self.sections[id.0];
        for instruction in &hit.disassembly {
            if section
                .assembly
                .iter()
                .any(|line| same_address(&line.address, &instruction.address))
            {
                continue;
            }
            section.assembly.push(AssemblyLine {
                address: instruction.address.clone(),
                instruction: instruction.text.clone(),
                is_highlighted: false,
            });
        }
    }

    fn file_exists(&mut self, path: &str) -> bool {
        if let Some(&exists) = self.probed.get(path) {
            return exists;
        }
        let exists = self.probe.exists(path);
        if !exists {
            debug!("Source file {} not found", path);
        }
        self.probed.insert(path.to_string(), exists);
        exists
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FunctionHits;
    use crate::test_utils::{event_record, event_tree};
    use std::cell::RefCell;

    #[derive(Default)]
    struct CountingProbe {
        calls: RefCell<HashMap<String, usize>>,
    }

    impl FileProbe for CountingProbe {
        fn exists(&self, path: &str) -> bool {
            *self.calls.borrow_mut().entry(path.to_string()).or_insert(0) += 1;
            path.ends_with("longobject.c")
        }
    }

    fn sections_of(tree: &SamplingTree, section_type: SectionType) -> Vec<SectionId> {
        tree.walk()
            .map(|(id, _)| id)
            .filter(|&id| tree[id].section_type == section_type)
            .collect()
    }

    #[test]
    fn function_hits_add_up_to_event_hits() {
        let tree = event_tree(OverheadMode::Relative);
        let root = tree.root();
        let mut total = 0;
        for &event in tree.children(root) {
            let functions: u64 = tree.children(event).iter().map(|&f| tree[f].hits).sum();
            assert_eq!(functions, tree[event].hits, "{}", tree[event].name);
            total += tree[event].hits;
        }
        assert_eq!(tree[root].hits, total);
        assert_eq!(total, 500);
    }

    #[test]
    fn overhead_is_always_a_percentage() {
        for mode in [OverheadMode::Relative, OverheadMode::Absolute] {
            let tree = event_tree(mode);
            for (id, _) in tree.walk() {
                let overhead = tree[id].overhead_percentage;
                assert!(
                    (0.0..=100.0).contains(&overhead),
                    "{} has overhead {}",
                    tree[id].label(),
                    overhead
                );
            }
        }
    }

    #[test]
    fn overhead_denominator_follows_mode() {
        let relative = event_tree(OverheadMode::Relative);
        let absolute = event_tree(OverheadMode::Absolute);
        let ld_spec = relative.find_event("ld_spec").unwrap();
        let x_mul = relative.find_function(ld_spec, "x_mul").unwrap();

        // Events are always against the root
        assert_eq!(relative[ld_spec].overhead_percentage, 80.0);
        assert_eq!(absolute[ld_spec].overhead_percentage, 80.0);

        assert_eq!(relative[x_mul].overhead_percentage, 62.5);
        assert_eq!(absolute[x_mul].overhead_percentage, 50.0);

        let line = relative.children(x_mul)[0];
        assert_eq!(relative[line].hits, 180);
        assert_eq!(relative[line].overhead_percentage, 45.0);
        assert_eq!(absolute[line].overhead_percentage, 36.0);
    }

    #[test]
    fn repeated_symbols_and_lines_are_merged_in_emission_order() {
        let tree = event_tree(OverheadMode::Relative);
        let vfp_spec = tree.find_event("vfp_spec").unwrap();
        let names: Vec<&str> = tree
            .children(vfp_spec)
            .iter()
            .map(|&id| tree[id].name.as_str())
            .collect();
        assert_eq!(names, vec!["x_mul", "PyObject_Malloc"]);
        assert_eq!(tree[tree.children(vfp_spec)[0]].hits, 60);

        let ld_spec = tree.find_event("ld_spec").unwrap();
        let x_mul = tree.find_function(ld_spec, "x_mul").unwrap();
        let lines: Vec<Option<u64>> = tree
            .children(x_mul)
            .iter()
            .map(|&id| tree[id].line_number)
            .collect();
        assert_eq!(lines, vec![Some(3581), Some(3582)]);
    }

    #[test]
    fn sampled_instructions_are_highlighted() {
        let tree = event_tree(OverheadMode::Relative);
        let ld_spec = tree.find_event("ld_spec").unwrap();
        let x_mul = tree.find_function(ld_spec, "x_mul").unwrap();
        let line = &tree[tree.children(x_mul)[0]];

        let window: Vec<(&str, bool)> = line
            .assembly
            .iter()
            .map(|a| (a.address.as_str(), a.is_highlighted))
            .collect();
        assert_eq!(
            window,
            vec![
                ("7ff6b0ea1bd0", false),
                ("7ff6b0ea1bd4", true),
                ("7ff6b0ea1bd8", true),
                ("7ff6b0ea1bdc", false),
            ]
        );
    }

    #[test]
    fn addresses_compare_numerically() {
        assert!(same_address("0x7FF6B0EA1BD4", "7ff6b0ea1bd4"));
        assert!(same_address("00001000", "0x1000"));
        assert!(!same_address("1000", "1004"));
        assert!(same_address("main+0x4", "main+0x4"));
        assert!(!same_address("main+0x4", "1004"));
    }

    #[test]
    fn zero_hit_event_has_zero_overhead_children() {
        for mode in [OverheadMode::Relative, OverheadMode::Absolute] {
            let tree = event_tree(mode);
            let idle = tree.find_event("br_mis_pred").expect("no zero hit event");
            assert_eq!(tree[idle].hits, 0);
            assert_eq!(tree[idle].overhead_percentage, 0.0);
            let below: Vec<SectionId> = tree.walk_from(idle).skip(1).map(|(id, _)| id).collect();
            assert!(!below.is_empty());
            for id in below {
                assert_eq!(tree[id].overhead_percentage, 0.0, "{}", tree[id].label());
            }
        }
    }

    #[test]
    fn empty_record_builds_a_lone_root() {
        let mut record = event_record();
        record.events.clear();
        let tree = SamplingTreeBuilder::new(OverheadMode::Relative).build(record);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[tree.root()].hits, 0);
        assert_eq!(tree[tree.root()].overhead_percentage, 0.0);
        assert_eq!(tree.root_info().unwrap().samples_dropped, 2);
    }

    #[test]
    fn inconsistent_hits_are_clamped() {
        let mut record = event_record();
        record.events[0].annotations[0].lines[0].hits = 10_000;
        let tree = SamplingTreeBuilder::new(OverheadMode::Relative).build(record);
        let ld_spec = tree.find_event("ld_spec").unwrap();
        let x_mul = tree.find_function(ld_spec, "x_mul").unwrap();
        assert_eq!(tree[tree.children(x_mul)[0]].overhead_percentage, 100.0);
    }

    #[test]
    fn huge_hit_counts_saturate() {
        let mut record = event_record();
        record.events[0].samples = vec![
            FunctionHits {
                symbol: "x_mul".to_string(),
                count: u64::MAX,
                overhead: 100.0,
            },
            FunctionHits {
                symbol: "x_mul".to_string(),
                count: 1,
                overhead: 0.0,
            },
        ];
        record.events[0].annotations[0].lines[0].hits = u64::MAX;
        record.events[0].annotations[0].lines[1].hits = u64::MAX;

        let tree = SamplingTreeBuilder::new(OverheadMode::Relative).build(record);
        let ld_spec = tree.find_event("ld_spec").unwrap();
        let x_mul = tree.find_function(ld_spec, "x_mul").unwrap();
        assert_eq!(tree[x_mul].hits, u64::MAX);
        assert_eq!(tree[ld_spec].hits, u64::MAX);
        assert_eq!(tree[tree.root()].hits, u64::MAX);
        assert_eq!(tree[x_mul].overhead_percentage, 100.0);
        assert!(tree.walk().all(|(id, _)| tree[id].overhead_percentage <= 100.0));
    }

    #[test]
    fn annotations_without_samples_are_skipped() {
        let mut record = event_record();
        let mut ghost = record.events[0].annotations[0].clone();
        ghost.function_name = "ghost".to_string();
        record.events[0].annotations.push(ghost);
        record.events[0].samples.push(FunctionHits {
            symbol: "lonely".to_string(),
            count: 0,
            overhead: 0.0,
        });

        let before = event_tree(OverheadMode::Relative).len();
        let tree = SamplingTreeBuilder::new(OverheadMode::Relative).build(record);
        // Only the zero count function was added
        assert_eq!(tree.len(), before + 1);
    }

    #[test]
    fn files_are_probed_once_per_path() {
        let probe = CountingProbe::default();
        let builder = SamplingTreeBuilder::with_probe(OverheadMode::Relative, probe);
        let tree = builder.build(event_record());

        let calls = builder.probe.calls.borrow();
        assert!(!calls.is_empty());
        assert!(calls.values().all(|&count| count == 1), "{:?}", calls);

        for id in sections_of(&tree, SectionType::SourceLine) {
            let expected = tree[id].name.ends_with("longobject.c");
            assert_eq!(tree[id].file_exists, Some(expected));
        }
        for id in sections_of(&tree, SectionType::Function) {
            assert_eq!(tree[id].file_exists, None);
        }
    }

    #[test]
    fn building_is_deterministic() {
        let builder = SamplingTreeBuilder::new(OverheadMode::Relative);
        assert_eq!(builder.build(event_record()), builder.build(event_record()));
    }

    #[test]
    fn frequency_is_inherited_from_the_event() {
        let tree = event_tree(OverheadMode::Relative);
        for id in sections_of(&tree, SectionType::SourceLine) {
            let event = tree.owning_event(id).unwrap();
            assert_eq!(tree[id].frequency, tree[event].frequency);
        }
    }
}
