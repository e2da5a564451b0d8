//! Writes a subtree back out in the schema its record was read with.
//!
//! The export of a section is the record it was built from, cut down to that section: an Event
//! keeps only its event, a Function only its samples and annotations, a SourceLine only its
//! line. Run metadata is always kept, so the file loads like any other wperf output.
use std::path::Path;

use super::{SamplingTree, SectionId, SectionType};
use crate::core::types::SamplingError;
use crate::storage::{self, SampledEvent, SamplingRecord};

pub fn export_record(tree: &SamplingTree, id: SectionId) -> SamplingRecord {
    let mut record = tree.record().clone();
    let section = &tree[id];
    if section.section_type == SectionType::Root {
        return record;
    }

    let event = match tree.owning_event(id).and_then(|event| tree.event_index(event)) {
        Some(index) => record.events.swap_remove(index),
        None => {
            record.events.clear();
            return record;
        }
    };
    let event = match section.section_type {
        SectionType::Root | SectionType::Event => event,
        SectionType::Function => only_function(event, &section.name),
        SectionType::SourceLine => {
            let function = match tree.parent(id) {
                Some(function) => &tree[function].name,
                None => &section.name,
            };
            only_source_line(only_function(event, function), &section.name, section.line_number)
        }
    };
    record.events = vec![event];
    record
}

pub fn export_to_file(tree: &SamplingTree, id: SectionId, path: &Path) -> Result<(), SamplingError> {
    let record = export_record(tree, id);
    storage::save_to_file(&record, path)?;
    info!("Exported {} to {}", tree[id].label(), path.display());
    Ok(())
}

fn only_function(mut event: SampledEvent, symbol: &str) -> SampledEvent {
    event.samples.retain(|sample| sample.symbol == symbol);
    event.annotations.retain(|annotation| annotation.function_name == symbol);
    event
}

fn only_source_line(mut event: SampledEvent, filename: &str, line_number: Option<u64>) -> SampledEvent {
    for annotation in event.annotations.iter_mut() {
        annotation
            .lines
            .retain(|line| line.filename == filename && Some(line.line_number) == line_number);
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{event_tree, read_fixture, SPE_RECORD};
    use crate::tree::{OverheadMode, SamplingTreeBuilder};

    fn summary(tree: &SamplingTree) -> Vec<(String, u64, f64)> {
        tree.walk()
            .map(|(id, _)| (tree[id].label(), tree[id].hits, tree[id].overhead_percentage))
            .collect()
    }

    #[test]
    fn exported_root_rebuilds_to_the_same_tree() {
        let dir = tempfile::tempdir().expect("couldn't create temp dir");
        let builder = SamplingTreeBuilder::new(OverheadMode::Relative);
        let spe_tree = builder.build(storage::parse(&read_fixture(SPE_RECORD)).unwrap());

        for (tree, name) in [(event_tree(OverheadMode::Relative), "event.json"), (spe_tree, "spe.json")] {
            let path = dir.path().join(name);
            export_to_file(&tree, tree.root(), &path).expect("couldn't export");
            let rebuilt = builder.build(storage::load_from_file(&path).expect("couldn't load"));
            assert_eq!(summary(&rebuilt), summary(&tree));
            assert_eq!(rebuilt.root_info(), tree.root_info());
        }
    }

    #[test]
    fn event_export_keeps_only_that_event() {
        let tree = event_tree(OverheadMode::Relative);
        let vfp_spec = tree.find_event("vfp_spec").unwrap();
        let record = export_record(&tree, vfp_spec);
        assert_eq!(record.events.len(), 1);
        assert_eq!(record.events[0].name, "vfp_spec");
        assert_eq!(record.events[0].total_hits(), 100);
        assert_eq!(record.modules, tree.record().modules);
        assert_eq!(record.samples_dropped, tree.record().samples_dropped);
    }

    #[test]
    fn function_export_keeps_merged_samples() {
        let tree = event_tree(OverheadMode::Relative);
        let vfp_spec = tree.find_event("vfp_spec").unwrap();
        let x_mul = tree.find_function(vfp_spec, "x_mul").unwrap();
        let record = export_record(&tree, x_mul);

        let event = &record.events[0];
        assert_eq!(event.name, "vfp_spec");
        assert_eq!(event.samples.len(), 2);
        assert!(event.samples.iter().all(|s| s.symbol == "x_mul"));
        assert_eq!(event.total_hits(), tree[x_mul].hits);
    }

    #[test]
    fn source_line_export_keeps_only_that_line() {
        let tree = event_tree(OverheadMode::Relative);
        let ld_spec = tree.find_event("ld_spec").unwrap();
        let x_mul = tree.find_function(ld_spec, "x_mul").unwrap();
        let line = tree.children(x_mul)[1];
        let record = export_record(&tree, line);

        let event = &record.events[0];
        assert_eq!(event.samples.len(), 1);
        assert_eq!(event.annotations.len(), 1);
        let lines = &event.annotations[0].lines;
        assert_eq!(lines.len(), 1);
        assert_eq!(Some(lines[0].line_number), tree[line].line_number);
        assert_eq!(lines[0].line_number, 3582);
    }
}
