//! The sampling result tree: Root, then one Event per sampled event, then Functions, then the
//! SourceLines sampled inside each function.
//!
//! Sections live in one arena owned by the `SamplingTree` and refer to each other by `SectionId`,
//! so the parent links are plain indices and the tree is dropped as a unit. A tree is never
//! modified once built; a new run or load builds a new one.
use std::ops::Index;
use std::path::Path;

use crate::core::types::SamplingError;
use crate::storage::{self, ModuleInfo, ModuleSymbols, RecordKind, SamplingRecord};
use crate::ui::overhead::{self, Severity};

pub mod builder;
pub mod export;

pub use self::builder::{DiskProbe, FileProbe, OverheadMode, SamplingTreeBuilder};

/// Handle to a section of the tree it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionType {
    Root,
    Event,
    Function,
    SourceLine,
}

/// One instruction of the disassembly around a sampled source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyLine {
    pub address: String,
    pub instruction: String,
    /// The instruction was sampled.
    pub is_highlighted: bool,
}

/// Run metadata carried by the root section.
#[derive(Debug, Clone, PartialEq)]
pub struct RootInfo {
    pub kind: RecordKind,
    pub pe_file: String,
    pub pdb_file: String,
    pub samples_generated: u64,
    pub samples_dropped: u64,
    pub modules: Vec<ModuleInfo>,
    pub module_symbols: Vec<ModuleSymbols>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSection {
    pub section_type: SectionType,
    /// PE file, event name, symbol or source file name, depending on the type.
    pub name: String,
    pub hits: u64,
    /// Always within `0..=100`.
    pub overhead_percentage: f64,
    pub line_number: Option<u64>,
    pub assembly: Vec<AssemblyLine>,
    /// Whether the source file was found on disk when the tree was built. Only set on source
    /// lines.
    pub file_exists: Option<bool>,
    /// Sampling interval of the owning event.
    pub frequency: Option<u64>,
    pub root_info: Option<Box<RootInfo>>,
    children: Vec<SectionId>,
    parent: Option<SectionId>,
}

impl SamplingSection {
    fn new(section_type: SectionType, name: String, parent: Option<SectionId>) -> Self {
        SamplingSection {
            section_type,
            name,
            hits: 0,
            overhead_percentage: 0.0,
            line_number: None,
            assembly: vec![],
            file_exists: None,
            frequency: None,
            root_info: None,
            children: vec![],
            parent,
        }
    }

    /// The name to show for the section. Source lines are shown as `file:line`.
    pub fn label(&self) -> String {
        match (self.section_type, self.line_number) {
            (SectionType::SourceLine, Some(line)) => format!("{}:{}", self.name, line),
            _ => self.name.clone(),
        }
    }

    pub fn severity(&self) -> Severity {
        overhead::classify(self.overhead_percentage)
    }
}

/// An immutable, fully built result tree, together with the record it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingTree {
    sections: Vec<SamplingSection>,
    record: SamplingRecord,
    mode: OverheadMode,
}

impl SamplingTree {
    pub fn root(&self) -> SectionId {
        SectionId(0)
    }

    pub fn get(&self, id: SectionId) -> Option<&SamplingSection> {
        self.sections.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn children(&self, id: SectionId) -> &[SectionId] {
        &self[id].children
    }

    pub fn parent(&self, id: SectionId) -> Option<SectionId> {
        self[id].parent
    }

    /// The nearest Event at or above `id`. None for the root.
    pub fn owning_event(&self, id: SectionId) -> Option<SectionId> {
        let mut current = Some(id);
        while let Some(candidate) = current {
            if self[candidate].section_type == SectionType::Event {
                return Some(candidate);
            }
            current = self.parent(candidate);
        }
        None
    }

    pub fn sampling_frequency(&self, id: SectionId) -> Option<u64> {
        self.owning_event(id).and_then(|event| self[event].frequency)
    }

    pub fn find_event(&self, name: &str) -> Option<SectionId> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|&id| self[id].name == name)
    }

    pub fn find_function(&self, event: SectionId, symbol: &str) -> Option<SectionId> {
        self.children(event)
            .iter()
            .copied()
            .find(|&id| self[id].section_type == SectionType::Function && self[id].name == symbol)
    }

    /// Depth-first, parents before children, children in order.
    pub fn walk(&self) -> Walk<'_> {
        self.walk_from(self.root())
    }

    pub fn walk_from(&self, id: SectionId) -> Walk<'_> {
        Walk {
            tree: self,
            stack: vec![(id, 0)],
        }
    }

    pub fn root_info(&self) -> Option<&RootInfo> {
        self[self.root()].root_info.as_deref()
    }

    /// The record this tree was built from.
    pub fn record(&self) -> &SamplingRecord {
        &self.record
    }

    pub fn mode(&self) -> OverheadMode {
        self.mode
    }

    /// Position of an event section among the root's children, which is also its position in
    /// the record.
    fn event_index(&self, event: SectionId) -> Option<usize> {
        self.children(self.root()).iter().position(|&id| id == event)
    }
}

impl Index<SectionId> for SamplingTree {
    type Output = SamplingSection;

    fn index(&self, id: SectionId) -> &SamplingSection {
        &self.sections[id.0]
    }
}

/// Iterator over `(section, depth)` pairs, depth relative to where the walk started.
pub struct Walk<'a> {
    tree: &'a SamplingTree,
    stack: Vec<(SectionId, usize)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (SectionId, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let (id, depth) = self.stack.pop()?;
        for &child in self.tree.children(id).iter().rev() {
            self.stack.push((child, depth + 1));
        }
        Some((id, depth))
    }
}

/// The result a front end is currently showing. Owned by the caller and replaced as a whole; a
/// load that fails leaves the current tree in place.
#[derive(Debug, Default)]
pub struct CurrentResult {
    tree: Option<SamplingTree>,
}

impl CurrentResult {
    pub fn new() -> Self {
        CurrentResult::default()
    }

    pub fn tree(&self) -> Option<&SamplingTree> {
        self.tree.as_ref()
    }

    /// Installs a new tree, returning the previous one.
    pub fn replace(&mut self, tree: SamplingTree) -> Option<SamplingTree> {
        self.tree.replace(tree)
    }

    pub fn clear(&mut self) -> Option<SamplingTree> {
        self.tree.take()
    }

    pub fn load_from_file<P: FileProbe>(
        &mut self,
        path: &Path,
        builder: &SamplingTreeBuilder<P>,
    ) -> Result<&SamplingTree, SamplingError> {
        let record = storage::load_from_file(path)?;
        let tree = self.tree.insert(builder.build(record));
        Ok(tree)
    }

    /// Rebuilds the current tree with a different overhead mode.
    pub fn set_mode(&mut self, mode: OverheadMode) {
        if let Some(tree) = self.tree.as_mut() {
            if tree.mode != mode {
                *tree = SamplingTreeBuilder::new(mode).build(tree.record.clone());
            }
        }
    }

    /// Severity of a section of the current tree.
    pub fn classify_overhead(&self, id: SectionId) -> Option<Severity> {
        self.tree()
            .and_then(|tree| tree.get(id))
            .map(SamplingSection::severity)
    }
}
