use std::io::{self, Write};

use terminal_size::{terminal_size, Width};

use crate::tree::SamplingTree;

pub const HEADER: &str = "    hits overhead   name";

/// Options for printing a tree as an indented table.
#[derive(Debug, Clone, Copy, Default)]
pub struct Layout {
    /// Deepest level printed; the root is level 0. Default: everything.
    pub max_depth: Option<usize>,
    /// Lines are cut to this many characters. Default: no limit.
    pub width: Option<usize>,
}

impl Layout {
    /// Full depth, cut to the width of the terminal if there is one.
    pub fn for_terminal() -> Self {
        Layout {
            max_depth: None,
            width: terminal_size().map(|(Width(w), _)| w as usize),
        }
    }
}

pub fn write(tree: &SamplingTree, layout: Layout, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{}", HEADER)?;
    for (id, depth) in tree.walk() {
        if layout.max_depth.map_or(false, |max| depth > max) {
            continue;
        }
        let section = &tree[id];
        let line = format!(
            "{:>8} {:>7.2}% {} {}{}",
            section.hits,
            section.overhead_percentage,
            section.severity().marker(),
            "  ".repeat(depth),
            section.label()
        );
        match layout.width {
            Some(width) => writeln!(w, "{}", line.chars().take(width).collect::<String>())?,
            None => writeln!(w, "{}", line)?,
        }
    }
    Ok(())
}
