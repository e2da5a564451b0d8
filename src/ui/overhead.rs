//! Classifies overhead percentages into severities, and severities into colours.

/// Overhead below this is `Low`.
pub const MEDIUM_THRESHOLD: f64 = 33.0;
/// Overhead at or above this is `High`.
pub const HIGH_THRESHOLD: f64 = 66.0;

const SATURATION: f64 = 1.0;
const LIGHTNESS: f64 = 0.5;
const ALPHA: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Buckets an overhead percentage. Anything that isn't a positive number counts as `Low`.
pub fn classify(percentage: f64) -> Severity {
    if percentage.is_nan() || percentage < MEDIUM_THRESHOLD {
        Severity::Low
    } else if percentage < HIGH_THRESHOLD {
        Severity::Medium
    } else {
        Severity::High
    }
}

impl Severity {
    /// Green, yellow and red.
    pub fn hue(self) -> f64 {
        match self {
            Severity::Low => 120.0,
            Severity::Medium => 60.0,
            Severity::High => 0.0,
        }
    }

    pub fn color(self) -> Hsla {
        Hsla {
            hue: self.hue(),
            saturation: SATURATION,
            lightness: LIGHTNESS,
            alpha: ALPHA,
        }
    }

    /// One character marker for plain text output.
    pub fn marker(self) -> char {
        match self {
            Severity::Low => ' ',
            Severity::Medium => '*',
            Severity::High => '!',
        }
    }
}

/// A colour as hue in degrees, and saturation, lightness and alpha in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsla {
    pub hue: f64,
    pub saturation: f64,
    pub lightness: f64,
    pub alpha: f64,
}

impl Hsla {
    pub fn to_rgba8(self) -> [u8; 4] {
        let chroma = (1.0 - (2.0 * self.lightness - 1.0).abs()) * self.saturation;
        let sector = self.hue.rem_euclid(360.0) / 60.0;
        let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
        let (r, g, b) = match sector as u32 {
            0 => (chroma, x, 0.0),
            1 => (x, chroma, 0.0),
            2 => (0.0, chroma, x),
            3 => (0.0, x, chroma),
            4 => (x, 0.0, chroma),
            _ => (chroma, 0.0, x),
        };
        let m = self.lightness - chroma / 2.0;
        let channel = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [channel(r + m), channel(g + m), channel(b + m), channel(self.alpha)]
    }
}
