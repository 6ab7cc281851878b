// pattern.rs — Closed-form index patterns and their detection
//
// An index pattern maps a loop iteration to an integer (an array position,
// a key, a compressed slot). Detection is a service: the generator hands it
// an ordered sequence (dense) or a sparse map keyed by local iteration and
// gets back either a pattern or `None`, in which case the caller must fall
// back to literal code or a lookup table.
//
// Preconditions: detected sequences are non-empty.
// Postconditions: a detected pattern reproduces every input point exactly.
// Failure modes: none (absence of a pattern is a normal answer).
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

// ── Pattern value ───────────────────────────────────────────────────────────

/// A detected closed-form rule `iteration → value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPattern {
    /// `value = slope * iteration + offset`. A slope of zero is a constant.
    Linear { slope: i64, offset: i64 },
}

impl IndexPattern {
    pub fn constant(value: usize) -> Self {
        IndexPattern::Linear {
            slope: 0,
            offset: value as i64,
        }
    }

    /// Evaluate the pattern at `iteration`.
    pub fn evaluate(&self, iteration: usize) -> i64 {
        match self {
            IndexPattern::Linear { slope, offset } => slope * iteration as i64 + offset,
        }
    }

    /// Render the pattern as a C expression over the iteration variable `var`.
    ///
    /// Negative slopes are written as `offset - k * var` so that unsigned
    /// arithmetic in the generated code never goes through a negative
    /// intermediate.
    pub fn to_c(&self, var: &str) -> String {
        let IndexPattern::Linear { slope, offset } = *self;
        let mut s = String::new();
        if slope == 0 {
            write!(s, "{}", offset).unwrap();
            return s;
        }
        if slope < 0 {
            if slope == -1 {
                write!(s, "{} - {}", offset, var).unwrap();
            } else {
                write!(s, "{} - {} * {}", offset, -slope, var).unwrap();
            }
            return s;
        }
        if slope == 1 {
            s.push_str(var);
        } else {
            write!(s, "{} * {}", slope, var).unwrap();
        }
        if offset > 0 {
            write!(s, " + {}", offset).unwrap();
        } else if offset < 0 {
            write!(s, " - {}", -offset).unwrap();
        }
        s
    }
}

// ── Detection service ───────────────────────────────────────────────────────

/// Detects closed-form patterns in integer sequences.
pub trait PatternDetector {
    /// Detect a pattern over a sparse map `local iteration → value`.
    fn detect_map(&self, points: &BTreeMap<usize, usize>) -> Option<IndexPattern>;

    /// Detect a pattern over a dense sequence indexed from zero.
    fn detect(&self, values: &[usize]) -> Option<IndexPattern> {
        let points: BTreeMap<usize, usize> = values.iter().copied().enumerate().collect();
        self.detect_map(&points)
    }
}

/// Detects affine rules with an integer slope.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffineDetector;

impl PatternDetector for AffineDetector {
    fn detect_map(&self, points: &BTreeMap<usize, usize>) -> Option<IndexPattern> {
        let mut it = points.iter();
        let (&x0, &y0) = it.next()?;
        let Some((&x1, &y1)) = it.next() else {
            return Some(IndexPattern::constant(y0));
        };

        let dx = x1 as i64 - x0 as i64;
        let dy = y1 as i64 - y0 as i64;
        if dy % dx != 0 {
            return None;
        }
        let slope = dy / dx;
        let offset = y0 as i64 - slope * x0 as i64;
        let pattern = IndexPattern::Linear { slope, offset };

        if points
            .iter()
            .all(|(&x, &y)| pattern.evaluate(x) == y as i64)
        {
            Some(pattern)
        } else {
            None
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
