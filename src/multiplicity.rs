//! Copy-number estimation for repeat graph edges.

use std::collections::HashSet;

use crate::graph::{Edge, EdgeId, RepeatGraph};

/// A copy-number estimate for one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplicityEstimate {
    /// Best guess of the genomic copy number (at least 1).
    pub multiplicity: u32,
    /// False when the estimate cannot be trusted; such edges are treated as repeats.
    pub confident: bool,
}

impl MultiplicityEstimate {
    pub fn new(multiplicity: u32, confident: bool) -> Self {
        MultiplicityEstimate {
            multiplicity: multiplicity.max(1),
            confident,
        }
    }

    /// Whether the edge must be handled as a repeat.
    pub fn is_repetitive(&self) -> bool {
        self.multiplicity > 1 || !self.confident
    }
}

/// Source of per-edge copy-number estimates.
pub trait MultiplicityInferer: Send + Sync {
    fn estimate(&self, graph: &RepeatGraph, edge: EdgeId) -> MultiplicityEstimate;
}

/// Trusts the multiplicity stored on each edge, except for edges explicitly
/// marked unreliable.
#[derive(Debug, Clone, Default)]
pub struct RecordedMultiplicity {
    unreliable: HashSet<EdgeId>,
}

impl RecordedMultiplicity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag an edge (either strand) as having an untrustworthy estimate.
    pub fn mark_unreliable(&mut self, edge: EdgeId) {
        self.unreliable.insert(edge);
    }

    pub fn with_unreliable<I: IntoIterator<Item = EdgeId>>(edges: I) -> Self {
        RecordedMultiplicity {
            unreliable: edges.into_iter().collect(),
        }
    }
}

impl MultiplicityInferer for RecordedMultiplicity {
    fn estimate(&self, graph: &RepeatGraph, edge: EdgeId) -> MultiplicityEstimate {
        let Some(e) = graph.edge(edge) else {
            return MultiplicityEstimate::new(1, false);
        };
        let confident =
            !self.unreliable.contains(&edge) && !self.unreliable.contains(&e.complement());
        MultiplicityEstimate::new(e.multiplicity(), confident)
    }
}

/// Estimates copy number as edge coverage divided by single-copy coverage.
#[derive(Debug, Clone, Copy)]
pub struct CoverageMultiplicity {
    /// Mean read coverage of a single-copy region.
    pub unique_coverage: u32,
    /// Maximum distance between the coverage ratio and the rounded copy
    /// number for the estimate to count as confident.
    pub tolerance: f64,
    /// Edges covered below this are never trusted.
    pub min_coverage: u32,
}

impl Default for CoverageMultiplicity {
    fn default() -> Self {
        Self {
            unique_coverage: 0,
            tolerance: 0.35,
            min_coverage: 1,
        }
    }
}

impl CoverageMultiplicity {
    pub fn new(unique_coverage: u32) -> Self {
        Self {
            unique_coverage,
            ..Self::default()
        }
    }

    /// Build with single-copy coverage estimated from the graph.
    pub fn from_graph(graph: &RepeatGraph) -> Self {
        Self::new(estimate_unique_coverage(graph))
    }
}

impl MultiplicityInferer for CoverageMultiplicity {
    fn estimate(&self, graph: &RepeatGraph, edge: EdgeId) -> MultiplicityEstimate {
        let Some(e) = graph.edge(edge) else {
            return MultiplicityEstimate::new(1, false);
        };
        if self.unique_coverage == 0 {
            return MultiplicityEstimate::new(e.multiplicity(), false);
        }
        let ratio = e.coverage() as f64 / self.unique_coverage as f64;
        let multiplicity = ratio.round().max(1.0) as u32;
        let confident =
            e.coverage() >= self.min_coverage && (ratio - multiplicity as f64).abs() <= self.tolerance;
        MultiplicityEstimate::new(multiplicity, confident)
    }
}

/// Length-weighted median coverage over all edges, taken as the coverage of
/// a single genomic copy. Returns 0 for an empty graph.
pub fn estimate_unique_coverage(graph: &RepeatGraph) -> u32 {
    let mut weighted: Vec<(u32, usize)> = graph
        .canonical_edges()
        .filter(|e| e.length() > 0)
        .map(|e: &Edge| (e.coverage(), e.length()))
        .collect();
    if weighted.is_empty() {
        return 0;
    }
    weighted.sort_unstable();
    let total: usize = weighted.iter().map(|&(_, len)| len).sum();
    let mut seen = 0;
    for (coverage, len) in weighted {
        seen += len;
        if seen * 2 >= total {
            return coverage;
        }
    }
    0
}
