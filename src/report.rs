//! Resolution statistics and the dump of repeats left unresolved.

use serde::Serialize;

use crate::graph::{EdgeId, RepeatGraph};

/// What happened during one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub pass: usize,
    /// Repetitive strand pairs at the start of the pass.
    pub repeats: usize,
    /// Reads with at least one alignment.
    pub reads_aligned: usize,
    pub connections: usize,
    pub accepted: usize,
    pub deferred: usize,
    pub rejected: usize,
    /// Strand pairs removed, either exhausted by separations or unsupported.
    pub removed_edges: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionSummary {
    pub passes: Vec<PassStats>,
    /// False when the iteration cap stopped the loop.
    pub converged: bool,
}

impl ResolutionSummary {
    pub fn total_accepted(&self) -> usize {
        self.passes.iter().map(|p| p.accepted).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.passes.iter().map(|p| p.removed_edges).sum()
    }
}

/// A repeat the resolver could not disambiguate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedRepeat {
    pub edge: EdgeId,
    pub multiplicity: u32,
    pub length: usize,
    pub coverage: u32,
    pub in_edges: Vec<EdgeId>,
    pub out_edges: Vec<EdgeId>,
}

/// Every repetitive strand pair still in the graph, with its neighbours.
pub fn unresolved_repeats(graph: &RepeatGraph) -> Vec<UnresolvedRepeat> {
    graph
        .canonical_edges()
        .filter(|e| e.is_repetitive())
        .map(|e| {
            let in_edges = graph
                .node(e.source())
                .map(|n| n.in_edges().to_vec())
                .unwrap_or_default();
            let out_edges = graph
                .node(e.target())
                .map(|n| n.out_edges().to_vec())
                .unwrap_or_default();
            UnresolvedRepeat {
                edge: e.id(),
                multiplicity: e.multiplicity(),
                length: e.length(),
                coverage: e.coverage(),
                in_edges,
                out_edges,
            }
        })
        .collect()
}
