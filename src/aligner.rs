//! Read-to-graph alignments consumed by the resolver.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::{EdgeId, GraphPath, RepeatGraph};
use crate::sequence::{SequenceId, SequenceSegment};

/// One step of a read alignment: the edge and the read interval aligned to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeAlignment {
    pub edge: EdgeId,
    pub read_start: usize,
    pub read_end: usize,
}

impl EdgeAlignment {
    pub fn new(edge: EdgeId, read_start: usize, read_end: usize) -> Self {
        EdgeAlignment {
            edge,
            read_start,
            read_end,
        }
    }
}

/// A read aligned along a walk through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAlignment {
    pub read_id: SequenceId,
    pub read_len: usize,
    pub steps: Vec<EdgeAlignment>,
    pub score: f64,
}

impl GraphAlignment {
    pub fn new(read_id: SequenceId, read_len: usize, steps: Vec<EdgeAlignment>, score: f64) -> Self {
        GraphAlignment {
            read_id,
            read_len,
            steps,
            score,
        }
    }

    /// The walk traversed by the read.
    pub fn path(&self) -> GraphPath {
        GraphPath::new(self.steps.iter().map(|s| s.edge).collect())
    }

    /// Read interval covered by the whole alignment.
    pub fn read_segment(&self) -> SequenceSegment {
        let start = self.steps.first().map_or(0, |s| s.read_start);
        let end = self.steps.last().map_or(0, |s| s.read_end);
        SequenceSegment::new(self.read_id, self.read_len, start, end.max(start))
    }
}

/// Highest-scoring alignment; the earliest one wins ties.
pub fn best_alignment(alignments: Vec<GraphAlignment>) -> Option<GraphAlignment> {
    alignments.into_iter().fold(None, |best, aln| match best {
        Some(b) if b.score >= aln.score => Some(b),
        _ => Some(aln),
    })
}

/// Aligns reads against the current state of the graph.
/// Implementations are queried from several threads at once.
pub trait ReadAligner: Send + Sync {
    /// Candidate alignments of `read`; may be empty.
    fn align(&self, graph: &RepeatGraph, read: SequenceId) -> Vec<GraphAlignment>;
}

/// Serves alignments computed upstream, for reads on either strand.
///
/// Each query re-checks the stored walks against the graph and drops those
/// that no longer exist, e.g. because a separation moved an anchor edge.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedAligner {
    alignments: HashMap<SequenceId, Vec<GraphAlignment>>,
}

impl PrecomputedAligner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, alignment: GraphAlignment) {
        self.alignments
            .entry(alignment.read_id.forward())
            .or_default()
            .push(alignment);
    }

    pub fn num_alignments(&self) -> usize {
        self.alignments.values().map(Vec::len).sum()
    }
}

impl FromIterator<GraphAlignment> for PrecomputedAligner {
    fn from_iter<I: IntoIterator<Item = GraphAlignment>>(iter: I) -> Self {
        let mut aligner = PrecomputedAligner::new();
        for alignment in iter {
            aligner.add(alignment);
        }
        aligner
    }
}

impl ReadAligner for PrecomputedAligner {
    fn align(&self, graph: &RepeatGraph, read: SequenceId) -> Vec<GraphAlignment> {
        self.alignments
            .get(&read.forward())
            .map(|alns| {
                alns.iter()
                    .filter(|aln| !aln.steps.is_empty() && graph.is_valid_path(&aln.path()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(edges: &[usize]) -> Vec<EdgeAlignment> {
        edges
            .iter()
            .enumerate()
            .map(|(i, &e)| EdgeAlignment::new(EdgeId(e), i * 10, i * 10 + 10))
            .collect()
    }

    #[test]
    fn best_alignment_prefers_score_then_order() {
        let a = GraphAlignment::new(SequenceId(0), 100, steps(&[0]), 5.0);
        let b = GraphAlignment::new(SequenceId(0), 100, steps(&[2]), 9.0);
        let c = GraphAlignment::new(SequenceId(0), 100, steps(&[4]), 9.0);
        let best = best_alignment(vec![a, b.clone(), c]).unwrap();
        assert_eq!(best, b);
        assert!(best_alignment(Vec::new()).is_none());
    }

    #[test]
    fn read_segment_spans_all_steps() {
        let aln = GraphAlignment::new(SequenceId(4), 100, steps(&[0, 2, 6]), 1.0);
        let segment = aln.read_segment();
        assert_eq!((segment.start, segment.end), (0, 30));
        assert_eq!(segment.seq_id, SequenceId(4));
        assert_eq!(aln.path().edges(), &[EdgeId(0), EdgeId(2), EdgeId(6)]);
    }

    #[test]
    fn precomputed_aligner_drops_stale_paths() {
        let mut graph = RepeatGraph::new();
        let (n0, _) = graph.add_node_pair();
        let (n1, _) = graph.add_node_pair();
        let (n2, _) = graph.add_node_pair();
        let seg = SequenceSegment::whole(SequenceId(0), 10);
        let (a, _) = graph.add_edge_pair(n0, n1, seg, 1, 10).unwrap();
        let (b, _) = graph.add_edge_pair(n1, n2, seg, 1, 10).unwrap();

        let aligner: PrecomputedAligner = vec![
            GraphAlignment::new(SequenceId(0), 50, steps(&[a.0, b.0]), 2.0),
            GraphAlignment::new(SequenceId(0), 50, steps(&[b.0, a.0]), 3.0),
            GraphAlignment::new(SequenceId(2), 50, steps(&[a.0]), 1.0),
        ]
        .into_iter()
        .collect();
        assert_eq!(aligner.num_alignments(), 3);

        let hits = aligner.align(&graph, SequenceId(0));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path().edges(), &[a, b]);

        graph.remove_edge(b).unwrap();
        assert!(aligner.align(&graph, SequenceId(0)).is_empty());
        assert_eq!(aligner.align(&graph, SequenceId(2)).len(), 1);
        assert!(aligner.align(&graph, SequenceId(8)).is_empty());
        assert_eq!(aligner.align(&graph, SequenceId(3)).len(), 1);
    }
}
