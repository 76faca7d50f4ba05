//! Read evidence for repeat traversals and the policy that picks which
//! traversals to separate in a pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::aligner::GraphAlignment;
use crate::graph::{EdgeId, GraphError, GraphPath, RepeatGraph};
use crate::sequence::SequenceSegment;

/// A walk `anchor, repeat edges.., anchor` demonstrated by one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub path: GraphPath,
    /// Read interval between the two anchors.
    pub read_segment: SequenceSegment,
}

/// Split an alignment into connections between consecutive unique anchors
/// with at least one repetitive edge in between.
///
/// Anchors are live edges with multiplicity 1 that are not repetitive. The
/// read segment runs from the end of the left anchor's alignment to the start
/// of the right anchor's; when the two overlap on the read it is empty.
pub fn connections_from_alignment(graph: &RepeatGraph, alignment: &GraphAlignment) -> Vec<Connection> {
    let mut connections = Vec::new();
    let mut anchor: Option<usize> = None;
    for (i, step) in alignment.steps.iter().enumerate() {
        let Some(edge) = graph.edge(step.edge) else {
            anchor = None;
            continue;
        };
        if !edge.is_unique() {
            continue;
        }
        if let Some(a) = anchor {
            if i - a >= 2 {
                let steps = &alignment.steps[a..=i];
                let start = steps[0].read_end;
                let end = steps[steps.len() - 1].read_start.max(start);
                connections.push(Connection {
                    path: GraphPath::new(steps.iter().map(|s| s.edge).collect()),
                    read_segment: SequenceSegment::new(
                        alignment.read_id,
                        alignment.read_len,
                        start,
                        end,
                    ),
                });
            }
        }
        anchor = Some(i);
    }
    connections
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Every remaining copy of this repeat edge was claimed by stronger evidence.
    MultiplicityExhausted(EdgeId),
    /// The anchor's end was already moved by a stronger connection.
    AnchorTaken(EdgeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientSupport,
    /// The walk folds onto its own reverse complement.
    Palindromic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Deferred(DeferReason),
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Equivalent connections merged into one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// First connection seen for this walk, oriented on the canonical strand.
    pub connection: Connection,
    /// Number of reads that produced the walk on either strand.
    pub support: usize,
    /// Sequence length of the walk.
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub candidate: Candidate,
    pub verdict: Verdict,
}

/// Verdict counts over a plan: (accepted, deferred, rejected).
pub fn tally(decisions: &[Decision]) -> (usize, usize, usize) {
    decisions
        .iter()
        .fold((0, 0, 0), |(a, d, r), decision| match decision.verdict {
            Verdict::Accepted => (a + 1, d, r),
            Verdict::Deferred(_) => (a, d + 1, r),
            Verdict::Rejected(_) => (a, d, r + 1),
        })
}

/// Orders candidates and accepts a conflict-free subset of them.
pub struct ConnectionPlanner<'a> {
    graph: &'a RepeatGraph,
    min_support: usize,
}

impl<'a> ConnectionPlanner<'a> {
    pub fn new(graph: &'a RepeatGraph, min_support: usize) -> Self {
        ConnectionPlanner { graph, min_support }
    }

    /// Merge connections describing the same walk (on either strand).
    pub fn candidates(&self, connections: &[Connection]) -> Result<Vec<Candidate>, GraphError> {
        let mut index: HashMap<GraphPath, usize> = HashMap::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        for conn in connections {
            let comp_path = self.graph.complement_path(&conn.path)?;
            let canonical = if comp_path < conn.path {
                Connection {
                    path: comp_path,
                    read_segment: conn.read_segment.complement(),
                }
            } else {
                conn.clone()
            };
            match index.get(&canonical.path) {
                Some(&i) => candidates[i].support += 1,
                None => {
                    let length = self.graph.path_length(&canonical.path)?;
                    index.insert(canonical.path.clone(), candidates.len());
                    candidates.push(Candidate {
                        connection: canonical,
                        support: 1,
                        length,
                    });
                }
            }
        }
        Ok(candidates)
    }

    /// Decide every candidate.
    ///
    /// Candidates are visited by decreasing support, then decreasing length.
    /// Accepting one consumes a unit of multiplicity per occurrence of each
    /// repeat edge on its walk and claims the inner ends of both anchors;
    /// candidates that find a repeat edge exhausted or an anchor end claimed
    /// are deferred.
    pub fn plan(&self, connections: &[Connection]) -> Result<Vec<Decision>, GraphError> {
        let mut candidates = self.candidates(connections)?;
        candidates.sort_by(|a, b| {
            b.support
                .cmp(&a.support)
                .then(b.length.cmp(&a.length))
                .then_with(|| a.connection.path.cmp(&b.connection.path))
        });

        let mut remaining: HashMap<EdgeId, u32> = HashMap::new();
        // edges whose target end / source end were moved by an accepted candidate
        let mut claimed_ends: HashSet<EdgeId> = HashSet::new();
        let mut claimed_starts: HashSet<EdgeId> = HashSet::new();
        let mut decisions = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let verdict = self.judge(&candidate, &mut remaining, &claimed_ends, &claimed_starts)?;
            if verdict.is_accepted() {
                let path = &candidate.connection.path;
                if let (Some(left), Some(right)) = (path.first(), path.last()) {
                    claimed_ends.insert(left);
                    claimed_starts.insert(right);
                    claimed_starts.insert(self.graph.complement_edge(left)?);
                    claimed_ends.insert(self.graph.complement_edge(right)?);
                }
            }
            decisions.push(Decision { candidate, verdict });
        }
        Ok(decisions)
    }

    fn judge(
        &self,
        candidate: &Candidate,
        remaining: &mut HashMap<EdgeId, u32>,
        claimed_ends: &HashSet<EdgeId>,
        claimed_starts: &HashSet<EdgeId>,
    ) -> Result<Verdict, GraphError> {
        if candidate.support < self.min_support {
            return Ok(Verdict::Rejected(RejectReason::InsufficientSupport));
        }
        let path = &candidate.connection.path;
        let (left, right) = match (path.first(), path.last()) {
            (Some(l), Some(r)) if path.len() >= 3 => (l, r),
            _ => return Ok(Verdict::Rejected(RejectReason::InsufficientSupport)),
        };
        if left == self.graph.complement_edge(right)? {
            return Ok(Verdict::Rejected(RejectReason::Palindromic));
        }

        let mut demand: BTreeMap<EdgeId, u32> = BTreeMap::new();
        for &edge in path.interior() {
            *demand.entry(self.graph.canonical_edge(edge)?).or_insert(0) += 1;
        }
        for (&edge, &needed) in &demand {
            let available = match remaining.get(&edge) {
                Some(&n) => n,
                None => self.graph.get_edge(edge)?.multiplicity(),
            };
            if available < needed {
                return Ok(Verdict::Deferred(DeferReason::MultiplicityExhausted(edge)));
            }
        }

        if claimed_ends.contains(&left) {
            return Ok(Verdict::Deferred(DeferReason::AnchorTaken(left)));
        }
        if claimed_starts.contains(&right) {
            return Ok(Verdict::Deferred(DeferReason::AnchorTaken(right)));
        }

        for (edge, needed) in demand {
            let available = match remaining.get(&edge) {
                Some(&n) => n,
                None => self.graph.get_edge(edge)?.multiplicity(),
            };
            remaining.insert(edge, available - needed);
        }
        Ok(Verdict::Accepted)
    }
}
