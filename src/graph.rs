//! Strand-symmetric repeat graph stored in index arenas.
//!
//! Nodes and edges live in growable tables and refer to each other by index.
//! Every edge is created together with its reverse-complement partner and all
//! mutating operations go through methods that edit both strands at once, so
//! callers cannot produce an asymmetric graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sequence::{
    InMemorySequences, SequenceContainer, SequenceError, SequenceId, SequenceSegment,
};

/// Structural errors. Any of these signals a broken graph rather than
/// a property of the read data.
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("edge {0} does not exist")]
    MissingEdge(EdgeId),
    #[error("node {0} does not exist")]
    MissingNode(NodeId),
    #[error("path is disconnected between edges {0} and {1}")]
    DisconnectedPath(EdgeId, EdgeId),
    #[error("path of {0} edges is too short to separate")]
    PathTooShort(usize),
    #[error("path anchored on edge {0} folds onto its own complement")]
    PalindromicPath(EdgeId),
    #[error("anchor edge {0} also occurs inside the separated repeat")]
    AnchorReused(EdgeId),
    #[error("edge {0} and its complement {1} are out of sync")]
    AsymmetricEdge(EdgeId, EdgeId),
    #[error("adjacency lists of node {0} disagree with its edges")]
    BrokenAdjacency(NodeId),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A junction between edges. Carries no sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    complement: NodeId,
    in_edges: Vec<EdgeId>,
    out_edges: Vec<EdgeId>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node standing for this junction on the opposite strand.
    pub fn complement(&self) -> NodeId {
        self.complement
    }

    pub fn in_edges(&self) -> &[EdgeId] {
        &self.in_edges
    }

    pub fn out_edges(&self) -> &[EdgeId] {
        &self.out_edges
    }

    pub fn is_orphan(&self) -> bool {
        self.in_edges.is_empty() && self.out_edges.is_empty()
    }
}

/// A directed sequence interval between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    id: EdgeId,
    source: NodeId,
    target: NodeId,
    complement: EdgeId,
    segment: SequenceSegment,
    multiplicity: u32,
    coverage: u32,
    repetitive: bool,
    resolved: bool,
    evidence: Option<SequenceSegment>,
}

impl Edge {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Reverse-complement partner.
    pub fn complement(&self) -> EdgeId {
        self.complement
    }

    pub fn segment(&self) -> &SequenceSegment {
        &self.segment
    }

    /// Current copy-number estimate, at least 1 for every live edge.
    pub fn multiplicity(&self) -> u32 {
        self.multiplicity
    }

    /// Mean read coverage.
    pub fn coverage(&self) -> u32 {
        self.coverage
    }

    pub fn is_repetitive(&self) -> bool {
        self.repetitive
    }

    /// Set on copies created by a separation during the current pass.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Read segment a resolved copy was built from.
    pub fn evidence(&self) -> Option<&SequenceSegment> {
        self.evidence.as_ref()
    }

    pub fn length(&self) -> usize {
        self.segment.length()
    }

    /// Lower id of the strand pair; used to visit every pair once.
    pub fn is_canonical(&self) -> bool {
        self.id <= self.complement
    }

    /// Non-repetitive single-copy edge usable as an unambiguous anchor.
    pub fn is_unique(&self) -> bool {
        !self.repetitive && self.multiplicity == 1
    }
}

/// An ordered walk through the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GraphPath {
    edges: Vec<EdgeId>,
}

impl GraphPath {
    pub fn new(edges: Vec<EdgeId>) -> Self {
        GraphPath { edges }
    }

    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn first(&self) -> Option<EdgeId> {
        self.edges.first().copied()
    }

    pub fn last(&self) -> Option<EdgeId> {
        self.edges.last().copied()
    }

    /// Edges strictly between the first and the last one.
    pub fn interior(&self) -> &[EdgeId] {
        if self.edges.len() < 2 {
            &[]
        } else {
            &self.edges[1..self.edges.len() - 1]
        }
    }
}

impl From<Vec<EdgeId>> for GraphPath {
    fn from(edges: Vec<EdgeId>) -> Self {
        GraphPath::new(edges)
    }
}

impl fmt::Display for GraphPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for edge in &self.edges {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{}", edge)?;
            first = false;
        }
        Ok(())
    }
}

/// The mutable repeat graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatGraph {
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
    /// Sequences materialised for resolved repeat copies.
    resolved_sequences: InMemorySequences,
}

impl RepeatGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.node(id).ok_or(GraphError::MissingNode(id))
    }

    pub fn get_edge(&self, id: EdgeId) -> Result<&Edge, GraphError> {
        self.edge(id).ok_or(GraphError::MissingEdge(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::MissingNode(id))
    }

    fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge, GraphError> {
        self.edges
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(GraphError::MissingEdge(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().flatten()
    }

    /// One edge per strand pair.
    pub fn canonical_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges().filter(|e| e.is_canonical())
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn edge_count(&self) -> usize {
        self.edges().count()
    }

    pub fn contains_edge(&self, id: EdgeId) -> bool {
        self.edge(id).is_some()
    }

    pub fn complement_edge(&self, id: EdgeId) -> Result<EdgeId, GraphError> {
        Ok(self.get_edge(id)?.complement)
    }

    /// Lower id of the strand pair `id` belongs to.
    pub fn canonical_edge(&self, id: EdgeId) -> Result<EdgeId, GraphError> {
        let complement = self.complement_edge(id)?;
        Ok(id.min(complement))
    }

    pub fn complement_node(&self, id: NodeId) -> Result<NodeId, GraphError> {
        Ok(self.get_node(id)?.complement)
    }

    /// Add a junction together with its opposite-strand twin.
    pub fn add_node_pair(&mut self) -> (NodeId, NodeId) {
        let forward = NodeId(self.nodes.len());
        let reverse = NodeId(self.nodes.len() + 1);
        self.nodes.push(Some(Node {
            id: forward,
            complement: reverse,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
        }));
        self.nodes.push(Some(Node {
            id: reverse,
            complement: forward,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
        }));
        (forward, reverse)
    }

    /// Add an edge `source -> target` and its complement, which runs between the
    /// complements of the two nodes in the opposite direction.
    pub fn add_edge_pair(
        &mut self,
        source: NodeId,
        target: NodeId,
        segment: SequenceSegment,
        multiplicity: u32,
        coverage: u32,
    ) -> Result<(EdgeId, EdgeId), GraphError> {
        let comp_source = self.complement_node(source)?;
        let comp_target = self.complement_node(target)?;
        let forward = EdgeId(self.edges.len());
        let reverse = EdgeId(self.edges.len() + 1);
        let multiplicity = multiplicity.max(1);

        self.edges.push(Some(Edge {
            id: forward,
            source,
            target,
            complement: reverse,
            segment,
            multiplicity,
            coverage,
            repetitive: multiplicity > 1,
            resolved: false,
            evidence: None,
        }));
        self.edges.push(Some(Edge {
            id: reverse,
            source: comp_target,
            target: comp_source,
            complement: forward,
            segment: segment.complement(),
            multiplicity,
            coverage,
            repetitive: multiplicity > 1,
            resolved: false,
            evidence: None,
        }));

        self.node_mut(source)?.out_edges.push(forward);
        self.node_mut(target)?.in_edges.push(forward);
        self.node_mut(comp_target)?.out_edges.push(reverse);
        self.node_mut(comp_source)?.in_edges.push(reverse);
        Ok((forward, reverse))
    }

    /// Apply `update` to an edge and, if distinct, to its complement.
    fn update_pair<F>(&mut self, id: EdgeId, mut update: F) -> Result<(), GraphError>
    where
        F: FnMut(&mut Edge),
    {
        let complement = self.complement_edge(id)?;
        update(self.edge_mut(id)?);
        if complement != id {
            update(self.edge_mut(complement)?);
        }
        Ok(())
    }

    pub fn set_multiplicity(&mut self, id: EdgeId, multiplicity: u32) -> Result<(), GraphError> {
        let multiplicity = multiplicity.max(1);
        self.update_pair(id, |e| e.multiplicity = multiplicity)
    }

    pub fn set_repetitive(&mut self, id: EdgeId, repetitive: bool) -> Result<(), GraphError> {
        self.update_pair(id, |e| e.repetitive = repetitive)
    }

    pub fn set_resolved(&mut self, id: EdgeId, resolved: bool) -> Result<(), GraphError> {
        self.update_pair(id, |e| e.resolved = resolved)
    }

    pub fn set_coverage(&mut self, id: EdgeId, coverage: u32) -> Result<(), GraphError> {
        self.update_pair(id, |e| e.coverage = coverage)
    }

    /// Reset the resolved flag on every edge; returns how many were set.
    pub fn clear_resolved(&mut self) -> usize {
        let mut cleared = 0;
        for edge in self.edges.iter_mut().flatten() {
            if edge.resolved {
                edge.resolved = false;
                cleared += 1;
            }
        }
        cleared
    }

    /// Check that consecutive edges of `path` share a node.
    pub fn validate_path(&self, path: &GraphPath) -> Result<(), GraphError> {
        for window in path.edges().windows(2) {
            let prev = self.get_edge(window[0])?;
            let next = self.get_edge(window[1])?;
            if prev.target != next.source {
                return Err(GraphError::DisconnectedPath(prev.id, next.id));
            }
        }
        if let Some(&only) = path.edges().first() {
            self.get_edge(only)?;
        }
        Ok(())
    }

    /// Like `validate_path`, but as a predicate.
    pub fn is_valid_path(&self, path: &GraphPath) -> bool {
        self.validate_path(path).is_ok()
    }

    /// Total sequence length of the path's edges.
    pub fn path_length(&self, path: &GraphPath) -> Result<usize, GraphError> {
        path.edges()
            .iter()
            .map(|&id| self.get_edge(id).map(Edge::length))
            .sum()
    }

    /// Source node of the first edge and target node of the last one.
    pub fn path_endpoints(&self, path: &GraphPath) -> Result<(NodeId, NodeId), GraphError> {
        match (path.first(), path.last()) {
            (Some(first), Some(last)) => {
                Ok((self.get_edge(first)?.source, self.get_edge(last)?.target))
            }
            _ => Err(GraphError::PathTooShort(0)),
        }
    }

    /// The same walk read along the opposite strand.
    pub fn complement_path(&self, path: &GraphPath) -> Result<GraphPath, GraphError> {
        let edges = path
            .edges()
            .iter()
            .rev()
            .map(|&id| self.complement_edge(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GraphPath::new(edges))
    }

    /// Prepare the resolved-sequence store to hand out ids from `first_free`
    /// upwards so they never collide with assembly sequence ids.
    pub fn reserve_sequence_ids(&mut self, first_free: u32) {
        if self.resolved_sequences.is_empty() && self.resolved_sequences.base() < first_free {
            self.resolved_sequences = InMemorySequences::with_base(first_free);
        }
    }

    /// Store the sequence of a new repeat copy (both strands); returns the forward id.
    pub fn store_sequence(&mut self, name: String, seq: Vec<u8>) -> Result<SequenceId, GraphError> {
        Ok(self.resolved_sequences.add(name, seq)?)
    }

    pub fn resolved_sequences(&self) -> &InMemorySequences {
        &self.resolved_sequences
    }

    /// Bytes of an edge, looked up in the resolved store or in `assembly`.
    pub fn edge_sequence(
        &self,
        id: EdgeId,
        assembly: &dyn SequenceContainer,
    ) -> Result<Vec<u8>, GraphError> {
        let segment = self.get_edge(id)?.segment;
        let bytes = if self.resolved_sequences.contains(segment.seq_id) {
            self.resolved_sequences.fetch_segment(&segment)?
        } else {
            assembly.fetch_segment(&segment)?
        };
        Ok(bytes.to_vec())
    }

    fn retarget(&mut self, id: EdgeId, node: NodeId) -> Result<NodeId, GraphError> {
        let old = self.get_edge(id)?.target;
        self.node_mut(old)?.in_edges.retain(|&e| e != id);
        self.edge_mut(id)?.target = node;
        self.node_mut(node)?.in_edges.push(id);
        Ok(old)
    }

    fn reattach_source(&mut self, id: EdgeId, node: NodeId) -> Result<NodeId, GraphError> {
        let old = self.get_edge(id)?.source;
        self.node_mut(old)?.out_edges.retain(|&e| e != id);
        self.edge_mut(id)?.source = node;
        self.node_mut(node)?.out_edges.push(id);
        Ok(old)
    }

    fn prune_orphan(&mut self, id: NodeId) {
        let orphan = self.node(id).map_or(false, Node::is_orphan);
        if orphan {
            self.nodes[id.0] = None;
        }
    }

    fn drop_edge(&mut self, id: EdgeId) -> Result<(NodeId, NodeId), GraphError> {
        let edge = self.get_edge(id)?;
        let (source, target) = (edge.source, edge.target);
        self.node_mut(source)?.out_edges.retain(|&e| e != id);
        self.node_mut(target)?.in_edges.retain(|&e| e != id);
        self.edges[id.0] = None;
        Ok((source, target))
    }

    /// Delete an edge and its complement, pruning nodes left without edges.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<(), GraphError> {
        let complement = self.complement_edge(id)?;
        let mut touched = Vec::with_capacity(4);
        let (s, t) = self.drop_edge(id)?;
        touched.extend([s, t]);
        if complement != id {
            let (s, t) = self.drop_edge(complement)?;
            touched.extend([s, t]);
        }
        for node in touched {
            self.prune_orphan(node);
        }
        Ok(())
    }

    /// Split one traversal of a repeat off into its own edge.
    ///
    /// `path` is `[left anchor, repeat edges.., right anchor]`. The left
    /// anchor's end and the right anchor's start are moved onto fresh nodes
    /// joined by a new single-copy edge over `new_sequence` (which must already
    /// be stored with `store_sequence`). Every interior edge loses one unit of
    /// multiplicity and the matching share of coverage per occurrence and is
    /// removed at zero. The complementary walk is separated in the same call.
    /// Returns the new forward edge.
    pub fn separate_path(
        &mut self,
        path: &GraphPath,
        read_segment: SequenceSegment,
        new_sequence: SequenceId,
    ) -> Result<EdgeId, GraphError> {
        if path.len() < 3 {
            return Err(GraphError::PathTooShort(path.len()));
        }
        self.validate_path(path)?;

        let left = path.edges()[0];
        let right = path.edges()[path.len() - 1];
        let comp_left = self.complement_edge(left)?;
        let comp_right = self.complement_edge(right)?;
        if left == comp_right {
            return Err(GraphError::PalindromicPath(left));
        }

        // per strand pair: (occurrences in the interior, coverage released)
        let mut released: BTreeMap<EdgeId, (u32, u32)> = BTreeMap::new();
        let mut shares = Vec::with_capacity(path.interior().len());
        for &id in path.interior() {
            let canonical = self.canonical_edge(id)?;
            if canonical == left.min(comp_left) || canonical == right.min(comp_right) {
                return Err(GraphError::AnchorReused(id));
            }
            let edge = self.get_edge(canonical)?;
            let entry = released.entry(canonical).or_insert((0, 0));
            let remaining_mult = edge.multiplicity.saturating_sub(entry.0).max(1);
            let remaining_cov = edge.coverage.saturating_sub(entry.1);
            let share = remaining_cov / remaining_mult;
            entry.0 += 1;
            entry.1 += share;
            shares.push(share);
        }
        let new_coverage = shares.iter().sum::<u32>() / shares.len() as u32;
        let seq_len = self.resolved_sequences.len(new_sequence)?;

        let (left_node, left_node_rc) = self.add_node_pair();
        let (right_node, right_node_rc) = self.add_node_pair();
        let mut junctions = Vec::with_capacity(4);
        junctions.push(self.retarget(left, left_node)?);
        junctions.push(self.reattach_source(right, right_node)?);
        junctions.push(self.retarget(comp_right, right_node_rc)?);
        junctions.push(self.reattach_source(comp_left, left_node_rc)?);

        let (copy, copy_rc) = self.add_edge_pair(
            left_node,
            right_node,
            SequenceSegment::whole(new_sequence, seq_len),
            1,
            new_coverage,
        )?;
        {
            let edge = self.edge_mut(copy)?;
            edge.resolved = true;
            edge.evidence = Some(read_segment);
        }
        {
            let edge = self.edge_mut(copy_rc)?;
            edge.resolved = true;
            edge.evidence = Some(read_segment.complement());
        }

        for (id, (count, coverage)) in released {
            let edge = self.get_edge(id)?;
            let multiplicity = edge.multiplicity.saturating_sub(count);
            if multiplicity == 0 {
                self.remove_edge(id)?;
            } else {
                let coverage = edge.coverage.saturating_sub(coverage);
                self.update_pair(id, |e| {
                    e.multiplicity = multiplicity;
                    e.coverage = coverage;
                })?;
            }
        }

        for node in junctions {
            self.prune_orphan(node);
        }
        Ok(copy)
    }

    /// Verify strand symmetry and adjacency bookkeeping.
    pub fn check_consistency(&self) -> Result<(), GraphError> {
        for edge in self.edges() {
            let comp = self
                .edge(edge.complement)
                .ok_or(GraphError::AsymmetricEdge(edge.id, edge.complement))?;
            let mirrored = comp.complement == edge.id
                && comp.multiplicity == edge.multiplicity
                && comp.repetitive == edge.repetitive
                && comp.resolved == edge.resolved
                && comp.source == self.complement_node(edge.target)?
                && comp.target == self.complement_node(edge.source)?;
            if !mirrored || edge.multiplicity == 0 {
                return Err(GraphError::AsymmetricEdge(edge.id, edge.complement));
            }
            if !self.get_node(edge.source)?.out_edges.contains(&edge.id) {
                return Err(GraphError::BrokenAdjacency(edge.source));
            }
            if !self.get_node(edge.target)?.in_edges.contains(&edge.id) {
                return Err(GraphError::BrokenAdjacency(edge.target));
            }
        }
        for node in self.nodes() {
            let listed: BTreeSet<EdgeId> = node
                .in_edges
                .iter()
                .chain(node.out_edges.iter())
                .copied()
                .collect();
            if listed.iter().any(|&e| !self.contains_edge(e)) {
                return Err(GraphError::BrokenAdjacency(node.id));
            }
        }
        Ok(())
    }
}
