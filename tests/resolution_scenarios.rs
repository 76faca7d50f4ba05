//! Integration tests for iterative repeat resolution.
//!
//! These tests verify that:
//! 1. Bridged repeats are unzipped and flanks stay connected
//! 2. Conflicting walks are deferred and the loop reaches a fixpoint
//! 3. Partial or unanchored evidence leaves repeats intact
//! 4. Both strands stay mirrored and copy numbers are conserved

use repeat_resolver::{
    unresolved_repeats, CoverageMultiplicity, EdgeAlignment, EdgeId, GraphAlignment, GraphPath,
    InMemorySequences, MultiplicityInferer, NodeId, PrecomputedAligner, RecordedMultiplicity,
    RepeatGraph, RepeatResolver, ResolutionSummary, ResolveError, ResolverConfig,
    SequenceContainer, SequenceId, SequenceSegment,
};

/// Graph, sequences and read evidence for one test case.
struct Scenario {
    graph: RepeatGraph,
    assembly: InMemorySequences,
    reads: InMemorySequences,
    aligner: PrecomputedAligner,
    nodes: Vec<NodeId>,
}

impl Scenario {
    fn new(node_pairs: usize) -> Self {
        let mut graph = RepeatGraph::new();
        let nodes = (0..node_pairs).map(|_| graph.add_node_pair().0).collect();
        Scenario {
            graph,
            assembly: InMemorySequences::new(),
            reads: InMemorySequences::new(),
            aligner: PrecomputedAligner::new(),
            nodes,
        }
    }

    fn edge(&mut self, from: usize, to: usize, len: usize, multiplicity: u32) -> EdgeId {
        let name = format!("e{}", self.assembly.num_sequences() / 2);
        let id = self.assembly.add(name, pattern(len, 0)).unwrap();
        let (edge, _) = self
            .graph
            .add_edge_pair(
                self.nodes[from],
                self.nodes[to],
                SequenceSegment::whole(id, len),
                multiplicity,
                30 * multiplicity,
            )
            .unwrap();
        edge
    }

    fn add_read(&mut self, len: usize) -> SequenceId {
        let n = self.reads.num_sequences() / 2;
        self.reads
            .add(format!("read{}", n), pattern(len, n + 1))
            .unwrap()
    }

    /// A read aligned end to end along `path` on the given strand of the read.
    fn read_along(&mut self, path: &[EdgeId], read_strand_forward: bool) -> SequenceId {
        let lens: Vec<usize> = path
            .iter()
            .map(|&e| self.graph.get_edge(e).unwrap().length())
            .collect();
        let total = lens.iter().sum();
        let forward = self.add_read(total);
        let read_id = if read_strand_forward { forward } else { forward.rc() };
        let mut pos = 0;
        let steps = path
            .iter()
            .zip(&lens)
            .map(|(&e, &len)| {
                let step = EdgeAlignment::new(e, pos, pos + len);
                pos += len;
                step
            })
            .collect();
        self.aligner
            .add(GraphAlignment::new(read_id, total, steps, total as f64));
        forward
    }

    fn reads_along(&mut self, n: usize, path: &[EdgeId]) -> Vec<SequenceId> {
        (0..n).map(|_| self.read_along(path, true)).collect()
    }

    fn resolve(&mut self, inferer: &dyn MultiplicityInferer, config: ResolverConfig) -> ResolutionSummary {
        self.try_resolve(inferer, config).unwrap()
    }

    fn try_resolve(
        &mut self,
        inferer: &dyn MultiplicityInferer,
        config: ResolverConfig,
    ) -> Result<ResolutionSummary, ResolveError> {
        RepeatResolver::new(&mut self.graph, &self.assembly, &self.reads, &self.aligner, inferer)
            .with_config(config)
            .resolve_repeats()
    }

    /// The single edge leaving the end of `edge`.
    fn successor(&self, edge: EdgeId) -> EdgeId {
        let node = self.graph.get_edge(edge).unwrap().target();
        let out = self.graph.get_node(node).unwrap().out_edges();
        assert_eq!(out.len(), 1, "{} should have one successor", edge);
        out[0]
    }
}

/// Deterministic non-periodic DNA.
fn pattern(len: usize, salt: usize) -> Vec<u8> {
    const BASES: &[u8; 4] = b"ACGT";
    (0..len)
        .map(|i| BASES[(i * 7 + i / 3 + salt * 5) % 4])
        .collect()
}

struct TwoEntries {
    s: Scenario,
    a: EdgeId,
    c: EdgeId,
    r: EdgeId,
    b: EdgeId,
    d: EdgeId,
}

/// a, c -> R -> b, d; `a` is the longest flank.
fn two_entries(repeat_multiplicity: u32) -> TwoEntries {
    let mut s = Scenario::new(6);
    let a = s.edge(0, 1, 300, 1);
    let c = s.edge(4, 1, 100, 1);
    let r = s.edge(1, 2, 50, repeat_multiplicity);
    let b = s.edge(2, 3, 100, 1);
    let d = s.edge(2, 5, 100, 1);
    TwoEntries { s, a, c, r, b, d }
}

fn all_consistent(graph: &RepeatGraph) {
    graph.check_consistency().unwrap();
    for edge in graph.edges() {
        let comp = graph.get_edge(edge.complement()).unwrap();
        assert_eq!(edge.multiplicity(), comp.multiplicity());
        assert_eq!(edge.is_repetitive(), comp.is_repetitive());
        assert_eq!(edge.is_resolved(), comp.is_resolved());
        assert!(edge.multiplicity() >= 1);
    }
}

#[test]
fn two_supported_walks_unzip_a_two_copy_repeat() {
    let mut t = two_entries(2);
    let ab_reads = t.s.reads_along(5, &[t.a, t.r, t.b]);
    t.s.reads_along(3, &[t.c, t.r, t.d]);
    let a_start = t.s.graph.get_edge(t.a).unwrap().source();
    let b_end = t.s.graph.get_edge(t.b).unwrap().target();

    let summary = t.s.resolve(&RecordedMultiplicity::new(), ResolverConfig::default());

    assert!(summary.converged);
    assert_eq!(summary.passes[0].accepted, 2);
    assert_eq!(summary.passes[0].deferred, 0);
    assert_eq!(summary.passes.last().unwrap().accepted, 0);
    assert!(!t.s.graph.contains_edge(t.r));
    assert_eq!(t.s.graph.edge_count(), 12);

    let ab_copy = t.s.successor(t.a);
    let cd_copy = t.s.successor(t.c);
    assert_ne!(ab_copy, cd_copy);
    for copy in [ab_copy, cd_copy] {
        let edge = t.s.graph.get_edge(copy).unwrap();
        assert_eq!(edge.multiplicity(), 1);
        assert!(!edge.is_repetitive());
        assert!(edge.evidence().is_some());
    }

    // flanks still connected through the new copy
    let walk = GraphPath::new(vec![t.a, ab_copy, t.b]);
    assert!(t.s.graph.is_valid_path(&walk));
    assert_eq!(t.s.graph.path_endpoints(&walk).unwrap(), (a_start, b_end));
    assert!(t.s.graph.is_valid_path(&GraphPath::new(vec![t.c, cd_copy, t.d])));

    // the copy carries the first supporting read's sequence between the anchors
    let expected = t.s.reads.fetch(ab_reads[0], 300..350).unwrap().to_vec();
    assert_eq!(t.s.graph.edge_sequence(ab_copy, &t.s.assembly).unwrap(), expected);
    all_consistent(&t.s.graph);
}

#[test]
fn tied_walks_through_single_copy_repeat_reach_fixpoint() {
    let mut t = two_entries(1);
    t.s.reads_along(4, &[t.c, t.r, t.d]);
    t.s.reads_along(4, &[t.a, t.r, t.b]);
    let inferer = RecordedMultiplicity::with_unreliable([t.r]);

    let summary = t.s.resolve(&inferer, ResolverConfig::default());

    assert!(summary.converged);
    assert_eq!(summary.passes.len(), 2);
    assert_eq!(summary.passes[0].accepted, 1);
    assert_eq!(summary.passes[0].deferred, 1);
    assert_eq!(summary.passes[1].accepted, 0);

    // the longer walk won
    let copy = t.s.successor(t.a);
    assert_eq!(t.s.graph.get_edge(copy).unwrap().target(), t.s.graph.get_edge(t.b).unwrap().source());
    assert!(!t.s.graph.contains_edge(t.r));
    let c_end = t.s.graph.get_edge(t.c).unwrap().target();
    assert!(t.s.graph.get_node(c_end).unwrap().out_edges().is_empty());
    all_consistent(&t.s.graph);
}

#[test]
fn partial_reads_leave_repeat_untouched() {
    let mut t = two_entries(2);
    t.s.read_along(&[t.r], true);
    t.s.read_along(&[t.a, t.r], true);
    t.s.read_along(&[t.r, t.d], true);
    let before = t.s.graph.clone();

    let summary = t.s.resolve(&RecordedMultiplicity::new(), ResolverConfig::default());

    assert!(summary.converged);
    assert_eq!(summary.passes.len(), 1);
    assert_eq!(summary.passes[0].reads_aligned, 3);
    assert_eq!(summary.passes[0].connections, 0);
    let repeat = t.s.graph.get_edge(t.r).unwrap();
    assert!(repeat.is_repetitive());
    assert_eq!(repeat.multiplicity(), 2);
    assert_eq!(t.s.graph.edge_count(), before.edge_count());

    let dump = unresolved_repeats(&t.s.graph);
    assert_eq!(dump.len(), 1);
    assert_eq!(dump[0].edge, t.r);
    assert_eq!(dump[0].in_edges, vec![t.a, t.c]);
}

#[test]
fn unreliable_estimate_forces_repeat() {
    let mut t = two_entries(2);
    t.s.reads_along(5, &[t.a, t.r, t.b]);
    t.s.reads_along(3, &[t.c, t.r, t.d]);
    let inferer = RecordedMultiplicity::with_unreliable([t.a]);

    let summary = t.s.resolve(&inferer, ResolverConfig::default());

    // a is no anchor, so only the c-R-d walk was separated
    assert_eq!(summary.passes[0].accepted, 1);
    let a = t.s.graph.get_edge(t.a).unwrap();
    assert_eq!(a.multiplicity(), 1);
    assert!(a.is_repetitive());
    assert_eq!(t.s.graph.get_edge(t.r).unwrap().multiplicity(), 1);
    assert!(t.s.graph.is_valid_path(&GraphPath::new(vec![t.a, t.r, t.b])));
    all_consistent(&t.s.graph);
}

#[test]
fn off_copy_number_coverage_is_not_trusted() {
    let mut s = Scenario::new(4);
    let unique = s.edge(0, 1, 1000, 1);
    let odd = s.edge(2, 3, 100, 1);
    s.graph.set_coverage(odd, 45).unwrap();
    let inferer = CoverageMultiplicity::from_graph(&s.graph);
    assert_eq!(inferer.unique_coverage, 30);

    s.resolve(&inferer, ResolverConfig::default());

    assert!(!s.graph.get_edge(unique).unwrap().is_repetitive());
    let odd = s.graph.get_edge(odd).unwrap();
    assert!(odd.is_repetitive());
    assert_eq!(odd.multiplicity(), 2);
}

#[test]
fn reverse_strand_reads_support_the_same_walk() {
    let mut t = two_entries(2);
    t.s.reads_along(2, &[t.a, t.r, t.b]);
    let comp_walk = t
        .s
        .graph
        .complement_path(&GraphPath::new(vec![t.c, t.r, t.d]))
        .unwrap();
    let reverse_reads: Vec<SequenceId> = (0..2)
        .map(|_| t.s.read_along(comp_walk.edges(), false))
        .collect();

    let summary = t.s.resolve(&RecordedMultiplicity::new(), ResolverConfig::default());
    assert_eq!(summary.passes[0].accepted, 2);

    // the reverse read's interval, seen from the forward strand of the walk
    let cd_copy = t.s.successor(t.c);
    let expected = t.s.reads.fetch(reverse_reads[0], 100..150).unwrap().to_vec();
    assert_eq!(t.s.graph.edge_sequence(cd_copy, &t.s.assembly).unwrap(), expected);

    let comp_copy = t.s.graph.complement_edge(cd_copy).unwrap();
    let evidence = t.s.graph.get_edge(comp_copy).unwrap().evidence().copied().unwrap();
    assert_eq!(evidence.seq_id, reverse_reads[0].rc());
    all_consistent(&t.s.graph);
}

#[test]
fn multiplicity_is_conserved_across_copies() {
    let mut s = Scenario::new(8);
    let a = s.edge(0, 1, 200, 1);
    let c = s.edge(4, 1, 200, 1);
    let e = s.edge(6, 1, 200, 1);
    let r = s.edge(1, 2, 80, 3);
    let b = s.edge(2, 3, 200, 1);
    let d = s.edge(2, 5, 200, 1);
    let f = s.edge(2, 7, 200, 1);
    s.reads_along(3, &[a, r, b]);
    s.reads_along(2, &[c, r, d]);
    s.read_along(&[r], true);

    s.resolve(&RecordedMultiplicity::new(), ResolverConfig::default());

    let copies = s
        .graph
        .canonical_edges()
        .filter(|edge| edge.evidence().is_some())
        .count() as u32;
    let repeat = s.graph.get_edge(r).unwrap();
    assert_eq!(copies, 2);
    assert_eq!(copies + repeat.multiplicity(), 3);
    // the unread entry still runs through the leftover copy
    assert!(s.graph.is_valid_path(&GraphPath::new(vec![e, r, f])));
    all_consistent(&s.graph);
}

#[test]
fn second_run_on_converged_graph_changes_nothing() {
    let mut t = two_entries(2);
    t.s.reads_along(5, &[t.a, t.r, t.b]);
    t.s.reads_along(3, &[t.c, t.r, t.d]);
    let inferer = RecordedMultiplicity::new();

    t.s.resolve(&inferer, ResolverConfig::default());
    let resolved = t.s.graph.clone();
    let again = t.s.resolve(&inferer, ResolverConfig::default());

    assert_eq!(again.total_accepted(), 0);
    assert_eq!(again.passes.len(), 1);
    assert_eq!(t.s.graph, resolved);
}

#[test]
fn iteration_cap_stops_gracefully() {
    let mut t = two_entries(2);
    t.s.reads_along(5, &[t.a, t.r, t.b]);
    t.s.reads_along(3, &[t.c, t.r, t.d]);
    let config = ResolverConfig {
        max_iterations: 1,
        ..ResolverConfig::default()
    };

    let summary = t.s.resolve(&RecordedMultiplicity::new(), config);

    assert!(!summary.converged);
    assert_eq!(summary.passes.len(), 1);
    assert_eq!(summary.total_accepted(), 2);
    assert!(t.s.graph.edges().all(|e| !e.is_resolved()));
    all_consistent(&t.s.graph);
}

#[test]
fn threaded_alignment_matches_sequential() {
    let build = || {
        let mut t = two_entries(2);
        t.s.reads_along(5, &[t.a, t.r, t.b]);
        t.s.reads_along(3, &[t.c, t.r, t.d]);
        t
    };
    let mut sequential = build();
    let mut threaded = build();

    let seq_summary = sequential
        .s
        .resolve(&RecordedMultiplicity::new(), ResolverConfig::default());
    let par_summary = threaded.s.resolve(
        &RecordedMultiplicity::new(),
        ResolverConfig {
            use_threads: true,
            max_workers: 2,
            ..ResolverConfig::default()
        },
    );

    assert_eq!(seq_summary, par_summary);
    assert_eq!(sequential.s.graph, threaded.s.graph);
}

#[test]
fn out_of_range_read_segment_aborts() {
    let mut t = two_entries(2);
    let read = t.s.add_read(200);
    t.s.aligner.add(GraphAlignment::new(
        read,
        1000,
        vec![
            EdgeAlignment::new(t.a, 0, 600),
            EdgeAlignment::new(t.r, 600, 700),
            EdgeAlignment::new(t.b, 700, 800),
        ],
        10.0,
    ));

    let err = t
        .s
        .try_resolve(&RecordedMultiplicity::new(), ResolverConfig::default())
        .unwrap_err();
    assert!(matches!(err, ResolveError::Sequence(_)));
}
