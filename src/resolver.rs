//! Iterative repeat resolution driven by read alignments.
//!
//! Every pass reclassifies edges from the multiplicity estimates, collects the
//! walks that reads take between unique anchors, separates a conflict-free
//! subset of those walks into their own edges and finally prunes repeat edges
//! that no remaining read supports. Passes repeat until nothing is accepted.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::aligner::{best_alignment, GraphAlignment, ReadAligner};
use crate::connection::{connections_from_alignment, tally, Connection, ConnectionPlanner, Verdict};
use crate::graph::{EdgeId, GraphError, GraphPath, RepeatGraph};
use crate::multiplicity::MultiplicityInferer;
use crate::report::{PassStats, ResolutionSummary};
use crate::sequence::{SequenceContainer, SequenceError, SequenceId, SequenceSegment};

/// Errors that abort resolution. Weak or conflicting evidence is never an error.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),
    #[cfg(feature = "parallel")]
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Configuration options that govern repeat resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// Upper bound on resolution passes.
    pub max_iterations: usize,
    /// Reads needed before a walk may be separated.
    pub min_support: usize,
    /// Unconsumed reads a partially resolved repeat edge needs to survive.
    pub min_edge_support: usize,
    /// Align reads on a worker pool.
    pub use_threads: bool,
    /// Desired worker count when threading is enabled.
    pub max_workers: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            min_support: 1,
            min_edge_support: 1,
            use_threads: false,
            max_workers: 1,
        }
    }
}

/// Drives the find, connect, resolve and prune loop over one graph.
pub struct RepeatResolver<'a> {
    graph: &'a mut RepeatGraph,
    assembly: &'a dyn SequenceContainer,
    reads: &'a dyn SequenceContainer,
    aligner: &'a dyn ReadAligner,
    inferer: &'a dyn MultiplicityInferer,
    config: ResolverConfig,
    /// Alignments crossing each repeat strand pair, keyed by canonical edge.
    edge_support: HashMap<EdgeId, usize>,
    /// Reads used up by accepted walks, keyed by canonical edge.
    consumed: HashMap<EdgeId, usize>,
    /// Canonical repeat edges that lost a copy in the current pass.
    decremented: BTreeSet<EdgeId>,
    stats: PassStats,
}

impl<'a> RepeatResolver<'a> {
    pub fn new(
        graph: &'a mut RepeatGraph,
        assembly: &'a dyn SequenceContainer,
        reads: &'a dyn SequenceContainer,
        aligner: &'a dyn ReadAligner,
        inferer: &'a dyn MultiplicityInferer,
    ) -> Self {
        let first_free = assembly
            .sequence_ids()
            .iter()
            .map(|id| id.0.saturating_add(2))
            .max()
            .unwrap_or(0);
        graph.reserve_sequence_ids(first_free);
        RepeatResolver {
            graph,
            assembly,
            reads,
            aligner,
            inferer,
            config: ResolverConfig::default(),
            edge_support: HashMap::new(),
            consumed: HashMap::new(),
            decremented: BTreeSet::new(),
            stats: PassStats::default(),
        }
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn graph(&self) -> &RepeatGraph {
        self.graph
    }

    /// Sequence of a live edge, from the assembly or from a resolved copy.
    pub fn edge_sequence(&self, edge: EdgeId) -> Result<Vec<u8>, ResolveError> {
        Ok(self.graph.edge_sequence(edge, self.assembly)?)
    }

    /// Reset the resolved flag on every edge.
    pub fn clear_resolved_repeats(&mut self) -> usize {
        self.graph.clear_resolved()
    }

    /// Refresh multiplicities and repetitive flags from the inferer.
    /// Returns the number of repetitive strand pairs.
    pub fn find_repeats(&mut self) -> Result<usize, ResolveError> {
        self.clear_resolved_repeats();
        let canonical: Vec<EdgeId> = self.graph.canonical_edges().map(|e| e.id()).collect();
        let mut repeats = 0;
        for id in canonical {
            let estimate = self.inferer.estimate(self.graph, id);
            let repetitive = estimate.is_repetitive();
            self.graph.set_multiplicity(id, estimate.multiplicity)?;
            self.graph.set_repetitive(id, repetitive)?;
            if repetitive {
                repeats += 1;
            }
        }
        debug!("{} repetitive edge pairs", repeats);
        Ok(repeats)
    }

    /// Align every read and split the best alignment of each into connections.
    ///
    /// Also records, per repeat strand pair, how many alignments cross it.
    pub fn get_connections(&mut self) -> Result<Vec<Connection>, ResolveError> {
        #[cfg(not(feature = "parallel"))]
        if self.config.use_threads {
            warn!(
                "Threaded alignment requested, but the 'parallel' feature is not enabled; falling back to sequential mode"
            );
        }

        let read_ids = self.reads.sequence_ids();
        let graph: &RepeatGraph = self.graph;
        let aligner = self.aligner;
        let align_read = |read: &SequenceId| -> Option<GraphAlignment> {
            best_alignment(aligner.align(graph, *read))
        };

        let alignments: Vec<Option<GraphAlignment>> = if self.config.use_threads {
            #[cfg(feature = "parallel")]
            {
                use rayon::ThreadPoolBuilder;
                let pool = ThreadPoolBuilder::new()
                    .num_threads(self.config.max_workers)
                    .build()?;
                pool.install(|| read_ids.par_iter().map(align_read).collect())
            }
            #[cfg(not(feature = "parallel"))]
            {
                read_ids.iter().map(align_read).collect()
            }
        } else {
            read_ids.iter().map(align_read).collect()
        };

        let mut support: HashMap<EdgeId, usize> = HashMap::new();
        let mut connections = Vec::new();
        let mut aligned = 0;
        for alignment in alignments.into_iter().flatten() {
            graph.validate_path(&alignment.path())?;
            aligned += 1;
            let mut crossed = HashSet::new();
            // every step is live: validate_path above checked the whole walk
            for step in &alignment.steps {
                if !graph.get_edge(step.edge)?.is_repetitive() {
                    continue;
                }
                let canonical = graph.canonical_edge(step.edge)?;
                if crossed.insert(canonical) {
                    *support.entry(canonical).or_insert(0) += 1;
                }
            }
            connections.extend(connections_from_alignment(graph, &alignment));
        }

        self.edge_support = support;
        self.stats.reads_aligned = aligned;
        self.stats.connections = connections.len();
        debug!(
            "{} of {} reads aligned, {} connections",
            aligned,
            read_ids.len(),
            connections.len()
        );
        Ok(connections)
    }

    /// Plan the connections and separate every accepted walk.
    /// Returns the number of separations applied.
    pub fn resolve_connections(&mut self, connections: &[Connection]) -> Result<usize, ResolveError> {
        let decisions = ConnectionPlanner::new(self.graph, self.config.min_support).plan(connections)?;
        let (accepted, deferred, rejected) = tally(&decisions);
        self.stats.accepted = accepted;
        self.stats.deferred = deferred;
        self.stats.rejected = rejected;

        for decision in decisions {
            let candidate = decision.candidate;
            debug!(
                "{} support={} length={}: {:?}",
                candidate.connection.path, candidate.support, candidate.length, decision.verdict
            );
            if decision.verdict != Verdict::Accepted {
                continue;
            }
            // support is counted once per read, however often the walk repeats an edge
            let mut crossed = BTreeSet::new();
            for &edge in candidate.connection.path.interior() {
                crossed.insert(self.graph.canonical_edge(edge)?);
            }
            for canonical in crossed {
                *self.consumed.entry(canonical).or_insert(0) += candidate.support;
            }
            self.separate_path(&candidate.connection.path, candidate.connection.read_segment)?;
        }
        Ok(accepted)
    }

    /// Separate one walk, storing the read segment as the new copy's sequence.
    pub fn separate_path(
        &mut self,
        path: &GraphPath,
        read_segment: SequenceSegment,
    ) -> Result<EdgeId, ResolveError> {
        let mut interior = BTreeSet::new();
        for &edge in path.interior() {
            interior.insert(self.graph.canonical_edge(edge)?);
        }

        let sequence = self.reads.fetch_segment(&read_segment)?.to_vec();
        let name = format!(
            "{}:{}-{}",
            self.reads.name(read_segment.seq_id)?,
            read_segment.start,
            read_segment.end
        );
        let new_id = self.graph.store_sequence(name, sequence)?;
        let copy = self.graph.separate_path(path, read_segment, new_id)?;

        for edge in interior {
            if self.graph.contains_edge(edge) {
                self.decremented.insert(edge);
            } else {
                self.stats.removed_edges += 1;
            }
        }
        debug!("separated {} into {}", path, copy);
        Ok(copy)
    }

    /// Remove repeat edges that lost copies this pass and are left without
    /// enough unconsumed read support. Returns the number of pairs removed.
    pub fn remove_unsupported_edges(&mut self) -> Result<usize, ResolveError> {
        let mut removed = 0;
        let decremented = std::mem::take(&mut self.decremented);
        for id in decremented {
            let Some(edge) = self.graph.edge(id) else {
                continue;
            };
            if edge.is_resolved() {
                continue;
            }
            let support = self.edge_support.get(&id).copied().unwrap_or(0);
            let consumed = self.consumed.get(&id).copied().unwrap_or(0);
            let free = support.saturating_sub(consumed);
            if free < self.config.min_edge_support {
                debug!(
                    "removing {} (multiplicity {}, {} unused reads)",
                    id,
                    edge.multiplicity(),
                    free
                );
                self.graph.remove_edge(id)?;
                removed += 1;
            }
        }
        self.stats.removed_edges += removed;
        Ok(removed)
    }

    /// Run passes until one accepts nothing or the iteration cap is hit.
    pub fn resolve_repeats(&mut self) -> Result<ResolutionSummary, ResolveError> {
        self.graph.check_consistency()?;
        let mut summary = ResolutionSummary::default();

        for pass in 1..=self.config.max_iterations {
            self.stats = PassStats {
                pass,
                ..PassStats::default()
            };
            self.consumed.clear();
            self.decremented.clear();

            self.stats.repeats = self.find_repeats()?;
            let connections = self.get_connections()?;
            let accepted = self.resolve_connections(&connections)?;
            self.remove_unsupported_edges()?;

            let stats = std::mem::take(&mut self.stats);
            info!(
                "Pass {}: {} repeats, {} connections, {} resolved, {} deferred, {} rejected, {} edges removed",
                stats.pass,
                stats.repeats,
                stats.connections,
                stats.accepted,
                stats.deferred,
                stats.rejected,
                stats.removed_edges
            );
            summary.passes.push(stats);
            if accepted == 0 {
                summary.converged = true;
                break;
            }
        }

        if !summary.converged {
            warn!(
                "Stopped after {} passes without reaching a fixpoint",
                self.config.max_iterations
            );
        }
        // leave flags describing the final graph
        let remaining = self.find_repeats()?;
        info!(
            "Resolved {} repeat copies, {} repetitive edge pairs remain",
            summary.total_accepted(),
            remaining
        );
        Ok(summary)
    }
}
