//! repeat_resolver library
//!
//! Resolves repeats in a strand-symmetric assembly repeat graph using long
//! reads: edges are classified from copy-number estimates, read alignments
//! that bridge a repeat between two unique edges become connections, and
//! well-supported connections are separated into dedicated edges until the
//! graph stops changing.

pub mod aligner;
pub mod connection;
pub mod graph;
pub mod multiplicity;
pub mod report;
pub mod resolver;
pub mod sequence;

pub use aligner::{best_alignment, EdgeAlignment, GraphAlignment, PrecomputedAligner, ReadAligner};
pub use connection::{
    connections_from_alignment,
    tally,
    Candidate,
    Connection,
    ConnectionPlanner,
    Decision,
    DeferReason,
    RejectReason,
    Verdict,
};
pub use graph::{Edge, EdgeId, GraphError, GraphPath, Node, NodeId, RepeatGraph};
pub use multiplicity::{
    estimate_unique_coverage,
    CoverageMultiplicity,
    MultiplicityEstimate,
    MultiplicityInferer,
    RecordedMultiplicity,
};
pub use report::{unresolved_repeats, PassStats, ResolutionSummary, UnresolvedRepeat};
pub use resolver::{RepeatResolver, ResolveError, ResolverConfig};
pub use sequence::{
    InMemorySequences,
    SequenceContainer,
    SequenceError,
    SequenceId,
    SequenceSegment,
};
