use log::{debug, info};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use bio::io::{fasta, fastq};
use clap::Parser;
use flate2::read::MultiGzDecoder;
use serde::Deserialize;

use repeat_resolver::{
    unresolved_repeats, CoverageMultiplicity, EdgeAlignment, EdgeId, GraphAlignment,
    InMemorySequences, MultiplicityInferer, NodeId, PrecomputedAligner, RecordedMultiplicity,
    RepeatGraph, RepeatResolver, ResolutionSummary, ResolverConfig, SequenceContainer,
    SequenceSegment,
};

/// Resolve repeats in an assembly graph using long-read alignments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Graph description (JSON)
    #[arg(long)]
    graph: String,

    /// FASTA/FASTQ reads, optionally gzip-compressed
    #[arg(long)]
    reads: String,

    /// Read-to-graph alignments (JSON)
    #[arg(long)]
    alignments: String,

    /// FASTA with the sequences edges refer to by name
    #[arg(long)]
    assembly: Option<String>,

    /// Output file for the resolved graph (JSON)
    #[arg(long)]
    output: Option<String>,

    /// Output FASTA with one record per edge strand pair of the resolved graph
    #[arg(long)]
    edges_fasta: Option<String>,

    /// Output file for per-pass statistics (JSON)
    #[arg(long)]
    summary_json: Option<String>,

    /// Output file listing repeats left unresolved (JSON)
    #[arg(long)]
    repeats_dump: Option<String>,

    /// Maximum number of resolution passes
    #[arg(long, default_value_t = 10)]
    max_iterations: usize,

    /// Reads required to separate a repeat traversal
    #[arg(long, default_value_t = 1)]
    min_support: usize,

    /// Unused reads a partially resolved repeat edge needs to be kept
    #[arg(long, default_value_t = 1)]
    min_edge_support: usize,

    /// Estimate multiplicities from edge coverage instead of trusting the graph
    #[arg(long)]
    coverage_multiplicity: bool,

    /// Enable threaded read alignment (default: off)
    #[arg(long, default_value_t = false)]
    threads: bool,

    /// Number of worker threads for read alignment (default: max available - 1)
    #[arg(long, default_value_t = num_cpus::get().saturating_sub(1).max(1))]
    max_workers: usize,

    /// Wrap FASTA lines to this width (0 = no-wrap)
    #[arg(long, default_value_t = 60)]
    fasta_line_width: usize,

    /// Verbose/info output (default: quiet)
    #[arg(long, short = 'v', alias = "info")]
    verbose: bool,

    /// Debug output
    #[arg(long)]
    debug: bool,

    /// Trace output
    #[arg(long)]
    trace: bool,
}

fn main() {
    let args = Args::parse();
    let log_level = if args.trace {
        "trace"
    } else if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "error"
    };
    env_logger::Builder::new().parse_filters(log_level).init();

    info!("graph: {}", args.graph);
    info!("reads: {}", args.reads);
    info!("alignments: {}", args.alignments);

    if let Err(error) = run_pipeline(&args) {
        eprintln!("Repeat resolution failed: {error:?}");
        std::process::exit(1);
    }
}

/// One forward edge of the input graph. The k-th listed edge gets id `2k`
/// and its reverse complement `2k + 1`.
#[derive(Debug, Deserialize)]
struct EdgeDescription {
    /// Junction the edge leaves, written `<pair>+` or `<pair>-`.
    source: String,
    target: String,
    /// Assembly record the edge spans; ignored when `seq` is given.
    #[serde(default)]
    sequence: Option<String>,
    /// Inline sequence.
    #[serde(default)]
    seq: Option<String>,
    #[serde(default)]
    reverse: bool,
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    end: Option<usize>,
    #[serde(default = "default_multiplicity")]
    multiplicity: u32,
    #[serde(default)]
    coverage: u32,
    /// The recorded multiplicity is a guess; never use the edge as an anchor.
    #[serde(default)]
    unreliable: bool,
}

fn default_multiplicity() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct GraphDescription {
    /// Number of junction pairs; pairs are numbered from 0.
    nodes: usize,
    edges: Vec<EdgeDescription>,
}

#[derive(Debug, Deserialize)]
struct StepRecord {
    edge: usize,
    read_start: usize,
    read_end: usize,
}

#[derive(Debug, Deserialize)]
struct AlignmentRecord {
    score: f64,
    #[serde(default)]
    reverse: bool,
    steps: Vec<StepRecord>,
}

#[derive(Debug, Deserialize)]
struct ReadAlignments {
    read: String,
    alignments: Vec<AlignmentRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceFormat {
    Fastq,
    Fasta,
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("bgz"))
        .unwrap_or(false)
}

fn infer_format(path: &Path) -> SequenceFormat {
    let mut ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    if ext == "gz" || ext == "bgz" {
        if let Some(stem) = path.file_stem() {
            ext = Path::new(stem)
                .extension()
                .and_then(|e| e.to_str())
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_default();
        }
    }

    match ext.as_str() {
        "fastq" | "fq" => SequenceFormat::Fastq,
        _ => SequenceFormat::Fasta,
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if is_gzip(path) {
        let decoder = MultiGzDecoder::new(file);
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read named sequences from FASTA or FASTQ, upper-cased.
fn read_sequences(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let reader = open_reader(path)?;
    let mut sequences = Vec::new();
    match infer_format(path) {
        SequenceFormat::Fastq => {
            for record in fastq::Reader::new(reader).records() {
                let record = record.with_context(|| {
                    format!("Error reading FASTQ record from {}", path.display())
                })?;
                sequences.push((record.id().to_string(), record.seq().to_ascii_uppercase()));
            }
        }
        SequenceFormat::Fasta => {
            for record in fasta::Reader::new(reader).records() {
                let record = record.with_context(|| {
                    format!("Error reading FASTA record from {}", path.display())
                })?;
                sequences.push((record.id().to_string(), record.seq().to_ascii_uppercase()));
            }
        }
    }
    Ok(sequences)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = open_reader(path)?;
    serde_json::from_reader(reader).with_context(|| format!("Failed to parse {}", path.display()))
}

fn create_output(path: &str) -> Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    Ok(BufWriter::new(file))
}

/// Map `<pair>+` / `<pair>-` onto a node id.
fn parse_node(label: &str, pairs: &[(NodeId, NodeId)]) -> Result<NodeId> {
    let (index, reverse) = match label.strip_suffix('-') {
        Some(index) => (index, true),
        None => (label.strip_suffix('+').unwrap_or(label), false),
    };
    let index: usize = index
        .parse()
        .with_context(|| format!("Invalid node label '{}'", label))?;
    let &(forward, rc) = pairs
        .get(index)
        .ok_or_else(|| anyhow!("Node pair {} out of range ({} pairs)", index, pairs.len()))?;
    Ok(if reverse { rc } else { forward })
}

/// Build the graph, adding inline edge sequences to `assembly`.
/// Build the graph and collect the edges whose recorded multiplicity is untrusted.
fn build_graph(
    description: GraphDescription,
    assembly: &mut InMemorySequences,
) -> Result<(RepeatGraph, RecordedMultiplicity)> {
    let mut graph = RepeatGraph::new();
    let mut recorded = RecordedMultiplicity::new();
    let pairs: Vec<(NodeId, NodeId)> = (0..description.nodes).map(|_| graph.add_node_pair()).collect();

    for (k, edge) in description.edges.into_iter().enumerate() {
        let forward = match (&edge.seq, &edge.sequence) {
            (Some(seq), _) => assembly.add(format!("edge_{}", k), seq.as_bytes().to_ascii_uppercase())?,
            (None, Some(name)) => assembly
                .resolve_name(name)
                .ok_or_else(|| anyhow!("Edge {} refers to unknown sequence '{}'", k, name))?,
            (None, None) => bail!("Edge {} has neither 'seq' nor 'sequence'", k),
        };
        let seq_id = if edge.reverse { forward.rc() } else { forward };
        let seq_len = assembly.len(seq_id)?;
        let segment = SequenceSegment::new(
            seq_id,
            seq_len,
            edge.start.unwrap_or(0),
            edge.end.unwrap_or(seq_len),
        );
        if !segment.is_valid() {
            bail!("Edge {} has an invalid range {:?} on '{}'", k, segment.range(), seq_id);
        }
        let source = parse_node(&edge.source, &pairs)?;
        let target = parse_node(&edge.target, &pairs)?;
        let (id, _) = graph.add_edge_pair(source, target, segment, edge.multiplicity, edge.coverage)?;
        debug!("edge {} = {} -> {}", id, source, target);
        if edge.unreliable {
            recorded.mark_unreliable(id);
        }
    }
    graph.check_consistency()?;
    Ok((graph, recorded))
}

fn build_aligner(records: Vec<ReadAlignments>, reads: &InMemorySequences) -> Result<PrecomputedAligner> {
    let by_name: HashMap<&str, _> = reads
        .sequence_ids()
        .into_iter()
        .map(|id| reads.name(id).map(|name| (name, id)))
        .collect::<Result<_, _>>()?;

    let mut aligner = PrecomputedAligner::new();
    for record in records {
        let forward = *by_name
            .get(record.read.as_str())
            .ok_or_else(|| anyhow!("Alignment refers to unknown read '{}'", record.read))?;
        for alignment in record.alignments {
            let read_id = if alignment.reverse { forward.rc() } else { forward };
            let steps = alignment
                .steps
                .iter()
                .map(|s| EdgeAlignment::new(EdgeId(s.edge), s.read_start, s.read_end))
                .collect();
            aligner.add(GraphAlignment::new(read_id, reads.len(read_id)?, steps, alignment.score));
        }
    }
    Ok(aligner)
}

fn write_edges_fasta(
    path: &str,
    resolver: &RepeatResolver<'_>,
    line_width: usize,
) -> Result<()> {
    let mut out = create_output(path)?;
    for edge in resolver.graph().canonical_edges() {
        let seq = resolver.edge_sequence(edge.id())?;
        writeln!(
            out,
            ">{} {}->{} multiplicity={}",
            edge.id(),
            edge.source(),
            edge.target(),
            edge.multiplicity()
        )?;
        if line_width == 0 {
            out.write_all(&seq)?;
            writeln!(out)?;
        } else {
            for line in seq.chunks(line_width) {
                out.write_all(line)?;
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

fn run_pipeline(args: &Args) -> Result<ResolutionSummary> {
    let mut assembly = match &args.assembly {
        Some(path) => InMemorySequences::from_records(read_sequences(Path::new(path))?)
            .with_context(|| format!("Failed to load assembly from {}", path))?,
        None => InMemorySequences::new(),
    };
    let description: GraphDescription = read_json(Path::new(&args.graph))?;
    let (mut graph, recorded) = build_graph(description, &mut assembly)
        .with_context(|| format!("Failed to build graph from {}", args.graph))?;
    info!(
        "Graph loaded: {} nodes, {} edges",
        graph.node_count(),
        graph.edge_count()
    );

    let reads = InMemorySequences::from_records(read_sequences(Path::new(&args.reads))?)
        .with_context(|| format!("Failed to load reads from {}", args.reads))?;
    let records: Vec<ReadAlignments> = read_json(Path::new(&args.alignments))?;
    let aligner = build_aligner(records, &reads)?;
    info!(
        "{} reads, {} alignments",
        reads.num_sequences() / 2,
        aligner.num_alignments()
    );

    let inferer: Box<dyn MultiplicityInferer> = if args.coverage_multiplicity {
        let inferer = CoverageMultiplicity::from_graph(&graph);
        info!("Single-copy coverage estimated at {}", inferer.unique_coverage);
        Box::new(inferer)
    } else {
        Box::new(recorded)
    };

    let config = ResolverConfig {
        max_iterations: args.max_iterations,
        min_support: args.min_support,
        min_edge_support: args.min_edge_support,
        use_threads: args.threads,
        max_workers: args.max_workers,
    };
    let mut resolver = RepeatResolver::new(&mut graph, &assembly, &reads, &aligner, &*inferer)
        .with_config(config);
    let summary = resolver.resolve_repeats()?;

    if let Some(path) = &args.edges_fasta {
        write_edges_fasta(path, &resolver, args.fasta_line_width)?;
        info!("Edge sequences written to {}", path);
    }
    drop(resolver);

    if let Some(path) = &args.output {
        let mut out = create_output(path)?;
        serde_json::to_writer_pretty(&mut out, &graph)?;
        writeln!(out)?;
        info!("Resolved graph written to {}", path);
    }
    if let Some(path) = &args.summary_json {
        let mut out = create_output(path)?;
        serde_json::to_writer_pretty(&mut out, &summary)?;
        writeln!(out)?;
    }
    if let Some(path) = &args.repeats_dump {
        let repeats = unresolved_repeats(&graph);
        info!("{} repeats left unresolved", repeats.len());
        let mut out = create_output(path)?;
        serde_json::to_writer_pretty(&mut out, &repeats)?;
        writeln!(out)?;
    }
    Ok(summary)
}
