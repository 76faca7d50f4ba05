//! Strand-aware sequence identifiers, segments and storage.

use std::fmt;
use std::ops::Range;

use bio::alphabets::dna;
use serde::{Deserialize, Serialize};

/// Errors returned by SequenceContainer implementations.
#[derive(thiserror::Error, Debug)]
pub enum SequenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid range {start}..{end} for sequence {id} of length {len}")]
    InvalidRange {
        id: SequenceId,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("Sequence id space exhausted")]
    IdsExhausted,
}

/// Identifier of one strand of a stored sequence.
///
/// Ids come in pairs: an even id names the forward strand and the following
/// odd id its reverse complement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(pub u32);

impl SequenceId {
    /// Id of the opposite strand.
    #[inline]
    pub fn rc(self) -> Self {
        SequenceId(self.0 ^ 1)
    }

    /// True for forward-strand ids.
    #[inline]
    pub fn strand(self) -> bool {
        self.0 & 1 == 0
    }

    /// Forward-strand id of the pair.
    #[inline]
    pub fn forward(self) -> Self {
        SequenceId(self.0 & !1)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.strand() { '+' } else { '-' };
        write!(f, "{}{}", sign, self.0 / 2)
    }
}

/// A coordinate interval on one strand of a stored sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceSegment {
    pub seq_id: SequenceId,
    /// Total length of the referenced sequence.
    pub seq_len: usize,
    pub start: usize,
    pub end: usize,
}

impl SequenceSegment {
    pub fn new(seq_id: SequenceId, seq_len: usize, start: usize, end: usize) -> Self {
        SequenceSegment {
            seq_id,
            seq_len,
            start,
            end,
        }
    }

    /// Segment covering a whole sequence.
    pub fn whole(seq_id: SequenceId, seq_len: usize) -> Self {
        Self::new(seq_id, seq_len, 0, seq_len)
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// The same interval expressed on the opposite strand.
    pub fn complement(&self) -> Self {
        SequenceSegment {
            seq_id: self.seq_id.rc(),
            seq_len: self.seq_len,
            start: self.seq_len.saturating_sub(self.end),
            end: self.seq_len.saturating_sub(self.start),
        }
    }

    /// Whether the interval fits into the referenced sequence.
    pub fn is_valid(&self) -> bool {
        self.start <= self.end && self.end <= self.seq_len
    }
}

/// Random access to sequences by id and coordinate range.
/// Implementations should be `Send + Sync` so they can be shared across threads.
pub trait SequenceContainer: Send + Sync {
    /// Number of stored strands (forward and reverse complement counted separately).
    fn num_sequences(&self) -> usize;
    /// Forward-strand ids in storage order.
    fn sequence_ids(&self) -> Vec<SequenceId>;
    fn name(&self, id: SequenceId) -> Result<&str, SequenceError>;
    fn len(&self, id: SequenceId) -> Result<usize, SequenceError>;
    fn fetch(&self, id: SequenceId, range: Range<usize>) -> Result<&[u8], SequenceError>;

    /// Fetch the bytes covered by a segment.
    fn fetch_segment(&self, segment: &SequenceSegment) -> Result<&[u8], SequenceError> {
        self.fetch(segment.seq_id, segment.range())
    }

    fn is_empty(&self) -> bool {
        self.num_sequences() == 0
    }
}

/// In-memory store holding both strands of every sequence.
///
/// Sequences are addressed by `base + index`, which lets several stores share
/// one id space without collisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemorySequences {
    base: u32,
    names: Vec<String>,
    seqs: Vec<Vec<u8>>,
}

impl InMemorySequences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store whose first id is `base` rounded up to an even value.
    pub fn with_base(base: u32) -> Self {
        InMemorySequences {
            base: base + (base & 1),
            names: Vec::new(),
            seqs: Vec::new(),
        }
    }

    /// Build from (name, sequence) pairs, e.g. parsed FASTA records.
    pub fn from_records<I, S>(records: I) -> Result<Self, SequenceError>
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        let mut store = Self::new();
        for (name, seq) in records {
            store.add(name, seq)?;
        }
        Ok(store)
    }

    /// Store a sequence and its reverse complement, returning the forward id.
    pub fn add<S: Into<String>>(&mut self, name: S, seq: Vec<u8>) -> Result<SequenceId, SequenceError> {
        let index = u32::try_from(self.seqs.len()).map_err(|_| SequenceError::IdsExhausted)?;
        let forward = self
            .base
            .checked_add(index)
            .filter(|id| id.checked_add(1).is_some())
            .ok_or(SequenceError::IdsExhausted)?;
        let name = name.into();
        let rc = dna::revcomp(&seq);
        self.names.push(name);
        self.seqs.push(seq);
        self.seqs.push(rc);
        Ok(SequenceId(forward))
    }

    /// First id handed out by this store.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// First id past the end of this store.
    pub fn next_id(&self) -> u32 {
        self.base + self.seqs.len() as u32
    }

    /// Whether `id` falls into this store's id range.
    pub fn contains(&self, id: SequenceId) -> bool {
        id.0 >= self.base && ((id.0 - self.base) as usize) < self.seqs.len()
    }

    /// Forward id of the sequence called `name`.
    /// Linear scan; callers should avoid using this on large datasets.
    pub fn resolve_name(&self, name: &str) -> Option<SequenceId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| SequenceId(self.base + 2 * i as u32))
    }

    fn slot(&self, id: SequenceId) -> Result<usize, SequenceError> {
        if self.contains(id) {
            Ok((id.0 - self.base) as usize)
        } else {
            Err(SequenceError::NotFound(format!("sequence {}", id)))
        }
    }
}

impl SequenceContainer for InMemorySequences {
    fn num_sequences(&self) -> usize {
        self.seqs.len()
    }

    fn sequence_ids(&self) -> Vec<SequenceId> {
        (0..self.seqs.len())
            .step_by(2)
            .map(|i| SequenceId(self.base + i as u32))
            .collect()
    }

    fn name(&self, id: SequenceId) -> Result<&str, SequenceError> {
        let slot = self.slot(id)?;
        Ok(self.names[slot / 2].as_str())
    }

    fn len(&self, id: SequenceId) -> Result<usize, SequenceError> {
        let slot = self.slot(id)?;
        Ok(self.seqs[slot].len())
    }

    fn fetch(&self, id: SequenceId, range: Range<usize>) -> Result<&[u8], SequenceError> {
        let slot = self.slot(id)?;
        let seq = &self.seqs[slot];
        if range.start <= range.end && range.end <= seq.len() {
            Ok(&seq[range])
        } else {
            Err(SequenceError::InvalidRange {
                id,
                start: range.start,
                end: range.end,
                len: seq.len(),
            })
        }
    }
}
