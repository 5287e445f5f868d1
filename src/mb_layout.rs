//! Minibatch packing: how variable-length sequences share the columns of one batch.
//!
//! Column `t * num_parallel_sequences + s` holds time step `t` of parallel slot `s`.
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MBLayoutError {
    #[error("Parallel sequence slot {0} out of range ({1} slots)")]
    SlotOutOfRange(usize, usize),
    #[error("Sequence {seq_id} spans [{t_begin}, {t_end}) which exceeds {num_time_steps} time steps")]
    SequenceOutOfRange {
        seq_id: usize,
        t_begin: usize,
        t_end: usize,
        num_time_steps: usize,
    },
    #[error("Sequence {0} overlaps an existing sequence in slot {1}")]
    Overlap(usize, usize),
    #[error("Sequence {0} is empty")]
    EmptySequence(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub seq_id: usize,
    /// Parallel slot the sequence is packed into.
    pub s: usize,
    pub t_begin: usize,
    pub t_end: usize,
}

impl SequenceInfo {
    pub fn len(&self) -> usize {
        self.t_end - self.t_begin
    }

    pub fn is_empty(&self) -> bool {
        self.t_end == self.t_begin
    }

    pub fn contains(&self, t: usize) -> bool {
        t >= self.t_begin && t < self.t_end
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MBLayout {
    num_parallel_sequences: usize,
    num_time_steps: usize,
    sequences: Vec<SequenceInfo>,
}

impl MBLayout {
    pub fn new(num_parallel_sequences: usize, num_time_steps: usize) -> Self {
        Self {
            num_parallel_sequences,
            num_time_steps,
            sequences: Vec::new(),
        }
    }

    /// Layout with one sequence per slot, each running from `t = 0` for the given length.
    /// The number of time steps is the longest length.
    pub fn from_sequence_lengths(lengths: &[usize]) -> Result<Self, MBLayoutError> {
        let num_time_steps = lengths.iter().copied().max().unwrap_or(0);
        let mut layout = Self::new(lengths.len(), num_time_steps);
        for (s, len) in lengths.iter().enumerate() {
            layout.add_sequence(s, s, 0, *len)?;
        }
        Ok(layout)
    }

    pub fn add_sequence(
        &mut self,
        seq_id: usize,
        s: usize,
        t_begin: usize,
        t_end: usize,
    ) -> Result<(), MBLayoutError> {
        if s >= self.num_parallel_sequences {
            return Err(MBLayoutError::SlotOutOfRange(s, self.num_parallel_sequences));
        }
        if t_end <= t_begin {
            return Err(MBLayoutError::EmptySequence(seq_id));
        }
        if t_end > self.num_time_steps {
            return Err(MBLayoutError::SequenceOutOfRange {
                seq_id,
                t_begin,
                t_end,
                num_time_steps: self.num_time_steps,
            });
        }
        let overlaps = self
            .sequences
            .iter()
            .any(|x| x.s == s && x.t_begin < t_end && t_begin < x.t_end);
        if overlaps {
            return Err(MBLayoutError::Overlap(seq_id, s));
        }
        self.sequences.push(SequenceInfo {
            seq_id,
            s,
            t_begin,
            t_end,
        });
        Ok(())
    }

    pub fn num_parallel_sequences(&self) -> usize {
        self.num_parallel_sequences
    }

    pub fn num_time_steps(&self) -> usize {
        self.num_time_steps
    }

    pub fn num_cols(&self) -> usize {
        self.num_parallel_sequences * self.num_time_steps
    }

    pub fn sequences(&self) -> &[SequenceInfo] {
        &self.sequences
    }

    /// Longest sequence actually present, which bounds stepped execution.
    pub fn max_sequence_length(&self) -> usize {
        self.sequences.iter().map(|x| x.t_end).max().unwrap_or(0)
    }

    pub fn column_index(&self, s: usize, t: usize) -> usize {
        t * self.num_parallel_sequences + s
    }

    pub fn sequence_at(&self, s: usize, t: usize) -> Option<&SequenceInfo> {
        self.sequences.iter().find(|x| x.s == s && x.contains(t))
    }

    /// A gap is a (slot, step) pair not covered by any sequence.
    pub fn is_gap(&self, s: usize, t: usize) -> bool {
        self.sequence_at(s, t).is_none()
    }

    pub fn has_gaps(&self) -> bool {
        let covered: usize = self.sequences.iter().map(|x| x.len()).sum();
        covered < self.num_cols()
    }

    /// Column indices inside `frame` that hold no data.
    pub fn gap_columns(&self, frame: FrameRange) -> Vec<usize> {
        let mut gaps = Vec::new();
        for t in frame.time_steps(self) {
            for s in 0..self.num_parallel_sequences {
                if self.is_gap(s, t) {
                    gaps.push(self.column_index(s, t) - frame.first_column(self));
                }
            }
        }
        gaps
    }

    /// Time step `t - offset` within the same sequence as `(s, t)`, if there is one.
    pub fn shifted_step(&self, s: usize, t: usize, offset: i32) -> Option<usize> {
        let seq = self.sequence_at(s, t)?;
        let shifted = t as i64 - offset as i64;
        if shifted < seq.t_begin as i64 || shifted >= seq.t_end as i64 {
            None
        } else {
            Some(shifted as usize)
        }
    }
}

/// Which columns a compute step covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameRange {
    /// Every time step at once.
    All,
    /// One time step across all parallel sequences.
    Step(usize),
}

impl FrameRange {
    pub fn time_steps(&self, layout: &MBLayout) -> Range<usize> {
        match self {
            FrameRange::All => 0..layout.num_time_steps(),
            FrameRange::Step(t) => *t..*t + 1,
        }
    }

    pub fn first_column(&self, layout: &MBLayout) -> usize {
        match self {
            FrameRange::All => 0,
            FrameRange::Step(t) => t * layout.num_parallel_sequences(),
        }
    }

    pub fn columns(&self, layout: &MBLayout) -> Range<usize> {
        match self {
            FrameRange::All => 0..layout.num_cols(),
            FrameRange::Step(t) => {
                let s = layout.num_parallel_sequences();
                t * s..(t + 1) * s
            }
        }
    }

    pub fn num_columns(&self, layout: &MBLayout) -> usize {
        let range = self.columns(layout);
        range.end - range.start
    }
}

impl std::fmt::Display for FrameRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameRange::All => write!(f, "all"),
            FrameRange::Step(t) => write!(f, "t={t}"),
        }
    }
}
