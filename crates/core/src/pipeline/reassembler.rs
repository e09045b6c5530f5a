use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::shared::frame::AnnotatedFrame;
use crate::shared::pipeline_error::PipelineError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReassemblyMode {
    /// Flush the contiguous prefix as soon as it exists.
    #[default]
    Streaming,
    /// Hold every frame until the source is exhausted.
    Buffered,
}

/// Ordering barrier between out-of-order annotation and the sink.
///
/// Slots are keyed by frame index relative to `next_index`, the first index
/// not yet flushed; memory is bounded by the outstanding window, not the
/// video length, in streaming mode.
#[derive(Debug)]
pub struct Reassembler {
    mode: ReassemblyMode,
    next_index: usize,
    slots: VecDeque<Option<AnnotatedFrame>>,
    buffered: usize,
    peak_buffered: usize,
}

impl Reassembler {
    pub fn new(mode: ReassemblyMode) -> Self {
        Self {
            mode,
            next_index: 0,
            slots: VecDeque::new(),
            buffered: 0,
            peak_buffered: 0,
        }
    }

    pub fn mode(&self) -> ReassemblyMode {
        self.mode
    }

    /// Index of the next frame the sink expects.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn peak_buffered(&self) -> usize {
        self.peak_buffered
    }

    pub fn insert(&mut self, frame: AnnotatedFrame) -> Result<(), PipelineError> {
        let index = frame.index();
        if index < self.next_index {
            return Err(PipelineError::DuplicateFrame { index });
        }
        let offset = index - self.next_index;
        if offset >= self.slots.len() {
            self.slots.resize_with(offset + 1, || None);
        }
        let slot = &mut self.slots[offset];
        if slot.is_some() {
            return Err(PipelineError::DuplicateFrame { index });
        }
        *slot = Some(frame);
        self.buffered += 1;
        self.peak_buffered = self.peak_buffered.max(self.buffered);
        Ok(())
    }

    /// Removes and returns the longest contiguous run starting at
    /// `next_index`. Always empty in buffered mode.
    pub fn drain_ready(&mut self) -> Vec<AnnotatedFrame> {
        match self.mode {
            ReassemblyMode::Streaming => self.pop_prefix(),
            ReassemblyMode::Buffered => Vec::new(),
        }
    }

    /// Flushes everything left once all `total` frames have been delivered.
    ///
    /// Fails naming every index in `next_index..total` that never arrived.
    pub fn finish(&mut self, total: usize) -> Result<Vec<AnnotatedFrame>, PipelineError> {
        let missing: Vec<usize> = (self.next_index..total)
            .filter(|&i| !matches!(self.slots.get(i - self.next_index), Some(Some(_))))
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::IncompleteResult {
                missing,
                failures: Vec::new(),
            });
        }
        let frames = self.pop_prefix();
        if let Some(offset) = self.slots.iter().position(Option::is_some) {
            return Err(PipelineError::UnexpectedFrame {
                index: self.next_index + offset,
                total,
            });
        }
        Ok(frames)
    }

    fn pop_prefix(&mut self) -> Vec<AnnotatedFrame> {
        let mut ready = Vec::new();
        while let Some(Some(_)) = self.slots.front() {
            if let Some(Some(frame)) = self.slots.pop_front() {
                ready.push(frame);
            }
        }
        self.next_index += ready.len();
        self.buffered -= ready.len();
        ready
    }
}
