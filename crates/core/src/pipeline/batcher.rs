use crate::shared::frame::Frame;
use crate::shared::pipeline_error::PipelineError;

/// An order-preserving group of frames dispatched as one unit of work.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    batch_id: usize,
    frames: Vec<Frame>,
}

impl Batch {
    pub fn new(batch_id: usize, frames: Vec<Frame>) -> Self {
        Self { batch_id, frames }
    }

    pub fn batch_id(&self) -> usize {
        self.batch_id
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_indices(&self) -> Vec<usize> {
        self.frames.iter().map(Frame::index).collect()
    }

    /// Splits into two halves that keep this batch's id, or `None` for a
    /// single frame. The first half gets the extra frame on odd lengths.
    pub fn split(&self) -> Option<(Batch, Batch)> {
        if self.frames.len() < 2 {
            return None;
        }
        let (head, tail) = self.frames.split_at(self.frames.len().div_ceil(2));
        Some((
            Batch::new(self.batch_id, head.to_vec()),
            Batch::new(self.batch_id, tail.to_vec()),
        ))
    }
}

/// Lazily groups a frame stream into batches of at most `batch_size`.
///
/// Pulls from the source only when the next batch is requested. A source
/// error is yielded once and ends the stream.
pub struct Batcher<I> {
    frames: I,
    batch_size: usize,
    next_batch_id: usize,
    frames_emitted: usize,
    done: bool,
}

impl<I> Batcher<I>
where
    I: Iterator<Item = Result<Frame, PipelineError>>,
{
    pub fn new(frames: I, batch_size: usize) -> Result<Self, PipelineError> {
        if batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".into()));
        }
        Ok(Self {
            frames,
            batch_size,
            next_batch_id: 0,
            frames_emitted: 0,
            done: false,
        })
    }

    /// Frames handed out in batches so far.
    pub fn frames_emitted(&self) -> usize {
        self.frames_emitted
    }
}

impl<I> Iterator for Batcher<I>
where
    I: Iterator<Item = Result<Frame, PipelineError>>,
{
    type Item = Result<Batch, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut frames = Vec::with_capacity(self.batch_size);
        while frames.len() < self.batch_size {
            match self.frames.next() {
                Some(Ok(frame)) => frames.push(frame),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if frames.is_empty() {
            return None;
        }
        let batch = Batch::new(self.next_batch_id, frames);
        self.next_batch_id += 1;
        self.frames_emitted += batch.len();
        Some(Ok(batch))
    }
}
