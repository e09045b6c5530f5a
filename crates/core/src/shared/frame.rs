use ndarray::ArrayView3;

/// Identifies which input video a frame was decoded from.
///
/// Single-video runs use source 0; directory ingestion numbers sources in
/// scan order. Frame indices restart at 0 for every source.
pub type SourceId = u32;

/// A single decoded video frame: contiguous bytes in row-major order.
///
/// Pixel data is immutable once decoded. Format conversion happens at I/O
/// boundaries only; the domain layer treats pixel data as opaque.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    index: usize,
    source: SourceId,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, index: usize) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            index,
            source: 0,
        }
    }

    /// Tags the frame with the video it came from.
    pub fn with_source(mut self, source: SourceId) -> Self {
        self.source = source;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns an `[H, W, C]` view, or `None` when the buffer length does not
    /// match the declared geometry.
    pub fn as_ndarray(&self) -> Option<ArrayView3<'_, u8>> {
        ArrayView3::from_shape(
            (
                self.height as usize,
                self.width as usize,
                self.channels as usize,
            ),
            &self.data,
        )
        .ok()
    }
}

/// A frame after detections have been composited onto it.
///
/// Owned by the reassembler from the moment it is produced until it is
/// flushed to the video sink.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotatedFrame {
    frame: Frame,
    boxes_drawn: usize,
}

impl AnnotatedFrame {
    pub fn new(frame: Frame, boxes_drawn: usize) -> Self {
        Self { frame, boxes_drawn }
    }

    /// Wraps an unannotated frame, used when a batch failed permanently and
    /// the run is configured to keep the original pixels.
    pub fn passthrough(frame: Frame) -> Self {
        Self::new(frame, 0)
    }

    pub fn index(&self) -> usize {
        self.frame.index()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    pub fn boxes_drawn(&self) -> usize {
        self.boxes_drawn
    }
}
