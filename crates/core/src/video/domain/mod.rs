pub mod frame_source;
pub mod source_locator;
pub mod video_sink;
