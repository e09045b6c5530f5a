pub mod constants;
pub mod detection;
pub mod frame;
pub mod pipeline_error;
pub mod video_metadata;
