pub mod annotate_directory_use_case;
pub mod annotate_video_use_case;
pub mod batcher;
pub mod dispatcher;
pub mod infrastructure;
pub mod pipeline_executor;
pub mod pipeline_logger;
pub mod pipeline_settings;
pub mod reassembler;
