pub mod directory_source;
pub mod ffmpeg_sink;
pub mod ffmpeg_source;
