pub mod annotation;
pub mod inference;
pub mod labels;
pub mod pipeline;
pub mod shared;
pub mod video;
