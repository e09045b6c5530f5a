pub mod annotator;
pub mod glyphs;
