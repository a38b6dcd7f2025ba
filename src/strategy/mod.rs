pub mod indicators;
pub mod pipeline;
pub mod scoring;
