// Feature extraction pipeline

pub mod device;
pub mod extractor;
pub mod i3d;
pub mod orchestrator;
pub mod sink;
pub mod types;
pub mod windowing;
pub mod worker;

#[cfg(test)]
mod testing;
