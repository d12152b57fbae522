//! Multi-device I3D feature extraction for video collections.
//!
//! Videos are split round-robin across devices, decoded into fixed-size
//! frame windows, and passed through the RGB and optical-flow I3D streams.
//! Finished records are returned in memory or written as `.npy`/JSON files.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod run_context;
pub mod video;
