//! Extraction configuration.

use crate::error::{ConfigError, ConfigResult};
use crate::pipeline::device::Device;
use crate::pipeline::sink::OnExtraction;
use crate::pipeline::types::ExtractionParams;
use crate::video::{DecoderBackend, Sampling};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Frames per window
    pub stack_size: usize,
    /// Frames between window starts
    pub step_size: usize,
    /// Resample to this rate; `None` keeps the native rate
    pub extraction_fps: Option<f64>,
    /// Keep decoded frames under `tmp_path` after a successful extraction
    pub keep_frames: bool,
    pub tmp_path: PathBuf,
    /// Where storage sinks write
    pub output_path: PathBuf,
    pub on_extraction: OnExtraction,
    /// One worker per entry
    pub devices: Vec<Device>,
    pub backend: DecoderBackend,
    pub show_progress: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            stack_size: 64,
            step_size: 64,
            extraction_fps: None,
            keep_frames: false,
            tmp_path: PathBuf::from("./tmp"),
            output_path: PathBuf::from("./output"),
            on_extraction: OnExtraction::Print,
            devices: vec![Device::preferred()],
            backend: DecoderBackend::Opencv,
            show_progress: true,
        }
    }
}

impl ExtractionConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device) {
                return Err(ConfigError::DuplicateDevice(device.to_string()));
            }
        }
        if self.stack_size == 0 {
            return Err(ConfigError::invalid("stack_size must be at least 1"));
        }
        if self.step_size == 0 {
            return Err(ConfigError::invalid("step_size must be at least 1"));
        }
        if let Some(fps) = self.extraction_fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(ConfigError::invalid(format!(
                    "extraction_fps must be a positive number, got {}",
                    fps
                )));
            }
        }
        Ok(())
    }

    pub fn sampling(&self) -> Sampling {
        Sampling::from_fps(self.extraction_fps)
    }

    /// Per-task parameters shared by every worker.
    pub fn params(&self) -> ExtractionParams {
        if self.keep_frames {
            if let Some(fps) = self.extraction_fps {
                tracing::info!(
                    "Frames kept under {} are the sequence resampled to {} fps",
                    self.tmp_path.display(),
                    fps
                );
            }
        }
        ExtractionParams {
            stack_size: self.stack_size,
            step_size: self.step_size,
            sampling: self.sampling(),
            keep_frames: self.keep_frames,
            tmp_path: self.tmp_path.clone(),
        }
    }
}
