// In-memory stand-ins for the decoder, the model and the sink.

use crate::error::{DecodeError, ModelError, SinkError};
use crate::pipeline::device::Device;
use crate::pipeline::extractor::{ExtractorFactory, FeatureExtractor};
use crate::pipeline::sink::{ResultSink, SinkOutcome};
use crate::pipeline::types::{FeatureRecord, WindowFeatures};
use crate::video::{Frame, FrameSource, Sampling, VideoReader};
use image::{Rgb, RgbImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Frame value marking frames the fake model refuses.
pub const POISON: u8 = 255;

#[derive(Clone, Debug, Default)]
pub struct FakeVideo {
    pub frames: usize,
    pub corrupt: bool,
    /// Frames from this index on make the fake model fail.
    pub poison_from: Option<usize>,
    /// Reader errors when asked for this frame.
    pub read_error_at: Option<usize>,
}

impl FakeVideo {
    pub fn frames(frames: usize) -> Self {
        Self {
            frames,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct FakeSource {
    videos: HashMap<PathBuf, FakeVideo>,
    pub opened: Mutex<Vec<PathBuf>>,
}

impl FakeSource {
    pub fn with(mut self, path: &str, video: FakeVideo) -> Self {
        self.videos.insert(PathBuf::from(path), video);
        self
    }
}

impl FrameSource for FakeSource {
    fn open(&self, path: &Path, sampling: Sampling) -> Result<Box<dyn VideoReader>, DecodeError> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(path.to_path_buf());
        }
        let video = self
            .videos
            .get(path)
            .ok_or_else(|| DecodeError::new(path, "video file not found"))?;
        if video.corrupt {
            return Err(DecodeError::new(path, "no decodable video stream"));
        }
        Ok(Box::new(FakeReader {
            video: video.clone(),
            sampling,
            next: 0,
        }))
    }
}

pub struct FakeReader {
    video: FakeVideo,
    sampling: Sampling,
    next: usize,
}

impl VideoReader for FakeReader {
    fn frame_count(&self) -> usize {
        self.video.frames
    }

    fn source_fps(&self) -> f64 {
        25.0
    }

    fn output_fps(&self) -> f64 {
        self.sampling.output_fps(25.0)
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.video.read_error_at == Some(self.next) {
            anyhow::bail!("corrupt packet at frame {}", self.next);
        }
        if self.next >= self.video.frames {
            return Ok(None);
        }
        let poisoned = self.video.poison_from.is_some_and(|p| self.next >= p);
        let marker = if poisoned { POISON } else { 0 };
        let frame = Frame {
            index: self.next,
            timestamp_ms: self.next as f64 * 1000.0 / self.output_fps(),
            image: RgbImage::from_pixel(2, 2, Rgb([(self.next % 251) as u8, 7, marker])),
        };
        self.next += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> anyhow::Result<()> {
        self.next = 0;
        Ok(())
    }
}

/// Deterministic model: one "rgb" vector of `[first index, window length, device index]`.
pub struct FakeExtractor {
    device: Device,
    streams: Vec<String>,
    pub calls: Arc<Mutex<Vec<(Device, usize)>>>,
}

impl FeatureExtractor for FakeExtractor {
    fn streams(&self) -> &[String] {
        &self.streams
    }

    fn extract(&mut self, window: &[Frame], device: &Device) -> Result<WindowFeatures, ModelError> {
        assert_eq!(*device, self.device, "extractor called with a foreign device");
        if window.iter().any(|f| f.image.get_pixel(0, 0)[2] == POISON) {
            return Err(ModelError::malformed("poisoned frame"));
        }
        let first = window.first().map(|f| f.index).unwrap_or_default();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((*device, first));
        }
        let mut features = WindowFeatures::new();
        features.insert(
            "rgb".to_string(),
            vec![first as f32, window.len() as f32, device.index as f32],
        );
        Ok(features)
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub broken_devices: Vec<Device>,
    pub calls: Arc<Mutex<Vec<(Device, usize)>>>,
    pub created: Mutex<Vec<Device>>,
}

impl FakeFactory {
    pub fn extractor(device: Device) -> FakeExtractor {
        FakeExtractor {
            device,
            streams: vec!["rgb".to_string()],
            calls: Arc::default(),
        }
    }
}

impl ExtractorFactory for FakeFactory {
    fn create(&self, device: &Device) -> Result<Box<dyn FeatureExtractor>, ModelError> {
        if self.broken_devices.contains(device) {
            return Err(ModelError::UnsupportedDevice(device.to_string()));
        }
        if let Ok(mut created) = self.created.lock() {
            created.push(*device);
        }
        Ok(Box::new(FakeExtractor {
            device: *device,
            streams: vec!["rgb".to_string()],
            calls: self.calls.clone(),
        }))
    }
}

/// Returns records, but refuses videos whose path contains `fail_on`.
#[derive(Default)]
pub struct PickySink {
    pub fail_on: Option<String>,
    pub seen: Mutex<Vec<PathBuf>>,
}

impl ResultSink for PickySink {
    fn consume(&self, record: FeatureRecord) -> Result<SinkOutcome, SinkError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(record.video.clone());
        }
        if let Some(pattern) = &self.fail_on {
            if record.video.to_string_lossy().contains(pattern.as_str()) {
                return Err(SinkError::write(
                    &record.video,
                    std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                ));
            }
        }
        Ok(SinkOutcome::Returned(record))
    }
}
