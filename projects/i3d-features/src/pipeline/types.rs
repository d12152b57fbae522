use crate::error::ModelError;
use crate::pipeline::device::Device;
use crate::pipeline::windowing::WindowSpan;
use crate::video::Sampling;
use ndarray::Array2;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Per-run extraction parameters shared by every task.
#[derive(Clone, Debug)]
pub struct ExtractionParams {
    pub stack_size: usize,
    pub step_size: usize,
    pub sampling: Sampling,
    pub keep_frames: bool,
    pub tmp_path: PathBuf,
}

/// One input video bound to the device that will process it.
#[derive(Clone, Debug)]
pub struct VideoTask {
    pub video: PathBuf,
    /// Position of the video in the input list.
    pub rank: usize,
    /// Name for every file written for this video, unique within a run.
    pub stem: String,
    pub device: Device,
    pub params: Arc<ExtractionParams>,
}

/// Ordered tasks of one device. Fixed once computed.
#[derive(Clone, Debug)]
pub struct DeviceAssignment {
    pub device: Device,
    pub tasks: Vec<VideoTask>,
}

/// Feature vectors produced for one window, keyed by stream name.
pub type WindowFeatures = BTreeMap<String, Vec<f32>>;

/// All window features of one video, in start-offset order.
#[derive(Clone, Debug)]
pub struct FeatureRecord {
    pub video: PathBuf,
    /// Output name, see `VideoTask::stem`.
    pub stem: String,
    pub fps: f64,
    pub windows: Vec<WindowSpan>,
    /// Start time of each window.
    pub timestamps_ms: Vec<f64>,
    /// `windows x dim` matrix per stream.
    pub features: BTreeMap<String, Array2<f32>>,
}

impl FeatureRecord {
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn shapes(&self) -> BTreeMap<String, (usize, usize)> {
        self.features
            .iter()
            .map(|(stream, array)| (stream.clone(), array.dim()))
            .collect()
    }
}

/// Assembles a `FeatureRecord` window by window, holding every stream to
/// the dimension of its first window.
pub struct FeatureRecordBuilder {
    video: PathBuf,
    stem: String,
    fps: f64,
    expected: Option<BTreeSet<String>>,
    windows: Vec<WindowSpan>,
    timestamps_ms: Vec<f64>,
    features: BTreeMap<String, (usize, Vec<f32>)>,
}

impl FeatureRecordBuilder {
    pub fn new(video: PathBuf, stem: impl Into<String>, fps: f64) -> Self {
        Self {
            video,
            stem: stem.into(),
            fps,
            expected: None,
            windows: Vec::new(),
            timestamps_ms: Vec::new(),
            features: BTreeMap::new(),
        }
    }

    /// Require every window to carry exactly these streams.
    pub fn expecting(mut self, streams: &[String]) -> Self {
        self.expected = Some(streams.iter().cloned().collect());
        self
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn push(
        &mut self,
        span: WindowSpan,
        start_ms: f64,
        window: WindowFeatures,
    ) -> Result<(), ModelError> {
        if let Some(last) = self.windows.last() {
            if span.start < last.start {
                return Err(ModelError::malformed(format!(
                    "window {:?} arrived after {:?}",
                    span, last
                )));
            }
        }
        if let Some(expected) = &self.expected {
            if !window.keys().eq(expected.iter()) {
                return Err(ModelError::malformed(format!(
                    "expected streams {:?}, got {:?}",
                    expected,
                    window.keys().collect::<Vec<_>>()
                )));
            }
        }
        if !self.is_empty() && window.len() != self.features.len() {
            return Err(ModelError::malformed(format!(
                "expected {} streams, got {}",
                self.features.len(),
                window.len()
            )));
        }
        for (stream, values) in &window {
            if let Some((dim, _)) = self.features.get(stream) {
                if *dim != values.len() {
                    return Err(ModelError::ShapeMismatch {
                        stream: stream.clone(),
                        expected: *dim,
                        actual: values.len(),
                    });
                }
            } else if !self.is_empty() {
                return Err(ModelError::malformed(format!("unexpected stream '{}'", stream)));
            }
        }

        for (stream, values) in window {
            let entry = self
                .features
                .entry(stream)
                .or_insert_with(|| (values.len(), Vec::new()));
            entry.1.extend(values);
        }
        self.windows.push(span);
        self.timestamps_ms.push(start_ms);
        Ok(())
    }

    pub fn finish(self) -> Result<FeatureRecord, ModelError> {
        let rows = self.windows.len();
        let mut features = BTreeMap::new();
        for (stream, (dim, values)) in self.features {
            let array = Array2::from_shape_vec((rows, dim), values)
                .map_err(|e| ModelError::malformed(format!("stream '{}': {}", stream, e)))?;
            features.insert(stream, array);
        }
        Ok(FeatureRecord {
            video: self.video,
            stem: self.stem,
            fps: self.fps,
            windows: self.windows,
            timestamps_ms: self.timestamps_ms,
            features,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Decode,
    /// Extraction stopped at a window; earlier windows are discarded.
    Model { completed_windows: usize },
    SinkWrite,
    WorkerAborted,
    Cancelled,
}

/// Why a video produced no record.
#[derive(Clone, Debug, Serialize)]
pub struct FailureNotice {
    pub video: PathBuf,
    pub rank: usize,
    pub device: Device,
    #[serde(flatten)]
    pub kind: FailureKind,
    pub reason: String,
}

impl FailureNotice {
    pub fn new(task: &VideoTask, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            video: task.video.clone(),
            rank: task.rank,
            device: task.device,
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
    pub failed: usize,
    pub ms_per_video: f64,
}

/// Progress shared between the coordinator and its workers.
#[derive(Debug)]
pub struct ExtractionState {
    pub total_videos: usize,
    /// Cleared to ask workers to stop after their current window.
    pub is_active: AtomicBool,
    pub is_complete: AtomicBool,
    pub active_workers: AtomicUsize,
    /// Progress per device (e.g. "cuda:0")
    pub devices: RwLock<BTreeMap<String, StageProgress>>,
    pub start_time: std::time::Instant,
}

impl ExtractionState {
    pub fn new(assignments: &[DeviceAssignment]) -> Self {
        let devices = assignments
            .iter()
            .map(|a| {
                (
                    a.device.to_string(),
                    StageProgress {
                        current: 0,
                        total: a.tasks.len(),
                        failed: 0,
                        ms_per_video: 0.0,
                    },
                )
            })
            .collect();

        Self {
            total_videos: assignments.iter().map(|a| a.tasks.len()).sum(),
            is_active: AtomicBool::new(true),
            is_complete: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            devices: RwLock::new(devices),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !self.is_active.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn record_video(&self, device: &Device, ms_per_video: f64, failed: bool) {
        if let Ok(mut devices) = self.devices.write() {
            if let Some(progress) = devices.get_mut(&device.to_string()) {
                progress.current += 1;
                if failed {
                    progress.failed += 1;
                }
                // Simple exponential moving average for smoothing durations
                if progress.ms_per_video == 0.0 {
                    progress.ms_per_video = ms_per_video;
                } else {
                    progress.ms_per_video = progress.ms_per_video * 0.9 + ms_per_video * 0.1;
                }
            }
        }
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let devices = self
            .devices
            .read()
            .map(|d| d.clone())
            .unwrap_or_default();
        let done: usize = devices.values().map(|p| p.current).sum();
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let videos_per_sec = if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        };

        serde_json::json!({
            "total_videos": self.total_videos,
            "done": done,
            "is_active": self.is_active.load(Ordering::Relaxed),
            "is_complete": self.is_complete.load(Ordering::Relaxed),
            "active_workers": self.active_workers.load(Ordering::Relaxed),
            "elapsed_secs": elapsed,
            "videos_per_sec": videos_per_sec,
            "devices": devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(rgb: &[f32]) -> WindowFeatures {
        let mut w = WindowFeatures::new();
        w.insert("rgb".to_string(), rgb.to_vec());
        w
    }

    #[test]
    fn test_builder_assembles_matrix() {
        let mut builder = FeatureRecordBuilder::new(PathBuf::from("a.mp4"), "a", 25.0);
        builder
            .push(WindowSpan { start: 0, end: 4 }, 0.0, window(&[1.0, 2.0]))
            .unwrap();
        builder
            .push(WindowSpan { start: 4, end: 8 }, 160.0, window(&[3.0, 4.0]))
            .unwrap();
        let record = builder.finish().unwrap();

        assert_eq!(record.window_count(), 2);
        assert_eq!(record.timestamps_ms, vec![0.0, 160.0]);
        let rgb = &record.features["rgb"];
        assert_eq!(rgb.dim(), (2, 2));
        assert_eq!(rgb[[1, 0]], 3.0);
    }

    #[test]
    fn test_builder_rejects_shape_change() {
        let mut builder = FeatureRecordBuilder::new(PathBuf::from("a.mp4"), "a", 25.0);
        builder
            .push(WindowSpan { start: 0, end: 4 }, 0.0, window(&[1.0, 2.0]))
            .unwrap();
        let err = builder
            .push(WindowSpan { start: 4, end: 8 }, 160.0, window(&[1.0]))
            .unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_builder_rejects_new_stream_midway() {
        let mut builder = FeatureRecordBuilder::new(PathBuf::from("a.mp4"), "a", 25.0);
        builder
            .push(WindowSpan { start: 0, end: 4 }, 0.0, window(&[1.0]))
            .unwrap();
        let mut other = WindowFeatures::new();
        other.insert("flow".to_string(), vec![1.0]);
        assert!(builder
            .push(WindowSpan { start: 4, end: 8 }, 160.0, other)
            .is_err());
    }

    #[test]
    fn test_builder_holds_extractor_streams() {
        let streams = vec!["flow".to_string(), "rgb".to_string()];
        let mut builder =
            FeatureRecordBuilder::new(PathBuf::from("a.mp4"), "a", 25.0).expecting(&streams);
        let err = builder
            .push(WindowSpan { start: 0, end: 4 }, 0.0, window(&[1.0]))
            .unwrap_err();
        assert!(matches!(err, ModelError::MalformedInput(_)));

        let mut both = window(&[1.0]);
        both.insert("flow".to_string(), vec![2.0]);
        builder
            .push(WindowSpan { start: 0, end: 4 }, 0.0, both)
            .unwrap();
        assert_eq!(builder.finish().unwrap().stem, "a");
    }

    #[test]
    fn test_empty_record_has_no_streams() {
        let record = FeatureRecordBuilder::new(PathBuf::from("short.mp4"), "short", 30.0)
            .finish()
            .unwrap();
        assert_eq!(record.window_count(), 0);
        assert!(record.features.is_empty());
    }

    #[test]
    fn test_progress_tracks_devices() {
        let params = Arc::new(ExtractionParams {
            stack_size: 4,
            step_size: 4,
            sampling: Sampling::Native,
            keep_frames: false,
            tmp_path: PathBuf::from("tmp"),
        });
        let task = |rank| VideoTask {
            video: PathBuf::from(format!("{rank}.mp4")),
            rank,
            stem: rank.to_string(),
            device: Device::cuda(0),
            params: params.clone(),
        };
        let assignments = vec![DeviceAssignment {
            device: Device::cuda(0),
            tasks: vec![task(0), task(1)],
        }];
        let state = ExtractionState::new(&assignments);
        state.record_video(&Device::cuda(0), 100.0, false);
        state.record_video(&Device::cuda(0), 200.0, true);

        let json = state.to_progress_json();
        assert_eq!(json["total_videos"], 2);
        assert_eq!(json["done"], 2);
        assert_eq!(json["devices"]["cuda:0"]["failed"], 1);
        assert_eq!(json["devices"]["cuda:0"]["ms_per_video"], 110.0);
    }
}
