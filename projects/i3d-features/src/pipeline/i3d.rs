//! ONNX Runtime backed I3D extractor.
//!
//! Two optional streams share a window: `rgb` feeds the normalized frames to
//! the RGB backbone, `flow` runs the flow estimator on each consecutive frame
//! pair and feeds the clamped flow fields to the flow backbone.

use crate::error::ModelError;
use crate::pipeline::device::{Device, DeviceKind};
use crate::pipeline::extractor::{ExtractorFactory, FeatureExtractor};
use crate::pipeline::types::WindowFeatures;
use crate::video::Frame;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const RESIZE_SIZE: u32 = 256;
pub const CENTER_CROP_SIZE: u32 = 224;
/// Flow magnitudes are clamped to this bound, then scaled into [-1, 1].
pub const FLOW_BOUND: f32 = 20.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Rgb,
    Flow,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Rgb => "rgb",
            Stream::Flow => "flow",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rgb" => Ok(Stream::Rgb),
            "flow" => Ok(Stream::Flow),
            other => Err(format!("unknown stream: {}", other)),
        }
    }
}

/// Model files for the I3D streams.
#[derive(Clone, Debug, Default)]
pub struct I3dConfig {
    pub streams: Vec<Stream>,
    pub rgb_model: Option<PathBuf>,
    pub flow_model: Option<PathBuf>,
    pub flow_estimator: Option<PathBuf>,
}

impl I3dConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.streams.is_empty() {
            return Err(ModelError::load("at least one stream (rgb, flow) is required"));
        }
        for stream in &self.streams {
            match stream {
                Stream::Rgb if self.rgb_model.is_none() => {
                    return Err(ModelError::load("rgb stream requires an RGB model"));
                }
                Stream::Flow if self.flow_model.is_none() || self.flow_estimator.is_none() => {
                    return Err(ModelError::load(
                        "flow stream requires a flow model and a flow estimator",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Creates one `I3dExtractor` per device, each with its own sessions.
pub struct I3dFactory {
    config: I3dConfig,
}

impl I3dFactory {
    pub fn new(config: I3dConfig) -> Result<Self, ModelError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl ExtractorFactory for I3dFactory {
    fn create(&self, device: &Device) -> Result<Box<dyn FeatureExtractor>, ModelError> {
        Ok(Box::new(I3dExtractor::new(&self.config, device)?))
    }
}

/// A session plus the name of the output we read from it.
struct OnnxModel {
    session: Session,
    output: String,
}

impl OnnxModel {
    fn load(path: &Path, device: &Device) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path)
            .map_err(|e| ModelError::load(format!("{}: {}", path.display(), e)))?;
        let session = create_session(&bytes, device)?;
        let output = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| ModelError::load(format!("{} has no outputs", path.display())))?;
        tracing::info!("Loaded {} on {}", path.display(), device);
        Ok(Self { session, output })
    }

    fn run(&mut self, inputs: Vec<Value>) -> Result<Vec<f32>, ModelError> {
        let outputs = match inputs.len() {
            1 => {
                let mut it = inputs.into_iter();
                let a = it.next().ok_or_else(|| ModelError::malformed("missing input"))?;
                self.session.run(ort::inputs![a])
            }
            2 => {
                let mut it = inputs.into_iter();
                let a = it.next().ok_or_else(|| ModelError::malformed("missing input"))?;
                let b = it.next().ok_or_else(|| ModelError::malformed("missing input"))?;
                self.session.run(ort::inputs![a, b])
            }
            n => return Err(ModelError::malformed(format!("unsupported input count {}", n))),
        }
        .map_err(|e| ModelError::inference(e.to_string()))?;

        let output = outputs
            .get(self.output.as_str())
            .ok_or_else(|| ModelError::inference(format!("missing output '{}'", self.output)))?;
        let tensor = output
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::inference(format!("failed to extract tensor: {}", e)))?;
        Ok(tensor.1.to_vec())
    }
}

/// Create a session pinned to `device`.
fn create_session(model_bytes: &[u8], device: &Device) -> Result<Session, ModelError> {
    let builder = Session::builder()
        .map_err(|e| ModelError::load(format!("failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| ModelError::load(format!("failed to set optimization level: {}", e)))?;

    match device.kind {
        DeviceKind::Cpu => builder
            .commit_from_memory(model_bytes)
            .map_err(|e| ModelError::load(format!("failed to load ONNX model: {}", e))),
        DeviceKind::Cuda => cuda_session(builder, model_bytes, device),
    }
}

#[cfg(feature = "cuda")]
fn cuda_session(
    builder: ort::session::builder::SessionBuilder,
    model_bytes: &[u8],
    device: &Device,
) -> Result<Session, ModelError> {
    use ort::execution_providers::CUDAExecutionProvider;
    let provider = CUDAExecutionProvider::default()
        .with_device_id(device.index as i32)
        .build()
        .error_on_failure();
    builder
        .with_execution_providers([provider])
        .map_err(|e| ModelError::UnsupportedDevice(format!("{}: {}", device, e)))?
        .commit_from_memory(model_bytes)
        .map_err(|e| ModelError::load(format!("failed to load ONNX model: {}", e)))
}

#[cfg(not(feature = "cuda"))]
fn cuda_session(
    _builder: ort::session::builder::SessionBuilder,
    _model_bytes: &[u8],
    device: &Device,
) -> Result<Session, ModelError> {
    Err(ModelError::UnsupportedDevice(format!(
        "{} requested but built without the `cuda` feature",
        device
    )))
}

pub struct I3dExtractor {
    device: Device,
    stream_names: Vec<String>,
    streams: Vec<Stream>,
    rgb: Option<OnnxModel>,
    flow: Option<OnnxModel>,
    flow_estimator: Option<OnnxModel>,
}

impl I3dExtractor {
    pub fn new(config: &I3dConfig, device: &Device) -> Result<Self, ModelError> {
        config.validate()?;
        let wants = |s: Stream| config.streams.contains(&s);

        let load = |path: &Option<PathBuf>| -> Result<Option<OnnxModel>, ModelError> {
            path.as_deref().map(|p| OnnxModel::load(p, device)).transpose()
        };
        let rgb = if wants(Stream::Rgb) {
            load(&config.rgb_model)?
        } else {
            None
        };
        let (flow, flow_estimator) = if wants(Stream::Flow) {
            (load(&config.flow_model)?, load(&config.flow_estimator)?)
        } else {
            (None, None)
        };

        Ok(Self {
            device: *device,
            stream_names: config.streams.iter().map(|s| s.to_string()).collect(),
            streams: config.streams.clone(),
            rgb,
            flow,
            flow_estimator,
        })
    }

    fn rgb_features(&mut self, crops: &[RgbImage]) -> Result<Vec<f32>, ModelError> {
        let model = self
            .rgb
            .as_mut()
            .ok_or_else(|| ModelError::load("rgb model not loaded"))?;
        let input = tensor(rgb_clip(crops), [1, 3, crops.len(), crop_side(), crop_side()])?;
        model.run(vec![input])
    }

    fn flow_features(&mut self, crops: &[RgbImage]) -> Result<Vec<f32>, ModelError> {
        if crops.len() < 2 {
            return Err(ModelError::malformed(format!(
                "flow needs at least 2 frames per window, got {}",
                crops.len()
            )));
        }
        let estimator = self
            .flow_estimator
            .as_mut()
            .ok_or_else(|| ModelError::load("flow estimator not loaded"))?;

        let side = crop_side();
        let plane = side * side;
        let steps = crops.len() - 1;
        let mut clip = vec![0.0f32; 2 * steps * plane];
        for t in 0..steps {
            let prev = tensor(raw_chw(&crops[t]), [1, 3, side, side])?;
            let next = tensor(raw_chw(&crops[t + 1]), [1, 3, side, side])?;
            let field = estimator.run(vec![prev, next])?;
            if field.len() != 2 * plane {
                return Err(ModelError::malformed(format!(
                    "flow estimator returned {} values, expected {}",
                    field.len(),
                    2 * plane
                )));
            }
            for c in 0..2 {
                let dst = &mut clip[(c * steps + t) * plane..(c * steps + t + 1) * plane];
                for (d, v) in dst.iter_mut().zip(&field[c * plane..(c + 1) * plane]) {
                    *d = v.clamp(-FLOW_BOUND, FLOW_BOUND) / FLOW_BOUND;
                }
            }
        }

        let model = self
            .flow
            .as_mut()
            .ok_or_else(|| ModelError::load("flow model not loaded"))?;
        let input = tensor(clip, [1, 2, steps, side, side])?;
        model.run(vec![input])
    }
}

impl FeatureExtractor for I3dExtractor {
    fn streams(&self) -> &[String] {
        &self.stream_names
    }

    fn extract(&mut self, window: &[Frame], device: &Device) -> Result<WindowFeatures, ModelError> {
        if *device != self.device {
            return Err(ModelError::UnsupportedDevice(format!(
                "extractor bound to {} called with {}",
                self.device, device
            )));
        }
        if window.is_empty() {
            return Err(ModelError::malformed("empty window"));
        }

        let crops: Vec<RgbImage> = window.iter().map(|f| resize_and_crop(&f.image)).collect();
        let mut features = WindowFeatures::new();
        for stream in self.streams.clone() {
            let values = match stream {
                Stream::Rgb => self.rgb_features(&crops)?,
                Stream::Flow => self.flow_features(&crops)?,
            };
            if values.is_empty() {
                return Err(ModelError::inference(format!("{} model returned no values", stream)));
            }
            features.insert(stream.to_string(), values);
        }
        Ok(features)
    }
}

fn crop_side() -> usize {
    CENTER_CROP_SIZE as usize
}

fn tensor<const N: usize>(data: Vec<f32>, shape: [usize; N]) -> Result<Value, ModelError> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(ModelError::malformed(format!(
            "tensor {:?} needs {} values, got {}",
            shape,
            expected,
            data.len()
        )));
    }
    Tensor::from_array((shape.to_vec(), data.into_boxed_slice()))
        .map(Value::from)
        .map_err(|e| ModelError::inference(format!("failed to create tensor: {}", e)))
}

/// Resize the shorter side to `RESIZE_SIZE`, then take the central
/// `CENTER_CROP_SIZE` square.
pub fn resize_and_crop(image: &RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = if w <= h {
        (
            RESIZE_SIZE,
            ((h as f64 * RESIZE_SIZE as f64 / w.max(1) as f64).round() as u32).max(RESIZE_SIZE),
        )
    } else {
        (
            ((w as f64 * RESIZE_SIZE as f64 / h.max(1) as f64).round() as u32).max(RESIZE_SIZE),
            RESIZE_SIZE,
        )
    };
    let resized = imageops::resize(image, nw, nh, FilterType::Triangle);
    let x = (nw - CENTER_CROP_SIZE) / 2;
    let y = (nh - CENTER_CROP_SIZE) / 2;
    imageops::crop_imm(&resized, x, y, CENTER_CROP_SIZE, CENTER_CROP_SIZE).to_image()
}

/// `[3, T, H, W]` layout with pixels scaled to [-1, 1].
pub fn rgb_clip(crops: &[RgbImage]) -> Vec<f32> {
    let Some(first) = crops.first() else {
        return Vec::new();
    };
    let (w, h) = first.dimensions();
    let plane = (w * h) as usize;
    let t_len = crops.len();
    let mut data = vec![0.0f32; 3 * t_len * plane];
    for (t, crop) in crops.iter().enumerate() {
        for (i, pixel) in crop.pixels().enumerate() {
            for c in 0..3 {
                data[(c * t_len + t) * plane + i] = pixel[c] as f32 / 255.0 * 2.0 - 1.0;
            }
        }
    }
    data
}

/// `[3, H, W]` layout with raw pixel values, as flow estimators expect.
pub fn raw_chw(image: &RgbImage) -> Vec<f32> {
    let plane = (image.width() * image.height()) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = pixel[c] as f32;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_and_crop_landscape() {
        let img = RgbImage::from_pixel(640, 360, image::Rgb([255, 0, 0]));
        let crop = resize_and_crop(&img);
        assert_eq!(crop.dimensions(), (CENTER_CROP_SIZE, CENTER_CROP_SIZE));
        let px = crop.get_pixel(100, 100).0;
        assert!(px[0] >= 250 && px[1] <= 5 && px[2] <= 5);
    }

    #[test]
    fn test_resize_and_crop_portrait_and_tiny() {
        let portrait = RgbImage::new(120, 300);
        assert_eq!(resize_and_crop(&portrait).dimensions(), (224, 224));
        let tiny = RgbImage::new(3, 2);
        assert_eq!(resize_and_crop(&tiny).dimensions(), (224, 224));
    }

    #[test]
    fn test_rgb_clip_layout() {
        let a = RgbImage::from_pixel(2, 2, image::Rgb([0, 255, 0]));
        let b = RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 0]));
        let clip = rgb_clip(&[a, b]);
        assert_eq!(clip.len(), 3 * 2 * 4);
        // channel 0 (red): frame 0 is -1, frame 1 is +1
        assert_eq!(clip[0], -1.0);
        assert_eq!(clip[4], 1.0);
        // channel 1 (green): frame 0 is +1
        assert_eq!(clip[2 * 4], 1.0);
    }

    #[test]
    fn test_raw_chw_keeps_pixel_range() {
        let img = RgbImage::from_pixel(1, 2, image::Rgb([10, 20, 30]));
        assert_eq!(raw_chw(&img), vec![10.0, 10.0, 20.0, 20.0, 30.0, 30.0]);
    }

    #[test]
    fn test_config_requires_models_for_streams() {
        let mut config = I3dConfig {
            streams: vec![Stream::Rgb, Stream::Flow],
            rgb_model: Some(PathBuf::from("i3d_rgb.onnx")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.flow_model = Some(PathBuf::from("i3d_flow.onnx"));
        config.flow_estimator = Some(PathBuf::from("raft.onnx"));
        assert!(config.validate().is_ok());
        config.streams.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_model_file_fails_to_load() {
        let config = I3dConfig {
            streams: vec![Stream::Rgb],
            rgb_model: Some(PathBuf::from("/no/such/i3d_rgb.onnx")),
            ..Default::default()
        };
        let factory = I3dFactory::new(config).unwrap();
        let err = factory.create(&Device::cpu(0)).err().unwrap();
        assert!(matches!(err, ModelError::Load(_)));
    }

    #[test]
    fn test_stream_parse() {
        assert_eq!("RGB".parse::<Stream>(), Ok(Stream::Rgb));
        assert_eq!("flow".parse::<Stream>(), Ok(Stream::Flow));
        assert!("audio".parse::<Stream>().is_err());
    }
}
