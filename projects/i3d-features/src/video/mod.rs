pub mod ffmpeg_reader;
pub mod opencv_reader;
pub mod retention;

use crate::error::DecodeError;
use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A decoded RGB frame tagged with its position in the sampled sequence.
#[derive(Clone, Debug)]
pub struct Frame {
    pub index: usize,
    pub timestamp_ms: f64,
    pub image: RgbImage,
}

/// Temporal sampling requested from a reader.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sampling {
    Native,
    Fps(f64),
}

impl Sampling {
    pub fn from_fps(fps: Option<f64>) -> Self {
        match fps {
            Some(fps) => Sampling::Fps(fps),
            None => Sampling::Native,
        }
    }

    /// Effective output rate for a source running at `source_fps`.
    pub fn output_fps(&self, source_fps: f64) -> f64 {
        match self {
            Sampling::Native => source_fps,
            Sampling::Fps(fps) => *fps,
        }
    }
}

pub trait VideoReader: Send {
    /// Estimated number of sampled frames.
    fn frame_count(&self) -> usize;
    fn source_fps(&self) -> f64;
    /// Rate of the frames this reader yields.
    fn output_fps(&self) -> f64;
    /// Next sampled frame in presentation order, `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
    /// Restart the sequence from the first frame.
    fn rewind(&mut self) -> Result<()>;
}

/// Opens videos for the workers. Implementations are shared across worker
/// threads; every `open` returns a reader exclusively owned by its caller.
pub trait FrameSource: Send + Sync {
    fn open(&self, path: &Path, sampling: Sampling) -> Result<Box<dyn VideoReader>, DecodeError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderBackend {
    #[default]
    Opencv,
    Ffmpeg,
}

impl fmt::Display for DecoderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderBackend::Opencv => write!(f, "opencv"),
            DecoderBackend::Ffmpeg => write!(f, "ffmpeg"),
        }
    }
}

impl FromStr for DecoderBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opencv" => Ok(DecoderBackend::Opencv),
            "ffmpeg" => Ok(DecoderBackend::Ffmpeg),
            other => Err(format!("unknown decoder backend: {}", other)),
        }
    }
}

impl FrameSource for DecoderBackend {
    fn open(&self, path: &Path, sampling: Sampling) -> Result<Box<dyn VideoReader>, DecodeError> {
        if !path.exists() {
            return Err(DecodeError::new(path, "video file not found"));
        }
        let reader: Box<dyn VideoReader> = match self {
            DecoderBackend::Opencv => Box::new(
                opencv_reader::OpencvReader::new(path, sampling)
                    .map_err(|e| DecodeError::from_anyhow(path, e))?,
            ),
            DecoderBackend::Ffmpeg => Box::new(
                ffmpeg_reader::FfmpegReader::new(path, sampling)
                    .map_err(|e| DecodeError::from_anyhow(path, e))?,
            ),
        };
        Ok(reader)
    }
}

/// Source frame index holding sampled unit `unit_id`.
pub fn unit_to_frame(unit_id: usize, source_fps: f64, sampling: Sampling) -> usize {
    match sampling {
        Sampling::Native => unit_id,
        Sampling::Fps(fps) => (unit_id as f64 * source_fps / fps).round() as usize,
    }
}

/// Number of sampled units in a source of `total_frames` frames.
pub fn sampled_units(total_frames: usize, source_fps: f64, sampling: Sampling) -> usize {
    match sampling {
        Sampling::Native => total_frames,
        Sampling::Fps(fps) => (total_frames as f64 * fps / source_fps).floor() as usize,
    }
}

/// Copy a packed RGB24 plane (rows possibly padded to `stride`) into an image.
pub(crate) fn rgb_image_from_plane(
    data: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<RgbImage> {
    let row_len = width as usize * 3;
    let mut buffer = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data
            .get(start..start + row_len)
            .ok_or_else(|| anyhow::anyhow!("frame plane shorter than {}x{}", width, height))?;
        buffer.extend_from_slice(row);
    }
    RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| anyhow::anyhow!("failed to build {}x{} RGB image", width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_to_frame_resampling() {
        // 30 fps source sampled at 10 fps keeps every third frame
        assert_eq!(unit_to_frame(0, 30.0, Sampling::Fps(10.0)), 0);
        assert_eq!(unit_to_frame(1, 30.0, Sampling::Fps(10.0)), 3);
        assert_eq!(unit_to_frame(7, 30.0, Sampling::Fps(10.0)), 21);
        // Native passes through
        assert_eq!(unit_to_frame(7, 30.0, Sampling::Native), 7);
        // Upsampling repeats source frames
        assert_eq!(unit_to_frame(1, 25.0, Sampling::Fps(50.0)), 1);
        assert_eq!(unit_to_frame(2, 25.0, Sampling::Fps(50.0)), 1);
    }

    #[test]
    fn test_sampled_units() {
        assert_eq!(sampled_units(300, 30.0, Sampling::Fps(10.0)), 100);
        assert_eq!(sampled_units(300, 30.0, Sampling::Native), 300);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("ffmpeg".parse::<DecoderBackend>(), Ok(DecoderBackend::Ffmpeg));
        assert_eq!("OpenCV".parse::<DecoderBackend>(), Ok(DecoderBackend::Opencv));
        assert!("gstreamer".parse::<DecoderBackend>().is_err());
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let err = DecoderBackend::Opencv
            .open(Path::new("/definitely/not/here.mp4"), Sampling::Native)
            .err()
            .expect("missing file must fail");
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_rgb_image_from_padded_plane() {
        // 2x2 image, stride padded to 8 bytes per row
        let data = [
            1, 2, 3, 4, 5, 6, 0, 0, //
            7, 8, 9, 10, 11, 12, 0, 0,
        ];
        let img = rgb_image_from_plane(&data, 2, 2, 8).unwrap();
        assert_eq!(img.get_pixel(1, 1).0, [10, 11, 12]);
        assert!(rgb_image_from_plane(&data[..10], 2, 2, 8).is_err());
    }
}
