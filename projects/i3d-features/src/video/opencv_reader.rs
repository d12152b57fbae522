use super::{sampled_units, unit_to_frame, Frame, Sampling, VideoReader};
use anyhow::{anyhow, Result};
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_HW_ACCELERATION,
        CAP_PROP_POS_FRAMES, VIDEO_ACCELERATION_ANY,
    },
};
use std::path::Path;

pub struct OpencvReader {
    capture: VideoCapture,
    source_fps: f64,
    sampling: Sampling,
    total_frames: usize,
    /// Next sampled unit to hand out.
    next_unit: usize,
    /// Source frame index the capture will read next.
    position: usize,
    /// Last converted frame, reused when upsampling repeats a source frame.
    last_image: Option<RgbImage>,
}

impl OpencvReader {
    pub fn new(path: &Path, sampling: Sampling) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 video path: {:?}", path))?;
        let mut capture = VideoCapture::from_file(path_str, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path_str));
        }

        // Try to enable hardware acceleration (VA-API on Linux, VideoToolbox on macOS, etc.)
        match capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            Ok(true) => tracing::debug!("OpencvReader: hardware acceleration enabled"),
            _ => tracing::debug!("OpencvReader: hardware acceleration not available"),
        }

        let fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 || !fps.is_finite() {
            return Err(anyhow!("No decodable video stream in {} (fps={})", path_str, fps));
        }
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;

        tracing::info!(
            "OpencvReader: opened {}, duration={:.2}s, fps={:.2}, stream_frames={}",
            path_str,
            raw_count as f64 / fps,
            fps,
            raw_count
        );

        Ok(Self {
            capture,
            source_fps: fps,
            sampling,
            total_frames: raw_count,
            next_unit: 0,
            position: 0,
            last_image: None,
        })
    }

    fn read_image(&mut self) -> Result<Option<RgbImage>> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        self.position += 1;
        Ok(Some(mat_to_rgb_image(&frame)?))
    }
}

impl VideoReader for OpencvReader {
    fn frame_count(&self) -> usize {
        sampled_units(self.total_frames, self.source_fps, self.sampling)
    }

    fn source_fps(&self) -> f64 {
        self.source_fps
    }

    fn output_fps(&self) -> f64 {
        self.sampling.output_fps(self.source_fps)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let target = unit_to_frame(self.next_unit, self.source_fps, self.sampling);

        let image = if target + 1 == self.position {
            // Upsampling: the target source frame was already converted
            match &self.last_image {
                Some(img) => img.clone(),
                None => return Ok(None),
            }
        } else {
            while self.position < target {
                if !self.capture.grab()? {
                    return Ok(None);
                }
                self.position += 1;
            }
            let mut image = self.read_image()?;
            if image.is_none() && self.next_unit == 0 {
                // Re-encoded streams sometimes lose their first frame
                tracing::debug!("OpencvReader: first frame missing, skipping it");
                image = self.read_image()?;
            }
            match image {
                Some(img) => {
                    self.last_image = Some(img.clone());
                    img
                }
                None => return Ok(None),
            }
        };

        let frame = Frame {
            index: self.next_unit,
            timestamp_ms: (self.position - 1) as f64 / self.source_fps * 1000.0,
            image,
        };
        self.next_unit += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.capture.set(CAP_PROP_POS_FRAMES, 0.0)?;
        self.next_unit = 0;
        self.position = 0;
        self.last_image = None;
        Ok(())
    }
}

/// Convert an OpenCV Mat (BGR) to an owned RGB image.
fn mat_to_rgb_image(mat: &Mat) -> Result<RgbImage> {
    let mut rgb_mat = Mat::default();
    imgproc::cvt_color_def(mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let data = rgb_mat.data_bytes()?;
    RgbImage::from_raw(size.width as u32, size.height as u32, data.to_vec())
        .ok_or_else(|| anyhow!("Failed to create RGB image from Mat data"))
}
