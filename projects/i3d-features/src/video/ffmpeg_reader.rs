use super::{rgb_image_from_plane, sampled_units, unit_to_frame, Frame, Sampling, VideoReader};
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use image::RgbImage;
use std::path::Path;

/// Video reader backed by FFmpeg via ffmpeg-next, software decoding to RGB24.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    width: u32,
    height: u32,
    source_fps: f64,
    sampling: Sampling,
    total_frames: usize,
    /// Next sampled unit to hand out.
    next_unit: usize,
    /// Number of source frames pulled out of the decoder so far.
    frames_decoded: usize,
    last_image: Option<RgbImage>,
    /// Persistent frame object to avoid allocations in the skip loop.
    reuse_frame: ffmpeg_next::util::frame::Video,
    /// Persistent packet object to avoid allocations.
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    /// Whether we've sent EOF to the decoder.
    eof_sent: bool,
}

// SAFETY: a reader is created and used by exactly one worker thread; the raw
// pointers inside the ffmpeg-next types are never shared.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &Path, sampling: Sampling) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let input_ctx = ffmpeg_next::format::input(&path).context("Failed to open video file")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;

        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        if rational_fps.denominator() <= 0 || rational_fps.numerator() <= 0 {
            return Err(anyhow!("Could not determine fps of {}", path.display()));
        }
        let source_fps = rational_fps.numerator() as f64 / rational_fps.denominator() as f64;

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = if stream_frames == 0 {
            (duration_secs * source_fps).round().max(0.0) as usize
        } else {
            stream_frames
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();

        tracing::info!(
            "FfmpegReader: opened {}, duration={:.2}s, fps={:.2}, {}x{}, estimated_frames={}",
            path.display(),
            duration_secs,
            source_fps,
            width,
            height,
            total_frames
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            width,
            height,
            source_fps,
            sampling,
            total_frames,
            next_unit: 0,
            frames_decoded: 0,
            last_image: None,
            reuse_frame: ffmpeg_next::util::frame::Video::empty(),
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pull the next decoded frame into `target`. `Ok(false)` at end of stream.
    fn decode_loop(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            let mut found_packet = false;
            while self.reuse_packet.read(&mut self.input_ctx).is_ok() {
                if self.reuse_packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.reuse_packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    /// Decode and drop one frame without colour conversion.
    fn skip_frame(&mut self) -> Result<bool> {
        let mut frame = ffmpeg_next::util::frame::Video::empty();
        std::mem::swap(&mut frame, &mut self.reuse_frame);
        let res = self.decode_loop(&mut frame);
        std::mem::swap(&mut frame, &mut self.reuse_frame);
        res
    }

    fn decode_image(&mut self) -> Result<Option<RgbImage>> {
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        if !self.decode_loop(&mut raw)? {
            return Ok(None);
        }
        self.frames_decoded += 1;

        let scaler = self.get_or_create_scaler(raw.format())?;
        let mut rgb = ffmpeg_next::util::frame::Video::empty();
        scaler.run(&raw, &mut rgb).context("Scaler failed")?;

        rgb_image_from_plane(rgb.data(0), rgb.width(), rgb.height(), rgb.stride(0)).map(Some)
    }

    fn get_or_create_scaler(
        &mut self,
        src_format: ffmpeg_next::format::Pixel,
    ) -> Result<&mut ffmpeg_next::software::scaling::Context> {
        let scaler = match self.scaler.take() {
            Some(scaler) => scaler,
            None => ffmpeg_next::software::scaling::Context::get(
                src_format,
                self.width,
                self.height,
                ffmpeg_next::format::Pixel::RGB24,
                self.width,
                self.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?,
        };
        Ok(self.scaler.insert(scaler))
    }
}

impl VideoReader for FfmpegReader {
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

        let image = if target + 1 == self.frames_decoded {
            match &self.last_image {
                Some(img) => img.clone(),
                None => return Ok(None),
            }
        } else {
            while self.frames_decoded < target {
                if !self.skip_frame()? {
                    return Ok(None);
                }
                self.frames_decoded += 1;
            }
            match self.decode_image()? {
                Some(img) => {
                    self.last_image = Some(img.clone());
                    img
                }
                None => return Ok(None),
            }
        };

        let frame = Frame {
            index: self.next_unit,
            timestamp_ms: (self.frames_decoded - 1) as f64 / self.source_fps * 1000.0,
            image,
        };
        self.next_unit += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.input_ctx.seek(0, ..0).context("Failed to seek")?;
        self.decoder.flush();
        self.eof_sent = false;
        self.scaler = None;
        self.next_unit = 0;
        self.frames_decoded = 0;
        self.last_image = None;
        Ok(())
    }
}
