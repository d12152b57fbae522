use clap::Parser;
use i3d_features::config::ExtractionConfig;
use i3d_features::pipeline::device::Device;
use i3d_features::pipeline::i3d::{I3dConfig, Stream};
use i3d_features::pipeline::sink::OnExtraction;
use i3d_features::run_context::VideoInputs;
use i3d_features::video::DecoderBackend;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Extract I3D features from videos", long_about = None)]
pub struct Args {
    /// Videos to extract, space or comma separated
    #[arg(long, num_args = 1.., value_delimiter = ',', env = "I3D_VIDEO_PATHS")]
    pub video_paths: Vec<PathBuf>,

    /// Text file with one video path per line
    #[arg(long, env = "I3D_FILE_WITH_VIDEO_PATHS")]
    pub file_with_video_paths: Option<PathBuf>,

    /// Directory scanned recursively for videos
    #[arg(long, env = "I3D_VIDEO_DIR")]
    pub video_dir: Option<PathBuf>,

    /// Devices to run on, e.g. `0,2` or `cuda:0,cpu`. Defaults to `cuda:0`
    /// in CUDA builds and `cpu:0` otherwise
    #[arg(long, num_args = 1.., value_delimiter = ',', env = "I3D_DEVICE_IDS")]
    pub device_ids: Vec<Device>,

    /// Run on the CPU instead of the listed devices
    #[arg(long, env = "I3D_CPU")]
    pub cpu: bool,

    #[arg(long, default_value_t = 64, env = "I3D_STACK_SIZE")]
    pub stack_size: usize,

    #[arg(long, default_value_t = 64, env = "I3D_STEP_SIZE")]
    pub step_size: usize,

    /// Resample videos to this rate before windowing
    #[arg(long, env = "I3D_EXTRACTION_FPS")]
    pub extraction_fps: Option<f64>,

    /// Keep decoded frames in the tmp path
    #[arg(long, env = "I3D_KEEP_FRAMES")]
    pub keep_frames: bool,

    #[arg(long, default_value = "./tmp", env = "I3D_TMP_PATH")]
    pub tmp_path: PathBuf,

    #[arg(long, default_value = "./output", env = "I3D_OUTPUT_PATH")]
    pub output_path: PathBuf,

    /// print, save_numpy or save_json
    #[arg(long, default_value = "print", env = "I3D_ON_EXTRACTION")]
    pub on_extraction: OnExtraction,

    /// Video decoding backend: opencv or ffmpeg
    #[arg(long, default_value = "opencv", env = "I3D_BACKEND")]
    pub backend: DecoderBackend,

    /// ONNX export of the RGB I3D stream
    #[arg(long, env = "I3D_RGB_MODEL")]
    pub rgb_model: Option<PathBuf>,

    /// ONNX export of the flow I3D stream
    #[arg(long, env = "I3D_FLOW_MODEL")]
    pub flow_model: Option<PathBuf>,

    /// ONNX optical flow estimator taking two frames
    #[arg(long, env = "I3D_FLOW_ESTIMATOR")]
    pub flow_estimator: Option<PathBuf>,

    #[arg(long, num_args = 1.., value_delimiter = ',', default_value = "rgb,flow", env = "I3D_STREAMS")]
    pub streams: Vec<Stream>,

    /// Hide the progress bar
    #[arg(long, env = "I3D_NO_PROGRESS")]
    pub no_progress: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn inputs(&self) -> VideoInputs {
        VideoInputs {
            video_paths: self.video_paths.clone(),
            file_with_video_paths: self.file_with_video_paths.clone(),
            video_dir: self.video_dir.clone(),
        }
    }

    pub fn extraction_config(&self) -> ExtractionConfig {
        let devices = if self.cpu {
            vec![Device::cpu(0)]
        } else if self.device_ids.is_empty() {
            vec![Device::preferred()]
        } else {
            self.device_ids.clone()
        };
        ExtractionConfig {
            stack_size: self.stack_size,
            step_size: self.step_size,
            extraction_fps: self.extraction_fps,
            keep_frames: self.keep_frames,
            tmp_path: self.tmp_path.clone(),
            output_path: self.output_path.clone(),
            on_extraction: self.on_extraction,
            devices,
            backend: self.backend,
            show_progress: !self.no_progress,
        }
    }

    pub fn i3d_config(&self) -> I3dConfig {
        I3dConfig {
            streams: self.streams.clone(),
            rgb_model: self.rgb_model.clone(),
            flow_model: self.flow_model.clone(),
            flow_estimator: self.flow_estimator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_config() {
        let args = Args::try_parse_from(["i3d-features", "--video-paths", "a.mp4"]).unwrap();
        let config = args.extraction_config();
        assert_eq!((config.stack_size, config.step_size), (64, 64));
        assert_eq!(config.devices, vec![Device::preferred()]);
        assert_eq!(config.on_extraction, OnExtraction::Print);
        assert_eq!(args.i3d_config().streams, vec![Stream::Rgb, Stream::Flow]);
    }

    #[test]
    fn test_device_list_and_cpu_override() {
        let args = Args::try_parse_from([
            "i3d-features",
            "--video-dir",
            "/videos",
            "--device-ids",
            "0,2",
            "--on-extraction",
            "save_numpy",
            "--backend",
            "ffmpeg",
        ])
        .unwrap();
        let config = args.extraction_config();
        assert_eq!(config.devices, vec![Device::cuda(0), Device::cuda(2)]);
        assert_eq!(config.on_extraction, OnExtraction::SaveNumpy);
        assert_eq!(config.backend, DecoderBackend::Ffmpeg);

        let cpu = Args::try_parse_from(["i3d-features", "--cpu", "--video-paths", "a.mp4"]).unwrap();
        assert_eq!(cpu.extraction_config().devices, vec![Device::cpu(0)]);
    }

    #[test]
    fn test_rejects_unknown_action() {
        assert!(Args::try_parse_from(["i3d-features", "--on-extraction", "save_pickle"]).is_err());
    }
}
