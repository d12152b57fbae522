use crate::error::{ConfigError, ConfigResult};
use crate::pipeline::orchestrator::{ExtractionReport, StoredVideo};
use crate::pipeline::types::FailureNotice;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm"];
pub const REPORT_FILE: &str = "extraction_report.json";

/// Where the input video list comes from. Sources are combined in field order.
#[derive(Debug, Default, Clone)]
pub struct VideoInputs {
    pub video_paths: Vec<PathBuf>,
    pub file_with_video_paths: Option<PathBuf>,
    pub video_dir: Option<PathBuf>,
}

impl VideoInputs {
    pub fn resolve(&self) -> ConfigResult<Vec<PathBuf>> {
        if self.video_paths.is_empty()
            && self.file_with_video_paths.is_none()
            && self.video_dir.is_none()
        {
            return Err(ConfigError::NoInput(
                "pass video paths, a file with video paths or a video directory".to_string(),
            ));
        }

        let mut videos = self.video_paths.clone();
        if let Some(file) = &self.file_with_video_paths {
            videos.extend(read_path_list(file)?);
        }
        for video in &videos {
            if !video.exists() {
                tracing::warn!("Video not found, it will be reported as failed: {}", video.display());
            }
        }
        if let Some(dir) = &self.video_dir {
            if !dir.is_dir() {
                return Err(ConfigError::NoInput(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
            videos.extend(list_videos(dir));
        }
        tracing::info!("Found {} input video(s)", videos.len());
        Ok(videos)
    }
}

/// One path per line; surrounding whitespace and blank lines are ignored.
pub fn read_path_list(file: &Path) -> ConfigResult<Vec<PathBuf>> {
    let content = fs::read_to_string(file)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

pub fn list_videos(video_root: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(video_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| VIDEO_EXTENSIONS.contains(&s.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    videos.sort();
    videos
}

#[derive(Serialize, Debug)]
struct RecordSummary<'a> {
    video: &'a Path,
    fps: f64,
    windows: usize,
    shapes: BTreeMap<String, (usize, usize)>,
}

#[derive(Serialize, Debug)]
struct RunReport<'a> {
    created_at: DateTime<Utc>,
    succeeded: usize,
    failed: usize,
    returned: Vec<RecordSummary<'a>>,
    stored: &'a [StoredVideo],
    failures: &'a [FailureNotice],
    progress: &'a serde_json::Value,
}

/// Writes `extraction_report.json` under `output_path`.
pub fn write_report(output_path: &Path, report: &ExtractionReport) -> Result<PathBuf> {
    fs::create_dir_all(output_path)
        .with_context(|| format!("Failed to create output directory {}", output_path.display()))?;

    let run_report = RunReport {
        created_at: Utc::now(),
        succeeded: report.succeeded(),
        failed: report.failed(),
        returned: report
            .records
            .iter()
            .map(|r| RecordSummary {
                video: &r.video,
                fps: r.fps,
                windows: r.window_count(),
                shapes: r.shapes(),
            })
            .collect(),
        stored: &report.stored,
        failures: &report.failures,
        progress: &report.progress,
    };

    let path = output_path.join(REPORT_FILE);
    let content = serde_json::to_string_pretty(&run_report)?;
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::device::Device;
    use crate::pipeline::types::{ExtractionParams, FailureKind, VideoTask};
    use crate::video::Sampling;
    use std::sync::Arc;

    #[test]
    fn test_list_videos_filters_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("day1");
        fs::create_dir_all(&nested).unwrap();
        for name in ["b.mp4", "a.MKV", "notes.txt", "day1/c.webm", "day1/d.avi.bak"] {
            fs::write(tmp.path().join(name), b"").unwrap();
        }

        let videos = list_videos(tmp.path());
        let names: Vec<String> = videos
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.MKV", "b.mp4", "day1/c.webm"]);
    }

    #[test]
    fn test_path_list_trims_and_skips_blanks() {
        let tmp = tempfile::tempdir().unwrap();
        let list = tmp.path().join("videos.txt");
        fs::write(&list, "  /data/a.mp4\n\n/data/b.mp4  \n   \n").unwrap();

        let inputs = VideoInputs {
            video_paths: vec![PathBuf::from("/data/first.mp4")],
            file_with_video_paths: Some(list),
            video_dir: None,
        };
        assert_eq!(
            inputs.resolve().unwrap(),
            vec![
                PathBuf::from("/data/first.mp4"),
                PathBuf::from("/data/a.mp4"),
                PathBuf::from("/data/b.mp4"),
            ]
        );
    }

    #[test]
    fn test_no_input_is_fatal() {
        assert!(matches!(
            VideoInputs::default().resolve(),
            Err(ConfigError::NoInput(_))
        ));
        let missing_list = VideoInputs {
            file_with_video_paths: Some(PathBuf::from("/nonexistent/list.txt")),
            ..Default::default()
        };
        assert!(matches!(missing_list.resolve(), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_write_report() {
        let tmp = tempfile::tempdir().unwrap();
        let task = VideoTask {
            video: PathBuf::from("broken.mp4"),
            rank: 3,
            stem: "broken".to_string(),
            device: Device::cuda(1),
            params: Arc::new(ExtractionParams {
                stack_size: 64,
                step_size: 64,
                sampling: Sampling::Native,
                keep_frames: false,
                tmp_path: PathBuf::from("tmp"),
            }),
        };
        let report = ExtractionReport {
            failures: vec![FailureNotice::new(&task, FailureKind::Decode, "no stream")],
            progress: serde_json::json!({ "total_videos": 4 }),
            ..Default::default()
        };

        let path = write_report(&tmp.path().join("out"), &report).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["failed"], 1);
        assert_eq!(value["failures"][0]["kind"], "decode");
        assert_eq!(value["failures"][0]["device"], "cuda:1");
        assert_eq!(value["progress"]["total_videos"], 4);
        assert!(value["created_at"].is_string());
    }
}
