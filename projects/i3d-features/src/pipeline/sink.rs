//! Result sinks: where finished feature records go.
//!
//! One sink instance is shared by every worker, so implementations must be
//! safe to call concurrently. Both sinks here keep no mutable state; the
//! storage sink only ever writes files derived from the record's video.

use crate::error::SinkError;
use crate::pipeline::types::FeatureRecord;
use ndarray::{arr0, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// What happened to a record handed to a sink.
#[derive(Debug)]
pub enum SinkOutcome {
    /// The caller gets the record back.
    Returned(FeatureRecord),
    /// The record was persisted to these files.
    Stored(Vec<PathBuf>),
}

pub trait ResultSink: Send + Sync {
    fn consume(&self, record: FeatureRecord) -> Result<SinkOutcome, SinkError>;
}

/// Hands every record back to the coordinator.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySink;

impl ResultSink for MemorySink {
    fn consume(&self, record: FeatureRecord) -> Result<SinkOutcome, SinkError> {
        Ok(SinkOutcome::Returned(record))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    Npy,
    Json,
}

/// Writes each record under `output_path`, named after the video stem.
#[derive(Debug, Clone)]
pub struct StorageSink {
    output_path: PathBuf,
    format: StorageFormat,
}

impl StorageSink {
    pub fn new(output_path: impl Into<PathBuf>, format: StorageFormat) -> Self {
        Self {
            output_path: output_path.into(),
            format,
        }
    }

    fn write_npy(&self, stem: &str, record: &FeatureRecord) -> Result<Vec<PathBuf>, SinkError> {
        let mut written = Vec::new();
        for (stream, features) in &record.features {
            let path = self.output_path.join(format!("{}_{}.npy", stem, stream));
            write_array(&path, features)?;
            written.push(path);
        }

        let fps_path = self.output_path.join(format!("{}_fps.npy", stem));
        ndarray_npy::write_npy(&fps_path, &arr0(record.fps)).map_err(|e| SinkError::Array {
            path: fps_path.clone(),
            message: e.to_string(),
        })?;
        written.push(fps_path);

        let ts_path = self.output_path.join(format!("{}_timestamps_ms.npy", stem));
        let timestamps = Array1::from_vec(record.timestamps_ms.clone());
        ndarray_npy::write_npy(&ts_path, &timestamps).map_err(|e| SinkError::Array {
            path: ts_path.clone(),
            message: e.to_string(),
        })?;
        written.push(ts_path);

        Ok(written)
    }

    fn write_json(&self, stem: &str, record: &FeatureRecord) -> Result<Vec<PathBuf>, SinkError> {
        let path = self.output_path.join(format!("{}.json", stem));
        let document = JsonRecord::from(record);
        let json = serde_json::to_string(&document)?;
        fs::write(&path, json).map_err(|e| SinkError::write(&path, e))?;
        Ok(vec![path])
    }
}

impl ResultSink for StorageSink {
    fn consume(&self, record: FeatureRecord) -> Result<SinkOutcome, SinkError> {
        fs::create_dir_all(&self.output_path).map_err(|e| SinkError::write(&self.output_path, e))?;
        let written = match self.format {
            StorageFormat::Npy => self.write_npy(&record.stem, &record)?,
            StorageFormat::Json => self.write_json(&record.stem, &record)?,
        };
        tracing::debug!(
            "Stored {} windows of {} in {} file(s)",
            record.window_count(),
            record.video.display(),
            written.len()
        );
        Ok(SinkOutcome::Stored(written))
    }
}

fn write_array(path: &Path, array: &Array2<f32>) -> Result<(), SinkError> {
    ndarray_npy::write_npy(path, array).map_err(|e| SinkError::Array {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn video_stem(video: &Path) -> String {
    video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
}

/// One output name per input video, in input order. Names are the file stem;
/// a stem already taken by an earlier input gets its input position appended.
pub fn output_stems(videos: &[PathBuf]) -> Vec<String> {
    let mut taken = HashSet::new();
    videos
        .iter()
        .enumerate()
        .map(|(rank, video)| {
            let stem = video_stem(video);
            let mut name = stem.clone();
            let mut suffix = rank;
            while !taken.insert(name.clone()) {
                name = format!("{}_{}", stem, suffix);
                suffix += 1;
            }
            if name != stem {
                tracing::warn!(
                    "{} shares the name '{}' with an earlier input, writing it as '{}'",
                    video.display(),
                    stem,
                    name
                );
            }
            name
        })
        .collect()
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    video: &'a Path,
    fps: f64,
    windows: &'a [crate::pipeline::windowing::WindowSpan],
    timestamps_ms: &'a [f64],
    features: BTreeMap<&'a str, Vec<Vec<f32>>>,
}

impl<'a> From<&'a FeatureRecord> for JsonRecord<'a> {
    fn from(record: &'a FeatureRecord) -> Self {
        let features = record
            .features
            .iter()
            .map(|(stream, array)| {
                let rows = array.rows().into_iter().map(|row| row.to_vec()).collect();
                (stream.as_str(), rows)
            })
            .collect();
        Self {
            video: &record.video,
            fps: record.fps,
            windows: &record.windows,
            timestamps_ms: &record.timestamps_ms,
            features,
        }
    }
}

/// What to do with each finished record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExtraction {
    /// Return in memory and print a summary.
    #[default]
    Print,
    SaveNumpy,
    SaveJson,
}

impl OnExtraction {
    pub fn sink(&self, output_path: &Path) -> std::sync::Arc<dyn ResultSink> {
        match self {
            OnExtraction::Print => std::sync::Arc::new(MemorySink),
            OnExtraction::SaveNumpy => {
                std::sync::Arc::new(StorageSink::new(output_path, StorageFormat::Npy))
            }
            OnExtraction::SaveJson => {
                std::sync::Arc::new(StorageSink::new(output_path, StorageFormat::Json))
            }
        }
    }
}

impl fmt::Display for OnExtraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnExtraction::Print => write!(f, "print"),
            OnExtraction::SaveNumpy => write!(f, "save_numpy"),
            OnExtraction::SaveJson => write!(f, "save_json"),
        }
    }
}

impl FromStr for OnExtraction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "print" => Ok(OnExtraction::Print),
            "save_numpy" => Ok(OnExtraction::SaveNumpy),
            "save_json" => Ok(OnExtraction::SaveJson),
            other => Err(format!("unknown on_extraction action: {}", other)),
        }
    }
}
