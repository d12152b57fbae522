// Extraction coordinator: partitions videos over devices and runs one worker
// thread per device.
//
// Workers report each settled video over a crossbeam channel. The coordinator
// drains it while they run, relays Ctrl-C into the shared state, and after
// joining marks whatever a stopped worker never reached as aborted.

use crate::config::ExtractionConfig;
use crate::error::{ConfigError, SinkError};
use crate::pipeline::device::Device;
use crate::pipeline::extractor::{ExtractorFactory, FeatureExtractor};
use crate::pipeline::sink::{output_stems, ResultSink};
use crate::pipeline::types::{
    DeviceAssignment, ExtractionParams, ExtractionState, FailureKind, FailureNotice,
    FeatureRecord, VideoTask,
};
use crate::pipeline::worker::{run_worker, WorkerAbort, WorkerContext, WorkerEvent, WorkerSummary};
use crate::video::FrameSource;
use crossbeam::channel::{self, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Video `i` goes to `devices[i % devices.len()]`, keeping input order per device.
/// Each task gets an output name no other input of the run shares.
pub fn partition(
    videos: &[PathBuf],
    devices: &[Device],
    params: Arc<ExtractionParams>,
) -> Vec<DeviceAssignment> {
    let mut assignments: Vec<DeviceAssignment> = devices
        .iter()
        .map(|&device| DeviceAssignment {
            device,
            tasks: Vec::new(),
        })
        .collect();
    if assignments.is_empty() {
        return assignments;
    }

    let n = assignments.len();
    let stems = output_stems(videos);
    for (rank, (video, stem)) in videos.iter().zip(stems).enumerate() {
        let assignment = &mut assignments[rank % n];
        assignment.tasks.push(VideoTask {
            video: video.clone(),
            rank,
            stem,
            device: assignment.device,
            params: params.clone(),
        });
    }
    assignments
}

/// A record the sink persisted instead of returning.
#[derive(Debug, Clone, Serialize)]
pub struct StoredVideo {
    pub rank: usize,
    pub video: PathBuf,
    pub windows: usize,
    pub files: Vec<PathBuf>,
}

/// Outcome of one extraction, every list in input order.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub records: Vec<FeatureRecord>,
    pub stored: Vec<StoredVideo>,
    pub failures: Vec<FailureNotice>,
    pub progress: serde_json::Value,
}

impl ExtractionReport {
    pub fn succeeded(&self) -> usize {
        self.records.len() + self.stored.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

type WorkerHandle = JoinHandle<Result<WorkerSummary, WorkerAbort>>;

pub struct Coordinator {
    config: ExtractionConfig,
    source: Arc<dyn FrameSource>,
    factory: Arc<dyn ExtractorFactory>,
    sink: Arc<dyn ResultSink>,
    cancelled: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(
        config: ExtractionConfig,
        source: Arc<dyn FrameSource>,
        factory: Arc<dyn ExtractorFactory>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            source,
            factory,
            sink,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set it to stop the run; workers finish their current window first.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn extract(&self, videos: &[PathBuf]) -> Result<ExtractionReport, ConfigError> {
        self.config.validate()?;
        if videos.is_empty() {
            tracing::info!("No videos to extract");
            return Ok(ExtractionReport {
                progress: ExtractionState::new(&[]).to_progress_json(),
                ..Default::default()
            });
        }

        // Every device must come up before any video is touched.
        let mut extractors: Vec<Box<dyn FeatureExtractor>> = Vec::new();
        for device in &self.config.devices {
            let extractor = self
                .factory
                .create(device)
                .map_err(|source| ConfigError::DeviceInit {
                    device: device.to_string(),
                    source,
                })?;
            tracing::info!("Initialized extractor on {}", device);
            extractors.push(extractor);
        }

        let params = Arc::new(self.config.params());
        let assignments = partition(videos, &self.config.devices, params);
        let state = Arc::new(ExtractionState::new(&assignments));
        if self.cancelled.load(Ordering::Relaxed) {
            state.cancel();
        }

        let pb = self.progress_bar(videos.len());
        let (tx, rx) = channel::unbounded::<WorkerEvent>();

        let mut workers: Vec<(DeviceAssignment, Option<WorkerHandle>)> = Vec::new();
        for (assignment, extractor) in assignments.into_iter().zip(extractors) {
            let ctx = WorkerContext {
                source: self.source.clone(),
                extractor,
                sink: self.sink.clone(),
                events: tx.clone(),
                state: state.clone(),
            };
            let handle = spawn_worker(assignment.clone(), ctx);
            workers.push((assignment, handle));
        }
        drop(tx);

        let mut report = ExtractionReport::default();
        let mut records: Vec<(usize, FeatureRecord)> = Vec::new();
        let mut settled: HashSet<usize> = HashSet::new();
        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(event) => {
                    settled.insert(event.rank());
                    pb.inc(1);
                    match event {
                        WorkerEvent::Returned { rank, record } => records.push((rank, record)),
                        WorkerEvent::Stored {
                            rank,
                            video,
                            windows,
                            files,
                        } => report.stored.push(StoredVideo {
                            rank,
                            video,
                            windows,
                            files,
                        }),
                        WorkerEvent::Failed(notice) => report.failures.push(notice),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.cancelled.load(Ordering::Relaxed) && !state.is_cancelled() {
                tracing::warn!("Cancellation requested, stopping workers");
                state.cancel();
            }
        }

        for (assignment, handle) in workers {
            let reason = match handle.map(|h| h.join()) {
                Some(Ok(Ok(_))) => continue,
                Some(Ok(Err(abort))) => aborted_reason(&assignment.device, &abort.error),
                Some(Err(_)) => format!("worker {} panicked", assignment.device),
                None => format!("worker {} could not be started", assignment.device),
            };
            for task in assignment.tasks.iter().filter(|t| !settled.contains(&t.rank)) {
                tracing::warn!("{}: {}", task.video.display(), reason);
                report
                    .failures
                    .push(FailureNotice::new(task, FailureKind::WorkerAborted, reason.clone()));
                pb.inc(1);
            }
        }
        pb.finish_with_message("Done");

        records.sort_by_key(|(rank, _)| *rank);
        report.records = records.into_iter().map(|(_, record)| record).collect();
        report.stored.sort_by_key(|s| s.rank);
        report.failures.sort_by_key(|f| f.rank);

        state.is_complete.store(true, Ordering::Relaxed);
        report.progress = state.to_progress_json();
        tracing::info!(
            "Extraction finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} videos ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

/// Counts a running worker; released on drop so panics are counted too.
struct ActiveWorker(Arc<ExtractionState>);

impl ActiveWorker {
    fn register(state: Arc<ExtractionState>) -> Self {
        state.active_workers.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

fn spawn_worker(assignment: DeviceAssignment, ctx: WorkerContext) -> Option<WorkerHandle> {
    let device = assignment.device;
    let active = ActiveWorker::register(ctx.state.clone());

    let spawned = thread::Builder::new()
        .name(format!("worker-{}", device))
        .spawn(move || {
            let _active = active;
            let result = run_worker(assignment, ctx);
            if let Err(abort) = &result {
                tracing::error!("Worker {} stopped: {}", device, abort.error);
            }
            result
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("Failed to spawn worker for {}: {}", device, e);
            None
        }
    }
}

fn aborted_reason(device: &Device, error: &SinkError) -> String {
    format!("worker {} stopped after sink failure: {}", device, error)
}
