// Device worker: runs every task of one device in assignment order.
//
// Each task streams frames from the frame source into a window buffer and
// feeds full windows to the device's extractor. Per-video failures become
// notices and the worker moves on; only a sink failure stops it.

use crate::error::{ModelError, SinkError};
use crate::pipeline::device::Device;
use crate::pipeline::extractor::FeatureExtractor;
use crate::pipeline::sink::{ResultSink, SinkOutcome};
use crate::pipeline::types::{
    DeviceAssignment, ExtractionState, FailureKind, FailureNotice, FeatureRecord,
    FeatureRecordBuilder, VideoTask,
};
use crate::pipeline::windowing::WindowBuffer;
use crate::video::retention::FrameRetention;
use crate::video::{Frame, FrameSource};
use crossbeam::channel::Sender;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Emitted by workers as soon as a video is settled.
#[derive(Debug)]
pub enum WorkerEvent {
    Returned {
        rank: usize,
        record: FeatureRecord,
    },
    Stored {
        rank: usize,
        video: PathBuf,
        windows: usize,
        files: Vec<PathBuf>,
    },
    Failed(FailureNotice),
}

impl WorkerEvent {
    pub fn rank(&self) -> usize {
        match self {
            WorkerEvent::Returned { rank, .. } | WorkerEvent::Stored { rank, .. } => *rank,
            WorkerEvent::Failed(notice) => notice.rank,
        }
    }
}

/// Everything a worker needs besides its assignment.
pub struct WorkerContext {
    pub source: Arc<dyn FrameSource>,
    pub extractor: Box<dyn FeatureExtractor>,
    pub sink: Arc<dyn ResultSink>,
    pub events: Sender<WorkerEvent>,
    pub state: Arc<ExtractionState>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// A sink failure stopped the worker after `settled` tasks.
#[derive(Debug)]
pub struct WorkerAbort {
    pub settled: usize,
    pub error: SinkError,
}

enum TaskError {
    Decode(String),
    Model {
        completed_windows: usize,
        error: ModelError,
    },
    Cancelled,
}

pub fn run_worker(
    assignment: DeviceAssignment,
    mut ctx: WorkerContext,
) -> Result<WorkerSummary, WorkerAbort> {
    let device = assignment.device;
    let mut summary = WorkerSummary::default();
    tracing::info!(
        "Worker {} starting with {} video(s)",
        device,
        assignment.tasks.len()
    );

    for (position, task) in assignment.tasks.iter().enumerate() {
        let start_inst = Instant::now();

        let outcome = if ctx.state.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            process_task(
                task,
                &device,
                ctx.source.as_ref(),
                ctx.extractor.as_mut(),
                &ctx.state,
            )
        };

        let event = match outcome {
            Ok(record) => {
                let windows = record.window_count();
                match ctx.sink.consume(record) {
                    Ok(SinkOutcome::Returned(record)) => WorkerEvent::Returned {
                        rank: task.rank,
                        record,
                    },
                    Ok(SinkOutcome::Stored(files)) => WorkerEvent::Stored {
                        rank: task.rank,
                        video: task.video.clone(),
                        windows,
                        files,
                    },
                    Err(error) => {
                        tracing::error!(
                            "Worker {}: sink failed for {}: {}",
                            device,
                            task.video.display(),
                            error
                        );
                        let notice =
                            FailureNotice::new(task, FailureKind::SinkWrite, error.to_string());
                        ctx.state.record_video(&device, elapsed_ms(start_inst), true);
                        let _ = ctx.events.send(WorkerEvent::Failed(notice));
                        return Err(WorkerAbort {
                            settled: position + 1,
                            error,
                        });
                    }
                }
            }
            Err(err) => WorkerEvent::Failed(failure_notice(task, err)),
        };

        let failed = matches!(event, WorkerEvent::Failed(_));
        if let WorkerEvent::Failed(notice) = &event {
            tracing::warn!(
                "Extraction failed at {} on {}: {}. Continuing extraction",
                notice.video.display(),
                device,
                notice.reason
            );
            summary.failed += 1;
        } else {
            summary.succeeded += 1;
        }
        ctx.state.record_video(&device, elapsed_ms(start_inst), failed);

        if ctx.events.send(event).is_err() {
            tracing::warn!("Worker {}: coordinator stopped listening", device);
            break;
        }
    }

    tracing::info!(
        "Worker {} finished: {} succeeded, {} failed",
        device,
        summary.succeeded,
        summary.failed
    );
    Ok(summary)
}

fn failure_notice(task: &VideoTask, err: TaskError) -> FailureNotice {
    match err {
        TaskError::Decode(reason) => FailureNotice::new(task, FailureKind::Decode, reason),
        TaskError::Model {
            completed_windows,
            error,
        } => FailureNotice::new(
            task,
            FailureKind::Model { completed_windows },
            error.to_string(),
        ),
        TaskError::Cancelled => {
            FailureNotice::new(task, FailureKind::Cancelled, "extraction cancelled")
        }
    }
}

/// Decode, window and extract one video.
fn process_task(
    task: &VideoTask,
    device: &Device,
    source: &dyn FrameSource,
    extractor: &mut dyn FeatureExtractor,
    state: &ExtractionState,
) -> Result<FeatureRecord, TaskError> {
    let params = &task.params;
    let mut reader = source
        .open(&task.video, params.sampling)
        .map_err(|e| TaskError::Decode(e.to_string()))?;

    let mut retention = if params.keep_frames {
        Some(
            FrameRetention::create(&params.tmp_path, &task.stem)
                .map_err(|e| TaskError::Decode(format!("{:#}", e)))?,
        )
    } else {
        None
    };

    let fps = reader.output_fps();
    tracing::debug!(
        "Decoding {}: ~{} frames at {:.2} fps (source {:.2} fps)",
        task.video.display(),
        reader.frame_count(),
        fps,
        reader.source_fps()
    );
    let mut builder = FeatureRecordBuilder::new(task.video.clone(), task.stem.clone(), fps)
        .expecting(extractor.streams());
    let mut buffer: WindowBuffer<Frame> = WindowBuffer::new(params.stack_size, params.step_size);

    loop {
        if state.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let frame = match reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => return Err(TaskError::Decode(format!("{:#}", e))),
        };

        if let Some(retention) = retention.as_mut() {
            retention
                .save(&frame)
                .map_err(|e| TaskError::Decode(format!("{:#}", e)))?;
        }

        let Some(span) = buffer.push(frame) else {
            continue;
        };
        let window = buffer.window();
        let start_ms = window.first().map(|f| f.timestamp_ms).unwrap_or_default();
        let completed_windows = builder.len();
        let features = extractor
            .extract(window, device)
            .map_err(|error| TaskError::Model {
                completed_windows,
                error,
            })?;
        tracing::debug!(
            "{} window [{}, {}) on {}",
            task.video.display(),
            span.start,
            span.end,
            device
        );
        builder
            .push(span, start_ms, features)
            .map_err(|error| TaskError::Model {
                completed_windows,
                error,
            })?;
    }

    if builder.is_empty() {
        tracing::info!(
            "{} is shorter than one window of {} frames, no features",
            task.video.display(),
            params.stack_size
        );
    }

    let completed_windows = builder.len();
    let record = builder.finish().map_err(|error| TaskError::Model {
        completed_windows,
        error,
    })?;

    if let Some(retention) = retention {
        let frames = retention.written();
        let dir = retention.commit();
        tracing::info!(
            "Kept {} decoded frames of {} at {}",
            frames,
            task.video.display(),
            dir.display()
        );
    }
    Ok(record)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
