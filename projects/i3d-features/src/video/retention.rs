//! Optional on-disk retention of decoded frames.
//!
//! Frames are written as they come out of the reader, so with a target fps
//! the retained images are the resampled sequence, not the source frames.
//! The directory only survives if the video finishes successfully; any
//! earlier drop removes it.

use super::Frame;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct FrameRetention {
    dir: PathBuf,
    written: usize,
    committed: bool,
}

impl FrameRetention {
    /// Prepare `<tmp_path>/<stem>/`. `stem` must be unique within the run,
    /// since an uncommitted retention removes the whole directory.
    pub fn create(tmp_path: &Path, stem: &str) -> Result<Self> {
        let dir = tmp_path.join(stem);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create frame directory {}", dir.display()))?;
        Ok(Self {
            dir,
            written: 0,
            committed: false,
        })
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn save(&mut self, frame: &Frame) -> Result<()> {
        let path = self.dir.join(format!("frame_{:06}.jpg", frame.index));
        frame
            .image
            .save(&path)
            .with_context(|| format!("Failed to write frame {}", path.display()))?;
        self.written += 1;
        Ok(())
    }

    /// Keep the frames on disk.
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.dir.clone()
    }
}

impl Drop for FrameRetention {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            tracing::warn!(
                "Failed to remove retained frames at {}: {}",
                self.dir.display(),
                e
            );
        }
    }
}
