use crate::error::ModelError;
use crate::pipeline::device::Device;
use crate::pipeline::types::WindowFeatures;
use crate::video::Frame;

/// Maps a window of frames to one feature vector per stream. An instance is
/// owned by a single worker and only ever called with that worker's device.
pub trait FeatureExtractor: Send {
    /// Stream names every successful `extract` returns.
    fn streams(&self) -> &[String];

    fn extract(&mut self, window: &[Frame], device: &Device) -> Result<WindowFeatures, ModelError>;
}

/// Builds one extractor per device before any worker starts.
pub trait ExtractorFactory: Send + Sync {
    fn create(&self, device: &Device) -> Result<Box<dyn FeatureExtractor>, ModelError>;
}

/// Blanket implementation so closures can act as factories.
impl<F> ExtractorFactory for F
where
    F: Fn(&Device) -> Result<Box<dyn FeatureExtractor>, ModelError> + Send + Sync,
{
    fn create(&self, device: &Device) -> Result<Box<dyn FeatureExtractor>, ModelError> {
        self(device)
    }
}
