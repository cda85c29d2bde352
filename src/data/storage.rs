//! Storage boundary: the sink frames are written to and read back from.
//!
//! The scheduler never knows the on-disk format. It creates one dataset per run, hands
//! over each frame with its coordinate, and closes the dataset exactly once, whatever
//! the outcome.
//!
//! # Coordinate convention
//!
//! Coordinates crossing this boundary are outer-to-inner axis order matching the
//! dataset's [`Shape`], followed by the two pixel-plane entries fixed at 0:
//!
//! ```text
//! shape      [positions, timepoints, channels]  + plane [height, width]
//! coordinate [p,         t,          c]         + [0, 0]
//! ```
//!
//! [`FrameSink::add_image`] receives the bare [`Coordinate`]; implementations that need
//! the padded form call [`Coordinate::with_plane_axes`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::{Frame, PixelType};
use crate::error::AcqResult;
use crate::experiment::coords::{Coordinate, Shape};

/// Opaque identifier of an open dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetHandle(pub String);

impl DatasetHandle {
    /// Handle text as given by the sink.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatasetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Acquisition axes plus the pixel plane of every image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLayout {
    /// Acquisition axes, outer to inner
    pub axes: Shape,
    /// Image rows
    pub height: u32,
    /// Image columns
    pub width: u32,
}

impl DatasetLayout {
    /// Layout of `axes` images, each `height` x `width`.
    pub fn new(axes: Shape, height: u32, width: u32) -> Self {
        Self {
            axes,
            height,
            width,
        }
    }

    /// Axis sizes followed by the plane sizes (height, width).
    pub fn full_shape(&self) -> Vec<u64> {
        let mut full = self.axes.dims().to_vec();
        full.push(self.height as u64);
        full.push(self.width as u64);
        full
    }

    /// Number of images the dataset holds.
    pub fn image_count(&self) -> u64 {
        self.axes.len()
    }
}

/// Destination for acquired frames.
///
/// # Contract
///
/// - `close_dataset` MUST be idempotent: closing an already-closed handle is a no-op.
/// - `add_image` on a closed handle MUST fail rather than corrupt state.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Create a dataset and return its handle.
    async fn create_dataset(
        &self,
        location: &str,
        name: &str,
        layout: &DatasetLayout,
        pixel_type: PixelType,
        summary_metadata: &str,
    ) -> AcqResult<DatasetHandle>;

    /// Store one frame at `coordinate`. Failures map to `AcqError::StorageWrite`.
    async fn add_image(
        &self,
        handle: &DatasetHandle,
        frame: Frame,
        coordinate: &Coordinate,
        image_metadata: &str,
    ) -> AcqResult<()>;

    /// Close the dataset.
    async fn close_dataset(&self, handle: &DatasetHandle) -> AcqResult<()>;
}

/// Read access to a stored dataset, used to address images by coordinate.
#[async_trait]
pub trait DatasetReader: Send + Sync {
    /// Open an existing dataset by name.
    async fn load_dataset(&self, location: &str, name: &str) -> AcqResult<DatasetHandle>;

    /// Axes and image plane of the dataset.
    async fn layout(&self, handle: &DatasetHandle) -> AcqResult<DatasetLayout>;

    /// Stored pixel type.
    async fn pixel_type(&self, handle: &DatasetHandle) -> AcqResult<PixelType>;

    /// Summary metadata JSON written at creation.
    async fn summary_metadata(&self, handle: &DatasetHandle) -> AcqResult<String>;

    /// Fetch the image at `coordinate`, `None` when nothing was written there.
    async fn get_image(
        &self,
        handle: &DatasetHandle,
        coordinate: &Coordinate,
    ) -> AcqResult<Option<Frame>>;

    /// Per-image metadata JSON at `coordinate`.
    async fn image_metadata(
        &self,
        handle: &DatasetHandle,
        coordinate: &Coordinate,
    ) -> AcqResult<Option<String>>;

    /// Release the dataset after reading.
    async fn close_dataset(&self, handle: &DatasetHandle) -> AcqResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_shape_appends_plane() {
        let layout = DatasetLayout::new(Shape::new(vec![2, 3, 1]).unwrap(), 480, 640);
        assert_eq!(layout.full_shape(), vec![2, 3, 1, 480, 640]);
        assert_eq!(layout.image_count(), 6);
    }
}
