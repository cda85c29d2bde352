//! Frame source capability.
//!
//! The scheduler consumes exactly one hardware capability: something that produces
//! frames. Device configuration (exposure, trigger wiring, light-source sequencing)
//! happens before a run and is not part of this trait; the scheduler receives a
//! source that is ready to capture.
//!
//! Two acquisition styles are covered:
//!
//! - **Snap**: [`FrameSource::snap_one`] triggers and waits for a single frame.
//! - **Burst**: [`FrameSource::start_burst`] declares N captures up front; frames
//!   accumulate in a bounded circular buffer and are drained with
//!   [`FrameSource::pop_next`].
//!
//! # Design Philosophy
//!
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Buffer queries are cheap, synchronous reads of the driver's counters
//!
//! # Example
//!
//! ```rust,ignore
//! source.start_burst(10, Duration::ZERO).await?;
//! while let Some(frame) = source.pop_next().await? {
//!     println!("{}x{}", frame.width, frame.height);
//! }
//! source.stop_burst().await?;
//! ```

use async_trait::async_trait;
use std::time::Duration;

use crate::data::Frame;
use crate::error::AcqResult;
use crate::experiment::buffer::BufferSnapshot;

/// Size and depth of the frames a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per pixel
    pub bytes_per_pixel: u32,
}

/// Capability: produce image frames on request or in bursts.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Geometry of the frames this source currently produces.
    fn geometry(&self) -> FrameGeometry;

    /// Trigger one exposure and return the frame. No buffering is involved.
    async fn snap_one(&self) -> AcqResult<Frame>;

    /// Start a pre-declared burst of `count` captures spaced by `interval`.
    async fn start_burst(&self, count: u64, interval: Duration) -> AcqResult<()>;

    /// Stop an outstanding burst. Calling it with no burst running is a no-op.
    async fn stop_burst(&self) -> AcqResult<()>;

    /// Free slots in the circular buffer.
    fn buffer_free(&self) -> u64;

    /// Total slots in the circular buffer.
    fn buffer_total(&self) -> u64;

    /// True once the buffer has overflowed and frames were dropped.
    fn is_overflowed(&self) -> bool;

    /// Remove the oldest buffered frame, `None` when the buffer is empty.
    async fn pop_next(&self) -> AcqResult<Option<Frame>>;

    /// Resolve when a frame may have become available.
    ///
    /// Callers always bound this with a timeout. The default never resolves, so
    /// sources without arrival notifications are simply re-polled once per timeout.
    async fn wait_for_frame(&self) {
        std::future::pending::<()>().await
    }

    /// Current buffer occupancy in one read.
    fn buffer_snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            free: self.buffer_free(),
            total: self.buffer_total(),
            overflowed: self.is_overflowed(),
        }
    }
}
