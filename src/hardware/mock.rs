//! Mock Hardware Implementations
//!
//! Provides a simulated camera for testing the scheduler without physical hardware.
//! All mock timing uses async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests can run under a paused tokio clock.
//!
//! # Behaviour
//!
//! - Snap: optional readout delay, then a deterministic test-pattern frame
//! - Burst: a tokio task pushes frames into a bounded circular buffer at the
//!   requested interval; a full buffer drops the frame and raises the overflow flag
//! - Faults: see [`FaultPlan`]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::data::Frame;
use crate::error::{AcqError, AcqResult};
use crate::hardware::capabilities::{FrameGeometry, FrameSource};

/// Error injection points for [`MockCamera`]. All indices are zero-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// The n-th `snap_one` call fails with a capture error
    pub fail_snap_at: Option<u64>,
    /// Burst frames with index >= n are never produced
    pub withhold_from: Option<u64>,
    /// The overflow flag is raised when burst frame n is produced
    pub overflow_at: Option<u64>,
}

#[derive(Debug, Default)]
struct BufferState {
    queue: VecDeque<Frame>,
    overflowed: bool,
}

#[derive(Debug)]
struct Shared {
    geometry: FrameGeometry,
    capacity: u64,
    faults: FaultPlan,
    buffer: Mutex<BufferState>,
    arrived: Notify,
    produced: AtomicU64,
}

impl Shared {
    fn push(&self, frame: Frame, index: u64) {
        {
            let mut buffer = self.buffer.lock();
            if self.faults.overflow_at == Some(index) {
                buffer.overflowed = true;
            }
            if buffer.queue.len() as u64 >= self.capacity {
                buffer.overflowed = true;
                warn!(frame = index, "MockCamera: buffer full, frame dropped");
            } else {
                buffer.queue.push_back(frame);
            }
        }
        self.produced.fetch_add(1, Ordering::SeqCst);
        self.arrived.notify_one();
    }
}

/// Build a test-pattern frame. Pixel `i` of frame `n` holds `(i + n)` wrapped to the
/// pixel depth; depths other than 1 or 2 bytes yield a zero-filled plane.
fn pattern_frame(geometry: FrameGeometry, n: u64) -> Frame {
    let FrameGeometry {
        width,
        height,
        bytes_per_pixel,
    } = geometry;
    let pixels = width as u64 * height as u64;
    let frame = match bytes_per_pixel {
        1 => Frame::from_u8(
            width,
            height,
            (0..pixels).map(|i| ((i + n) % 256) as u8).collect(),
        ),
        2 => {
            let data: Vec<u16> = (0..pixels).map(|i| ((i + n) % 65536) as u16).collect();
            Frame::from_u16(width, height, &data)
        }
        other => Frame {
            width,
            height,
            bytes_per_pixel: other,
            data: vec![0; (pixels * other as u64) as usize],
            tags: Default::default(),
        },
    };
    frame.with_tag("CameraFrameIndex", n)
}

/// Simulated camera implementing [`FrameSource`].
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::builder().size(64, 48).buffer_capacity(100).build();
/// camera.start_burst(10, Duration::from_millis(5)).await?;
/// ```
#[derive(Debug)]
pub struct MockCamera {
    shared: Arc<Shared>,
    readout: Duration,
    snaps: AtomicU64,
    start_burst_calls: AtomicU64,
    stop_burst_calls: AtomicU64,
    burst: Mutex<Option<JoinHandle<()>>>,
}

impl MockCamera {
    /// Create a 16-bit mock camera with the given resolution and a 1000-frame buffer.
    pub fn new(width: u32, height: u32) -> Self {
        Self::builder().size(width, height).build()
    }

    /// Builder starting from a 64x48 16-bit camera.
    pub fn builder() -> MockCameraBuilder {
        MockCameraBuilder::default()
    }

    /// Number of `snap_one` calls so far, failed ones included.
    pub fn snap_count(&self) -> u64 {
        self.snaps.load(Ordering::SeqCst)
    }

    /// Number of `start_burst` calls so far.
    pub fn start_burst_calls(&self) -> u64 {
        self.start_burst_calls.load(Ordering::SeqCst)
    }

    /// Number of `stop_burst` calls so far.
    pub fn stop_burst_calls(&self) -> u64 {
        self.stop_burst_calls.load(Ordering::SeqCst)
    }

    /// Burst frames produced since the last `start_burst`, dropped ones included.
    pub fn frames_produced(&self) -> u64 {
        self.shared.produced.load(Ordering::SeqCst)
    }

    /// Frames currently waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.shared.buffer.lock().queue.len()
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`MockCamera`].
#[derive(Debug, Clone)]
pub struct MockCameraBuilder {
    geometry: FrameGeometry,
    capacity: u64,
    readout: Duration,
    faults: FaultPlan,
}

impl Default for MockCameraBuilder {
    fn default() -> Self {
        Self {
            geometry: FrameGeometry {
                width: 64,
                height: 48,
                bytes_per_pixel: 2,
            },
            capacity: 1000,
            readout: Duration::ZERO,
            faults: FaultPlan::default(),
        }
    }
}

impl MockCameraBuilder {
    /// Frame resolution.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.geometry.width = width;
        self.geometry.height = height;
        self
    }

    /// Pixel depth in bytes.
    pub fn bytes_per_pixel(mut self, bytes_per_pixel: u32) -> Self {
        self.geometry.bytes_per_pixel = bytes_per_pixel;
        self
    }

    /// Circular buffer capacity in frames.
    pub fn buffer_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Delay applied to every `snap_one` call.
    pub fn readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Injected faults.
    pub fn faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Finish the camera.
    pub fn build(self) -> MockCamera {
        MockCamera {
            shared: Arc::new(Shared {
                geometry: self.geometry,
                capacity: self.capacity,
                faults: self.faults,
                buffer: Mutex::new(BufferState::default()),
                arrived: Notify::new(),
                produced: AtomicU64::new(0),
            }),
            readout: self.readout,
            snaps: AtomicU64::new(0),
            start_burst_calls: AtomicU64::new(0),
            stop_burst_calls: AtomicU64::new(0),
            burst: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FrameSource for MockCamera {
    fn geometry(&self) -> FrameGeometry {
        self.shared.geometry
    }

    async fn snap_one(&self) -> AcqResult<Frame> {
        let n = self.snaps.fetch_add(1, Ordering::SeqCst);
        if !self.readout.is_zero() {
            sleep(self.readout).await;
        }
        if self.shared.faults.fail_snap_at == Some(n) {
            return Err(AcqError::Capture(format!(
                "MockCamera: injected failure on snap #{}",
                n
            )));
        }
        debug!(snap = n, "MockCamera: snapped frame");
        Ok(pattern_frame(self.shared.geometry, n))
    }

    async fn start_burst(&self, count: u64, interval: Duration) -> AcqResult<()> {
        self.start_burst_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(previous) = self.burst.lock().take() {
            previous.abort();
        }
        {
            let mut buffer = self.shared.buffer.lock();
            buffer.queue.clear();
            buffer.overflowed = false;
        }
        self.shared.produced.store(0, Ordering::SeqCst);

        info!(count, ?interval, "MockCamera: burst started");
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            for n in 0..count {
                if shared.faults.withhold_from.is_some_and(|from| n >= from) {
                    debug!(frame = n, "MockCamera: withholding remaining frames");
                    break;
                }
                shared.push(pattern_frame(shared.geometry, n), n);
                if interval.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    sleep(interval).await;
                }
            }
        });
        *self.burst.lock() = Some(task);
        Ok(())
    }

    async fn stop_burst(&self) -> AcqResult<()> {
        self.stop_burst_calls.fetch_add(1, Ordering::SeqCst);
        match self.burst.lock().take() {
            Some(task) => {
                task.abort();
                info!("MockCamera: burst stopped");
            }
            None => debug!("MockCamera: no burst running"),
        }
        Ok(())
    }

    fn buffer_free(&self) -> u64 {
        let used = self.shared.buffer.lock().queue.len() as u64;
        self.shared.capacity.saturating_sub(used)
    }

    fn buffer_total(&self) -> u64 {
        self.shared.capacity
    }

    fn is_overflowed(&self) -> bool {
        self.shared.buffer.lock().overflowed
    }

    async fn pop_next(&self) -> AcqResult<Option<Frame>> {
        Ok(self.shared.buffer.lock().queue.pop_front())
    }

    async fn wait_for_frame(&self) {
        self.shared.arrived.notified().await
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        if let Some(task) = self.burst.lock().take() {
            task.abort();
        }
    }
}
