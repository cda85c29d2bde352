//! In-memory dataset store.
//!
//! `MemorySink` keeps every dataset in process memory. It backs the CLI's dry runs and
//! the test suite, and it enforces the sink-side contract the scheduler relies on:
//! coordinates must fit the layout, frames must match the plane and pixel type, and
//! closing twice is harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::data::storage::{DatasetHandle, DatasetLayout, DatasetReader, FrameSink};
use crate::data::{Frame, PixelType};
use crate::error::{AcqError, AcqResult};
use crate::experiment::coords::{unmap_coordinate, Coordinate, IterationOrder};

#[derive(Debug)]
struct StoredDataset {
    location: String,
    name: String,
    layout: DatasetLayout,
    pixel_type: PixelType,
    summary_metadata: String,
    images: HashMap<Coordinate, (Frame, String)>,
    write_order: Vec<Coordinate>,
    open: bool,
    close_calls: u32,
}

/// Read-only view of a stored dataset for inspection.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    /// Location passed at creation
    pub location: String,
    /// Name passed at creation
    pub name: String,
    /// Axes and image plane
    pub layout: DatasetLayout,
    /// Stored pixel type
    pub pixel_type: PixelType,
    /// Summary metadata JSON
    pub summary_metadata: String,
    /// Coordinates in the order they were written
    pub write_order: Vec<Coordinate>,
    /// False once closed
    pub open: bool,
    /// Number of `close_dataset` calls received, including redundant ones
    pub close_calls: u32,
}

/// Frame sink that keeps datasets in memory.
#[derive(Default)]
pub struct MemorySink {
    datasets: Mutex<HashMap<DatasetHandle, StoredDataset>>,
    writes: AtomicU64,
    fail_write_at: Option<u64>,
    fail_create: bool,
}

impl MemorySink {
    /// Empty sink that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the `n`-th `add_image` call (zero-based, counted across datasets).
    pub fn fail_write_at(mut self, n: u64) -> Self {
        self.fail_write_at = Some(n);
        self
    }

    /// Reject every `create_dataset` call.
    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Handles of every dataset created so far.
    pub fn handles(&self) -> Vec<DatasetHandle> {
        self.datasets.lock().keys().cloned().collect()
    }

    /// Snapshot of one dataset.
    pub fn dataset(&self, handle: &DatasetHandle) -> Option<DatasetSnapshot> {
        self.datasets.lock().get(handle).map(|ds| DatasetSnapshot {
            location: ds.location.clone(),
            name: ds.name.clone(),
            layout: ds.layout.clone(),
            pixel_type: ds.pixel_type,
            summary_metadata: ds.summary_metadata.clone(),
            write_order: ds.write_order.clone(),
            open: ds.open,
            close_calls: ds.close_calls,
        })
    }

    /// Snapshot of the single dataset this sink holds, if exactly one exists.
    pub fn only_dataset(&self) -> Option<(DatasetHandle, DatasetSnapshot)> {
        let handle = {
            let datasets = self.datasets.lock();
            if datasets.len() != 1 {
                return None;
            }
            datasets.keys().next().cloned()?
        };
        let snapshot = self.dataset(&handle)?;
        Some((handle, snapshot))
    }

    fn with_dataset<T>(
        &self,
        handle: &DatasetHandle,
        f: impl FnOnce(&mut StoredDataset) -> AcqResult<T>,
    ) -> AcqResult<T> {
        let mut datasets = self.datasets.lock();
        let ds = datasets
            .get_mut(handle)
            .ok_or_else(|| AcqError::StorageWrite(format!("unknown dataset handle {}", handle)))?;
        f(ds)
    }
}

fn check_frame(ds: &StoredDataset, frame: &Frame) -> AcqResult<()> {
    if frame.width != ds.layout.width || frame.height != ds.layout.height {
        return Err(AcqError::StorageWrite(format!(
            "frame is {}x{}, dataset plane is {}x{}",
            frame.width, frame.height, ds.layout.width, ds.layout.height
        )));
    }
    if frame.bytes_per_pixel != ds.pixel_type.bytes_per_pixel() {
        return Err(AcqError::StorageWrite(format!(
            "frame has {} bytes per pixel, dataset is {}",
            frame.bytes_per_pixel, ds.pixel_type
        )));
    }
    if frame.data.len() != frame.expected_len() {
        return Err(AcqError::StorageWrite(format!(
            "frame data size mismatch: expected {} bytes, got {}",
            frame.expected_len(),
            frame.data.len()
        )));
    }
    Ok(())
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn create_dataset(
        &self,
        location: &str,
        name: &str,
        layout: &DatasetLayout,
        pixel_type: PixelType,
        summary_metadata: &str,
    ) -> AcqResult<DatasetHandle> {
        if self.fail_create {
            return Err(AcqError::StorageWrite(format!(
                "cannot create dataset '{}' in '{}'",
                name, location
            )));
        }
        if !summary_metadata.is_empty() {
            serde_json::from_str::<serde_json::Value>(summary_metadata)?;
        }

        let handle = DatasetHandle(Uuid::new_v4().to_string());
        info!(
            handle = %handle,
            location,
            name,
            shape = ?layout.full_shape(),
            pixel_type = %pixel_type,
            "Created in-memory dataset"
        );
        self.datasets.lock().insert(
            handle.clone(),
            StoredDataset {
                location: location.to_string(),
                name: name.to_string(),
                layout: layout.clone(),
                pixel_type,
                summary_metadata: summary_metadata.to_string(),
                images: HashMap::new(),
                write_order: Vec::new(),
                open: true,
                close_calls: 0,
            },
        );
        Ok(handle)
    }

    async fn add_image(
        &self,
        handle: &DatasetHandle,
        frame: Frame,
        coordinate: &Coordinate,
        image_metadata: &str,
    ) -> AcqResult<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_write_at == Some(n) {
            return Err(AcqError::StorageWrite(format!(
                "injected write failure at image {}",
                n
            )));
        }

        self.with_dataset(handle, |ds| {
            if !ds.open {
                return Err(AcqError::StorageWrite(format!(
                    "dataset {} is closed",
                    handle
                )));
            }
            unmap_coordinate(coordinate, &ds.layout.axes, IterationOrder::Sequential)
                .map_err(|e| AcqError::StorageWrite(e.to_string()))?;
            if ds.images.contains_key(coordinate) {
                return Err(AcqError::StorageWrite(format!(
                    "image at {} already written",
                    coordinate
                )));
            }
            check_frame(ds, &frame)?;

            ds.write_order.push(coordinate.clone());
            ds.images
                .insert(coordinate.clone(), (frame, image_metadata.to_string()));
            Ok(())
        })
    }

    async fn close_dataset(&self, handle: &DatasetHandle) -> AcqResult<()> {
        self.with_dataset(handle, |ds| {
            ds.close_calls += 1;
            if ds.open {
                ds.open = false;
                debug!(handle = %handle, images = ds.images.len(), "Closed dataset");
            }
            Ok(())
        })
    }
}

#[async_trait]
impl DatasetReader for MemorySink {
    async fn load_dataset(&self, location: &str, name: &str) -> AcqResult<DatasetHandle> {
        let mut datasets = self.datasets.lock();
        let (handle, ds) = datasets
            .iter_mut()
            .find(|(_, ds)| ds.location == location && ds.name == name)
            .ok_or_else(|| {
                AcqError::StorageWrite(format!("no dataset '{}' in '{}'", name, location))
            })?;
        ds.open = true;
        Ok(handle.clone())
    }

    async fn layout(&self, handle: &DatasetHandle) -> AcqResult<DatasetLayout> {
        self.with_dataset(handle, |ds| Ok(ds.layout.clone()))
    }

    async fn pixel_type(&self, handle: &DatasetHandle) -> AcqResult<PixelType> {
        self.with_dataset(handle, |ds| Ok(ds.pixel_type))
    }

    async fn summary_metadata(&self, handle: &DatasetHandle) -> AcqResult<String> {
        self.with_dataset(handle, |ds| Ok(ds.summary_metadata.clone()))
    }

    async fn get_image(
        &self,
        handle: &DatasetHandle,
        coordinate: &Coordinate,
    ) -> AcqResult<Option<Frame>> {
        self.with_dataset(handle, |ds| {
            Ok(ds.images.get(coordinate).map(|(frame, _)| frame.clone()))
        })
    }

    async fn image_metadata(
        &self,
        handle: &DatasetHandle,
        coordinate: &Coordinate,
    ) -> AcqResult<Option<String>> {
        self.with_dataset(handle, |ds| {
            Ok(ds.images.get(coordinate).map(|(_, meta)| meta.clone()))
        })
    }

    async fn close_dataset(&self, handle: &DatasetHandle) -> AcqResult<()> {
        FrameSink::close_dataset(self, handle).await
    }
}
