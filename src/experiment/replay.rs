//! Dataset read-back.
//!
//! Walks a stored dataset image by image, addressing each image through the same
//! index-to-coordinate mapping the scheduler writes with. Sequential order follows
//! the write order; reverse order visits axis 0 fastest and is used to check random
//! access into a dataset.

use tracing::{debug, info, instrument, warn};

use crate::data::storage::{DatasetHandle, DatasetReader};
use crate::data::Frame;
use crate::error::AcqResult;
use crate::experiment::cancel::CancellationToken;
use crate::experiment::coords::{map_index, Coordinate, IterationOrder};

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Images handed to the visitor
    pub visited: u64,
    /// Coordinates with no stored image
    pub missing: u64,
    /// True when the pass stopped on a cancel request
    pub cancelled: bool,
}

/// Load every image of `handle` in `order`, calling `visit` for each one present.
///
/// Cancellation is checked between images. The dataset is closed exactly once on
/// every path, including errors; a close failure is logged, not returned.
#[instrument(skip(reader, token, visit), fields(dataset = %handle))]
pub async fn replay_dataset<F>(
    reader: &dyn DatasetReader,
    handle: &DatasetHandle,
    order: IterationOrder,
    token: &CancellationToken,
    visit: F,
) -> AcqResult<ReplaySummary>
where
    F: FnMut(u64, &Coordinate, Frame) + Send,
{
    let result = walk(reader, handle, order, token, visit).await;
    if let Err(e) = reader.close_dataset(handle).await {
        warn!("Failed to close dataset after replay: {}", e);
    }
    result
}

async fn walk<F>(
    reader: &dyn DatasetReader,
    handle: &DatasetHandle,
    order: IterationOrder,
    token: &CancellationToken,
    mut visit: F,
) -> AcqResult<ReplaySummary>
where
    F: FnMut(u64, &Coordinate, Frame) + Send,
{
    let layout = reader.layout(handle).await?;
    let total = layout.image_count();
    let mut summary = ReplaySummary::default();

    for index in 0..total {
        if token.is_cancelled() {
            info!(visited = summary.visited, "Replay cancelled");
            summary.cancelled = true;
            return Ok(summary);
        }
        let coordinate = map_index(index, &layout.axes, order)?;
        match reader.get_image(handle, &coordinate).await? {
            Some(frame) => {
                visit(index, &coordinate, frame);
                summary.visited += 1;
            }
            None => {
                debug!(index, coordinate = %coordinate, "No image stored");
                summary.missing += 1;
            }
        }
    }

    info!(
        visited = summary.visited,
        missing = summary.missing,
        order = %order,
        "Replay finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory_sink::MemorySink;
    use crate::data::storage::{DatasetLayout, FrameSink};
    use crate::data::PixelType;
    use crate::experiment::coords::Shape;

    async fn stored(sink: &MemorySink, skip: Option<u64>) -> DatasetHandle {
        let shape = Shape::new(vec![2, 3, 1]).unwrap();
        let handle = sink
            .create_dataset("mem", "replay", &DatasetLayout::new(shape.clone(), 1, 1), PixelType::Gray8, "{}")
            .await
            .unwrap();
        for (i, coord) in shape.coordinates(IterationOrder::Sequential).enumerate() {
            if Some(i as u64) == skip {
                continue;
            }
            let frame = Frame::from_u8(1, 1, vec![i as u8]);
            sink.add_image(&handle, frame, &coord, "{}").await.unwrap();
        }
        FrameSink::close_dataset(sink, &handle).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn sequential_replay_follows_write_order() {
        let sink = MemorySink::new();
        stored(&sink, None).await;
        let handle = sink.load_dataset("mem", "replay").await.unwrap();

        let mut values = Vec::new();
        let summary = replay_dataset(
            &sink,
            &handle,
            IterationOrder::Sequential,
            &CancellationToken::new(),
            |_, _, frame| values.push(frame.data[0]),
        )
        .await
        .unwrap();

        assert_eq!(summary.visited, 6);
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(sink.dataset(&handle).unwrap().close_calls, 2);
    }

    #[tokio::test]
    async fn reverse_replay_visits_axis_zero_fastest() {
        let sink = MemorySink::new();
        stored(&sink, None).await;
        let handle = sink.load_dataset("mem", "replay").await.unwrap();

        let mut values = Vec::new();
        replay_dataset(
            &sink,
            &handle,
            IterationOrder::Reverse,
            &CancellationToken::new(),
            |_, _, frame| values.push(frame.data[0]),
        )
        .await
        .unwrap();

        // Sequential index of (p, t, 0) is p * 3 + t.
        assert_eq!(values, vec![0, 3, 1, 4, 2, 5]);
    }

    #[tokio::test]
    async fn missing_images_are_counted() {
        let sink = MemorySink::new();
        stored(&sink, Some(2)).await;
        let handle = sink.load_dataset("mem", "replay").await.unwrap();

        let summary = replay_dataset(
            &sink,
            &handle,
            IterationOrder::Sequential,
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .await
        .unwrap();
        assert_eq!(summary.visited, 5);
        assert_eq!(summary.missing, 1);
    }

    #[tokio::test]
    async fn cancelled_replay_stops_between_images() {
        let sink = MemorySink::new();
        stored(&sink, None).await;
        let handle = sink.load_dataset("mem", "replay").await.unwrap();
        let token = CancellationToken::new();

        let summary = replay_dataset(&sink, &handle, IterationOrder::Sequential, &token, |i, _, _| {
            if i == 1 {
                token.request_cancel();
            }
        })
        .await
        .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.visited, 2);
        assert!(!sink.dataset(&handle).unwrap().open);
    }
}
