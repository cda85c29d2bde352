//! Integration tests for the acquisition scheduler.
//!
//! Each test drives a full run against the simulated camera and the in-memory sink,
//! then checks what reached the sink and which events were emitted.

use async_trait::async_trait;
use rust_mda::data::memory_sink::MemorySink;
use rust_mda::data::storage::DatasetReader;
use rust_mda::data::Frame;
use rust_mda::error::{AcqError, AcqResult, ErrorKind};
use rust_mda::experiment::{
    AcquisitionEvent, AcquisitionObserver, AcquisitionPlan, AcquisitionScheduler,
    CancellationToken, ChannelSpec, RunOutcome, RunReport, RunState, SchedulerState, Strategy,
};
use rust_mda::hardware::capabilities::{FrameGeometry, FrameSource};
use rust_mda::hardware::mock::{FaultPlan, MockCamera};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Rig {
    camera: Arc<MockCamera>,
    sink: Arc<MemorySink>,
    scheduler: Arc<AcquisitionScheduler>,
    events: broadcast::Receiver<AcquisitionEvent>,
}

fn rig(camera: MockCamera, sink: MemorySink) -> Rig {
    let camera = Arc::new(camera);
    let sink = Arc::new(sink);
    let scheduler = Arc::new(AcquisitionScheduler::new(camera.clone(), sink.clone()));
    let events = scheduler.events().subscribe();
    Rig {
        camera,
        sink,
        scheduler,
        events,
    }
}

fn drain(rx: &mut broadcast::Receiver<AcquisitionEvent>) -> Vec<AcquisitionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Exactly one Started first, exactly one terminal event last.
fn assert_bracketed(events: &[AcquisitionEvent]) {
    let started = events
        .iter()
        .filter(|e| matches!(e, AcquisitionEvent::Started { .. }))
        .count();
    let terminal = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(started, 1, "expected one Started, got {:?}", events);
    assert_eq!(terminal, 1, "expected one terminal event, got {:?}", events);
    assert!(matches!(events[0], AcquisitionEvent::Started { .. }));
    assert!(events.last().is_some_and(|e| e.is_terminal()));
}

fn continuous_plan(positions: u64, timepoints: u64) -> AcquisitionPlan {
    AcquisitionPlan::builder()
        .positions(positions)
        .timepoints(timepoints)
        .strategy(Strategy::ContinuousBuffered)
        .build()
        .unwrap()
}

fn failed_kind(report: &RunReport) -> Option<ErrorKind> {
    match &report.outcome {
        RunOutcome::Failed { kind, .. } => Some(*kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_stepwise_run_completes_in_sequential_order() {
    let mut rig = rig(MockCamera::new(8, 4), MemorySink::new());
    let plan = AcquisitionPlan::builder()
        .positions(2)
        .timepoints(2)
        .channels([
            ChannelSpec::new("DAPI", 10.0, 1.0),
            ChannelSpec::new("GFP", 20.0, 0.5),
        ])
        .build()
        .unwrap();

    let report = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.frames_written, 8);
    assert_eq!(report.total_steps, 8);

    let (handle, dataset) = rig.sink.only_dataset().unwrap();
    assert_eq!(dataset.close_calls, 1);
    assert_eq!(dataset.layout.full_shape(), vec![2, 2, 2, 4, 8]);
    let order: Vec<Vec<u64>> = dataset
        .write_order
        .iter()
        .map(|c| c.as_slice().to_vec())
        .collect();
    assert_eq!(order[0], vec![0, 0, 0]);
    assert_eq!(order[1], vec![0, 0, 1]);
    assert_eq!(order[2], vec![0, 1, 0]);
    assert_eq!(order[7], vec![1, 1, 1]);

    let summary: Value = serde_json::from_str(&dataset.summary_metadata).unwrap();
    assert_eq!(summary["Summary"]["ChNames"][1], "GFP");

    let meta: Value = serde_json::from_str(
        &rig.sink
            .image_metadata(&handle, &dataset.write_order[3])
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(meta["Image-index"], 3);
    assert_eq!(meta["Channel"], "GFP");
    assert_eq!(meta["time"], 1);

    let events = drain(&mut rig.events);
    assert_bracketed(&events);
    let progress: Vec<&RunState> = events
        .iter()
        .filter_map(|e| match e {
            AcquisitionEvent::Progress(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 8);
    assert_eq!(progress[7].current, 8);
    assert_eq!(progress[7].total, 8);
    assert!(rig.camera.snap_count() == 8);
    assert_eq!(rig.camera.start_burst_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_run_completes_and_stops_burst() {
    let mut rig = rig(
        MockCamera::builder().buffer_capacity(100).build(),
        MemorySink::new(),
    );
    let plan = AcquisitionPlan::builder()
        .positions(2)
        .timepoints(3)
        .z_offsets_um(vec![0.0, 5.0, 10.0])
        .strategy(Strategy::ContinuousBuffered)
        .build()
        .unwrap();

    let report = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.frames_written, 18);
    assert_eq!(rig.camera.start_burst_calls(), 1);
    assert_eq!(rig.camera.stop_burst_calls(), 1);
    assert_eq!(rig.camera.snap_count(), 0);

    let (_, dataset) = rig.sink.only_dataset().unwrap();
    assert_eq!(dataset.layout.axes.dims(), &[2, 3, 1, 3]);
    assert_eq!(dataset.write_order.len(), 18);
    assert_eq!(dataset.close_calls, 1);
    assert_bracketed(&drain(&mut rig.events));
}

#[tokio::test(start_paused = true)]
async fn test_continuous_timeout_when_frames_stop_arriving() {
    // 10 steps; frames from step 5 on are never produced.
    let camera = MockCamera::builder()
        .faults(FaultPlan {
            withhold_from: Some(5),
            ..Default::default()
        })
        .build();
    let mut rig = rig(camera, MemorySink::new());

    let report = rig
        .scheduler
        .run(continuous_plan(2, 5), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(failed_kind(&report), Some(ErrorKind::AcquisitionTimeout));
    match &report.outcome {
        RunOutcome::Failed { message, .. } => {
            assert!(message.starts_with("Timeout waiting for images at step 5"))
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.frames_written, 5);
    assert_eq!(rig.scheduler.state(), SchedulerState::Failed);

    let (_, dataset) = rig.sink.only_dataset().unwrap();
    assert_eq!(dataset.close_calls, 1);
    assert_eq!(rig.camera.stop_burst_calls(), 1);

    let events = drain(&mut rig.events);
    assert_bracketed(&events);
    assert!(matches!(
        events.last(),
        Some(AcquisitionEvent::Failed {
            kind: ErrorKind::AcquisitionTimeout,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_continuous_run_ignores_interval_for_frame_spacing() {
    let mut rig = rig(MockCamera::default(), MemorySink::new());
    let plan = AcquisitionPlan::builder()
        .timepoints(3)
        .interval(Duration::from_millis(500))
        .strategy(Strategy::ContinuousBuffered)
        .build()
        .unwrap();

    let report = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.frames_written, 3);
    assert!(report.elapsed < Duration::from_millis(500), "elapsed {:?}", report.elapsed);
    assert_eq!(rig.camera.stop_burst_calls(), 1);
    assert_bracketed(&drain(&mut rig.events));
}

/// Burst source whose first frame shows up only after `empty_pops` empty pops.
struct LateFrameSource {
    empty_pops: u64,
    pops: AtomicU64,
}

impl LateFrameSource {
    fn new(empty_pops: u64) -> Self {
        Self {
            empty_pops,
            pops: AtomicU64::new(0),
        }
    }

    fn pops(&self) -> u64 {
        self.pops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for LateFrameSource {
    fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            width: 4,
            height: 4,
            bytes_per_pixel: 2,
        }
    }

    async fn snap_one(&self) -> AcqResult<Frame> {
        Err(AcqError::Capture("burst only".into()))
    }

    async fn start_burst(&self, _count: u64, _interval: Duration) -> AcqResult<()> {
        Ok(())
    }

    async fn stop_burst(&self) -> AcqResult<()> {
        Ok(())
    }

    fn buffer_free(&self) -> u64 {
        100
    }

    fn buffer_total(&self) -> u64 {
        100
    }

    fn is_overflowed(&self) -> bool {
        false
    }

    async fn pop_next(&self) -> AcqResult<Option<Frame>> {
        let n = self.pops.fetch_add(1, Ordering::SeqCst);
        if n < self.empty_pops {
            return Ok(None);
        }
        Ok(Some(Frame::from_u16(4, 4, &[0; 16])))
    }
}

async fn run_single_buffered_step(source: Arc<LateFrameSource>) -> RunReport {
    let scheduler = AcquisitionScheduler::new(source, Arc::new(MemorySink::new()));
    let plan = continuous_plan(1, 1);
    scheduler.run(plan, CancellationToken::new()).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_frame_after_full_poll_budget_is_accepted() {
    let source = Arc::new(LateFrameSource::new(300));

    let report = run_single_buffered_step(source.clone()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.frames_written, 1);
    assert_eq!(source.pops(), 301);
}

#[tokio::test(start_paused = true)]
async fn test_frame_past_poll_budget_times_out() {
    let source = Arc::new(LateFrameSource::new(301));

    let report = run_single_buffered_step(source.clone()).await;

    assert_eq!(failed_kind(&report), Some(ErrorKind::AcquisitionTimeout));
    match &report.outcome {
        RunOutcome::Failed { message, .. } => assert!(
            message.contains("step 0 after 300 polls"),
            "{}",
            message
        ),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.frames_written, 0);
    assert_eq!(source.pops(), 301);
}

#[tokio::test]
async fn test_unrepresentable_interval_rejected_before_running() {
    let mut rig = rig(MockCamera::default(), MemorySink::new());
    let plan = AcquisitionPlan {
        interval_ms: 1e30,
        ..Default::default()
    };

    let err = rig
        .scheduler
        .run(plan.clone(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AcqError::InvalidParameters(_)));
    assert!(matches!(
        rig.scheduler.start(plan),
        Err(AcqError::InvalidParameters(_))
    ));

    assert_eq!(rig.scheduler.state(), SchedulerState::Idle);
    assert!(rig.sink.handles().is_empty());
    assert!(drain(&mut rig.events).is_empty());
}

#[tokio::test]
async fn test_zero_positions_rejected_before_running() {
    let mut rig = rig(MockCamera::default(), MemorySink::new());
    let plan = AcquisitionPlan {
        positions: 0,
        ..Default::default()
    };

    let err = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AcqError::InvalidParameters(_)));
    assert_eq!(rig.scheduler.state(), SchedulerState::Idle);
    assert!(rig.sink.handles().is_empty());
    assert!(drain(&mut rig.events).is_empty());

    let start_err = rig.scheduler.start(AcquisitionPlan {
        interval_ms: -1.0,
        ..Default::default()
    });
    assert!(matches!(start_err, Err(AcqError::InvalidParameters(_))));
}

struct CancelAfter {
    step: u64,
    token: CancellationToken,
}

impl AcquisitionObserver for CancelAfter {
    fn on_progress(&self, state: &RunState) {
        if state.current == self.step {
            self.token.request_cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_after_step_three_of_ten() {
    let mut rig = rig(MockCamera::default(), MemorySink::new());
    let token = CancellationToken::new();
    rig.scheduler.events().register(Arc::new(CancelAfter {
        step: 3,
        token: token.clone(),
    }));

    let plan = AcquisitionPlan::builder()
        .positions(2)
        .timepoints(5)
        .build()
        .unwrap();
    let report = rig.scheduler.run(plan, token).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.frames_written, 3);
    assert_eq!(rig.scheduler.state(), SchedulerState::Cancelled);

    let (_, dataset) = rig.sink.only_dataset().unwrap();
    assert_eq!(dataset.write_order.len(), 3);
    assert_eq!(dataset.close_calls, 1);
    assert_eq!(rig.camera.snap_count(), 3);

    let events = drain(&mut rig.events);
    assert_bracketed(&events);
    assert!(events
        .iter()
        .any(|e| matches!(e, AcquisitionEvent::Log(m) if m == "User requested to cancel.")));
    assert_eq!(
        events.last(),
        Some(&AcquisitionEvent::Cancelled { frames_written: 3 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_overflow_aborts_and_closes_once() {
    let camera = MockCamera::builder()
        .buffer_capacity(100)
        .faults(FaultPlan {
            overflow_at: Some(4),
            ..Default::default()
        })
        .build();
    let mut rig = rig(camera, MemorySink::new());

    let report = rig
        .scheduler
        .run(continuous_plan(2, 5), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(failed_kind(&report), Some(ErrorKind::BufferOverflow));
    assert!(report.frames_written < 10);

    let (_, dataset) = rig.sink.only_dataset().unwrap();
    assert_eq!(dataset.close_calls, 1);
    assert!(!dataset.open);
    assert_eq!(rig.camera.stop_burst_calls(), 1);
    assert_bracketed(&drain(&mut rig.events));
}

#[tokio::test]
async fn test_storage_failure_fails_run() {
    let mut rig = rig(MockCamera::default(), MemorySink::new().fail_write_at(2));
    let plan = AcquisitionPlan::builder().timepoints(4).build().unwrap();

    let report = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(failed_kind(&report), Some(ErrorKind::StorageWrite));
    assert_eq!(report.frames_written, 2);
    assert_eq!(rig.sink.only_dataset().unwrap().1.close_calls, 1);
    assert_bracketed(&drain(&mut rig.events));
}

#[tokio::test]
async fn test_capture_failure_fails_run() {
    let camera = MockCamera::builder()
        .faults(FaultPlan {
            fail_snap_at: Some(1),
            ..Default::default()
        })
        .build();
    let mut rig = rig(camera, MemorySink::new());
    let plan = AcquisitionPlan::builder().timepoints(3).build().unwrap();

    let report = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(failed_kind(&report), Some(ErrorKind::Capture));
    assert_eq!(report.frames_written, 1);
    assert_bracketed(&drain(&mut rig.events));
}

#[tokio::test]
async fn test_dataset_creation_failure_after_started() {
    let mut rig = rig(MockCamera::default(), MemorySink::new().fail_create());

    let report = rig
        .scheduler
        .run(AcquisitionPlan::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(failed_kind(&report), Some(ErrorKind::StorageWrite));
    assert_eq!(report.frames_written, 0);
    assert!(rig.sink.handles().is_empty());
    assert_bracketed(&drain(&mut rig.events));
}

#[tokio::test(start_paused = true)]
async fn test_stepwise_interval_pacing() {
    // 30 ms per timepoint, 100 ms interval: 30 + 70 + 30 + 70 + 30.
    let camera = MockCamera::builder()
        .readout(Duration::from_millis(30))
        .build();
    let rig = rig(camera, MemorySink::new());
    let plan = AcquisitionPlan::builder()
        .timepoints(3)
        .interval(Duration::from_millis(100))
        .build()
        .unwrap();

    let report = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.outcome.is_completed());
    assert!(
        report.elapsed >= Duration::from_millis(230) && report.elapsed < Duration::from_millis(240),
        "elapsed {:?}",
        report.elapsed
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_timepoints_do_not_sleep() {
    // 120 ms per timepoint exceeds the 100 ms interval.
    let camera = MockCamera::builder()
        .readout(Duration::from_millis(120))
        .build();
    let mut rig = rig(camera, MemorySink::new());
    let plan = AcquisitionPlan::builder()
        .timepoints(2)
        .interval(Duration::from_millis(100))
        .build()
        .unwrap();

    let report = rig
        .scheduler
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.elapsed >= Duration::from_millis(240));
    assert!(report.elapsed < Duration::from_millis(250));

    let timing: Vec<String> = drain(&mut rig.events)
        .into_iter()
        .filter_map(|e| match e {
            AcquisitionEvent::Log(m) if m.starts_with("timepoint") => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(timing.len(), 2);
    assert!(timing[0].ends_with("wait=0"), "{}", timing[0]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_interval_sleep() {
    let rig = rig(MockCamera::default(), MemorySink::new());
    let plan = AcquisitionPlan::builder()
        .timepoints(3)
        .interval(Duration::from_secs(10))
        .build()
        .unwrap();

    let handle = rig.scheduler.start(plan).unwrap();
    let mut progress = handle.progress();
    while progress.borrow_and_update().current < 1 {
        progress.changed().await.unwrap();
    }
    assert!(handle.cancel());

    let report = handle.join().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.frames_written, 1);
    assert!(report.elapsed < Duration::from_secs(10));
    assert_eq!(rig.sink.only_dataset().unwrap().1.close_calls, 1);
}

#[tokio::test]
async fn test_handle_reports_state() {
    let rig = rig(MockCamera::default(), MemorySink::new());
    let plan = AcquisitionPlan::builder().timepoints(4).build().unwrap();

    let handle = rig.scheduler.start(plan).unwrap();
    assert!(!handle.run_id().is_empty());
    let run_id = handle.run_id().to_string();

    let report = handle.join().await.unwrap();
    assert_eq!(report.run_id, run_id);
    assert_eq!(rig.scheduler.state(), SchedulerState::Completed);
    assert_eq!(rig.scheduler.progress().borrow().current, 4);
}
