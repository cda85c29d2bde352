//! Acquisition scheduler.
//!
//! The scheduler walks every coordinate of a plan in sequential order, pulls one frame
//! per coordinate from a [`FrameSource`], and hands it to a [`FrameSink`] together with
//! its coordinate and metadata. One run executes at a time.
//!
//! # Strategies
//!
//! - **Stepwise-timed**: snap, write, and after the last step of each timepoint sleep
//!   for `max(0, interval - elapsed)` where `elapsed` is measured from the first capture
//!   of that timepoint. No sleep follows the final step.
//! - **Continuous-buffered**: one burst of `total` captures is requested up front;
//!   each step then waits for the source buffer with a bounded number of timed polls.
//!
//! # Lifecycle
//!
//! ```text
//! start(plan) ── validate ──> Started ── steps ──> cleanup ──> Completed | Failed | Cancelled
//! ```
//!
//! Validation and pixel-depth errors are returned to the caller before `Started`.
//! After `Started` every error becomes the run's `Failed` event. Cleanup (stop the
//! burst, close the dataset) runs exactly once whatever the outcome, a panic inside a
//! step included, and its own errors are logged only.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::data::storage::{DatasetHandle, DatasetLayout, FrameSink};
use crate::data::{Frame, PixelType};
use crate::error::{AcqError, AcqResult};
use crate::experiment::buffer::{BufferMonitor, BufferStatus, LowBufferPolicy};
use crate::experiment::cancel::CancellationToken;
use crate::experiment::coords::{IterationOrder, Shape};
use crate::experiment::events::{AcquisitionEvent, EventChannel};
use crate::experiment::plan::{AcquisitionPlan, Axis, Strategy};
use crate::experiment::state::{RunOutcome, RunReport, RunState, SchedulerState};
use crate::hardware::capabilities::{FrameGeometry, FrameSource};

/// Sleep owed after a timepoint that took `elapsed`: `max(0, interval - elapsed)`.
pub fn timepoint_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Tunables for the scheduler. See `config::SchedulerConfig` for the file form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Empty polls allowed per step before `AcquisitionTimeout`
    pub max_buffer_polls: u32,
    /// Upper bound on each wait for a buffered frame
    pub poll_interval: Duration,
    /// Continuous mode warns when `free < total / divisor`
    pub low_buffer_divisor: u64,
    /// Stepwise mode warns when `free < channels * reserve`
    pub per_channel_reserve: u64,
    /// Directory passed to `FrameSink::create_dataset`
    pub location: String,
    /// Dataset name passed to `FrameSink::create_dataset`
    pub dataset_name: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_buffer_polls: 300,
            poll_interval: Duration::from_millis(1),
            low_buffer_divisor: 10,
            per_channel_reserve: 10,
            location: "./data".to_string(),
            dataset_name: "acquisition".to_string(),
        }
    }
}

/// A validated plan with everything resolved before `Started`.
struct PreparedRun {
    run_id: String,
    plan: AcquisitionPlan,
    shape: Shape,
    geometry: FrameGeometry,
    pixel_type: PixelType,
}

/// Mutable bookkeeping owned by the scheduler task for one run.
struct RunContext {
    started: Instant,
    state: RunState,
    monitor: BufferMonitor,
    low_warned: bool,
    frames_written: u64,
    write_ms: f64,
}

/// Per-timepoint timing, reset at the first capture of each timepoint.
struct TimepointClock {
    started: Instant,
    image: Duration,
    save: Duration,
}

impl TimepointClock {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            image: Duration::ZERO,
            save: Duration::ZERO,
        }
    }
}

enum StepOutcome {
    Completed,
    Cancelled,
}

fn capture_error(err: AcqError) -> AcqError {
    match err {
        AcqError::Capture(_) | AcqError::AcquisitionTimeout { .. } | AcqError::BufferOverflow { .. } => {
            err
        }
        other => AcqError::Capture(other.to_string()),
    }
}

fn storage_error(err: AcqError) -> AcqError {
    match err {
        AcqError::StorageWrite(_) => err,
        other => AcqError::StorageWrite(other.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Drives acquisition runs against one frame source and one sink.
///
/// # Example
///
/// ```rust,ignore
/// let scheduler = Arc::new(AcquisitionScheduler::new(camera, sink));
/// let handle = scheduler.start(plan)?;
/// let report = handle.join().await?;
/// println!("{} frames, {}", report.frames_written, report.outcome);
/// ```
pub struct AcquisitionScheduler {
    source: Arc<dyn FrameSource>,
    sink: Arc<dyn FrameSink>,
    events: EventChannel,
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
    progress_tx: watch::Sender<RunState>,
}

impl AcquisitionScheduler {
    /// Scheduler with default settings and a private event channel.
    pub fn new(source: Arc<dyn FrameSource>, sink: Arc<dyn FrameSink>) -> Self {
        let (progress_tx, _) = watch::channel(RunState::default());
        Self {
            source,
            sink,
            events: EventChannel::default(),
            settings: SchedulerSettings::default(),
            state: Mutex::new(SchedulerState::Idle),
            progress_tx,
        }
    }

    /// Replace the default [`SchedulerSettings`].
    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Publish through an existing channel instead of a private one.
    pub fn with_events(mut self, events: EventChannel) -> Self {
        self.events = events;
        self
    }

    /// Channel carrying this scheduler's [`AcquisitionEvent`]s.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Settings in effect for the next run.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Latest published [`RunState`]; updated after every write.
    pub fn progress(&self) -> watch::Receiver<RunState> {
        self.progress_tx.subscribe()
    }

    /// Run `plan` to completion on the current task.
    ///
    /// # Errors
    ///
    /// Only pre-run rejections are returned as `Err`: `InvalidParameters`,
    /// `UnsupportedPixelDepth`, `AlreadyRunning`. Everything after `Started` is reported
    /// in the [`RunReport`] outcome.
    pub async fn run(
        &self,
        plan: AcquisitionPlan,
        token: CancellationToken,
    ) -> AcqResult<RunReport> {
        let run = self.prepare(plan)?;
        Ok(self.execute(run, token).await)
    }

    /// Validate `plan` on the caller's context, then execute it on a spawned task.
    pub fn start(self: &Arc<Self>, plan: AcquisitionPlan) -> AcqResult<AcquisitionHandle> {
        let run = self.prepare(plan)?;
        let run_id = run.run_id.clone();
        let token = CancellationToken::new();

        let scheduler = Arc::clone(self);
        let task_token = token.clone();
        let task = tokio::spawn(async move { scheduler.execute(run, task_token).await });

        Ok(AcquisitionHandle {
            run_id,
            token,
            progress: self.progress_tx.subscribe(),
            scheduler: Arc::clone(self),
            task,
        })
    }

    fn prepare(&self, plan: AcquisitionPlan) -> AcqResult<PreparedRun> {
        plan.validate()?;
        let shape = plan.shape()?;
        let geometry = self.source.geometry();
        let pixel_type = PixelType::from_bytes_per_pixel(geometry.bytes_per_pixel)?;

        {
            let mut state = self.state.lock();
            if !state.can_begin() {
                warn!("Rejected start: scheduler is {}", *state);
                return Err(AcqError::AlreadyRunning);
            }
            *state = SchedulerState::Running;
        }

        Ok(PreparedRun {
            run_id: Uuid::new_v4().to_string(),
            plan,
            shape,
            geometry,
            pixel_type,
        })
    }

    fn mark_failed(&self) {
        let mut state = self.state.lock();
        if *state == SchedulerState::Running {
            *state = SchedulerState::Failed;
        }
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.events.emit(AcquisitionEvent::Log(message));
    }

    #[instrument(
        skip_all,
        fields(run_id = %run.run_id, strategy = %run.plan.strategy, total = run.shape.len())
    )]
    async fn execute(&self, run: PreparedRun, token: CancellationToken) -> RunReport {
        let total = run.shape.len();
        let policy = match run.plan.strategy {
            Strategy::ContinuousBuffered => LowBufferPolicy::Fraction {
                divisor: self.settings.low_buffer_divisor,
            },
            Strategy::StepwiseTimed => LowBufferPolicy::PerChannel {
                channels: run.plan.channel_count(),
                reserve: self.settings.per_channel_reserve,
            },
        };
        let mut ctx = RunContext {
            started: Instant::now(),
            state: RunState::new(total),
            monitor: BufferMonitor::new(policy),
            low_warned: false,
            frames_written: 0,
            write_ms: 0.0,
        };

        info!(shape = ?run.shape.dims(), pixel_type = %run.pixel_type, "Acquisition started");
        self.progress_tx.send_replace(ctx.state.clone());
        self.events.emit(AcquisitionEvent::Started {
            run_id: run.run_id.clone(),
            total,
        });

        let mut dataset = None;
        let mut burst_requested = false;
        let result = AssertUnwindSafe(self.drive(
            &run,
            &token,
            &mut ctx,
            &mut dataset,
            &mut burst_requested,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(AcqError::Internal(format!(
                "acquisition task panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

        if burst_requested {
            if let Err(e) = self.source.stop_burst().await {
                error!("Failed to stop burst during cleanup: {}", e);
            }
        }
        if let Some(handle) = dataset.take() {
            if let Err(e) = self.sink.close_dataset(&handle).await {
                error!(dataset = %handle, "Failed to close dataset during cleanup: {}", e);
            }
        }

        let outcome = match result {
            Ok(StepOutcome::Completed) => {
                info!(frames = ctx.frames_written, "Acquisition completed");
                RunOutcome::Completed
            }
            Ok(StepOutcome::Cancelled) => {
                info!(frames = ctx.frames_written, "Acquisition cancelled");
                RunOutcome::Cancelled
            }
            Err(e) => {
                error!(kind = %e.kind(), frames = ctx.frames_written, "Acquisition failed: {}", e);
                RunOutcome::failed(&e)
            }
        };

        *self.state.lock() = outcome.state();
        let terminal = match &outcome {
            RunOutcome::Completed => AcquisitionEvent::Completed {
                frames_written: ctx.frames_written,
            },
            RunOutcome::Cancelled => AcquisitionEvent::Cancelled {
                frames_written: ctx.frames_written,
            },
            RunOutcome::Failed { kind, message } => AcquisitionEvent::Failed {
                kind: *kind,
                message: message.clone(),
            },
        };
        self.events.emit(terminal);

        RunReport {
            run_id: run.run_id,
            outcome,
            frames_written: ctx.frames_written,
            total_steps: total,
            total_write_ms: ctx.write_ms,
            elapsed: ctx.started.elapsed(),
        }
    }

    /// Create the dataset and walk every coordinate. Cleanup is left to the caller.
    async fn drive(
        &self,
        run: &PreparedRun,
        token: &CancellationToken,
        ctx: &mut RunContext,
        dataset: &mut Option<DatasetHandle>,
        burst_requested: &mut bool,
    ) -> AcqResult<StepOutcome> {
        let total = run.shape.len();
        let strategy = run.plan.strategy;

        let summary = run
            .plan
            .summary_metadata(run.geometry, run.pixel_type, Utc::now())?;
        let layout = DatasetLayout::new(run.shape.clone(), run.geometry.height, run.geometry.width);
        let handle = self
            .sink
            .create_dataset(
                &self.settings.location,
                &self.settings.dataset_name,
                &layout,
                run.pixel_type,
                &summary,
            )
            .await
            .map_err(storage_error)?;
        debug!(dataset = %handle, "Dataset created");
        let handle: &DatasetHandle = dataset.insert(handle);

        if strategy == Strategy::ContinuousBuffered {
            *burst_requested = true;
            // Frames stream back to back; the interval only paces stepwise runs.
            self.source
                .start_burst(total, Duration::ZERO)
                .await
                .map_err(capture_error)?;
        }

        let time_axis = run.plan.axis_index(Axis::Time);
        let interval = run.plan.interval();
        let mut clock = TimepointClock::start();

        for (step, coordinate) in run.shape.coordinates(IterationOrder::Sequential).enumerate() {
            let step = step as u64;
            if token.is_cancelled() {
                self.log("User requested to cancel.");
                return Ok(StepOutcome::Cancelled);
            }

            let t_image = Instant::now();
            let frame = self.acquire(strategy, step, ctx).await?;
            clock.image += t_image.elapsed();

            let elapsed_ms = millis(ctx.started.elapsed());
            let metadata = run
                .plan
                .image_metadata(step, &coordinate, &frame.tags, elapsed_ms)?;

            let t_write = Instant::now();
            self.sink
                .add_image(handle, frame, &coordinate, &metadata)
                .await
                .map_err(storage_error)?;
            let write = t_write.elapsed();
            clock.save += write;

            let snapshot = self.source.buffer_snapshot();
            ctx.frames_written += 1;
            ctx.write_ms += millis(write);
            ctx.state.current = step + 1;
            ctx.state.buffer_free = snapshot.free;
            ctx.state.buffer_total = snapshot.total;
            ctx.state.write_time_ms = ctx.write_ms;
            ctx.state.last_coordinate = Some(coordinate.clone());
            debug!(step, total, coordinate = %coordinate, "Frame written");
            self.progress_tx.send_replace(ctx.state.clone());
            self.events.emit(AcquisitionEvent::Progress(ctx.state.clone()));

            let Some(time_axis) = time_axis else {
                continue;
            };
            if !coordinate.inner_axes_exhausted(&run.shape, time_axis) {
                continue;
            }

            let took = clock.started.elapsed();
            let last_step = step + 1 == total;
            let wait = if strategy == Strategy::StepwiseTimed && !last_step {
                timepoint_sleep(interval, took)
            } else {
                Duration::ZERO
            };
            self.log(format!(
                "timepoint {} processed in {} ms: image={}, save={}, wait={}",
                coordinate.get(time_axis).unwrap_or(0),
                took.as_millis(),
                clock.image.as_millis(),
                clock.save.as_millis(),
                wait.as_millis()
            ));
            if !wait.is_zero() {
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = token.cancelled() => debug!("Interval sleep interrupted by cancel"),
                }
            }
            clock = TimepointClock::start();
        }

        Ok(StepOutcome::Completed)
    }

    async fn acquire(
        &self,
        strategy: Strategy,
        step: u64,
        ctx: &mut RunContext,
    ) -> AcqResult<Frame> {
        match strategy {
            Strategy::StepwiseTimed => {
                self.check_buffer(step, ctx)?;
                self.source.snap_one().await.map_err(capture_error)
            }
            Strategy::ContinuousBuffered => self.next_buffered_frame(step, ctx).await,
        }
    }

    /// Pop the next burst frame, waiting at most `max_buffer_polls` poll intervals.
    async fn next_buffered_frame(&self, step: u64, ctx: &mut RunContext) -> AcqResult<Frame> {
        let mut polls = 0u32;
        loop {
            self.check_buffer(step, ctx)?;
            if let Some(frame) = self.source.pop_next().await.map_err(capture_error)? {
                return Ok(frame);
            }
            if polls >= self.settings.max_buffer_polls {
                return Err(AcqError::AcquisitionTimeout { step, polls });
            }
            // Elapsed timeout just means "poll again".
            let _ = timeout(self.settings.poll_interval, self.source.wait_for_frame()).await;
            polls += 1;
        }
    }

    fn check_buffer(&self, step: u64, ctx: &mut RunContext) -> AcqResult<()> {
        let snapshot = self.source.buffer_snapshot();
        ctx.state.buffer_free = snapshot.free;
        ctx.state.buffer_total = snapshot.total;
        match ctx.monitor.observe(snapshot) {
            BufferStatus::Overflowed => Err(AcqError::BufferOverflow { step }),
            BufferStatus::Low => {
                if !ctx.low_warned {
                    ctx.low_warned = true;
                    warn!(
                        step,
                        free = snapshot.free,
                        capacity = snapshot.total,
                        "Source buffer running low"
                    );
                    self.log(format!(
                        "Warning: buffer low, {} of {} slots free",
                        snapshot.free, snapshot.total
                    ));
                }
                Ok(())
            }
            BufferStatus::Ok => {
                ctx.low_warned = false;
                Ok(())
            }
        }
    }
}

/// Caller-side handle to a run started with [`AcquisitionScheduler::start`].
pub struct AcquisitionHandle {
    run_id: String,
    token: CancellationToken,
    progress: watch::Receiver<RunState>,
    scheduler: Arc<AcquisitionScheduler>,
    task: JoinHandle<RunReport>,
}

impl AcquisitionHandle {
    /// Identifier carried by this run's `Started` event and report.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Request cancellation at the next step boundary.
    pub fn cancel(&self) -> bool {
        self.token.request_cancel()
    }

    /// Token shared with the running task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Latest progress snapshot.
    pub fn state(&self) -> RunState {
        self.progress.borrow().clone()
    }

    /// Receiver that changes after every write.
    pub fn progress(&self) -> watch::Receiver<RunState> {
        self.progress.clone()
    }

    /// Lifecycle state of the owning scheduler.
    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// True once the task has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> AcqResult<RunReport> {
        match self.task.await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.scheduler.mark_failed();
                Err(AcqError::Internal(e.to_string()))
            }
        }
    }
}
