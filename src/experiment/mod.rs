//! Acquisition orchestration.
//!
//! - [`coords`]: linear index ↔ coordinate mapping in both iteration orders
//! - [`buffer`]: source buffer classification (low space, overflow)
//! - [`cancel`]: cooperative cancellation token
//! - [`plan`]: what to acquire
//! - [`run_engine`]: the scheduler that executes a plan
//! - [`events`]: started/progress/terminal notifications
//! - [`state`]: lifecycle state and run reports
//! - [`replay`]: reading a stored dataset back by coordinate

pub mod buffer;
pub mod cancel;
pub mod coords;
pub mod events;
pub mod plan;
pub mod replay;
pub mod run_engine;
pub mod state;

pub use buffer::{BufferMonitor, BufferSnapshot, BufferStatus, LowBufferPolicy};
pub use cancel::CancellationToken;
pub use coords::{map_index, unmap_coordinate, Coordinate, IterationOrder, Shape};
pub use events::{AcquisitionEvent, AcquisitionObserver, EventChannel, ObserverHandle};
pub use plan::{AcquisitionPlan, AcquisitionPlanBuilder, Axis, ChannelSpec, Strategy};
pub use replay::{replay_dataset, ReplaySummary};
pub use run_engine::{timepoint_sleep, AcquisitionHandle, AcquisitionScheduler, SchedulerSettings};
pub use state::{RunOutcome, RunReport, RunState, SchedulerState};
