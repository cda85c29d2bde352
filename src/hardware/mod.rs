//! Hardware abstraction.
//!
//! The scheduler only ever talks to a [`FrameSource`]. Real camera drivers implement
//! it outside this crate; [`mock::MockCamera`] is the simulated source used by the
//! CLI and the test suite.

pub mod capabilities;
pub mod mock;

pub use capabilities::{FrameGeometry, FrameSource};
pub use mock::{FaultPlan, MockCamera, MockCameraBuilder};
