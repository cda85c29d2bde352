//! # Rust MDA Core Library
//!
//! This crate is the core library for the `rust_mda` application: a scheduler for
//! multi-dimensional microscope acquisitions. It walks the Cartesian product of stage
//! positions, timepoints, channels and focus offsets, pulls one frame per coordinate
//! from a frame source, and stores it with its coordinate in a dataset.
//!
//! ## Crate Structure
//!
//! - **`experiment`**: Coordinate mapping, plans, the acquisition scheduler, buffer
//!   monitoring, cancellation, run events and dataset replay.
//! - **`hardware`**: The `FrameSource` capability trait and a simulated camera.
//! - **`data`**: Frames, pixel types, the `FrameSink`/`DatasetReader` storage boundary and
//!   an in-memory sink.
//! - **`config`**: Figment-based configuration (TOML + `RUST_MDA_` environment variables).
//! - **`error`**: The `AcqError` enum used across the crate.
//! - **`tracing_init`**: Structured logging setup.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod tracing_init;

pub use error::{AcqError, AcqResult};
