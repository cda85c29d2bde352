//! Buffer occupancy classification.
//!
//! The frame source owns a bounded circular buffer. Each step the scheduler takes a
//! [`BufferSnapshot`] and asks the [`BufferMonitor`] what it means: a low-space
//! warning is advisory, an overflow ends the run.

use serde::{Deserialize, Serialize};

/// Free/total capacity of the source buffer at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// Free slots
    pub free: u64,
    /// Buffer capacity
    pub total: u64,
    /// Frames were dropped since the last burst start
    pub overflowed: bool,
}

impl BufferSnapshot {
    /// Slots currently holding frames.
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// When a snapshot counts as "low on space".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowBufferPolicy {
    /// Low when `free < total / divisor`.
    Fraction {
        /// Fraction of capacity kept free, as `1 / divisor`
        divisor: u64,
    },
    /// Low when `free < channels * reserve`.
    PerChannel {
        /// Channels in the plan
        channels: u64,
        /// Slots reserved per channel
        reserve: u64,
    },
}

/// What a snapshot means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Enough free space
    Ok,
    /// Advisory only; the run continues
    Low,
    /// Frames were lost; the run must fail
    Overflowed,
}

/// Classifies buffer snapshots and remembers the last one seen.
#[derive(Debug, Clone)]
pub struct BufferMonitor {
    policy: LowBufferPolicy,
    last: BufferSnapshot,
}

impl BufferMonitor {
    /// Monitor applying `policy`, with no snapshot observed yet.
    pub fn new(policy: LowBufferPolicy) -> Self {
        Self {
            policy,
            last: BufferSnapshot::default(),
        }
    }

    /// Policy in effect.
    pub fn policy(&self) -> LowBufferPolicy {
        self.policy
    }

    /// True when `free` is below the warning threshold for `total`.
    pub fn warning_threshold(&self, free: u64, total: u64) -> bool {
        match self.policy {
            LowBufferPolicy::Fraction { divisor } => free < total / divisor.max(1),
            LowBufferPolicy::PerChannel { channels, reserve } => {
                free < channels.saturating_mul(reserve)
            }
        }
    }

    /// Record `snapshot` and classify it. Overflow takes precedence over low space.
    pub fn observe(&mut self, snapshot: BufferSnapshot) -> BufferStatus {
        self.last = snapshot;
        if snapshot.overflowed {
            BufferStatus::Overflowed
        } else if self.warning_threshold(snapshot.free, snapshot.total) {
            BufferStatus::Low
        } else {
            BufferStatus::Ok
        }
    }

    /// Whether the last observed snapshot reported an overflow.
    pub fn is_overflowed(&self) -> bool {
        self.last.overflowed
    }

    /// Most recently observed snapshot.
    pub fn last(&self) -> BufferSnapshot {
        self.last
    }
}
