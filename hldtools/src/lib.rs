//! Correlation core for multi-board hit streams: buffering, time
//! synchronization, and trigger-window event selection

pub mod buf;
pub mod cfg;
pub mod cond;
pub mod event;
pub mod frontend;
pub mod hist;
pub mod mark;
pub mod proc;
pub mod ser;
pub mod sync;

use thiserror::Error;

/// Seconds per coarse time tick in the generic hit-word format
pub const TICK: f64 = 1e-9;

/// Timestamp in a single board's free-running clock domain
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Default)]
pub struct LocalTime(f64);

impl LocalTime {
    pub fn from_secs(s: f64) -> Self {
        LocalTime(s)
    }

    pub fn from_ticks(ticks: u32) -> Self {
        LocalTime(ticks as f64 * TICK)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }
}

/// Timestamp on the shared reference timeline, comparable across boards.
/// Produced by sync-marker conversion or carried on distributed trigger
/// marks; local stamps never cast into this type directly.
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug, Default)]
pub struct GlobalTime(f64);

impl GlobalTime {
    pub fn from_secs(s: f64) -> Self {
        GlobalTime(s)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Shift by a signed number of seconds
    pub fn offset(self, d: f64) -> Self {
        GlobalTime(self.0 + d)
    }

    /// Difference `self - other` in seconds
    pub fn delta(self, other: GlobalTime) -> f64 {
        self.0 - other.0
    }
}

/// One selected detector hit on the global timeline
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Hit {
    pub channel: u8,
    pub tm: GlobalTime,
}

/// Errors of the correlation core. Stalls are not errors: scan methods
/// report them as zero progress so a driver can poll fairly.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("queue at capacity {capacity}")]
    QueueFull { capacity: usize },
    #[error("sync marker out of order: {prev}s then {next}s")]
    SyncOutOfOrder { prev: f64, next: f64 },
    #[error("{0} not ready")]
    NotReady(&'static str),
    #[error(transparent)]
    Wire(#[from] hldraw::WireError),
}
