//! Configuration formats for declaring and recording correlation runs

use chrono::{offset::Local, DateTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::frontend::BoardKind;

/// Per-processor settings, all fixed at construction time. Queue capacities
/// trade memory for tolerance of inter-board delivery jitter: generous for
/// bursty store-and-forward boards, tight for well-clocked ones.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ProcSettings {
    pub bufs_queue_capacity: usize,
    pub marks_queue_capacity: usize,
    /// Trigger window edges relative to the reference, in seconds
    pub window_left: f64,
    pub window_right: f64,
    /// Minimal spacing between accepted local triggers, in seconds
    pub trigger_margin: f64,
    /// How far message disorder can go before a window may close, in seconds
    pub disorder_tm: f64,
    /// Spacing of the synchronization pulser on the shared timeline
    pub sync_period: f64,
    /// Constant delivery skew of sync pulses to this board
    pub sync_offset: f64,
    /// When false, local stamps convert through identity
    pub sync_required: bool,
    /// First scan only; processor exempt from data selection
    pub raw_scan_only: bool,
    /// Sort hits by time in the output subevent
    pub time_sorting: bool,
    pub hist_filling: bool,
}

impl Default for ProcSettings {
    fn default() -> Self {
        ProcSettings {
            bufs_queue_capacity: 100,
            marks_queue_capacity: 1000,
            window_left: -1e-6,
            window_right: 1e-6,
            trigger_margin: 0.,
            disorder_tm: 1e-6,
            sync_period: 1e-3,
            sync_offset: 0.,
            sync_required: true,
            raw_scan_only: false,
            time_sorting: false,
            hist_filling: true,
        }
    }
}

/// One readout board in the run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BoardDecl {
    pub board: u32,
    pub kind: BoardKind,
    /// Subsystem id selected by `trb` frontends
    pub subsystem: Option<u32>,
    /// Channel mask applied by `tdc` frontends
    pub channel_mask: Option<u16>,
    #[serde(default)]
    pub settings: ProcSettings,
}

/// Either a fixed time duration or a number of assembled events. Duration
/// is parsed as in [humantime](https://docs.rs/humantime/), e.g. `2min 12us`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RunLimit {
    #[serde(with = "humantime_serde")]
    Duration(Duration),
    EventLimit(u64),
}

/// Run specification for both declaring and recording correlation runs in
/// text files. A declaration sets the boards and optional limits; the
/// recorded version fills in the timestamp and event count.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Run {
    pub name: String,
    pub timestamp: Option<DateTime<Local>>,
    pub limit: Option<RunLimit>,
    /// Path for the TSV dump of assembled events, when wanted
    pub save_events: Option<PathBuf>,
    /// Margin the coordinator uses to fold coincident candidates, seconds
    pub merge_margin: Option<f64>,
    pub events_built: Option<u64>,
    #[serde(default = "emptyvec", skip_serializing_if = "Vec::is_empty")]
    pub boards: Vec<BoardDecl>,
}

fn emptyvec<T>() -> Vec<T> {
    Vec::new()
}

/// Creates an empty Run. Specific defaults are implementation-dependent.
impl Default for Run {
    fn default() -> Self {
        Run {
            name: String::new(),
            timestamp: None,
            limit: None,
            save_events: None,
            merge_margin: None,
            events_built: None,
            boards: Vec::new(),
        }
    }
}
