//! Run context: explicit owner of all processors and shared configuration

use std::sync::Arc;

use tracing::{debug, info, warn};

use hldtools::buf::Buf;
use hldtools::cfg::Run;
use hldtools::event::Event;
use hldtools::frontend::{BoardKind, Frontend};
use hldtools::hist::HistSink;
use hldtools::proc::StreamProc;
use hldtools::{CoreError, GlobalTime};

use crate::coordinator::CoordinatorHandle;
use crate::reader::SplitMode;
use crate::Chunk;

/// Default margin for folding coincident trigger candidates, seconds
pub const MERGE_MARGIN: f64 = 2e-9;

/// Owns every processor of the run plus the coordinator hand-off. All
/// construction is explicit: settings are fixed here, before any data
/// flows.
pub struct RunContext {
    procs: Vec<StreamProc>,
    coordinator: CoordinatorHandle,
    timeline_tail: Option<GlobalTime>,
    events_built: u64,
}

impl RunContext {
    pub fn from_run(run: &Run, sink: Arc<dyn HistSink>) -> Self {
        let procs = run
            .boards
            .iter()
            .map(|b| {
                let frontend = match b.kind {
                    BoardKind::Generic => Frontend::Generic,
                    BoardKind::Tdc => Frontend::Tdc {
                        channel_mask: b.channel_mask.unwrap_or(u16::MAX),
                    },
                    BoardKind::Trb => Frontend::Trb {
                        subsystem: b.subsystem.unwrap_or(0),
                    },
                    BoardKind::Hld => Frontend::Hld,
                };
                StreamProc::new(
                    &format!("brd{}", b.board),
                    b.board,
                    frontend,
                    b.settings,
                    sink.clone(),
                )
            })
            .collect::<Vec<_>>();
        info!(boards = procs.len(), "run context ready");
        RunContext {
            procs,
            coordinator: CoordinatorHandle::new(run.merge_margin.unwrap_or(MERGE_MARGIN)),
            timeline_tail: None,
            events_built: 0,
        }
    }

    pub fn num_procs(&self) -> usize {
        self.procs.len()
    }

    pub fn procs(&self) -> &[StreamProc] {
        &self.procs
    }

    pub fn events_built(&self) -> u64 {
        self.events_built
    }

    /// How the input stream splits into buffers, from the board kinds
    pub fn split_mode(&self, chunk_events: usize, chunk_bytes: usize) -> SplitMode {
        let framed = self
            .procs
            .iter()
            .any(|p| matches!(p.kind(), BoardKind::Trb | BoardKind::Hld));
        if framed {
            SplitMode::Framed {
                events_per_chunk: chunk_events,
            }
        } else {
            SplitMode::Words {
                bytes_per_chunk: chunk_bytes,
            }
        }
    }

    /// Route one chunk to every processor. All-or-nothing: when any queue
    /// is at capacity nothing is delivered and the caller must drain the
    /// pipeline before retrying.
    pub fn add_chunk(&mut self, chunk: &Chunk) -> Result<(), CoreError> {
        if let Some(p) = self
            .procs
            .iter()
            .find(|p| p.num_buffers() == p.buffer_capacity())
        {
            return Err(CoreError::QueueFull {
                capacity: p.buffer_capacity(),
            });
        }
        for p in &mut self.procs {
            let board = p.board();
            p.add_next_buffer(Buf::new(board, chunk.seq, chunk.bytes.clone()))?;
        }
        Ok(())
    }

    /// One cooperative scan round across all processors: first scans, time
    /// scans, the serialized trigger hand-off, data selection, and an
    /// opportunistic flush.
    pub fn poll(&mut self) -> Result<(), CoreError> {
        for p in &mut self.procs {
            match p.scan_new_buffers() {
                Ok(_) => {}
                // A malformed record is reported, then the processor
                // resynchronizes by dropping its stream state
                Err(CoreError::Wire(e)) => {
                    warn!(proc = p.name(), "decode failure, resynchronizing: {e}");
                    p.skip_all_data();
                }
                Err(e) => return Err(e),
            }
            p.scan_new_buffers_tm()?;
        }

        // Every collect is serialized through the coordinator before any
        // processor sees the merged timeline back
        let mut candidates = Vec::new();
        for p in &mut self.procs {
            p.collect_triggers(&mut candidates)?;
        }
        let grew = !candidates.is_empty();
        if grew {
            let merged = self.coordinator.merge(candidates);
            self.timeline_tail = merged.last().map(|m| m.tm);
            for p in &mut self.procs {
                p.distribute_triggers(&merged);
            }
        }

        for p in &mut self.procs {
            let scanned = p.scan_data_for_new_triggers()?;
            if scanned > 0 {
                debug!(proc = p.name(), scanned, "second scan");
            }
        }

        if let Some(last) = self.timeline_tail {
            let flush = self
                .procs
                .iter()
                .filter(|p| !p.is_raw_scan_only())
                .map(|p| p.provide_potential_flush_time(last))
                .try_fold(last, |acc, t| {
                    t.map(|t| if t < acc { t } else { acc })
                });
            if let Some(flush) = flush {
                for p in &mut self.procs {
                    // A processor that cannot verify the flush yet simply
                    // keeps its state
                    let _ = p.flush(flush);
                }
            }
        }
        Ok(())
    }

    /// Assemble events while every selecting processor has a ready subevent
    /// for the oldest trigger
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let mut tm: Option<GlobalTime> = None;
            for p in self.procs.iter().filter(|p| !p.is_raw_scan_only()) {
                match p.next_ready_trigger() {
                    Some(t) => tm = Some(tm.map_or(t, |c| if t < c { t } else { c })),
                    None => return events,
                }
            }
            let tm = match tm {
                Some(t) => t,
                None => return events,
            };
            let mut evt = Event::new(tm);
            for p in &mut self.procs {
                if !p.is_raw_scan_only() {
                    p.append_subevent(&mut evt);
                }
            }
            self.events_built += 1;
            events.push(evt);
        }
    }

    /// End of input: finalize all remaining state and drain the last events
    pub fn finish(&mut self) -> Result<Vec<Event>, CoreError> {
        for p in &mut self.procs {
            p.finish_input()?;
        }
        let mut candidates = Vec::new();
        for p in &mut self.procs {
            p.collect_triggers(&mut candidates)?;
        }
        let merged = self.coordinator.merge(candidates);
        for p in &mut self.procs {
            p.distribute_triggers(&merged);
        }
        for p in &mut self.procs {
            p.finish_events()?;
        }
        Ok(self.drain_events())
    }
}
