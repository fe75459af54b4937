//! The per-board stream processor: buffered input, two-pass scanning,
//! sync lifecycle, and trigger-window data selection

use std::sync::Arc;

use itertools::{Itertools, MinMaxResult};
use tracing::{debug, warn};

use crate::buf::{Buf, BufQueue, BufState};
use crate::cfg::ProcSettings;
use crate::cond::{Cond, CondTest};
use crate::event::{Event, Subevent};
use crate::frontend::{Frontend, Msg};
use crate::hist::{HistSink, C1, H1};
use crate::mark::{GlobalMark, LocalMark, MarkQueue};
use crate::sync::{SyncMarker, SyncQueue, TimeRef};
use crate::{CoreError, GlobalTime, Hit, LocalTime};

/// Classification of one hit against the open trigger windows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitClass {
    /// Before every open window; keep buffering, the hit selects nothing
    Before,
    /// Inside the window of the given trigger slot
    Inside(usize),
    /// Past every open window by more than the disorder bound
    After,
}

/// One distributed trigger in work: its place on the shared timeline and
/// the hits this board has attached so far
#[derive(Debug)]
struct TrigSlot {
    tm: GlobalTime,
    mine: bool,
    closed: bool,
    hits: Vec<Hit>,
}

/// Generic processor of one board's data stream. Owns its buffer, sync,
/// and local-mark queues exclusively; shares only the trigger hand-off
/// with the coordinator.
pub struct StreamProc {
    name: String,
    board: u32,
    frontend: Frontend,
    settings: ProcSettings,
    queue: BufQueue,
    syncs: SyncQueue,
    local_marks: MarkQueue,
    triggers: Vec<TrigSlot>,
    /// Index of the first trigger slot not yet closed
    trig_scan_index: usize,
    /// Timeline is authoritative up to here after a distribute round
    horizon: Option<GlobalTime>,
    window: Cond,
    /// Unwrapped sync pulse counter; wire ids are 4 bits
    sync_seq: Option<u32>,
    eof: bool,
    sink: Arc<dyn HistSink>,
    h_raw: H1,
    h_trigger_tm: H1,
    h_multipl: H1,
    c_window: C1,
}

impl StreamProc {
    pub fn new(
        name: &str,
        board: u32,
        frontend: Frontend,
        settings: ProcSettings,
        sink: Arc<dyn HistSink>,
    ) -> Self {
        let h_raw = sink.make_h1(
            &format!("{name}.RawHits"),
            "hit channel distribution",
            16,
            0.,
            16.,
        );
        let h_trigger_tm = sink.make_h1(
            &format!("{name}.TriggerTm"),
            "hit time relative to trigger",
            200,
            settings.window_left * 2.,
            settings.window_right * 2.,
        );
        let h_multipl = sink.make_h1(
            &format!("{name}.Multipl"),
            "subevent multiplicity",
            64,
            0.,
            64.,
        );
        let c_window = sink.make_c1(
            &format!("{name}.TriggerWindow"),
            settings.window_left,
            settings.window_right,
        );
        StreamProc {
            name: name.to_string(),
            board,
            frontend,
            queue: BufQueue::new(settings.bufs_queue_capacity),
            syncs: SyncQueue::new(settings.marks_queue_capacity),
            local_marks: MarkQueue::new(settings.marks_queue_capacity),
            triggers: Vec::new(),
            trig_scan_index: 0,
            horizon: None,
            window: Cond::new(settings.window_left, settings.window_right),
            sync_seq: None,
            eof: false,
            sink,
            h_raw,
            h_trigger_tm,
            h_multipl,
            c_window,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn board(&self) -> u32 {
        self.board
    }

    pub fn kind(&self) -> crate::frontend::BoardKind {
        self.frontend.kind()
    }

    pub fn is_raw_scan_only(&self) -> bool {
        self.settings.raw_scan_only
    }

    pub fn is_hist_filling(&self) -> bool {
        self.settings.hist_filling
    }

    /// Time constant bounding how far message disorder can go
    pub fn maximum_disorder_tm(&self) -> f64 {
        self.settings.disorder_tm
    }

    /// Reconfigure the selection window relative to the trigger reference
    pub fn set_trigger_window(&mut self, left: f64, right: f64) {
        self.settings.window_left = left;
        self.settings.window_right = right;
        self.window.change(left, right);
        if self.settings.hist_filling {
            self.sink.change_c1(self.c_window, left, right);
        }
    }

    /// Minimal spacing between accepted local triggers
    pub fn set_trigger_margin(&mut self, margin: f64) {
        self.settings.trigger_margin = margin;
    }

    pub fn set_hist_filling(&mut self, on: bool) {
        self.settings.hist_filling = on;
    }

    pub fn set_time_sorting(&mut self, on: bool) {
        self.settings.time_sorting = on;
    }

    fn fill_h1(&self, h: H1, x: f64) {
        if self.settings.hist_filling {
            self.sink.fill_h1(h, x, 1.);
        }
    }

    // --- input side ---------------------------------------------------

    /// Provide the next chunk of raw data. Fails observably when the queue
    /// is at capacity; the producer must back off.
    pub fn add_next_buffer(&mut self, buf: Buf) -> Result<(), CoreError> {
        self.queue.add(buf)
    }

    pub fn num_buffers(&self) -> usize {
        self.queue.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.queue.capacity()
    }

    // --- sync queue ---------------------------------------------------

    pub fn num_syncs(&self) -> usize {
        self.syncs.len()
    }

    pub fn num_ready_syncs(&self) -> usize {
        self.syncs.num_ready()
    }

    pub fn get_sync(&self, idx: usize) -> Option<&SyncMarker> {
        self.syncs.get(idx)
    }

    pub fn find_sync_with_id(&self, id: u32) -> Option<usize> {
        self.syncs.find_with_id(id)
    }

    /// Record a synchronization marker. Markers must arrive in strict local
    /// time order; a violation is a protocol error.
    pub fn add_sync_marker(&mut self, marker: SyncMarker) -> Result<(), CoreError> {
        self.syncs.add(marker)
    }

    /// Map a board-local time onto the shared timeline
    pub fn local_to_global(&self, tm: LocalTime) -> Result<(GlobalTime, TimeRef), CoreError> {
        if self.settings.sync_required {
            self.syncs.local_to_global(tm)
        } else {
            Ok((GlobalTime::from_secs(tm.as_secs()), TimeRef::Interpolated))
        }
    }

    /// Accept a local trigger candidate, enforcing time order and margin
    pub fn add_trigger_marker(&mut self, mark: LocalMark) -> Result<bool, CoreError> {
        self.local_marks.add(mark, self.settings.trigger_margin)
    }

    /// Extend a wrapped 4-bit pulse id into the full sequence number
    fn extend_sync_id(&mut self, id: u8) -> u32 {
        let seq = match self.sync_seq {
            None => id as u32,
            Some(prev) => {
                let mut cand = (prev & !0xf) | id as u32;
                if cand <= prev {
                    cand += 0x10;
                }
                cand
            }
        };
        self.sync_seq = Some(seq);
        seq
    }

    // --- first scan ---------------------------------------------------

    /// Scan all unseen buffers: index messages, extract sync and trigger
    /// markers, fill raw statistics. Returns how many buffers advanced.
    pub fn scan_new_buffers(&mut self) -> Result<usize, CoreError> {
        let mut scanned = 0;
        while self.queue.scan_index() < self.queue.len() {
            let idx = self.queue.scan_index();
            let data = match self.queue.get(idx) {
                Some(b) => b.data.clone(),
                None => break,
            };
            let msgs = self.frontend.scan(&data)?;
            self.first_buffer_scan(idx, &msgs)?;
            self.queue.advance_scan();
            if self.settings.raw_scan_only {
                // Raw-only processors take no part in selection; their
                // buffers are complete after one pass
                if let Some(b) = self.queue.get_mut(idx) {
                    b.state = BufState::SecondScanned;
                }
                self.queue.advance_scan_tm();
            }
            scanned += 1;
        }
        Ok(scanned)
    }

    fn first_buffer_scan(&mut self, idx: usize, msgs: &[Msg]) -> Result<(), CoreError> {
        let (head, tail) = match msgs.iter().map(|m| m.tm()).minmax() {
            MinMaxResult::NoElements => (None, None),
            MinMaxResult::OneElement(t) => (Some(t), Some(t)),
            MinMaxResult::MinMax(a, b) => (Some(a), Some(b)),
        };
        for msg in msgs {
            match *msg {
                Msg::Hit { channel, .. } => {
                    self.fill_h1(self.h_raw, channel as f64);
                }
                Msg::Sync { id, tm } => {
                    if self.settings.sync_required {
                        let seq = self.extend_sync_id(id);
                        let global_tm = GlobalTime::from_secs(
                            seq as f64 * self.settings.sync_period + self.settings.sync_offset,
                        );
                        self.syncs.add(SyncMarker {
                            id: seq,
                            local_tm: tm,
                            global_tm,
                        })?;
                    }
                }
                Msg::Trigger { kind, tm } => {
                    if !self.settings.raw_scan_only {
                        self.add_trigger_marker(LocalMark { kind, tm })?;
                    }
                }
            }
        }
        if let Some(b) = self.queue.get_mut(idx) {
            b.state = BufState::FirstScanned;
            b.head_local = head;
            b.tail_local = tail;
        }
        Ok(())
    }

    // --- time scan ----------------------------------------------------

    /// With newly available sync markers, finalize buffer timestamps on the
    /// shared timeline. A buffer whose range is not yet bracketed simply
    /// does not advance: that is a suspension, not an error.
    pub fn scan_new_buffers_tm(&mut self) -> Result<usize, CoreError> {
        let mut advanced = 0;
        while self.queue.scan_index_tm() < self.queue.scan_index() {
            let idx = self.queue.scan_index_tm();
            let (head, tail) = match self.queue.get(idx) {
                Some(b) => (b.head_local, b.tail_local),
                None => break,
            };
            let resolvable = match tail {
                // No messages: nothing to time
                None => true,
                Some(t) => {
                    if !self.settings.sync_required {
                        true
                    } else if self.eof {
                        // At end of input, settle for extrapolation
                        !self.syncs.is_empty()
                    } else {
                        self.syncs.covers(t)
                    }
                }
            };
            if !resolvable {
                break;
            }
            let head_global = match head {
                Some(h) => Some(self.local_to_global(h)?.0),
                None => None,
            };
            let tail_global = match tail {
                Some(t) => Some(self.local_to_global(t)?.0),
                None => None,
            };
            if let Some(b) = self.queue.get_mut(idx) {
                b.head_global = head_global;
                b.tail_global = tail_global;
                b.state = BufState::TimeResolved;
            }
            self.queue.advance_scan_tm();
            advanced += 1;
        }
        Ok(advanced)
    }

    // --- trigger hand-off ---------------------------------------------

    /// Publish locally-detected trigger candidates, converted to the shared
    /// timeline, into the coordinator's queue. Candidates whose time is not
    /// yet bracketed by sync markers stay queued for a later round.
    pub fn collect_triggers(&mut self, dst: &mut Vec<GlobalMark>) -> Result<usize, CoreError> {
        if self.settings.raw_scan_only {
            return Ok(0);
        }
        let mut collected = 0;
        while let Some(&mark) = self.local_marks.front() {
            let convertible =
                !self.settings.sync_required || self.eof || self.syncs.covers(mark.tm);
            if !convertible {
                break;
            }
            match self.local_to_global(mark.tm) {
                Ok((tm, _)) => {
                    dst.push(GlobalMark {
                        kind: mark.kind,
                        tm,
                        source: self.board,
                    });
                    self.local_marks.pop_front();
                    collected += 1;
                }
                // End of input with no sync anchors at all: the candidate
                // has no place on the shared timeline
                Err(CoreError::NotReady(_)) => {
                    warn!(proc = %self.name, "dropping trigger mark, no sync anchors");
                    self.local_marks.pop_front();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(collected)
    }

    /// Receive the arbitrated global trigger timeline back. New triggers
    /// past the known horizon get a slot; a candidate of ours missing from
    /// the list was rejected, which is not an error.
    pub fn distribute_triggers(&mut self, merged: &[GlobalMark]) {
        if self.settings.raw_scan_only {
            return;
        }
        for mark in merged {
            if self.horizon.map_or(false, |h| mark.tm <= h) {
                continue;
            }
            self.triggers.push(TrigSlot {
                tm: mark.tm,
                mine: mark.source == self.board,
                closed: false,
                hits: Vec::new(),
            });
            self.horizon = Some(mark.tm);
        }
    }

    pub fn num_triggers(&self) -> usize {
        self.triggers.len()
    }

    pub fn trigger_tm(&self, idx: usize) -> Option<GlobalTime> {
        self.triggers.get(idx).map(|t| t.tm)
    }

    /// Whether this board proposed the trigger at `idx`
    pub fn trigger_is_mine(&self, idx: usize) -> Option<bool> {
        self.triggers.get(idx).map(|t| t.mine)
    }

    // --- window matching ----------------------------------------------

    /// Classify a hit time against the open trigger windows.
    /// `normal_hit` marks data that may be selected into a subevent;
    /// `can_close_event` allows this hit to witness that leading windows
    /// are complete once it is past them by more than the disorder bound.
    pub fn test_hit_time(
        &mut self,
        tm: GlobalTime,
        normal_hit: bool,
        can_close_event: bool,
    ) -> HitClass {
        if can_close_event {
            while self.trig_scan_index < self.triggers.len() {
                let slot = &mut self.triggers[self.trig_scan_index];
                let closing_edge = slot.tm.as_secs()
                    + self.settings.window_right
                    + self.settings.disorder_tm;
                if tm.as_secs() > closing_edge {
                    slot.closed = true;
                    self.trig_scan_index += 1;
                } else {
                    break;
                }
            }
        }
        for idx in self.trig_scan_index..self.triggers.len() {
            let rel = tm.delta(self.triggers[idx].tm);
            match self.window.test(rel) {
                CondTest::Inside => {
                    if normal_hit {
                        self.fill_h1(self.h_trigger_tm, rel);
                    }
                    return HitClass::Inside(idx);
                }
                // Windows are time-ordered: below this one means below all
                // later ones too
                CondTest::Below => return HitClass::Before,
                CondTest::Above => continue,
            }
        }
        HitClass::After
    }

    // --- second scan --------------------------------------------------

    /// Select hit data into the distributed trigger windows. Buffers are
    /// processed strictly in order, and only once the trigger timeline is
    /// authoritative past their range (or input has ended).
    pub fn scan_data_for_new_triggers(&mut self) -> Result<usize, CoreError> {
        let mut scanned = 0;
        loop {
            let idx = match self
                .queue
                .iter()
                .position(|b| b.state != BufState::SecondScanned)
            {
                Some(i) => i,
                None => break,
            };
            let (data, tail) = match self.queue.get(idx) {
                Some(b) if b.state == BufState::TimeResolved => (b.data.clone(), b.tail_global),
                _ => break,
            };
            let coverage_ok = match tail {
                None => true,
                Some(t) => {
                    self.eof
                        || self
                            .horizon
                            .map_or(false, |h| h.as_secs() >= t.as_secs() - self.settings.window_left)
                }
            };
            if !coverage_ok {
                break;
            }
            let msgs = self.frontend.scan(&data)?;
            self.second_buffer_scan(&msgs)?;
            if let Some(b) = self.queue.get_mut(idx) {
                b.state = BufState::SecondScanned;
            }
            scanned += 1;
        }
        Ok(scanned)
    }

    fn second_buffer_scan(&mut self, msgs: &[Msg]) -> Result<(), CoreError> {
        for msg in msgs {
            let (tm, _) = self.local_to_global(msg.tm())?;
            let (normal, can_close, channel) = match *msg {
                Msg::Hit { channel, .. } => (true, true, channel),
                Msg::Sync { .. } => (false, true, 0),
                Msg::Trigger { .. } => (false, false, 0),
            };
            if let HitClass::Inside(idx) = self.test_hit_time(tm, normal, can_close) {
                if normal {
                    self.triggers[idx].hits.push(Hit { channel, tm });
                }
            }
        }
        Ok(())
    }

    // --- output side --------------------------------------------------

    /// Number of leading triggers whose windows are closed and whose
    /// subevents can be appended
    pub fn num_ready_subevents(&self) -> usize {
        self.trig_scan_index
    }

    /// Time of the next ready trigger, if any
    pub fn next_ready_trigger(&self) -> Option<GlobalTime> {
        self.triggers.first().filter(|t| t.closed).map(|t| t.tm)
    }

    /// Append this board's data for the oldest ready trigger to the event.
    /// Returns false when no trigger is ready.
    pub fn append_subevent(&mut self, evt: &mut Event) -> bool {
        match self.triggers.first() {
            Some(slot) if slot.closed => {}
            _ => return false,
        }
        let slot = self.triggers.remove(0);
        self.trig_scan_index = self.trig_scan_index.saturating_sub(1);
        let mut hits = slot.hits;
        if self.settings.time_sorting {
            hits.sort_by(|a, b| a.tm.as_secs().total_cmp(&b.tm.as_secs()));
        }
        self.fill_h1(self.h_multipl, hits.len() as f64);
        evt.push(Subevent {
            board: self.board,
            hits,
        });
        true
    }

    // --- flushing -----------------------------------------------------

    /// Propose a conservative flush point: never past the last bracketed
    /// sync marker, never past the coordinator's own marker.
    pub fn provide_potential_flush_time(&self, last_marker: GlobalTime) -> Option<GlobalTime> {
        if !self.settings.sync_required || self.settings.raw_scan_only {
            return Some(last_marker);
        }
        let ready = self.syncs.num_ready();
        if ready == 0 {
            return None;
        }
        let anchor = self.syncs.get(ready - 1)?.global_tm;
        Some(if anchor < last_marker { anchor } else { last_marker })
    }

    /// Check that releasing state up to `flush` discards nothing a still-open
    /// window could receive, and nothing not yet fully scanned.
    pub fn verify_flush_time(&self, flush: GlobalTime) -> bool {
        for b in self.queue.iter() {
            if b.state == BufState::SecondScanned {
                continue;
            }
            match b.head_global {
                // Unresolved data might precede the flush point
                None => {
                    if b.head_local.is_some() {
                        return false;
                    }
                }
                Some(h) => {
                    if h < flush {
                        return false;
                    }
                }
            }
        }
        for slot in &self.triggers[self.trig_scan_index..] {
            if slot.tm.as_secs() + self.settings.window_left < flush.as_secs() {
                return false;
            }
        }
        true
    }

    /// Retire fully-scanned buffers and consumed sync markers up to `flush`
    pub fn flush(&mut self, flush: GlobalTime) -> Result<usize, CoreError> {
        if !self.verify_flush_time(flush) {
            return Err(CoreError::NotReady("flush"));
        }
        let mut retired = 0;
        while let Some(b) = self.queue.get(0) {
            let done = b.state == BufState::SecondScanned
                && b.tail_global.map_or(true, |t| t < flush);
            if !done {
                break;
            }
            self.queue.pop_scanned();
            retired += 1;
        }
        // Keep the newest pre-flush marker as the left interpolation anchor
        let mut before = 0;
        while self
            .syncs
            .get(before)
            .map_or(false, |m| m.global_tm < flush)
        {
            before += 1;
        }
        if before > 1 {
            self.syncs.erase_first(before - 1);
        }
        debug!(
            proc = %self.name,
            retired,
            syncs = self.syncs.len(),
            "flushed to {:.9}s",
            flush.as_secs()
        );
        Ok(retired)
    }

    // --- recovery and end of input -------------------------------------

    /// Discard `n` buffers without scanning them
    pub fn skip_buffers(&mut self, n: usize) -> usize {
        self.queue.skip(n)
    }

    /// Drop all buffers, marks, and triggers; used on resynchronization
    pub fn skip_all_data(&mut self) {
        self.queue.skip_all();
        self.local_marks.clear();
        self.triggers.clear();
        self.trig_scan_index = 0;
        self.horizon = None;
        self.sync_seq = None;
        self.eof = false;
        self.syncs.clear();
    }

    /// Mark end of input: run the remaining first scans and finalize buffer
    /// times, extrapolating where interpolation is no longer possible.
    pub fn finish_input(&mut self) -> Result<usize, CoreError> {
        self.scan_new_buffers()?;
        self.eof = true;
        self.scan_new_buffers_tm()
    }

    /// After the final trigger distribution: select everything left, close
    /// every window, and retire the queue.
    pub fn finish_events(&mut self) -> Result<usize, CoreError> {
        let scanned = self.scan_data_for_new_triggers()?;
        while self.trig_scan_index < self.triggers.len() {
            self.triggers[self.trig_scan_index].closed = true;
            self.trig_scan_index += 1;
        }
        while self.queue.pop_scanned().is_some() {}
        if !self.queue.is_empty() {
            warn!(
                proc = %self.name,
                left = self.queue.len(),
                "dropping buffers with unresolvable timestamps at end of input"
            );
            self.queue.skip_all();
        }
        Ok(scanned)
    }
}
