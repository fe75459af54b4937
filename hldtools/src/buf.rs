//! Bounded buffer queue with independently advancing scan cursors

use std::collections::VecDeque;
use std::sync::Arc;

use crate::{CoreError, GlobalTime, LocalTime};

/// Per-buffer progress through the two-pass scan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufState {
    Unscanned,
    FirstScanned,
    TimeResolved,
    SecondScanned,
}

/// One contiguous chunk of raw stream data from a single board. The byte
/// payload is shared, never copied; head/tail stamps are filled in as the
/// scans progress.
#[derive(Clone, Debug)]
pub struct Buf {
    pub board: u32,
    pub seq: u32,
    pub data: Arc<[u8]>,
    pub state: BufState,
    /// Earliest and latest message stamps, set by the first scan
    pub head_local: Option<LocalTime>,
    pub tail_local: Option<LocalTime>,
    /// Same range on the shared timeline, set by the time scan
    pub head_global: Option<GlobalTime>,
    pub tail_global: Option<GlobalTime>,
}

impl Buf {
    pub fn new(board: u32, seq: u32, data: Arc<[u8]>) -> Self {
        Buf {
            board,
            seq,
            data,
            state: BufState::Unscanned,
            head_local: None,
            tail_local: None,
            head_global: None,
            tail_global: None,
        }
    }
}

/// Bounded FIFO of buffers awaiting the two scans. Cursors are plain indices
/// from the queue front, shifted on retirement, so buffers can leave the
/// front without invalidating scan positions.
#[derive(Debug)]
pub struct BufQueue {
    items: VecDeque<Buf>,
    capacity: usize,
    scan_index: usize,
    scan_index_tm: usize,
}

impl BufQueue {
    pub fn new(capacity: usize) -> Self {
        BufQueue {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            scan_index: 0,
            scan_index_tm: 0,
        }
    }

    /// Append one buffer. Fails observably at capacity; the producer is
    /// responsible for back-off, there is no drop-oldest policy.
    pub fn add(&mut self, buf: Buf) -> Result<(), CoreError> {
        if self.items.len() == self.capacity {
            return Err(CoreError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(buf);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, idx: usize) -> Option<&Buf> {
        self.items.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Buf> {
        self.items.get_mut(idx)
    }

    /// Index of the next buffer for the first scan
    pub fn scan_index(&self) -> usize {
        self.scan_index
    }

    /// Index of the next buffer for the time scan; trails the first scan
    pub fn scan_index_tm(&self) -> usize {
        self.scan_index_tm
    }

    pub fn advance_scan(&mut self) {
        debug_assert!(self.scan_index < self.items.len());
        self.scan_index += 1;
    }

    pub fn advance_scan_tm(&mut self) {
        debug_assert!(self.scan_index_tm < self.scan_index);
        self.scan_index_tm += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buf> {
        self.items.iter()
    }

    /// Retire the front buffer if it has passed both scans
    pub fn pop_scanned(&mut self) -> Option<Buf> {
        match self.items.front() {
            Some(b) if b.state == BufState::SecondScanned => {
                self.scan_index = self.scan_index.saturating_sub(1);
                self.scan_index_tm = self.scan_index_tm.saturating_sub(1);
                self.items.pop_front()
            }
            _ => None,
        }
    }

    /// Discard `n` buffers from the front without scanning (recovery path)
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.items.len());
        self.items.drain(..n);
        self.scan_index = self.scan_index.saturating_sub(n);
        self.scan_index_tm = self.scan_index_tm.saturating_sub(n);
        n
    }

    /// Drop everything and reset both cursors; used on resynchronization
    pub fn skip_all(&mut self) {
        self.items.clear();
        self.scan_index = 0;
        self.scan_index_tm = 0;
    }
}
