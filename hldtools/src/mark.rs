//! Local and global trigger marks

use std::collections::VecDeque;

use crate::{CoreError, GlobalTime, LocalTime};

/// A candidate trigger observed by one board, still in its clock domain
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalMark {
    pub kind: u8,
    pub tm: LocalTime,
}

/// A trigger on the shared timeline. Candidates carry the proposing board;
/// after arbitration the coordinator's merged list keeps the first proposer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlobalMark {
    pub kind: u8,
    pub tm: GlobalTime,
    pub source: u32,
}

/// Queue of local trigger marks awaiting conversion and collection.
/// Accepted marks are non-decreasing in time, with a margin spacing to
/// reject retriggers; a violating mark is dropped, not an error.
#[derive(Debug)]
pub struct MarkQueue {
    items: VecDeque<LocalMark>,
    capacity: usize,
    last_tm: Option<LocalTime>,
}

impl MarkQueue {
    pub fn new(capacity: usize) -> Self {
        MarkQueue {
            items: VecDeque::new(),
            capacity,
            last_tm: None,
        }
    }

    /// Try to accept a new mark: it must not precede the last accepted one
    /// and must keep at least `margin` seconds of spacing. Returns whether
    /// the mark was accepted.
    pub fn add(&mut self, mark: LocalMark, margin: f64) -> Result<bool, CoreError> {
        if self.items.len() == self.capacity {
            return Err(CoreError::QueueFull {
                capacity: self.capacity,
            });
        }
        if let Some(last) = self.last_tm {
            if mark.tm < last || mark.tm.as_secs() - last.as_secs() < margin {
                return Ok(false);
            }
        }
        self.last_tm = Some(mark.tm);
        self.items.push_back(mark);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn front(&self) -> Option<&LocalMark> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<LocalMark> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.last_tm = None;
    }
}

/// Merge candidate triggers from several boards into one ordered, deduped
/// timeline. Candidates within `margin` seconds of an accepted trigger are
/// folded into it; the earliest proposal wins and keeps its source.
pub fn merge_marks(mut candidates: Vec<GlobalMark>, margin: f64) -> Vec<GlobalMark> {
    candidates.sort_by(|a, b| a.tm.as_secs().total_cmp(&b.tm.as_secs()));
    let mut merged: Vec<GlobalMark> = Vec::with_capacity(candidates.len());
    for c in candidates {
        match merged.last() {
            Some(last) if c.tm.delta(last.tm) <= margin => {}
            _ => merged.push(c),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(tm: f64) -> LocalMark {
        LocalMark {
            kind: 1,
            tm: LocalTime::from_secs(tm),
        }
    }

    fn gmark(tm: f64, source: u32) -> GlobalMark {
        GlobalMark {
            kind: 1,
            tm: GlobalTime::from_secs(tm),
            source,
        }
    }

    #[test]
    fn margin_rejects_retriggers() {
        let mut q = MarkQueue::new(16);
        assert!(q.add(mark(100.0), 10.0).unwrap());
        assert!(!q.add(mark(105.0), 10.0).unwrap());
        assert!(!q.add(mark(90.0), 10.0).unwrap());
        assert!(q.add(mark(111.0), 10.0).unwrap());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn capacity_enforced() {
        let mut q = MarkQueue::new(1);
        assert!(q.add(mark(0.0), 0.0).unwrap());
        assert!(matches!(
            q.add(mark(1.0), 0.0),
            Err(CoreError::QueueFull { capacity: 1 })
        ));
    }

    #[test]
    fn merge_orders_and_dedups() {
        let merged = merge_marks(
            vec![
                gmark(1150.0, 1),
                gmark(1150.3, 2),
                gmark(1100.0, 2),
                gmark(1250.0, 1),
            ],
            1.0,
        );
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].tm.as_secs(), 1100.0);
        assert_eq!(merged[1].tm.as_secs(), 1150.0);
        assert_eq!(merged[1].source, 1);
        assert_eq!(merged[2].tm.as_secs(), 1250.0);
    }
}
