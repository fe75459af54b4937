//! Assembled output events

use crate::{GlobalTime, Hit};

/// The portion of one correlated event contributed by a single board
#[derive(Clone, Debug, PartialEq)]
pub struct Subevent {
    pub board: u32,
    pub hits: Vec<Hit>,
}

/// One correlated physics event: a trigger reference on the shared timeline
/// plus the subevents each processor attached to it
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub tm: GlobalTime,
    pub subevents: Vec<Subevent>,
}

impl Event {
    pub fn new(tm: GlobalTime) -> Self {
        Event {
            tm,
            subevents: Vec::new(),
        }
    }

    pub fn push(&mut self, sub: Subevent) {
        self.subevents.push(sub);
    }

    /// Total hits across all contributing boards
    pub fn multiplicity(&self) -> usize {
        self.subevents.iter().map(|s| s.hits.len()).sum()
    }
}
