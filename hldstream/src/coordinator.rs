//! Trigger coordinator: the single authority assembling the global
//! trigger timeline

use std::thread;

use tracing::warn;

use hldtools::mark::{merge_marks, GlobalMark};

pub enum CoordMessage {
    /// Fold a batch of candidate triggers into the timeline and reply with
    /// the authoritative merged list
    Merge {
        candidates: Vec<GlobalMark>,
        respond_to: flume::Sender<Vec<GlobalMark>>,
    },
}

/// Handle to the coordinator thread. All `collect` results from all
/// processors funnel through this one actor before any distribution, which
/// serializes the hand-off structurally: the thread owns the timeline and
/// handles one message at a time.
pub struct CoordinatorHandle {
    pub sender: flume::Sender<CoordMessage>,
}

impl CoordinatorHandle {
    pub fn new(margin: f64) -> Self {
        let (sender, receiver) = flume::unbounded();
        thread::spawn(move || {
            let mut timeline: Vec<GlobalMark> = Vec::new();
            while let Ok(msg) = receiver.recv() {
                match msg {
                    CoordMessage::Merge {
                        candidates,
                        respond_to,
                    } => {
                        if let Some(last) = timeline.last() {
                            for c in candidates.iter().filter(|c| c.tm < last.tm) {
                                // The merged prefix is already distributed;
                                // a candidate this late lost its slot
                                warn!(
                                    source = c.source,
                                    tm = c.tm.as_secs(),
                                    "candidate trigger behind the distributed timeline"
                                );
                            }
                        }
                        let mut all = timeline.clone();
                        all.extend(candidates);
                        timeline = merge_marks(all, margin);
                        let _ = respond_to.send(timeline.clone());
                    }
                }
            }
        });
        CoordinatorHandle { sender }
    }

    /// One serialized merge round: send candidates, wait for the merged
    /// timeline
    pub fn merge(&self, candidates: Vec<GlobalMark>) -> Vec<GlobalMark> {
        let (respond_to, response) = flume::bounded(1);
        if self
            .sender
            .send(CoordMessage::Merge {
                candidates,
                respond_to,
            })
            .is_err()
        {
            return Vec::new();
        }
        response.recv().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hldtools::GlobalTime;

    fn gmark(tm: f64, source: u32) -> GlobalMark {
        GlobalMark {
            kind: 1,
            tm: GlobalTime::from_secs(tm),
            source,
        }
    }

    #[test]
    fn rounds_accumulate_and_dedup() {
        let coord = CoordinatorHandle::new(1.0);
        let t1 = coord.merge(vec![gmark(10.0, 1)]);
        assert_eq!(t1.len(), 1);
        // A coincident proposal from another board folds into the same slot
        let t2 = coord.merge(vec![gmark(10.3, 2), gmark(20.0, 2)]);
        assert_eq!(t2.len(), 2);
        assert_eq!(t2[0].source, 1);
        assert_eq!(t2[1].tm.as_secs(), 20.0);
    }
}
