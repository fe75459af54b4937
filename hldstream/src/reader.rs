//! File reader: splits recorded raw streams into processor-sized chunks

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tracing::info;

use hldraw::{padded, RawEvent};

use crate::Chunk;

/// How the byte stream divides into buffers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    /// Event-framed records; chunks break on event boundaries only
    Framed { events_per_chunk: usize },
    /// Bare hit-word stream; chunks break on word boundaries
    Words { bytes_per_chunk: usize },
}

/// Owns the reader thread. Chunks arrive on `receiver` until end of file,
/// then the channel closes.
pub struct ReaderHandle {
    pub receiver: flume::Receiver<Chunk>,
    pub join_handle: thread::JoinHandle<Result<u64>>,
}

impl ReaderHandle {
    pub fn new(path: impl AsRef<Path>, mode: SplitMode) -> Result<Self> {
        let bytes = read_raw(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        // Bounded so a stalled pipeline applies backpressure to the reader
        let (sender, receiver) = flume::bounded(16);
        let join_handle = thread::spawn(move || {
            let mut total = 0u64;
            for (seq, chunk) in split(&bytes, mode)?.into_iter().enumerate() {
                total += chunk.len() as u64;
                if sender
                    .send(Chunk {
                        seq: seq as u32,
                        bytes: Arc::from(chunk),
                    })
                    .is_err()
                {
                    break;
                }
            }
            info!(total, "reader done");
            Ok(total)
        });
        Ok(ReaderHandle {
            receiver,
            join_handle,
        })
    }
}

/// Read a raw file, transparently decompressing `.zst` input
fn read_raw(path: &Path) -> Result<Vec<u8>> {
    let f = File::open(path)?;
    let mut bytes = Vec::new();
    if path.extension().map_or(false, |e| e == "zst") {
        zstd::stream::read::Decoder::new(f)?.read_to_end(&mut bytes)?;
    } else {
        let mut f = f;
        f.read_to_end(&mut bytes)?;
    }
    Ok(bytes)
}

/// Split the stream without breaking records apart
fn split(bytes: &[u8], mode: SplitMode) -> Result<Vec<Vec<u8>>> {
    let mut chunks = Vec::new();
    match mode {
        SplitMode::Words { bytes_per_chunk } => {
            let step = bytes_per_chunk.max(4) & !3;
            for chunk in bytes.chunks(step) {
                chunks.push(chunk.to_vec());
            }
        }
        SplitMode::Framed { events_per_chunk } => {
            let per = events_per_chunk.max(1);
            let mut rest = bytes;
            while !rest.is_empty() {
                let mut off = 0;
                let mut n = 0;
                while n < per && off < rest.len() {
                    let ev = RawEvent::parse(&rest[off..])
                        .context("malformed event record in input")?;
                    off += padded(ev.size() as usize).min(rest.len() - off);
                    n += 1;
                }
                if n == 0 {
                    bail!("input does not start on an event boundary");
                }
                chunks.push(rest[..off].to_vec());
                rest = &rest[off..];
            }
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hldraw::ser::{self, Order};

    #[test]
    fn word_split_keeps_word_boundaries() {
        let bytes: Vec<u8> = (0..100u8).collect();
        let chunks = split(&bytes, SplitMode::Words { bytes_per_chunk: 33 }).unwrap();
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.len() % 4 == 0));
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn framed_split_respects_event_boundaries() {
        let sub = ser::subevent(Order::Little, 2, 0x301, 1, &[1, 2, 3]);
        let mut bytes = Vec::new();
        for seq in 0..5 {
            bytes.extend_from_slice(&ser::event(Order::Little, seq, 0, &[sub.clone()]));
        }
        let chunks = split(&bytes, SplitMode::Framed { events_per_chunk: 2 }).unwrap();
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            // Every chunk re-parses as whole events
            for ev in hldraw::EventIter::new(chunk) {
                ev.unwrap();
            }
        }
    }
}
