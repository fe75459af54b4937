//! Save thread: streams assembled events to a TSV file

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::thread;

use hldtools::event::Event;
use hldtools::ser;

pub enum SaveMessage {
    Save(Vec<Event>),
}

pub struct SaveHandle {
    pub sender: flume::Sender<SaveMessage>,
    pub join_handle: thread::JoinHandle<Result<u64>>,
}

impl SaveHandle {
    pub fn new(events_path: Option<PathBuf>) -> Self {
        let (sender, receiver) = flume::unbounded();
        let join_handle = thread::spawn(move || {
            let mut wtr: Option<csv::Writer<fs::File>> = None;
            let mut rows = 0u64;
            while let Ok(SaveMessage::Save(events)) = receiver.recv() {
                if wtr.is_none() {
                    wtr = Some(open_writer(events_path.clone())?);
                }
                if let Some(w) = wtr.as_mut() {
                    ser::tsv(w, &events).context("writing events")?;
                    rows += events.iter().map(|e| e.multiplicity() as u64).sum::<u64>();
                }
            }
            if let Some(mut w) = wtr {
                w.flush()?;
            }
            Ok(rows)
        });
        SaveHandle {
            sender,
            join_handle,
        }
    }
}

fn open_writer(path: Option<PathBuf>) -> Result<csv::Writer<fs::File>> {
    let path = match path {
        Some(p) => p,
        None => {
            let mut p = std::env::current_dir()?;
            p.push(Utc::now().format("%F-%H-%M-%S").to_string());
            p.set_extension("events.tsv");
            p
        }
    };
    if path.exists() {
        bail!("events file already exists");
    }
    let f = fs::File::create(path)?;
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_writer(f))
}
