//! Serialization of assembled events to tab-separated values

use std::io::Write;

use crate::event::Event;

/// Write events as TSV records (event time, board, channel, hit time),
/// one row per hit. Times are in seconds on the shared timeline.
pub fn tsv(wtr: &mut csv::Writer<impl Write>, events: &[Event]) -> csv::Result<()> {
    for ev in events {
        for sub in &ev.subevents {
            for hit in &sub.hits {
                wtr.write_record(&[
                    format!("{:.9}", ev.tm.as_secs()),
                    sub.board.to_string(),
                    hit.channel.to_string(),
                    format!("{:.9}", hit.tm.as_secs()),
                ])?;
            }
        }
    }
    Ok(())
}
