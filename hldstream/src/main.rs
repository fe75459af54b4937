use anyhow::{bail, Context, Result};
use chrono::Local;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use hldstream::ctx::RunContext;
use hldstream::reader::ReaderHandle;
use hldstream::save::{SaveHandle, SaveMessage};
use hldstream::CliArgs;
use hldtools::cfg::{Run, RunLimit};
use hldtools::hist::MemSink;
use hldtools::CoreError;

fn main() -> Result<()> {
    let args: CliArgs = argh::from_env();

    if args.version {
        println!(concat!(env!("CARGO_BIN_NAME"), " ", env!("CARGO_PKG_VERSION")));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load the run declaration
    let cfg_path = match args.config {
        Some(c) => std::path::PathBuf::from(c),
        None => bail!("no run declaration provided"),
    };
    let config: Run = {
        let f = File::open(cfg_path.as_path())
            .with_context(|| format!("opening {}", cfg_path.display()))?;
        serde_json::from_reader(BufReader::new(f)).context("parsing run declaration")?
    };
    if config.boards.is_empty() {
        bail!("run declares no boards");
    }
    for b in &config.boards {
        if b.settings.window_left > b.settings.window_right {
            bail!("board {}: trigger window limits reversed", b.board);
        }
    }
    let input = match args.input {
        Some(i) => i,
        None => bail!("no input file provided"),
    };

    let timestamp = Local::now();
    let started = Instant::now();

    let sink = Arc::new(MemSink::new());
    let mut ctx = RunContext::from_run(&config, sink.clone());

    let reader = ReaderHandle::new(&input, ctx.split_mode(args.chunk_events, args.chunk_bytes))?;
    let save = config
        .save_events
        .is_some()
        .then(|| SaveHandle::new(config.save_events.clone()));

    let mut limit_hit = false;
    'run: for chunk in reader.receiver.iter() {
        // Backpressure: a full queue means the pipeline must advance before
        // this chunk can be delivered. One polling round is the back-off;
        // if that frees nothing the chunk is dropped, observably.
        let mut delivered = false;
        for _ in 0..2 {
            match ctx.add_chunk(&chunk) {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(CoreError::QueueFull { .. }) => {
                    ctx.poll()?;
                    let drained = ctx.drain_events();
                    publish(&save, drained)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !delivered {
            warn!(seq = chunk.seq, "queues full, dropping chunk");
            continue;
        }

        ctx.poll()?;
        let drained = ctx.drain_events();
        publish(&save, drained)?;

        match &config.limit {
            Some(RunLimit::Duration(d)) => {
                if started.elapsed() > *d {
                    limit_hit = true;
                    break 'run;
                }
            }
            Some(RunLimit::EventLimit(n)) => {
                if ctx.events_built() >= *n {
                    limit_hit = true;
                    break 'run;
                }
            }
            None => {}
        }
    }

    if !limit_hit {
        let finished = ctx.finish()?;
        publish(&save, finished)?;
    }

    drop(reader.receiver);
    match reader.join_handle.join() {
        Ok(Ok(bytes)) => info!(bytes, "input consumed"),
        Ok(Err(e)) => warn!("reader: {e:#}"),
        Err(_) => warn!("reader thread panicked"),
    }
    if let Some(s) = save {
        drop(s.sender);
        match s.join_handle.join() {
            Ok(Ok(rows)) => info!(rows, "events saved"),
            Ok(Err(e)) => warn!("save: {e:#}"),
            Err(_) => warn!("save thread panicked"),
        }
    }

    for p in ctx.procs() {
        info!(
            proc = p.name(),
            syncs = p.num_syncs(),
            raw_hits = sink.h1_entries(&format!("{}.RawHits", p.name())),
            "processor summary"
        );
    }
    info!(events = ctx.events_built(), "run complete");

    // Record the run next to its declaration
    let record = Run {
        timestamp: Some(timestamp),
        events_built: Some(ctx.events_built()),
        ..config
    };
    let mut rcd_path = cfg_path.clone();
    let mut stem = cfg_path
        .file_stem()
        .unwrap_or_else(|| std::ffi::OsStr::new("run"))
        .to_string_lossy()
        .to_string();
    stem.push('_');
    stem.push_str(&timestamp.format("%F_%H-%M-%S").to_string());
    rcd_path.set_file_name(stem);
    rcd_path.set_extension("json");
    let f = File::create(&rcd_path)
        .with_context(|| format!("recording run to {}", rcd_path.display()))?;
    let mut wtr = BufWriter::new(f);
    wtr.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;

    Ok(())
}

fn publish(save: &Option<SaveHandle>, events: Vec<hldtools::event::Event>) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    if let Some(s) = save {
        let _ = s.sender.send(SaveMessage::Save(events));
    }
    Ok(())
}
