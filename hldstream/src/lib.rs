pub mod coordinator;
pub mod ctx;
pub mod reader;
pub mod save;

use std::sync::Arc;

use argh::FromArgs;

#[derive(Debug, FromArgs, Clone)]
/// Correlates raw board streams into time-windowed events
pub struct CliArgs {
    /// print version information
    #[argh(switch, short = 'v')]
    pub version: bool,
    /// run declaration file (JSON)
    #[argh(option, short = 'c')]
    pub config: Option<String>,
    /// raw input file, plain or zstd-compressed
    #[argh(positional)]
    pub input: Option<String>,
    /// events per reader chunk for framed input
    #[argh(option, default = "64")]
    pub chunk_events: usize,
    /// bytes per reader chunk for word-stream input
    #[argh(option, default = "4096")]
    pub chunk_bytes: usize,
}

/// One chunk of raw input on its way to the processors
pub struct Chunk {
    pub seq: u32,
    pub bytes: Arc<[u8]>,
}
