use clap::{Args, Parser, Subcommand};
use ddalab_stream::config::DEFAULT_PORT;

#[derive(Parser)]
#[command(
    name = "ddalab-stream",
    version,
    about = "Real-time EEG acquisition and NDJSON streaming",
    long_about = "Acquire multi-channel samples into a sliding window, stream them to TCP clients \
                  as newline-delimited JSON and correlate trigger markers sent back by peers."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Acquire from the synthetic board and stream to every connected client
    Serve(ServeArgs),
    /// Connect to a server and print status changes and messages
    Listen(ListenArgs),
    /// Connect to a server and send trigger messages
    Trigger(TriggerArgs),
}

#[derive(Args, Clone)]
pub struct EndpointArgs {
    /// Server host [default: 127.0.0.1]
    #[arg(long)]
    pub host: Option<String>,

    /// Server port [default: 12345]
    #[arg(long)]
    pub port: Option<u16>,
}

impl EndpointArgs {
    pub fn host(&self) -> String {
        self.host.clone().unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,

    /// JSON configuration file; flags given explicitly override it
    #[arg(long)]
    pub config: Option<String>,

    /// Number of channels
    #[arg(long)]
    pub channels: Option<usize>,

    /// Sampling rate in Hz
    #[arg(long)]
    pub rate: Option<f64>,

    /// Visible window in seconds
    #[arg(long)]
    pub window_seconds: Option<f64>,

    /// Samples kept beyond the visible window
    #[arg(long)]
    pub guard_margin: Option<usize>,

    /// Data message cadence
    #[arg(long)]
    pub batches_per_second: Option<f64>,

    /// Notch filter frequency in Hz (e.g. 50 or 60)
    #[arg(long)]
    pub notch: Option<f64>,

    /// Band-pass filter as LOW HIGH in Hz
    #[arg(long, num_args = 2, value_names = ["LOW", "HIGH"])]
    pub bandpass: Option<Vec<f64>>,

    /// Stream the filtered signal instead of the raw one
    #[arg(long)]
    pub publish_filtered: bool,

    /// Seed for the synthetic signal noise
    #[arg(long)]
    pub seed: Option<u64>,

    /// Seconds before each marker in logged epochs
    #[arg(long, default_value_t = 0.5)]
    pub epoch_pre: f64,

    /// Seconds after each marker in logged epochs
    #[arg(long, default_value_t = 1.0)]
    pub epoch_post: f64,
}

#[derive(Args)]
pub struct ListenArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,

    /// Print each message as one JSON line
    #[arg(long)]
    pub json: bool,

    /// Exit after this many messages
    #[arg(long)]
    pub count: Option<u64>,

    /// Reconnect after a failure or disconnect
    #[arg(long)]
    pub reconnect: bool,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 5.0)]
    pub timeout: f64,
}

#[derive(Args)]
pub struct TriggerArgs {
    #[command(flatten)]
    pub endpoint: EndpointArgs,

    /// Trigger IDs to send, in order
    #[arg(required = true, num_args = 1..)]
    pub ids: Vec<String>,

    /// Delay between triggers in milliseconds
    #[arg(long, default_value_t = 0)]
    pub interval_ms: u64,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 5.0)]
    pub timeout: f64,
}
