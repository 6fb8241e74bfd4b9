// Pluggable sample sources for acquisition
//
// A `SampleSource` is the capability the acquisition loop pulls from. It owns
// one hardware (or simulated) session: `open` prepares and starts it,
// `release` tears it down. The loop holds the source exclusively, so there is
// no global session state.
//
// Current implementations:
// - Synthetic: generated multi-channel signal, paced by the wall clock
// - Manual: deterministic in-memory playback for tests and replays

mod manual;
mod synthetic;

use crate::streaming::types::StreamResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use manual::{ManualCounters, ManualSource, ManualStep};
pub use synthetic::SyntheticSource;

/// One timestamped reading across all channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Per-channel readings, ordered by channel index
    pub values: Vec<f64>,
    /// Monotonic acquisition time in seconds
    pub timestamp: f64,
}

impl Sample {
    pub fn new(values: Vec<f64>, timestamp: f64) -> Self {
        Self { values, timestamp }
    }
}

/// Unit of transfer between the acquisition loop, the window and the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub num_channels: usize,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    pub fn new(num_channels: usize, samples: Vec<Sample>) -> Self {
        Self {
            num_channels,
            samples,
        }
    }

    pub fn empty(num_channels: usize) -> Self {
        Self::new(num_channels, Vec::new())
    }

    /// Number of samples in this batch
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<f64> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.samples.last().map(|s| s.timestamp)
    }
}

/// Description of an opened session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Board / device description
    pub board: String,
    pub num_channels: usize,
    pub sampling_rate: f64,
}

/// Source selection, as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// Generated signal (no hardware required)
    #[serde(rename = "synthetic")]
    Synthetic {
        num_channels: usize,
        sampling_rate: f64,
        /// Number of initial `open` attempts that fail
        #[serde(default)]
        fail_first_opens: u32,
        #[serde(default)]
        seed: Option<u64>,
    },
}

/// Capability yielding batches of multi-channel samples
#[async_trait]
pub trait SampleSource: Send {
    /// Prepare and start the session. May fail transiently.
    async fn open(&mut self) -> StreamResult<SessionInfo>;

    /// Pull whatever arrived, waiting at most `max_wait`.
    ///
    /// `Ok(None)` means nothing was available in time. An error after a
    /// successful `open` means the session itself failed.
    async fn next_batch(&mut self, max_wait: Duration) -> StreamResult<Option<SampleBatch>>;

    /// Embed a numeric marker into the device stream, if the device supports it
    async fn insert_marker(&mut self, _value: f64) -> StreamResult<()> {
        Ok(())
    }

    /// Stop the stream and release the session. Safe to call repeatedly.
    async fn release(&mut self) -> StreamResult<()>;

    fn is_open(&self) -> bool;
}

/// Build a source from configuration
pub fn create_source(config: SourceConfig) -> Box<dyn SampleSource> {
    match config {
        SourceConfig::Synthetic {
            num_channels,
            sampling_rate,
            fail_first_opens,
            seed,
        } => {
            let mut source = SyntheticSource::new(num_channels, sampling_rate)
                .with_failed_opens(fail_first_opens);
            if let Some(seed) = seed {
                source = source.with_seed(seed);
            }
            Box::new(source)
        }
    }
}
