// Real-time acquisition and NDJSON streaming
//
// Architecture:
// - `source`: Trait-based sample sources (synthetic board, scripted source for tests)
// - `filter`: Optional notch / band-pass stages applied to each batch
// - `window`: Fixed-capacity sliding window with chronological snapshots
// - `acquisition`: Pull loop that owns the window, with retry and stop handling
// - `framer`: Newline-delimited JSON message framing
// - `server`: Multi-client TCP server (fan-out publish, inbound triggers)
// - `relay`: Fixed-cadence bridge from acquisition batches to the server
// - `client`: TCP client driven by the connection state machine
// - `correlator`: Trigger markers tied to the window timeline
// - `types`: Errors, connection state and status events

pub mod acquisition;
pub mod client;
pub mod correlator;
pub mod filter;
pub mod framer;
pub mod relay;
pub mod server;
pub mod source;
pub mod types;
pub mod window;

pub use acquisition::{
    AcquiredBatch, AcquisitionHandle, AcquisitionLoop, AcquisitionStatus, RetryPolicy,
};
pub use client::{ClientConfig, StreamingClient};
pub use correlator::{Epoch, EpochData, Marker, MarkerCorrelator, MarkerEvent, TimeBase};
pub use filter::{BiquadFilter, FilterChain, FilterSpec, Transform};
pub use framer::{Message, MessageFramer};
pub use relay::{RelayFeed, SampleRelay};
pub use server::{ConnectionInfo, InboundMessage, ServerConfig, StreamingServer};
pub use source::{create_source, Sample, SampleBatch, SampleSource, SessionInfo, SourceConfig};
pub use types::{Connection, ConnectionState, StatusEvent, StreamError, StreamResult};
pub use window::{SlidingWindowBuffer, WindowReader, WindowSnapshot, WindowWriter};
