// Acquisition loop - pulls from a sample source into the sliding window
//
// The loop:
// - opens the source session, retrying with back-off until it succeeds
// - pulls batches with a bounded wait, filters them, and pushes them into
//   the raw (and optionally filtered) window
// - reconciles the marker correlator whenever the window advances
// - publishes every batch to subscribers
// - treats a pull failure after the session is up as fatal for the session
//
// It is the only writer of the windows. Every wait is raced against a
// CancellationToken so `stop()` returns within one poll interval, after the
// session has been released.

use crate::config::StreamConfig;
use crate::streaming::correlator::MarkerCorrelator;
use crate::streaming::filter::{FilterChain, Transform};
use crate::streaming::source::{SampleBatch, SampleSource, SessionInfo};
use crate::streaming::types::{StreamError, StreamResult};
use crate::streaming::window::{SlidingWindowBuffer, WindowReader, WindowWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BATCH_CHANNEL_CAPACITY: usize = 256;
const STATUS_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of an acquisition session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum AcquisitionStatus {
    Idle,
    Connecting {
        attempt: u32,
    },
    /// Opening the session failed; another attempt follows after `delay_ms`
    Retrying {
        attempt: u32,
        error: String,
        delay_ms: u64,
    },
    Running {
        session: SessionInfo,
    },
    /// The established session broke; acquisition has ended
    SessionFailed {
        error: String,
    },
    Stopped,
}

impl AcquisitionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AcquisitionStatus::SessionFailed { .. } | AcquisitionStatus::Stopped
        )
    }
}

/// Delay schedule for session open attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth per failed attempt; 1.0 gives a fixed delay
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            factor: 1.0,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms.max(config.retry_delay_ms)),
            factor: 2.0,
        }
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// A pulled batch as published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredBatch {
    pub raw: SampleBatch,
    /// Present when a filter chain is configured
    pub filtered: Option<SampleBatch>,
}

#[derive(Debug, Default)]
pub struct AcquisitionStats {
    pub open_attempts: AtomicU64,
    pub batches: AtomicU64,
    pub samples: AtomicU64,
}

enum Command {
    InsertMarker(f64),
}

/// Channels shared by the loop and its handle
#[derive(Clone)]
struct Outlets {
    batches: broadcast::Sender<AcquiredBatch>,
    status_events: broadcast::Sender<AcquisitionStatus>,
    status: Arc<watch::Sender<AcquisitionStatus>>,
    stats: Arc<AcquisitionStats>,
}

impl Outlets {
    fn set_status(&self, status: AcquisitionStatus) {
        self.status.send_replace(status.clone());
        let _ = self.status_events.send(status);
    }
}

pub struct AcquisitionLoop {
    source: Box<dyn SampleSource>,
    poll_interval: Duration,
    retry: RetryPolicy,
    filter: Option<FilterChain>,
    correlator: Option<Arc<MarkerCorrelator>>,
    raw: WindowWriter,
    raw_reader: WindowReader,
    filtered: Option<(WindowWriter, WindowReader)>,
    window_config: (usize, usize),
    outlets: Outlets,
}

impl AcquisitionLoop {
    pub fn new(source: Box<dyn SampleSource>, config: &StreamConfig) -> StreamResult<Self> {
        config
            .validate()
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;

        let buffer = SlidingWindowBuffer::with_config(config);
        let window_config = (buffer.num_channels(), buffer.capacity());
        let (raw, raw_reader) = buffer.into_shared();
        let (batches, _) = broadcast::channel(BATCH_CHANNEL_CAPACITY);
        let (status_events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(AcquisitionStatus::Idle);

        Ok(Self {
            source,
            poll_interval: config.poll_interval(),
            retry: RetryPolicy::from_config(config),
            filter: None,
            correlator: None,
            raw,
            raw_reader,
            filtered: None,
            window_config,
            outlets: Outlets {
                batches,
                status_events,
                status: Arc::new(status),
                stats: Arc::new(AcquisitionStats::default()),
            },
        })
    }

    /// Filter every batch and keep a second window with the filtered signal
    pub fn with_filter(mut self, chain: FilterChain) -> Self {
        if !chain.is_empty() {
            let (channels, capacity) = self.window_config;
            self.filtered = Some(SlidingWindowBuffer::new(channels, capacity).into_shared());
            self.filter = Some(chain);
        }
        self
    }

    pub fn with_correlator(mut self, correlator: Arc<MarkerCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn raw_window(&self) -> WindowReader {
        self.raw_reader.clone()
    }

    pub fn subscribe_batches(&self) -> broadcast::Receiver<AcquiredBatch> {
        self.outlets.batches.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<AcquisitionStatus> {
        self.outlets.status_events.subscribe()
    }

    /// Start the loop on the runtime
    pub fn spawn(self) -> AcquisitionHandle {
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let handle_outlets = self.outlets.clone();
        let raw_window = self.raw_reader.clone();
        let filtered_window = self.filtered.as_ref().map(|(_, reader)| reader.clone());

        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token, command_rx).await });

        AcquisitionHandle {
            cancel,
            task: Mutex::new(Some(task)),
            commands: command_tx,
            raw_window,
            filtered_window,
            outlets: handle_outlets,
        }
    }

    async fn run(mut self, cancel: CancellationToken, mut commands: mpsc::Receiver<Command>) {
        let Some(session) = self.open_session(&cancel).await else {
            self.release().await;
            self.outlets.set_status(AcquisitionStatus::Stopped);
            return;
        };

        log::info!(
            "Acquisition running: {} ({} channels @ {} Hz)",
            session.board,
            session.num_channels,
            session.sampling_rate
        );
        self.outlets
            .set_status(AcquisitionStatus::Running { session });

        let outcome = loop {
            while let Ok(command) = commands.try_recv() {
                self.handle_command(command).await;
            }

            let pulled = tokio::select! {
                biased;

                _ = cancel.cancelled() => break None,

                pulled = self.source.next_batch(self.poll_interval) => pulled,
            };

            match pulled {
                Ok(Some(batch)) => self.ingest(batch),
                Ok(None) => {}
                Err(e) => break Some(e),
            }
        };

        self.release().await;

        match outcome {
            None => {
                log::info!("Acquisition stopped");
                self.outlets.set_status(AcquisitionStatus::Stopped);
            }
            Some(e) => {
                // No silent restart: the caller decides whether to start a new session
                log::error!("Acquisition session failed: {}", e);
                self.outlets.set_status(AcquisitionStatus::SessionFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    /// Open attempts until success; `None` when cancelled first
    async fn open_session(&mut self, cancel: &CancellationToken) -> Option<SessionInfo> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            self.outlets.stats.open_attempts.fetch_add(1, Ordering::Relaxed);
            self.outlets
                .set_status(AcquisitionStatus::Connecting { attempt });

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                opened = self.source.open() => opened,
            };

            let error = match opened {
                Ok(session) => return Some(session),
                Err(e) => e,
            };

            let delay = self.retry.delay_for(attempt);
            log::warn!(
                "Session open attempt {} failed: {}. Retrying in {:?}",
                attempt,
                error,
                delay
            );
            self.outlets.set_status(AcquisitionStatus::Retrying {
                attempt,
                error: error.to_string(),
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn ingest(&mut self, batch: SampleBatch) {
        if batch.is_empty() {
            return;
        }

        let filtered = self.filter.as_mut().map(|chain| chain.apply(&batch));

        self.raw.push(&batch);
        if let (Some((writer, _)), Some(filtered)) = (&self.filtered, &filtered) {
            writer.push(filtered);
        }

        if let Some(correlator) = &self.correlator {
            correlator.reconcile(&self.raw_reader.snapshot());
        }

        let stats = &self.outlets.stats;
        stats.batches.fetch_add(1, Ordering::Relaxed);
        stats.samples.fetch_add(batch.len() as u64, Ordering::Relaxed);

        // No subscribers is fine
        let _ = self.outlets.batches.send(AcquiredBatch {
            raw: batch,
            filtered,
        });
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::InsertMarker(value) => {
                if let Err(e) = self.source.insert_marker(value).await {
                    log::warn!("Failed to insert marker {}: {}", value, e);
                }
            }
        }
    }

    async fn release(&mut self) {
        if let Some(chain) = self.filter.as_mut() {
            chain.reset();
        }
        if let Err(e) = self.source.release().await {
            log::error!("Failed to release source session: {}", e);
        }
    }
}

/// Control and observation handle for a spawned acquisition loop
pub struct AcquisitionHandle {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    commands: mpsc::Sender<Command>,
    raw_window: WindowReader,
    filtered_window: Option<WindowReader>,
    outlets: Outlets,
}

impl AcquisitionHandle {
    /// Current status
    pub fn status(&self) -> AcquisitionStatus {
        self.outlets.status.borrow().clone()
    }

    /// Watch the current status
    pub fn watch_status(&self) -> watch::Receiver<AcquisitionStatus> {
        self.outlets.status.subscribe()
    }

    /// Every status transition, including each retry
    pub fn subscribe_status(&self) -> broadcast::Receiver<AcquisitionStatus> {
        self.outlets.status_events.subscribe()
    }

    pub fn subscribe_batches(&self) -> broadcast::Receiver<AcquiredBatch> {
        self.outlets.batches.subscribe()
    }

    pub fn raw_window(&self) -> WindowReader {
        self.raw_window.clone()
    }

    pub fn filtered_window(&self) -> Option<WindowReader> {
        self.filtered_window.clone()
    }

    pub fn stats(&self) -> &AcquisitionStats {
        &self.outlets.stats
    }

    /// Ask the source to embed a marker in its own stream
    pub fn insert_marker(&self, value: f64) -> StreamResult<()> {
        self.commands
            .try_send(Command::InsertMarker(value))
            .map_err(|_| StreamError::ChannelClosed)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop and wait until it has exited and released the session.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Acquisition task join error: {}", e);
            }
        }
    }

    /// Wait for the loop to end on its own (session failure)
    pub async fn wait(&self) {
        let mut status = self.watch_status();
        let _ = status.wait_for(|s| s.is_terminal()).await;
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::correlator::MarkerCorrelator;
    use crate::streaming::filter::{FilterChain, FilterSpec};
    use crate::streaming::source::{ManualSource, ManualStep, Sample};

    fn config(capacity: usize) -> StreamConfig {
        // 1 Hz keeps window_seconds == capacity exactly
        StreamConfig {
            sampling_rate: 1.0,
            num_channels: 1,
            window_seconds: capacity as f64,
            guard_margin: 0,
            poll_interval_ms: 10,
            retry_delay_ms: 5,
            max_retry_delay_ms: 20,
            ..Default::default()
        }
    }

    fn batch(range: std::ops::Range<u32>) -> SampleBatch {
        SampleBatch::new(
            1,
            range
                .map(|i| Sample::new(vec![i as f64], i as f64 / 10.0))
                .collect(),
        )
    }

    async fn wait_for_samples(handle: &AcquisitionHandle, n: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().samples.load(Ordering::Relaxed) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("samples should arrive");
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1000), Duration::from_millis(500));

        let fixed = RetryPolicy::fixed(Duration::from_millis(30));
        assert_eq!(fixed.delay_for(7), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_batches_fill_window_and_publish() {
        let source = ManualSource::new(1, 10.0).with_batches([batch(0..3), batch(3..8)]);
        let acquisition = AcquisitionLoop::new(Box::new(source), &config(5)).unwrap();
        let mut batches = acquisition.subscribe_batches();
        let handle = acquisition.spawn();

        wait_for_samples(&handle, 8).await;

        let first = batches.recv().await.unwrap();
        assert_eq!(first.raw.len(), 3);
        assert!(first.filtered.is_none());

        let snap = handle.raw_window().snapshot();
        assert_eq!(snap.values[0], vec![3.0, 4.0, 5.0, 6.0, 7.0]);

        handle.stop().await;
        assert_eq!(handle.status(), AcquisitionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_open_failures_are_retried_and_reported() {
        let source = ManualSource::new(1, 10.0)
            .with_failed_opens(3)
            .with_batches([batch(0..2)]);
        let counters = source.counters();
        let acquisition = AcquisitionLoop::new(Box::new(source), &config(4))
            .unwrap()
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(5)));
        let mut status = acquisition.subscribe_status();
        let handle = acquisition.spawn();

        wait_for_samples(&handle, 2).await;

        let mut retries = 0;
        while let Ok(event) = status.try_recv() {
            if let AcquisitionStatus::Retrying { attempt, .. } = event {
                retries += 1;
                assert_eq!(attempt, retries);
            }
        }
        assert_eq!(retries, 3);
        assert_eq!(counters.open_attempts.load(Ordering::SeqCst), 4);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_pull_failure_ends_session() {
        let source = ManualSource::new(1, 10.0)
            .with_batches([batch(0..2)])
            .with_step(ManualStep::Fail("usb unplugged".to_string()))
            .with_batches([batch(2..4)]);
        let counters = source.counters();
        let handle = AcquisitionLoop::new(Box::new(source), &config(4))
            .unwrap()
            .spawn();

        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();

        assert!(matches!(
            handle.status(),
            AcquisitionStatus::SessionFailed { ref error } if error.contains("usb unplugged")
        ));
        // Batch after the failure is never read
        assert_eq!(handle.stats().samples.load(Ordering::Relaxed), 2);
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(counters.open_attempts.load(Ordering::SeqCst), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_and_is_idempotent() {
        let source = ManualSource::new(1, 10.0);
        let counters = source.counters();
        let handle = AcquisitionLoop::new(Box::new(source), &config(4))
            .unwrap()
            .spawn();

        let mut watch = handle.watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|s| matches!(s, AcquisitionStatus::Running { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("stop should return promptly");
        assert!(!handle.is_running());
        assert!(!counters.open.load(Ordering::SeqCst));
        assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

        handle.stop().await;
        assert_eq!(handle.status(), AcquisitionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_retry_backoff() {
        let source = ManualSource::new(1, 10.0).with_failed_opens(usize::MAX);
        let handle = AcquisitionLoop::new(Box::new(source), &config(4))
            .unwrap()
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(3600)))
            .spawn();

        let mut watch = handle.watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|s| matches!(s, AcquisitionStatus::Retrying { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("back-off wait must be cancellable");
        assert_eq!(handle.status(), AcquisitionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_correlator_reconciled_on_push() {
        let correlator = Arc::new(MarkerCorrelator::wall_clock());
        correlator.on_trigger_at("early", 0.05);
        correlator.on_trigger_at("late", 0.75);

        // Window of 4: after 0..8 it holds 0.4 ..= 0.7
        let source = ManualSource::new(1, 10.0).with_batches([batch(0..8)]);
        let handle = AcquisitionLoop::new(Box::new(source), &config(4))
            .unwrap()
            .with_correlator(Arc::clone(&correlator))
            .spawn();

        wait_for_samples(&handle, 8).await;
        handle.stop().await;

        let active = correlator.active_markers();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "late");
        assert_eq!(active[0].correlated_index, None);
    }

    #[tokio::test]
    async fn test_filtered_window_tracks_raw() {
        let chain = FilterChain::from_specs(
            &[FilterSpec::Notch {
                frequency: 2.0,
                quality: 1.0,
            }],
            10.0,
        )
        .unwrap();
        let source = ManualSource::new(1, 10.0).with_batches([batch(0..6)]);
        let handle = AcquisitionLoop::new(Box::new(source), &config(4))
            .unwrap()
            .with_filter(chain)
            .spawn();

        wait_for_samples(&handle, 6).await;
        handle.stop().await;

        let raw = handle.raw_window().snapshot();
        let filtered = handle.filtered_window().unwrap().snapshot();
        assert_eq!(raw.timestamps, filtered.timestamps);
        assert_ne!(raw.values, filtered.values);
    }

    #[tokio::test]
    async fn test_insert_marker_reaches_source() {
        let source = ManualSource::new(1, 10.0);
        let counters = source.counters();
        let handle = AcquisitionLoop::new(Box::new(source), &config(4))
            .unwrap()
            .spawn();

        handle.insert_marker(3.0).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while counters.markers.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*counters.markers.lock(), vec![3.0]);

        handle.stop().await;
        assert!(handle.insert_marker(4.0).is_err());
    }
}
