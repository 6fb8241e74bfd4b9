// In-memory source for deterministic playback
//
// Plays back a scripted sequence of pulls. Useful for tests and for replaying
// captured batches through the acquisition loop.

use super::{SampleBatch, SampleSource, SessionInfo};
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted pull result
#[derive(Debug, Clone)]
pub enum ManualStep {
    Batch(SampleBatch),
    /// Nothing arrives within the wait
    Idle,
    /// The session breaks
    Fail(String),
}

/// Observable counters, shared with the test that scripted the source
#[derive(Debug, Default)]
pub struct ManualCounters {
    pub open_attempts: AtomicUsize,
    pub releases: AtomicUsize,
    pub open: AtomicBool,
    pub markers: Mutex<Vec<f64>>,
}

pub struct ManualSource {
    num_channels: usize,
    sampling_rate: f64,
    fail_first_opens: usize,
    steps: VecDeque<ManualStep>,
    counters: Arc<ManualCounters>,
}

impl ManualSource {
    pub fn new(num_channels: usize, sampling_rate: f64) -> Self {
        Self {
            num_channels,
            sampling_rate,
            fail_first_opens: 0,
            steps: VecDeque::new(),
            counters: Arc::new(ManualCounters::default()),
        }
    }

    pub fn with_batches(mut self, batches: impl IntoIterator<Item = SampleBatch>) -> Self {
        self.steps.extend(batches.into_iter().map(ManualStep::Batch));
        self
    }

    pub fn with_step(mut self, step: ManualStep) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn with_failed_opens(mut self, n: usize) -> Self {
        self.fail_first_opens = n;
        self
    }

    pub fn counters(&self) -> Arc<ManualCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl SampleSource for ManualSource {
    async fn open(&mut self) -> StreamResult<SessionInfo> {
        let attempt = self.counters.open_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first_opens {
            return Err(StreamError::Source(format!("open attempt {} refused", attempt)));
        }
        self.counters.open.store(true, Ordering::SeqCst);
        Ok(SessionInfo {
            board: "manual".to_string(),
            num_channels: self.num_channels,
            sampling_rate: self.sampling_rate,
        })
    }

    async fn next_batch(&mut self, max_wait: Duration) -> StreamResult<Option<SampleBatch>> {
        if !self.counters.open.load(Ordering::SeqCst) {
            return Err(StreamError::SessionFailed("session not open".to_string()));
        }

        match self.steps.pop_front() {
            Some(ManualStep::Batch(batch)) => Ok(Some(batch)),
            Some(ManualStep::Fail(reason)) => Err(StreamError::Source(reason)),
            Some(ManualStep::Idle) | None => {
                // Script exhausted: behave like a quiet device
                tokio::time::sleep(max_wait).await;
                Ok(None)
            }
        }
    }

    async fn insert_marker(&mut self, value: f64) -> StreamResult<()> {
        self.counters.markers.lock().push(value);
        Ok(())
    }

    async fn release(&mut self) -> StreamResult<()> {
        if self.counters.open.swap(false, Ordering::SeqCst) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.counters.open.load(Ordering::SeqCst)
    }
}
