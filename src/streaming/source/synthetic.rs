// Synthetic board
//
// Generates a per-channel sine with additive noise at the configured sampling
// rate. Samples become available as wall-clock time passes, so pulling behaves
// like polling a real device buffer.

use super::{Sample, SampleBatch, SampleSource, SessionInfo};
use crate::streaming::types::{now_secs, StreamError, StreamResult};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on samples handed out per pull
const MAX_SAMPLES_PER_PULL: usize = 4096;

struct Session {
    started: Instant,
    started_wall: f64,
    emitted: u64,
}

pub struct SyntheticSource {
    num_channels: usize,
    sampling_rate: f64,
    amplitude: f64,
    noise: f64,
    fail_first_opens: u32,
    open_attempts: u32,
    rng: StdRng,
    session: Option<Session>,
    markers: Vec<(f64, f64)>,
}

impl SyntheticSource {
    pub fn new(num_channels: usize, sampling_rate: f64) -> Self {
        Self {
            num_channels,
            sampling_rate,
            amplitude: 50.0,
            noise: 5.0,
            fail_first_opens: 0,
            open_attempts: 0,
            rng: StdRng::from_os_rng(),
            session: None,
            markers: Vec::new(),
        }
    }

    /// Make the first `n` calls to `open` fail, as a board that is not plugged in yet
    pub fn with_failed_opens(mut self, n: u32) -> Self {
        self.fail_first_opens = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Markers inserted during the current session, as (timestamp, value)
    pub fn inserted_markers(&self) -> &[(f64, f64)] {
        &self.markers
    }

    fn due_samples(&self, session: &Session) -> u64 {
        let elapsed = session.started.elapsed().as_secs_f64();
        let total = (elapsed * self.sampling_rate).floor() as u64;
        total.saturating_sub(session.emitted)
    }

    fn generate(&mut self, count: usize) -> SampleBatch {
        let Some(session) = self.session.as_mut() else {
            return SampleBatch::empty(self.num_channels);
        };

        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            let t = session.emitted as f64 / self.sampling_rate;
            let values = (0..self.num_channels)
                .map(|ch| {
                    // Alpha-band carrier, shifted per channel
                    let freq = 8.0 + ch as f64;
                    let noise = self.rng.random_range(-1.0..1.0) * self.noise;
                    self.amplitude * (TAU * freq * t).sin() + noise
                })
                .collect();
            samples.push(Sample::new(values, session.started_wall + t));
            session.emitted += 1;
        }

        SampleBatch::new(self.num_channels, samples)
    }
}

#[async_trait]
impl SampleSource for SyntheticSource {
    async fn open(&mut self) -> StreamResult<SessionInfo> {
        if self.session.is_some() {
            return Ok(self.session_info());
        }

        self.open_attempts += 1;
        if self.open_attempts <= self.fail_first_opens {
            return Err(StreamError::Source(format!(
                "synthetic board not ready (attempt {})",
                self.open_attempts
            )));
        }

        self.session = Some(Session {
            started: Instant::now(),
            started_wall: now_secs(),
            emitted: 0,
        });
        self.markers.clear();

        log::info!(
            "Synthetic session started: {} channels @ {} Hz",
            self.num_channels,
            self.sampling_rate
        );

        Ok(self.session_info())
    }

    async fn next_batch(&mut self, max_wait: Duration) -> StreamResult<Option<SampleBatch>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| StreamError::SessionFailed("session not open".to_string()))?;

        let mut due = self.due_samples(session);
        if due == 0 {
            let next_at = Duration::from_secs_f64((session.emitted + 1) as f64 / self.sampling_rate);
            let until_next = next_at.saturating_sub(session.started.elapsed());
            tokio::time::sleep(until_next.min(max_wait)).await;

            let session = self
                .session
                .as_ref()
                .ok_or_else(|| StreamError::SessionFailed("session released".to_string()))?;
            due = self.due_samples(session);
        }

        if due == 0 {
            return Ok(None);
        }

        let count = (due as usize).min(MAX_SAMPLES_PER_PULL);
        Ok(Some(self.generate(count)))
    }

    async fn insert_marker(&mut self, value: f64) -> StreamResult<()> {
        if self.session.is_none() {
            return Err(StreamError::SessionFailed("session not open".to_string()));
        }
        self.markers.push((now_secs(), value));
        log::debug!("Synthetic marker inserted: {}", value);
        Ok(())
    }

    async fn release(&mut self) -> StreamResult<()> {
        if self.session.take().is_some() {
            log::info!("Synthetic session released");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }
}

impl SyntheticSource {
    fn session_info(&self) -> SessionInfo {
        SessionInfo {
            board: "synthetic".to_string(),
            num_channels: self.num_channels,
            sampling_rate: self.sampling_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_retries_until_ready() {
        let mut source = SyntheticSource::new(2, 250.0).with_failed_opens(2);
        assert!(source.open().await.is_err());
        assert!(source.open().await.is_err());
        let info = source.open().await.unwrap();
        assert_eq!(info.num_channels, 2);
        assert!(source.is_open());
    }

    #[tokio::test]
    async fn test_pull_before_open_is_session_error() {
        let mut source = SyntheticSource::new(2, 250.0);
        let result = source.next_batch(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(StreamError::SessionFailed(_))));
    }

    #[tokio::test]
    async fn test_samples_are_timestamp_ordered() {
        let mut source = SyntheticSource::new(3, 1000.0).with_seed(7);
        source.open().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let batch = source
            .next_batch(Duration::from_millis(50))
            .await
            .unwrap()
            .expect("samples should be due");
        assert!(batch.len() > 0);
        assert!(batch.samples.iter().all(|s| s.values.len() == 3));
        assert!(batch
            .samples
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let mut source = SyntheticSource::new(1, 100.0);
        source.open().await.unwrap();
        source.release().await.unwrap();
        source.release().await.unwrap();
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn test_markers_recorded_for_open_session_only() {
        let mut source = SyntheticSource::new(1, 100.0);
        assert!(matches!(
            source.insert_marker(1.0).await,
            Err(StreamError::SessionFailed(_))
        ));

        source.open().await.unwrap();
        source.insert_marker(3.0).await.unwrap();
        let markers = source.inserted_markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].1, 3.0);
        assert!(markers[0].0 > 0.0);

        source.release().await.unwrap();
        source.open().await.unwrap();
        assert!(source.inserted_markers().is_empty());
    }
}
