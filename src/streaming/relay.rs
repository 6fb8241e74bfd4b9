// Fixed-cadence publisher between the acquisition loop and the server
//
// Batches arrive whenever the source delivers them. The relay buffers their
// samples and, on every tick, publishes one data message per sample in
// acquisition order.

use crate::streaming::acquisition::AcquiredBatch;
use crate::streaming::framer::Message;
use crate::streaming::server::StreamingServer;
use crate::streaming::source::Sample;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Which window of each batch gets published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayFeed {
    #[default]
    Raw,
    /// Falls back to raw for batches without a filtered copy
    Filtered,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub published: AtomicU64,
    pub lagged: AtomicU64,
}

pub struct SampleRelay {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RelayStats>,
}

impl SampleRelay {
    pub fn spawn(
        server: Arc<StreamingServer>,
        batches: broadcast::Receiver<AcquiredBatch>,
        interval: Duration,
        feed: RelayFeed,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stats = Arc::new(RelayStats::default());
        let task = tokio::spawn(run_relay(
            server,
            batches,
            interval,
            feed,
            cancel.clone(),
            Arc::clone(&stats),
        ));

        Self {
            cancel,
            task: Mutex::new(Some(task)),
            stats,
        }
    }

    pub fn published(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }

    /// Batches skipped because the relay fell behind the acquisition loop
    pub fn lagged(&self) -> u64 {
        self.stats.lagged.load(Ordering::Relaxed)
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Relay task join error: {}", e);
            }
        }
    }
}

impl Drop for SampleRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_relay(
    server: Arc<StreamingServer>,
    mut batches: broadcast::Receiver<AcquiredBatch>,
    interval: Duration,
    feed: RelayFeed,
    cancel: CancellationToken,
    stats: Arc<RelayStats>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pending: Vec<Sample> = Vec::new();

    log::debug!("Relay publishing every {:?}", interval);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => flush(&server, &mut pending, &stats),

            received = batches.recv() => match received {
                Ok(batch) => {
                    let selected = match (feed, batch.filtered) {
                        (RelayFeed::Filtered, Some(filtered)) => filtered,
                        _ => batch.raw,
                    };
                    pending.extend(selected.samples);
                }
                Err(RecvError::Lagged(skipped)) => {
                    stats.lagged.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!("Relay lagged behind acquisition, skipped {} batches", skipped);
                }
                Err(RecvError::Closed) => {
                    flush(&server, &mut pending, &stats);
                    log::debug!("Acquisition closed, relay exiting");
                    break;
                }
            },
        }
    }
}

fn flush(server: &StreamingServer, pending: &mut Vec<Sample>, stats: &RelayStats) {
    for sample in pending.drain(..) {
        server.publish(&Message::from_sample(&sample));
        stats.published.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::server::ServerConfig;
    use crate::streaming::source::SampleBatch;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpStream;

    fn batch(start: usize, n: usize) -> AcquiredBatch {
        let samples = (start..start + n)
            .map(|i| Sample::new(vec![i as f64], i as f64 / 10.0))
            .collect();
        AcquiredBatch {
            raw: SampleBatch::new(1, samples),
            filtered: None,
        }
    }

    #[tokio::test]
    async fn test_relay_publishes_one_message_per_sample_in_order() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            outbound_queue_capacity: 256,
        };
        let server = Arc::new(StreamingServer::bind(config, None).await.unwrap());
        let client = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connection_count() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (tx, rx) = broadcast::channel(16);
        let relay = SampleRelay::spawn(
            Arc::clone(&server),
            rx,
            Duration::from_millis(10),
            RelayFeed::Raw,
        );
        tx.send(batch(0, 3)).unwrap();
        tx.send(batch(3, 2)).unwrap();

        let mut lines = BufReader::new(client).lines();
        for i in 0..5 {
            let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let message: Message = serde_json::from_str(&line).unwrap();
            match message {
                Message::Samples { eeg, .. } => assert_eq!(eeg, vec![i as f64]),
                other => panic!("unexpected message {:?}", other),
            }
        }

        relay.stop().await;
        assert_eq!(relay.published(), 5);
        server.stop().await;
    }
}
