// Trigger-to-window correlation
//
// Triggers arrive independently of the sample stream. Each one becomes a
// `Marker` stamped on arrival; every time the window advances the correlator
// drops markers whose time has scrolled out of it and re-resolves the window
// index of the rest. Eviction is purely by timestamp, never by count.

use crate::streaming::types::now_secs;
use crate::streaming::window::{WindowReader, WindowSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// A discrete trigger event placed on the sample timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub created_at: f64,
    /// Window index of the first sample at or after `created_at`
    pub correlated_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerEvent {
    Added(Marker),
    Evicted(Marker),
}

/// Clock used to stamp incoming triggers
#[derive(Clone)]
pub enum TimeBase {
    WallClock,
    /// Newest timestamp in the window; falls back to the wall clock while empty
    Window(WindowReader),
}

impl TimeBase {
    fn now(&self) -> f64 {
        match self {
            TimeBase::WallClock => now_secs(),
            TimeBase::Window(reader) => reader.newest_timestamp().unwrap_or_else(now_secs),
        }
    }
}

/// A marker plus the slice of time around it used for event-locked analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub marker: Marker,
    pub pre_seconds: f64,
    pub post_seconds: f64,
}

/// Samples of one epoch cut out of a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochData {
    pub timestamps: Vec<f64>,
    /// values[channel][i]
    pub values: Vec<Vec<f64>>,
}

impl Epoch {
    pub fn new(marker: Marker, pre_seconds: f64, post_seconds: f64) -> Self {
        Self {
            marker,
            pre_seconds,
            post_seconds,
        }
    }

    pub fn start(&self) -> f64 {
        self.marker.created_at - self.pre_seconds
    }

    pub fn end(&self) -> f64 {
        self.marker.created_at + self.post_seconds
    }

    /// Whether the window currently spans the whole epoch
    pub fn is_complete(&self, window: &WindowSnapshot) -> bool {
        match (window.oldest_timestamp(), window.newest_timestamp()) {
            (Some(oldest), Some(newest)) => oldest <= self.start() && newest >= self.end(),
            _ => false,
        }
    }

    /// Cut the epoch's samples out of a window; `None` when none fall inside
    pub fn extract(&self, window: &WindowSnapshot) -> Option<EpochData> {
        let range = window.index_range(self.start(), self.end());
        if range.is_empty() {
            return None;
        }
        Some(EpochData {
            timestamps: window.timestamps[range.clone()].to_vec(),
            values: window
                .values
                .iter()
                .map(|column| column[range.clone()].to_vec())
                .collect(),
        })
    }
}

pub struct MarkerCorrelator {
    markers: Mutex<Vec<Marker>>,
    time_base: TimeBase,
    events: broadcast::Sender<MarkerEvent>,
    total_received: AtomicU64,
    total_evicted: AtomicU64,
}

impl MarkerCorrelator {
    pub fn new(time_base: TimeBase) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            markers: Mutex::new(Vec::new()),
            time_base,
            events,
            total_received: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        }
    }

    pub fn wall_clock() -> Self {
        Self::new(TimeBase::WallClock)
    }

    /// Stamp a trigger with the configured clock and store it
    pub fn on_trigger(&self, trigger_id: &str) -> Marker {
        self.on_trigger_at(trigger_id, self.time_base.now())
    }

    /// Store a trigger with an explicit timestamp
    pub fn on_trigger_at(&self, trigger_id: &str, created_at: f64) -> Marker {
        let marker = Marker {
            id: trigger_id.to_string(),
            created_at,
            correlated_index: None,
        };

        {
            let mut markers = self.markers.lock();
            // Keep chronological order even if stamps arrive out of order
            let pos = markers.partition_point(|m| m.created_at <= created_at);
            markers.insert(pos, marker.clone());
        }

        self.total_received.fetch_add(1, Ordering::Relaxed);
        log::debug!("Marker '{}' at {:.3}", marker.id, marker.created_at);
        let _ = self.events.send(MarkerEvent::Added(marker.clone()));
        marker
    }

    /// Evict markers older than the window's oldest sample and re-index the rest
    pub fn reconcile(&self, window: &WindowSnapshot) {
        let Some(oldest) = window.oldest_timestamp() else {
            return;
        };

        let evicted: Vec<Marker> = {
            let mut markers = self.markers.lock();
            let keep_from = markers.partition_point(|m| m.created_at < oldest);
            let evicted = markers.drain(..keep_from).collect();
            for marker in markers.iter_mut() {
                marker.correlated_index = window.index_at_or_after(marker.created_at);
            }
            evicted
        };

        if evicted.is_empty() {
            return;
        }

        self.total_evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for marker in evicted {
            log::debug!("Marker '{}' scrolled out of the window", marker.id);
            let _ = self.events.send(MarkerEvent::Evicted(marker));
        }
    }

    /// Markers still inside the retained window, oldest first
    pub fn active_markers(&self) -> Vec<Marker> {
        self.markers.lock().clone()
    }

    /// Epoch descriptors for every active marker
    pub fn epochs(&self, pre_seconds: f64, post_seconds: f64) -> Vec<Epoch> {
        self.active_markers()
            .into_iter()
            .map(|m| Epoch::new(m, pre_seconds, post_seconds))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarkerEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }

    pub fn received_count(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn evicted_count(&self) -> u64 {
        self.total_evicted.load(Ordering::Relaxed)
    }
}
