// Real-time filtering of acquired batches
//
// Filters are a capability of their own, composed by the caller and handed to
// the acquisition loop. Each stage keeps per-channel state so consecutive
// batches filter as one continuous signal.

use crate::streaming::source::{Sample, SampleBatch};
use crate::streaming::types::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Batch-to-batch signal transform
pub trait Transform: Send {
    fn apply(&mut self, batch: &SampleBatch) -> SampleBatch;

    /// Forget filter history (e.g. after a session restart)
    fn reset(&mut self);

    fn name(&self) -> String;
}

/// Filter selection, as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    /// Remove a narrow band around `frequency` (mains hum)
    Notch { frequency: f64, quality: f64 },
    /// Keep `[low, high]` Hz
    BandPass { low: f64, high: f64 },
}

#[derive(Debug, Clone, Copy)]
struct Coefficients {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct History {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

/// Second-order IIR section (RBJ audio-EQ cookbook coefficients)
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    spec: FilterSpec,
    coefficients: Coefficients,
    history: Vec<History>,
}

impl BiquadFilter {
    pub fn new(spec: FilterSpec, sampling_rate: f64) -> StreamResult<Self> {
        let nyquist = sampling_rate / 2.0;
        let (center, quality) = match spec {
            FilterSpec::Notch { frequency, quality } => (frequency, quality),
            FilterSpec::BandPass { low, high } => {
                if !(low > 0.0 && high > low) {
                    return Err(StreamError::InvalidConfig(format!(
                        "band-pass needs 0 < low < high, got [{}, {}]",
                        low, high
                    )));
                }
                let center = (low * high).sqrt();
                (center, center / (high - low))
            }
        };

        if !(center > 0.0 && center < nyquist) {
            return Err(StreamError::InvalidConfig(format!(
                "filter frequency {} Hz outside (0, {}) Hz",
                center, nyquist
            )));
        }
        if !(quality > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "filter quality must be positive, got {}",
                quality
            )));
        }

        let w0 = 2.0 * PI * center / sampling_rate;
        let alpha = w0.sin() / (2.0 * quality);
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;

        let (b0, b1, b2) = match spec {
            FilterSpec::Notch { .. } => (1.0, -2.0 * cos_w0, 1.0),
            FilterSpec::BandPass { .. } => (alpha, 0.0, -alpha),
        };

        Ok(Self {
            spec,
            coefficients: Coefficients {
                b0: b0 / a0,
                b1: b1 / a0,
                b2: b2 / a0,
                a1: -2.0 * cos_w0 / a0,
                a2: (1.0 - alpha) / a0,
            },
            history: Vec::new(),
        })
    }

    fn step(&mut self, channel: usize, x: f64) -> f64 {
        let c = self.coefficients;
        let h = &mut self.history[channel];
        let y = c.b0 * x + c.b1 * h.x1 + c.b2 * h.x2 - c.a1 * h.y1 - c.a2 * h.y2;
        h.x2 = h.x1;
        h.x1 = x;
        h.y2 = h.y1;
        h.y1 = y;
        y
    }
}

impl Transform for BiquadFilter {
    fn apply(&mut self, batch: &SampleBatch) -> SampleBatch {
        if self.history.len() != batch.num_channels {
            self.history = vec![History::default(); batch.num_channels];
        }

        let samples = batch
            .samples
            .iter()
            .map(|sample| {
                let values = sample
                    .values
                    .iter()
                    .enumerate()
                    .map(|(channel, &x)| self.step(channel, x))
                    .collect();
                Sample::new(values, sample.timestamp)
            })
            .collect();

        SampleBatch::new(batch.num_channels, samples)
    }

    fn reset(&mut self) {
        self.history.iter_mut().for_each(|h| *h = History::default());
    }

    fn name(&self) -> String {
        match self.spec {
            FilterSpec::Notch { frequency, .. } => format!("notch({} Hz)", frequency),
            FilterSpec::BandPass { low, high } => format!("bandpass({}-{} Hz)", low, high),
        }
    }
}

/// Ordered sequence of transforms applied one after another
#[derive(Default)]
pub struct FilterChain {
    stages: Vec<Box<dyn Transform>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build biquad stages for every spec, in order
    pub fn from_specs(specs: &[FilterSpec], sampling_rate: f64) -> StreamResult<Self> {
        let mut chain = Self::new();
        for spec in specs {
            chain = chain.with(BiquadFilter::new(*spec, sampling_rate)?);
        }
        Ok(chain)
    }

    pub fn with(mut self, stage: impl Transform + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }
}

impl Transform for FilterChain {
    fn apply(&mut self, batch: &SampleBatch) -> SampleBatch {
        let mut current = batch.clone();
        for stage in &mut self.stages {
            current = stage.apply(&current);
        }
        current
    }

    fn reset(&mut self) {
        self.stages.iter_mut().for_each(|s| s.reset());
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.stages.iter().map(|s| s.name()).collect();
        names.join(" -> ")
    }
}
