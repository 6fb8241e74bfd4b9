use crate::cli::ServeArgs;
use crate::commands;
use anyhow::{anyhow, Context};
use ddalab_stream::config::StreamConfig;
use ddalab_stream::streaming::acquisition::{AcquisitionLoop, AcquisitionStatus};
use ddalab_stream::streaming::correlator::{Epoch, MarkerCorrelator, MarkerEvent, TimeBase};
use ddalab_stream::streaming::filter::{FilterChain, FilterSpec, Transform};
use ddalab_stream::streaming::relay::{RelayFeed, SampleRelay};
use ddalab_stream::streaming::server::{ServerConfig, StreamingServer};
use ddalab_stream::streaming::source::SyntheticSource;
use ddalab_stream::streaming::types::StreamError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const NOTCH_QUALITY: f64 = 30.0;
const EPOCH_CHECK_INTERVAL: Duration = Duration::from_millis(500);

pub async fn execute(args: ServeArgs) -> i32 {
    commands::finish(run(args).await)
}

fn build_config(args: &ServeArgs) -> anyhow::Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config file {}", path))?
        }
        None => StreamConfig::default(),
    };

    if let Some(host) = &args.endpoint.host {
        config.host = host.clone();
    }
    if let Some(port) = args.endpoint.port {
        config.port = port;
    }
    if let Some(channels) = args.channels {
        config.num_channels = channels;
    }
    if let Some(rate) = args.rate {
        config.sampling_rate = rate;
    }
    if let Some(seconds) = args.window_seconds {
        config.window_seconds = seconds;
    }
    if let Some(margin) = args.guard_margin {
        config.guard_margin = margin;
    }
    if let Some(cadence) = args.batches_per_second {
        config.batches_per_second = cadence;
    }

    config.validate()?;
    Ok(config)
}

fn filter_specs(args: &ServeArgs) -> Vec<FilterSpec> {
    let mut specs = Vec::new();
    if let Some(frequency) = args.notch {
        specs.push(FilterSpec::Notch {
            frequency,
            quality: NOTCH_QUALITY,
        });
    }
    if let Some([low, high]) = args.bandpass.as_deref() {
        specs.push(FilterSpec::BandPass {
            low: *low,
            high: *high,
        });
    }
    specs
}

async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;

    let mut source = SyntheticSource::new(config.num_channels, config.sampling_rate);
    if let Some(seed) = args.seed {
        source = source.with_seed(seed);
    }

    let mut acquisition = AcquisitionLoop::new(Box::new(source), &config)?;
    let specs = filter_specs(&args);
    if !specs.is_empty() {
        let chain = FilterChain::from_specs(&specs, config.sampling_rate)?;
        log::info!("Filter chain: {}", chain.name());
        acquisition = acquisition.with_filter(chain);
    }

    let correlator = Arc::new(MarkerCorrelator::new(TimeBase::Window(
        acquisition.raw_window(),
    )));
    let acquisition = acquisition.with_correlator(Arc::clone(&correlator));
    let batches = acquisition.subscribe_batches();
    let mut status = acquisition.subscribe_status();
    let mut markers = correlator.subscribe();

    let server = Arc::new(
        StreamingServer::bind(ServerConfig::from(&config), Some(Arc::clone(&correlator)))
            .await
            .context("Failed to start streaming server")?,
    );
    println!(
        "Streaming {} channels @ {} Hz on {}",
        config.num_channels,
        config.sampling_rate,
        server.local_addr()
    );

    let handle = acquisition.spawn();
    let feed = if args.publish_filtered {
        RelayFeed::Filtered
    } else {
        RelayFeed::Raw
    };
    let relay = SampleRelay::spawn(
        Arc::clone(&server),
        batches,
        config.relay_interval(),
        feed,
    );

    let window = handle.raw_window();
    let mut pending_epochs: Vec<Epoch> = Vec::new();
    let mut epoch_check = tokio::time::interval(EPOCH_CHECK_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    log::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                log::info!("Shutting down");
                break Ok(());
            }

            received = status.recv() => match received {
                Ok(AcquisitionStatus::SessionFailed { error }) => {
                    break Err(anyhow!(StreamError::SessionFailed(error)));
                }
                Ok(AcquisitionStatus::Retrying { attempt, error, delay_ms }) => {
                    eprintln!(
                        "Board not ready (attempt {}): {}; retrying in {} ms",
                        attempt, error, delay_ms
                    );
                }
                Ok(other) => log::info!("Acquisition status: {:?}", other),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Ok(()),
            },

            event = markers.recv() => match event {
                Ok(MarkerEvent::Added(marker)) => {
                    println!("Marker '{}' at {:.3}", marker.id, marker.created_at);
                    if let Ok(value) = marker.id.parse::<f64>() {
                        if let Err(e) = handle.insert_marker(value) {
                            log::warn!("Failed to insert marker into the board stream: {}", e);
                        }
                    }
                    pending_epochs.push(Epoch::new(marker, args.epoch_pre, args.epoch_post));
                }
                Ok(MarkerEvent::Evicted(marker)) => {
                    log::debug!("Marker '{}' left the window", marker.id);
                    pending_epochs.retain(|epoch| {
                        epoch.marker.id != marker.id || epoch.marker.created_at != marker.created_at
                    });
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Missed {} marker events", skipped);
                }
                Err(RecvError::Closed) => break Ok(()),
            },

            _ = epoch_check.tick() => {
                if pending_epochs.is_empty() {
                    continue;
                }
                let snapshot = window.snapshot();
                pending_epochs.retain(|epoch| {
                    if !epoch.is_complete(&snapshot) {
                        return true;
                    }
                    if let Some(data) = epoch.extract(&snapshot) {
                        println!(
                            "Epoch '{}': {} samples in [{:.3}, {:.3}]",
                            epoch.marker.id,
                            data.timestamps.len(),
                            epoch.start(),
                            epoch.end()
                        );
                    }
                    false
                });
            }
        }
    };

    relay.stop().await;
    server.stop().await;
    handle.stop().await;

    log::info!(
        "Published {} messages, {} markers received, {} evicted",
        relay.published(),
        correlator.received_count(),
        correlator.evicted_count()
    );

    outcome
}
