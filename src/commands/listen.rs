use crate::cli::ListenArgs;
use crate::commands;
use anyhow::Context;
use ddalab_stream::streaming::client::{ClientConfig, StreamingClient};
use ddalab_stream::streaming::framer::Message;
use ddalab_stream::streaming::types::ConnectionState;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

pub async fn execute(args: ListenArgs) -> i32 {
    commands::finish(run(args).await)
}

fn describe(message: &Message) -> String {
    match message {
        Message::Trigger { trigger_id } => format!("trigger {}", trigger_id),
        Message::Samples { timestamp, eeg, .. } => {
            let preview: Vec<String> = eeg.iter().take(4).map(|v| format!("{:.2}", v)).collect();
            let more = if eeg.len() > 4 { ", ..." } else { "" };
            format!("{:.3} [{}{}]", timestamp, preview.join(", "), more)
        }
        Message::Other(object) => format!("other ({} keys)", object.len()),
    }
}

async fn run(args: ListenArgs) -> anyhow::Result<()> {
    let config = ClientConfig {
        host: args.endpoint.host(),
        port: args.endpoint.port(),
        connect_timeout: Duration::from_secs_f64(args.timeout.max(0.001)),
        reconnect: args.reconnect,
        ..ClientConfig::default()
    };

    let client = StreamingClient::new(config);
    let mut messages = client
        .take_messages()
        .context("Message receiver already taken")?;
    let mut status = client.subscribe_status();
    client.start()?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut received: u64 = 0;

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),

            event = status.recv() => match event {
                Ok(event) => {
                    match &event.detail {
                        Some(detail) => eprintln!("[{}] {} ({})", event.endpoint, event.state, detail),
                        None => eprintln!("[{}] {}", event.endpoint, event.state),
                    }
                    if event.state == ConnectionState::Failed && !args.reconnect {
                        let detail = event.detail.unwrap_or_else(|| "connection failed".to_string());
                        break Err(anyhow::Error::new(
                            ddalab_stream::StreamError::Connection(detail),
                        ));
                    }
                    if event.state == ConnectionState::Disconnected && !args.reconnect {
                        break Ok(());
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Ok(()),
            },

            message = messages.recv() => {
                let Some(message) = message else {
                    break Ok(());
                };
                if args.json {
                    println!("{}", serde_json::to_string(&message)?);
                } else {
                    println!("{}", describe(&message));
                }
                received += 1;
                if args.count.is_some_and(|limit| received >= limit) {
                    break Ok(());
                }
            }
        }
    };

    client.stop().await;
    log::info!(
        "Received {} messages ({} malformed lines)",
        received,
        client.malformed_count()
    );
    outcome
}
