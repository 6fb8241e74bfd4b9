use crate::cli::TriggerArgs;
use crate::commands;
use ddalab_stream::streaming::client::{ClientConfig, StreamingClient};
use ddalab_stream::streaming::framer::Message;
use ddalab_stream::streaming::types::{ConnectionState, StreamError};
use std::time::Duration;

pub async fn execute(args: TriggerArgs) -> i32 {
    commands::finish(run(args).await)
}

async fn run(args: TriggerArgs) -> anyhow::Result<()> {
    let timeout = Duration::from_secs_f64(args.timeout.max(0.001));
    let client = StreamingClient::new(ClientConfig {
        host: args.endpoint.host(),
        port: args.endpoint.port(),
        connect_timeout: timeout,
        reconnect: false,
        ..ClientConfig::default()
    });
    // Data sent by the server is not needed here
    drop(client.take_messages());
    client.start()?;

    let state = client
        .wait_for_state(
            |s| s.is_active() || s == ConnectionState::Failed,
            timeout + Duration::from_secs(1),
        )
        .await?;
    if state == ConnectionState::Failed {
        let detail = client
            .connection()
            .last_error
            .unwrap_or_else(|| "connection failed".to_string());
        client.stop().await;
        return Err(StreamError::Connection(detail).into());
    }

    let mut outcome = Ok(());
    for (i, id) in args.ids.iter().enumerate() {
        if i > 0 && args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
        if let Err(e) = client.send(Message::trigger(id.as_str())).await {
            outcome = Err(e.into());
            break;
        }
        println!("Sent trigger '{}'", id);
    }

    // Queued triggers are written before the socket closes
    client.stop().await;
    outcome
}
