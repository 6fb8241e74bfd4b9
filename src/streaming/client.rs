// NDJSON streaming client
//
// Owns one outbound TCP connection and drives it through the connection
// state machine:
//
//   Disconnected -> Connecting -> Connected -> Streaming -> Disconnected
//                        \-> Failed (-> Connecting when reconnect is on)
//
// Every transition is published as a StatusEvent. Decoded messages are handed
// to the receiver from `take_messages()`; `send()` writes on the same socket.

use crate::config::StreamConfig;
use crate::streaming::framer::{Message, MessageFramer};
use crate::streaming::types::{
    now_secs, Connection, ConnectionState, StatusEvent, StreamError, StreamResult,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const MESSAGE_CHANNEL_CAPACITY: usize = 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const STATUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Re-enter Connecting after a failure or disconnect
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for ClientConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: config.reconnect,
            reconnect_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl ClientConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// State shared between the handle and the connection task
#[derive(Clone)]
struct ClientShared {
    endpoint: String,
    connection: Arc<watch::Sender<Connection>>,
    status: broadcast::Sender<StatusEvent>,
    malformed: Arc<AtomicU64>,
}

impl ClientShared {
    fn state(&self) -> ConnectionState {
        self.connection.borrow().state
    }

    /// Apply a legal transition and announce it; illegal or no-op edges are ignored
    fn transition(&self, next: ConnectionState, detail: Option<String>) -> bool {
        self.apply(next, detail, true)
    }

    /// Caller-initiated stop: announced with a detail, `last_error` untouched
    fn stopped(&self) -> bool {
        self.apply(ConnectionState::Disconnected, Some("stopped".to_string()), false)
    }

    fn apply(&self, next: ConnectionState, detail: Option<String>, record_error: bool) -> bool {
        let mut from = ConnectionState::Disconnected;
        let applied = self.connection.send_if_modified(|connection| {
            if connection.state == next || !connection.state.can_transition_to(next) {
                return false;
            }
            from = connection.state;
            connection.state = next;
            match next {
                ConnectionState::Connected => connection.last_error = None,
                ConnectionState::Failed | ConnectionState::Disconnected if record_error => {
                    if let Some(detail) = &detail {
                        connection.last_error = Some(detail.clone());
                    }
                }
                _ => {}
            }
            true
        });

        if !applied {
            log::debug!("{}: ignoring transition to {}", self.endpoint, next);
            return false;
        }

        match &detail {
            Some(detail) => log::info!("{}: {} -> {} ({})", self.endpoint, from, next, detail),
            None => log::info!("{}: {} -> {}", self.endpoint, from, next),
        }

        let _ = self.status.send(StatusEvent {
            endpoint: self.endpoint.clone(),
            state: next,
            detail,
            timestamp: now_secs(),
        });
        true
    }
}

enum SessionEnd {
    Stopped,
    Closed(String),
}

pub struct StreamingClient {
    config: ClientConfig,
    shared: ClientShared,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<Option<(mpsc::Receiver<Message>, mpsc::Sender<Message>)>>,
    messages: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl StreamingClient {
    pub fn new(config: ClientConfig) -> Self {
        let endpoint = config.endpoint();
        let (connection, _) = watch::channel(Connection::new(endpoint.clone()));
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        Self {
            config,
            shared: ClientShared {
                endpoint,
                connection: Arc::new(connection),
                status,
                malformed: Arc::new(AtomicU64::new(0)),
            },
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            outbound: outbound_tx,
            pending: Mutex::new(Some((outbound_rx, messages_tx))),
            messages: Mutex::new(Some(messages_rx)),
        }
    }

    /// Spawn the connection task. A client starts at most once.
    pub fn start(&self) -> StreamResult<()> {
        let (outbound_rx, messages_tx) = self
            .pending
            .lock()
            .take()
            .ok_or(StreamError::AlreadyRunning)?;

        let task = tokio::spawn(run_client(
            self.config.clone(),
            self.shared.clone(),
            self.cancel.clone(),
            outbound_rx,
            messages_tx,
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Receiver for decoded inbound messages.
    ///
    /// Can be taken once. Until it is taken messages queue up, and reading
    /// from the socket pauses once the queue is full.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.messages.lock().take()
    }

    /// Write a message to the server
    pub async fn send(&self, message: Message) -> StreamResult<()> {
        if !self.shared.state().is_active() {
            return Err(StreamError::NotConnected);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    pub fn connection(&self) -> Connection {
        self.shared.connection.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.status.subscribe()
    }

    pub fn watch_connection(&self) -> watch::Receiver<Connection> {
        self.shared.connection.subscribe()
    }

    /// Wait until the connection reaches a state accepted by `predicate`
    pub async fn wait_for_state<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> StreamResult<ConnectionState>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut connection = self.watch_connection();
        let reached = tokio::time::timeout(timeout, connection.wait_for(|c| predicate(c.state)))
            .await
            .map_err(|_| {
                StreamError::Timeout(format!("{} stayed {}", self.shared.endpoint, self.state()))
            })?
            .map_err(|_| StreamError::ChannelClosed)?;
        Ok(reached.state)
    }

    /// Lines from the server that failed to decode
    pub fn malformed_count(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Close the connection and wait for the task. Safe to call more than once.
    ///
    /// Messages already accepted by `send()` are written before the socket
    /// closes, within the connect timeout.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Client task join error: {}", e);
            }
        }
        self.shared.stopped();
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_client(
    config: ClientConfig,
    shared: ClientShared,
    cancel: CancellationToken,
    mut outbound: mpsc::Receiver<Message>,
    messages: mpsc::Sender<Message>,
) {
    let endpoint = config.endpoint();

    loop {
        shared.transition(ConnectionState::Connecting, None);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            connected = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&endpoint)) => connected,
        };

        match connected {
            Ok(Ok(stream)) => {
                shared.transition(ConnectionState::Connected, None);
                let session = run_session(
                    stream,
                    &shared,
                    &cancel,
                    config.connect_timeout,
                    &mut outbound,
                    &messages,
                );
                match session.await {
                    SessionEnd::Stopped => return,
                    SessionEnd::Closed(reason) => {
                        shared.transition(ConnectionState::Disconnected, Some(reason));
                    }
                }
            }
            Ok(Err(e)) => {
                shared.transition(ConnectionState::Failed, Some(format!("connect failed: {}", e)));
            }
            Err(_) => {
                shared.transition(
                    ConnectionState::Failed,
                    Some(format!("connect timed out after {:?}", config.connect_timeout)),
                );
            }
        }

        if !config.reconnect {
            return;
        }

        log::debug!("{}: reconnecting in {:?}", endpoint, config.reconnect_delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
}

async fn run_session(
    stream: TcpStream,
    shared: &ClientShared,
    cancel: &CancellationToken,
    flush_limit: Duration,
    outbound: &mut mpsc::Receiver<Message>,
    messages: &mpsc::Sender<Message>,
) -> SessionEnd {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        MessageFramer::new().with_counter(Arc::clone(&shared.malformed)),
    );
    let mut writer = FramedWrite::new(write_half, MessageFramer::new());

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                drain_outbound(&mut writer, outbound, Instant::now() + flush_limit).await;
                return SessionEnd::Stopped;
            }

            queued = outbound.recv() => {
                let Some(message) = queued else {
                    return SessionEnd::Stopped;
                };
                let mut deadline = None;
                let written = {
                    let write = writer.send(message);
                    tokio::pin!(write);
                    tokio::select! {
                        biased;
                        written = &mut write => written,
                        _ = cancel.cancelled() => {
                            // Finish the write in progress, then drain the rest
                            let at = Instant::now() + flush_limit;
                            deadline = Some(at);
                            match tokio::time::timeout_at(at, &mut write).await {
                                Ok(written) => written,
                                Err(_) => return SessionEnd::Stopped,
                            }
                        }
                    }
                };
                if let Err(e) = written {
                    return SessionEnd::Closed(format!("write failed: {}", e));
                }
                if let Some(at) = deadline {
                    drain_outbound(&mut writer, outbound, at).await;
                    return SessionEnd::Stopped;
                }
            }

            inbound = reader.next() => match inbound {
                Some(Ok(message)) => {
                    if shared.state() == ConnectionState::Connected {
                        shared.transition(ConnectionState::Streaming, None);
                    }
                    let delivered = tokio::select! {
                        _ = cancel.cancelled() => {
                            drain_outbound(&mut writer, outbound, Instant::now() + flush_limit).await;
                            return SessionEnd::Stopped;
                        }
                        delivered = messages.send(message) => delivered,
                    };
                    if delivered.is_err() {
                        log::trace!("{}: message receiver dropped", shared.endpoint);
                    }
                }
                Some(Err(e)) => return SessionEnd::Closed(format!("connection reset: {}", e)),
                None => return SessionEnd::Closed("closed by peer".to_string()),
            },
        }
    }
}

/// Write every message `send()` already queued and flush, giving up at `deadline`
async fn drain_outbound(
    writer: &mut FramedWrite<OwnedWriteHalf, MessageFramer>,
    outbound: &mut mpsc::Receiver<Message>,
    deadline: Instant,
) {
    let drained = tokio::time::timeout_at(deadline, async {
        let mut written = 0usize;
        while let Ok(message) = outbound.try_recv() {
            writer.feed(message).await?;
            written += 1;
        }
        writer.flush().await?;
        Ok::<usize, StreamError>(written)
    })
    .await;

    match drained {
        Ok(Ok(0)) => {}
        Ok(Ok(written)) => log::debug!("Flushed {} queued messages before closing", written),
        Ok(Err(e)) => log::warn!("Failed to flush queued messages: {}", e),
        Err(_) => log::warn!("Gave up flushing queued messages after the connect timeout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config_for(port: u16) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
            reconnect: false,
            reconnect_delay: Duration::from_millis(20),
        }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_refused_connect_fails_without_retry() {
        let client = StreamingClient::new(config_for(unused_port().await));
        let mut events = client.subscribe_status();
        client.start().unwrap();

        let state = client
            .wait_for_state(|s| s == ConnectionState::Failed, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Failed);
        assert!(client.connection().last_error.unwrap().contains("connect failed"));

        assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connecting);
        let failed = events.recv().await.unwrap();
        assert_eq!(failed.state, ConnectionState::Failed);
        assert!(failed.detail.is_some());

        // No retry without reconnect
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert!(!client.is_running());

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.connection().last_error.unwrap().contains("connect failed"));
    }

    #[tokio::test]
    async fn test_streaming_after_first_valid_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = StreamingClient::new(config_for(port));
        let mut messages = client.take_messages().unwrap();
        client.start().unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        client
            .wait_for_state(|s| s == ConnectionState::Connected, Duration::from_secs(5))
            .await
            .unwrap();

        peer.write_all(b"garbage\n{\"triggerID\":\"a\"}\n").await.unwrap();
        assert_eq!(messages.recv().await.unwrap(), Message::trigger("a"));
        assert_eq!(client.state(), ConnectionState::Streaming);
        assert_eq!(client.malformed_count(), 1);

        drop(peer);
        client
            .wait_for_state(|s| s == ConnectionState::Disconnected, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.connection().last_error.as_deref(), Some("closed by peer"));

        client.stop().await;
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = StreamingClient::new(config_for(unused_port().await));
        assert!(matches!(
            client.send(Message::trigger("x")).await,
            Err(StreamError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let client = StreamingClient::new(config_for(unused_port().await));
        client.start().unwrap();
        assert!(matches!(client.start(), Err(StreamError::AlreadyRunning)));
        client.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_reenters_connecting() {
        let port = unused_port().await;
        let client = StreamingClient::new(ClientConfig {
            reconnect: true,
            ..config_for(port)
        });
        let mut events = client.subscribe_status();
        client.start().unwrap();

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(accepted.is_ok());

        client
            .wait_for_state(|s| s == ConnectionState::Connected, Duration::from_secs(5))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.state);
        }
        assert_eq!(seen.first(), Some(&ConnectionState::Connecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Connected));

        client.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_writes_queued_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = StreamingClient::new(config_for(port));
        client.start().unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        client
            .wait_for_state(|s| s.is_active(), Duration::from_secs(5))
            .await
            .unwrap();

        for i in 0..20 {
            client.send(Message::trigger(i.to_string())).await.unwrap();
        }
        client.stop().await;

        let mut lines = tokio::io::BufReader::new(peer).lines();
        let mut received = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            received.push(serde_json::from_str::<Message>(&line).unwrap());
        }
        let expected: Vec<Message> = (0..20).map(|i| Message::trigger(i.to_string())).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_stop_is_not_recorded_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = StreamingClient::new(config_for(port));
        let mut events = client.subscribe_status();
        client.start().unwrap();
        let (_peer, _) = listener.accept().await.unwrap();
        client
            .wait_for_state(|s| s == ConnectionState::Connected, Duration::from_secs(5))
            .await
            .unwrap();

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.connection().last_error, None);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.state, ConnectionState::Disconnected);
        assert_eq!(last.detail.as_deref(), Some("stopped"));
    }
}
