// NDJSON streaming server
//
// Accepts any number of peers. Each accepted socket gets its own handler
// task that
// - writes messages queued for it (broadcast via `publish` or addressed via
//   `send_to`) through the framer
// - reads inbound lines from the same socket and dispatches triggers to the
//   marker correlator and to inbound subscribers
//
// A peer going away (EOF, reset, broken pipe) ends only its own handler.
// The connection registry is touched by the accept loop (insert) and by
// handler exit (remove) under one lock.

use crate::config::StreamConfig;
use crate::streaming::correlator::MarkerCorrelator;
use crate::streaming::framer::{Message, MessageFramer};
use crate::streaming::types::{StreamError, StreamResult};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Messages queued per connection before new ones are dropped for it
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for ServerConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            outbound_queue_capacity: config.outbound_queue_capacity,
        }
    }
}

/// Public view of one accepted connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub messages_received: u64,
}

/// A message read from a peer
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection: Uuid,
    pub peer: SocketAddr,
    pub message: Message,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
}

struct ConnectionEntry {
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    counters: Arc<ConnectionCounters>,
}

/// Active connections, shared by the accept loop and every handler
#[derive(Clone, Default)]
struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    fn register(&self, id: Uuid, entry: ConnectionEntry) {
        self.connections.write().insert(id, entry);
    }

    fn remove(&self, id: &Uuid) -> bool {
        self.connections.write().remove(id).is_some()
    }

    fn len(&self) -> usize {
        self.connections.read().len()
    }

    fn outbound(&self, id: &Uuid) -> Option<(mpsc::Sender<Message>, Arc<ConnectionCounters>)> {
        self.connections
            .read()
            .get(id)
            .map(|entry| (entry.outbound.clone(), Arc::clone(&entry.counters)))
    }

    fn cancel(&self, id: &Uuid) -> bool {
        match self.connections.read().get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn infos(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                peer: entry.peer,
                connected_at: entry.connected_at,
                messages_sent: entry.counters.sent.load(Ordering::Relaxed),
                messages_dropped: entry.counters.dropped.load(Ordering::Relaxed),
                messages_received: entry.counters.received.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Queue a message on every connection without waiting
    fn broadcast(&self, message: &Message) -> usize {
        let connections = self.connections.read();
        let mut queued = 0;
        for (id, entry) in connections.iter() {
            match entry.outbound.try_send(message.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = entry.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        log::warn!(
                            "Connection {} ({}) is not keeping up, {} messages dropped",
                            id,
                            entry.peer,
                            dropped
                        );
                    }
                }
                // Handler is on its way out and will deregister itself
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        queued
    }
}

/// What each handler needs besides its own socket
#[derive(Clone)]
struct HandlerContext {
    registry: ConnectionRegistry,
    inbound: broadcast::Sender<InboundMessage>,
    correlator: Option<Arc<MarkerCorrelator>>,
    malformed: Arc<AtomicU64>,
}

pub struct StreamingServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    context: HandlerContext,
}

impl StreamingServer {
    /// Bind the listening socket and start accepting.
    ///
    /// A bind failure is returned immediately.
    pub async fn bind(
        config: ServerConfig,
        correlator: Option<Arc<MarkerCorrelator>>,
    ) -> StreamResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| StreamError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        log::info!("Streaming server listening on {}", local_addr);

        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let context = HandlerContext {
            registry: ConnectionRegistry::default(),
            inbound,
            correlator,
            malformed: Arc::new(AtomicU64::new(0)),
        };

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            cancel.clone(),
            tracker.clone(),
            context.clone(),
            config.outbound_queue_capacity.max(1),
        ));

        Ok(Self {
            local_addr,
            cancel,
            tracker,
            accept_task: Mutex::new(Some(accept_task)),
            context,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a message for every connected peer; returns how many accepted it
    pub fn publish(&self, message: &Message) -> usize {
        self.context.registry.broadcast(message)
    }

    /// Queue a message for one peer, waiting for room in its queue
    pub async fn send_to(&self, connection: &Uuid, message: Message) -> StreamResult<()> {
        let (outbound, _) = self
            .context
            .registry
            .outbound(connection)
            .ok_or_else(|| StreamError::ConnectionNotFound(connection.to_string()))?;
        outbound
            .send(message)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Close one peer's connection
    pub fn disconnect(&self, connection: &Uuid) -> bool {
        self.context.registry.cancel(connection)
    }

    pub fn connection_count(&self) -> usize {
        self.context.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.context.registry.infos()
    }

    /// Inbound messages from every peer
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.context.inbound.subscribe()
    }

    /// Lines from peers that failed to decode
    pub fn malformed_count(&self) -> u64 {
        self.context.malformed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Close the listener and every connection, then wait for all handlers.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                log::error!("Accept task join error: {}", e);
            }
            log::info!("Streaming server on {} stopped accepting", self.local_addr);
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for StreamingServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    tracker: TaskTracker,
    context: HandlerContext,
    queue_capacity: usize,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let id = Uuid::new_v4();
                let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
                let connection_cancel = cancel.child_token();
                let counters = Arc::new(ConnectionCounters::default());

                context.registry.register(
                    id,
                    ConnectionEntry {
                        peer,
                        connected_at: Utc::now(),
                        outbound: outbound_tx,
                        cancel: connection_cancel.clone(),
                        counters: Arc::clone(&counters),
                    },
                );
                log::info!(
                    "Client {} connected from {} ({} active)",
                    id,
                    peer,
                    context.registry.len()
                );

                tracker.spawn(handle_connection(
                    stream,
                    id,
                    peer,
                    outbound_rx,
                    counters,
                    context.clone(),
                    connection_cancel,
                ));
            }
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => {}
                }
            }
        }
    }
    // Listener is dropped (closed) here
}

async fn handle_connection(
    stream: TcpStream,
    id: Uuid,
    peer: SocketAddr,
    mut outbound: mpsc::Receiver<Message>,
    counters: Arc<ConnectionCounters>,
    context: HandlerContext,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        MessageFramer::new().with_counter(Arc::clone(&context.malformed)),
    );
    let mut writer = FramedWrite::new(write_half, MessageFramer::new());

    let reason = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break "closed by server",

            queued = outbound.recv() => {
                let Some(message) = queued else {
                    break "outbound queue closed";
                };
                let written = tokio::select! {
                    _ = cancel.cancelled() => break "closed by server",
                    written = writer.send(message) => written,
                };
                if let Err(e) = written {
                    // Broken pipe / reset: the peer is gone
                    log::info!("Write to {} failed: {}", peer, e);
                    break "write failed";
                }
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }

            inbound = reader.next() => match inbound {
                Some(Ok(message)) => {
                    counters.received.fetch_add(1, Ordering::Relaxed);
                    dispatch_inbound(&context, id, peer, message);
                }
                Some(Err(e)) => {
                    log::info!("Read from {} failed: {}", peer, e);
                    break "read failed";
                }
                None => break "closed by peer",
            },
        }
    };

    context.registry.remove(&id);
    log::info!(
        "Client {} ({}) disconnected: {} ({} active)",
        id,
        peer,
        reason,
        context.registry.len()
    );
}

fn dispatch_inbound(context: &HandlerContext, id: Uuid, peer: SocketAddr, message: Message) {
    log::debug!("Received {} message from {}", message.kind(), peer);
    if let (Message::Trigger { trigger_id }, Some(correlator)) = (&message, &context.correlator) {
        let marker = correlator.on_trigger(trigger_id);
        log::info!(
            "Trigger '{}' from {} at {:.3}",
            marker.id,
            peer,
            marker.created_at
        );
    }

    // No subscribers is fine
    let _ = context.inbound.send(InboundMessage {
        connection: id,
        peer,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            outbound_queue_capacity: 64,
        }
    }

    async fn wait_for_count(server: &StreamingServer, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connection_count() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection count should settle");
    }

    #[tokio::test]
    async fn test_bind_failure_is_immediate() {
        let server = StreamingServer::bind(local_config(), None).await.unwrap();
        let taken = ServerConfig {
            port: server.local_addr().port(),
            ..local_config()
        };
        let result = StreamingServer::bind(taken, None).await;
        assert!(matches!(result, Err(StreamError::Bind { .. })));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_publish_reaches_client() {
        let server = StreamingServer::bind(local_config(), None).await.unwrap();
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_count(&server, 1).await;

        assert_eq!(server.publish(&Message::trigger("hello")), 1);

        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, "{\"triggerID\":\"hello\"}");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_trigger_reaches_correlator() {
        let correlator = Arc::new(MarkerCorrelator::wall_clock());
        let server = StreamingServer::bind(local_config(), Some(Arc::clone(&correlator)))
            .await
            .unwrap();
        let mut inbound = server.subscribe_inbound();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        // Split mid-message and include a malformed line
        stream.write_all(b"{\"triggerID\":\"st").await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"im\"}\nnot json\n").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.message, Message::trigger("stim"));
        assert_eq!(correlator.active_markers()[0].id, "stim");

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.malformed_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_kicks_one_client() {
        let server = StreamingServer::bind(local_config(), None).await.unwrap();
        let _a = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut b = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_count(&server, 2).await;

        let infos = server.connections();
        let b_addr = b.local_addr().unwrap();
        let b_id = infos.iter().find(|c| c.peer == b_addr).unwrap().id;

        assert!(server.disconnect(&b_id));
        wait_for_count(&server, 1).await;

        // b sees EOF
        let mut buf = [0u8; 16];
        let n = tokio::io::AsyncReadExt::read(&mut b, &mut buf).await.unwrap();
        assert_eq!(n, 0);

        assert!(matches!(
            server.send_to(&b_id, Message::trigger("x")).await,
            Err(StreamError::ConnectionNotFound(_))
        ));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_for_that_connection_only() {
        let config = ServerConfig {
            outbound_queue_capacity: 1,
            ..local_config()
        };
        let server = StreamingServer::bind(config, None).await.unwrap();
        let _client = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_count(&server, 1).await;

        // Nothing awaits between these, so the handler cannot drain the queue
        let queued: usize = (0..50)
            .map(|i| server.publish(&Message::trigger(i.to_string())))
            .sum();
        assert!(queued < 50);
        assert!(server.connections()[0].messages_dropped > 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_clients_and_is_idempotent() {
        let server = StreamingServer::bind(local_config(), None).await.unwrap();
        let addr = server.local_addr();
        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        tokio::time::timeout(Duration::from_secs(2), server.stop())
            .await
            .expect("stop should finish promptly");
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_running());

        let mut buf = [0u8; 8];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf)
            .await
            .unwrap_or(0);
        assert_eq!(n, 0);

        server.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
