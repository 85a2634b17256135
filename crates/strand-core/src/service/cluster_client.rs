// Cluster TCP client for inter-node communication
// Length-prefixed frames over one TCP connection per peer, used in both directions

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use strand_api::node::{
    Envelope, NodeMessage, NodeRequest, NodeResponse, Payload,
    codec::{decode, encode},
};
use strand_common::{NodeId, Result, StrandError};

use super::transport::{NodeMessageHandler, NodeTransport};

/// Configuration for the cluster client
#[derive(Clone, Debug)]
pub struct ClusterClientConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Read buffer capacity per connection
    pub read_buffer: usize,
}

impl Default for ClusterClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_buffer: 64 * 1024,
        }
    }
}

impl ClusterClientConfig {
    pub fn from_configuration(config: &crate::model::Configuration) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms()),
            ..Default::default()
        }
    }
}

/// A TCP connection to a cluster node
pub struct ClusterConnection {
    pub node_id: NodeId,
    pub created_at: i64,
    /// Last used timestamp, lock-free
    pub last_used: AtomicI64,
    frames: mpsc::UnboundedSender<Bytes>,
}

impl ClusterConnection {
    fn write(&self, frame: Bytes) -> Result<()> {
        self.last_used
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.frames
            .send(frame)
            .map_err(|_| StrandError::NodeUnavailable(self.node_id))
    }

    pub fn get_last_used(&self) -> i64 {
        self.last_used.load(Ordering::Relaxed)
    }
}

/// [`NodeTransport`] over TCP
///
/// Connections are keyed by the peer's node id, learned from the `from` field
/// of the first frame for accepted connections. Requests and responses are
/// paired through the envelope id.
pub struct TcpNodeTransport {
    this_node: NodeId,
    config: ClusterClientConfig,
    me: Weak<TcpNodeTransport>,
    endpoints: DashMap<NodeId, String>,
    connections: DashMap<NodeId, Arc<ClusterConnection>>,
    pending: DashMap<u64, (NodeId, oneshot::Sender<NodeResponse>)>,
    next_id: AtomicU64,
    handler: RwLock<Option<Weak<dyn NodeMessageHandler>>>,
}

impl TcpNodeTransport {
    pub fn new(this_node: NodeId, config: ClusterClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            this_node,
            config,
            me: me.clone(),
            endpoints: DashMap::new(),
            connections: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            handler: RwLock::new(None),
        })
    }

    /// Route incoming requests and messages to `handler`
    pub fn set_handler(&self, handler: Weak<dyn NodeMessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept peer connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Listening for nodes on {}", addr);
        }
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted node connection from {}", addr);
                    self.start_connection(stream, None);
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn connection(&self, node_id: NodeId) -> Result<Arc<ClusterConnection>> {
        if let Some(conn) = self.connections.get(&node_id) {
            return Ok(conn.clone());
        }

        let endpoint = self
            .endpoints
            .get(&node_id)
            .map(|e| e.clone())
            .ok_or(StrandError::NodeUnavailable(node_id))?;
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| StrandError::NodeUnavailable(node_id))?
            .map_err(|e| {
                debug!(node_id, "Cannot connect to {}: {}", endpoint, e);
                StrandError::NodeUnavailable(node_id)
            })?;
        let _ = stream.set_nodelay(true);
        debug!(node_id, "Connected to {}", endpoint);

        Ok(self.start_connection(stream, Some(node_id)))
    }

    /// Spawn the reader and writer of a connection
    fn start_connection(&self, stream: TcpStream, node_id: Option<NodeId>) -> Arc<ClusterConnection> {
        let (reader, writer) = stream.into_split();
        let (frames, rx) = mpsc::unbounded_channel();
        let now = chrono::Utc::now().timestamp_millis();
        let conn = Arc::new(ClusterConnection {
            node_id: node_id.unwrap_or_default(),
            created_at: now,
            last_used: AtomicI64::new(now),
            frames,
        });
        if let Some(node_id) = node_id {
            self.connections.insert(node_id, conn.clone());
        }

        tokio::spawn(write_frames(writer, rx));

        let transport = self.me.clone();
        let reading = conn.clone();
        tokio::spawn(async move {
            let peer = read_frames(transport.clone(), reader, reading.clone(), node_id).await;
            if let (Some(transport), Some(peer)) = (transport.upgrade(), peer) {
                transport.drop_connection(peer, &reading);
            }
        });
        conn
    }

    fn drop_connection(&self, node_id: NodeId, conn: &Arc<ClusterConnection>) {
        let removed = self
            .connections
            .remove_if(&node_id, |_, current| Arc::ptr_eq(current, conn))
            .is_some();
        if removed {
            debug!(node_id, "Connection closed");
            // requests waiting on this peer fail now instead of timing out
            self.pending.retain(|_, (to, _)| *to != node_id);
        }
    }

    fn handler(&self) -> Option<Arc<dyn NodeMessageHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    fn dispatch(&self, envelope: Envelope, conn: &Arc<ClusterConnection>) {
        let Envelope { id, from, message } = envelope;
        match message {
            Payload::Response(response) => {
                if let Some((_, (_, tx))) = self.pending.remove(&id) {
                    let _ = tx.send(response);
                }
            }
            Payload::Request(request) => {
                let Some(handler) = self.handler() else {
                    return;
                };
                let conn = conn.clone();
                let this_node = self.this_node;
                tokio::spawn(async move {
                    let response = handler.on_request(from, request).await;
                    match encode(&Envelope::response(id, this_node, response)) {
                        Ok(frame) => {
                            let _ = conn.write(frame);
                        }
                        Err(e) => warn!(node_id = from, "Cannot encode response: {}", e),
                    }
                });
            }
            Payload::Message(message) => {
                if let Some(handler) = self.handler() {
                    tokio::spawn(async move {
                        handler.on_message(from, message).await;
                    });
                }
            }
        }
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Read until the peer disconnects; returns the peer id if it became known
async fn read_frames(
    transport: Weak<TcpNodeTransport>,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    conn: Arc<ClusterConnection>,
    mut peer: Option<NodeId>,
) -> Option<NodeId> {
    let capacity = transport
        .upgrade()
        .map(|t| t.config.read_buffer)
        .unwrap_or(64 * 1024);
    let mut buf = BytesMut::with_capacity(capacity);

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => return peer,
            Ok(_) => {}
            Err(e) => {
                debug!("Read failed: {}", e);
                return peer;
            }
        }

        loop {
            let envelope = match decode(&mut buf) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping connection after a bad frame: {}", e);
                    return peer;
                }
            };
            let Some(transport) = transport.upgrade() else {
                return peer;
            };
            if peer.is_none() {
                // accepted connection, now known by the sender's id
                peer = Some(envelope.from);
                transport
                    .connections
                    .entry(envelope.from)
                    .or_insert_with(|| conn.clone());
            }
            transport.dispatch(envelope, &conn);
        }
    }
}

#[async_trait::async_trait]
impl NodeTransport for TcpNodeTransport {
    async fn request(
        &self,
        to: NodeId,
        request: NodeRequest,
        timeout: Duration,
    ) -> Result<NodeResponse> {
        let name = request.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, (to, tx));

        let result = tokio::time::timeout(timeout, async {
            let conn = self.connection(to).await?;
            conn.write(encode(&Envelope::request(id, self.this_node, request))?)?;
            rx.await.map_err(|_| StrandError::NodeUnavailable(to))
        })
        .await;
        self.pending.remove(&id);

        result.map_err(|_| StrandError::Timeout {
            node_id: to,
            request: name,
            timeout,
        })?
    }

    fn send(&self, to: NodeId, message: NodeMessage) -> Result<()> {
        let frame = encode(&Envelope::message(self.this_node, message))?;
        if let Some(conn) = self.connections.get(&to) {
            return conn.write(frame);
        }
        if !self.endpoints.contains_key(&to) {
            return Err(StrandError::NodeUnavailable(to));
        }

        let transport = self.me.upgrade().ok_or(StrandError::NodeUnavailable(to))?;
        tokio::spawn(async move {
            match transport.connection(to).await {
                Ok(conn) => {
                    let _ = conn.write(frame);
                }
                Err(e) => debug!(node_id = to, "Message dropped: {}", e),
            }
        });
        Ok(())
    }

    fn register_peer(&self, node_id: NodeId, endpoint: String) {
        if node_id != self.this_node {
            self.endpoints.insert(node_id, endpoint);
        }
    }
}
