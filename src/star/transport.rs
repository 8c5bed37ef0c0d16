//! Star Transport Interface
//!
//! Connection-oriented byte streams for the star relay: a host listens and
//! accepts, a client connects to one host. [`TcpTransport`] runs over real
//! sockets, [`MemoryNetwork`] wires endpoints together in-process.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{MeshError, Result};

const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An established connection and the name of the endpoint at the other end
pub struct Link {
    pub peer: String,
    pub stream: Box<dyn ByteStream>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish_non_exhaustive()
    }
}

#[async_trait]
pub trait StreamListener: Send {
    async fn accept(&mut self) -> Result<Link>;

    /// Address clients should connect to
    fn local_address(&self) -> String;
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn listen(&self, service_id: Uuid) -> Result<Box<dyn StreamListener>>;

    async fn connect(&self, peer: &str, service_id: Uuid) -> Result<Link>;
}

/// Star transport over TCP. The service id is not carried on the wire.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_addr: String,
}

impl TcpTransport {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

struct TcpStreamListener {
    listener: TcpListener,
}

#[async_trait]
impl StreamListener for TcpStreamListener {
    async fn accept(&mut self) -> Result<Link> {
        let (stream, addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        debug!("Accepted TCP connection from {}", addr);
        Ok(Link {
            peer: addr.to_string(),
            stream: Box::new(stream),
        })
    }

    fn local_address(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    async fn listen(&self, service_id: Uuid) -> Result<Box<dyn StreamListener>> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| MeshError::unavailable(format!("failed to listen on {}: {}", self.bind_addr, e)))?;
        info!(
            "Listening for star connections on {} (service {})",
            self.bind_addr, service_id
        );
        Ok(Box::new(TcpStreamListener { listener }))
    }

    async fn connect(&self, peer: &str, _service_id: Uuid) -> Result<Link> {
        let stream = TcpStream::connect(peer)
            .await
            .map_err(|e| MeshError::unavailable(format!("failed to connect to {}: {}", peer, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(Link {
            peer: peer.to_string(),
            stream: Box::new(stream),
        })
    }
}

struct Registration {
    service_id: Uuid,
    incoming: mpsc::UnboundedSender<Link>,
}

/// In-process star network. Endpoints are addressed by name.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, Registration>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint called `name` on this network
    pub fn transport(&self, name: &str) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners.contains_key(name)
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    name: String,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct MemoryListener {
    network: MemoryNetwork,
    name: String,
    incoming: mpsc::UnboundedReceiver<Link>,
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.listeners.remove(&self.name);
    }
}

#[async_trait]
impl StreamListener for MemoryListener {
    async fn accept(&mut self) -> Result<Link> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| MeshError::unavailable(format!("listener {} closed", self.name)))
    }

    fn local_address(&self) -> String {
        self.name.clone()
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn listen(&self, service_id: Uuid) -> Result<Box<dyn StreamListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.network.listeners.entry(self.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MeshError::unavailable(format!("{} is already listening", self.name)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Registration {
                    service_id,
                    incoming: tx,
                });
            }
        }

        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            name: self.name.clone(),
            incoming: rx,
        }))
    }

    async fn connect(&self, peer: &str, service_id: Uuid) -> Result<Link> {
        let incoming = match self.network.listeners.get(peer) {
            Some(reg) if reg.service_id == service_id => reg.incoming.clone(),
            Some(_) => {
                return Err(MeshError::unavailable(format!("{} does not offer service {}", peer, service_id)));
            }
            None => return Err(MeshError::unavailable(format!("connection to {} refused", peer))),
        };

        let (local, remote) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        incoming
            .send(Link {
                peer: self.name.clone(),
                stream: Box::new(remote),
            })
            .map_err(|_| MeshError::unavailable(format!("connection to {} refused", peer)))?;

        Ok(Link {
            peer: peer.to_string(),
            stream: Box::new(local),
        })
    }
}
