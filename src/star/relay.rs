//! Star Relay
//!
//! Host role: accept any number of connections, read each on its own task,
//! hand every record to the router and re-send the raw line to every other
//! connection. Client role: one upstream connection, no relaying.
//!
//! Every connection owns a bounded outbound queue drained by its own writer
//! task. A peer that stops reading fills its queue and is dropped; nobody
//! else waits on it.
//!
//! A relay holds at most one role at a time. Two hosts bridged through a
//! client would fan lines back and forth forever, since the star transport
//! carries no TTL.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::transport::{ByteStream, Link, StreamTransport};
use super::wire::{encode_line, parse_line, WireRecord, MAX_RECORD_BYTES};
use crate::error::{MeshError, Result};
use crate::events::RelayEvent;
use crate::peer_manager::PeerList;
use crate::tasks::TaskRegistry;

/// Lines a connection may have waiting before its peer counts as stalled
pub const OUTBOUND_QUEUE_LINES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StarRole {
    Idle,
    Host,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

type Writer = WriteHalf<Box<dyn ByteStream>>;

/// One star connection. Closing is idempotent: only the first `close`
/// stops the writer and shuts the stream down.
pub struct Connection {
    id: u64,
    peer: String,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Arc<str>>>>,
    closing: watch::Sender<bool>,
}

impl Connection {
    fn new(id: u64, peer: String) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            id,
            peer,
            state: Mutex::new(ConnectionState::Idle),
            outbound: Mutex::new(None),
            closing,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Open the outbound queue. The returned future is the writer; it runs
    /// until the connection closes or a write fails.
    fn attach(&self, writer: Writer) -> impl Future<Output = Result<()>> + Send + 'static {
        let (queue, lines) = mpsc::channel(OUTBOUND_QUEUE_LINES);
        *self.outbound.lock() = Some(queue);
        self.set_state(ConnectionState::Connected);
        write_loop(writer, lines, self.closing.subscribe())
    }

    /// Queue one line without waiting on the peer
    fn queue_line(&self, line: Arc<str>) -> Result<()> {
        let outbound = self.outbound.lock();
        let queue = outbound
            .as_ref()
            .ok_or_else(|| MeshError::unavailable(format!("connection to {} is closed", self.peer)))?;
        queue.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => MeshError::unavailable(format!(
                "{} stopped reading with {} lines queued",
                self.peer, OUTBOUND_QUEUE_LINES
            )),
            TrySendError::Closed(_) => MeshError::unavailable(format!("connection to {} is closed", self.peer)),
        })
    }

    /// Resolves once the connection starts closing
    async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closed| *closed).await;
    }

    /// Returns true for the call that actually closed the connection
    fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return false;
            }
            *state = ConnectionState::Closing;
        }

        self.outbound.lock().take();
        self.closing.send_replace(true);
        self.set_state(ConnectionState::Closed);
        true
    }
}

async fn write_loop(
    mut writer: Writer,
    mut lines: mpsc::Receiver<Arc<str>>,
    mut closing: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let line = tokio::select! {
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = closing.wait_for(|closed| *closed) => break,
        };
        tokio::select! {
            written = write_record(&mut writer, &line) => written?,
            _ = closing.wait_for(|closed| *closed) => break,
        }
    }
    writer.shutdown().await?;
    Ok(())
}

async fn write_record(writer: &mut Writer, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}

/// Star transport relay
#[derive(Clone)]
pub struct StarRelay {
    transport: Arc<dyn StreamTransport>,
    service_id: Uuid,
    events: mpsc::UnboundedSender<RelayEvent>,
    role: Arc<Mutex<StarRole>>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
    upstream: Arc<Mutex<Option<Arc<Connection>>>>,
    peers: Arc<PeerList>,
    tasks: Arc<Mutex<Option<Arc<TaskRegistry>>>>,
    local_address: Arc<Mutex<Option<String>>>,
    next_id: Arc<AtomicU64>,
}

impl StarRelay {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        service_id: Uuid,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        Self {
            transport,
            service_id,
            events,
            role: Arc::new(Mutex::new(StarRole::Idle)),
            connections: Arc::new(DashMap::new()),
            upstream: Arc::new(Mutex::new(None)),
            peers: Arc::new(PeerList::new()),
            tasks: Arc::new(Mutex::new(None)),
            local_address: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn claim_role(&self, wanted: StarRole) -> Result<bool> {
        let mut role = self.role.lock();
        match *role {
            StarRole::Idle => {
                *role = wanted;
                Ok(true)
            }
            current if current == wanted => Ok(false),
            current => Err(MeshError::unavailable(format!(
                "star relay is already acting as {:?}",
                current
            ))),
        }
    }

    fn release_role(&self) {
        *self.role.lock() = StarRole::Idle;
    }

    /// Start accepting connections. Returns the address clients connect to.
    pub async fn start_host(&self) -> Result<String> {
        if !self.claim_role(StarRole::Host)? {
            return Ok(self.local_address.lock().clone().unwrap_or_default());
        }

        let mut listener = match self.transport.listen(self.service_id).await {
            Ok(listener) => listener,
            Err(e) => {
                self.release_role();
                error!("Failed to start star host: {}", e);
                return Err(e);
            }
        };
        let address = listener.local_address();

        let tasks = Arc::new(TaskRegistry::new());
        let relay = self.clone();
        let registry = tasks.clone();
        tasks.spawn_cancellable(async move {
            loop {
                match listener.accept().await {
                    Ok(link) => {
                        info!("Star client connected: {}", link.peer);
                        relay.register(link, &registry, true);
                    }
                    Err(e) => {
                        error!("Star accept loop failed: {}", e);
                        break;
                    }
                }
            }
        });

        *self.tasks.lock() = Some(tasks);
        *self.local_address.lock() = Some(address.clone());
        info!("Star host started on {}", address);
        Ok(address)
    }

    pub async fn stop_host(&self) -> Result<()> {
        if self.role() != StarRole::Host {
            return Ok(());
        }
        info!("Stopping star host");
        self.shut_down();
        Ok(())
    }

    /// Open the single upstream connection to `peer`
    pub async fn connect_to(&self, peer: &str) -> Result<()> {
        if !self.claim_role(StarRole::Client)? {
            // one upstream at a time
            self.shut_down();
            self.claim_role(StarRole::Client)?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id, peer.to_string()));
        connection.set_state(ConnectionState::Connecting);
        *self.upstream.lock() = Some(connection.clone());
        info!("Connecting to star host {}", peer);

        let link = match self.transport.connect(peer, self.service_id).await {
            Ok(link) => link,
            Err(e) => {
                connection.set_state(ConnectionState::Closed);
                self.upstream.lock().take();
                self.release_role();
                warn!("Failed to connect to {}: {}", peer, e);
                return Err(e);
            }
        };

        let tasks = Arc::new(TaskRegistry::new());
        *self.tasks.lock() = Some(tasks.clone());
        self.attach(connection, link, &tasks, false);
        info!("Connected to star host {}", peer);
        Ok(())
    }

    pub async fn stop_client(&self) -> Result<()> {
        if self.role() != StarRole::Client {
            return Ok(());
        }
        info!("Disconnecting from star host");
        self.shut_down();
        Ok(())
    }

    /// Leave whichever role is active
    pub async fn stop(&self) -> Result<()> {
        if self.role() != StarRole::Idle {
            self.shut_down();
        }
        Ok(())
    }

    fn shut_down(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown();
        }

        let open: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        for connection in open {
            self.teardown(&connection);
        }

        self.upstream.lock().take();
        self.local_address.lock().take();
        self.peers.clear();
        self.release_role();
    }

    fn register(&self, link: Link, tasks: &Arc<TaskRegistry>, fan_out: bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id, link.peer.clone()));
        self.attach(connection, link, tasks, fan_out);
    }

    fn attach(&self, connection: Arc<Connection>, link: Link, tasks: &Arc<TaskRegistry>, fan_out: bool) {
        let (reader, writer) = tokio::io::split(link.stream);
        let writing = connection.attach(writer);

        self.connections.insert(connection.id, connection.clone());
        self.peers.insert(&connection.peer);

        let relay = self.clone();
        let outbound = connection.clone();
        tasks.spawn_cancellable(async move {
            if let Err(e) = writing.await {
                warn!("Write to {} failed: {}", outbound.peer, e);
            }
            relay.teardown(&outbound);
        });

        let relay = self.clone();
        let registry = tasks.clone();
        tasks.spawn_cancellable(async move {
            tokio::select! {
                _ = relay.read_loop(&connection, reader, fan_out) => {}
                _ = connection.closed() => {}
            }
            relay.teardown(&connection);
            if !fan_out {
                relay.upstream_lost(&registry);
            }
        });
    }

    async fn read_loop(&self, connection: &Connection, reader: ReadHalf<Box<dyn ByteStream>>, fan_out: bool) {
        let mut reader = BufReader::new(reader);
        let mut record = Vec::new();
        let limit = MAX_RECORD_BYTES as u64 + 1;
        let mut skipping = false;

        loop {
            record.clear();
            let read = (&mut reader).take(limit).read_until(b'\n', &mut record).await;
            let terminated = record.last() == Some(&b'\n');
            match read {
                Ok(0) => {
                    info!("Star connection {} closed by remote", connection.peer);
                    break;
                }
                Ok(_) if !terminated && record.len() as u64 == limit => {
                    if !skipping {
                        warn!(
                            "Dropping record from {} longer than {} bytes",
                            connection.peer, MAX_RECORD_BYTES
                        );
                        skipping = true;
                    }
                    continue;
                }
                Ok(_) if skipping => {
                    // tail of an oversized record
                    skipping = !terminated;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Read from {} failed: {}", connection.peer, e);
                    break;
                }
            }

            let line = String::from_utf8_lossy(&record);
            self.handle_line(connection, line.trim_end_matches(&['\r', '\n'][..]), fan_out);
        }
    }

    fn handle_line(&self, connection: &Connection, line: &str, fan_out: bool) {
        let Some(record) = parse_line(line, &connection.peer) else {
            return;
        };
        debug!("Star message from {} via {}", record.from, connection.peer);

        let _ = self.events.send(RelayEvent::StarMessage {
            from: record.from,
            text: record.text,
            message_id: record.id,
        });

        if fan_out {
            self.fan_out(Some(connection.id), line);
        }
    }

    /// Queue `line` on every connection except `exclude`. Returns how many
    /// connections took it. A connection whose queue is full or closed is
    /// torn down.
    fn fan_out(&self, exclude: Option<u64>, line: &str) -> usize {
        let line: Arc<str> = Arc::from(line);
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| Some(*c.key()) != exclude)
            .map(|c| c.value().clone())
            .collect();

        let mut delivered = 0;
        for connection in targets {
            match connection.queue_line(line.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Dropping star peer {}: {}", connection.peer, e);
                    self.teardown(&connection);
                }
            }
        }
        delivered
    }

    fn teardown(&self, connection: &Connection) {
        connection.close();
        if self.connections.remove(&connection.id).is_some() {
            self.peers.remove(&connection.peer);
            info!("Star peer removed: {}", connection.peer);
        }
    }

    fn upstream_lost(&self, registry: &Arc<TaskRegistry>) {
        let current = self.tasks.lock().clone();
        let Some(current) = current else {
            return;
        };
        if !Arc::ptr_eq(&current, registry) {
            return;
        }

        self.tasks.lock().take();
        self.upstream.lock().take();
        self.peers.clear();
        self.release_role();
        info!("Star client disconnected from host");
        current.shutdown();
    }

    /// Send a record to every connected peer. Returns the number of peers
    /// it was queued for; a stalled peer never holds up the call.
    pub async fn send(&self, from: &str, text: &str, message_id: Option<Uuid>) -> Result<usize> {
        if self.role() == StarRole::Idle {
            return Err(MeshError::unavailable("star relay is not hosting or connected"));
        }
        let line = encode_line(&WireRecord::new(from, text, message_id))?;
        Ok(self.fan_out(None, &line))
    }

    pub fn role(&self) -> StarRole {
        *self.role.lock()
    }

    pub fn is_hosting(&self) -> bool {
        self.role() == StarRole::Host
    }

    pub fn is_client(&self) -> bool {
        self.role() == StarRole::Client
    }

    /// State of the upstream connection in the client role
    pub fn client_state(&self) -> ConnectionState {
        self.upstream
            .lock()
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Idle)
    }

    /// Connected endpoints, in connection order
    pub fn peers(&self) -> Vec<String> {
        self.peers.addresses()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn local_address(&self) -> Option<String> {
        self.local_address.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star::transport::MemoryNetwork;
    use std::time::Duration;

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn relay(network: &MemoryNetwork, name: &str) -> (StarRelay, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StarRelay::new(Arc::new(network.transport(name)), Uuid::nil(), tx), rx)
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> (String, String) {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(RelayEvent::StarMessage { from, text, .. })) => (from, text),
            other => panic!("expected a star message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_host_fans_out_to_everyone_but_sender() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        let (a, mut a_rx) = relay(&network, "a");
        let (b, mut b_rx) = relay(&network, "b");
        let (c, mut c_rx) = relay(&network, "c");
        for client in [&a, &b, &c] {
            client.connect_to("host").await.unwrap();
        }
        eventually(|| host.connection_count() == 3).await;

        assert_eq!(a.send("alice", "hello all", None).await.unwrap(), 1);

        assert_eq!(next_message(&mut host_rx).await, ("alice".into(), "hello all".into()));
        assert_eq!(next_message(&mut b_rx).await, ("alice".into(), "hello all".into()));
        assert_eq!(next_message(&mut c_rx).await, ("alice".into(), "hello all".into()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_host_send_reaches_all_clients() {
        let network = MemoryNetwork::new();
        let (host, _host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();
        assert_eq!(host.send("host", "nobody here", None).await.unwrap(), 0);

        let (a, mut a_rx) = relay(&network, "a");
        let (b, mut b_rx) = relay(&network, "b");
        a.connect_to("host").await.unwrap();
        b.connect_to("host").await.unwrap();
        eventually(|| host.connection_count() == 2).await;
        assert_eq!(host.peers(), vec!["a".to_string(), "b".to_string()]);

        let id = Uuid::new_v4();
        assert_eq!(host.send("host", "announce", Some(id)).await.unwrap(), 2);
        for rx in [&mut a_rx, &mut b_rx] {
            match rx.recv().await {
                Some(RelayEvent::StarMessage { message_id, .. }) => assert_eq!(message_id, Some(id)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unparseable_line_is_delivered_as_raw_text() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        let mut raw = network.transport("legacy").connect("host", Uuid::nil()).await.unwrap();
        raw.stream.write_all(b"plain words\n").await.unwrap();

        assert_eq!(next_message(&mut host_rx).await, ("legacy".into(), "plain words".into()));
    }

    #[tokio::test]
    async fn test_remote_close_removes_peer_once() {
        let network = MemoryNetwork::new();
        let (host, _host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        let (a, _a_rx) = relay(&network, "a");
        a.connect_to("host").await.unwrap();
        assert_eq!(a.client_state(), ConnectionState::Connected);
        eventually(|| host.peers() == vec!["a".to_string()]).await;

        a.stop_client().await.unwrap();
        assert!(!a.is_client());
        assert!(a.peers().is_empty());

        eventually(|| host.connection_count() == 0).await;
        assert!(host.peers().is_empty());
        assert!(host.is_hosting());
    }

    #[tokio::test]
    async fn test_host_stop_disconnects_clients() {
        let network = MemoryNetwork::new();
        let (host, _host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        let (a, _a_rx) = relay(&network, "a");
        a.connect_to("host").await.unwrap();
        eventually(|| host.connection_count() == 1).await;

        host.stop_host().await.unwrap();
        assert_eq!(host.role(), StarRole::Idle);
        assert!(host.peers().is_empty());
        eventually(|| !network.is_listening("host")).await;

        eventually(|| !a.is_client()).await;
        assert!(matches!(a.send("a", "anyone?", None).await, Err(MeshError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_relay_idle() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = relay(&network, "a");

        let result = a.connect_to("nowhere").await;
        assert!(matches!(result, Err(MeshError::TransportUnavailable(_))));
        assert_eq!(a.role(), StarRole::Idle);
        assert_eq!(a.client_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_roles_are_exclusive() {
        let network = MemoryNetwork::new();
        let (host, _rx) = relay(&network, "host");
        host.start_host().await.unwrap();
        assert_eq!(host.start_host().await.unwrap(), "host");

        assert!(host.connect_to("elsewhere").await.is_err());
        assert!(host.is_hosting());
    }

    #[tokio::test]
    async fn test_send_while_idle_is_unavailable() {
        let network = MemoryNetwork::new();
        let (a, _rx) = relay(&network, "a");
        assert!(matches!(a.send("a", "x", None).await, Err(MeshError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_connection_close_is_idempotent() {
        let (local, mut remote) = tokio::io::duplex(64);
        let stream: Box<dyn ByteStream> = Box::new(local);
        let (_reader, writer) = tokio::io::split(stream);

        let connection = Connection::new(7, "peer".into());
        let writing = tokio::spawn(connection.attach(writer));
        assert_eq!(connection.state(), ConnectionState::Connected);

        assert!(connection.close());
        assert!(!connection.close());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.queue_line("late".into()).is_err());

        writing.await.unwrap().unwrap();
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_delivered_and_reading_continues() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        let mut raw = network.transport("legacy").connect("host", Uuid::nil()).await.unwrap();
        raw.stream.write_all(b"caf\xe9 latin1\nsecond line\n").await.unwrap();

        assert_eq!(next_message(&mut host_rx).await, ("legacy".into(), "caf\u{FFFD} latin1".into()));
        assert_eq!(next_message(&mut host_rx).await, ("legacy".into(), "second line".into()));
        assert_eq!(host.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_record_is_dropped_and_connection_kept() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        let mut raw = network.transport("legacy").connect("host", Uuid::nil()).await.unwrap();
        raw.stream.write_all(&vec![b'z'; MAX_RECORD_BYTES + 100]).await.unwrap();
        raw.stream.write_all(b" tail\nafter\n").await.unwrap();

        assert_eq!(next_message(&mut host_rx).await, ("legacy".into(), "after".into()));
        assert!(host_rx.try_recv().is_err());
        assert_eq!(host.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_record_at_the_limit_is_delivered() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        let mut raw = network.transport("legacy").connect("host", Uuid::nil()).await.unwrap();
        let mut record = vec![b'k'; MAX_RECORD_BYTES];
        record.push(b'\n');
        raw.stream.write_all(&record).await.unwrap();

        let (_, text) = next_message(&mut host_rx).await;
        assert_eq!(text.len(), MAX_RECORD_BYTES);
    }

    #[tokio::test]
    async fn test_peer_that_never_reads_does_not_stall_others() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = relay(&network, "host");
        host.start_host().await.unwrap();

        // connected but never reads
        let _stalled = network.transport("stalled").connect("host", Uuid::nil()).await.unwrap();
        let (a, mut a_rx) = relay(&network, "a");
        a.connect_to("host").await.unwrap();
        eventually(|| host.connection_count() == 2).await;

        let bulk = "x".repeat(8 * 1024);
        for _ in 0..OUTBOUND_QUEUE_LINES + 32 {
            let sent = tokio::time::timeout(Duration::from_secs(1), host.send("host", &bulk, None))
                .await
                .expect("host send blocked on a stalled peer");
            sent.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        eventually(|| host.peers() == vec!["a".to_string()]).await;

        a.send("a", "after", None).await.unwrap();
        assert_eq!(next_message(&mut host_rx).await, ("a".into(), "after".into()));

        for _ in 0..OUTBOUND_QUEUE_LINES + 32 {
            let (_, text) = next_message(&mut a_rx).await;
            assert_eq!(text.len(), bulk.len());
        }
    }
}
