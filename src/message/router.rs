//! Message Router
//!
//! Joins the star and flood relays into one message stream. Every inbound
//! message is resolved to an identity, delivered to the history at most
//! once, and carried across to the other transport after a jitter delay.

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::message_types::{derive_message_id, UnifiedMessage};
use super::storage::MessageHistory;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::events::RelayEvent;
use crate::mesh::{BroadcastRadio, DedupCache, FloodRelay, FloodStatistics, MeshPacket, ReassemblyTable};
use crate::star::{StarRelay, StarRole, StreamTransport};
use crate::tasks::TaskRegistry;

/// Read-only view of the router for a UI or status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterStatus {
    pub hosting: bool,
    pub mesh_active: bool,
    pub connected_as_client: bool,
    pub mesh_peers: Vec<String>,
    pub star_peers: Vec<String>,
    pub history_len: usize,
}

/// Orchestrates both relays
#[derive(Clone)]
pub struct MessageRouter {
    config: Arc<MeshConfig>,
    local_id: String,
    nickname: Arc<RwLock<String>>,
    flood: FloodRelay,
    star: StarRelay,
    delivered: Arc<DedupCache<Uuid>>,
    reassembly: Arc<ReassemblyTable>,
    history: MessageHistory,
    tasks: Arc<TaskRegistry>,
}

impl MessageRouter {
    /// Build the router and start its event dispatcher. Neither transport is
    /// started; call `start_flood_relay`, `start_star_host` or `connect_to`.
    pub fn new(
        config: MeshConfig,
        radio: Arc<dyn BroadcastRadio>,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MeshError::unavailable("message router needs a running tokio runtime"));
        }
        let config = Arc::new(config);
        let tasks = Arc::new(TaskRegistry::new());
        let local_id = radio.address();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let flood = FloodRelay::new(radio, config.clone(), events_tx.clone())?;
        let star = StarRelay::new(transport, config.service_id, events_tx);

        let router = Self {
            nickname: Arc::new(RwLock::new(config.nickname.clone())),
            local_id,
            flood,
            star,
            delivered: Arc::new(DedupCache::new(config.delivery_seen_capacity)),
            reassembly: Arc::new(ReassemblyTable::new(
                config.reassembly_capacity,
                config.reassembly_timeout(),
            )),
            history: MessageHistory::spawn(&tasks),
            tasks,
            config,
        };

        let dispatcher = router.clone();
        router.tasks.spawn_cancellable(async move {
            while let Some(event) = events_rx.recv().await {
                dispatcher.dispatch(event);
            }
        });

        let reassembly = router.reassembly.clone();
        let sweep_every = (router.config.reassembly_timeout() / 2).max(Duration::from_secs(1));
        router.tasks.spawn_cancellable(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                let expired = reassembly.sweep();
                if expired > 0 {
                    debug!("Dropped {} stale reassemblies", expired);
                }
            }
        });

        info!("Message router ready as {}", router.local_id);
        Ok(router)
    }

    fn dispatch(&self, event: RelayEvent) {
        match event {
            RelayEvent::MeshPacket(packet) => {
                self.handle_mesh_packet(packet);
            }
            RelayEvent::StarMessage { from, text, message_id } => {
                self.handle_star_message(&from, &text, message_id);
            }
        }
    }

    /// Deliver `text` locally and send it on every active transport.
    ///
    /// The returned message is already in the history. Transport failures
    /// are logged and do not undo the local copy.
    pub async fn send_local(&self, text: &str) -> Result<UnifiedMessage> {
        let id = Uuid::new_v4();
        let nickname = self.nickname();
        self.delivered.mark_seen(id);

        let message = UnifiedMessage::local(id, text.to_string(), &self.local_id, &nickname);
        self.history.append(message.clone());

        let ttl = self.config.default_ttl;
        let star_send = async {
            if self.star.role() == StarRole::Idle {
                return;
            }
            match self.star.send(&nickname, text, Some(id)).await {
                Ok(count) => debug!("Sent {} to {} star peers", id, count),
                Err(e) => warn!("Star send failed for {}: {}", id, e),
            }
        };
        let mesh_send = async {
            if !self.flood.is_running().await {
                return;
            }
            if let Err(e) = self.flood.send_message(id, text, ttl).await {
                warn!("Mesh send failed for {}: {}", id, e);
            }
        };
        tokio::join!(star_send, mesh_send);

        Ok(message)
    }

    /// A whole message from the star transport. Returns true if delivered.
    pub fn handle_star_message(&self, from: &str, text: &str, message_id: Option<Uuid>) -> bool {
        let id = message_id.unwrap_or_else(|| derive_message_id(from, text));
        if !self.delivered.check_and_mark(id) {
            debug!("Duplicate star message {} from {}", id, from);
            return false;
        }

        self.history
            .append(UnifiedMessage::from_star(id, from.to_string(), text.to_string()));

        let flood = self.flood.clone();
        let text = text.to_string();
        let ttl = self.config.default_ttl;
        self.tasks.spawn_after(self.config.jitter.sample(), async move {
            if !flood.is_running().await {
                return;
            }
            match flood.send_message(id, &text, ttl).await {
                Ok(packets) => debug!("Carried star message {} onto mesh ({} fragments)", id, packets.len()),
                Err(e) => warn!("Mesh rebroadcast of {} failed: {}", id, e),
            }
        });
        true
    }

    /// One fragment from the flood relay. Returns true if it completed a
    /// new message.
    pub fn handle_mesh_packet(&self, packet: MeshPacket) -> bool {
        if self.delivered.is_seen(&packet.message_id) {
            debug!("Fragment {}#{} of a delivered message", packet.message_id, packet.seq);
            return false;
        }

        let Some(bytes) = self.reassembly.accept(&packet) else {
            return false;
        };

        let id = packet.message_id;
        if !self.delivered.check_and_mark(id) {
            debug!("Duplicate mesh message {}", id);
            return false;
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.history
            .append(UnifiedMessage::from_mesh(id, packet.origin.clone(), text.clone()));

        if packet.ttl == 0 {
            return true;
        }

        let star = self.star.clone();
        let from = packet.origin;
        self.tasks.spawn_after(self.config.jitter.sample(), async move {
            if star.role() == StarRole::Idle {
                return;
            }
            match star.send(&from, &text, Some(id)).await {
                Ok(count) => debug!("Carried mesh message {} onto star ({} peers)", id, count),
                Err(e) => warn!("Star rebroadcast of {} failed: {}", id, e),
            }
        });
        true
    }

    pub async fn start_flood_relay(&self) -> Result<()> {
        self.flood.start().await
    }

    pub async fn stop_flood_relay(&self) -> Result<()> {
        self.flood.stop().await
    }

    /// Returns the address clients should connect to
    pub async fn start_star_host(&self) -> Result<String> {
        self.star.start_host().await
    }

    pub async fn stop_star_host(&self) -> Result<()> {
        self.star.stop_host().await
    }

    pub async fn connect_to(&self, peer: &str) -> Result<()> {
        self.star.connect_to(peer).await
    }

    pub async fn stop_star_client(&self) -> Result<()> {
        self.star.stop_client().await
    }

    /// Cancel pending rebroadcasts and end the history task, then stop both
    /// relays
    pub async fn close(&self) {
        info!("Closing message router");
        self.tasks.shutdown();
        if let Err(e) = self.flood.stop().await {
            warn!("Error stopping flood relay: {}", e);
        }
        if let Err(e) = self.star.stop().await {
            warn!("Error stopping star relay: {}", e);
        }
    }

    pub async fn status(&self) -> RouterStatus {
        RouterStatus {
            hosting: self.star.is_hosting(),
            mesh_active: self.flood.is_running().await,
            connected_as_client: self.star.is_client(),
            mesh_peers: self.flood.peers(),
            star_peers: self.star.peers(),
            history_len: self.history.len().await,
        }
    }

    pub fn mesh_peers(&self) -> Vec<String> {
        self.flood.peers()
    }

    pub fn star_peers(&self) -> Vec<String> {
        self.star.peers()
    }

    pub async fn messages(&self) -> Vec<UnifiedMessage> {
        self.history.snapshot().await
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnifiedMessage> {
        self.history.subscribe()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn nickname(&self) -> String {
        self.nickname.read().clone()
    }

    pub fn set_nickname(&self, nickname: &str) -> Result<()> {
        let mut config = (*self.config).clone();
        config.set_nickname(nickname)?;
        info!("Nickname changed to {}", config.nickname);
        *self.nickname.write() = config.nickname;
        Ok(())
    }

    pub fn flood_statistics(&self) -> FloodStatistics {
        self.flood.statistics()
    }

    pub fn pending_reassemblies(&self) -> usize {
        self.reassembly.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitterWindow;
    use crate::mesh::{MeshProtocol, SimulatedAir};
    use crate::message::message_types::TransportKind;
    use crate::star::MemoryNetwork;

    fn router(air: &SimulatedAir, network: &MemoryNetwork, name: &str, config: MeshConfig) -> MessageRouter {
        MessageRouter::new(
            config.with_nickname(name),
            Arc::new(air.radio(name)),
            Arc::new(network.transport(name)),
        )
        .unwrap()
    }

    fn packet(id: Uuid, seq: u64, ttl: u8, is_last: bool, payload: &[u8]) -> MeshPacket {
        MeshPacket::new(id, "remote".into(), seq, ttl, is_last, payload.to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_local_appends_without_transports() {
        let router = router(&SimulatedAir::new(), &MemoryNetwork::new(), "alice", MeshConfig::deterministic());

        let sent = router.send_local("hello").await.unwrap();
        assert_eq!(sent.source, TransportKind::Local);
        assert_eq!(sent.nickname, "alice");

        let messages = router.messages().await;
        assert_eq!(messages, vec![sent.clone()]);

        // the own identity is already seen
        assert!(!router.handle_star_message("alice", "hello", Some(sent.id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_star_message_appends_once() {
        let router = router(&SimulatedAir::new(), &MemoryNetwork::new(), "n", MeshConfig::deterministic());

        assert!(router.handle_star_message("X", "yo", None));
        assert!(!router.handle_star_message("X", "yo", None));
        assert!(router.handle_star_message("Y", "yo", None));

        let messages = router.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, derive_message_id("X", "yo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_fragments_deliver_once_complete() {
        let router = router(&SimulatedAir::new(), &MemoryNetwork::new(), "n", MeshConfig::deterministic());
        let id = Uuid::new_v4();

        assert!(!router.handle_mesh_packet(packet(id, 1, 2, true, b"world")));
        assert_eq!(router.pending_reassemblies(), 1);
        assert!(router.handle_mesh_packet(packet(id, 0, 2, false, b"hello ")));
        assert_eq!(router.pending_reassemblies(), 0);

        let messages = router.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello world");
        assert_eq!(messages[0].source, TransportKind::Mesh);
        assert_eq!(messages[0].sender_id, "remote");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_of_delivered_message_are_dropped_early() {
        let router = router(&SimulatedAir::new(), &MemoryNetwork::new(), "n", MeshConfig::deterministic());
        let id = Uuid::new_v4();
        assert!(router.handle_star_message("X", "already here", Some(id)));

        assert!(!router.handle_mesh_packet(packet(id, 1, 2, true, b"here")));
        assert_eq!(router.pending_reassemblies(), 0);
        assert_eq!(router.messages().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_star_message_is_carried_onto_mesh() {
        let air = SimulatedAir::new();
        let mut config = MeshConfig::deterministic();
        config.jitter = JitterWindow::new(100, 100);
        let router = router(&air, &MemoryNetwork::new(), "bridge", config);
        router.start_flood_relay().await.unwrap();

        assert!(router.handle_star_message("X", "yo", None));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(air.transmissions_from("bridge").is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let frames = air.transmissions_from("bridge");
        assert_eq!(frames.len(), 1);
        let sent = MeshProtocol::decode(&frames[0], "bridge").unwrap();
        assert_eq!(sent.message_id, derive_message_id("X", "yo"));
        assert_eq!(sent.ttl, crate::config::DEFAULT_TTL);
        assert_eq!(sent.payload, b"yo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_message_is_carried_onto_star_only_with_ttl() {
        let air = SimulatedAir::new();
        let network = MemoryNetwork::new();
        let router = router(&air, &network, "host", MeshConfig::deterministic());
        router.start_star_host().await.unwrap();

        let (tx, mut client_rx) = mpsc::unbounded_channel();
        let client = StarRelay::new(Arc::new(network.transport("client")), MeshConfig::new().service_id, tx);
        client.connect_to("host").await.unwrap();
        while router.star_peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let last_hop = Uuid::new_v4();
        assert!(router.handle_mesh_packet(packet(last_hop, 0, 0, true, b"stop here")));
        let carried = Uuid::new_v4();
        assert!(router.handle_mesh_packet(packet(carried, 0, 1, true, b"pass on")));

        match tokio::time::timeout(Duration::from_secs(1), client_rx.recv()).await {
            Ok(Some(RelayEvent::StarMessage { from, text, message_id })) => {
                assert_eq!(from, "remote");
                assert_eq!(text, "pass on");
                assert_eq!(message_id, Some(carried));
            }
            other => panic!("expected the carried message, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_scheduled_rebroadcasts() {
        let air = SimulatedAir::new();
        let mut config = MeshConfig::deterministic();
        config.jitter = JitterWindow::new(500, 500);
        let router = router(&air, &MemoryNetwork::new(), "n", config);
        router.start_flood_relay().await.unwrap();

        router.handle_star_message("X", "never sent", None);
        router.close().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(air.transmissions_from("n").is_empty());
        assert!(!router.status().await.mesh_active);
    }

    #[test]
    fn test_new_without_runtime_is_an_error() {
        let air = SimulatedAir::new();
        let network = MemoryNetwork::new();
        let result = MessageRouter::new(
            MeshConfig::deterministic(),
            Arc::new(air.radio("n")),
            Arc::new(network.transport("n")),
        );
        assert!(matches!(result, Err(MeshError::TransportUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_ends_history() {
        let router = router(&SimulatedAir::new(), &MemoryNetwork::new(), "n", MeshConfig::deterministic());
        router.send_local("kept until close").await.unwrap();
        assert_eq!(router.messages().await.len(), 1);

        router.close().await;
        assert!(router.messages().await.is_empty());
        assert_eq!(router.status().await.history_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reflects_roles() {
        let air = SimulatedAir::new();
        let router = router(&air, &MemoryNetwork::new(), "n", MeshConfig::deterministic());

        let status = router.status().await;
        assert!(!status.hosting && !status.mesh_active && !status.connected_as_client);

        router.start_flood_relay().await.unwrap();
        router.start_star_host().await.unwrap();
        router.send_local("one").await.unwrap();

        let status = router.status().await;
        assert!(status.hosting);
        assert!(status.mesh_active);
        assert_eq!(status.history_len, 1);
        assert!(router.connect_to("elsewhere").await.is_err());

        router.stop_star_host().await.unwrap();
        router.stop_flood_relay().await.unwrap();
        let status = router.status().await;
        assert!(!status.hosting && !status.mesh_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_start_failure_is_reported() {
        let air = SimulatedAir::new();
        let router = router(&air, &MemoryNetwork::new(), "n", MeshConfig::deterministic());
        air.set_powered("n", false);

        assert!(matches!(router.start_flood_relay().await, Err(MeshError::TransportUnavailable(_))));
        // the local copy still lands
        router.send_local("offline").await.unwrap();
        assert_eq!(router.messages().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nickname_updates_are_validated() {
        let router = router(&SimulatedAir::new(), &MemoryNetwork::new(), "n", MeshConfig::deterministic());
        router.set_nickname("  Zed ").unwrap();
        assert_eq!(router.nickname(), "Zed");
        assert!(router.set_nickname("   ").is_err());
        assert_eq!(router.nickname(), "Zed");
    }

    #[test]
    fn test_status_serializes() {
        let status = RouterStatus {
            hosting: true,
            mesh_active: false,
            connected_as_client: false,
            mesh_peers: vec!["aa".into()],
            star_peers: vec![],
            history_len: 3,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["hosting"], true);
        assert_eq!(json["mesh_peers"][0], "aa");
    }
}
