//! Flood Relay
//!
//! Runs the advertise/scan cycle of the broadcast transport. Outbound text
//! is fragmented into frames that are advertised one at a time for a short
//! window. Every new inbound fragment is handed to the router and, while it
//! still has hop budget, advertised again with one less TTL after a random
//! delay so neighbouring relayers do not collide.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::dedup::DedupCache;
use super::fragment::fragment;
use super::protocol::{chunk_size, FragmentKey, MeshPacket, MeshProtocol};
use super::radio::{BroadcastRadio, RadioBlob};
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::events::RelayEvent;
use crate::peer_manager::PeerList;
use crate::tasks::TaskRegistry;

#[derive(Debug, Default)]
struct FloodCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    advertise_failures: AtomicU64,
    rebroadcasts_scheduled: AtomicU64,
}

/// Snapshot of the relay's traffic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FloodStatistics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub advertise_failures: u64,
    pub rebroadcasts_scheduled: u64,
}

/// Flood relay over a [`BroadcastRadio`]
#[derive(Clone)]
pub struct FloodRelay {
    radio: Arc<dyn BroadcastRadio>,
    config: Arc<MeshConfig>,
    chunk_size: usize,
    seen: Arc<DedupCache<FragmentKey>>,
    peers: Arc<PeerList>,
    events: mpsc::UnboundedSender<RelayEvent>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<MeshPacket>>>>,
    tasks: Arc<Mutex<Option<Arc<TaskRegistry>>>>,
    is_running: Arc<RwLock<bool>>,
    counters: Arc<FloodCounters>,
}

impl FloodRelay {
    /// Fails when the radio's capacity cannot fit a frame header
    pub fn new(
        radio: Arc<dyn BroadcastRadio>,
        config: Arc<MeshConfig>,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Self> {
        let capacity = config.payload_capacity.unwrap_or_else(|| radio.payload_capacity());
        let chunk_size = chunk_size(capacity)?;

        Ok(Self {
            radio,
            chunk_size,
            seen: Arc::new(DedupCache::new(config.relay_seen_capacity)),
            config,
            peers: Arc::new(PeerList::new()),
            events,
            outbound: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(None)),
            is_running: Arc::new(RwLock::new(false)),
            counters: Arc::new(FloodCounters::default()),
        })
    }

    /// Start scanning and the advertiser. A radio failure is returned and
    /// leaves the relay stopped, so a later `start` retries from scratch.
    pub async fn start(&self) -> Result<()> {
        if *self.is_running.read().await {
            return Ok(());
        }

        info!("Starting flood relay on {}", self.radio.address());

        let (scan_tx, mut scan_rx) = mpsc::unbounded_channel::<RadioBlob>();
        if let Err(e) = self.radio.start_scanning(scan_tx).await {
            error!("Failed to start scanning: {}", e);
            return Err(e);
        }

        let tasks = Arc::new(TaskRegistry::new());
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<MeshPacket>();

        // One frame on the air at a time
        let relay = self.clone();
        tasks.spawn_cancellable(async move {
            while let Some(packet) = outbound_rx.recv().await {
                relay.transmit(&packet).await;
            }
        });

        let relay = self.clone();
        tasks.spawn_cancellable(async move {
            while let Some(blob) = scan_rx.recv().await {
                relay.handle_blob(&blob.sender, &blob.data);
            }
            debug!("Scan stream closed");
        });

        *self.outbound.lock() = Some(outbound_tx);
        *self.tasks.lock() = Some(tasks);
        *self.is_running.write().await = true;

        info!("Flood relay started (chunk size {} bytes)", self.chunk_size);
        Ok(())
    }

    /// Stop scanning, cancel pending rebroadcasts and forget peers
    pub async fn stop(&self) -> Result<()> {
        if !*self.is_running.read().await {
            return Ok(());
        }

        info!("Stopping flood relay");
        *self.is_running.write().await = false;

        if let Err(e) = self.radio.stop_scanning().await {
            warn!("Failed to stop scanning: {}", e);
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown();
        }
        self.outbound.lock().take();
        self.peers.clear();

        info!("Flood relay stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Fragment `text` under `message_id` and queue every fragment for
    /// advertising. Returns the queued packets.
    pub async fn send_message(&self, message_id: Uuid, text: &str, ttl: u8) -> Result<Vec<MeshPacket>> {
        if !*self.is_running.read().await {
            return Err(MeshError::unavailable("flood relay is not running"));
        }

        let packets = fragment(message_id, &self.radio.address(), text.as_bytes(), self.chunk_size, ttl);
        for packet in &packets {
            // our own fragments echoing back must not be relayed again
            self.seen.mark_seen(packet.fragment_key());
            self.enqueue(packet.clone());
        }

        debug!(
            "Queued message {} as {} fragments (ttl {})",
            message_id,
            packets.len(),
            ttl
        );
        Ok(packets)
    }

    /// Send `text` under a fresh identity
    pub async fn send_text(&self, text: &str, ttl: u8) -> Result<Vec<MeshPacket>> {
        self.send_message(Uuid::new_v4(), text, ttl).await
    }

    fn handle_blob(&self, sender: &str, data: &[u8]) {
        match MeshProtocol::decode(data, sender) {
            Ok(packet) => {
                self.handle_packet(packet);
            }
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping frame from {}: {} [{}]", sender, e, hex::encode(data));
            }
        }
    }

    /// Process one decoded fragment. Returns false for duplicates.
    pub fn handle_packet(&self, packet: MeshPacket) -> bool {
        if !self.seen.check_and_mark(packet.fragment_key()) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate fragment {}#{} from {}", packet.message_id, packet.seq, packet.origin);
            return false;
        }
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        self.peers.record_traffic(&packet.origin);

        let next_hop = packet.relayed();
        if self.events.send(RelayEvent::MeshPacket(packet)).is_err() {
            debug!("Router no longer listening for mesh packets");
        }

        if let Some(next_hop) = next_hop {
            self.schedule_rebroadcast(next_hop);
        }
        true
    }

    fn schedule_rebroadcast(&self, packet: MeshPacket) {
        let Some(tasks) = self.tasks.lock().clone() else {
            return;
        };

        let delay = self.config.jitter.sample();
        debug!(
            "Rebroadcasting {}#{} with ttl {} in {:?}",
            packet.message_id, packet.seq, packet.ttl, delay
        );
        self.counters.rebroadcasts_scheduled.fetch_add(1, Ordering::Relaxed);

        let relay = self.clone();
        tasks.spawn_after(delay, async move {
            relay.enqueue(packet);
        });
    }

    fn enqueue(&self, packet: MeshPacket) {
        if let Some(outbound) = self.outbound.lock().as_ref() {
            let _ = outbound.send(packet);
        }
    }

    async fn transmit(&self, packet: &MeshPacket) {
        let frame = MeshProtocol::encode(packet);
        match self.radio.advertise(&frame, self.config.advertise_window()).await {
            Ok(()) => {
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                debug!("Advertised {}#{} ({} bytes)", packet.message_id, packet.seq, frame.len());
            }
            Err(e) => {
                self.counters.advertise_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to advertise {}#{}: {}", packet.message_id, packet.seq, e);
            }
        }
    }

    /// Addresses heard from, in discovery order
    pub fn peers(&self) -> Vec<String> {
        self.peers.addresses()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn statistics(&self) -> FloodStatistics {
        let c = &self.counters;
        FloodStatistics {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            advertise_failures: c.advertise_failures.load(Ordering::Relaxed),
            rebroadcasts_scheduled: c.rebroadcasts_scheduled.load(Ordering::Relaxed),
        }
    }

    pub async fn get_status(&self) -> Value {
        serde_json::json!({
            "is_running": self.is_running().await,
            "address": self.radio.address(),
            "chunk_size": self.chunk_size,
            "peers": self.peers.get_all_peers(),
            "statistics": self.statistics(),
        })
    }
}
