//! Broadcast Radio Interface
//!
//! The flood relay talks to the advertise/scan radio through
//! [`BroadcastRadio`]. [`SimulatedAir`] is an in-memory medium that carries
//! advertisements between any number of simulated radios.

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::protocol::DEFAULT_PAYLOAD_CAPACITY;
use crate::error::{MeshError, Result};

/// A blob received from the air, tagged with the address it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioBlob {
    pub sender: String,
    pub data: Vec<u8>,
}

/// Connectionless advertise/scan radio
#[async_trait]
pub trait BroadcastRadio: Send + Sync {
    /// Address other radios see this one as
    fn address(&self) -> String;

    /// Usable bytes per advertisement
    fn payload_capacity(&self) -> usize;

    /// Advertise `frame` for `window`, then stop advertising
    async fn advertise(&self, frame: &[u8], window: Duration) -> Result<()>;

    /// Deliver every received blob into `sink` until scanning stops
    async fn start_scanning(&self, sink: mpsc::UnboundedSender<RadioBlob>) -> Result<()>;

    async fn stop_scanning(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct AirState {
    scanners: HashMap<String, mpsc::UnboundedSender<RadioBlob>>,
    links: Option<HashSet<(String, String)>>,
    powered_off: HashSet<String>,
    transmissions: Vec<RadioBlob>,
}

impl AirState {
    fn in_range(&self, a: &str, b: &str) -> bool {
        match &self.links {
            None => true,
            Some(links) => links.contains(&(a.to_string(), b.to_string())),
        }
    }
}

/// In-memory broadcast medium.
///
/// Every radio hears every other radio until the first [`link`] call;
/// from then on only explicitly linked pairs are in range.
///
/// [`link`]: SimulatedAir::link
#[derive(Debug, Clone, Default)]
pub struct SimulatedAir {
    state: Arc<Mutex<AirState>>,
}

impl SimulatedAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// A radio with the default payload capacity
    pub fn radio(&self, address: &str) -> SimulatedRadio {
        self.radio_with_capacity(address, DEFAULT_PAYLOAD_CAPACITY)
    }

    pub fn radio_with_capacity(&self, address: &str, payload_capacity: usize) -> SimulatedRadio {
        SimulatedRadio {
            air: self.clone(),
            address: address.to_string(),
            payload_capacity,
        }
    }

    /// Put `a` and `b` in range of each other
    pub fn link(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        let links = state.links.get_or_insert_with(HashSet::new);
        links.insert((a.to_string(), b.to_string()));
        links.insert((b.to_string(), a.to_string()));
    }

    /// Simulate a disabled radio: scanning and advertising fail
    pub fn set_powered(&self, address: &str, powered: bool) {
        let mut state = self.state.lock();
        if powered {
            state.powered_off.remove(address);
        } else {
            state.powered_off.insert(address.to_string());
            state.scanners.remove(address);
        }
    }

    /// Every frame advertised so far, in order
    pub fn transmissions(&self) -> Vec<RadioBlob> {
        self.state.lock().transmissions.clone()
    }

    pub fn transmissions_from(&self, address: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .transmissions
            .iter()
            .filter(|t| t.sender == address)
            .map(|t| t.data.clone())
            .collect()
    }

    /// Inject a blob as if `sender` had advertised it
    pub fn inject(&self, sender: &str, data: &[u8]) {
        self.transmit(sender, data);
    }

    fn transmit(&self, sender: &str, data: &[u8]) {
        let mut state = self.state.lock();
        state.transmissions.push(RadioBlob {
            sender: sender.to_string(),
            data: data.to_vec(),
        });

        let blob = RadioBlob {
            sender: sender.to_string(),
            data: data.to_vec(),
        };
        let mut closed = Vec::new();
        for (address, sink) in state.scanners.iter() {
            if address == sender || !state.in_range(sender, address) {
                continue;
            }
            if sink.send(blob.clone()).is_err() {
                closed.push(address.clone());
            }
        }
        for address in closed {
            state.scanners.remove(&address);
        }
    }
}

/// One endpoint on a [`SimulatedAir`]
#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    air: SimulatedAir,
    address: String,
    payload_capacity: usize,
}

#[async_trait]
impl BroadcastRadio for SimulatedRadio {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    async fn advertise(&self, frame: &[u8], window: Duration) -> Result<()> {
        if self.air.state.lock().powered_off.contains(&self.address) {
            return Err(MeshError::unavailable(format!("radio {} is powered off", self.address)));
        }
        if frame.len() > self.payload_capacity {
            return Err(MeshError::malformed(format!(
                "frame of {} bytes exceeds advertisement capacity {}",
                frame.len(),
                self.payload_capacity
            )));
        }

        self.air.transmit(&self.address, frame);
        debug!("{} advertised {} bytes", self.address, frame.len());

        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }
        Ok(())
    }

    async fn start_scanning(&self, sink: mpsc::UnboundedSender<RadioBlob>) -> Result<()> {
        let mut state = self.air.state.lock();
        if state.powered_off.contains(&self.address) {
            return Err(MeshError::unavailable(format!("radio {} is powered off", self.address)));
        }
        state.scanners.insert(self.address.clone(), sink);
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<()> {
        self.air.state.lock().scanners.remove(&self.address);
        Ok(())
    }
}
