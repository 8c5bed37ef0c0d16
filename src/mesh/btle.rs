//! Bluetooth LE radio backed by `btleplug`
//!
//! `btleplug` only implements the central role, so this radio can scan for
//! mesh frames in other devices' service data but cannot advertise its own.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::protocol::SERVICE_UUID;
use super::radio::{BroadcastRadio, RadioBlob};
use crate::error::{MeshError, Result};

/// Legacy advertising leaves this much room for service data
const BLE_SERVICE_DATA_CAPACITY: usize = 31;

pub struct BtleRadio {
    adapter: Adapter,
    address: String,
    service_uuid: Uuid,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleRadio {
    /// Open the first Bluetooth adapter on this machine
    pub async fn open() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| MeshError::unavailable(format!("failed to create Bluetooth manager: {}", e)))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| MeshError::unavailable(format!("failed to list Bluetooth adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| MeshError::unavailable("no Bluetooth adapters found"))?;

        let address = adapter
            .adapter_info()
            .await
            .map_err(|e| MeshError::unavailable(e.to_string()))?;
        info!("Using Bluetooth adapter: {}", address);

        let service_uuid =
            Uuid::parse_str(SERVICE_UUID).map_err(|e| MeshError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            adapter,
            address,
            service_uuid,
            scan_task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl BroadcastRadio for BtleRadio {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn payload_capacity(&self) -> usize {
        BLE_SERVICE_DATA_CAPACITY
    }

    async fn advertise(&self, _frame: &[u8], _window: Duration) -> Result<()> {
        Err(MeshError::unavailable("btleplug cannot act as a BLE peripheral"))
    }

    async fn start_scanning(&self, sink: mpsc::UnboundedSender<RadioBlob>) -> Result<()> {
        let filter = ScanFilter {
            services: vec![self.service_uuid],
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| MeshError::unavailable(format!("failed to start BLE scan: {}", e)))?;

        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| MeshError::unavailable(e.to_string()))?;

        let adapter = self.adapter.clone();
        let service_uuid = self.service_uuid;
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::ServiceDataAdvertisement { id, service_data } = event else {
                    continue;
                };
                let Some(data) = service_data.get(&service_uuid) else {
                    continue;
                };

                let sender = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral.address().to_string(),
                    Err(_) => format!("{:?}", id),
                };
                debug!("Scanned {} bytes of mesh data from {}", data.len(), sender);

                if sink.send(RadioBlob { sender, data: data.clone() }).is_err() {
                    break;
                }
            }
            info!("BLE scan event stream ended");
        });

        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<()> {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
        Ok(())
    }
}
