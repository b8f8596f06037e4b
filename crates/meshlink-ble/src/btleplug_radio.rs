//! Central-role radio backed by btleplug
//!
//! btleplug only drives the central role, so the server role reports
//! `Unsupported` and MTU negotiation falls back to the configured fragment
//! size.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use meshlink_core::errors::TransportError;
use meshlink_core::MeshResult;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::discovery::{Advertisement, RX_CHARACTERISTIC_UUID, SERVICE_UUID, TX_CHARACTERISTIC_UUID};
use crate::error::BleError;
use crate::radio::Radio;

// ----------------------------------------------------------------------------
// Btleplug Radio
// ----------------------------------------------------------------------------

/// [`Radio`] over the host's first BLE adapter
#[derive(Debug, Clone)]
pub struct BtleplugRadio {
    adapter: Adapter,
}

impl BtleplugRadio {
    /// Open the first adapter the platform reports
    pub async fn first_adapter() -> MeshResult<Self> {
        let manager = Manager::new().await.map_err(BleError::from)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(BleError::from)?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotAvailable)?;
        info!("BLE adapter initialized");
        Ok(Self { adapter })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for MeshLink service data for `duration`
    pub async fn scan(&self, duration: Duration) -> MeshResult<Vec<Advertisement<Peripheral>>> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleError::EventStreamFailed(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(BleError::from)?;
        debug!("Scanning for {:?}", duration);

        let mut seen: HashMap<String, Advertisement<Peripheral>> = HashMap::new();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => {
                    let Some(event) = event else { break };
                    if let CentralEvent::ServiceDataAdvertisement { id, service_data } = event {
                        let peripheral = match self.adapter.peripheral(&id).await {
                            Ok(peripheral) => peripheral,
                            Err(e) => {
                                trace!("Ignoring advertisement from {:?}: {}", id, e);
                                continue;
                            }
                        };
                        let rssi = peripheral
                            .properties()
                            .await
                            .ok()
                            .flatten()
                            .and_then(|p| p.rssi);
                        let mut advertisement = Advertisement::new(peripheral);
                        advertisement.service_data.extend(service_data);
                        advertisement.rssi = rssi;
                        seen.insert(format!("{:?}", id), advertisement);
                    }
                }
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
        Ok(seen.into_values().collect())
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, BleError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleError::CharacteristicNotFound {
                characteristic: uuid.to_string(),
            })
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    type Device = Peripheral;
    type Link = Peripheral;

    async fn connect(&self, device: &Peripheral, reverse: bool) -> MeshResult<Peripheral> {
        if reverse {
            trace!("Central-only radio dials reverse connections itself");
        }
        device.connect().await.map_err(BleError::from)?;
        device
            .discover_services()
            .await
            .map_err(|e| BleError::ServiceDiscoveryFailed(e.to_string()))?;
        Ok(device.clone())
    }

    async fn disconnect(&self, link: &Peripheral) -> MeshResult<()> {
        link.disconnect().await.map_err(BleError::from)?;
        Ok(())
    }

    async fn write(&self, link: &Peripheral, chunk: &[u8]) -> MeshResult<()> {
        let tx = Self::characteristic(link, TX_CHARACTERISTIC_UUID)?;
        link.write(&tx, chunk, WriteType::WithoutResponse)
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, link: &Peripheral) -> MeshResult<BoxStream<'static, Vec<u8>>> {
        let rx = Self::characteristic(link, RX_CHARACTERISTIC_UUID)?;
        link.subscribe(&rx)
            .await
            .map_err(|e| BleError::SubscriptionFailed(e.to_string()))?;
        let notifications = link
            .notifications()
            .await
            .map_err(|e| BleError::EventStreamFailed(e.to_string()))?;
        Ok(notifications
            .filter_map(|n| async move { (n.uuid == RX_CHARACTERISTIC_UUID).then_some(n.value) })
            .boxed())
    }

    async fn request_mtu(&self, _link: &Peripheral, _mtu: usize) -> MeshResult<usize> {
        Err(TransportError::Unsupported {
            feature: "mtu negotiation",
        }
        .into())
    }

    async fn reset_link_parameters(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn start_server(&self) -> MeshResult<()> {
        Err(TransportError::Unsupported {
            feature: "peripheral role",
        }
        .into())
    }

    async fn stop_server(&self) -> MeshResult<()> {
        Err(TransportError::Unsupported {
            feature: "peripheral role",
        }
        .into())
    }
}
