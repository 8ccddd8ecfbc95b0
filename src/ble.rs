use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    AddressType, Central as _, CentralEvent, CentralState, CharPropFlags, Peripheral as _,
    PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::{Stream, StreamExt as _};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address;
use crate::transport::{Advertisement, BleTransport, TransportEvent};

/// Short uuid of the characteristic living at the waypoint notify handles.
const WAYPOINT_NOTIFY_UUID: u16 = 0xfff4;

pub type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Adapter event with its peripheral resolved to a normalized address.
enum AdapterEvent {
    Sighting {
        address: String,
        properties: PeripheralProperties,
    },
    Connected(String),
    Disconnected(String),
    State(CentralState),
}

fn translate(event: AdapterEvent) -> Vec<TransportEvent> {
    match event {
        AdapterEvent::Sighting {
            address,
            properties,
        } => {
            let rssi = properties
                .rssi
                .map(|rssi| rssi.clamp(i8::MIN.into(), i8::MAX.into()) as i8);
            let is_public = matches!(properties.address_type, Some(AddressType::Public));

            let mut events = vec![TransportEvent::Advertisement(Advertisement {
                address: address.clone(),
                local_name: properties.local_name.clone(),
                rssi,
                is_public,
            })];
            if let Some(rssi) = rssi {
                events.push(TransportEvent::RssiUpdate {
                    address,
                    name: properties.local_name.unwrap_or_default(),
                    rssi,
                });
            }
            events
        }
        AdapterEvent::Connected(address) => vec![TransportEvent::Connected(address)],
        AdapterEvent::Disconnected(address) => vec![TransportEvent::Disconnected(address)],
        AdapterEvent::State(state) => vec![TransportEvent::StateChange(format!("{state:?}"))],
    }
}

type NotificationPumps = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// `BleTransport` over the host Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    notification_pumps: NotificationPumps,
    events: mpsc::Sender<TransportEvent>,
}

impl BtleplugTransport {
    pub fn new(adapter: Adapter) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(256);
        let transport = BtleplugTransport {
            adapter,
            notification_pumps: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (Arc::new(transport), rx)
    }

    /// Subscribes to adapter events. Call before scanning starts so that no
    /// discovery is missed.
    pub async fn central_events(&self) -> anyhow::Result<CentralEvents> {
        Ok(self.adapter.events().await?)
    }

    async fn address_of(&self, id: &PeripheralId) -> anyhow::Result<String> {
        let peripheral = self.adapter.peripheral(id).await?;
        Ok(address::normalize(&peripheral.address().to_string()))
    }

    /// Looks the peripheral up in the adapter's own table; nothing is cached
    /// here.
    async fn find_peripheral(&self, address: &str) -> anyhow::Result<Peripheral> {
        let wanted = address::normalize(address);
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| address::normalize(&p.address().to_string()) == wanted)
            .ok_or_else(|| anyhow!("unknown peripheral {address}"))
    }

    async fn resolve(&self, event: CentralEvent) -> anyhow::Result<Option<AdapterEvent>> {
        let resolved = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = self.adapter.peripheral(&id).await?;
                let Some(properties) = peripheral.properties().await? else {
                    return Ok(None);
                };
                AdapterEvent::Sighting {
                    address: address::normalize(&peripheral.address().to_string()),
                    properties,
                }
            }
            CentralEvent::DeviceConnected(id) => AdapterEvent::Connected(self.address_of(&id).await?),
            CentralEvent::DeviceDisconnected(id) => {
                AdapterEvent::Disconnected(self.address_of(&id).await?)
            }
            CentralEvent::StateUpdate(state) => AdapterEvent::State(state),
            _ => return Ok(None),
        };
        Ok(Some(resolved))
    }

    /// Forwards adapter events until the adapter stream or the driver goes
    /// away.
    pub async fn run(self: Arc<Self>, mut central_events: CentralEvents) -> anyhow::Result<()> {
        let adapter_info = self.adapter.adapter_info().await?;
        let ready = TransportEvent::StateChange(format!("{adapter_info} ready"));
        if self.events.send(ready).await.is_err() {
            return Ok(());
        }

        while let Some(event) = central_events.next().await {
            let resolved = match self.resolve(event).await {
                Ok(Some(resolved)) => resolved,
                Ok(None) => continue,
                Err(err) => {
                    debug!("Error resolving adapter event: {:?}", err);
                    continue;
                }
            };

            for event in translate(resolved) {
                if self.events.send(event).await.is_err() {
                    debug!("Transport event receiver closed");
                    return Ok(());
                }
            }
        }

        info!("No more adapter events");
        Ok(())
    }
}

async fn enable_notifications(
    peripheral: Peripheral,
    address: String,
    wanted: CharPropFlags,
    pumps: NotificationPumps,
    tx: mpsc::Sender<TransportEvent>,
) -> anyhow::Result<()> {
    peripheral
        .discover_services()
        .await
        .context("service discovery failed")?;

    // btleplug does not expose attribute handles; the characteristic is
    // found by the uuid the firmware places in that handle range.
    let uuid = uuid_from_u16(WAYPOINT_NOTIFY_UUID);
    let characteristic = peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| anyhow!("no characteristic {uuid}"))?;
    if !characteristic.properties.contains(wanted) {
        anyhow::bail!("characteristic {uuid} does not support {:?}", wanted);
    }

    peripheral.subscribe(&characteristic).await?;
    let mut notifications = peripheral.notifications().await?;

    let pump = tokio::spawn({
        let address = address.clone();
        async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                let event = TransportEvent::Notification {
                    address: address.clone(),
                    data: notification.value,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    });

    if let Ok(mut pumps) = pumps.lock() {
        if let Some(previous) = pumps.insert(address, pump) {
            previous.abort();
        }
    }
    Ok(())
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(&self, address: &str, is_public: bool) -> anyhow::Result<()> {
        let peripheral = self.find_peripheral(address).await?;
        debug!("Connecting to {address} (public address: {is_public})");

        let tx = self.events.clone();
        let address = address.to_string();
        // The connect call resolves once the link is up; the adapter reports
        // that through `DeviceConnected`, so only failures are surfaced here.
        tokio::spawn(async move {
            if let Err(err) = peripheral.connect().await {
                warn!("Connect error for {address}: {err}");
                let _ = tx.send(TransportEvent::Disconnected(address)).await;
            }
        });
        Ok(())
    }

    async fn subscribe_notify(
        &self,
        address: &str,
        enable_indication: bool,
        start_handle: u16,
        end_handle: u16,
        use_notify: bool,
        use_indicate: bool,
    ) -> anyhow::Result<()> {
        let wanted = match (use_notify, use_indicate) {
            (true, _) => CharPropFlags::NOTIFY,
            (false, true) => CharPropFlags::INDICATE,
            (false, false) => anyhow::bail!("neither notify nor indicate requested"),
        };
        let peripheral = self.find_peripheral(address).await?;
        debug!(
            "Subscribing on {address} (handles {start_handle}..={end_handle}, indication: {enable_indication})"
        );

        // Service discovery can take seconds; it runs off the dispatch path.
        let address = address::normalize(address);
        let pumps = Arc::clone(&self.notification_pumps);
        let tx = self.events.clone();
        tokio::spawn(async move {
            if let Err(err) =
                enable_notifications(peripheral, address.clone(), wanted, pumps, tx).await
            {
                warn!("Failed to enable notifications on {address}: {:?}", err);
            }
        });
        Ok(())
    }

    async fn start_scanning(&self, allow_duplicates: bool) -> anyhow::Result<()> {
        if !allow_duplicates {
            // bluez always reports duplicates as `DeviceUpdated`.
            warn!("Duplicate filtering is not supported by this adapter; scanning with duplicates");
        }
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(name: Option<&str>, rssi: Option<i16>, public: bool) -> PeripheralProperties {
        PeripheralProperties {
            local_name: name.map(str::to_string),
            rssi,
            address_type: Some(if public {
                AddressType::Public
            } else {
                AddressType::Random
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_sighting_with_rssi() {
        let events = translate(AdapterEvent::Sighting {
            address: "AABBCCDDEEFF".to_string(),
            properties: properties(Some("NinjaSphereWaypoint"), Some(-60), true),
        });
        assert_eq!(
            events,
            vec![
                TransportEvent::Advertisement(Advertisement {
                    address: "AABBCCDDEEFF".to_string(),
                    local_name: Some("NinjaSphereWaypoint".to_string()),
                    rssi: Some(-60),
                    is_public: true,
                }),
                TransportEvent::RssiUpdate {
                    address: "AABBCCDDEEFF".to_string(),
                    name: "NinjaSphereWaypoint".to_string(),
                    rssi: -60,
                },
            ]
        );
    }

    #[test]
    fn test_sighting_without_rssi() {
        let events = translate(AdapterEvent::Sighting {
            address: "112233445566".to_string(),
            properties: properties(None, None, false),
        });
        assert_eq!(
            events,
            vec![TransportEvent::Advertisement(Advertisement {
                address: "112233445566".to_string(),
                local_name: None,
                rssi: None,
                is_public: false,
            })]
        );
    }

    #[test]
    fn test_rssi_is_clamped() {
        let events = translate(AdapterEvent::Sighting {
            address: "01".to_string(),
            properties: properties(None, Some(-300), false),
        });
        assert!(matches!(
            events[1],
            TransportEvent::RssiUpdate { rssi: -128, .. }
        ));
    }

    #[test]
    fn test_link_and_state_events() {
        assert_eq!(
            translate(AdapterEvent::Connected("AABBCCDDEEFF".to_string())),
            vec![TransportEvent::Connected("AABBCCDDEEFF".to_string())]
        );
        assert_eq!(
            translate(AdapterEvent::Disconnected("AABBCCDDEEFF".to_string())),
            vec![TransportEvent::Disconnected("AABBCCDDEEFF".to_string())]
        );
        assert_eq!(
            translate(AdapterEvent::State(CentralState::PoweredOff)),
            vec![TransportEvent::StateChange("PoweredOff".to_string())]
        );
        assert_eq!(
            translate(AdapterEvent::State(CentralState::PoweredOn)),
            vec![TransportEvent::StateChange("PoweredOn".to_string())]
        );
    }
}
