use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address;
use crate::payload;
use crate::presence::{AdvertisementRelayPacket, PresenceEmitter, PresenceEvent, Publisher};
use crate::registry::WaypointRegistry;
use crate::relay::PeerRelay;
use crate::transport::{
    Advertisement, BleTransport, TransportEvent, WAYPOINT_NOTIFY_END_HANDLE,
    WAYPOINT_NOTIFY_START_HANDLE,
};

/// Routes transport events into the registry and out to the bus.
pub struct Manager<T, P> {
    transport: Arc<T>,
    registry: WaypointRegistry,
    emitter: PresenceEmitter<P>,
    relay: Option<Arc<PeerRelay>>,
    waypoint_name: String,
    local_identity: String,
}

impl<T, P> Manager<T, P>
where
    T: BleTransport + 'static,
    P: Publisher + 'static,
{
    pub fn new(
        transport: Arc<T>,
        emitter: PresenceEmitter<P>,
        relay: Option<Arc<PeerRelay>>,
        waypoint_name: String,
        local_identity: String,
    ) -> Self {
        Manager {
            transport,
            registry: WaypointRegistry::new(),
            emitter,
            relay,
            waypoint_name,
            local_identity,
        }
    }

    pub fn registry(&self) -> &WaypointRegistry {
        &self.registry
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChange(state) => info!("Client state change: {state}"),
            TransportEvent::Advertisement(advertisement) => self.on_discovered(&advertisement).await,
            TransportEvent::RssiUpdate {
                address,
                name,
                rssi,
            } => self.on_rssi_update(&address, &name, rssi).await,
            TransportEvent::Notification { address, data } => {
                self.on_notification(&address, &data).await
            }
            TransportEvent::Connected(address) => self.on_connected(&address).await,
            TransportEvent::Disconnected(address) => self.on_disconnected(&address),
        }
    }

    pub async fn on_discovered(&self, advertisement: &Advertisement) {
        debug!(
            "Discovered address:{} rssi:{:?}",
            advertisement.address, advertisement.rssi
        );

        if advertisement.local_name.as_deref() != Some(self.waypoint_name.as_str()) {
            return;
        }

        if !self.registry.claim_connect(&advertisement.address) {
            return;
        }
        debug!(
            "Connecting to waypoint {} ({} known)",
            advertisement.address,
            self.registry.len()
        );

        if let Err(err) = self
            .transport
            .connect(&advertisement.address, advertisement.is_public)
            .await
        {
            error!("Connect error for {}: {:?}", advertisement.address, err);
            self.registry.connect_failed(&advertisement.address);
        }
    }

    pub async fn on_connected(&self, address: &str) {
        if !self.registry.mark_connected(address) {
            debug!("Ignoring connection to non-waypoint {address}");
            return;
        }
        info!("Connected to waypoint: {address}");

        if let Err(err) = self
            .transport
            .subscribe_notify(
                address,
                true,
                WAYPOINT_NOTIFY_START_HANDLE,
                WAYPOINT_NOTIFY_END_HANDLE,
                true,
                false,
            )
            .await
        {
            error!("Failed to enable notifications on {address}: {:?}", err);
        }
    }

    pub fn on_disconnected(&self, address: &str) {
        if self.registry.mark_disconnected(address) {
            info!("Disconnected from waypoint: {address}");
        } else {
            debug!("Disconnected from inactive device {address}");
        }
    }

    pub async fn on_rssi_update(&self, address: &str, name: &str, rssi: i8) {
        let event = self
            .emitter
            .emit(
                &address::normalize(address),
                name,
                &self.local_identity,
                rssi,
                true,
            )
            .await;
        self.relay_sighting(&event).await;
    }

    pub async fn on_notification(&self, address: &str, data: &[u8]) {
        let (payload, suffix) = match payload::decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!("Failed to read waypoint payload from {address}: {err}");
                return;
            }
        };
        debug!(
            "Waypoint {address} notification seq:{} valid:{}",
            payload.sequence, payload.valid
        );

        let device = address::to_hex(&payload::reverse_bytes(suffix));
        let event = self
            .emitter
            .emit(&device, "", &address::normalize(address), payload.rssi, false)
            .await;
        self.relay_sighting(&event).await;
    }

    /// Republishes a sighting pooled by another instance.
    pub async fn on_relay_packet(&self, packet: AdvertisementRelayPacket) {
        if packet.waypoint == self.local_identity || self.registry.is_active(&packet.waypoint) {
            debug!("Skipping own sighting of {} from relay", packet.device);
            return;
        }
        self.emitter.publish_event(&PresenceEvent::from(packet)).await;
    }

    async fn relay_sighting(&self, event: &PresenceEvent) {
        if let Some(relay) = &self.relay {
            if let Err(err) = relay.send(&AdvertisementRelayPacket::from(event)).await {
                warn!("Error relaying sighting of {}: {}", event.device, err);
            }
        }
    }

    /// Publishes the current number of active waypoints.
    pub async fn report_liveness(&self) -> usize {
        let count = self.registry.active_count();
        self.emitter.publish_waypoint_count(count).await;
        count
    }

    pub fn spawn_liveness(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.report_liveness().await;
            }
        })
    }

    pub async fn start(&self, allow_duplicates: bool) -> anyhow::Result<()> {
        self.transport
            .start_scanning(allow_duplicates)
            .await
            .context("Failed to start scanning")
    }

    pub async fn run_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut relay_packets: mpsc::Receiver<AdvertisementRelayPacket>,
    ) {
        loop {
            tokio::select! {
                Some(packet) = relay_packets.recv() => {
                    self.on_relay_packet(packet).await;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("No more transport events");
                            break;
                        }
                    }
                }
            }
        }
    }
}
