use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use crate::address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Clone, Debug)]
pub struct WaypointDevice {
    pub address: String,
    pub connection_state: ConnectionState,
    pub is_active: bool,
}

impl WaypointDevice {
    fn new(address: String) -> Self {
        WaypointDevice {
            address,
            connection_state: ConnectionState::Discovered,
            is_active: false,
        }
    }
}

/// Liveness cache of waypoint devices keyed by normalized address.
///
/// The lock is held for map lookups and updates only; callers perform any
/// transport or bus I/O after the call returns.
#[derive(Debug, Default)]
pub struct WaypointRegistry {
    devices: Mutex<HashMap<String, WaypointDevice>>,
}

impl WaypointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_devices<R>(&self, f: impl FnOnce(&mut HashMap<String, WaypointDevice>) -> R) -> R {
        let mut devices = match self.devices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut devices)
    }

    /// Records a sighting of a waypoint and decides whether a connect request
    /// should be issued. Returns false while a connection is in flight or
    /// established.
    pub fn claim_connect(&self, address: &str) -> bool {
        let key = address::normalize(address);
        self.with_devices(|devices| {
            let device = devices
                .entry(key.clone())
                .or_insert_with(|| WaypointDevice::new(key));

            match device.connection_state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!("Waypoint {} already {:?}", device.address, device.connection_state);
                    false
                }
                ConnectionState::Discovered | ConnectionState::Disconnected => {
                    device.connection_state = ConnectionState::Connecting;
                    true
                }
            }
        })
    }

    /// Releases a claim whose connect request failed.
    pub fn connect_failed(&self, address: &str) {
        let key = address::normalize(address);
        self.with_devices(|devices| {
            if let Some(device) = devices.get_mut(&key) {
                if device.connection_state == ConnectionState::Connecting {
                    device.connection_state = ConnectionState::Disconnected;
                }
            }
        });
    }

    /// Marks a waypoint connected. Returns false for addresses that were never
    /// discovered as waypoints.
    pub fn mark_connected(&self, address: &str) -> bool {
        let key = address::normalize(address);
        self.with_devices(|devices| match devices.get_mut(&key) {
            Some(device) => {
                device.connection_state = ConnectionState::Connected;
                device.is_active = true;
                true
            }
            None => false,
        })
    }

    /// Marks a waypoint inactive, keeping its entry. Returns whether it was
    /// active before.
    pub fn mark_disconnected(&self, address: &str) -> bool {
        let key = address::normalize(address);
        self.with_devices(|devices| match devices.get_mut(&key) {
            Some(device) => {
                let was_active = device.is_active;
                device.connection_state = ConnectionState::Disconnected;
                device.is_active = false;
                was_active
            }
            None => false,
        })
    }

    pub fn is_active(&self, address: &str) -> bool {
        let key = address::normalize(address);
        self.with_devices(|devices| devices.get(&key).is_some_and(|d| d.is_active))
    }

    #[allow(dead_code)]
    pub fn get(&self, address: &str) -> Option<WaypointDevice> {
        let key = address::normalize(address);
        self.with_devices(|devices| devices.get(&key).cloned())
    }

    pub fn active_count(&self) -> usize {
        self.with_devices(|devices| devices.values().filter(|d| d.is_active).count())
    }

    pub fn len(&self) -> usize {
        self.with_devices(|devices| devices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_disconnect() {
        let registry = WaypointRegistry::new();

        assert!(registry.claim_connect("aa:bb:cc:dd:ee:ff"));
        assert_eq!(
            registry.get("AABBCCDDEEFF").unwrap().connection_state,
            ConnectionState::Connecting
        );

        // Same device under a different spelling while connecting
        assert!(!registry.claim_connect("AA:BB:CC:DD:EE:FF"));

        assert!(registry.mark_connected("AA:BB:CC:DD:EE:FF"));
        assert!(registry.is_active("aabbccddeeff"));
        assert!(!registry.claim_connect("AA:BB:CC:DD:EE:FF"));

        assert!(registry.mark_disconnected("AA:BB:CC:DD:EE:FF"));
        let device = registry.get("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(device.connection_state, ConnectionState::Disconnected);
        assert!(!device.is_active);

        assert!(registry.claim_connect("AA:BB:CC:DD:EE:FF"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_connect_failed_allows_retry() {
        let registry = WaypointRegistry::new();
        assert!(registry.claim_connect("11:22:33:44:55:66"));
        registry.connect_failed("11:22:33:44:55:66");
        assert_eq!(
            registry.get("112233445566").unwrap().connection_state,
            ConnectionState::Disconnected
        );
        assert!(registry.claim_connect("11:22:33:44:55:66"));
    }

    #[test]
    fn test_unknown_addresses_are_ignored() {
        let registry = WaypointRegistry::new();
        assert!(!registry.mark_connected("01:02:03:04:05:06"));
        assert!(!registry.mark_disconnected("01:02:03:04:05:06"));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_active_count_tracks_connect_and_disconnect() {
        let registry = WaypointRegistry::new();
        let addresses = ["00:00:00:00:00:01", "00:00:00:00:00:02", "00:00:00:00:00:03"];
        for address in addresses {
            assert!(registry.claim_connect(address));
        }
        assert_eq!(registry.active_count(), 0);

        for address in addresses {
            registry.mark_connected(address);
        }
        assert_eq!(registry.active_count(), 3);

        registry.mark_disconnected(addresses[1]);
        assert_eq!(registry.active_count(), 2);

        // Disconnecting twice changes nothing
        assert!(!registry.mark_disconnected(addresses[1]));
        assert_eq!(registry.active_count(), 2);

        assert!(registry.claim_connect(addresses[1]));
        registry.mark_connected(addresses[1]);
        registry.mark_disconnected(addresses[0]);
        registry.mark_disconnected(addresses[2]);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.len(), 3);
    }
}
