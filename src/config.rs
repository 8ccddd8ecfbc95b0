use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

/// Advertised local name of the waypoint beacons.
pub const DEFAULT_WAYPOINT_NAME: &str = "NinjaSphereWaypoint";

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub waypoint: Option<WaypointConfig>,
    pub relay: Option<RelayConfig>,
}

impl AppConfig {
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(contents)
    }

    pub fn waypoint(&self) -> WaypointConfig {
        self.waypoint.clone().unwrap_or_default()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    /// Topic segment between the device id and the trailing `rssi`.
    pub presence_path: Option<String>,
    pub waypoint_count_topic: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct WaypointConfig {
    pub name: Option<String>,
    /// Skips the `hciconfig` lookup when set.
    pub local_mac: Option<MacAddress>,
    pub liveness_interval_ms: Option<u64>,
    pub allow_duplicates: Option<bool>,
}

impl WaypointConfig {
    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| DEFAULT_WAYPOINT_NAME.to_string())
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.unwrap_or(1000))
    }

    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates.unwrap_or(true)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bind: Option<String>,
    pub destination: Option<String>,
    /// Join the destination as a multicast group instead of treating it as a
    /// plain UDP endpoint.
    #[serde(default)]
    pub join_multicast: bool,
}

impl RelayConfig {
    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or("0.0.0.0:12345")
    }

    pub fn destination(&self) -> &str {
        self.destination.as_deref().unwrap_or("239.255.12.34:12345")
    }
}
