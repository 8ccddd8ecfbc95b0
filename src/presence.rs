use async_trait::async_trait;
use log::{debug, error};
use serde_derive::{Deserialize, Serialize};

/// Sink for serialized bus messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEvent {
    pub device: String,
    pub waypoint: String,
    pub rssi: i8,
    #[serde(rename = "isSphere")]
    pub is_sphere: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PresenceEvent {
    pub fn new(device: &str, name: &str, waypoint: &str, rssi: i8, is_sphere: bool) -> Self {
        PresenceEvent {
            device: device.to_uppercase(),
            waypoint: waypoint.to_string(),
            rssi,
            is_sphere,
            name: (!name.is_empty()).then(|| name.to_string()),
        }
    }
}

/// Sighting shared between driver instances over the peer relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementRelayPacket {
    pub device: String,
    pub waypoint: String,
    pub rssi: i8,
    #[serde(rename = "isSphere")]
    pub is_sphere: bool,
}

impl From<&PresenceEvent> for AdvertisementRelayPacket {
    fn from(event: &PresenceEvent) -> Self {
        AdvertisementRelayPacket {
            device: event.device.clone(),
            waypoint: event.waypoint.clone(),
            rssi: event.rssi,
            is_sphere: event.is_sphere,
        }
    }
}

impl From<AdvertisementRelayPacket> for PresenceEvent {
    fn from(packet: AdvertisementRelayPacket) -> Self {
        PresenceEvent::new(
            &packet.device,
            "",
            &packet.waypoint,
            packet.rssi,
            packet.is_sphere,
        )
    }
}

/// Publishes normalized presence events and the aggregate waypoint gauge.
/// Failures are logged and dropped.
pub struct PresenceEmitter<P> {
    publisher: P,
    presence_path: String,
    waypoint_count_topic: String,
}

impl<P: Publisher> PresenceEmitter<P> {
    pub fn new(publisher: P, presence_path: &str, waypoint_count_topic: &str) -> Self {
        PresenceEmitter {
            publisher,
            presence_path: presence_path.to_string(),
            waypoint_count_topic: waypoint_count_topic.to_string(),
        }
    }

    pub fn topic_for(&self, device: &str) -> String {
        format!("$device/{}/{}/rssi", device.to_uppercase(), self.presence_path)
    }

    pub async fn emit(
        &self,
        device: &str,
        name: &str,
        waypoint: &str,
        rssi: i8,
        is_sphere: bool,
    ) -> PresenceEvent {
        let event = PresenceEvent::new(device, name, waypoint, rssi, is_sphere);
        self.publish_event(&event).await;
        event
    }

    pub async fn publish_event(&self, event: &PresenceEvent) {
        debug!(
            ">> Device:{} Waypoint:{} Rssi: {}",
            event.device, event.waypoint, event.rssi
        );

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error serializing presence event {:?}: {}", event, err);
                return;
            }
        };

        if let Err(err) = self
            .publisher
            .publish(&self.topic_for(&event.device), payload)
            .await
        {
            error!("Error publishing presence for {}: {:?}", event.device, err);
        }
    }

    pub async fn publish_waypoint_count(&self, count: usize) {
        debug!("{count} waypoint(s) active");
        if let Err(err) = self
            .publisher
            .publish(&self.waypoint_count_topic, count.to_string().into_bytes())
            .await
        {
            error!("Error publishing waypoint count: {:?}", err);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every publish; optionally fails them all.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingPublisher {
        pub messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        pub fail: bool,
    }

    impl RecordingPublisher {
        pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
            self.messages.lock().unwrap().clone()
        }

        pub fn json(&self) -> Vec<(String, serde_json::Value)> {
            self.messages()
                .into_iter()
                .map(|(topic, payload)| (topic, serde_json::from_slice(&payload).unwrap()))
                .collect()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("broker unavailable");
            }
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
    }

    #[test]
    fn test_name_omitted_when_empty() {
        let event = PresenceEvent::new("aabbcc001122", "", "WAYPOINT", -50, false);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("name").is_none());
        assert_eq!(json["device"], "AABBCC001122");
        assert_eq!(json["isSphere"], false);
    }

    #[test]
    fn test_name_present_when_known() {
        let event = PresenceEvent::new("112233445566", "Phone", "LOCAL", -70, true);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "Phone");
        assert_eq!(json["rssi"], -70);
        assert_eq!(json["isSphere"], true);
    }

    #[test]
    fn test_relay_packet_wire_format() {
        let packet: AdvertisementRelayPacket = serde_json::from_str(
            r#"{"device":"AABB","waypoint":"CCDD","rssi":-42,"isSphere":true}"#,
        )
        .unwrap();
        assert_eq!(packet.rssi, -42);
        assert!(packet.is_sphere);

        let event = PresenceEvent::from(packet.clone());
        assert_eq!(event.name, None);
        assert_eq!(AdvertisementRelayPacket::from(&event), packet);
    }

    #[tokio::test]
    async fn test_emit_publishes_to_device_topic() {
        let publisher = RecordingPublisher::default();
        let emitter = PresenceEmitter::new(publisher.clone(), "presence", "$location/waypoints");

        emitter.emit("ab12", "Tag", "WP", -33, false).await;
        emitter.publish_waypoint_count(2).await;

        let messages = publisher.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "$device/AB12/presence/rssi");
        let body: serde_json::Value = serde_json::from_slice(&messages[0].1).unwrap();
        assert_eq!(body["name"], "Tag");
        assert_eq!(messages[1], ("$location/waypoints".to_string(), b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let publisher = RecordingPublisher {
            fail: true,
            ..Default::default()
        };
        let emitter = PresenceEmitter::new(publisher.clone(), "presence", "count");
        let event = emitter.emit("01", "", "02", -1, true).await;
        emitter.publish_waypoint_count(0).await;
        assert_eq!(event.device, "01");
        assert!(publisher.messages().is_empty());
    }
}
