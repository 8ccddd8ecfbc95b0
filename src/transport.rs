use async_trait::async_trait;

/// First handle of the waypoint notify characteristic (uuid `fff4`). Fixed by
/// the waypoint firmware's attribute table; never negotiated.
pub const WAYPOINT_NOTIFY_START_HANDLE: u16 = 45;
/// Last handle of the waypoint notify characteristic, descriptor included.
pub const WAYPOINT_NOTIFY_END_HANDLE: u16 = 48;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: Option<i8>,
    pub is_public: bool,
}

/// Everything the BLE stack reports back to the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    StateChange(String),
    Advertisement(Advertisement),
    RssiUpdate {
        address: String,
        name: String,
        rssi: i8,
    },
    Notification {
        address: String,
        data: Vec<u8>,
    },
    Connected(String),
    Disconnected(String),
}

/// Imperative side of the BLE stack.
#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn connect(&self, address: &str, is_public: bool) -> anyhow::Result<()>;

    /// Issues the subscription and returns without waiting for service
    /// discovery; later failures are reported by the transport itself.
    async fn subscribe_notify(
        &self,
        address: &str,
        enable_indication: bool,
        start_handle: u16,
        end_handle: u16,
        use_notify: bool,
        use_indicate: bool,
    ) -> anyhow::Result<()>;

    async fn start_scanning(&self, allow_duplicates: bool) -> anyhow::Result<()>;
}
