use log::{debug, error, info};
use mac_address::MacAddress;
use tokio::process::Command;

/// Canonical form of a hardware address: upper-case hex, no separators.
pub fn normalize(address: &str) -> String {
    address
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Finds the first MAC address in `hciconfig`-style output.
fn scan_for_mac(output: &str) -> Option<MacAddress> {
    output
        .split_whitespace()
        .find_map(|token| token.parse::<MacAddress>().ok())
}

/// Resolves the identity used to tag sightings made by this host.
///
/// Returns an empty string when the lookup fails; scanning continues without
/// a waypoint identity.
pub async fn local_identity(configured: Option<MacAddress>) -> String {
    if let Some(mac) = configured {
        return to_hex(&mac.bytes());
    }

    let output = match Command::new("hciconfig").output().await {
        Ok(output) => output,
        Err(err) => {
            error!("Error running hciconfig: {err}");
            return String::new();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!("hciconfig output: {stdout}");

    match scan_for_mac(&stdout) {
        Some(mac) => {
            let identity = to_hex(&mac.bytes());
            info!("The local mac is {identity}");
            identity
        }
        None => {
            error!("No hardware address found in hciconfig output");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("aa:bb:cc:dd:ee:ff"), "AABBCCDDEEFF");
        assert_eq!(normalize("11-22-33-44-55-66"), "112233445566");
        assert_eq!(normalize("AABBCCDDEEFF"), "AABBCCDDEEFF");
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x0a, 0xff, 0x00]), "0AFF00");
        assert_eq!(to_hex(&[]), "");
    }

    #[test]
    fn test_scan_for_mac() {
        let output = "hci0:\tType: Primary  Bus: USB\n\tBD Address: 00:1A:7D:DA:71:13  ACL MTU: 310:10  SCO MTU: 64:8\n\tUP RUNNING\n";
        let mac = scan_for_mac(output).unwrap();
        assert_eq!(to_hex(&mac.bytes()), "001A7DDA7113");

        assert!(scan_for_mac("Can't get device info: No such device").is_none());
    }

    #[tokio::test]
    async fn test_configured_identity_skips_lookup() {
        let mac: MacAddress = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(local_identity(Some(mac)).await, "AABBCC001122");
    }
}
