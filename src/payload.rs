//! Codec for the waypoint notify characteristic.
//!
//! Layout (little-endian):
//!
//! ```text
//! [sequence: u8][address_type: u8][rssi: i8][valid: u8][sensed address, reversed...]
//! ```

use thiserror::Error;

pub const HEADER_LEN: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {0} bytes, need at least {HEADER_LEN}")]
    ShortBuffer(usize),
    #[error("payload carries no device identity")]
    MissingIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationPayload {
    pub sequence: u8,
    pub address_type: u8,
    /// dBm as sensed by the waypoint.
    pub rssi: i8,
    pub valid: u8,
}

/// Splits a notification into its header and the (still reversed) identity
/// suffix.
pub fn decode(data: &[u8]) -> Result<(NotificationPayload, &[u8]), DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::ShortBuffer(data.len()));
    }
    let (header, suffix) = data.split_at(HEADER_LEN);
    if suffix.is_empty() {
        return Err(DecodeError::MissingIdentity);
    }

    let payload = NotificationPayload {
        sequence: header[0],
        address_type: header[1],
        rssi: i8::from_le_bytes([header[2]]),
        valid: header[3],
    };
    Ok((payload, suffix))
}

#[allow(dead_code)]
pub fn encode(payload: &NotificationPayload, suffix: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_LEN + suffix.len());
    data.push(payload.sequence);
    data.push(payload.address_type);
    data.extend_from_slice(&payload.rssi.to_le_bytes());
    data.push(payload.valid);
    data.extend_from_slice(suffix);
    data
}

/// Returns a reversed copy of `bytes`. A middle byte of an odd-length input
/// stays in place.
pub fn reverse_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut reversed = bytes.to_vec();
    reversed.reverse();
    reversed
}
