//! Connectionless relay that pools sightings between driver instances.
//!
//! Every datagram is one JSON-encoded [`AdvertisementRelayPacket`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use log::{debug, error, info};
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::config::RelayConfig;
use crate::presence::AdvertisementRelayPacket;

const MAX_DATAGRAM: usize = 512;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay socket error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid relay packet: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not resolve relay destination {0}")]
    Unresolved(String),
}

pub struct PeerRelay {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl PeerRelay {
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let destination = tokio::net::lookup_host(config.destination())
            .await?
            .next()
            .ok_or_else(|| RelayError::Unresolved(config.destination().to_string()))?;

        let socket = UdpSocket::bind(config.bind()).await?;

        if config.join_multicast {
            if let SocketAddr::V4(group) = destination {
                if group.ip().is_multicast() {
                    socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;
                    info!("ble mesh: joined multicast group {}", group.ip());
                }
            }
        }

        info!(
            "ble mesh: listening on {}, sending to {}",
            socket.local_addr()?,
            destination
        );
        Ok(PeerRelay {
            socket,
            destination,
        })
    }

    pub async fn send(&self, packet: &AdvertisementRelayPacket) -> Result<(), RelayError> {
        let payload = serde_json::to_vec(packet)?;
        self.socket.send_to(&payload, self.destination).await?;
        Ok(())
    }

    /// Receives datagrams forever, handing each well-formed packet to
    /// `on_packet`. Bad datagrams are logged and skipped.
    pub async fn run<F>(&self, mut on_packet: F)
    where
        F: FnMut(AdvertisementRelayPacket) + Send,
    {
        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    info!("ble mesh: receive error: {err}");
                    continue;
                }
            };

            match parse(&buffer[..len]) {
                Ok(packet) => {
                    debug!("ble mesh: packet from {from}: {packet:?}");
                    on_packet(packet);
                }
                Err(err) => error!("ble mesh: {len} byte datagram from {from}: {err}"),
            }
        }
    }
}

fn parse(datagram: &[u8]) -> Result<AdvertisementRelayPacket, RelayError> {
    Ok(serde_json::from_slice(datagram)?)
}
