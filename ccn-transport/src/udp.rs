//! Datagram sockets.
//!
//! One non-blocking socket per address family, bound to the wildcard
//! address for the configured port. A family that cannot be bound is
//! logged and skipped.

use std::io;

use log::{info, warn};
use tokio::net::UdpSocket;

/// Bind datagram sockets for `port` on every available family.
pub async fn bind_datagram_sockets(port: u16) -> io::Result<Vec<UdpSocket>> {
    let mut sockets = Vec::new();
    for addr in [
        format!("0.0.0.0:{port}"),
        format!("[::]:{port}"),
    ] {
        match UdpSocket::bind(&addr).await {
            Ok(sock) => {
                info!("datagram socket bound on {addr}");
                sockets.push(sock);
            }
            Err(e) => warn!("could not bind datagram socket on {addr}: {e}"),
        }
    }
    Ok(sockets)
}
