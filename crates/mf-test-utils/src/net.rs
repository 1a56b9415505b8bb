//! Loopback endpoints for reachability tests.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;

/// Bind a loopback listener that accepts and immediately drops connections.
///
/// The accept loop runs until the runtime shuts down.
pub async fn spawn_listener() -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    Ok(addr)
}

/// A loopback address nothing listens on: bind, read the port, close.
pub fn refused_addr() -> std::io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    listener.local_addr()
}
