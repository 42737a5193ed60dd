//! Per-connection protocol state machine.
//!
//! Drives one accepted TCP stream through header decode, request decode,
//! optional SOCKS4a resolution, a remote connect attempt, a single reply,
//! and (on success) the bidirectional relay. At most one reply frame is
//! ever written, and both sockets are always closed before this function
//! returns.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{REQUEST_TIMEOUT, TRANSFER_TIMEOUT};
use crate::error::Socks4Error;
use crate::relay;
use crate::resolver;
use crate::socks4::{Command, RawHeader, Reply, Request};

/// Handle one accepted connection end-to-end. Never returns an error: every
/// failure is logged here and mapped to either a `0x5B` reply or a silent
/// close, per the error taxonomy's reporting policy.
///
/// `shutdown` is raced against the handshake and, separately, against the
/// relay: when the server-level shutdown broadcast closes, whichever
/// stage is in flight resolves with [`Socks4Error::Cancelled`] instead of
/// being aborted out from under itself, so this function always runs its
/// own teardown (dropping `stream`/`remote`, closing both sockets).
#[tracing::instrument(skip(stream, shutdown), fields(peer = %peer_addr))]
pub async fn handle(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    let outcome = tokio::select! {
        biased;
        _ = shutdown.recv() => Err(Socks4Error::Cancelled),
        result = tokio::time::timeout(REQUEST_TIMEOUT, handshake(&mut stream)) => match result {
            Ok(inner) => inner,
            Err(_) => Err(Socks4Error::Timeout),
        },
    };

    match outcome {
        Ok(Outcome::Tunnel { mut remote }) => {
            debug!("entering tunnel phase");
            let relay_result = tokio::select! {
                biased;
                _ = shutdown.recv() => Err(Socks4Error::Cancelled),
                result = relay::relay(&mut stream, &mut remote, TRANSFER_TIMEOUT) => result,
            };
            match relay_result {
                Ok(()) => debug!("relay finished"),
                Err(Socks4Error::Cancelled) => debug!("cancelled mid-relay, closing"),
                Err(e) => warn!("relay ended: {e}"),
            }
        }
        Ok(Outcome::Rejected) => {
            debug!("request rejected, connection closed");
        }
        Err(Socks4Error::Cancelled) => {
            debug!("cancelled before handshake completed, closing");
        }
        Err(Socks4Error::Timeout) => {
            warn!("handshake timed out after {:?}", REQUEST_TIMEOUT);
        }
        Err(e) => {
            warn!("handshake failed: {e}");
        }
    }
}

enum Outcome {
    /// The request was granted; the handshake reply has already been
    /// written and `remote` is ready for the relay phase.
    Tunnel { remote: TcpStream },
    /// The request was rejected and (where required) a `0x5B` reply was
    /// already written; there is nothing left to do but close.
    Rejected,
}

/// Everything through "the reply send", run under the single request
/// deadline. `Io`/`Timeout`/`Cancelled` here have no reply written yet and
/// are reported back to the caller to be logged and closed silently.
async fn handshake(stream: &mut TcpStream) -> Result<Outcome, Socks4Error> {
    let header = RawHeader::read_from(stream).await?;
    let command = match header.validate() {
        Ok(command) => command,
        Err(e) => return Err(fail(stream, header.port, header.ip, e).await),
    };

    let request = match Request::read_trailers(stream, command, &header).await {
        Ok(request) => request,
        Err(e) => return Err(fail(stream, header.port, header.ip, e).await),
    };

    if request.command != Command::Connect {
        // BIND is recognized but never implemented; always rejected.
        return Err(fail(stream, request.port, request.ip, Socks4Error::BadCommand).await);
    }

    let destination_ip = if let Some(domain) = &request.domain {
        match resolver::resolve(domain).await {
            Ok(ip) => ip,
            Err(e) => return Err(fail(stream, request.port, request.ip, e).await),
        }
    } else {
        request.ip
    };

    let remote_addr = SocketAddr::V4(SocketAddrV4::new(destination_ip, request.port));
    let remote = match TcpStream::connect(remote_addr).await {
        Ok(remote) => remote,
        Err(_) => {
            return Err(fail(stream, request.port, request.ip, Socks4Error::ConnectFailed).await)
        }
    };

    // Echo the resolved destination, not the SOCKS4a `0.0.0.x` marker
    // that was actually on the wire; rejection replies still echo the
    // request as received, but a granted reply reports where the tunnel
    // actually goes.
    let reply = Reply::granted(request.port, destination_ip);
    if let Err(e) = reply.write_to(stream).await {
        return Err(Socks4Error::Io(e));
    }
    info!(dest = %remote_addr, "connection established");
    Ok(Outcome::Tunnel { remote })
}

/// Hoists the reject-vs-silent-close decision onto
/// [`Socks4Error::reportable`]: sends a `0x5B` reply echoing `port`/`ip`
/// when `err` is one of the kinds the wire protocol requires a reply for,
/// then returns `err` unchanged so the caller can just `return Err(...)`.
async fn fail(stream: &mut TcpStream, port: u16, ip: Ipv4Addr, err: Socks4Error) -> Socks4Error {
    if err.reportable() {
        reject(stream, port, ip).await;
    }
    err
}

/// Write a `0x5B` reply echoing `port`/`ip`, logging (not propagating) any
/// I/O error: a failure to write the rejection doesn't change the outcome,
/// the connection is closing either way.
async fn reject(stream: &mut TcpStream, port: u16, ip: Ipv4Addr) {
    let reply = Reply::rejected(port, ip);
    if let Err(e) = reply.write_to(stream).await {
        debug!("failed to write rejection reply: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn loopback_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn connect_to_a_live_server_is_granted_and_relays() {
        let (echo_listener, echo_addr) = loopback_listener().await;
        tokio::spawn(async move {
            let (mut sock, _) = echo_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let (client_listener, client_addr) = loopback_listener().await;
        let server_task = tokio::spawn(async move {
            let (sock, peer) = client_listener.accept().await.unwrap();
            let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            handle(sock, peer, shutdown_rx).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let req_port = echo_addr.port();
        let mut req = vec![4, 1];
        req.extend_from_slice(&req_port.to_be_bytes());
        req.extend_from_slice(&[127, 0, 0, 1]);
        req.push(0);
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5A);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn socks4a_granted_reply_echoes_the_resolved_address_not_the_marker() {
        let (echo_listener, echo_addr) = loopback_listener().await;
        tokio::spawn(async move {
            let _ = echo_listener.accept().await;
        });

        let (client_listener, client_addr) = loopback_listener().await;
        let server_task = tokio::spawn(async move {
            let (sock, peer) = client_listener.accept().await.unwrap();
            let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            handle(sock, peer, shutdown_rx).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let mut req = vec![4, 1];
        req.extend_from_slice(&echo_addr.port().to_be_bytes());
        req.extend_from_slice(&[0, 0, 0, 1]); // SOCKS4a marker, not the real address
        req.push(0); // empty userid
        req.extend_from_slice(b"localhost");
        req.push(0);
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5A);
        // Resolved to loopback, not the `0.0.0.1` marker that was on the wire.
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        drop(client);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_a_dead_port_is_rejected() {
        let (client_listener, client_addr) = loopback_listener().await;
        // Reserve and immediately release a port so nothing answers there.
        let (dead_listener, dead_addr) = loopback_listener().await;
        drop(dead_listener);

        let server_task = tokio::spawn(async move {
            let (sock, peer) = client_listener.accept().await.unwrap();
            let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            handle(sock, peer, shutdown_rx).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let mut req = vec![4, 1];
        req.extend_from_slice(&dead_addr.port().to_be_bytes());
        req.extend_from_slice(&[127, 0, 0, 1]);
        req.push(0);
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5B);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn bind_command_is_always_rejected() {
        let (client_listener, client_addr) = loopback_listener().await;
        let server_task = tokio::spawn(async move {
            let (sock, peer) = client_listener.accept().await.unwrap();
            let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            handle(sock, peer, shutdown_rx).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let mut req = vec![4, 2, 0, 80, 127, 0, 0, 1];
        req.push(0);
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5B);
        assert_eq!(&reply[2..4], &[0, 80]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn bad_version_echoes_the_original_port_and_ip() {
        let (client_listener, client_addr) = loopback_listener().await;
        let server_task = tokio::spawn(async move {
            let (sock, peer) = client_listener.accept().await.unwrap();
            let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            handle(sock, peer, shutdown_rx).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        let req = vec![5, 1, 0x00, 0x50, 127, 0, 0, 1, 0];
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5B);
        assert_eq!(&reply[2..4], &[0x00, 0x50]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_broadcast_cancels_a_pending_handshake_without_a_reply() {
        let (client_listener, client_addr) = loopback_listener().await;
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let server_task = tokio::spawn(async move {
            let (sock, peer) = client_listener.accept().await.unwrap();
            handle(sock, peer, shutdown_rx).await;
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        // Never send a request; signal shutdown instead.
        shutdown_tx.send(()).unwrap();

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "connection should close with no reply");

        server_task.await.unwrap();
    }
}
