//! Resolves a SOCKS4a domain name to a single IPv4 address using the
//! host platform's resolver.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::net::Ipv4Addr;

use tokio::net::lookup_host;

use crate::error::Socks4Error;

/// Resolve `domain` and return the first IPv4 record in iteration order.
///
/// Cancellable by wrapping the returned future in `tokio::time::timeout`
/// from the caller, since the handshake deadline timer covers resolution
/// too.
#[tracing::instrument(level = "debug")]
pub async fn resolve(domain: &str) -> Result<Ipv4Addr, Socks4Error> {
    // `lookup_host` needs a port to build a `SocketAddr`; it is discarded.
    let addrs = lookup_host((domain, 0))
        .await
        .map_err(|_| Socks4Error::ResolveFailed)?;
    addrs
        .filter_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
        .next()
        .ok_or(Socks4Error::ResolveFailed)
}
