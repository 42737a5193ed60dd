//! Error taxonomy for the protocol state machine and the process itself.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Errors visible to the per-connection handler.
///
/// [`Socks4Error::reportable`] draws the line the wire protocol cares
/// about: the decode/resolve/connect variants get a single `0x5B` reply
/// before the connection closes, while `Io`, `Timeout`, and `Cancelled`
/// are logged and closed silently (`Io` covers failures observed after a
/// reply has already been sent, during the tunnel phase).
#[derive(Debug, Error)]
pub enum Socks4Error {
    #[error("bad protocol version")]
    BadVersion,
    #[error("bad request command")]
    BadCommand,
    #[error("ident field malformed or missing terminator")]
    BadIdent,
    #[error("domain field malformed, empty, or missing terminator")]
    BadDomain,
    #[error("could not resolve domain to an IPv4 address")]
    ResolveFailed,
    #[error("could not connect to remote host")]
    ConnectFailed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

impl Socks4Error {
    /// Whether this error should be surfaced to the client as a `0x5B`
    /// reply. `Io`, `Timeout`, and `Cancelled` are closed silently instead.
    pub fn reportable(&self) -> bool {
        matches!(
            self,
            Socks4Error::BadVersion
                | Socks4Error::BadCommand
                | Socks4Error::BadIdent
                | Socks4Error::BadDomain
                | Socks4Error::ResolveFailed
                | Socks4Error::ConnectFailed
        )
    }
}

/// Fatal startup errors that abort the process before the runtime is
/// serving any connections.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not create log directory {path}: {source}")]
    LogDirectory {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not bind listening socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("could not daemonize: {0}")]
    Daemonize(#[from] daemonize::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
