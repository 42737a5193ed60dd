//! Accept loop and graceful shutdown.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::connection;
use crate::error::ServerError;

/// Bind the listening socket and run the accept loop until a termination
/// signal arrives or the listener itself fails.
///
/// Each accepted connection is handled on its own task in a [`JoinSet`];
/// a transient per-connection failure (reported by [`connection::handle`]
/// internally, never propagated here) never stops the loop. Unlike the
/// teacher, which treats every `accept()` failure as fatal, this loop
/// tells transient accept errors (resource exhaustion, a peer resetting
/// the connection before `accept()` finishes handshaking it) from a
/// cancellation-class failure: the former are logged at warning and the
/// loop continues, the latter ends it.
///
/// Cancellation is cooperative rather than a hard abort: every handler
/// task is handed a [`broadcast::Receiver`] it races against its current
/// operation, so it observes shutdown as an ordinary
/// [`Socks4Error::Cancelled`][crate::error::Socks4Error::Cancelled] and
/// runs its own teardown instead of being torn out mid-poll.
pub async fn run(bind_addr: Ipv4Addr, port: u16) -> Result<(), ServerError> {
    let listener = TcpListener::bind((bind_addr, port))
        .await
        .map_err(ServerError::Bind)?;
    info!("listening on {}:{}", bind_addr, port);

    let mut shutdown = shutdown_signals()?;
    let mut connections = JoinSet::new();
    let (notify_shutdown, _) = broadcast::channel::<()>(1);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!("shutdown signal received, draining {} connection(s)", connections.len());
                // Dropping the sender closes every subscribed receiver;
                // each handler's select! against it resolves and the
                // handler returns (and tears down) on its own.
                drop(notify_shutdown);
                while connections.join_next().await.is_some() {}
                return Ok(());
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!("connection task panicked: {e}");
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        connections.spawn(connection::handle(
                            stream,
                            peer_addr,
                            notify_shutdown.subscribe(),
                        ));
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("accept() failed transiently, continuing: {e}");
                    }
                    Err(e) => {
                        error!("accept() failed, stopping: {e}");
                        return Err(ServerError::Io(e));
                    }
                }
            }
        }
    }
}

/// A tiny multiplexer over the three signals `main.cpp`'s C++ counterpart
/// registered (SIGINT, SIGTERM, SIGABRT) collapsed into a single `recv()`.
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    abort: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
            _ = self.abort.recv() => {}
        }
    }
}

fn shutdown_signals() -> Result<ShutdownSignals, ServerError> {
    Ok(ShutdownSignals {
        interrupt: signal(SignalKind::interrupt())?,
        terminate: signal(SignalKind::terminate())?,
        abort: signal(SignalKind::from_raw(libc_sigabrt()))?,
    })
}

/// `SIGABRT`'s raw signal number. `tokio::signal::unix::SignalKind` has no
/// named constructor for it; the value is portable across the Unix
/// targets this server runs on.
fn libc_sigabrt() -> i32 {
    6
}

/// Whether an `accept()` failure is the transient kind the loop should
/// just log and retry on: the peer reset the connection before the
/// three-way handshake completed, or the process is temporarily out of
/// descriptors. Anything else (a bad listener, permission loss) is
/// treated as a cancellation-class failure and ends the loop.
fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    // EMFILE/ENFILE, the per-process and system-wide descriptor-exhaustion
    // codes on every Unix target this server runs on.
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
    ) || matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}

#[cfg(test)]
mod accept_error_tests {
    use super::is_transient_accept_error;
    use std::io::{Error, ErrorKind};

    #[test]
    fn connection_aborted_is_transient() {
        assert!(is_transient_accept_error(&Error::from(
            ErrorKind::ConnectionAborted
        )));
    }

    #[test]
    fn descriptor_exhaustion_is_transient() {
        assert!(is_transient_accept_error(&Error::from_raw_os_error(24)));
    }

    #[test]
    fn permission_denied_is_fatal() {
        assert!(!is_transient_accept_error(&Error::from(
            ErrorKind::PermissionDenied
        )));
    }
}
