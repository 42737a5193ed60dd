//! Full-duplex byte relay between a client and a remote socket.
//!
//! Two unidirectional copiers share one scratch buffer each and run as
//! sibling branches of a single `select!` loop, grounded on the
//! `copy_io` shape used elsewhere in this ecosystem for paired
//! AsyncRead/AsyncWrite streams. The relay ends as soon as either
//! direction sees EOF, errors, or the shared idle timer expires —
//! whichever happens first — which is the simplest of the two
//! half-close policies this protocol allows.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::config::RELAY_BUFFER_SIZE;
use crate::error::Socks4Error;

/// Shuttle bytes between `a` and `b` until either side ends.
///
/// The idle timer is armed for `idle_timeout` on entry and re-armed after
/// every chunk successfully transferred in either direction. Its
/// expiration surfaces as [`Socks4Error::Timeout`]; a clean EOF in either
/// direction surfaces as `Ok(())`.
#[tracing::instrument(skip(a, b), level = "debug")]
pub async fn relay<A, B>(a: &mut A, b: &mut B, idle_timeout: Duration) -> Result<(), Socks4Error>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a2b_buf = [0u8; RELAY_BUFFER_SIZE];
    let mut b2a_buf = [0u8; RELAY_BUFFER_SIZE];

    let sleep = tokio::time::sleep(idle_timeout);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            () = &mut sleep => {
                return Err(Socks4Error::Timeout);
            }
            result = a.read(&mut a2b_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                b.write_all(&a2b_buf[..n]).await?;
                sleep.as_mut().reset(Instant::now() + idle_timeout);
            }
            result = b.read(&mut b2a_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                a.write_all(&b2a_buf[..n]).await?;
                sleep.as_mut().reset(Instant::now() + idle_timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn relays_bytes_in_both_directions() {
        let (mut client_a, mut server_a) = tokio::io::duplex(64);
        let (mut client_b, mut server_b) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(async move {
            relay(&mut server_a, &mut server_b, Duration::from_secs(5)).await
        });

        client_a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client_b.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client_a);
        drop(client_b);
        let result = relay_task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_nothing_transferred() {
        let (mut _client_a, mut server_a) = tokio::io::duplex(64);
        let (mut _client_b, mut server_b) = tokio::io::duplex(64);

        let result = relay(&mut server_a, &mut server_b, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Socks4Error::Timeout)));
    }

    #[tokio::test]
    async fn activity_before_deadline_prevents_timeout() {
        let (mut client_a, mut server_a) = tokio::io::duplex(64);
        let (mut _client_b, mut server_b) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(async move {
            relay(&mut server_a, &mut server_b, Duration::from_millis(60)).await
        });

        // Send a chunk partway through the deadline to re-arm it, then
        // let the connection go idle until the (re-armed) deadline fires.
        tokio::time::sleep(Duration::from_millis(30)).await;
        client_a.write_all(b"x").await.unwrap();

        let result = relay_task.await.unwrap();
        assert!(matches!(result, Err(Socks4Error::Timeout)));
    }
}
