//! Tunable constants for the protocol and transport layers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::time::Duration;

/// Deadline covering the whole handshake, from the first byte of the
/// request header through the reply being sent.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Idle deadline during the tunnel phase, re-armed on every chunk
/// transferred in either direction.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Scratch buffer size used by each unidirectional copier in the relay.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Ceiling, including the terminating NUL, on the USERID field.
pub const MAX_IDENT_LEN: usize = 256;

/// Ceiling, including the terminating NUL, on the SOCKS4a domain field.
pub const MAX_DOMAIN_LEN: usize = 256;

/// Rotate a log file once it reaches this size.
pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;

/// Keep at most this many rotated log files around.
pub const LOG_MAX_FILES: usize = 10;

/// Default listening port when `--port` is not given.
pub const DEFAULT_PORT: u16 = 1080;
