//! SOCKS4 and SOCKS4a wire codec.
//!
//! Encodes and decodes the request and reply frames described by the
//! SOCKS4 protocol, plus the NUL-terminated USERID/hostname trailers that
//! follow a request header. Ports and addresses are always big-endian on
//! the wire; we never hand-roll the conversion, since a shift/mask done
//! by hand is exactly the kind of mistake that rotates the wrong way on
//! a little-endian host.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{MAX_DOMAIN_LEN, MAX_IDENT_LEN};
use crate::error::Socks4Error;


/// The request command, from the second byte of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    /// Recognized but not implemented; see spec non-goals.
    Bind,
}

impl Command {
    fn from_byte(byte: u8) -> Result<Self, Socks4Error> {
        match byte {
            1 => Ok(Command::Connect),
            2 => Ok(Command::Bind),
            _ => Err(Socks4Error::BadCommand),
        }
    }
}

/// The fixed 8-byte request header, read off the wire before it is known
/// whether the version or command are even valid.
///
/// Kept separate from [`Request`] so a bad version or command can still
/// be answered with the port/ipv4 as parsed, per the reply contract in
/// the wire protocol ("echoing the request values is still required").
#[derive(Debug, Clone, Copy)]
pub struct RawHeader {
    pub version: u8,
    pub command_byte: u8,
    pub port: u16,
    pub ip: Ipv4Addr,
}

impl RawHeader {
    pub async fn read_from<R>(reader: &mut R) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let version = reader.read_u8().await?;
        let command_byte = reader.read_u8().await?;
        let port = reader.read_u16().await?;
        let ip = Ipv4Addr::from(reader.read_u32().await?);
        Ok(RawHeader {
            version,
            command_byte,
            port,
            ip,
        })
    }

    /// Validate the version and command, turning this into a `Command`
    /// the caller can dispatch on.
    pub fn validate(&self) -> Result<Command, Socks4Error> {
        if self.version != 4 {
            return Err(Socks4Error::BadVersion);
        }
        Command::from_byte(self.command_byte)
    }

    #[cfg(test)]
    fn to_bytes(self) -> Vec<u8> {
        let mut buf = vec![self.version, self.command_byte];
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.ip.octets());
        buf
    }
}

/// A decoded SOCKS4/4a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub port: u16,
    pub ip: Ipv4Addr,
    /// Bytes between the header and the terminating NUL, NUL excluded.
    pub userid: Vec<u8>,
    /// Present only when the request used the SOCKS4a address form.
    pub domain: Option<String>,
}

impl Request {
    /// An IP of the form `0.0.0.x` with `x != 0` signals SOCKS4a: the
    /// real destination is a domain name that follows the USERID field.
    pub fn ip_is_socks4a(ip: Ipv4Addr) -> bool {
        let octets = ip.octets();
        octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0
    }

    /// Decode the USERID and, for SOCKS4a, domain trailers that follow an
    /// already-validated header.
    ///
    /// Does not resolve the domain; callers that need the destination
    /// address resolved should follow up with [`crate::resolver::resolve`].
    pub async fn read_trailers<R>(
        reader: &mut R,
        command: Command,
        header: &RawHeader,
    ) -> Result<Self, Socks4Error>
    where
        R: AsyncRead + Unpin,
    {
        let userid = read_nul_terminated(reader, MAX_IDENT_LEN, false)
            .await?
            .ok_or(Socks4Error::BadIdent)?;
        let domain = if Self::ip_is_socks4a(header.ip) {
            let bytes = read_nul_terminated(reader, MAX_DOMAIN_LEN, true)
                .await?
                .ok_or(Socks4Error::BadDomain)?;
            let domain = String::from_utf8(bytes).map_err(|_| Socks4Error::BadDomain)?;
            Some(domain)
        } else {
            None
        };
        Ok(Request {
            command,
            port: header.port,
            ip: header.ip,
            userid,
            domain,
        })
    }

    /// Read and fully decode a request from the wire, including the
    /// header, USERID trailer, and (for SOCKS4a) the domain trailer.
    /// Used by tests exercising the whole decode path at once; the
    /// connection handler uses [`RawHeader::read_from`] +
    /// [`Request::read_trailers`] directly so it can echo the header on
    /// a validation failure.
    #[cfg(test)]
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, Socks4Error>
    where
        R: AsyncRead + Unpin,
    {
        let header = RawHeader::read_from(reader).await?;
        let command = header.validate()?;
        Self::read_trailers(reader, command, &header).await
    }

    /// Re-encode this request's wire form, header first. Used by tests to
    /// exercise the round-trip law; never used by the server at runtime.
    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = RawHeader {
            version: 4,
            command_byte: match self.command {
                Command::Connect => 1,
                Command::Bind => 2,
            },
            port: self.port,
            ip: self.ip,
        };
        let mut buf = header.to_bytes();
        buf.extend_from_slice(&self.userid);
        buf.push(0);
        if let Some(domain) = &self.domain {
            buf.extend_from_slice(domain.as_bytes());
            buf.push(0);
        }
        buf
    }
}

/// Read bytes up to (and including) a NUL terminator, with a hard ceiling
/// on the number of bytes read (terminator included). `reject_empty`
/// additionally fails a terminator seen as the very first byte (used for
/// the SOCKS4a domain, which may never be empty).
///
/// Returns `Ok(None)` for a protocol violation (ceiling hit without a
/// terminator, or an empty trailer where one is rejected) and propagates
/// genuine I/O errors (disconnects, resets) as `Err` so callers don't
/// misreport them as a malformed request.
async fn read_nul_terminated<R>(
    reader: &mut R,
    ceiling: usize,
    reject_empty: bool,
) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        if buf.len() + 1 > ceiling {
            return Ok(None);
        }
        let byte = reader.read_u8().await?;
        if byte == 0 {
            if reject_empty && buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(buf));
        }
        buf.push(byte);
    }
}

/// The only reply codes this server originates. `NoIdent`/`IdentReject`
/// are part of the wire format and are recognized for decoding
/// third-party replies, but are never sent by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Granted = 0x5A,
    Rejected = 0x5B,
    #[allow(dead_code)]
    NoIdent = 0x5C,
    #[allow(dead_code)]
    IdentReject = 0x5D,
}

/// A reply frame, always exactly 8 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub port: u16,
    pub ip: Ipv4Addr,
}

impl Reply {
    pub fn granted(port: u16, ip: Ipv4Addr) -> Self {
        Reply {
            code: ReplyCode::Granted,
            port,
            ip,
        }
    }

    pub fn rejected(port: u16, ip: Ipv4Addr) -> Self {
        Reply {
            code: ReplyCode::Rejected,
            port,
            ip,
        }
    }

    /// Write the 8-byte reply. The first byte is always `0x00`, never the
    /// protocol version.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_u8(0).await?;
        writer.write_u8(self.code as u8).await?;
        writer.write_u16(self.port).await?;
        writer.write_all(&self.ip.octets()).await?;
        writer.flush().await
    }

    #[cfg(test)]
    pub async fn read_from<R>(reader: &mut R) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let null = reader.read_u8().await?;
        assert_eq!(null, 0);
        let code_byte = reader.read_u8().await?;
        let code = match code_byte {
            0x5A => ReplyCode::Granted,
            0x5B => ReplyCode::Rejected,
            0x5C => ReplyCode::NoIdent,
            0x5D => ReplyCode::IdentReject,
            _ => panic!("unknown reply code {code_byte:#x}"),
        };
        let port = reader.read_u16().await?;
        let mut ip_bytes = [0u8; 4];
        reader.read_exact(&mut ip_bytes).await?;
        Ok(Reply {
            code,
            port,
            ip: Ipv4Addr::from(ip_bytes),
        })
    }
}
