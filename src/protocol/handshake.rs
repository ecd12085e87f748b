//! The one-line negotiation a plugin prints on stdout before it is trusted.
//!
//! Format: `protocolVersion|magicCookieKey|magicCookieValue|transportKind|address`

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::HandshakeConfig;
use crate::error::HandshakeError;

pub const FIELD_SEPARATOR: char = '|';

/// Longest handshake line accepted before the plugin is rejected as malformed.
const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Unix,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Unix => f.write_str("unix"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "unix" => Ok(TransportKind::Unix),
            other => Err(HandshakeError::UnsupportedTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
    pub transport: TransportKind,
    pub address: String,
}

impl HandshakeLine {
    pub fn new(config: &HandshakeConfig, transport: TransportKind, address: String) -> Self {
        Self {
            protocol_version: config.protocol_version,
            cookie_key: config.magic_cookie_key.clone(),
            cookie_value: config.magic_cookie_value.clone(),
            transport,
            address,
        }
    }

    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        // The address is last so a unix socket path may itself contain the separator.
        let fields: Vec<&str> = line.splitn(5, FIELD_SEPARATOR).collect();
        if fields.len() != 5 {
            return Err(HandshakeError::Malformed(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }

        let protocol_version = fields[0].trim().parse::<u32>().map_err(|_| {
            HandshakeError::Malformed(format!("protocol version '{}' is not a number", fields[0]))
        })?;
        let transport = fields[3].trim().parse::<TransportKind>()?;
        let address = fields[4].trim();
        if address.is_empty() {
            return Err(HandshakeError::Malformed("empty address".to_string()));
        }

        Ok(Self {
            protocol_version,
            cookie_key: fields[1].to_string(),
            cookie_value: fields[2].to_string(),
            transport,
            address: address.to_string(),
        })
    }

    pub fn validate(&self, expected: &HandshakeConfig) -> Result<(), HandshakeError> {
        if self.protocol_version != expected.protocol_version {
            return Err(HandshakeError::VersionMismatch {
                expected: expected.protocol_version,
                actual: self.protocol_version,
            });
        }
        if self.cookie_key != expected.magic_cookie_key
            || self.cookie_value != expected.magic_cookie_value
        {
            return Err(HandshakeError::CookieMismatch);
        }
        Ok(())
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.protocol_version, self.cookie_key, self.cookie_value, self.transport, self.address
        )
    }
}

/// Read and validate the first non-empty line from a freshly started plugin.
pub async fn negotiate<R>(
    reader: &mut R,
    expected: &HandshakeConfig,
    timeout: Duration,
) -> Result<HandshakeLine, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut line = String::new();

    loop {
        line.clear();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let read = tokio::time::timeout(remaining, read_bounded_line(reader, &mut line))
            .await
            .map_err(|_| HandshakeError::Timeout(timeout))?;

        match read {
            Ok(0) => return Err(HandshakeError::ProcessExited),
            Ok(_) if line.trim().is_empty() => continue,
            Ok(_) => break,
            Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
        }
    }

    let handshake = HandshakeLine::parse(&line)?;
    handshake.validate(expected)?;
    Ok(handshake)
}

async fn read_bounded_line<R>(reader: &mut R, line: &mut String) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if buf.len() > MAX_LINE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "handshake line too long",
        ));
    }
    line.push_str(&String::from_utf8_lossy(&buf));
    Ok(n)
}
