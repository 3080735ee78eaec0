//! Message kinds and parsed message views

use crate::codes;
use crate::stream::ArgReader;
use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Type marker in the first field of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `C`: token, service, command name, arguments
    Command,
    /// `R`: token, result fields
    Reply,
    /// `E`: service, event name, event fields
    Event,
    /// `N`: token of a command nobody handles
    NotFound,
}

impl MessageKind {
    /// Wire marker
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "C",
            Self::Reply => "R",
            Self::Event => "E",
            Self::NotFound => "N",
        }
    }

    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "C" => Some(Self::Command),
            "R" => Some(Self::Reply),
            "E" => Some(Self::Event),
            "N" => Some(Self::NotFound),
            _ => None,
        }
    }

    /// Number of NUL-terminated header fields after the marker
    fn header_fields(self) -> usize {
        match self {
            Self::Command => 3,
            Self::Reply => 1,
            Self::Event => 2,
            Self::NotFound => 1,
        }
    }
}

/// A decoded message
///
/// `raw` is the unescaped content between the previous end-of-message
/// marker and this one; the relay re-encodes it verbatim.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message type
    pub kind: MessageKind,
    /// Correlation token (commands, replies, not-found)
    pub token: Option<String>,
    /// Service name (commands, events)
    pub service: Option<String>,
    /// Command or event name
    pub name: Option<String>,
    /// Everything after the header fields
    pub args: Bytes,
    raw: Bytes,
}

impl Message {
    /// Parse an unescaped message body
    pub fn parse(raw: Bytes) -> Result<Self, ProtocolError> {
        let mut pos = 0usize;
        let mut next_field = |raw: &Bytes| -> Result<String, ProtocolError> {
            let rest = &raw[pos..];
            let end = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| ProtocolError::Protocol("unterminated header field".to_string()))?;
            let field = std::str::from_utf8(&rest[..end])
                .map_err(|_| ProtocolError::Protocol("header field is not UTF-8".to_string()))?
                .to_string();
            pos += end + 1;
            Ok(field)
        };

        let marker = next_field(&raw)?;
        let kind = MessageKind::from_marker(&marker)
            .ok_or_else(|| ProtocolError::Protocol(format!("unknown message type '{}'", marker)))?;

        let mut header = Vec::with_capacity(3);
        for _ in 0..kind.header_fields() {
            header.push(next_field(&raw)?);
        }
        let args = raw.slice(pos..);

        let mut header = header.into_iter();
        let (token, service, name) = match kind {
            MessageKind::Command => (header.next(), header.next(), header.next()),
            MessageKind::Reply | MessageKind::NotFound => (header.next(), None, None),
            MessageKind::Event => (None, header.next(), header.next()),
        };

        Ok(Self {
            kind,
            token,
            service,
            name,
            args,
            raw,
        })
    }

    /// Reader over the argument section
    pub fn arg_reader(&self) -> ArgReader<'_> {
        ArgReader::new(&self.args)
    }

    /// Unescaped message body as received
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

/// Error object written into a reply's error field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Numeric code, see [`crate::codes`]
    #[serde(rename = "Code")]
    pub code: i32,
    /// Human-readable description
    #[serde(rename = "Format")]
    pub format: String,
}

impl ErrorReport {
    /// Report for a code with its standard description
    pub fn new(code: i32) -> Self {
        Self {
            code,
            format: codes::describe(code),
        }
    }

    /// Read the error field at the start of a reply payload.
    /// Returns the code (0 for success) and the rest of the payload.
    pub fn read_field(payload: &[u8]) -> Result<(i32, &[u8]), ProtocolError> {
        let end = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::JsonSyntax)?;
        let rest = &payload[end + 1..];
        if end == 0 {
            return Ok((codes::SUCCESS, rest));
        }
        let report: ErrorReport = serde_json::from_slice(&payload[..end])?;
        Ok((report.code, rest))
    }
}
