//! Output and argument value streams
//!
//! `OutputStream` builds one wire-ready message: NUL-terminated fields,
//! JSON values, and the end-of-message marker, with the escape byte
//! handled on the way out. `ArgReader` walks the unescaped argument
//! section of a received command.

use crate::codec::{ESC, ESC_EOM, ESC_LITERAL};
use crate::message::{ErrorReport, MessageKind};
use crate::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Builder for a single outbound message
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
}

impl OutputStream {
    /// Create an empty stream
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Start a reply: `R`, token
    pub fn reply(token: &str) -> Self {
        let mut out = Self::new();
        out.write_stringz(MessageKind::Reply.as_str());
        out.write_stringz(token);
        out
    }

    /// Start an event: `E`, service, event name
    pub fn event(service: &str, name: &str) -> Self {
        let mut out = Self::new();
        out.write_stringz(MessageKind::Event.as_str());
        out.write_stringz(service);
        out.write_stringz(name);
        out
    }

    /// Start a command: `C`, token, service, command name
    pub fn command(token: &str, service: &str, name: &str) -> Self {
        let mut out = Self::new();
        out.write_stringz(MessageKind::Command.as_str());
        out.write_stringz(token);
        out.write_stringz(service);
        out.write_stringz(name);
        out
    }

    /// Unknown-command answer: `N`, token, end of message
    pub fn not_found(token: &str) -> Bytes {
        let mut out = Self::new();
        out.write_stringz(MessageKind::NotFound.as_str());
        out.write_stringz(token);
        out.finish()
    }

    /// Write one payload byte, escaping the escape byte itself
    pub fn write_byte(&mut self, b: u8) {
        if b == ESC {
            self.buf.put_u8(ESC);
            self.buf.put_u8(ESC_LITERAL);
        } else {
            self.buf.put_u8(b);
        }
    }

    /// Write raw payload bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    /// Write a string followed by its NUL terminator
    pub fn write_stringz(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
        self.write_byte(0);
    }

    /// Write a value as JSON (no terminator)
    pub fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.write_bytes(&encoded);
        Ok(())
    }

    /// Write an error field: empty for success, an error report otherwise.
    /// The field is always NUL-terminated.
    pub fn write_errno(&mut self, code: i32) {
        if code != 0 {
            let report = ErrorReport::new(code);
            // An ErrorReport is a plain struct of an int and a string.
            if let Ok(encoded) = serde_json::to_vec(&report) {
                self.write_bytes(&encoded);
            }
        }
        self.write_byte(0);
    }

    /// Append the end-of-message marker
    pub fn write_eom(&mut self) {
        self.buf.put_u8(ESC);
        self.buf.put_u8(ESC_EOM);
    }

    /// Terminate the message and hand back its wire bytes
    pub fn finish(mut self) -> Bytes {
        self.write_eom();
        self.buf.freeze()
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reader over the argument section of a received command
#[derive(Debug)]
pub struct ArgReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    /// Wrap an unescaped argument section
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Parse the JSON value that runs up to the next NUL (or the end)
    pub fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        if self.pos >= self.data.len() {
            return Err(ProtocolError::JsonSyntax);
        }
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let value = serde_json::from_slice(&rest[..end]).map_err(|_| ProtocolError::JsonSyntax)?;
        self.pos += end;
        Ok(value)
    }

    /// Consume an argument terminator
    pub fn expect_nul(&mut self) -> Result<(), ProtocolError> {
        match self.data.get(self.pos) {
            Some(0) => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(ProtocolError::JsonSyntax),
        }
    }

    /// Require that every argument byte has been consumed
    pub fn expect_end(&self) -> Result<(), ProtocolError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(ProtocolError::JsonSyntax)
        }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
