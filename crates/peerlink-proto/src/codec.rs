//! Message codec for async byte streams
//!
//! Messages are delimited in-band. Byte `3` is an escape: `3 0` carries a
//! literal `3`, `3 1` ends a message, `3 2` ends the stream.

use crate::{Message, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Escape byte
pub const ESC: u8 = 3;
/// Follows [`ESC`] to carry a literal escape byte
pub const ESC_LITERAL: u8 = 0;
/// Follows [`ESC`] to end a message
pub const ESC_EOM: u8 = 1;
/// Follows [`ESC`] to end the stream
pub const ESC_EOS: u8 = 2;

/// Maximum unescaped message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Incremental decoder/encoder for delimited messages
pub struct MessageCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum message size allowed
    max_message_size: usize,
    /// Unescaped bytes of the message being received
    body: BytesMut,
    /// Peer sent the end-of-stream marker
    end_of_stream: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_message_size: MAX_MESSAGE_SIZE,
            body: BytesMut::new(),
            end_of_stream: false,
        }
    }

    /// Create a new codec with a custom message size limit
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            ..Self::new()
        }
    }

    /// Escape an unescaped message body and append the end-of-message marker
    pub fn encode(raw: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(raw.len() + 2);
        for &b in raw {
            buf.put_u8(b);
            if b == ESC {
                buf.put_u8(ESC_LITERAL);
            }
        }
        buf.put_u8(ESC);
        buf.put_u8(ESC_EOM);
        buf.freeze()
    }

    /// Write already-encoded message bytes to an async writer
    pub async fn write_message<W>(writer: &mut W, encoded: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Append received bytes to the decode buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Read the next message from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream (EOF at a message
    /// boundary, or the end-of-stream marker).
    pub async fn read_message<R>(&mut self, reader: &mut R) -> Result<Option<Message>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(message) = self.try_decode_message()? {
                return Ok(Some(message));
            }
            if self.end_of_stream {
                return Ok(None);
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.buffer_size() == 0 {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::Protocol("stream ended inside a message".to_string()));
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode a message from the internal buffer
    pub fn try_decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.try_decode_raw()? {
            Some(raw) => Message::parse(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Try to split one unescaped message body off the internal buffer.
    ///
    /// Input is unescaped into a pending body as it is consumed, so each
    /// call only looks at bytes fed since the previous one.
    pub fn try_decode_raw(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.end_of_stream {
            return Ok(None);
        }

        loop {
            let Some(esc) = self.read_buf.iter().position(|&b| b == ESC) else {
                let plain = self.read_buf.split();
                self.append_body(&plain)?;
                return Ok(None);
            };
            if esc > 0 {
                let plain = self.read_buf.split_to(esc);
                self.append_body(&plain)?;
            }
            let Some(&code) = self.read_buf.get(1) else {
                // Escape split across reads
                return Ok(None);
            };
            match code {
                ESC_LITERAL => {
                    self.read_buf.advance(2);
                    self.append_body(&[ESC])?;
                }
                ESC_EOM => {
                    self.read_buf.advance(2);
                    return Ok(Some(self.body.split().freeze()));
                }
                ESC_EOS => {
                    self.read_buf.advance(2);
                    self.body.clear();
                    self.end_of_stream = true;
                    return Ok(None);
                }
                other => {
                    return Err(ProtocolError::Protocol(format!("invalid escape sequence 3 {}", other)));
                }
            }
        }
    }

    fn append_body(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if self.body.len() + bytes.len() > self.max_message_size {
            return Err(ProtocolError::Protocol(format!(
                "message exceeds {} bytes",
                self.max_message_size
            )));
        }
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    /// Whether the end-of-stream marker has been seen
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Bytes received but not yet returned as a message
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len() + self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageKind, OutputStream};
    use proptest::prelude::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_two_messages() {
        let mut wire = BytesMut::new();
        let mut first = OutputStream::reply("1");
        first.write_errno(0);
        wire.extend_from_slice(&first.finish());
        wire.extend_from_slice(&OutputStream::not_found("2"));

        let mut codec = MessageCodec::new();
        let mut cursor = Cursor::new(wire.freeze());

        let m1 = codec.read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(m1.kind, MessageKind::Reply);
        assert_eq!(m1.token.as_deref(), Some("1"));

        let m2 = codec.read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(m2.kind, MessageKind::NotFound);
        assert_eq!(m2.token.as_deref(), Some("2"));

        assert!(codec.read_message(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn test_partial_message() {
        let wire = OutputStream::not_found("abc");
        let mut codec = MessageCodec::new();

        // Stop between the escape byte and its code
        codec.feed(&wire[..wire.len() - 1]);
        assert!(codec.try_decode_message().unwrap().is_none());

        codec.feed(&wire[wire.len() - 1..]);
        let msg = codec.try_decode_message().unwrap().unwrap();
        assert_eq!(msg.token.as_deref(), Some("abc"));
        assert_eq!(codec.buffer_size(), 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_marker() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&OutputStream::not_found("1"));
        wire.extend_from_slice(&[ESC, ESC_EOS]);
        wire.extend_from_slice(&OutputStream::not_found("2"));

        let mut codec = MessageCodec::new();
        let mut cursor = Cursor::new(wire.freeze());
        assert!(codec.read_message(&mut cursor).await.unwrap().is_some());
        assert!(codec.read_message(&mut cursor).await.unwrap().is_none());
        assert!(codec.is_end_of_stream());
    }

    #[tokio::test]
    async fn test_eof_inside_message() {
        let mut codec = MessageCodec::new();
        let mut cursor = Cursor::new(b"R\0tok".to_vec());
        let result = codec.read_message(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::Protocol(_))));
    }

    #[test]
    fn test_invalid_escape() {
        let mut codec = MessageCodec::new();
        codec.feed(&[b'R', 0, ESC, 9]);
        assert!(matches!(codec.try_decode_raw(), Err(ProtocolError::Protocol(_))));
    }

    #[test]
    fn test_message_too_large() {
        let mut codec = MessageCodec::with_max_message_size(8);
        codec.feed(&[b'x'; 32]);
        assert!(matches!(codec.try_decode_raw(), Err(ProtocolError::Protocol(_))));
    }

    #[test]
    fn test_large_message_in_chunks_decodes_linearly() {
        let mut body = vec![b'x'; MAX_MESSAGE_SIZE - 1024];
        for i in (0..body.len()).step_by(64 * 1024) {
            body[i] = ESC;
        }
        let wire = MessageCodec::encode(&body);

        let started = std::time::Instant::now();
        let mut codec = MessageCodec::new();
        let mut decoded = None;
        for chunk in wire.chunks(8192) {
            codec.feed(chunk);
            if let Some(raw) = codec.try_decode_raw().unwrap() {
                decoded = Some(raw);
            }
        }

        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(&decoded.unwrap()[..], &body[..]);
        assert_eq!(codec.buffer_size(), 0);
    }

    #[test]
    fn test_oversized_message_rejected_across_chunks() {
        let mut codec = MessageCodec::with_max_message_size(16);
        codec.feed(&[b'x'; 10]);
        assert!(codec.try_decode_raw().unwrap().is_none());
        codec.feed(&[b'x'; 10]);
        assert!(matches!(codec.try_decode_raw(), Err(ProtocolError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_write_message() {
        let wire = OutputStream::not_found("5");
        let mut sink = Vec::new();
        MessageCodec::write_message(&mut sink, &wire).await.unwrap();
        assert_eq!(sink, wire.to_vec());
    }

    proptest! {
        #[test]
        fn test_escaping_preserves_body(body in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut codec = MessageCodec::new();
            codec.feed(&MessageCodec::encode(&body));
            let decoded = codec.try_decode_raw().unwrap().unwrap();
            prop_assert_eq!(&decoded[..], &body[..]);
            prop_assert_eq!(codec.buffer_size(), 0);
        }

        #[test]
        fn test_read_message_across_chunks(
            token in "[a-z0-9]{1,16}",
            args in prop::collection::vec(any::<u8>(), 0..256),
            split in any::<prop::sample::Index>(),
        ) {
            let mut out = OutputStream::reply(&token);
            out.write_bytes(&args);
            let wire = out.finish();
            let at = split.index(wire.len() - 1) + 1;

            let mut reader = tokio_test::io::Builder::new()
                .read(&wire[..at])
                .read(&wire[at..])
                .build();
            let message = tokio_test::block_on(async {
                MessageCodec::new().read_message(&mut reader).await
            })
            .unwrap()
            .unwrap();

            prop_assert_eq!(message.kind, MessageKind::Reply);
            prop_assert_eq!(message.token.as_deref(), Some(token.as_str()));
            prop_assert_eq!(&message.args[..], &args[..]);
        }
    }
}
