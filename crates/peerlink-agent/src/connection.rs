//! Driving a byte stream as a [`Channel`]
//!
//! The writer task drains the channel's outbound queue. The reader loop
//! decodes messages and either relays them to the proxy partner or hands
//! them to the [`Protocol`]. Whichever side stops first closes the channel,
//! and the proxy partner with it.

use crate::channel::Channel;
use crate::protocol::Protocol;
use bytes::Bytes;
use peerlink_proto::{MessageCodec, ProtocolError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Serve an accepted connection: commands go to `protocol` until the
/// channel is proxied.
pub async fn serve<S>(
    stream: S,
    channel: Arc<Channel>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    protocol: Arc<Protocol>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    drive(stream, channel, outbound, Some(protocol)).await
}

/// Drive an outbound connection that only relays once proxied.
/// Messages arriving before the proxy is attached are dropped.
pub async fn relay<S>(
    stream: S,
    channel: Arc<Channel>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    drive(stream, channel, outbound, None).await
}

async fn drive<S>(
    stream: S,
    channel: Arc<Channel>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    protocol: Option<Arc<Protocol>>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let writer_channel = Arc::clone(&channel);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if let Err(e) = MessageCodec::write_message(&mut writer, &bytes).await {
                debug!("{}: write failed: {}", writer_channel.name(), e);
                writer_channel.close();
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut codec = MessageCodec::new();
    let result = loop {
        let read = tokio::select! {
            _ = channel.closed() => break Ok(()),
            read = codec.read_message(&mut reader) => read,
        };
        match read {
            Ok(Some(message)) => {
                if let Some(partner) = channel.proxy_peer() {
                    partner.send(MessageCodec::encode(message.raw()));
                } else if let Some(protocol) = &protocol {
                    protocol.dispatch(&message, &channel);
                } else {
                    trace!("{}: dropping {:?} before proxy attach", channel.name(), message.kind);
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let partner = channel.proxy_peer();
    channel.close();
    if let Some(partner) = partner {
        partner.close();
    }
    let _ = writer_task.await;
    debug!("{}: connection finished", channel.name());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ChannelProxy, ProxyRelay};
    use peerlink_proto::{MessageKind, OutputStream};
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_unknown_command_over_stream() {
        let (client, server) = duplex(4096);
        let (channel, outbound) = Channel::detached("client");
        let task = tokio::spawn(serve(server, channel, outbound, Arc::new(Protocol::new())));

        let (mut rd, mut wr) = tokio::io::split(client);
        let mut cmd = OutputStream::command("9", "Nope", "x");
        cmd.write_byte(0);
        wr.write_all(&cmd.finish()).await.unwrap();

        let mut codec = MessageCodec::new();
        let reply = codec.read_message(&mut rd).await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::NotFound);
        assert_eq!(reply.token.as_deref(), Some("9"));

        drop(wr);
        drop(rd);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_proxied_messages_are_relayed_and_close_propagates() {
        let (client, server) = duplex(4096);
        let (channel, outbound) = Channel::detached("client");
        let (partner, mut partner_rx) = Channel::detached("partner");
        ChannelProxy.attach(&channel, &partner);
        let task = tokio::spawn(serve(server, Arc::clone(&channel), outbound, Arc::new(Protocol::new())));

        let (mut rd, mut wr) = tokio::io::split(client);
        let wire = OutputStream::command("1", "Any", "thing").finish();
        wr.write_all(&wire).await.unwrap();
        assert_eq!(partner_rx.recv().await.unwrap(), wire);

        wr.shutdown().await.unwrap();
        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(channel.is_closed());
        assert!(partner.is_closed());
    }

    #[tokio::test]
    async fn test_close_stops_reader() {
        let (_client, server) = duplex(64);
        let (channel, outbound) = Channel::detached("client");
        let task = tokio::spawn(relay(server, Arc::clone(&channel), outbound));

        channel.close();
        assert!(task.await.unwrap().is_ok());
    }
}
