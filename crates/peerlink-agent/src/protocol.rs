//! Command registry and dispatch

use crate::channel::Channel;
use peerlink_proto::{ArgReader, Message, MessageKind, OutputStream, ProtocolError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Handler for one command of one service
///
/// Runs on the event-loop thread. Handlers write their own replies; an
/// `Err` makes the engine answer with an error reply instead.
pub trait CommandHandler: Send + Sync {
    /// Handle a command carrying `token`, reading arguments from `args`
    fn handle(&self, token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>) -> Result<(), ProtocolError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&str, &mut ArgReader<'_>, &Arc<Channel>) -> Result<(), ProtocolError> + Send + Sync,
{
    fn handle(&self, token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>) -> Result<(), ProtocolError> {
        self(token, args, channel)
    }
}

/// Registered command handlers by service and command name
#[derive(Default)]
pub struct Protocol {
    services: HashMap<String, HashMap<String, Arc<dyn CommandHandler>>>,
}

impl Protocol {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `service`/`name`, replacing any previous one
    pub fn register(&mut self, service: &str, name: &str, handler: Arc<dyn CommandHandler>) {
        debug!("Registered command {} {}", service, name);
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(name.to_string(), handler);
    }

    /// Names of services with at least one command
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Route one received message
    pub fn dispatch(&self, message: &Message, channel: &Arc<Channel>) {
        if message.kind != MessageKind::Command {
            trace!("{}: ignoring {:?} message", channel.name(), message.kind);
            return;
        }
        let token = message.token.as_deref().unwrap_or_default();
        let service = message.service.as_deref().unwrap_or_default();
        let name = message.name.as_deref().unwrap_or_default();

        let Some(handler) = self.services.get(service).and_then(|cmds| cmds.get(name)) else {
            debug!("{}: unknown command {} {}", channel.name(), service, name);
            channel.send(OutputStream::not_found(token));
            return;
        };

        debug!("{}: command {} {} token={}", channel.name(), service, name, token);
        let mut args = message.arg_reader();
        if let Err(e) = handler.handle(token, &mut args, channel) {
            warn!("{}: {} {} failed: {}", channel.name(), service, name, e);
            let mut out = OutputStream::reply(token);
            out.write_errno(e.code());
            channel.send(out.finish());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_proto::message::ErrorReport;
    use peerlink_proto::{codes, MessageCodec};

    fn command(token: &str, service: &str, name: &str, args: &[u8]) -> Message {
        let mut out = OutputStream::command(token, service, name);
        out.write_bytes(args);
        let mut codec = MessageCodec::new();
        codec.feed(&out.finish());
        codec.try_decode_message().unwrap().unwrap()
    }

    fn reply_of(bytes: &[u8]) -> Message {
        let mut codec = MessageCodec::new();
        codec.feed(bytes);
        codec.try_decode_message().unwrap().unwrap()
    }

    fn echo_protocol() -> Protocol {
        let mut protocol = Protocol::new();
        protocol.register(
            "Test",
            "echo",
            Arc::new(|token: &str, args: &mut ArgReader<'_>, channel: &Arc<Channel>| -> Result<(), ProtocolError> {
                let value: String = args.read_json()?;
                args.expect_nul()?;
                let mut out = OutputStream::reply(token);
                out.write_errno(0);
                out.write_json(&value)?;
                out.write_byte(0);
                channel.send(out.finish());
                Ok(())
            }),
        );
        protocol
    }

    #[test]
    fn test_dispatch_to_handler() {
        let protocol = echo_protocol();
        let (channel, mut rx) = Channel::detached("test");

        protocol.dispatch(&command("1", "Test", "echo", b"\"hi\"\0"), &channel);
        let reply = reply_of(&rx.try_recv().unwrap());
        assert_eq!(reply.kind, MessageKind::Reply);
        assert_eq!(reply.token.as_deref(), Some("1"));
        assert_eq!(&reply.args[..], b"\0\"hi\"\0");
    }

    #[test]
    fn test_unknown_command_gets_not_found() {
        let protocol = echo_protocol();
        let (channel, mut rx) = Channel::detached("test");

        protocol.dispatch(&command("2", "Test", "nope", b""), &channel);
        protocol.dispatch(&command("3", "Other", "echo", b""), &channel);
        for token in ["2", "3"] {
            let reply = reply_of(&rx.try_recv().unwrap());
            assert_eq!(reply.kind, MessageKind::NotFound);
            assert_eq!(reply.token.as_deref(), Some(token));
        }
    }

    #[test]
    fn test_syntax_error_replies_and_keeps_channel() {
        let protocol = echo_protocol();
        let (channel, mut rx) = Channel::detached("test");

        protocol.dispatch(&command("4", "Test", "echo", b"not json\0"), &channel);
        let reply = reply_of(&rx.try_recv().unwrap());
        let (code, _) = ErrorReport::read_field(&reply.args).unwrap();
        assert_eq!(code, codes::JSON_SYNTAX);
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_non_commands_ignored() {
        let protocol = echo_protocol();
        let (channel, mut rx) = Channel::detached("test");
        let msg = reply_of(&OutputStream::not_found("5"));

        protocol.dispatch(&msg, &channel);
        assert!(rx.try_recv().is_err());
        assert_eq!(protocol.services(), vec!["Test"]);
    }
}
