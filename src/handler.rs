//! The pipeline stage between a channel and its handshake engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::RawDatagramBridge;
use crate::channel::{Channel, ChannelHandler, WriteContext, WriteContextQueue};
use crate::engine::{DatagramTransport, ProtocolEngine};
use crate::handshake::HandshakeEngine;
use crate::packet::{Datagram, Packet, PacketKind};
use crate::role::{ClientRole, HandshakeRole, RebindPolicy, ServerRole};
use crate::{Config, Error};

pub type ClientHandler = DtlsHandler<ClientRole>;
pub type ServerHandler = DtlsHandler<ServerRole>;

/// Runs the handshake when the channel goes active and routes traffic
/// through the handshake engine afterwards.
///
/// Application writes are encrypted by the engine's handle. The records that
/// produces come back as control writes and complete the application write's
/// context, in FIFO order.
#[derive(Debug)]
pub struct DtlsHandler<R: HandshakeRole> {
    role: Arc<R>,
    engine: Arc<dyn ProtocolEngine>,
    bridge: Arc<RawDatagramBridge>,
    handshake: Arc<HandshakeEngine>,
    contexts: Arc<WriteContextQueue>,
    decrypt_poll_interval: Duration,
    rebound: AtomicBool,
}

impl<R: HandshakeRole> DtlsHandler<R> {
    pub fn new(role: Arc<R>, engine: Arc<dyn ProtocolEngine>, config: &Config) -> Self {
        let bridge = Arc::new(RawDatagramBridge::new(config));
        let contexts = Arc::new(WriteContextQueue::default());
        let handshake = Arc::new(HandshakeEngine::new(
            bridge.clone(),
            contexts.clone(),
            config.receive_wait(),
        ));
        DtlsHandler {
            role,
            engine,
            bridge,
            handshake,
            contexts,
            decrypt_poll_interval: config.decrypt_poll_interval(),
            rebound: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> &Arc<R> {
        &self.role
    }

    pub fn handshake(&self) -> &Arc<HandshakeEngine> {
        &self.handshake
    }

    pub fn bridge(&self) -> &Arc<RawDatagramBridge> {
        &self.bridge
    }

    fn rebind(&self, datagram: &Datagram) {
        match self.role.rebind_policy() {
            RebindPolicy::EveryPacket => self.bridge.set_remote_address(datagram.sender()),
            RebindPolicy::FirstPacket => {
                if !self.rebound.swap(true, Ordering::AcqRel) {
                    self.bridge.set_remote_address(datagram.sender());
                }
            }
        }
    }
}

impl<R: HandshakeRole> ChannelHandler for DtlsHandler<R> {
    fn channel_active(&self, channel: &Channel) {
        self.bridge.set_channel(channel.clone());
        if let Some(remote) = self.role.default_remote() {
            self.bridge.set_remote_address(remote);
        }

        let emitter = channel.clone();
        self.handshake.start_polling(
            channel.runtime(),
            self.decrypt_poll_interval,
            move |datagram| emitter.fire_read(datagram),
        );

        let id = channel.id();
        let role = self.role.clone();
        let engine = self.engine.clone();
        let bridge = self.bridge.clone();
        let handshake = self.handshake.clone();
        let emitter = channel.clone();

        channel.runtime().spawn_blocking(move || {
            debug!("{} handshake starting", id);
            let transport: Arc<dyn DatagramTransport> = bridge.clone();
            match role.handshake(&*engine, transport) {
                // Torn down while the engine finished.
                Ok(handle) if bridge.is_closed() => {
                    debug!("{} handshake finished after close", id);
                    handle.close();
                }
                Ok(handle) => {
                    handshake.initialize(handle);
                    info!("{} handshake complete", id);
                    // Records that arrived while the handshake finished.
                    handshake.read(|datagram| emitter.fire_read(datagram));
                }
                Err(Error::Interrupted) => debug!("{} handshake interrupted", id),
                Err(e) => error!("{} handshake failed: {}", id, e),
            }
        });
    }

    fn channel_read(&self, channel: &Channel, datagram: Datagram) {
        self.rebind(&datagram);
        self.bridge.enqueue(datagram);

        // Until the handle is published the handshake consumes the bridge.
        if !self.handshake.is_initialized() {
            return;
        }

        let handshake = self.handshake.clone();
        let emitter = channel.clone();
        channel.runtime().spawn_blocking(move || {
            let n = handshake.read(|datagram| emitter.fire_read(datagram));
            trace!("{} decrypted {} datagrams", emitter.id(), n);
        });
    }

    fn write(&self, channel: &Channel, packet: Packet, ctx: WriteContext) {
        match packet.kind() {
            PacketKind::Application => self.handshake.write(packet, ctx),
            PacketKind::Control => {
                let ctx = self.contexts.pop().unwrap_or(ctx);
                channel.write_raw(packet, ctx);
            }
        }
    }

    fn connect(&self, _channel: &Channel, remote: std::net::SocketAddr) {
        self.bridge.set_remote_address(remote);
    }

    fn channel_inactive(&self, channel: &Channel) {
        debug!("{} inactive, closing bridge", channel.id());
        self.bridge.close();
        self.handshake.close();
    }
}
