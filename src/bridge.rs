//! Blocking transport the protocol engine runs its handshake over.
//!
//! Inbound datagrams are pushed by the event loop with [`enqueue`] and drained
//! by the engine's blocking [`receive`]. Records the engine sends become
//! control packets on the channel's write path.
//!
//! [`enqueue`]: RawDatagramBridge::enqueue
//! [`receive`]: DatagramTransport::receive

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;

use crate::channel::{Channel, WriteContext};
use crate::engine::DatagramTransport;
use crate::packet::{Datagram, Packet};
use crate::{Config, Error};

pub struct RawDatagramBridge {
    send_limit: usize,
    receive_limit: usize,
    channel: Mutex<Option<Channel>>,
    remote: Mutex<Option<SocketAddr>>,
    last_seen: Mutex<Option<SocketAddr>>,
    queue_tx: Sender<Datagram>,
    queue_rx: Receiver<Datagram>,
    // Dropping the sender wakes every blocked receive.
    interrupt_tx: Mutex<Option<Sender<()>>>,
    interrupt_rx: Receiver<()>,
}

impl RawDatagramBridge {
    pub fn new(config: &Config) -> Self {
        Self::with_limits(config.send_limit(), config.receive_limit())
    }

    pub fn with_limits(send_limit: usize, receive_limit: usize) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(0);
        RawDatagramBridge {
            send_limit,
            receive_limit,
            channel: Mutex::new(None),
            remote: Mutex::new(None),
            last_seen: Mutex::new(None),
            queue_tx,
            queue_rx,
            interrupt_tx: Mutex::new(Some(interrupt_tx)),
            interrupt_rx,
        }
    }

    /// The channel control packets are written to.
    pub fn set_channel(&self, channel: Channel) {
        *self.channel.lock() = Some(channel);
    }

    /// Where control packets go.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote.lock().or(*self.last_seen.lock())
    }

    pub fn set_remote_address(&self, addr: SocketAddr) {
        let previous = self.remote.lock().replace(addr);
        if previous != Some(addr) {
            debug!("Remote address {:?} -> {}", previous, addr);
        }
    }

    /// Queue an inbound datagram for the engine. Never blocks.
    pub fn enqueue(&self, datagram: Datagram) {
        *self.last_seen.lock() = Some(datagram.sender());
        // The receiver lives in self, so the queue cannot be disconnected.
        let _ = self.queue_tx.send(datagram);
    }

    /// Whether datagrams are waiting to be received.
    pub fn has_packets(&self) -> bool {
        !self.queue_rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.interrupt_tx.lock().is_none()
    }
}

impl DatagramTransport for RawDatagramBridge {
    fn send(&self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() > self.send_limit {
            return Err(Error::OversizedRecord {
                len: buf.len(),
                limit: self.send_limit,
            });
        }

        let channel = self.channel.lock().clone().ok_or(Error::NotConnected)?;
        let remote = self.remote_address().ok_or(Error::NotConnected)?;

        trace!("Bridge send {} bytes to {}", buf.len(), remote);
        channel.write_with(Packet::control(buf.to_vec(), remote), WriteContext::none());
        Ok(())
    }

    fn receive(&self, buf: &mut [u8], wait: Duration) -> Result<Option<usize>, Error> {
        if self.is_closed() {
            return Err(Error::Interrupted);
        }

        select! {
            recv(self.queue_rx) -> datagram => {
                let Ok(datagram) = datagram else {
                    return Err(Error::Interrupted);
                };
                let payload = datagram.payload();
                let n = payload.len().min(buf.len());
                if n < payload.len() {
                    warn!("Truncating {} byte datagram to {}", payload.len(), n);
                }
                buf[..n].copy_from_slice(&payload[..n]);
                Ok(Some(n))
            }
            recv(self.interrupt_rx) -> _ => Err(Error::Interrupted),
            default(wait) => Ok(None),
        }
    }

    fn send_limit(&self) -> usize {
        self.send_limit
    }

    fn receive_limit(&self) -> usize {
        self.receive_limit
    }

    fn close(&self) {
        if self.interrupt_tx.lock().take().is_some() {
            debug!("Bridge closed");
        }
        self.channel.lock().take();
    }
}

impl fmt::Debug for RawDatagramBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDatagramBridge")
            .field("send_limit", &self.send_limit)
            .field("receive_limit", &self.receive_limit)
            .field("remote", &self.remote_address())
            .field("queued", &self.queue_rx.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
