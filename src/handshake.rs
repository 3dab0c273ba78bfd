//! The encrypted handle of one connection, and the traffic waiting for it.
//!
//! Application packets written before the handshake completes park in a
//! pending queue. [`HandshakeEngine::initialize`] flushes that queue through
//! the new handle and only then publishes the handle, so nobody observes an
//! initialized engine while packets are still parked.

use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::bridge::RawDatagramBridge;
use crate::channel::{WriteContext, WriteContextQueue};
use crate::engine::DatagramTransport;
use crate::packet::{Datagram, Packet};
use crate::timer::PeriodicTask;
use crate::Error;

/// Application packets waiting for the handshake, with their write contexts.
///
/// The Debug implementation only shows counts, not payload data.
pub(crate) struct PendingQueue(VecDeque<(Packet, WriteContext)>);

impl PendingQueue {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }
}

impl Deref for PendingQueue {
    type Target = VecDeque<(Packet, WriteContext)>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PendingQueue {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_bytes: usize = self.0.iter().map(|(p, _)| p.payload().len()).sum();
        f.debug_struct("PendingQueue")
            .field("packets", &self.0.len())
            .field("total_bytes", &total_bytes)
            .finish()
    }
}

pub struct HandshakeEngine {
    bridge: Arc<RawDatagramBridge>,
    contexts: Arc<WriteContextQueue>,
    receive_wait: Duration,
    pending: Mutex<PendingQueue>,
    handle: OnceCell<Arc<dyn DatagramTransport>>,
    read_lock: Mutex<()>,
    poller: Mutex<Option<PeriodicTask>>,
}

impl HandshakeEngine {
    pub(crate) fn new(
        bridge: Arc<RawDatagramBridge>,
        contexts: Arc<WriteContextQueue>,
        receive_wait: Duration,
    ) -> Self {
        HandshakeEngine {
            bridge,
            contexts,
            receive_wait,
            pending: Mutex::new(PendingQueue::new()),
            handle: OnceCell::new(),
            read_lock: Mutex::new(()),
            poller: Mutex::new(None),
        }
    }

    /// Whether the handle is published. Once true, stays true.
    pub fn is_initialized(&self) -> bool {
        self.handle.get().is_some()
    }

    /// Flush pending packets through `handle`, then publish it.
    pub fn initialize(&self, handle: Arc<dyn DatagramTransport>) {
        let mut pending = self.pending.lock();
        if self.is_initialized() {
            warn!("Handshake engine already initialized, ignoring new handle");
            return;
        }

        let flushed = pending.len();
        while let Some((packet, ctx)) = pending.pop_front() {
            self.forward(&*handle, packet, ctx);
        }

        // Publish while still holding the queue, a concurrent write either
        // parked before the flush or sees the handle.
        let _ = self.handle.set(handle);
        debug!("Handshake engine initialized, flushed {} pending", flushed);
    }

    /// Forward `packet` through the handle, or park it until there is one.
    pub(crate) fn write(&self, packet: Packet, ctx: WriteContext) {
        let mut pending = self.pending.lock();
        match self.handle.get() {
            Some(handle) => self.forward(&**handle, packet, ctx),
            None => {
                trace!("Parking {:?} until handshake completes", packet);
                pending.push_back((packet, ctx));
            }
        }
    }

    // Callers hold the pending lock, so application writes are serialized
    // and pop_back withdraws this write's context.
    fn forward(&self, handle: &dyn DatagramTransport, packet: Packet, ctx: WriteContext) {
        self.contexts.push(ctx);
        if let Err(e) = handle.send(packet.payload()) {
            warn!("Application write of {} bytes failed: {}", packet.payload().len(), e);
            if let Some(ctx) = self.contexts.pop_back() {
                ctx.complete(Err(e));
            }
        }
    }

    /// Decrypt everything the bridge has queued, in order.
    ///
    /// Returns the number of datagrams emitted. Does nothing before the
    /// handle is published; the handshake consumes the bridge until then.
    pub fn read(&self, mut emit: impl FnMut(Datagram)) -> usize {
        let Some(handle) = self.handle.get() else {
            return 0;
        };
        let _guard = self.read_lock.lock();

        let mut buf = vec![0u8; handle.receive_limit()];
        let mut emitted = 0;
        while self.bridge.has_packets() {
            match handle.receive(&mut buf, self.receive_wait) {
                Ok(Some(n)) if n > 0 => {
                    emit(Datagram::new(filled(&buf, n).to_vec(), self.peer()));
                    emitted += 1;
                }
                // A record without application data.
                Ok(_) => {}
                Err(e) => {
                    debug!("Read stopped: {}", e);
                    break;
                }
            }
        }
        emitted
    }

    /// Opportunistic receive for data that arrived without a read. Waits once
    /// for a datagram, then drains whatever else is queued.
    pub fn poll_once(&self, mut emit: impl FnMut(Datagram)) {
        let Some(handle) = self.handle.get() else {
            return;
        };
        // A read in progress drains everything anyway.
        let Some(_guard) = self.read_lock.try_lock() else {
            return;
        };

        let mut buf = vec![0u8; handle.receive_limit()];
        loop {
            match handle.receive(&mut buf, self.receive_wait) {
                Ok(Some(n)) if n > 0 => {
                    trace!("Poll picked up {} bytes", n);
                    emit(Datagram::new(filled(&buf, n).to_vec(), self.peer()));
                }
                Ok(_) => {}
                Err(e) => {
                    trace!("Poll receive: {}", e);
                    return;
                }
            }
            if !self.bridge.has_packets() {
                return;
            }
        }
    }

    /// Run [`poll_once`](Self::poll_once) every `period` until [`close`](Self::close).
    pub fn start_polling<F>(self: &Arc<Self>, runtime: &Handle, period: Duration, emit: F)
    where
        F: Fn(Datagram) + Send + Sync + 'static,
    {
        let engine = Arc::downgrade(self);
        let task = PeriodicTask::spawn(runtime, "decrypt-poll", period, move || {
            if let Some(engine) = engine.upgrade() {
                engine.poll_once(&emit);
            }
        });
        if let Some(previous) = self.poller.lock().replace(task) {
            previous.cancel();
        }
    }

    /// Stop polling, fail parked writes and close the handle, if any.
    pub fn close(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel();
        }

        let parked: Vec<_> = self.pending.lock().drain(..).collect();
        if !parked.is_empty() {
            debug!("Failing {} parked writes", parked.len());
        }
        for (_, ctx) in parked {
            ctx.complete(Err(Error::Closed));
        }

        if let Some(handle) = self.handle.get() {
            handle.close();
        }
    }

    fn peer(&self) -> SocketAddr {
        self.bridge
            .remote_address()
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }
}

// The first `n` bytes of `buf`, trusting the handle only up to the buffer.
fn filled(buf: &[u8], n: usize) -> &[u8] {
    if n > buf.len() {
        warn!("Handle reported {} bytes into a {} byte buffer", n, buf.len());
    }
    &buf[..n.min(buf.len())]
}

impl fmt::Debug for HandshakeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("initialized", &self.is_initialized())
            .field("pending", &*self.pending.lock())
            .field("contexts", &self.contexts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use super::*;

    /// Handle that records what it is asked to send.
    #[derive(Debug, Default)]
    struct Recording {
        sent: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl DatagramTransport for Recording {
        fn send(&self, buf: &[u8]) -> Result<(), Error> {
            if buf.len() > self.send_limit() {
                return Err(Error::OversizedRecord {
                    len: buf.len(),
                    limit: self.send_limit(),
                });
            }
            self.sent.lock().push(buf.to_vec());
            Ok(())
        }

        fn receive(&self, _buf: &mut [u8], _wait: Duration) -> Result<Option<usize>, Error> {
            Ok(None)
        }

        fn send_limit(&self) -> usize {
            16
        }

        fn receive_limit(&self) -> usize {
            16
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Handle that passes bridge datagrams through unchanged.
    #[derive(Debug)]
    struct Passthrough(Arc<RawDatagramBridge>);

    impl DatagramTransport for Passthrough {
        fn send(&self, buf: &[u8]) -> Result<(), Error> {
            self.0.send(buf)
        }

        fn receive(&self, buf: &mut [u8], wait: Duration) -> Result<Option<usize>, Error> {
            self.0.receive(buf, wait)
        }

        fn send_limit(&self) -> usize {
            self.0.send_limit()
        }

        fn receive_limit(&self) -> usize {
            self.0.receive_limit()
        }

        fn close(&self) {
            self.0.close()
        }
    }

    /// Handle that claims more bytes than fit in the buffer.
    #[derive(Debug)]
    struct Overreporting(Arc<RawDatagramBridge>);

    impl DatagramTransport for Overreporting {
        fn send(&self, buf: &[u8]) -> Result<(), Error> {
            self.0.send(buf)
        }

        fn receive(&self, buf: &mut [u8], wait: Duration) -> Result<Option<usize>, Error> {
            Ok(self.0.receive(buf, wait)?.map(|_| buf.len() + 100))
        }

        fn send_limit(&self) -> usize {
            self.0.send_limit()
        }

        fn receive_limit(&self) -> usize {
            self.0.receive_limit()
        }

        fn close(&self) {
            self.0.close()
        }
    }

    fn engine() -> (Arc<HandshakeEngine>, Arc<RawDatagramBridge>) {
        let bridge = Arc::new(RawDatagramBridge::with_limits(64, 64));
        let engine = HandshakeEngine::new(
            bridge.clone(),
            Arc::new(WriteContextQueue::default()),
            Duration::from_millis(20),
        );
        (Arc::new(engine), bridge)
    }

    fn app(byte: u8) -> Packet {
        Packet::application(vec![byte], "127.0.0.1:1".parse().unwrap())
    }

    #[test]
    fn pending_flushes_in_order_before_later_writes() {
        let (engine, _) = engine();
        let handle = Arc::new(Recording::default());

        for b in 1..=3 {
            engine.write(app(b), WriteContext::none());
        }
        assert!(!engine.is_initialized());
        assert!(handle.sent.lock().is_empty());

        engine.initialize(handle.clone());
        for b in 4..=5 {
            engine.write(app(b), WriteContext::none());
        }

        let sent: Vec<u8> = handle.sent.lock().iter().map(|p| p[0]).collect();
        assert_eq!(sent, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn concurrent_writers_keep_their_order() {
        let (engine, _) = engine();
        let handle = Arc::new(Recording::default());

        let writers: Vec<_> = (0..4u8)
            .map(|t| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for seq in 0..100u8 {
                        let packet = Packet::application(vec![t, seq], "127.0.0.1:1".parse().unwrap());
                        engine.write(packet, WriteContext::none());
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(1));
        engine.initialize(handle.clone());
        for w in writers {
            w.join().unwrap();
        }

        let sent = handle.sent.lock();
        assert_eq!(sent.len(), 400);
        for t in 0..4u8 {
            let seqs: Vec<u8> = sent.iter().filter(|p| p[0] == t).map(|p| p[1]).collect();
            assert_eq!(seqs, (0..100u8).collect::<Vec<_>>());
        }
    }

    #[test]
    fn initialized_is_monotonic() {
        let (engine, _) = engine();
        assert!(!engine.is_initialized());
        engine.initialize(Arc::new(Recording::default()));

        let observers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || (0..1000).all(|_| engine.is_initialized()))
            })
            .collect();
        for o in observers {
            assert!(o.join().unwrap());
        }

        // A second handle does not replace the first.
        let second = Arc::new(Recording::default());
        engine.initialize(second.clone());
        engine.write(app(9), WriteContext::none());
        assert!(second.sent.lock().is_empty());
        assert!(engine.is_initialized());
    }

    #[test]
    fn failed_send_completes_context_with_error() {
        let (engine, _) = engine();
        engine.initialize(Arc::new(Recording::default()));

        let (ctx, mut rx) = WriteContext::new();
        let big = Packet::application(vec![0; 17], "127.0.0.1:1".parse().unwrap());
        engine.write(big, ctx);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::OversizedRecord { len: 17, limit: 16 })
        ));
        assert_eq!(engine.contexts.len(), 0);
    }

    #[test]
    fn read_drains_bridge_in_order() {
        let (engine, bridge) = engine();
        let peer: SocketAddr = "127.0.0.1:7".parse().unwrap();
        bridge.enqueue(Datagram::new(vec![1], peer));
        bridge.enqueue(Datagram::new(vec![2, 2], peer));

        // Nothing to decrypt with before the handshake.
        assert_eq!(engine.read(|_| panic!("no handle yet")), 0);
        assert!(bridge.has_packets());

        engine.initialize(Arc::new(Passthrough(bridge.clone())));
        let mut out = Vec::new();
        assert_eq!(engine.read(|d| out.push(d)), 2);
        assert_eq!(out[0].payload(), &[1]);
        assert_eq!(out[1].payload(), &[2, 2]);
        assert_eq!(out[1].sender(), peer);
        assert!(!bridge.has_packets());
    }

    #[test]
    fn poll_picks_up_stray_data() {
        let (engine, bridge) = engine();
        engine.initialize(Arc::new(Passthrough(bridge.clone())));
        bridge.enqueue(Datagram::new(vec![5], "127.0.0.1:7".parse().unwrap()));

        let mut out = Vec::new();
        engine.poll_once(|d| out.push(d));
        assert_eq!(out.len(), 1);

        // Nothing left, the poll waits out its bound and emits nothing.
        engine.poll_once(|d| out.push(d));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn overlong_receive_is_clamped() {
        let (engine, bridge) = engine();
        engine.initialize(Arc::new(Overreporting(bridge.clone())));
        let peer: SocketAddr = "127.0.0.1:7".parse().unwrap();

        bridge.enqueue(Datagram::new(vec![3, 3], peer));
        let mut out = Vec::new();
        assert_eq!(engine.read(|d| out.push(d)), 1);

        bridge.enqueue(Datagram::new(vec![4], peer));
        engine.poll_once(|d| out.push(d));

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.payload().len() == bridge.receive_limit()));
        assert_eq!(&out[0].payload()[..2], &[3, 3]);
        assert_eq!(out[1].payload()[0], 4);
    }

    #[test]
    fn close_fails_parked_writes() {
        let (engine, _) = engine();
        let (ctx, mut rx) = WriteContext::new();
        engine.write(app(1), ctx);
        engine.close();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Closed)));
        assert!(!engine.is_initialized());
    }

    #[test]
    fn close_closes_handle() {
        let (engine, _) = engine();
        let handle = Arc::new(Recording::default());
        engine.initialize(handle.clone());
        engine.close();
        assert!(handle.closed.load(Ordering::SeqCst));
        assert!(engine.is_initialized());
    }
}
