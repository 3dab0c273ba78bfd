//! Non-blocking UDP channels.
//!
//! A [`Channel`] owns a socket and an I/O task on the event loop. One
//! [`ChannelHandler`] may be installed in front of it to intercept inbound
//! datagrams and outbound writes; without one, writes go straight to the socket
//! and datagrams straight to the inbound receiver.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::packet::{Datagram, Packet};
use crate::{Config, Error};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

// Consecutive recv_from failures before the I/O task gives up.
const MAX_RECV_FAILURES: u32 = 16;
const MAX_RECV_BACKOFF: Duration = Duration::from_secs(1);

/// Process unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Lifecycle of a channel. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
    Registered,
    Active,
    Disconnected,
    Deregistered,
    Closed,
}

/// Interceptor installed in front of a channel.
///
/// Callbacks run on the event loop and must not block.
pub trait ChannelHandler: Send + Sync + fmt::Debug + 'static {
    /// The channel's I/O task is running.
    fn channel_active(&self, channel: &Channel);

    /// A datagram arrived from the network.
    fn channel_read(&self, channel: &Channel, datagram: Datagram);

    /// A write was requested. Forward with [`Channel::write_raw`] when done.
    fn write(&self, channel: &Channel, packet: Packet, ctx: WriteContext);

    /// The channel was pointed at a new remote address.
    fn connect(&self, _channel: &Channel, _remote: SocketAddr) {}

    /// The channel was disconnected.
    fn channel_inactive(&self, _channel: &Channel) {}
}

/// Completion signal of one write.
pub struct WriteContext(Option<oneshot::Sender<Result<(), Error>>>);

impl WriteContext {
    pub fn new() -> (Self, oneshot::Receiver<Result<(), Error>>) {
        let (tx, rx) = oneshot::channel();
        (WriteContext(Some(tx)), rx)
    }

    /// A context nobody waits on.
    pub fn none() -> Self {
        WriteContext(None)
    }

    pub fn complete(mut self, result: Result<(), Error>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(result);
        }
    }
}

impl fmt::Debug for WriteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteContext")
            .field("waiting", &self.0.is_some())
            .finish()
    }
}

/// FIFO of write contexts waiting for the record their write produces.
#[derive(Default)]
pub(crate) struct WriteContextQueue(Mutex<VecDeque<WriteContext>>);

impl WriteContextQueue {
    pub fn push(&self, ctx: WriteContext) {
        self.0.lock().push_back(ctx);
    }

    pub fn pop(&self) -> Option<WriteContext> {
        self.0.lock().pop_front()
    }

    /// Withdraw the most recent push.
    pub fn pop_back(&self) -> Option<WriteContext> {
        self.0.lock().pop_back()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl fmt::Debug for WriteContextQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteContextQueue")
            .field("contexts", &self.len())
            .finish()
    }
}

struct Outbound {
    packet: Packet,
    ctx: WriteContext,
}

/// A UDP endpoint bound to at most one remote address at a time.
///
/// Cheap to clone; clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    id: ChannelId,
    local_addr: SocketAddr,
    receive_limit: usize,
    runtime: Handle,
    remote: Mutex<Option<SocketAddr>>,
    state: Mutex<ChannelState>,
    handler: OnceCell<Arc<dyn ChannelHandler>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    inbound_tx: mpsc::UnboundedSender<Datagram>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    cancel: CancellationToken,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    fn new(
        socket: UdpSocket,
        remote: Option<SocketAddr>,
        receive_limit: usize,
        runtime: Handle,
    ) -> Result<Self, Error> {
        let local_addr = socket.local_addr()?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let channel = Channel {
            inner: Arc::new(Inner {
                id: ChannelId::next(),
                local_addr,
                receive_limit,
                runtime,
                remote: Mutex::new(remote),
                state: Mutex::new(ChannelState::Registered),
                handler: OnceCell::new(),
                socket: Mutex::new(Some(Arc::new(socket))),
                outbound_tx: Mutex::new(Some(outbound_tx)),
                outbound_rx: Mutex::new(Some(outbound_rx)),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                cancel: CancellationToken::new(),
                io_task: Mutex::new(None),
            }),
        };
        debug!("{} registered on {}", channel.id(), local_addr);
        Ok(channel)
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote.lock()
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Install the channel's handler. Only one handler can ever be installed.
    pub fn install(&self, handler: Arc<dyn ChannelHandler>) -> Result<(), Error> {
        self.inner
            .handler
            .set(handler)
            .map_err(|_| Error::Config(format!("{} already has a handler", self.id())))
    }

    fn handler(&self) -> Option<&Arc<dyn ChannelHandler>> {
        self.inner.handler.get()
    }

    /// Start the I/O task and notify the handler.
    pub fn activate(&self) -> Result<(), Error> {
        self.transition(ChannelState::Registered, ChannelState::Active)?;

        let socket = self.inner.socket.lock().clone().ok_or(Error::Closed)?;
        let outbound = self.inner.outbound_rx.lock().take().ok_or(Error::Closed)?;
        let task = self.inner.runtime.spawn(run_io(
            Arc::downgrade(&self.inner),
            socket,
            outbound,
            self.inner.cancel.clone(),
            self.inner.receive_limit,
        ));
        *self.inner.io_task.lock() = Some(task);

        debug!("{} active", self.id());
        if let Some(handler) = self.handler() {
            handler.channel_active(self);
        }
        Ok(())
    }

    /// Point the channel at `remote`.
    pub fn connect(&self, remote: SocketAddr) {
        *self.inner.remote.lock() = Some(remote);
        if let Some(handler) = self.handler() {
            handler.connect(self, remote);
        }
    }

    /// Write through the handler. Resolves once the socket accepted the
    /// datagram that carries it.
    pub fn write(&self, packet: Packet) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let (ctx, rx) = WriteContext::new();
        self.write_with(packet, ctx);
        async move { rx.await.unwrap_or(Err(Error::Closed)) }
    }

    /// Write through the handler, completing `ctx`.
    pub fn write_with(&self, packet: Packet, ctx: WriteContext) {
        if !self.is_active() {
            ctx.complete(Err(Error::Closed));
            return;
        }
        match self.handler() {
            Some(handler) => handler.write(self, packet, ctx),
            None => self.write_raw(packet, ctx),
        }
    }

    /// Write straight to the socket, bypassing the handler.
    pub fn write_raw(&self, packet: Packet, ctx: WriteContext) {
        let tx = self.inner.outbound_tx.lock().clone();
        match tx {
            Some(tx) => {
                if let Err(mpsc::error::SendError(out)) = tx.send(Outbound { packet, ctx }) {
                    out.ctx.complete(Err(Error::Closed));
                }
            }
            None => ctx.complete(Err(Error::Closed)),
        }
    }

    /// Pass a datagram to whoever reads this channel.
    pub fn fire_read(&self, datagram: Datagram) {
        if self.inner.inbound_tx.send(datagram).is_err() {
            trace!("{} inbound receiver gone, dropping datagram", self.id());
        }
    }

    /// The receiving end of [`fire_read`](Channel::fire_read). Can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Datagram>> {
        self.inner.inbound_rx.lock().take()
    }

    fn dispatch_read(&self, datagram: Datagram) {
        trace!(
            "{} received {} bytes from {}",
            self.id(),
            datagram.payload().len(),
            datagram.sender()
        );
        match self.handler() {
            Some(handler) => handler.channel_read(self, datagram),
            None => self.fire_read(datagram),
        }
    }

    /// Stop treating the channel as connected.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.transition(ChannelState::Active, ChannelState::Disconnected)?;
        debug!("{} disconnected", self.id());
        if let Some(handler) = self.handler() {
            handler.channel_inactive(self);
        }
        Ok(())
    }

    /// Stop the I/O task.
    pub async fn deregister(&self) -> Result<(), Error> {
        self.transition(ChannelState::Disconnected, ChannelState::Deregistered)?;
        self.stop_io().await;
        debug!("{} deregistered", self.id());
        Ok(())
    }

    /// Release the socket. Closing a closed channel does nothing.
    pub async fn close(&self) -> Result<(), Error> {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            *state = ChannelState::Closed;
            previous
        };
        match previous {
            ChannelState::Closed => return Ok(()),
            ChannelState::Active => {
                if let Some(handler) = self.handler() {
                    handler.channel_inactive(self);
                }
                self.stop_io().await;
            }
            ChannelState::Disconnected => self.stop_io().await,
            ChannelState::Registered | ChannelState::Deregistered => {}
        }
        self.inner.outbound_tx.lock().take();
        self.inner.socket.lock().take();
        debug!("{} closed", self.id());
        Ok(())
    }

    async fn stop_io(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.io_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{} I/O task ended abnormally: {}", self.id(), e);
            }
        }
    }

    fn transition(&self, expected: ChannelState, next: ChannelState) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if *state != expected {
            return Err(Error::ChannelState {
                expected,
                actual: *state,
            });
        }
        *state = next;
        Ok(())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local_addr)
            .field("remote", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}

async fn run_io(
    inner: Weak<Inner>,
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    receive_limit: usize,
) {
    let mut buf = vec![0u8; receive_limit];
    let mut failures = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    failures = 0;
                    let Some(inner) = inner.upgrade() else { break };
                    let channel = Channel { inner };
                    channel.dispatch_read(Datagram::new(buf[..n].to_vec(), from));
                }
                Err(e) => {
                    failures += 1;
                    let Some(backoff) = recv_backoff(failures) else {
                        error!("recv_from failed {} times in a row, stopping I/O: {}", failures, e);
                        break;
                    };
                    warn!("recv_from failed, retrying in {:?}: {}", backoff, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            },
            out = outbound.recv() => {
                let Some(Outbound { packet, ctx }) = out else { break };
                let result = socket
                    .send_to(packet.payload(), packet.recipient())
                    .await
                    .map(|_| ())
                    .map_err(Error::from);
                if let Err(e) = &result {
                    debug!("send_to {} failed: {}", packet.recipient(), e);
                }
                ctx.complete(result);
            }
        }
    }
}

/// Wait before the next receive after `failures` consecutive errors, doubling
/// from 10ms. `None` once it is time to give up.
fn recv_backoff(failures: u32) -> Option<Duration> {
    if failures >= MAX_RECV_FAILURES {
        return None;
    }
    let millis = 10u64.saturating_mul(1 << failures.saturating_sub(1).min(16));
    Some(Duration::from_millis(millis).min(MAX_RECV_BACKOFF))
}

/// The multi-threaded runtime channel I/O runs on.
pub(crate) fn event_loop(config: &Config) -> Result<tokio::runtime::Runtime, Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.event_loop_threads())
        .thread_name("dtls-event-loop")
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// Creates channels with the configured socket options.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    config: Arc<Config>,
    runtime: Handle,
}

impl Bootstrap {
    pub fn new(config: Arc<Config>, runtime: Handle) -> Self {
        Bootstrap { config, runtime }
    }

    /// A channel on an ephemeral local port, pointed at `remote`.
    pub fn connect(&self, remote: SocketAddr) -> Result<Channel, Error> {
        let local = match remote.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        self.channel(local, Some(remote))
    }

    /// A channel bound to `local` with no remote yet.
    pub fn bind(&self, local: SocketAddr) -> Result<Channel, Error> {
        self.channel(local, None)
    }

    fn channel(&self, local: SocketAddr, remote: Option<SocketAddr>) -> Result<Channel, Error> {
        let std_socket = self.bind_socket(local)?;
        // Registering with the reactor needs the runtime context.
        let _guard = self.runtime.enter();
        let socket = UdpSocket::from_std(std_socket)?;
        Channel::new(
            socket,
            remote,
            self.config.receive_limit(),
            self.runtime.clone(),
        )
    }

    fn bind_socket(&self, local: SocketAddr) -> Result<std::net::UdpSocket, Error> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(self.config.reuse_address())?;
        socket.set_recv_buffer_size(self.config.recv_buffer_size())?;
        socket.set_send_buffer_size(self.config.send_buffer_size())?;
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;
        Ok(socket.into())
    }
}
