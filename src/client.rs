//! The client entry point.
//!
//! A [`DtlsClient`] owns its event loop, a pool of channels per remote
//! address, and the connection built on the channel currently held. Sends
//! made before there is a channel, or before its handshake completed, are
//! queued and go out in order once it has.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::channel::{event_loop, Bootstrap, Channel, ChannelId};
use crate::credentials::CredentialResolver;
use crate::engine::ProtocolEngine;
use crate::handler::ClientHandler;
use crate::packet::{decode_payload, Datagram, Packet};
use crate::pool::{ChannelPool, ChannelPoolHandler, ChannelPoolMap};
use crate::role::{ClientRole, HandshakeRole};
use crate::timer::PeriodicTask;
use crate::{Config, Error};

/// A channel together with what runs on it.
#[derive(Debug)]
struct Connection {
    channel: Channel,
    role: Arc<ClientRole>,
}

type Connections = Arc<Mutex<HashMap<ChannelId, Connection>>>;

#[derive(Debug)]
enum Acquisition {
    Idle,
    Acquiring,
    Acquired(Channel),
}

#[derive(Debug)]
struct FacadeState {
    acquisition: Acquisition,
    queue: VecDeque<Packet>,
}

/// Installs the client pipeline on every channel the pool creates.
#[derive(Debug)]
struct ConnectionFactory {
    config: Arc<Config>,
    engine: Arc<dyn ProtocolEngine>,
    credentials: Arc<CredentialResolver>,
    connections: Connections,
    received: UnboundedSender<Datagram>,
}

impl ChannelPoolHandler for ConnectionFactory {
    fn channel_created(&self, channel: &Channel) -> Result<(), Error> {
        let remote = channel
            .remote_addr()
            .unwrap_or_else(|| self.config.remote_addr());
        let role = Arc::new(ClientRole::new(
            remote,
            self.credentials.clone(),
            self.config.heartbeat(),
        ));
        let handler = Arc::new(ClientHandler::new(
            role.clone(),
            self.engine.clone(),
            &self.config,
        ));
        channel.install(handler)?;

        if let Some(mut inbound) = channel.take_inbound() {
            let id = channel.id();
            let received = self.received.clone();
            channel.runtime().spawn(async move {
                while let Some(datagram) = inbound.recv().await {
                    debug!(
                        "{} received datagram of {} bytes from {}",
                        id,
                        datagram.payload().len(),
                        datagram.sender()
                    );
                    if received.send(datagram).is_err() {
                        break;
                    }
                }
            });
        }

        self.connections.lock().insert(
            channel.id(),
            Connection {
                channel: channel.clone(),
                role,
            },
        );
        Ok(())
    }
}

struct Shared {
    config: Arc<Config>,
    handle: Handle,
    pools: ChannelPoolMap,
    connections: Connections,
    state: Mutex<FacadeState>,
}

impl Shared {
    fn is_complete(&self, channel: &Channel) -> bool {
        self.connections
            .lock()
            .get(&channel.id())
            .map(|c| c.role.is_handshake_complete())
            .unwrap_or(false)
    }

    fn pool_for(&self, channel: &Channel) -> Arc<ChannelPool> {
        let remote = channel
            .remote_addr()
            .unwrap_or_else(|| self.config.remote_addr());
        self.pools.get(remote)
    }

    /// Write out the queue, if the held channel finished its handshake.
    ///
    /// Runs under the state lock so a concurrent send cannot overtake it.
    fn flush_locked(&self, state: &mut FacadeState) {
        let Acquisition::Acquired(channel) = &state.acquisition else {
            return;
        };
        if state.queue.is_empty() || !self.is_complete(channel) {
            return;
        }
        let channel = channel.clone();

        trace!("{} flushing {} queued packets", channel.id(), state.queue.len());
        while let Some(packet) = state.queue.pop_front() {
            let len = packet.payload().len();
            let id = channel.id();
            let write = channel.write(packet);
            self.handle.spawn(async move {
                match write.await {
                    Ok(()) => trace!("{} wrote {} bytes", id, len),
                    Err(e) => warn!("{} write of {} bytes failed: {}", id, len, e),
                }
            });
        }
    }

    async fn acquire(self: Arc<Self>) {
        let remote = self.config.remote_addr();
        let pool = self.pools.get(remote);
        let result = tokio::time::timeout(self.config.acquire_timeout(), pool.acquire())
            .await
            .unwrap_or(Err(Error::AcquisitionTimeout));

        let orphan = {
            let mut state = self.state.lock();
            match result {
                Ok(channel) if matches!(state.acquisition, Acquisition::Acquiring) => {
                    debug!("{} acquired for {}", channel.id(), remote);
                    state.acquisition = Acquisition::Acquired(channel);
                    self.flush_locked(&mut state);
                    None
                }
                // Closed while acquiring.
                Ok(channel) => Some(channel),
                Err(e) => {
                    error!("Acquiring a channel to {} failed: {}", remote, e);
                    state.acquisition = Acquisition::Idle;
                    None
                }
            }
        };

        if let Some(channel) = orphan {
            if let Err(e) = teardown(&pool, &channel).await {
                debug!("{} teardown after close: {}", channel.id(), e);
            }
            self.connections.lock().remove(&channel.id());
        }
    }
}

/// Release, disconnect, deregister, close. Stops at the first failure.
///
/// The channel leaves the pool for good, it is never handed out again.
async fn teardown(pool: &ChannelPool, channel: &Channel) -> Result<(), Error> {
    pool.retire(channel)?;
    channel.disconnect().await?;
    channel.deregister().await?;
    channel.close().await
}

/// DTLS client sending to one configured remote endpoint.
///
/// Blocking methods must not be called from within an async context.
pub struct DtlsClient {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shared: Arc<Shared>,
    credentials: Arc<CredentialResolver>,
    idle_flush: Mutex<Option<PeriodicTask>>,
    inbound: Mutex<UnboundedReceiver<Datagram>>,
    closed: AtomicBool,
}

impl DtlsClient {
    /// Start a client with the built-in client credentials.
    pub fn open(config: Config, engine: Arc<dyn ProtocolEngine>) -> Result<Self, Error> {
        Self::open_with_credentials(config, engine, Arc::new(CredentialResolver::client()))
    }

    pub fn open_with_credentials(
        config: Config,
        engine: Arc<dyn ProtocolEngine>,
        credentials: Arc<CredentialResolver>,
    ) -> Result<Self, Error> {
        let config = Arc::new(config);
        let runtime = event_loop(&config)?;
        let handle = runtime.handle().clone();

        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let (received, inbound) = mpsc::unbounded_channel();
        let factory = Arc::new(ConnectionFactory {
            config: config.clone(),
            engine,
            credentials: credentials.clone(),
            connections: connections.clone(),
            received,
        });
        let bootstrap = Bootstrap::new(config.clone(), handle.clone());

        let shared = Arc::new(Shared {
            config: config.clone(),
            handle: handle.clone(),
            pools: ChannelPoolMap::new(bootstrap, factory),
            connections,
            state: Mutex::new(FacadeState {
                acquisition: Acquisition::Idle,
                queue: VecDeque::new(),
            }),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let idle_flush = PeriodicTask::spawn(
            &handle,
            "idle-flush",
            config.idle_flush_interval(),
            move || {
                if let Some(shared) = weak.upgrade() {
                    let mut state = shared.state.lock();
                    shared.flush_locked(&mut state);
                }
            },
        );

        debug!("Client for {} open", config.remote_addr());
        Ok(DtlsClient {
            runtime: Mutex::new(Some(runtime)),
            handle,
            shared,
            credentials,
            idle_flush: Mutex::new(Some(idle_flush)),
            inbound: Mutex::new(inbound),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Where credential overrides for the next handshake are set.
    pub fn credentials(&self) -> &Arc<CredentialResolver> {
        &self.credentials
    }

    /// Send `data`, decoded as hex when it is hex and as UTF-8 otherwise.
    ///
    /// Returns once the packet is queued or handed to the channel. The first
    /// send acquires a channel in the background.
    pub fn send(&self, data: &str) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let packet = Packet::application(decode_payload(data), self.shared.config.broadcast_addr());

        let mut state = self.shared.state.lock();
        state.queue.push_back(packet);
        match state.acquisition {
            Acquisition::Idle => {
                state.acquisition = Acquisition::Acquiring;
                self.handle.spawn(self.shared.clone().acquire());
            }
            Acquisition::Acquiring => trace!("Queued {} packets while acquiring", state.queue.len()),
            Acquisition::Acquired(_) => self.shared.flush_locked(&mut state),
        }
        Ok(())
    }

    /// Give the held channel back and tear it down.
    ///
    /// Does nothing when no channel is held.
    pub fn release(&self) -> Result<(), Error> {
        let channel = match &self.shared.state.lock().acquisition {
            Acquisition::Acquired(channel) => channel.clone(),
            _ => return Ok(()),
        };

        let pool = self.shared.pool_for(&channel);
        self.handle.block_on(teardown(&pool, &channel))?;

        self.shared.connections.lock().remove(&channel.id());
        self.shared.state.lock().acquisition = Acquisition::Idle;
        debug!("{} released", channel.id());
        Ok(())
    }

    /// Wait up to `timeout` for the next decrypted datagram from the server.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Datagram> {
        if self.is_closed() {
            return None;
        }
        let mut inbound = self.inbound.lock();
        self.handle
            .block_on(async { tokio::time::timeout(timeout, inbound.recv()).await })
            .ok()
            .flatten()
    }

    /// Channels kept for reuse.
    pub fn idle_channels(&self) -> usize {
        self.shared.pools.idle_count()
    }

    /// Whether the held channel finished its handshake.
    pub fn is_handshake_complete(&self) -> bool {
        match &self.shared.state.lock().acquisition {
            Acquisition::Acquired(channel) => self.shared.is_complete(channel),
            _ => false,
        }
    }

    /// Packets waiting for a channel or a handshake.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the held channel, close all pools and stop the event loop.
    ///
    /// Only the first call has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.release() {
            warn!("Release on close failed: {}", e);
        }
        if let Some(task) = self.idle_flush.lock().take() {
            task.cancel();
        }
        self.handle.block_on(self.shared.pools.close());

        let leftover: Vec<Connection> = self
            .shared
            .connections
            .lock()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in leftover {
            if let Err(e) = self.handle.block_on(connection.channel.close()) {
                debug!("{} close failed: {}", connection.channel.id(), e);
            }
        }

        let dropped = {
            let mut state = self.shared.state.lock();
            state.acquisition = Acquisition::Idle;
            state.queue.drain(..).count()
        };
        if dropped > 0 {
            warn!("Dropped {} queued packets on close", dropped);
        }

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("Client closed");
    }
}

impl fmt::Debug for DtlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsClient")
            .field("remote", &self.shared.config.remote_addr())
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for DtlsClient {
    fn drop(&mut self) {
        self.close();
    }
}
