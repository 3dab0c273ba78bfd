//! Reusable channels, one pool per remote address.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Bootstrap, Channel, ChannelId};
use crate::Error;

/// Hooks into the life of pooled channels.
pub trait ChannelPoolHandler: Send + Sync + fmt::Debug + 'static {
    /// A new channel was created. Install its pipeline here; it is activated
    /// right after.
    fn channel_created(&self, channel: &Channel) -> Result<(), Error>;

    fn channel_acquired(&self, _channel: &Channel) {}

    fn channel_released(&self, _channel: &Channel) {}
}

/// Channels to one remote address.
///
/// Idle channels are handed out oldest first. Only active channels are
/// handed out or taken back.
pub struct ChannelPool {
    remote: SocketAddr,
    bootstrap: Bootstrap,
    handler: Arc<dyn ChannelPoolHandler>,
    idle: Mutex<VecDeque<Channel>>,
    members: Mutex<HashSet<ChannelId>>,
    acquired: AtomicUsize,
    closed: AtomicBool,
}

impl ChannelPool {
    pub fn new(remote: SocketAddr, bootstrap: Bootstrap, handler: Arc<dyn ChannelPoolHandler>) -> Self {
        ChannelPool {
            remote,
            bootstrap,
            handler,
            idle: Mutex::new(VecDeque::new()),
            members: Mutex::new(HashSet::new()),
            acquired: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn acquire(&self) -> Result<Channel, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let channel = loop {
            let next = self.idle.lock().pop_front();
            match next {
                Some(channel) if channel.is_active() => {
                    trace!("{} reused for {}", channel.id(), self.remote);
                    break channel;
                }
                Some(channel) => {
                    debug!("{} failed health check, discarding", channel.id());
                    self.members.lock().remove(&channel.id());
                    channel.close().await?;
                }
                None => break self.create()?,
            }
        };

        self.acquired.fetch_add(1, Ordering::AcqRel);
        self.handler.channel_acquired(&channel);
        Ok(channel)
    }

    fn create(&self) -> Result<Channel, Error> {
        let channel = self.bootstrap.connect(self.remote)?;
        self.handler.channel_created(&channel)?;
        channel.activate()?;
        self.members.lock().insert(channel.id());
        debug!("{} created for {}", channel.id(), self.remote);
        Ok(channel)
    }

    /// Take back a channel handed out by [`acquire`](Self::acquire).
    pub async fn release(&self, channel: &Channel) -> Result<(), Error> {
        if !self.members.lock().contains(&channel.id()) {
            return Err(Error::ForeignChannel);
        }
        if self.idle.lock().iter().any(|c| c.id() == channel.id()) {
            warn!("{} released twice", channel.id());
            return Ok(());
        }

        let _ = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.handler.channel_released(channel);

        if channel.is_active() && !self.closed.load(Ordering::Acquire) {
            trace!("{} back to idle", channel.id());
            self.idle.lock().push_back(channel.clone());
            Ok(())
        } else {
            self.members.lock().remove(&channel.id());
            channel.close().await
        }
    }

    /// Take back a channel that is about to be torn down.
    ///
    /// Unlike [`release`](Self::release) the channel is forgotten rather than
    /// kept idle, and closing it is left to the caller.
    pub fn retire(&self, channel: &Channel) -> Result<(), Error> {
        if !self.members.lock().remove(&channel.id()) {
            return Err(Error::ForeignChannel);
        }
        self.idle.lock().retain(|c| c.id() != channel.id());
        let _ = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.handler.channel_released(channel);
        trace!("{} retired", channel.id());
        Ok(())
    }

    /// Close every idle channel. Later acquires fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let idle: Vec<Channel> = self.idle.lock().drain(..).collect();
        for channel in idle {
            self.members.lock().remove(&channel.id());
            if let Err(e) = channel.close().await {
                warn!("{} close failed: {}", channel.id(), e);
            }
        }
        debug!("Pool for {} closed", self.remote);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPool")
            .field("remote", &self.remote)
            .field("idle", &self.idle_count())
            .field("acquired", &self.acquired_count())
            .finish()
    }
}

/// One [`ChannelPool`] per remote address, created on first use.
#[derive(Debug)]
pub struct ChannelPoolMap {
    bootstrap: Bootstrap,
    handler: Arc<dyn ChannelPoolHandler>,
    pools: Mutex<HashMap<SocketAddr, Arc<ChannelPool>>>,
}

impl ChannelPoolMap {
    pub fn new(bootstrap: Bootstrap, handler: Arc<dyn ChannelPoolHandler>) -> Self {
        ChannelPoolMap {
            bootstrap,
            handler,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, remote: SocketAddr) -> Arc<ChannelPool> {
        self.pools
            .lock()
            .entry(remote)
            .or_insert_with(|| {
                Arc::new(ChannelPool::new(
                    remote,
                    self.bootstrap.clone(),
                    self.handler.clone(),
                ))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Idle channels across all pools.
    pub fn idle_count(&self) -> usize {
        self.pools.lock().values().map(|p| p.idle_count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn close(&self) {
        let pools: Vec<Arc<ChannelPool>> = self.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}
