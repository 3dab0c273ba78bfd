use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::types::Heartbeat;
use crate::Error;

/// Environment variable selecting the remote host.
pub const HOST_ENV: &str = "HOST";

/// Environment variable selecting the remote port.
pub const PORT_ENV: &str = "PORT";

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_PORT: u16 = 4740;

/// Largest MTU used, whatever the link reports.
pub const MAX_MTU: usize = 1500;

// Worst case IPv4 header including options, and the UDP header.
const MAX_IP_OVERHEAD: usize = 20 + 64;
const MIN_IP_OVERHEAD: usize = 20;
const UDP_OVERHEAD: usize = 8;

/// Transport configuration shared by client and server.
#[derive(Debug, Clone)]
pub struct Config {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    mtu: usize,
    recv_buffer_size: usize,
    send_buffer_size: usize,
    reuse_address: bool,
    receive_wait: Duration,
    heartbeat: Heartbeat,
    decrypt_poll_interval: Duration,
    idle_flush_interval: Duration,
    acquire_timeout: Duration,
    event_loop_threads: usize,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            remote_addr: SocketAddr::new(DEFAULT_HOST, DEFAULT_PORT),
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            broadcast_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 2525),
            mtu: None,
            recv_buffer_size: 20 * 1024 * 1024,
            send_buffer_size: 1024 * 1024,
            reuse_address: true,
            receive_wait: Duration::from_millis(100),
            heartbeat: Heartbeat::symmetric(Duration::from_secs(10)),
            decrypt_poll_interval: Duration::from_secs(1),
            idle_flush_interval: Duration::from_millis(200),
            acquire_timeout: Duration::from_secs(10),
            event_loop_threads: 2,
        }
    }

    /// Builder seeded with the remote endpoint from `HOST` and `PORT`.
    ///
    /// Unset or blank variables fall back to `127.0.0.1` and `4740`. `HOST`
    /// may be a name, it is resolved together with the port.
    pub fn from_env() -> Result<ConfigBuilder, Error> {
        let remote = remote_from(env::var(HOST_ENV).ok(), env::var(PORT_ENV).ok())?;
        Ok(Config::builder().remote_addr(remote))
    }

    /// The endpoint the client facade connects to.
    #[inline(always)]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The address channels bind locally.
    ///
    /// Client channels always bind an ephemeral port of the matching family.
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Destination stamped on application packets sent by the client facade.
    #[inline(always)]
    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast_addr
    }

    /// Max transmission unit of the link.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest record the protocol engine may hand to the transport.
    ///
    /// The MTU minus the worst case IP header (with options) and the UDP header.
    #[inline(always)]
    pub fn send_limit(&self) -> usize {
        self.mtu - MAX_IP_OVERHEAD - UDP_OVERHEAD
    }

    /// Largest datagram the transport can deliver to the protocol engine.
    #[inline(always)]
    pub fn receive_limit(&self) -> usize {
        self.mtu - MIN_IP_OVERHEAD - UDP_OVERHEAD
    }

    /// Socket receive buffer size (SO_RCVBUF).
    #[inline(always)]
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    /// Socket send buffer size (SO_SNDBUF).
    #[inline(always)]
    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size
    }

    /// Whether sockets are bound with SO_REUSEADDR.
    #[inline(always)]
    pub fn reuse_address(&self) -> bool {
        self.reuse_address
    }

    /// Upper bound for a single blocking receive on an established handle.
    ///
    /// Never larger than the heartbeat timeout.
    #[inline(always)]
    pub fn receive_wait(&self) -> Duration {
        self.receive_wait
    }

    /// Heartbeat the peer roles ask for.
    #[inline(always)]
    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat
    }

    /// Period of the background poll for decrypted data.
    #[inline(always)]
    pub fn decrypt_poll_interval(&self) -> Duration {
        self.decrypt_poll_interval
    }

    /// Period at which the client facade flushes queued application packets.
    #[inline(always)]
    pub fn idle_flush_interval(&self) -> Duration {
        self.idle_flush_interval
    }

    /// How long the facade waits for the pool to hand out a channel.
    #[inline(always)]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Number of event loop threads driving socket I/O.
    #[inline(always)]
    pub fn event_loop_threads(&self) -> usize {
        self.event_loop_threads
    }
}

/// Builder for transport configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    mtu: Option<usize>,
    recv_buffer_size: usize,
    send_buffer_size: usize,
    reuse_address: bool,
    receive_wait: Duration,
    heartbeat: Heartbeat,
    decrypt_poll_interval: Duration,
    idle_flush_interval: Duration,
    acquire_timeout: Duration,
    event_loop_threads: usize,
}

impl ConfigBuilder {
    /// Set the remote endpoint.
    ///
    /// Defaults to 127.0.0.1:4740.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = addr;
        self
    }

    /// Set the local bind address.
    ///
    /// Defaults to 0.0.0.0:0.
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    /// Set the destination stamped on application packets.
    ///
    /// Defaults to 255.255.255.255:2525.
    pub fn broadcast_addr(mut self, addr: SocketAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    /// Set the link MTU. Values above 1500 are capped.
    ///
    /// Defaults to the MTU of the interface routing to the remote endpoint,
    /// or 1500 when that cannot be determined.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set SO_RCVBUF.
    ///
    /// Defaults to 20 MiB.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Set SO_SNDBUF.
    ///
    /// Defaults to 1 MiB.
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Set SO_REUSEADDR.
    ///
    /// Defaults to true.
    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Set the bounded wait of a single receive.
    ///
    /// Defaults to 100ms.
    pub fn receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Set the heartbeat.
    ///
    /// Defaults to 10s idle and 10s timeout.
    pub fn heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the background decrypt poll period.
    ///
    /// Defaults to 1s.
    pub fn decrypt_poll_interval(mut self, interval: Duration) -> Self {
        self.decrypt_poll_interval = interval;
        self
    }

    /// Set the idle flush period of the client facade.
    ///
    /// Defaults to 200ms.
    pub fn idle_flush_interval(mut self, interval: Duration) -> Self {
        self.idle_flush_interval = interval;
        self
    }

    /// Set the channel acquisition timeout.
    ///
    /// Defaults to 10s.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the number of event loop threads.
    ///
    /// Defaults to 2.
    pub fn event_loop_threads(mut self, threads: usize) -> Self {
        self.event_loop_threads = threads;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<Config, Error> {
        let mtu = self
            .mtu
            .or_else(|| link_mtu(self.remote_addr.ip()))
            .unwrap_or(MAX_MTU)
            .min(MAX_MTU);
        if mtu <= MAX_IP_OVERHEAD + UDP_OVERHEAD {
            return Err(Error::Config(format!(
                "mtu {} leaves no room for records",
                mtu
            )));
        }
        if self.receive_wait.is_zero() || self.receive_wait > self.heartbeat.timeout {
            return Err(Error::Config(format!(
                "receive wait {:?} must be non-zero and at most the heartbeat timeout {:?}",
                self.receive_wait, self.heartbeat.timeout
            )));
        }
        if self.decrypt_poll_interval.is_zero() || self.idle_flush_interval.is_zero() {
            return Err(Error::Config("periodic intervals must be non-zero".into()));
        }
        if self.event_loop_threads == 0 {
            return Err(Error::Config("at least one event loop thread".into()));
        }

        Ok(Config {
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            broadcast_addr: self.broadcast_addr,
            mtu,
            recv_buffer_size: self.recv_buffer_size,
            send_buffer_size: self.send_buffer_size,
            reuse_address: self.reuse_address,
            receive_wait: self.receive_wait,
            heartbeat: self.heartbeat,
            decrypt_poll_interval: self.decrypt_poll_interval,
            idle_flush_interval: self.idle_flush_interval,
            acquire_timeout: self.acquire_timeout,
            event_loop_threads: self.event_loop_threads,
        })
    }
}

/// Remote endpoint from optional `HOST` and `PORT` values.
fn remote_from(host: Option<String>, port: Option<String>) -> Result<SocketAddr, Error> {
    let port = match port.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("{PORT_ENV}={v}: {e}")))?,
        None => DEFAULT_PORT,
    };
    let host = match host.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v,
        None => return Ok(SocketAddr::new(DEFAULT_HOST, port)),
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("{HOST_ENV}={host}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("{HOST_ENV}={host}: no address")))
}

/// MTU of the interface the kernel routes `ip` through.
///
/// Only known on Linux, from procfs and sysfs.
fn link_mtu(ip: IpAddr) -> Option<usize> {
    let name = match ip {
        _ if ip.is_loopback() => "lo".to_string(),
        IpAddr::V4(v4) => route_interface(&fs::read_to_string("/proc/net/route").ok()?, v4)?,
        IpAddr::V6(_) => return None,
    };
    let mtu = fs::read_to_string(format!("/sys/class/net/{name}/mtu")).ok()?;
    mtu.trim().parse().ok()
}

/// Interface of the longest prefix route in a `/proc/net/route` table
/// covering `ip`.
fn route_interface(table: &str, ip: Ipv4Addr) -> Option<String> {
    // Destination and mask are hex in host byte order.
    let target = u32::from_ne_bytes(ip.octets());
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let dest = u32::from_str_radix(fields[1], 16).ok()?;
            let mask = u32::from_str_radix(fields[7], 16).ok()?;
            (target & mask == dest & mask).then(|| (mask.count_ones(), fields[0]))
        })
        .max_by_key(|(bits, _)| *bits)
        .map(|(_, name)| name.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("default config is valid")
    }
}
