//! DTLS over UDP on a tokio event loop, driven by a blocking protocol engine.
//!
//! The record layer is an external [`ProtocolEngine`] with a blocking
//! `connect`/`accept` API. This crate runs it over non-blocking UDP channels
//! without ever blocking the event loop:
//!
//! - [`bridge`] is the blocking transport the engine handshakes over.
//! - [`handshake`] holds the encrypted handle and parks application traffic
//!   until it exists.
//! - [`handler`] sits in front of a [`channel::Channel`] and routes traffic
//!   between the socket and the engine.
//! - [`role`] answers the engine's callbacks: versions, heartbeat,
//!   credentials and certificate validation.
//! - [`DtlsClient`] pools channels per remote and queues sends until the
//!   handshake completes. [`DtlsServer`] serves a single peer.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dtls_bridge::{Config, DtlsClient, Error, ProtocolEngine};
//!
//! fn run(engine: Arc<dyn ProtocolEngine>) -> Result<(), Error> {
//!     let config = Config::from_env()?.build()?;
//!     let client = DtlsClient::open(config, engine)?;
//!     client.send("cafebabe")?;
//!     client.close();
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod error;
pub use error::{AlertDescription, Error, Result};

mod config;
pub use config::{Config, ConfigBuilder, DEFAULT_HOST, DEFAULT_PORT, HOST_ENV, PORT_ENV};

pub mod types;

pub mod credentials;
pub use credentials::{CertificateChain, CredentialResolver, PrivateKey};

pub mod sign;

pub mod engine;
pub use engine::{DatagramTransport, ProtocolEngine};

pub mod packet;
pub use packet::{Datagram, Packet, PacketKind};

pub mod timer;

pub mod channel;

pub mod bridge;

pub mod handshake;

pub mod role;

pub mod handler;

pub mod pool;

mod client;
pub use client::DtlsClient;

mod server;
pub use server::DtlsServer;

#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod testing;
