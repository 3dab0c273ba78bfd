use std::fmt;
use std::net::SocketAddr;

/// Origin of an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Opaque payload from the caller, to be encrypted.
    Application,
    /// Records produced by the protocol engine, written as is.
    Control,
}

/// An outbound payload with its destination.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    payload: Vec<u8>,
    recipient: SocketAddr,
}

impl Packet {
    pub fn application(payload: Vec<u8>, recipient: SocketAddr) -> Self {
        Packet {
            kind: PacketKind::Application,
            payload,
            recipient,
        }
    }

    pub fn control(payload: Vec<u8>, recipient: SocketAddr) -> Self {
        Packet {
            kind: PacketKind::Control,
            payload,
            recipient,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn recipient(&self) -> SocketAddr {
        self.recipient
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

// Payloads may be sensitive, only show their size.
impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .field("recipient", &self.recipient)
            .finish()
    }
}

/// An inbound payload with its sender.
#[derive(Clone, PartialEq, Eq)]
pub struct Datagram {
    payload: Vec<u8>,
    sender: SocketAddr,
}

impl Datagram {
    pub fn new(payload: Vec<u8>, sender: SocketAddr) -> Self {
        Datagram { payload, sender }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn sender(&self) -> SocketAddr {
        self.sender
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram")
            .field("len", &self.payload.len())
            .field("sender", &self.sender)
            .finish()
    }
}

/// Decode a caller supplied payload.
///
/// Hex is tried first, anything that is not valid hex is sent as its UTF-8 bytes.
pub fn decode_payload(data: &str) -> Vec<u8> {
    hex::decode(data).unwrap_or_else(|_| data.as_bytes().to_vec())
}
