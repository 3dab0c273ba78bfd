//! A plaintext protocol engine for driving the adapter in tests.
//!
//! [`LoopbackEngine`] runs a handshake shaped like DTLS 1.2 with mutual
//! authentication (hello, certificate, key exchange signature, certificate
//! request, client certificate and verify, finished) and calls every peer
//! role callback a real engine would. Nothing is encrypted.
//!
//! Records are `[content type][body]`. Handshake bodies are
//! `[msg type][fragment index][fragment count][data]`, fragmented to the
//! transport's send limit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::credentials::CertificateChain;
use crate::engine::{CertificateRequest, ClientPeer, DatagramTransport, PeerRole};
use crate::engine::{ProtocolEngine, ServerPeer};
use crate::error::AlertDescription;
use crate::types::{ClientCertificateType, ProtocolVersion, SignatureAndHashAlgorithm};
use crate::Error;

const ALERT: u8 = 21;
const HANDSHAKE: u8 = 22;
const APPLICATION_DATA: u8 = 23;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const CERTIFICATE: u8 = 11;
const SERVER_KEY_EXCHANGE: u8 = 12;
const CERTIFICATE_REQUEST: u8 = 13;
const SERVER_HELLO_DONE: u8 = 14;
const CERTIFICATE_VERIFY: u8 = 15;
const FINISHED: u8 = 20;

const FRAGMENT_HEADER: usize = 4;
const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// Plaintext stand-in for a DTLS engine.
#[derive(Debug, Clone)]
pub struct LoopbackEngine {
    handshake_timeout: Duration,
}

impl LoopbackEngine {
    /// Give up on a handshake that has not finished `timeout` after it began.
    ///
    /// A server waits for the first client hello without a bound.
    pub fn with_handshake_timeout(timeout: Duration) -> Self {
        LoopbackEngine {
            handshake_timeout: timeout,
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        // RSA signing is slow in unoptimized builds.
        Self::with_handshake_timeout(Duration::from_secs(30))
    }
}

impl ProtocolEngine for LoopbackEngine {
    fn connect(
        &self,
        client: &dyn ClientPeer,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<dyn DatagramTransport>, Error> {
        {
            let mut flight = Flight::new(&*transport);
            client.notify_handshake_beginning();
            let deadline = Instant::now() + self.handshake_timeout;
            let result = client_flights(client, &mut flight, deadline);
            conclude(client, &flight, result)?;
        }
        client.notify_handshake_complete();
        Ok(Arc::new(LoopbackSession { transport }))
    }

    fn accept(
        &self,
        server: &dyn ServerPeer,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<dyn DatagramTransport>, Error> {
        {
            let mut flight = Flight::new(&*transport);
            let result = server_flights(server, &mut flight, self.handshake_timeout);
            conclude(server, &flight, result)?;
        }
        server.notify_handshake_complete();
        Ok(Arc::new(LoopbackSession { transport }))
    }
}

fn client_flights(
    client: &dyn ClientPeer,
    flight: &mut Flight<'_>,
    deadline: Instant,
) -> Result<(), Error> {
    let mut hello = Vec::new();
    put_versions(&mut hello, client.supported_versions());
    put_algorithms(&mut hello, SignatureAndHashAlgorithm::rsa_descending());
    flight.send(CLIENT_HELLO, &hello)?;

    let body = flight.expect(SERVER_HELLO, Some(deadline))?;
    let chosen = Reader::new(&body).u16()?;
    let version = ProtocolVersion::from_u16(chosen)
        .filter(|v| client.supported_versions().contains(v))
        .ok_or_else(|| Error::HandshakeIo(format!("server chose version {chosen:#06x}")))?;
    debug!("Loopback client negotiated {}", version);

    let chain = get_chain(&flight.expect(CERTIFICATE, Some(deadline))?)?;
    client.notify_server_certificate(&chain)?;
    get_signature(&flight.expect(SERVER_KEY_EXCHANGE, Some(deadline))?)?;
    let request = get_request(&flight.expect(CERTIFICATE_REQUEST, Some(deadline))?)?;
    flight.expect(SERVER_HELLO_DONE, Some(deadline))?;

    match client.client_credentials(&request)? {
        Some(credentials) => {
            flight.send(CERTIFICATE, &chain_body(&credentials.chain))?;
            let signature = credentials.signer.sign(&flight.transcript)?;
            let body = signature_body(credentials.signer.algorithm(), &signature);
            flight.send(CERTIFICATE_VERIFY, &body)?;
        }
        None => {
            debug!("Loopback client continuing without a certificate");
            flight.send(CERTIFICATE, &chain_body(&CertificateChain::default()))?;
        }
    }

    flight.send_finished()?;
    flight.expect(FINISHED, Some(deadline))?;
    Ok(())
}

fn server_flights(
    server: &dyn ServerPeer,
    flight: &mut Flight<'_>,
    timeout: Duration,
) -> Result<(), Error> {
    let hello = flight.expect(CLIENT_HELLO, None)?;
    server.notify_handshake_beginning();
    let deadline = Instant::now() + timeout;

    let mut reader = Reader::new(&hello);
    let offered = reader.versions()?;
    let client_algorithms = reader.algorithms()?;
    let version = offered
        .iter()
        .copied()
        .find(|v| server.supported_versions().contains(v))
        .ok_or_else(|| Error::HandshakeIo("no common protocol version".into()))?;
    debug!("Loopback server negotiated {}", version);
    flight.send(SERVER_HELLO, &version.as_u16().to_be_bytes())?;

    // DTLS 1.0 hellos carry no signature algorithms.
    let advertised = (version == ProtocolVersion::Dtls1_2).then_some(&client_algorithms[..]);
    let credentials = server.credentials(advertised)?;
    flight.send(CERTIFICATE, &chain_body(&credentials.chain))?;
    let signature = credentials.signer.sign(&flight.transcript)?;
    let body = signature_body(credentials.signer.algorithm(), &signature);
    flight.send(SERVER_KEY_EXCHANGE, &body)?;

    let mut request = server.certificate_request()?;
    if version == ProtocolVersion::Dtls1_0 {
        request.signature_algorithms = None;
    }
    flight.send(CERTIFICATE_REQUEST, &request_body(&request))?;
    flight.send(SERVER_HELLO_DONE, &[])?;

    let chain = get_chain(&flight.expect(CERTIFICATE, Some(deadline))?)?;
    server.notify_client_certificate(&chain)?;
    get_signature(&flight.expect(CERTIFICATE_VERIFY, Some(deadline))?)?;
    flight.expect(FINISHED, Some(deadline))?;
    flight.send_finished()
}

// Report a failed handshake to the role, and to the peer when we are the
// ones giving up.
fn conclude<P: PeerRole + ?Sized>(
    role: &P,
    flight: &Flight<'_>,
    result: Result<(), Error>,
) -> Result<(), Error> {
    let Err(e) = result else {
        return Ok(());
    };
    match &e {
        Error::AlertReceived(alert) => role.notify_alert_received(*alert),
        Error::Interrupted => {}
        _ => {
            let alert = e.alert();
            role.notify_alert_raised(alert, &e);
            flight.alert(alert);
        }
    }
    Err(e)
}

/// Handshake messages in one direction and the transcript of both.
struct Flight<'a> {
    transport: &'a dyn DatagramTransport,
    transcript: Vec<u8>,
    partial: Option<(u8, Vec<Option<Vec<u8>>>)>,
    buf: Vec<u8>,
}

impl<'a> Flight<'a> {
    fn new(transport: &'a dyn DatagramTransport) -> Self {
        Flight {
            transport,
            transcript: Vec::new(),
            partial: None,
            buf: vec![0; transport.receive_limit()],
        }
    }

    fn send(&mut self, msg_type: u8, body: &[u8]) -> Result<(), Error> {
        let room = self
            .transport
            .send_limit()
            .saturating_sub(1 + FRAGMENT_HEADER);
        if room == 0 {
            return Err(Error::HandshakeIo("send limit too small".into()));
        }

        let fragments: Vec<&[u8]> = if body.is_empty() {
            vec![body]
        } else {
            body.chunks(room).collect()
        };
        let count = u8::try_from(fragments.len()).map_err(|_| {
            Error::HandshakeIo(format!("message of {} bytes too large", body.len()))
        })?;

        self.transcript.push(msg_type);
        self.transcript.extend_from_slice(body);

        for (index, fragment) in fragments.iter().enumerate() {
            let mut record = Vec::with_capacity(1 + FRAGMENT_HEADER + fragment.len());
            record.extend_from_slice(&[HANDSHAKE, msg_type, index as u8, count]);
            record.extend_from_slice(fragment);
            self.transport.send(&record)?;
        }
        trace!(
            "Loopback sent message {} in {} fragments",
            msg_type,
            fragments.len()
        );
        Ok(())
    }

    fn send_finished(&mut self) -> Result<(), Error> {
        let verify = verify_data(&self.transcript);
        self.send(FINISHED, &verify)
    }

    fn alert(&self, alert: AlertDescription) {
        const FATAL: u8 = 2;
        if let Err(e) = self.transport.send(&[ALERT, FATAL, alert.as_u8()]) {
            debug!("Could not send alert {}: {}", alert, e);
        }
    }

    /// The next complete message, which must be of `msg_type`.
    fn expect(&mut self, msg_type: u8, deadline: Option<Instant>) -> Result<Vec<u8>, Error> {
        let (received, body) = self.next_message(deadline)?;
        if received != msg_type {
            return Err(Error::HandshakeIo(format!(
                "expected message {msg_type}, got {received}"
            )));
        }
        Ok(body)
    }

    fn next_message(&mut self, deadline: Option<Instant>) -> Result<(u8, Vec<u8>), Error> {
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::HandshakeIo("timed out".into()));
                    }
                    (deadline - now).min(RECEIVE_SLICE)
                }
                None => RECEIVE_SLICE,
            };

            let Some(n) = self.transport.receive(&mut self.buf, wait)? else {
                continue;
            };
            let record = self.buf[..n].to_vec();
            if let Some(message) = self.record(&record)? {
                return Ok(message);
            }
        }
    }

    fn record(&mut self, record: &[u8]) -> Result<Option<(u8, Vec<u8>)>, Error> {
        let (msg_type, index, count, data) = match record {
            [ALERT, _, description, ..] => {
                return Err(Error::AlertReceived(AlertDescription::from_u8(*description)))
            }
            [HANDSHAKE, msg_type, index, count, data @ ..] => {
                (*msg_type, *index as usize, *count as usize, data)
            }
            _ => {
                trace!("Loopback ignoring {} byte record", record.len());
                return Ok(None);
            }
        };
        if index >= count {
            return Err(Error::HandshakeIo(format!(
                "fragment {index} of {count} for message {msg_type}"
            )));
        }

        let (partial_type, fragments) = self
            .partial
            .get_or_insert_with(|| (msg_type, vec![None; count]));
        if *partial_type != msg_type || fragments.len() != count {
            return Err(Error::HandshakeIo(format!(
                "message {msg_type} interleaved with {partial_type}"
            )));
        }
        fragments[index] = Some(data.to_vec());
        if fragments.iter().any(Option::is_none) {
            return Ok(None);
        }

        let Some((msg_type, fragments)) = self.partial.take() else {
            return Ok(None);
        };
        let body: Vec<u8> = fragments.into_iter().flatten().flatten().collect();

        if msg_type == FINISHED && body != verify_data(&self.transcript) {
            return Err(Error::HandshakeIo("finished does not match transcript".into()));
        }
        self.transcript.push(msg_type);
        self.transcript.extend_from_slice(&body);
        Ok(Some((msg_type, body)))
    }
}

fn verify_data(transcript: &[u8]) -> Vec<u8> {
    Sha256::digest(transcript)[..12].to_vec()
}

/// The "encrypted" handle: application data records over the same transport.
#[derive(Debug)]
struct LoopbackSession {
    transport: Arc<dyn DatagramTransport>,
}

impl DatagramTransport for LoopbackSession {
    fn send(&self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() > self.send_limit() {
            return Err(Error::OversizedRecord {
                len: buf.len(),
                limit: self.send_limit(),
            });
        }
        let mut record = Vec::with_capacity(buf.len() + 1);
        record.push(APPLICATION_DATA);
        record.extend_from_slice(buf);
        self.transport.send(&record)
    }

    fn receive(&self, buf: &mut [u8], wait: Duration) -> Result<Option<usize>, Error> {
        let mut record = vec![0u8; self.transport.receive_limit()];
        let Some(n) = self.transport.receive(&mut record, wait)? else {
            return Ok(None);
        };
        match &record[..n] {
            [APPLICATION_DATA, data @ ..] => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(Some(len))
            }
            [ALERT, _, description, ..] => {
                warn!(
                    "Loopback session got alert {}",
                    AlertDescription::from_u8(*description)
                );
                Ok(None)
            }
            _ => {
                trace!("Loopback session ignoring {} byte record", n);
                Ok(None)
            }
        }
    }

    fn send_limit(&self) -> usize {
        self.transport.send_limit().saturating_sub(1)
    }

    fn receive_limit(&self) -> usize {
        self.transport.receive_limit().saturating_sub(1)
    }

    fn close(&self) {
        self.transport.close()
    }
}

// ====================================================================
// Message bodies

fn put_versions(out: &mut Vec<u8>, versions: &[ProtocolVersion]) {
    out.push(versions.len() as u8);
    for v in versions {
        out.extend_from_slice(&v.as_u16().to_be_bytes());
    }
}

fn put_algorithms(out: &mut Vec<u8>, algorithms: &[SignatureAndHashAlgorithm]) {
    out.push(algorithms.len() as u8);
    for a in algorithms {
        out.extend_from_slice(&a.as_u16().to_be_bytes());
    }
}

fn chain_body(chain: &CertificateChain) -> Vec<u8> {
    let mut out = vec![chain.len() as u8];
    for der in chain.certificates() {
        out.extend_from_slice(&(der.len() as u32).to_be_bytes());
        out.extend_from_slice(der);
    }
    out
}

fn get_chain(body: &[u8]) -> Result<CertificateChain, Error> {
    let mut reader = Reader::new(body);
    let count = reader.u8()?;
    let mut certificates = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.u32()? as usize;
        certificates.push(reader.bytes(len)?.to_vec());
    }
    Ok(CertificateChain::new(certificates))
}

fn signature_body(algorithm: SignatureAndHashAlgorithm, signature: &[u8]) -> Vec<u8> {
    let mut out = algorithm.as_u16().to_be_bytes().to_vec();
    out.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    out.extend_from_slice(signature);
    out
}

fn get_signature(body: &[u8]) -> Result<(SignatureAndHashAlgorithm, Vec<u8>), Error> {
    let mut reader = Reader::new(body);
    let algorithm = SignatureAndHashAlgorithm::from_u16(reader.u16()?);
    let len = reader.u16()? as usize;
    let signature = reader.bytes(len)?.to_vec();
    if signature.is_empty() {
        return Err(Error::HandshakeIo("empty signature".into()));
    }
    Ok((algorithm, signature))
}

fn request_body(request: &CertificateRequest) -> Vec<u8> {
    let mut out = vec![request.certificate_types.len() as u8];
    out.extend(request.certificate_types.iter().map(|t| u8::from(*t)));
    match &request.signature_algorithms {
        Some(algorithms) => {
            out.push(1);
            put_algorithms(&mut out, algorithms);
        }
        None => out.push(0),
    }
    out.push(request.certificate_authorities.len() as u8);
    for name in &request.certificate_authorities {
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
    }
    out
}

fn get_request(body: &[u8]) -> Result<CertificateRequest, Error> {
    let mut reader = Reader::new(body);
    let types = reader.u8()?;
    let certificate_types = (0..types)
        .map(|_| reader.u8().map(ClientCertificateType::from))
        .collect::<Result<Vec<_>, _>>()?;
    let signature_algorithms = match reader.u8()? {
        0 => None,
        _ => Some(reader.algorithms()?),
    };
    let names = reader.u8()?;
    let mut certificate_authorities = Vec::with_capacity(names as usize);
    for _ in 0..names {
        let len = reader.u16()? as usize;
        certificate_authorities.push(reader.bytes(len)?.to_vec());
    }
    Ok(CertificateRequest {
        certificate_types,
        signature_algorithms,
        certificate_authorities,
    })
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Reader(body)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.0.len() < n {
            return Err(Error::HandshakeIo("truncated message".into()));
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn versions(&mut self) -> Result<Vec<ProtocolVersion>, Error> {
        let n = self.u8()?;
        let mut versions = Vec::with_capacity(n as usize);
        for _ in 0..n {
            // Skip what we do not know.
            if let Some(v) = ProtocolVersion::from_u16(self.u16()?) {
                versions.push(v);
            }
        }
        Ok(versions)
    }

    fn algorithms(&mut self) -> Result<Vec<SignatureAndHashAlgorithm>, Error> {
        let n = self.u8()?;
        (0..n)
            .map(|_| self.u16().map(SignatureAndHashAlgorithm::from_u16))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::bridge::RawDatagramBridge;
    use crate::credentials::CredentialResolver;
    use crate::packet::Datagram;
    use crate::role::{ClientRole, HandshakeRole, ServerRole};
    use crate::types::Heartbeat;

    /// Two transports joined back to back, without sockets.
    #[derive(Debug)]
    struct Pipe {
        inbound: Arc<RawDatagramBridge>,
        outbound: Arc<RawDatagramBridge>,
    }

    impl DatagramTransport for Pipe {
        fn send(&self, buf: &[u8]) -> Result<(), Error> {
            if buf.len() > self.send_limit() {
                return Err(Error::OversizedRecord {
                    len: buf.len(),
                    limit: self.send_limit(),
                });
            }
            let from = "127.0.0.1:1".parse().unwrap();
            self.outbound.enqueue(Datagram::new(buf.to_vec(), from));
            Ok(())
        }

        fn receive(&self, buf: &mut [u8], wait: Duration) -> Result<Option<usize>, Error> {
            self.inbound.receive(buf, wait)
        }

        fn send_limit(&self) -> usize {
            1408
        }

        fn receive_limit(&self) -> usize {
            1472
        }

        fn close(&self) {
            self.inbound.close();
        }
    }

    fn pipes() -> (Arc<Pipe>, Arc<Pipe>) {
        let a = Arc::new(RawDatagramBridge::with_limits(1408, 1472));
        let b = Arc::new(RawDatagramBridge::with_limits(1408, 1472));
        (
            Arc::new(Pipe {
                inbound: a.clone(),
                outbound: b.clone(),
            }),
            Arc::new(Pipe {
                inbound: b,
                outbound: a,
            }),
        )
    }

    fn heartbeat() -> Heartbeat {
        Heartbeat::symmetric(Duration::from_secs(10))
    }

    fn client_role(resolver: CredentialResolver) -> Arc<ClientRole> {
        Arc::new(ClientRole::new(
            "127.0.0.1:4740".parse().unwrap(),
            Arc::new(resolver),
            heartbeat(),
        ))
    }

    fn server_role() -> Arc<ServerRole> {
        Arc::new(ServerRole::new(
            Arc::new(CredentialResolver::server()),
            heartbeat(),
        ))
    }

    #[test]
    fn handshake_then_data() {
        let (client_side, server_side) = pipes();
        let engine = LoopbackEngine::default();
        let server = server_role();

        let s = server.clone();
        let e = engine.clone();
        let accept = thread::spawn(move || e.accept(&*s, server_side));

        let client = client_role(CredentialResolver::client());
        let client_handle = engine.connect(&*client, client_side).unwrap();
        let server_handle = accept.join().unwrap().unwrap();

        assert!(client.is_handshake_complete());
        assert!(server.is_handshake_complete());

        client_handle.send(&[0xCA, 0xFE]).unwrap();
        let mut buf = [0u8; 16];
        let n = server_handle
            .receive(&mut buf, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[0xCA, 0xFE]);

        // Handles leave room for the record header.
        assert_eq!(client_handle.send_limit(), 1407);
        assert!(matches!(
            client_handle.send(&[0u8; 1408]),
            Err(Error::OversizedRecord { len: 1408, limit: 1407 })
        ));
    }

    #[test]
    fn foreign_client_chain_is_bad_certificate() {
        let dir = std::env::temp_dir();
        let foreign = dir.join(format!("dtls-bridge-{}-loopback-foreign.pem", std::process::id()));
        std::fs::write(
            &foreign,
            include_str!("credentials/defaults/server_cert.pem"),
        )
        .unwrap();

        // A chain that does not reach the trusted root.
        let resolver = CredentialResolver::client();
        resolver.set_root_path(Some(foreign.clone()));
        resolver.set_peer_path(Some(foreign.clone()));

        let (client_side, server_side) = pipes();
        let engine = LoopbackEngine::default();
        let server = server_role();
        let s = server.clone();
        let e = engine.clone();
        let accept = thread::spawn(move || e.accept(&*s, server_side));

        let client = client_role(resolver);
        let client_result = engine.connect(&*client, client_side);
        let server_result = accept.join().unwrap();

        assert!(matches!(server_result, Err(Error::BadCertificate(_))));
        assert!(matches!(
            client_result,
            Err(Error::AlertReceived(AlertDescription::BadCertificate))
        ));
        assert!(!server.is_handshake_complete());
        let _ = std::fs::remove_file(foreign);
    }

    #[test]
    fn accept_waits_until_interrupted() {
        let (_client_side, server_side) = pipes();
        let engine = LoopbackEngine::with_handshake_timeout(Duration::from_millis(10));
        let server = server_role();
        let pipe = server_side.clone();
        let accept = thread::spawn(move || engine.accept(&*server, server_side));

        // Longer than the handshake timeout, the wait for a hello is unbounded.
        thread::sleep(Duration::from_millis(300));
        assert!(!accept.is_finished());
        pipe.close();
        assert!(matches!(accept.join().unwrap(), Err(Error::Interrupted)));
    }

    #[test]
    fn silent_server_times_out() {
        let (client_side, _server_side) = pipes();
        let engine = LoopbackEngine::with_handshake_timeout(Duration::from_millis(200));
        let client = client_role(CredentialResolver::client());
        assert!(matches!(
            engine.connect(&*client, client_side),
            Err(Error::HandshakeIo(_))
        ));
        assert!(!client.is_handshake_complete());
    }

    #[test]
    fn request_body_roundtrip_without_algorithms() {
        let request = CertificateRequest {
            certificate_types: vec![ClientCertificateType::RSA_SIGN],
            signature_algorithms: None,
            certificate_authorities: vec![vec![0x30, 0x00]],
        };
        assert_eq!(get_request(&request_body(&request)).unwrap(), request);
        assert!(get_request(&[1]).is_err());
    }
}
