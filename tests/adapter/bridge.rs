//! Raw datagram bridge over real sockets.

use std::time::Duration;

use dtls_bridge::bridge::RawDatagramBridge;
use dtls_bridge::channel::Bootstrap;
use dtls_bridge::{DatagramTransport, Error};

use crate::common::*;

#[test]
fn payloads_up_to_the_limit_arrive_unchanged() {
    let _ = env_logger::try_init();

    let rt = runtime();
    let config = config();
    let bootstrap = Bootstrap::new(config.clone(), rt.handle().clone());
    let (peer, mut inbound) = plain_peer(&bootstrap);

    let ch = bootstrap.connect(peer.local_addr()).unwrap();
    ch.activate().unwrap();
    let bridge = RawDatagramBridge::new(&config);
    bridge.set_channel(ch);
    bridge.set_remote_address(peer.local_addr());

    let limit = config.send_limit();
    for len in [0, 1, 13, 512, limit - 1, limit] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        bridge.send(&payload).unwrap();

        let d = within(&rt, Duration::from_secs(5), inbound.recv())
            .expect("datagram in time")
            .expect("channel open");
        assert_eq!(d.payload(), &payload[..], "payload of {} bytes", len);
    }
}

#[test]
fn oversized_payload_never_reaches_the_wire() {
    let _ = env_logger::try_init();

    let rt = runtime();
    let config = config();
    let bootstrap = Bootstrap::new(config.clone(), rt.handle().clone());
    let (peer, mut inbound) = plain_peer(&bootstrap);

    let ch = bootstrap.connect(peer.local_addr()).unwrap();
    ch.activate().unwrap();
    let bridge = RawDatagramBridge::new(&config);
    bridge.set_channel(ch);
    bridge.set_remote_address(peer.local_addr());

    let limit = config.send_limit();
    for len in [limit + 1, limit + 100, config.mtu()] {
        let err = bridge.send(&vec![7u8; len]).unwrap_err();
        assert!(
            matches!(err, Error::OversizedRecord { len: l, limit: m } if l == len && m == limit),
            "{:?}",
            err
        );
    }

    let nothing = within(&rt, Duration::from_millis(300), inbound.recv());
    assert!(nothing.is_err());
}

#[test]
fn close_stops_sending_and_receiving() {
    let _ = env_logger::try_init();

    let rt = runtime();
    let config = config();
    let bootstrap = Bootstrap::new(config.clone(), rt.handle().clone());
    let (peer, _inbound) = plain_peer(&bootstrap);

    let ch = bootstrap.connect(peer.local_addr()).unwrap();
    ch.activate().unwrap();
    let bridge = RawDatagramBridge::new(&config);
    bridge.set_channel(ch);
    bridge.set_remote_address(peer.local_addr());

    bridge.close();
    assert!(matches!(bridge.send(&[1]), Err(Error::NotConnected)));
    let mut buf = [0u8; 16];
    assert!(matches!(
        bridge.receive(&mut buf, Duration::from_millis(10)),
        Err(Error::Interrupted)
    ));
}
