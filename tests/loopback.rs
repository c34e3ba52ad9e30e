use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use planeserv::network::body::{
    AuthenticationRequest, AuthenticationResponse, Body, Origin, ZONE_LANDSCAPE_BODY_SIZE,
};
use planeserv::network::packet::{write_packet, BodyType, PacketReader, WireHead, WIRE_HEAD_SIZE};
use planeserv::network::PumpConfig;
use planeserv::types::Handle;
use planeserv::{NetEvent, NetPump, Platform, Server, ServerConfig};

fn config() -> ServerConfig {
    ServerConfig {
        port: 0,
        bind_address: "127.0.0.1".into(),
        memory_bytes: 4 * 1024 * 1024,
        max_connections: 4,
        max_clients: 4,
        max_characters: 4,
        world_zones: 1,
        world_seed: Some(5),
        poll_timeout_ms: 20,
        ..Default::default()
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

struct Peer {
    stream: TcpStream,
    inbox: Vec<u8>,
}
impl Peer {
    fn connect(pump: &NetPump) -> Self {
        let stream = TcpStream::connect(pump.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        Self { stream, inbox: Vec::new() }
    }
    fn address(&self) -> SocketAddr {
        self.stream.local_addr().unwrap()
    }
    fn send(&mut self, body: &Body<'_>) {
        let mut out = vec![0; WIRE_HEAD_SIZE + body.marshalled_size()];
        let n = body.marshal_wire(&mut out).unwrap();
        self.stream.write_all(&out[..n]).unwrap();
    }
    /// Reads whatever arrived and pops one whole packet, if any.
    fn poll(&mut self) -> Option<(u16, Vec<u8>)> {
        let mut scratch = [0u8; 4096];
        match self.stream.read(&mut scratch) {
            Ok(n) => self.inbox.extend_from_slice(&scratch[..n]),
            Err(e) if would_block(&e) => {}
            Err(e) => panic!("{e}"),
        }
        let head = WireHead::decode(&self.inbox).filter(|h| self.inbox.len() >= h.packet_len())?;
        let body = self.inbox[WIRE_HEAD_SIZE..head.packet_len()].to_vec();
        self.inbox.drain(..head.packet_len());
        Some((head.tag, body))
    }
    fn poll_until(&mut self, deadline: Duration) -> (u16, Vec<u8>) {
        let deadline = Instant::now() + deadline;
        loop {
            if let Some(packet) = self.poll() {
                return packet;
            }
            assert!(Instant::now() < deadline, "no packet arrived");
        }
    }
    /// Waits for the server side to shut the socket. Anything read on the
    /// way lands in `inbox`.
    fn closed(&mut self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut scratch = [0u8; 64];
        while Instant::now() < deadline {
            match self.stream.read(&mut scratch) {
                Ok(0) => return true,
                Ok(n) => self.inbox.extend_from_slice(&scratch[..n]),
                Err(e) if would_block(&e) => {}
                Err(_) => return true,
            }
        }
        false
    }
}

fn tick_until<P: Platform>(server: &mut Server<P>, mut done: impl FnMut(&mut Server<P>) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(server) {
        assert!(Instant::now() < deadline, "timed out");
        server.update(0.01);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Collects events until `count` connections were announced, keyed by peer
/// address.
fn accepted(pump: &NetPump, count: usize) -> HashMap<SocketAddr, Handle> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut handles = HashMap::new();
    while handles.len() < count {
        assert!(Instant::now() < deadline, "connections were not announced");
        pump.with_net_events(&mut |event| {
            if let NetEvent::Connected { handle, address } = event {
                handles.insert(address, handle);
            }
        });
        thread::sleep(Duration::from_millis(5));
    }
    handles
}

fn wait_for_disconnection(pump: &NetPump, handle: Handle, within: Duration) {
    let deadline = Instant::now() + within;
    let mut gone = false;
    while !gone {
        assert!(Instant::now() < deadline, "connection {handle} was never dropped");
        pump.with_net_events(&mut |event| gone |= event == NetEvent::Disconnected { handle });
        thread::sleep(Duration::from_millis(5));
    }
}

/// Queues one message per `(handle, body)` in a single sending batch, as
/// many as fit.
fn queue(pump: &NetPump, packets: &[(Handle, &[u8])]) {
    pump.with_sending_buffer(&mut |dest| {
        let mut written = 0;
        for &(handle, body) in packets {
            match write_packet(&mut dest[written..], handle.0, BodyType::Message, body) {
                Ok(n) => written += n,
                Err(_) => break,
            }
        }
        written
    });
}

#[test]
fn login_over_tcp_receives_answer_and_landscape() {
    let config = config();
    let pump = NetPump::start(config.pump().unwrap()).unwrap();
    let mut peer = Peer::connect(&pump);
    let mut server = Server::new(&config, pump).unwrap();
    tick_until(&mut server, |s| s.core().connections.len() == 1);

    peer.send(&Body::AuthenticationRequest(AuthenticationRequest::new("Ava", "pw")));
    let mut received = Vec::new();
    tick_until(&mut server, |_| {
        if let Some(packet) = peer.poll() {
            received.push(packet);
        }
        received.len() == 2
    });

    assert_eq!(received[0].0, BodyType::Authentication.tag());
    assert_eq!(
        Body::muster(BodyType::Authentication, Origin::Server, &received[0].1).unwrap(),
        Body::AuthenticationResponse(AuthenticationResponse { accepted: true })
    );
    assert_eq!(received[1].0, BodyType::WorldSyncLandscape.tag());
    assert_eq!(received[1].1.len(), ZONE_LANDSCAPE_BODY_SIZE);

    server.shutdown().unwrap().shutdown();
}

#[test]
fn invalid_tag_gets_the_socket_closed() {
    let config = config();
    let pump = NetPump::start(config.pump().unwrap()).unwrap();
    let mut peer = Peer::connect(&pump);
    let mut server = Server::new(&config, pump).unwrap();
    tick_until(&mut server, |s| s.core().connections.len() == 1);

    peer.stream.write_all(&[9, 0, 0, 0]).unwrap();
    tick_until(&mut server, |s| {
        s.core().connections.is_empty() && s.platform().connection_count() == 0
    });
    assert!(peer.closed());
}

#[test]
fn remote_close_reaches_the_tick() {
    let config = config();
    let pump = NetPump::start(config.pump().unwrap()).unwrap();
    let peer = Peer::connect(&pump);
    let mut server = Server::new(&config, pump).unwrap();
    tick_until(&mut server, |s| s.core().connections.len() == 1);
    drop(peer);
    tick_until(&mut server, |s| s.core().connections.is_empty());
}

#[test]
fn packets_for_a_closed_handle_are_skipped() {
    let pump = NetPump::start(config().pump().unwrap()).unwrap();
    let mut a = Peer::connect(&pump);
    let mut b = Peer::connect(&pump);
    let handles = accepted(&pump, 2);
    let (ha, hb) = (handles[&a.address()], handles[&b.address()]);

    pump.close_connection(ha);
    queue(&pump, &[(ha, &b"for a"[..]), (hb, &b"for b"[..])]);

    let (tag, body) = b.poll_until(Duration::from_secs(2));
    assert_eq!(tag, BodyType::Message.tag());
    assert_eq!(body, b"for b");
    assert!(a.closed());
    assert!(a.inbox.is_empty());
    assert_eq!(pump.connection_count(), 1);
}

#[test]
fn released_handles_are_not_handed_out_again() {
    let pump = NetPump::start(config().pump().unwrap()).unwrap();
    let a = Peer::connect(&pump);
    let ha = accepted(&pump, 1)[&a.address()];
    drop(a);
    wait_for_disconnection(&pump, ha, Duration::from_secs(2));

    let mut b = Peer::connect(&pump);
    let hb = accepted(&pump, 1)[&b.address()];
    assert_ne!(ha, hb);

    // a late close for the old handle leaves the new connection alone
    pump.close_connection(ha);
    queue(&pump, &[(hb, &b"still here"[..])]);
    assert_eq!(b.poll_until(Duration::from_secs(2)).1, b"still here");
    assert_eq!(pump.connection_count(), 1);
}

#[test]
fn full_reception_buffer_pauses_reading_without_losing_packets() {
    const PACKETS: u16 = 3000;
    const BODY: usize = 100;
    let config = PumpConfig {
        reception_buffer_bytes: 4096,
        poll_timeout: Duration::from_millis(5),
        ..config().pump().unwrap()
    };
    let pump = NetPump::start(config).unwrap();
    let peer = Peer::connect(&pump);
    let handle = accepted(&pump, 1)[&peer.address()];

    let mut stream = peer.stream.try_clone().unwrap();
    let writer = thread::spawn(move || {
        for i in 0..PACKETS {
            let mut packet = vec![0; WIRE_HEAD_SIZE + BODY];
            packet[2..4].copy_from_slice(&(BODY as u16).to_le_bytes());
            packet[WIRE_HEAD_SIZE..WIRE_HEAD_SIZE + 2].copy_from_slice(&i.to_le_bytes());
            stream.write_all(&packet).unwrap();
        }
    });
    // let the peer run well ahead of the reader
    thread::sleep(Duration::from_millis(300));

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut next = 0u16;
    while next < PACKETS {
        assert!(Instant::now() < deadline, "stopped after {next} packets");
        pump.with_reception_buffer(&mut |bytes| {
            assert!(bytes.len() <= 4096);
            for packet in PacketReader::new(bytes) {
                let packet = packet.unwrap();
                assert_eq!(packet.head.connection, handle.0);
                assert_eq!(packet.body.len(), BODY);
                assert_eq!(u16::from_le_bytes([packet.body[0], packet.body[1]]), next);
                next += 1;
            }
        });
        thread::sleep(Duration::from_millis(1));
    }
    writer.join().unwrap();
    assert_eq!(pump.connection_count(), 1);
}

#[test]
fn stalled_peer_does_not_block_the_tick() {
    let config = PumpConfig {
        send_stall_timeout: Duration::from_millis(1500),
        ..config().pump().unwrap()
    };
    let pump = NetPump::start(config).unwrap();
    let stalled = Peer::connect(&pump);
    let mut healthy = Peer::connect(&pump);
    let handles = accepted(&pump, 2);
    let (hs, hh) = (handles[&stalled.address()], handles[&healthy.address()]);

    let chunk = vec![0x55u8; 60_000];
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut slowest = Duration::ZERO;
    let mut gone = false;
    while !gone {
        assert!(Instant::now() < deadline, "stalled connection was never dropped");
        let started = Instant::now();
        queue(&pump, &[(hs, &chunk[..])]);
        assert!(pump.connection_count() <= 2);
        pump.with_net_events(&mut |event| gone |= event == NetEvent::Disconnected { handle: hs });
        slowest = slowest.max(started.elapsed());
        thread::sleep(Duration::from_millis(10));
    }
    assert!(slowest < Duration::from_millis(200), "tick-side call took {slowest:?}");

    queue(&pump, &[(hh, &b"ping"[..])]);
    assert_eq!(healthy.poll_until(Duration::from_secs(2)).1, b"ping");
    drop(stalled);
}
