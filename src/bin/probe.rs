//! Logs into a running server and reports what it sends back.
//!
//! `probe [address] [username] [password]`

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use planeserv::network::body::{AuthenticationRequest, Body, Origin};
use planeserv::network::packet::{BodyType, WireHead, WIRE_HEAD_SIZE};

const WAIT: Duration = Duration::from_secs(5);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1:25000".into());
    let username = args.next().unwrap_or_else(|| format!("probe{}", rand::random::<u16>() % 1000));
    let password = args.next().unwrap_or_default();

    let mut stream = TcpStream::connect(&address)?;
    stream.set_read_timeout(Some(Duration::from_millis(250)))?;
    log::info!("connected to {address} as {username}");

    let request = Body::AuthenticationRequest(AuthenticationRequest::new(&username, &password));
    let mut out = vec![0; WIRE_HEAD_SIZE + request.marshalled_size()];
    let n = request.marshal_wire(&mut out)?;
    stream.write_all(&out[..n])?;

    let deadline = Instant::now() + WAIT;
    let mut inbox = Vec::new();
    let mut scratch = [0u8; 16 * 1024];
    let (mut authenticated, mut landscape) = (None, false);
    let waiting = |authenticated: Option<bool>, landscape: bool| {
        authenticated.is_none() || (authenticated == Some(true) && !landscape)
    };
    while Instant::now() < deadline && waiting(authenticated, landscape) {
        match stream.read(&mut scratch) {
            Ok(0) => {
                log::warn!("server closed the connection");
                break;
            }
            Ok(n) => inbox.extend_from_slice(&scratch[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) => return Err(e.into()),
        }
        while let Some(head) = WireHead::decode(&inbox).filter(|h| inbox.len() >= h.packet_len()) {
            let body = &inbox[WIRE_HEAD_SIZE..head.packet_len()];
            match BodyType::from_tag(head.tag).map(|t| Body::muster(t, Origin::Server, body)) {
                Some(Ok(Body::AuthenticationResponse(response))) => {
                    let verdict = if response.accepted { "accepted" } else { "refused" };
                    println!("authentication {verdict}");
                    authenticated = Some(response.accepted);
                }
                Some(Ok(Body::ZoneLandscape(sync))) => {
                    println!("zone {}: {} land tiles", sync.zone, sync.land_tiles());
                    landscape = true;
                }
                Some(Ok(Body::Message(message))) => println!("message: {message}"),
                Some(Ok(other)) => log::debug!("ignoring {:?}", other.body_type()),
                Some(Err(e)) => log::warn!("undecodable body: {e}"),
                None => log::warn!("unknown body type {}", head.tag),
            }
            inbox.drain(..head.packet_len());
        }
    }
    if authenticated.is_none() {
        println!("no answer within {WAIT:?}");
    }
    Ok(())
}
