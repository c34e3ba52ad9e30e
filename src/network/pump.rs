//! Socket threads.
//!
//! Three threads own every socket: the listener accepts, the receiver reads
//! and re-frames packets into the reception buffer, the sender drains the
//! sending buffer to the sockets. The server tick only ever sees them
//! through [`Platform`].
//!
//! Locks are always taken in the order sending, sockets, reception, and the
//! tick never holds more than one at a time. No lock is held while a socket
//! write waits on a slow peer.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use polling::{Event, Poller};

use super::buffer::PacketBuffer;
use super::packet::{
    self, BodyType, PacketReader, WireHead, HEAD_SIZE, MAX_BODY_SIZE, WIRE_HEAD_SIZE,
};
use crate::platform::{NetEvent, Platform};
use crate::prelude::*;

const LISTENER: usize = usize::MAX - 1;
const SCRATCH_SIZE: usize = 64 * 1024;
/// Bytes a connection may have read but not yet re-framed.
pub const MAX_BACKLOG: usize = 2 * (WIRE_HEAD_SIZE + MAX_BODY_SIZE);

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub bind: SocketAddr,
    pub max_connections: u16,
    pub reception_buffer_bytes: usize,
    pub sending_buffer_bytes: usize,
    pub poll_timeout: Duration,
    pub send_stall_timeout: Duration,
}

#[derive(Debug)]
struct Slot {
    handle: Handle,
    stream: Arc<TcpStream>,
    address: SocketAddr,
    /// Read bytes not yet moved to the reception buffer.
    backlog: Vec<u8>,
    /// Not re-armed for reading until the backlog drains.
    paused: bool,
}

/// Live sockets. Slot indices key the read poller, handles key everything
/// the tick sees.
///
/// Handles advance on every accept and skip the ones still in use, so a
/// released handle only comes back after the whole `u16` space wrapped.
#[derive(Debug)]
struct Sockets {
    slots: SlotMap<Slot>,
    by_handle: HashMap<Handle, usize>,
    next_handle: u16,
}
impl Sockets {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity(capacity),
            by_handle: HashMap::with_capacity(capacity),
            next_handle: 0,
        }
    }
    fn get(&self, handle: Handle) -> Option<&Slot> {
        self.by_handle.get(&handle).and_then(|&key| self.slots.get(key))
    }
    fn fresh_handle(&mut self) -> Handle {
        // no more than u16::MAX sockets are ever live, so this ends
        loop {
            let handle = Handle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1);
            if !self.by_handle.contains_key(&handle) {
                return handle;
            }
        }
    }
    fn insert(&mut self, slot: Slot) -> Result<usize, Slot> {
        let handle = slot.handle;
        let key = self.slots.insert(slot)?;
        self.by_handle.insert(handle, key);
        Ok(key)
    }
    fn release(&mut self, handle: Handle) -> Option<Slot> {
        let key = self.by_handle.remove(&handle)?;
        self.slots.release(key)
    }
}

struct Shared {
    running: AtomicBool,
    config: PumpConfig,

    accept_poller: Poller,
    read_poller: Poller,
    sockets: Mutex<Sockets>,

    events: (Sender<NetEvent>, Receiver<NetEvent>),
    reception: Mutex<PacketBuffer>,
    sending: Mutex<PacketBuffer>,
    data_ready: (Sender<()>, Receiver<()>),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct NetPump {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}
impl NetPump {
    /// Binds the listening socket and starts the three threads.
    pub fn start(config: PumpConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let accept_poller = Poller::new()?;
        accept_poller.add(&listener, Event::readable(LISTENER))?;
        let max_connections = config.max_connections as usize;
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            accept_poller,
            read_poller: Poller::new()?,
            sockets: Mutex::new(Sockets::with_capacity(max_connections)),
            events: crossbeam_channel::bounded(2 * max_connections.max(1)),
            reception: Mutex::new(PacketBuffer::with_capacity(config.reception_buffer_bytes)),
            sending: Mutex::new(PacketBuffer::with_capacity(config.sending_buffer_bytes)),
            data_ready: crossbeam_channel::bounded(1),
            config,
        });

        match local_ip_address::local_ip() {
            Ok(ip) => {
                log::info!("listening on {local_addr} (LAN address {ip}:{})", local_addr.port())
            }
            Err(e) => log::info!("listening on {local_addr} (no LAN address: {e})"),
        }

        let mut pump = Self { shared, local_addr, threads: Vec::with_capacity(3) };
        let spawn = |name: &str, run: fn(&Shared)| {
            let shared = pump.shared.clone();
            thread::Builder::new().name(name.into()).spawn(move || run(&shared))
        };
        let receiver = spawn("receiver", Shared::receive)?;
        let sender = spawn("sender", Shared::send)?;
        let l = pump.shared.clone();
        let listener = thread::Builder::new()
            .name("listener".into())
            .spawn(move || l.listen(listener))?;
        pump.threads.extend([listener, receiver, sender]);
        Ok(pump)
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.sockets).slots.len()
    }
    /// Stops the threads and closes every socket.
    pub fn shutdown(mut self) {
        self.stop();
    }
    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        for p in [&self.shared.accept_poller, &self.shared.read_poller] {
            if let Err(e) = p.notify() {
                log::error!("failed to wake network thread: {e}");
            }
        }
        let _ = self.shared.data_ready.0.try_send(());
        for t in self.threads.drain(..) {
            let name = t.thread().name().unwrap_or("network").to_owned();
            if t.join().is_err() {
                log::error!("{name} thread panicked");
            }
        }
        let mut sockets = lock(&self.shared.sockets);
        sockets.slots.retain(|_, slot| {
            let _ = slot.stream.shutdown(Shutdown::Both);
            false
        });
        sockets.by_handle.clear();
        log::info!("network stopped");
    }
}
impl Drop for NetPump {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Platform for NetPump {
    fn with_net_events(&self, f: &mut dyn FnMut(NetEvent)) {
        for event in self.shared.events.1.try_iter() {
            f(event);
        }
    }
    fn with_reception_buffer(&self, f: &mut dyn FnMut(&[u8])) {
        let mut reception = lock(&self.shared.reception);
        f(reception.as_slice());
        reception.clear();
    }
    fn with_sending_buffer(&self, f: &mut dyn FnMut(&mut [u8]) -> usize) {
        let written = lock(&self.shared.sending).fill_with(|dst| f(dst));
        if written > 0 {
            // a full channel already holds a pending wake-up
            let _ = self.shared.data_ready.0.try_send(());
        }
    }
    fn close_connection(&self, handle: Handle) {
        let mut sockets = lock(&self.shared.sockets);
        self.shared.disconnect(&mut sockets, handle, "closed by server");
    }
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Releases the slot and queues the disconnection for the tick.
    fn disconnect(&self, sockets: &mut Sockets, handle: Handle, reason: &str) {
        let Some(slot) = sockets.release(handle) else {
            return;
        };
        if let Err(e) = self.read_poller.delete(&*slot.stream) {
            log::debug!("connection {handle} was not registered for reading: {e}");
        }
        let _ = slot.stream.shutdown(Shutdown::Both);
        log::info!("connection {handle} ({}) closed: {reason}", slot.address);
        if self.events.0.try_send(NetEvent::Disconnected { handle }).is_err() {
            log::error!("event queue full, lost disconnection of {handle}");
        }
    }

    fn listen(&self, listener: TcpListener) {
        let mut events = Vec::new();
        while self.running() {
            events.clear();
            match self.accept_poller.wait(&mut events, Some(self.config.poll_timeout)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("listener stopped: {e}");
                    return;
                }
            }
            if events.is_empty() {
                continue;
            }
            loop {
                match listener.accept() {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("failed to accept connection: {e}");
                        break;
                    }
                    Ok((stream, address)) => self.admit(stream, address),
                }
            }
            if let Err(e) = self.accept_poller.modify(&listener, Event::readable(LISTENER)) {
                log::error!("listener stopped: {e}");
                return;
            }
        }
    }

    fn admit(&self, stream: TcpStream, address: SocketAddr) {
        let mut sockets = lock(&self.sockets);
        // each live slot may still owe one disconnection on the queue
        let capacity = sockets.slots.capacity();
        let Some(key) = sockets.slots.next_idx().filter(|_| self.events.0.len() < capacity) else {
            log::warn!("refusing connection from {address}: server full");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        };
        let setup = stream
            .set_nonblocking(true)
            .and_then(|()| stream.set_nodelay(true))
            .and_then(|()| self.read_poller.add(&stream, Event::readable(key)));
        if let Err(e) = setup {
            log::error!("failed to set up connection from {address}: {e}");
            return;
        }
        let handle = sockets.fresh_handle();
        let slot = Slot {
            handle,
            stream: Arc::new(stream),
            address,
            backlog: Vec::new(),
            paused: false,
        };
        if let Err(slot) = sockets.insert(slot) {
            log::error!("socket slot {key} vanished while admitting {address}");
            let _ = self.read_poller.delete(&*slot.stream);
            return;
        }
        if self.events.0.try_send(NetEvent::Connected { handle, address }).is_err() {
            log::error!("event queue full, dropping connection {handle}");
            self.disconnect(&mut sockets, handle, "event queue full");
            return;
        }
        log::info!("accepted connection {handle} from {address}");
    }

    fn receive(&self) {
        let mut scratch = vec![0; SCRATCH_SIZE];
        let mut events = Vec::new();
        while self.running() {
            events.clear();
            match self.read_poller.wait(&mut events, Some(self.config.poll_timeout)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("receiver stopped: {e}");
                    return;
                }
            }
            let mut sockets = lock(&self.sockets);
            for event in &events {
                self.read_from(&mut sockets, event.key, &mut scratch);
            }
            self.retry_backlogs(&mut sockets);
        }
    }

    fn read_from(&self, sockets: &mut Sockets, key: usize, scratch: &mut [u8]) {
        let Some(slot) = sockets.slots.get_mut(key) else {
            return;
        };
        let handle = slot.handle;
        let room = MAX_BACKLOG - slot.backlog.len();
        if room == 0 {
            slot.paused = true;
            return;
        }
        let read = loop {
            match (&*slot.stream).read(&mut scratch[..room.min(SCRATCH_SIZE)]) {
                Ok(n) => break Some(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(e) => {
                    log::error!("failed to read from connection {handle}: {e}");
                    return self.disconnect(sockets, handle, "receive failed");
                }
            }
        };
        match read {
            Some(0) => return self.disconnect(sockets, handle, "remote closed"),
            Some(n) => {
                log::trace!("read {n} bytes from connection {handle}");
                slot.backlog.extend_from_slice(&scratch[..n]);
            }
            None => {}
        }
        if let Err(d) = self.flush_backlog(slot) {
            log::warn!("connection {handle}: {d}");
            return self.disconnect(sockets, handle, d.reason());
        }
        if slot.backlog.len() == MAX_BACKLOG {
            log::debug!("pausing connection {handle} until its backlog drains");
            slot.paused = true;
            return;
        }
        if let Err(e) = self.read_poller.modify(&*slot.stream, Event::readable(key)) {
            log::error!("failed to re-arm connection {handle}: {e}");
            self.disconnect(sockets, handle, "poller failure");
        }
    }

    fn flush_backlog(&self, slot: &mut Slot) -> Result<(), Disconnection> {
        if slot.backlog.is_empty() {
            return Ok(());
        }
        let mut reception = lock(&self.reception);
        let consumed = reframe(slot.handle, &slot.backlog, &mut reception)?;
        slot.backlog.drain(..consumed);
        Ok(())
    }

    /// Moves backlogs held back by a full reception buffer and re-arms the
    /// connections that were paused on them.
    fn retry_backlogs(&self, sockets: &mut Sockets) {
        let mut failed = Vec::new();
        let mut resumed = Vec::new();
        for (key, slot) in sockets.slots.iter_mut() {
            if let Err(d) = self.flush_backlog(slot) {
                failed.push((slot.handle, d));
            } else if slot.paused && slot.backlog.len() < MAX_BACKLOG {
                slot.paused = false;
                resumed.push(key);
            }
        }
        for (handle, d) in failed {
            log::warn!("connection {handle}: {d}");
            self.disconnect(sockets, handle, d.reason());
        }
        for key in resumed {
            let Some(slot) = sockets.slots.get(key) else { continue };
            let handle = slot.handle;
            log::debug!("resuming connection {handle}");
            if let Err(e) = self.read_poller.modify(&*slot.stream, Event::readable(key)) {
                log::error!("failed to re-arm connection {handle}: {e}");
                self.disconnect(sockets, handle, "poller failure");
            }
        }
    }

    fn send(&self) {
        let mut pending = Vec::with_capacity(self.config.sending_buffer_bytes);
        let mut scratch = vec![0; WIRE_HEAD_SIZE + MAX_BODY_SIZE];
        while self.running() {
            match self.data_ready.1.recv_timeout(self.config.poll_timeout) {
                Ok(()) => self.drain_sending(&mut pending, &mut scratch),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Takes everything the tick queued, then writes it with no lock held.
    fn drain_sending(&self, pending: &mut Vec<u8>, scratch: &mut [u8]) {
        {
            let mut sending = lock(&self.sending);
            pending.clear();
            pending.extend_from_slice(sending.as_slice());
            sending.clear();
        }
        for packet in PacketReader::new(pending.as_slice()) {
            let packet = match packet {
                Ok(p) => p,
                Err(e) => {
                    log::error!("dropping rest of sending buffer: {e}");
                    break;
                }
            };
            let handle = Handle(packet.head.connection);
            let body_type = packet.head.body_type;
            let n = match packet::encode_wire_packet(scratch, &packet) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("failed to encode packet for connection {handle}: {e}");
                    continue;
                }
            };
            let stream = lock(&self.sockets).get(handle).map(|slot| Arc::clone(&slot.stream));
            let Some(stream) = stream else {
                log::trace!("skipping {body_type} for closed connection {handle}");
                continue;
            };
            let stall = self.config.send_stall_timeout;
            if let Err(e) = write_with_stall(&stream, &scratch[..n], stall) {
                log::warn!("failed to send to connection {handle}: {e}");
                let mut sockets = lock(&self.sockets);
                // the socket may have been closed and its handle reissued meanwhile
                if sockets.get(handle).is_some_and(|s| Arc::ptr_eq(&s.stream, &stream)) {
                    self.disconnect(&mut sockets, handle, "send failed");
                }
            } else {
                log::trace!("sent {body_type} ({n} bytes) to connection {handle}");
            }
        }
    }
}

fn write_with_stall(mut stream: &TcpStream, mut bytes: &[u8], stall: Duration) -> io::Result<()> {
    let started = Instant::now();
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if started.elapsed() > stall {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Moves every complete wire packet at the front of `bytes` into `reception`,
/// tagged with `handle`, and returns how many bytes were taken. An incomplete
/// tail, or packets that no longer fit, are left for the next call.
///
/// An invalid type tag rewinds `reception` to where it stood on entry.
pub fn reframe(
    handle: Handle,
    bytes: &[u8],
    reception: &mut PacketBuffer,
) -> Result<usize, Disconnection> {
    let mark = reception.len();
    let mut consumed = 0;
    while let Some(head) = WireHead::decode(&bytes[consumed..]) {
        let Some(body_type) = BodyType::from_tag(head.tag) else {
            reception.rewind(mark);
            return Err(Disconnection::new("invalid body type"));
        };
        if HEAD_SIZE + head.body_size as usize > reception.capacity() {
            reception.rewind(mark);
            return Err(Disconnection::new("packet larger than the reception buffer"));
        }
        let Some(packet) = bytes[consumed..].get(..head.packet_len()) else {
            break;
        };
        if reception.push(handle.0, body_type, &packet[WIRE_HEAD_SIZE..]).is_err() {
            log::warn!("reception buffer full, holding packets from connection {handle}");
            break;
        }
        consumed += head.packet_len();
    }
    Ok(consumed)
}
