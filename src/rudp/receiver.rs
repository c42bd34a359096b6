//! Receiver engine: handshake acceptance, in-order reassembly with an
//! out-of-order buffer, cumulative ACK emission, and FIN handling.
//!
//! Unlike the sender, the receiver rarely drives its own timers — it only
//! needs to retransmit a SYN-ACK while a handshake is pending. One
//! background thread multiplexes every peer on a single bound socket, the
//! same merged "tick everything, then poll once" shape the sender uses,
//! scaled up from one connection to a map of them.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::codec::{Flags, Segment};
use super::connection::{ConnState, Connection};
use super::crypto::CryptoEnvelope;
use super::{seq_lt, Metrics, MAX_RETRIES, MAX_RTO_MS, MIN_RTO_MS, RWND_MAX};
use crate::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long a connection lingers in `CloseWait` after ACKing a FIN, in case
/// the sender never saw that ACK and retransmits the FIN.
const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

struct PendingConn {
    conn: Connection,
    deadline: Instant,
}

/// One accepted connection's reassembly state and the bytes already
/// delivered to the application but not yet read out.
struct StreamEntry {
    conn: Mutex<Connection>,
    incoming: Mutex<VecDeque<u8>>,
    eof: AtomicBool,
    cv: Condvar,
    close_after: Mutex<Option<Instant>>,
}

struct ServerState {
    pending: HashMap<SocketAddr, PendingConn>,
    streams: HashMap<SocketAddr, Arc<StreamEntry>>,
    ready: VecDeque<AcceptedStream>,
    shutdown: bool,
}

struct Shared {
    socket: UdpSocket,
    drop_rate: f64,
    state: Mutex<ServerState>,
    accept_cv: Condvar,
}

/// A bound RUDP listener. Every accepted peer is multiplexed over the one
/// socket `bind` opened; `accept` blocks until a handshake completes.
pub struct Server {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Binds `bind_addr:port` and starts the background dispatch loop.
    /// `drop_rate` (0.0–1.0) independently discards a fraction of arriving
    /// datagrams before any protocol processing, standing in for a lossy
    /// link in local testing.
    pub fn bind(bind_addr: &str, port: u16, drop_rate: f64) -> Result<Server, Error> {
        let addr = (bind_addr, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        let socket = UdpSocket::bind(addr).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                Error::PortInUse(port)
            } else {
                Error::Io(e)
            }
        })?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let shared = Arc::new(Shared {
            socket,
            drop_rate: drop_rate.clamp(0.0, 1.0),
            state: Mutex::new(ServerState {
                pending: HashMap::new(),
                streams: HashMap::new(),
                ready: VecDeque::new(),
                shutdown: false,
            }),
            accept_cv: Condvar::new(),
        });

        let bg = shared.clone();
        let handle = thread::spawn(move || server_loop(bg));

        log::info!("rudp: listening on {addr}");
        Ok(Server {
            shared,
            handle: Some(handle),
        })
    }

    /// Blocks until a peer completes the handshake, returning its stream.
    pub fn accept(&self) -> Result<AcceptedStream, Error> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(stream) = state.ready.pop_front() {
                return Ok(stream);
            }
            if state.shutdown {
                return Err(Error::ConnectionReset {
                    peer: self.shared.socket.local_addr()?,
                });
            }
            state = self
                .shared
                .accept_cv
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap()
                .0;
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.accept_cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A peer's byte stream, delivered in order. Reading past a received FIN
/// returns `Ok(0)`, exactly like a TCP stream at EOF.
pub struct AcceptedStream {
    peer: SocketAddr,
    entry: Arc<StreamEntry>,
}

impl AcceptedStream {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn metrics(&self) -> Metrics {
        self.entry.conn.lock().unwrap().metrics.clone()
    }
}

impl Read for AcceptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.entry.incoming.lock().unwrap();
        loop {
            if !incoming.is_empty() {
                let n = incoming.len().min(buf.len());
                for (i, byte) in incoming.drain(..n).enumerate() {
                    buf[i] = byte;
                }
                return Ok(n);
            }
            if self.entry.eof.load(Ordering::Relaxed) {
                return Ok(0);
            }
            incoming = self
                .entry
                .cv
                .wait_timeout(incoming, Duration::from_millis(100))
                .unwrap()
                .0;
        }
    }
}

fn server_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; super::PAYLOAD_SIZE + 512];
    loop {
        {
            let mut state = shared.state.lock().unwrap();
            if state.shutdown {
                break;
            }
            tick_pending(&mut state, &shared.socket);
            tick_drains(&mut state);
        }

        match shared.socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                if simulated_drop(shared.drop_rate) {
                    log::trace!("rudp: simulated drop from {peer}");
                    continue;
                }
                handle_datagram(&shared, peer, &buf[..n]);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => log::debug!("rudp: recv error: {e}"),
        }
    }
}

fn simulated_drop(rate: f64) -> bool {
    rate > 0.0 && rand::random::<f64>() < rate
}

fn tick_pending(state: &mut ServerState, socket: &UdpSocket) {
    let mut dead = Vec::new();
    for (&peer, pending) in state.pending.iter_mut() {
        if Instant::now() < pending.deadline {
            continue;
        }
        let attempt = {
            let counter = pending.conn.retries.entry(pending.conn.snd_iss).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempt > MAX_RETRIES {
            log::warn!("rudp: handshake with {peer} abandoned after {attempt} SYN-ACKs");
            dead.push(peer);
            continue;
        }
        pending.conn.rto_ms = (pending.conn.rto_ms * 2).clamp(MIN_RTO_MS, MAX_RTO_MS);
        let seg = Segment::syn_ack(pending.conn.snd_iss, pending.conn.rcv_nxt, pending.conn.rwnd());
        send_segment(socket, peer, &seg);
        pending.deadline = Instant::now() + pending.conn.rto();
    }
    for peer in dead {
        state.pending.remove(&peer);
    }
}

fn tick_drains(state: &mut ServerState) {
    let mut done = Vec::new();
    for (&peer, entry) in state.streams.iter() {
        if let Some(at) = *entry.close_after.lock().unwrap() {
            if Instant::now() >= at {
                done.push(peer);
            }
        }
    }
    for peer in done {
        state.streams.remove(&peer);
    }
}

fn send_segment(socket: &UdpSocket, peer: SocketAddr, seg: &Segment) {
    if let Err(e) = socket.send_to(&seg.encode(), peer) {
        log::debug!("rudp: send to {peer} failed: {e}");
    }
}

fn handle_datagram(shared: &Shared, peer: SocketAddr, buf: &[u8]) {
    let Some(seg) = Segment::decode(buf) else {
        log::trace!("rudp: dropped invalid segment from {peer}");
        return;
    };

    let mut state = shared.state.lock().unwrap();

    if let Some(entry) = state.streams.get(&peer).cloned() {
        drop(state);
        if seg.flags.contains(Flags::FIN) {
            handle_fin(&shared.socket, peer, &entry, &seg);
        } else if seg.flags.contains(Flags::DATA) {
            handle_data(&shared.socket, peer, &entry, &seg);
        }
        return;
    }

    if let Some(pending) = state.pending.get_mut(&peer) {
        if seg.flags.contains(Flags::ACK) && seg.ack == pending.conn.snd_nxt {
            let mut conn = state.pending.remove(&peer).unwrap().conn;
            conn.state = ConnState::Established;
            conn.metrics.start = Some(Instant::now());
            let entry = Arc::new(StreamEntry {
                conn: Mutex::new(conn),
                incoming: Mutex::new(VecDeque::new()),
                eof: AtomicBool::new(false),
                cv: Condvar::new(),
                close_after: Mutex::new(None),
            });
            state.streams.insert(peer, entry.clone());
            state.ready.push_back(AcceptedStream { peer, entry: entry.clone() });
            shared.accept_cv.notify_all();
            log::info!("rudp: accepted connection from {peer}");
            drop(state);

            // A data- or FIN-carrying segment completes the handshake and
            // delivers in the same datagram (the client doesn't wait for a
            // bare third ACK to land before sending); process it now rather
            // than dropping it and waiting on a retransmit that never comes.
            if seg.flags.contains(Flags::FIN) {
                handle_fin(&shared.socket, peer, &entry, &seg);
            } else if seg.flags.contains(Flags::DATA) {
                handle_data(&shared.socket, peer, &entry, &seg);
            }
        }
        return;
    }

    if seg.flags == Flags::SYN {
        let crypto = CryptoEnvelope::new(&seg.payload, !seg.payload.is_empty());
        let isn: u32 = rand::random();
        let mut conn = Connection::new(isn, RWND_MAX, true, crypto);
        conn.state = ConnState::SynRcvd;
        conn.rcv_nxt = seg.seq.wrapping_add(1);
        conn.snd_nxt = isn.wrapping_add(1);

        let reply = Segment::syn_ack(conn.snd_iss, conn.rcv_nxt, conn.rwnd());
        send_segment(&shared.socket, peer, &reply);

        let deadline = Instant::now() + conn.rto();
        state.pending.insert(peer, PendingConn { conn, deadline });
        log::debug!("rudp: handshake started with {peer}");
    }
}

/// The data-plane algorithm for one arriving DATA segment: decrypt, decide
/// whether it lands at, ahead of, or behind `rcv_nxt`, deliver or buffer or
/// drop accordingly, then unconditionally emit a cumulative ACK.
fn handle_data(socket: &UdpSocket, peer: SocketAddr, entry: &Arc<StreamEntry>, seg: &Segment) {
    let mut conn = entry.conn.lock().unwrap();

    let plaintext = match conn.crypto.open(&seg.payload) {
        Ok(p) => p,
        Err(_) => {
            log::trace!("rudp: segment from {peer} failed to authenticate");
            return;
        }
    };

    let s = seg.seq;
    let len = plaintext.len() as u32;

    if s == conn.rcv_nxt {
        if len > 0 {
            deliver(entry, &plaintext);
            conn.metrics.bytes_delivered += len as u64;
        }
        conn.rcv_nxt = conn.rcv_nxt.wrapping_add(len);

        while let Some(buffered) = conn.reorder_buffer.remove(&conn.rcv_nxt) {
            let blen = buffered.len() as u32;
            deliver(entry, &buffered);
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(blen);
            conn.metrics.bytes_delivered += blen as u64;
        }
    } else if seq_lt(conn.rcv_nxt, s) {
        let offset = s.wrapping_sub(conn.rcv_nxt) as u64;
        let window_bytes = conn.rwnd_max as u64 * super::PAYLOAD_SIZE as u64;
        if offset < window_bytes && (conn.reorder_buffer.len() as u16) < conn.rwnd_max && len > 0 {
            conn.reorder_buffer.entry(s).or_insert(plaintext);
        }
    }
    // s < rcv_nxt: already delivered, fall through to re-ACK.

    let ack = Segment::ack(conn.snd_nxt, conn.rcv_nxt, conn.rwnd());
    send_segment(socket, peer, &ack);
}

fn deliver(entry: &Arc<StreamEntry>, bytes: &[u8]) {
    let mut incoming = entry.incoming.lock().unwrap();
    incoming.extend(bytes.iter().copied());
    drop(incoming);
    entry.cv.notify_all();
}

fn handle_fin(socket: &UdpSocket, peer: SocketAddr, entry: &Arc<StreamEntry>, seg: &Segment) {
    let mut conn = entry.conn.lock().unwrap();

    if seg.seq != conn.rcv_nxt {
        let ack = Segment::ack(conn.snd_nxt, conn.rcv_nxt, conn.rwnd());
        send_segment(socket, peer, &ack);
        return;
    }

    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
    conn.state = ConnState::CloseWait;
    let ack = Segment::ack(conn.snd_nxt, conn.rcv_nxt, conn.rwnd());
    send_segment(socket, peer, &ack);

    entry.eof.store(true, Ordering::Relaxed);
    entry.cv.notify_all();
    *entry.close_after.lock().unwrap() = Some(Instant::now() + DRAIN_INTERVAL);
    log::info!("rudp: {peer} sent FIN, connection draining");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rudp::codec::Segment;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn entry_with(rcv_nxt: u32) -> Arc<StreamEntry> {
        let mut conn = Connection::new(0, RWND_MAX, true, CryptoEnvelope::Disabled);
        conn.rcv_nxt = rcv_nxt;
        conn.state = ConnState::Established;
        Arc::new(StreamEntry {
            conn: Mutex::new(conn),
            incoming: Mutex::new(VecDeque::new()),
            eof: AtomicBool::new(false),
            cv: Condvar::new(),
            close_after: Mutex::new(None),
        })
    }

    fn loopback_socket() -> UdpSocket {
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        s.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        s
    }

    #[test]
    fn in_order_segment_is_delivered_immediately() {
        let entry = entry_with(100);
        let socket = loopback_socket();
        let seg = Segment::data(100, 0, 64, b"hello".to_vec());
        handle_data(&socket, peer(), &entry, &seg);

        assert_eq!(*entry.incoming.lock().unwrap(), b"hello".iter().copied().collect::<VecDeque<u8>>());
        assert_eq!(entry.conn.lock().unwrap().rcv_nxt, 105);
    }

    #[test]
    fn out_of_order_segment_is_buffered_then_drained_on_arrival_of_gap() {
        let entry = entry_with(100);
        let socket = loopback_socket();

        let ahead = Segment::data(105, 0, 64, b"world".to_vec());
        handle_data(&socket, peer(), &entry, &ahead);
        assert!(entry.incoming.lock().unwrap().is_empty());
        assert_eq!(entry.conn.lock().unwrap().reorder_buffer.len(), 1);

        let gap = Segment::data(100, 0, 64, b"hello".to_vec());
        handle_data(&socket, peer(), &entry, &gap);

        let delivered: Vec<u8> = entry.incoming.lock().unwrap().iter().copied().collect();
        assert_eq!(delivered, b"helloworld");
        assert_eq!(entry.conn.lock().unwrap().rcv_nxt, 110);
        assert!(entry.conn.lock().unwrap().reorder_buffer.is_empty());
    }

    #[test]
    fn already_delivered_segment_is_dropped_but_still_acked() {
        let entry = entry_with(100);
        let socket = loopback_socket();
        let stale = Segment::data(90, 0, 64, b"old".to_vec());
        handle_data(&socket, peer(), &entry, &stale);
        assert!(entry.incoming.lock().unwrap().is_empty());
        assert_eq!(entry.conn.lock().unwrap().rcv_nxt, 100);
    }

    #[test]
    fn fin_at_rcv_nxt_marks_eof() {
        let entry = entry_with(100);
        let socket = loopback_socket();
        let fin = Segment::fin(100, 0, 64);
        handle_fin(&socket, peer(), &entry, &fin);
        assert!(entry.eof.load(Ordering::Relaxed));
        assert_eq!(entry.conn.lock().unwrap().state, ConnState::CloseWait);
    }

    #[test]
    fn read_returns_eof_once_fin_processed_and_buffer_drained() {
        let entry = entry_with(100);
        let socket = loopback_socket();
        handle_data(&socket, peer(), &entry, &Segment::data(100, 0, 64, b"hi".to_vec()));
        handle_fin(&socket, peer(), &entry, &Segment::fin(102, 0, 64));

        let mut stream = AcceptedStream { peer: peer(), entry };
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        let n2 = stream.read(&mut buf).unwrap();
        assert_eq!(n2, 0);
    }
}
