//! Sender engine: handshake initiation, the windowed send loop, timer-driven
//! retransmission, Reno congestion control, and FIN shutdown.
//!
//! The "network reader" and "timer/sender driver" tasks of the concurrency
//! model are realized as one background thread per `Client`: each pass
//! through the loop services the retransmission timer (and the zero-window
//! probe, and the windowed send loop) under the connection lock, then
//! blocks in `recv` with a short timeout waiting for the next datagram —
//! the same tick-then-poll shape this codebase's connection manager already
//! used for a single mutex-guarded state machine, generalized here to one
//! connection per `Client` instead of a map of them.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::codec::{Flags, Segment};
use super::connection::{AckOutcome, Connection, InFlight};
use super::crypto::{generate_key, CryptoEnvelope};
use super::{ConnState, Metrics, MAX_RETRIES, MAX_RTO_MS, MIN_RTO_MS, PAYLOAD_SIZE, RWND_MAX};
use crate::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Knobs the embedding CLI/benchmark exposes when opening a connection.
/// Both toggles are local study aids, never negotiated with the peer (the
/// crypto toggle is conveyed in-band by whether the SYN carries key
/// material at all — see `CryptoEnvelope`).
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub use_crypto: bool,
    pub cc_enabled: bool,
    /// Overall deadline for `connect`/`send_bytes`/`close`. `None` means
    /// the call is bounded only by protocol retry exhaustion.
    pub op_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            use_crypto: true,
            cc_enabled: true,
            op_timeout: None,
        }
    }
}

/// Opens a connection to `host:port` and runs the three-way handshake.
pub fn client(host: &str, port: u16, options: ClientOptions) -> Result<Client, Error> {
    let peer = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
    Client::connect(peer, options)
}

#[derive(Debug, Clone)]
enum Fault {
    HandshakeFailure { retries: u32 },
    PeerUnreachable { seq: u32, retries: u32 },
    ShutdownFailure { retries: u32 },
}

impl Fault {
    fn into_error(self, peer: SocketAddr) -> Error {
        match self {
            Fault::HandshakeFailure { retries } => Error::HandshakeFailure { peer, retries },
            Fault::PeerUnreachable { seq, retries } => Error::PeerUnreachable { peer, seq, retries },
            Fault::ShutdownFailure { retries } => Error::ShutdownFailure { peer, retries },
        }
    }
}

struct State {
    conn: Connection,
    outgoing: std::collections::VecDeque<u8>,
    close_requested: bool,
    fault: Option<Fault>,
    timer_deadline: Option<Instant>,
    probe_deadline: Option<Instant>,
    key_material: Vec<u8>,
}

struct Shared {
    socket: UdpSocket,
    peer: SocketAddr,
    state: Mutex<State>,
    cv: Condvar,
    cancelled: AtomicBool,
}

/// A connected RUDP sender. Blocking calls (`send_bytes`, `close`) hand
/// bytes to a background thread and wait on the connection's shared state;
/// the thread itself performs all socket I/O.
pub struct Client {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
    op_timeout: Option<Duration>,
}

impl Client {
    /// Performs the three-way handshake with `peer`, blocking until
    /// `ESTABLISHED` or until SYN retransmission is exhausted.
    pub fn connect(peer: SocketAddr, options: ClientOptions) -> Result<Client, Error> {
        let bind_addr: SocketAddr = if peer.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        socket.connect(peer)?;

        let key_material = if options.use_crypto {
            generate_key().to_vec()
        } else {
            Vec::new()
        };
        let crypto = CryptoEnvelope::new(&key_material, options.use_crypto);

        let iss: u32 = rand::random();
        let mut conn = Connection::new(iss, RWND_MAX, options.cc_enabled, crypto);
        conn.state = ConnState::SynSent;
        conn.snd_nxt = iss.wrapping_add(1);
        conn.metrics.start = Some(Instant::now());

        let shared = Arc::new(Shared {
            socket,
            peer,
            state: Mutex::new(State {
                conn,
                outgoing: std::collections::VecDeque::new(),
                close_requested: false,
                fault: None,
                timer_deadline: None,
                probe_deadline: None,
                key_material,
            }),
            cv: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });

        {
            let mut state = shared.state.lock().unwrap();
            send_syn(&shared.socket, &state.conn, &state.key_material);
            state.timer_deadline = Some(Instant::now() + state.conn.rto());
        }

        let bg_shared = shared.clone();
        let handle = thread::spawn(move || sender_loop(bg_shared));

        let deadline = options.op_timeout.map(|d| Instant::now() + d);
        let established = wait_until(&shared, deadline, |s| {
            s.conn.state == ConnState::Established || s.fault.is_some()
        });

        if let Err(e) = established {
            shared.cancelled.store(true, Ordering::Relaxed);
            shared.cv.notify_all();
            let _ = handle.join();
            return Err(e);
        }

        {
            let state = shared.state.lock().unwrap();
            if let Some(fault) = &state.fault {
                shared.cancelled.store(true, Ordering::Relaxed);
                shared.cv.notify_all();
                let _ = handle.join();
                return Err(fault.clone().into_error(peer));
            }
        }

        log::info!("rudp: connected to {peer}");
        Ok(Client {
            shared,
            handle: Some(handle),
            op_timeout: options.op_timeout,
        })
    }

    /// Enqueues `data` and blocks until every byte has been cumulatively
    /// acknowledged, or until the connection fails.
    pub fn send_bytes(&self, data: &[u8]) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(fault) = &state.fault {
                return Err(fault.clone().into_error(self.shared.peer));
            }
            state.outgoing.extend(data.iter().copied());
        }
        self.shared.cv.notify_all();

        let deadline = self.op_timeout.map(|d| Instant::now() + d);
        wait_until(&self.shared, deadline, |s| {
            s.outgoing.is_empty() && s.conn.in_flight.is_empty() && !s.conn.outstanding()
        })
    }

    /// Initiates FIN exchange — only once every previously submitted byte
    /// is acknowledged — and blocks until the peer ACKs the FIN.
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.close_requested = true;
        }
        self.shared.cv.notify_all();

        let deadline = self.op_timeout.map(|d| Instant::now() + d);
        wait_until(&self.shared, deadline, |s| s.conn.state == ConnState::Closed)
    }

    /// Cooperatively cancels any in-progress blocking call on this client.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
        self.shared.cv.notify_all();
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.state.lock().unwrap().conn.metrics.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Blocks on `shared.cv` until `predicate` holds, a fault is recorded, the
/// client is cancelled, or `deadline` passes — whichever comes first. A
/// deadline expiry and an explicit `cancel()` both surface as
/// `LocalCancelled`, matching the error-kind design in `SPEC_FULL.md` §7.
fn wait_until(
    shared: &Shared,
    deadline: Option<Instant>,
    predicate: impl Fn(&State) -> bool,
) -> Result<(), Error> {
    let mut state = shared.state.lock().unwrap();
    loop {
        if predicate(&state) {
            return Ok(());
        }
        if let Some(fault) = &state.fault {
            return Err(fault.clone().into_error(shared.peer));
        }
        if shared.cancelled.load(Ordering::Relaxed) {
            return Err(Error::LocalCancelled { peer: shared.peer });
        }
        if let Some(dl) = deadline {
            if Instant::now() >= dl {
                return Err(Error::LocalCancelled { peer: shared.peer });
            }
        }

        let wait_for = deadline
            .map(|dl| dl.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(100))
            .min(Duration::from_millis(100));

        let (guard, _timed_out) = shared.cv.wait_timeout(state, wait_for).unwrap();
        state = guard;
    }
}

fn sender_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; PAYLOAD_SIZE + 512];
    loop {
        {
            let mut state = shared.state.lock().unwrap();
            if state.conn.state == ConnState::Closed {
                break;
            }
            if shared.cancelled.load(Ordering::Relaxed) {
                state.conn.state = ConnState::Closed;
                shared.cv.notify_all();
                break;
            }
            tick(&mut state, &shared.socket);
            shared.cv.notify_all();
            if state.conn.state == ConnState::Closed {
                break;
            }
        }

        match shared.socket.recv(&mut buf) {
            Ok(n) => {
                let mut state = shared.state.lock().unwrap();
                on_segment(&mut state, &shared.socket, &buf[..n]);
                shared.cv.notify_all();
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => log::debug!("rudp: recv error: {e}"),
        }

        if shared.cancelled.load(Ordering::Relaxed) {
            shared.cv.notify_all();
        }
    }
    shared.cv.notify_all();
}

fn send_segment(socket: &UdpSocket, seg: &Segment) {
    if let Err(e) = socket.send(&seg.encode()) {
        log::debug!("rudp: send error: {e}");
    }
}

fn send_syn(socket: &UdpSocket, conn: &Connection, key_material: &[u8]) {
    let seg = Segment::syn(conn.snd_iss, RWND_MAX, key_material.to_vec());
    log::debug!("rudp: sending SYN iss={}", conn.snd_iss);
    send_segment(socket, &seg);
}

fn tick(state: &mut State, socket: &UdpSocket) {
    match state.conn.state {
        ConnState::SynSent => tick_handshake(state, socket),
        ConnState::Established => {
            if state.close_requested
                && state.outgoing.is_empty()
                && state.conn.in_flight.is_empty()
                && !state.conn.outstanding()
            {
                queue_fin(state, socket);
            }
            check_retransmit_timer(state, socket);
            check_zero_window_probe(state, socket);
            drive_send_loop(state, socket);
        }
        ConnState::FinSent => check_retransmit_timer(state, socket),
        _ => {}
    }
}

fn tick_handshake(state: &mut State, socket: &UdpSocket) {
    let Some(deadline) = state.timer_deadline else {
        return;
    };
    if Instant::now() < deadline {
        return;
    }

    let iss = state.conn.snd_iss;
    let attempt = {
        let counter = state.conn.retries.entry(iss).or_insert(0);
        *counter += 1;
        *counter
    };

    if attempt > MAX_RETRIES {
        state.fault = Some(Fault::HandshakeFailure { retries: attempt - 1 });
        state.conn.state = ConnState::Closed;
        return;
    }

    state.conn.rto_ms = (state.conn.rto_ms * 2).clamp(MIN_RTO_MS, MAX_RTO_MS);
    log::warn!("rudp: retransmitting SYN, attempt {attempt}");
    send_syn(socket, &state.conn, &state.key_material);
    state.timer_deadline = Some(Instant::now() + state.conn.rto());
}

/// Shared by `Established` and `FinSent`: the single retransmission timer
/// covers whatever segment sits at the head of the in-flight queue,
/// whether that is a DATA segment or the FIN.
fn check_retransmit_timer(state: &mut State, socket: &UdpSocket) {
    let Some(deadline) = state.timer_deadline else {
        return;
    };
    if Instant::now() < deadline {
        return;
    }

    let Some(front) = state.conn.in_flight.front().cloned() else {
        state.timer_deadline = None;
        return;
    };

    let attempt = {
        let counter = state.conn.retries.entry(front.seq).or_insert(0);
        *counter += 1;
        *counter
    };

    if attempt > MAX_RETRIES {
        state.fault = Some(if front.is_fin {
            Fault::ShutdownFailure { retries: attempt - 1 }
        } else {
            Fault::PeerUnreachable {
                seq: front.seq,
                retries: attempt - 1,
            }
        });
        state.conn.state = ConnState::Closed;
        return;
    }

    state.conn.metrics.retransmissions += 1;
    state.conn.metrics.timeouts += 1;
    state.conn.on_rto_collapse();
    log::warn!(
        "rudp: timeout on seq={}, attempt {attempt}, cwnd collapsed to {}",
        front.seq,
        state.conn.cwnd
    );

    retransmit_front(state, socket);
    state.timer_deadline = Some(Instant::now() + state.conn.rto());
}

fn retransmit_front(state: &mut State, socket: &UdpSocket) {
    let Some(front) = state.conn.in_flight.front_mut() else {
        return;
    };
    front.sent_at = Instant::now();
    front.retransmitted = true;
    let is_fin = front.is_fin;
    let seq = front.seq;
    let payload = front.payload.clone();

    let seg = if is_fin {
        Segment::fin(seq, state.conn.rcv_nxt, RWND_MAX)
    } else {
        let ciphertext = state.conn.crypto.seal(&payload);
        Segment::data(seq, state.conn.rcv_nxt, RWND_MAX, ciphertext)
    };
    send_segment(socket, &seg);
}

fn check_zero_window_probe(state: &mut State, socket: &UdpSocket) {
    if state.conn.peer_rwnd != 0 {
        state.probe_deadline = None;
        return;
    }

    let due = state.probe_deadline.map(|d| Instant::now() >= d).unwrap_or(true);
    if !due {
        return;
    }

    let ciphertext = state.conn.crypto.seal(&[]);
    let seg = Segment::data(state.conn.snd_una, state.conn.rcv_nxt, RWND_MAX, ciphertext);
    log::debug!("rudp: zero-window probe at seq={}", state.conn.snd_una);
    send_segment(socket, &seg);
    state.probe_deadline = Some(Instant::now() + state.conn.rto());
}

fn drive_send_loop(state: &mut State, socket: &UdpSocket) {
    loop {
        if state.outgoing.is_empty() {
            break;
        }
        let available = state.conn.space_available();
        if available == 0 {
            break;
        }

        let take = state.outgoing.len().min(PAYLOAD_SIZE);
        let chunk: Vec<u8> = state.outgoing.drain(..take).collect();
        let seq = state.conn.snd_nxt;

        let ciphertext = state.conn.crypto.seal(&chunk);
        let seg = Segment::data(seq, state.conn.rcv_nxt, RWND_MAX, ciphertext);
        send_segment(socket, &seg);
        log::debug!("rudp: sent DATA seq={seq} len={}", chunk.len());

        let was_idle = state.conn.in_flight.is_empty();
        state.conn.in_flight.push_back(InFlight {
            seq,
            payload: chunk,
            is_fin: false,
            sent_at: Instant::now(),
            retransmitted: false,
        });
        state.conn.snd_nxt = seq.wrapping_add(take as u32);

        if was_idle {
            state.timer_deadline = Some(Instant::now() + state.conn.rto());
        }
    }
}

fn queue_fin(state: &mut State, socket: &UdpSocket) {
    let seq = state.conn.snd_nxt;
    state.conn.in_flight.push_back(InFlight {
        seq,
        payload: Vec::new(),
        is_fin: true,
        sent_at: Instant::now(),
        retransmitted: false,
    });
    state.conn.snd_nxt = seq.wrapping_add(1);
    state.conn.state = ConnState::FinSent;

    let seg = Segment::fin(seq, state.conn.rcv_nxt, RWND_MAX);
    log::info!("rudp: sending FIN seq={seq}");
    send_segment(socket, &seg);
    state.timer_deadline = Some(Instant::now() + state.conn.rto());
}

fn on_segment(state: &mut State, socket: &UdpSocket, buf: &[u8]) {
    let Some(seg) = Segment::decode(buf) else {
        log::trace!("rudp: dropped invalid segment");
        return;
    };

    match state.conn.state {
        ConnState::SynSent => on_syn_ack(state, socket, &seg),
        ConnState::Established | ConnState::FinSent => on_ack_bearing(state, socket, &seg),
        _ => {}
    }
}

fn on_syn_ack(state: &mut State, socket: &UdpSocket, seg: &Segment) {
    if !(seg.flags.contains(Flags::SYN) && seg.flags.contains(Flags::ACK)) {
        return;
    }
    if seg.ack != state.conn.snd_nxt {
        return;
    }

    state.conn.rcv_nxt = seg.seq.wrapping_add(1);
    state.conn.snd_una = seg.ack;
    state.conn.peer_rwnd = seg.rwnd;
    state.conn.state = ConnState::Established;
    state.conn.retries.remove(&state.conn.snd_iss);
    state.timer_deadline = None;

    let ack = Segment::ack(state.conn.snd_nxt, state.conn.rcv_nxt, RWND_MAX);
    send_segment(socket, &ack);
    log::info!("rudp: handshake established, rcv_nxt={}", state.conn.rcv_nxt);
}

fn on_ack_bearing(state: &mut State, socket: &UdpSocket, seg: &Segment) {
    if !seg.flags.contains(Flags::ACK) {
        return;
    }

    state.conn.peer_rwnd = seg.rwnd;
    if !state.conn.cc_enabled {
        state.conn.cwnd = seg.rwnd as f64;
    }

    match state.conn.on_ack(seg.ack) {
        AckOutcome::Advanced { rtt_sample_ms } => {
            if let Some(sample) = rtt_sample_ms {
                state.conn.update_rtt(sample);
            }
            if state.conn.in_flight.is_empty() {
                state.timer_deadline = None;
                if state.conn.state == ConnState::FinSent {
                    log::info!("rudp: FIN acknowledged, connection closed");
                    state.conn.state = ConnState::Closed;
                }
            } else {
                state.timer_deadline = Some(Instant::now() + state.conn.rto());
            }
        }
        AckOutcome::FastRetransmit => {
            log::warn!("rudp: triple duplicate ACK, fast retransmit");
            state.conn.metrics.retransmissions += 1;
            retransmit_front(state, socket);
            state.timer_deadline = Some(Instant::now() + state.conn.rto());
        }
        AckOutcome::Duplicate | AckOutcome::Stale => {}
    }
}
