//! A reliable, ordered, flow- and congestion-controlled byte-stream
//! transport on top of UDP, with an in-band session key exchange and
//! per-segment AEAD.
//!
//! [`server`] binds a listener that accepts peers as they complete the
//! handshake; [`client`] dials one. Both return types that block the
//! calling thread for their I/O — a background thread per connection (or,
//! on the listener side, per bound socket) performs the actual timer and
//! socket work, the same split this crate's connection manager always
//! used.

mod err;
mod rudp;

pub use err::Error;
pub use rudp::{
    client, AcceptedStream, Client, ClientOptions, ConnState, CryptoError, Flags, Metrics,
    Segment, Server,
};

pub use rudp::{
    DUP_ACK_THRESHOLD, INITIAL_CWND, INITIAL_RTO_MS, INITIAL_SSTHRESH, MAX_RETRIES, MAX_RTO_MS,
    MIN_RTO_MS, PAYLOAD_SIZE, RWND_MAX,
};

/// Binds a listener on `bind_addr:port`. See [`Server::bind`].
pub fn server(bind_addr: &str, port: u16, drop_rate: f64) -> Result<Server, Error> {
    Server::bind(bind_addr, port, drop_rate)
}
