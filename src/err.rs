use std::net::SocketAddr;

/// Errors surfaced to the application. Ordinary packet loss is never one of
/// these — it is absorbed by retry and congestion control. Only retry
/// exhaustion, caller cancellation, or peer-initiated close ever reach here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("no handshake reply from {peer} after {retries} SYN attempts")]
    HandshakeFailure { peer: SocketAddr, retries: u32 },

    #[error("segment {seq} to {peer} unacknowledged after {retries} retransmissions")]
    PeerUnreachable {
        peer: SocketAddr,
        seq: u32,
        retries: u32,
    },

    #[error("peer {peer} never acknowledged FIN after {retries} attempts")]
    ShutdownFailure { peer: SocketAddr, retries: u32 },

    #[error("operation on connection to {peer} cancelled or timed out")]
    LocalCancelled { peer: SocketAddr },

    #[error("connection to {peer} was reset")]
    ConnectionReset { peer: SocketAddr },
}
