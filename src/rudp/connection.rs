//! Per-connection state: sequence counters, windows, the RTT estimator,
//! retry bookkeeping, and metrics. Both the sender and receiver engines
//! mutate the same `Connection` under one lock — there is deliberately no
//! back-reference between a sender object and a receiver object, since
//! both need a consistent view of the same windows and timers.

use std::cmp;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::crypto::CryptoEnvelope;
use super::{seq_leq, seq_lt, DUP_ACK_THRESHOLD, INITIAL_CWND, INITIAL_RTO_MS, INITIAL_SSTHRESH,
    MAX_RTO_MS, MIN_RTO_MS, PAYLOAD_SIZE};

/// RUDP collapses TCP's ten-state handshake/close machine down to the six
/// states the protocol actually exercises: simultaneous close and a
/// lingering TIME-WAIT quiet period are not modeled, since RUDP always
/// closes sender-initiated and a receiver never needs to outlive its FIN
/// ACK by more than a short drain interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    FinSent,
    CloseWait,
}

/// A segment the sender has transmitted but not yet seen fully
/// acknowledged. `seq` counts bytes for DATA segments and the single
/// handshake "slot" for SYN/FIN, mirroring TCP.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub seq: u32,
    pub payload: Vec<u8>,
    pub is_fin: bool,
    pub sent_at: Instant,
    pub retransmitted: bool,
}

impl InFlight {
    fn end(&self) -> u32 {
        let len = if self.is_fin {
            1
        } else {
            self.payload.len() as u32
        };
        self.seq.wrapping_add(len).wrapping_sub(1)
    }
}

/// Counters returned to the application alongside a delivered stream.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub bytes_delivered: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub duplicate_acks: u64,
    pub start: Option<Instant>,
}

impl Metrics {
    pub fn elapsed(&self) -> Duration {
        self.start.map(|s| s.elapsed()).unwrap_or_default()
    }
}

pub(crate) struct Connection {
    pub state: ConnState,

    // --- sender side ---
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_iss: u32,
    pub cwnd: f64,
    pub ssthresh: f64,
    pub cc_enabled: bool,
    pub peer_rwnd: u16,
    pub dup_ack_count: u32,
    pub in_flight: VecDeque<InFlight>,
    pub(crate) retries: HashMap<u32, u32>,

    // --- RTT / RTO ---
    pub srtt_ms: Option<f64>,
    pub rttvar_ms: f64,
    pub rto_ms: u64,

    // --- receiver side ---
    pub rcv_nxt: u32,
    pub rwnd_max: u16,
    pub reorder_buffer: BTreeMap<u32, Vec<u8>>,

    pub crypto: CryptoEnvelope,
    pub metrics: Metrics,
}

impl Connection {
    pub fn new(iss: u32, rwnd_max: u16, cc_enabled: bool, crypto: CryptoEnvelope) -> Connection {
        Connection {
            state: ConnState::Closed,
            snd_una: iss,
            snd_nxt: iss,
            snd_iss: iss,
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            cc_enabled,
            peer_rwnd: 0,
            dup_ack_count: 0,
            in_flight: VecDeque::new(),
            retries: HashMap::new(),
            srtt_ms: None,
            rttvar_ms: 0.0,
            rto_ms: INITIAL_RTO_MS,
            rcv_nxt: 0,
            rwnd_max,
            reorder_buffer: BTreeMap::new(),
            crypto,
            metrics: Metrics::default(),
        }
    }

    /// Segments allowed in flight right now: `min(cwnd, peer_rwnd)` minus
    /// what is already outstanding. `cwnd`, `ssthresh`, and `peer_rwnd` are
    /// all denominated in segments, not bytes, so "outstanding" here counts
    /// unacknowledged segments rather than the byte distance between
    /// `snd_una` and `snd_nxt`. When congestion control is disabled `cwnd`
    /// is pinned to `peer_rwnd`, so only flow control bounds transmission —
    /// the toggle can never bypass `peer_rwnd`.
    pub fn space_available(&self) -> usize {
        let outstanding = self.in_flight.len();
        let window = cmp::min(self.cwnd as usize, self.peer_rwnd as usize);
        window.saturating_sub(outstanding)
    }

    pub fn rwnd(&self) -> u16 {
        self.rwnd_max - self.reorder_buffer.len() as u16
    }

    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// Smoothed-RTT recursion (srtt/rttvar/rto), applied only to samples
    /// from segments that were never retransmitted (Karn's algorithm) —
    /// the caller is responsible for only calling this when that holds.
    pub fn update_rtt(&mut self, sample_ms: f64) {
        match self.srtt_ms {
            None => {
                self.srtt_ms = Some(sample_ms);
                self.rttvar_ms = sample_ms / 2.0;
            }
            Some(srtt) => {
                self.rttvar_ms = 0.75 * self.rttvar_ms + 0.25 * (srtt - sample_ms).abs();
                self.srtt_ms = Some(0.875 * srtt + 0.125 * sample_ms);
            }
        }

        let rto = self.srtt_ms.unwrap() + 4.0 * self.rttvar_ms;
        self.rto_ms = (rto as u64).clamp(MIN_RTO_MS, MAX_RTO_MS);
    }

    /// Reno congestion-window growth on a new cumulative ACK: +1 segment
    /// per ACK in slow start, +1 segment per RTT (approximated as
    /// `1/floor(cwnd)` per ACK) in congestion avoidance.
    fn grow_congestion_window(&mut self) {
        if !self.cc_enabled {
            return;
        }
        if self.is_slow_start() {
            self.cwnd += 1.0;
        } else {
            self.cwnd += 1.0 / self.cwnd.floor().max(1.0);
        }
    }

    /// Triple duplicate-ACK fast retransmit: halve the window into
    /// `ssthresh`, collapse `cwnd` to match, and hand the caller the
    /// segment at `snd_una` to resend immediately.
    fn enter_fast_recovery(&mut self) {
        if !self.cc_enabled {
            return;
        }
        self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
        self.cwnd = self.ssthresh;
    }

    /// RTO expiry: halve into `ssthresh`, collapse `cwnd` to 1 segment,
    /// and restart slow start.
    pub fn on_rto_collapse(&mut self) {
        if self.cc_enabled {
            self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
            self.cwnd = 1.0;
        }
        self.rto_ms = (self.rto_ms * 2).clamp(MIN_RTO_MS, MAX_RTO_MS);
    }

    /// Process an incoming cumulative ACK. Returns `true` if it advanced
    /// `snd_una` (new data acknowledged, so the caller should sample RTT
    /// and drive congestion control), or `false` if it was a duplicate.
    pub fn on_ack(&mut self, ack: u32) -> AckOutcome {
        if seq_lt(ack, self.snd_una) {
            return AckOutcome::Stale;
        }

        if ack == self.snd_una {
            if self.snd_una == self.snd_nxt {
                // Nothing outstanding; a repeated ACK of the whole stream
                // is not meaningful as a duplicate-ACK signal.
                return AckOutcome::Stale;
            }
            self.dup_ack_count += 1;
            self.metrics.duplicate_acks += 1;
            if self.dup_ack_count == DUP_ACK_THRESHOLD {
                self.enter_fast_recovery();
                return AckOutcome::FastRetransmit;
            }
            return AckOutcome::Duplicate;
        }

        // New data acknowledged.
        self.dup_ack_count = 0;
        self.snd_una = ack;

        let mut rtt_sample_ms = None;
        while let Some(front) = self.in_flight.front() {
            if seq_leq(front.end().wrapping_add(1), ack) {
                let seg = self.in_flight.pop_front().unwrap();
                self.retries.remove(&seg.seq);
                if !seg.is_fin {
                    self.metrics.bytes_delivered += seg.payload.len() as u64;
                }
                if !seg.retransmitted && rtt_sample_ms.is_none() {
                    rtt_sample_ms = Some(seg.sent_at.elapsed().as_secs_f64() * 1000.0);
                }
            } else {
                break;
            }
        }

        self.grow_congestion_window();

        AckOutcome::Advanced { rtt_sample_ms }
    }

    pub fn outstanding(&self) -> bool {
        self.snd_una != self.snd_nxt
    }
}

/// Result of feeding one incoming ACK through `Connection::on_ack`.
pub(crate) enum AckOutcome {
    /// `ack <= snd_una` with nothing new: ignored.
    Stale,
    /// A duplicate ACK below the fast-retransmit threshold.
    Duplicate,
    /// The third duplicate ACK: caller must retransmit `snd_una` now.
    FastRetransmit,
    /// `snd_una` advanced; `rtt_sample_ms` is set when Karn's algorithm
    /// allows sampling (the freed segment was never retransmitted).
    Advanced { rtt_sample_ms: Option<f64> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rudp::crypto::CryptoEnvelope;

    fn fresh() -> Connection {
        Connection::new(1000, 64, true, CryptoEnvelope::Disabled)
    }

    #[test]
    fn rtt_first_sample_sets_srtt_and_half_rttvar() {
        let mut c = fresh();
        c.update_rtt(100.0);
        assert_eq!(c.srtt_ms, Some(100.0));
        assert_eq!(c.rttvar_ms, 50.0);
        assert_eq!(c.rto_ms, 300); // 100 + 4*50
    }

    #[test]
    fn rto_is_clamped_to_bounds() {
        let mut c = fresh();
        c.update_rtt(1.0);
        assert!(c.rto_ms >= MIN_RTO_MS);
    }

    #[test]
    fn slow_start_grows_by_one_segment_per_ack() {
        let mut c = fresh();
        c.snd_nxt = c.snd_una.wrapping_add(PAYLOAD_SIZE as u32 * 4);
        c.peer_rwnd = 64;
        c.in_flight.push_back(InFlight {
            seq: c.snd_una,
            payload: vec![0u8; PAYLOAD_SIZE],
            is_fin: false,
            sent_at: Instant::now(),
            retransmitted: false,
        });
        let before = c.cwnd;
        let ack = c.snd_una.wrapping_add(PAYLOAD_SIZE as u32);
        match c.on_ack(ack) {
            AckOutcome::Advanced { .. } => {}
            _ => panic!("expected advance"),
        }
        assert_eq!(c.cwnd, before + 1.0);
    }

    #[test]
    fn congestion_avoidance_grows_by_fraction() {
        let mut c = fresh();
        c.cwnd = 10.0;
        c.ssthresh = 10.0;
        c.snd_nxt = c.snd_una.wrapping_add(10);
        c.peer_rwnd = 64;
        c.in_flight.push_back(InFlight {
            seq: c.snd_una,
            payload: vec![0u8; 10],
            is_fin: false,
            sent_at: Instant::now(),
            retransmitted: false,
        });
        c.on_ack(c.snd_una.wrapping_add(10));
        assert!((c.cwnd - 10.1).abs() < 1e-9);
    }

    #[test]
    fn third_duplicate_ack_triggers_fast_retransmit() {
        let mut c = fresh();
        c.cwnd = 20.0;
        c.ssthresh = 64.0;
        c.snd_nxt = c.snd_una.wrapping_add(10);
        let ack = c.snd_una;
        assert!(matches!(c.on_ack(ack), AckOutcome::Duplicate));
        assert!(matches!(c.on_ack(ack), AckOutcome::Duplicate));
        assert!(matches!(c.on_ack(ack), AckOutcome::FastRetransmit));
        assert_eq!(c.ssthresh, 10.0);
        assert_eq!(c.cwnd, 10.0);
    }

    #[test]
    fn timeout_collapses_cwnd_to_one_and_halves_ssthresh() {
        let mut c = fresh();
        c.cwnd = 16.0;
        c.on_rto_collapse();
        assert_eq!(c.cwnd, 1.0);
        assert_eq!(c.ssthresh, 8.0);
    }

    #[test]
    fn ssthresh_and_cwnd_never_fall_below_floor() {
        let mut c = fresh();
        c.cwnd = 2.0;
        c.on_rto_collapse();
        assert!(c.ssthresh >= 2.0);
        assert!(c.cwnd >= 1.0);
    }

    #[test]
    fn stale_ack_below_una_is_ignored() {
        let mut c = fresh();
        c.snd_una = 100;
        c.snd_nxt = 200;
        assert!(matches!(c.on_ack(50), AckOutcome::Stale));
        assert_eq!(c.snd_una, 100);
    }

    #[test]
    fn repeated_full_ack_with_nothing_outstanding_is_not_a_duplicate_signal() {
        let mut c = fresh();
        c.snd_una = 100;
        c.snd_nxt = 100;
        assert!(matches!(c.on_ack(100), AckOutcome::Stale));
        assert_eq!(c.dup_ack_count, 0);
    }

    #[test]
    fn cc_disabled_pins_cwnd_to_peer_rwnd_via_space_available() {
        let mut c = fresh();
        c.cc_enabled = false;
        c.cwnd = c.peer_rwnd as f64; // caller's responsibility per sender engine
        c.peer_rwnd = 4;
        c.cwnd = 4.0;
        c.snd_nxt = c.snd_una;
        assert_eq!(c.space_available(), 4);
    }
}
