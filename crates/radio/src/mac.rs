//! CSMA-CA MAC: channel access, acknowledgements and retransmission for one
//! outgoing frame at a time, plus address filtering and duplicate rejection
//! on receive.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Duration, Instant};
use wpan_core::{PanId, BROADCAST_PAN};

use crate::csma::{ClearChannelAssessment, CsmaCa, MAX_BE};
use crate::framing::PhyFrame;
use crate::mac_frame::{FrameType, MacAddress, MacFrame};
use crate::neighbor::NeighborTable;
use crate::RadioError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacConfig {
    pub pan_id: PanId,
    pub address: MacAddress,
    pub min_be: u8,
    pub max_be: u8,
    pub max_csma_backoffs: u8,
    /// Total transmissions of a frame before delivery is reported failed.
    pub retry_limit: u8,
    pub ack_timeout: Duration,
    pub unit_backoff: Duration,
    /// First DSN; random when unset.
    pub initial_sequence: Option<u8>,
    pub neighbor_capacity: usize,
    pub dedup_window: usize,
    pub neighbor_timeout: Duration,
    /// Accept frames regardless of destination address and PAN.
    pub promiscuous: bool,
}

/// Upper bound for every MAC timer, keeping deadline arithmetic in range.
const MAX_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

impl MacConfig {
    pub fn validate(&self) -> Result<(), RadioError> {
        let invalid = |reason: String| Err(RadioError::InvalidConfig(reason));
        if self.min_be > self.max_be || self.max_be > MAX_BE {
            return invalid(format!(
                "backoff exponents {}..={} must be ordered and at most {}",
                self.min_be, self.max_be, MAX_BE
            ));
        }
        if self.retry_limit == 0 {
            return invalid("retry_limit must allow at least one transmission".into());
        }
        if self.ack_timeout.is_zero() || self.ack_timeout > MAX_TIMER {
            return invalid(format!("ack_timeout {:?} out of range", self.ack_timeout));
        }
        if self.unit_backoff > MAX_TIMER || self.neighbor_timeout > MAX_TIMER {
            return invalid("unit_backoff and neighbor_timeout must be at most one day".into());
        }
        if self.neighbor_capacity == 0 {
            return invalid("neighbor_capacity must be non-zero".into());
        }
        if self.address.is_none() || self.address.is_broadcast() {
            return invalid(format!("{} is not a usable MAC address", self.address));
        }
        Ok(())
    }
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            pan_id: 0x1234,
            address: MacAddress::Short(0x0001),
            min_be: 3,
            max_be: 5,
            max_csma_backoffs: 4,
            retry_limit: 3,
            ack_timeout: Duration::from_millis(50),
            unit_backoff: Duration::from_micros(320),
            initial_sequence: None,
            neighbor_capacity: 32,
            dedup_window: 8,
            neighbor_timeout: Duration::from_secs(60),
            promiscuous: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReport {
    pub sequence: u8,
    pub attempts: u8,
    pub acked: bool,
}

pub type TxResult = Result<TxReport, RadioError>;

pub struct MacRequest {
    pub dst: MacAddress,
    pub payload: Bytes,
    pub ack_request: bool,
    pub reply: Option<oneshot::Sender<TxResult>>,
}

impl MacRequest {
    pub fn new(dst: MacAddress, payload: Bytes, ack_request: bool) -> (Self, oneshot::Receiver<TxResult>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            dst,
            payload,
            ack_request,
            reply: Some(tx),
        };
        (request, rx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    BackoffWait,
    Transmitting,
    AwaitingAck,
    Acked,
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MacStats {
    pub frames_queued: u64,
    pub transmissions: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    pub acks_sent: u64,
    pub stray_acks: u64,
    pub delivered_up: u64,
    pub duplicates: u64,
    pub filtered: u64,
    pub malformed: u64,
    pub upstream_dropped: u64,
    pub delivery_failures: u64,
    pub channel_access_failures: u64,
    pub neighbors_evicted: u64,
}

struct Outgoing {
    frame: MacFrame,
    encoded: Bytes,
    csma: CsmaCa,
    state: TxState,
    attempts: u8,
    deadline: Option<Instant>,
    reply: Option<oneshot::Sender<TxResult>>,
}

pub struct MacLayer {
    config: MacConfig,
    phy_mtu: usize,
    cca: Arc<dyn ClearChannelAssessment>,
    phy_tx: mpsc::Sender<Bytes>,
    up: mpsc::Sender<MacFrame>,
    stats: watch::Sender<MacStats>,
    counters: MacStats,
    neighbors: NeighborTable,
    sequence: u8,
    rng: StdRng,
    current: Option<Outgoing>,
}

impl MacLayer {
    /// `phy_tx` carries MPDUs without FCS; the PHY appends it.
    pub fn new(
        config: MacConfig,
        phy_mtu: usize,
        cca: Arc<dyn ClearChannelAssessment>,
        phy_tx: mpsc::Sender<Bytes>,
        up: mpsc::Sender<MacFrame>,
    ) -> Result<(Self, watch::Receiver<MacStats>), RadioError> {
        config.validate()?;
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let sequence = config.initial_sequence.unwrap_or_else(|| rng.random());
        let neighbors = NeighborTable::new(
            config.neighbor_capacity,
            config.dedup_window,
            config.neighbor_timeout,
        );
        let (stats, stats_rx) = watch::channel(MacStats::default());
        info!("MAC {} on PAN {:#06x}, first DSN {}", config.address, config.pan_id, sequence);

        let mac = Self {
            config,
            phy_mtu,
            cca,
            phy_tx,
            up,
            stats,
            counters: MacStats::default(),
            neighbors,
            sequence,
            rng,
            current: None,
        };
        Ok((mac, stats_rx))
    }

    /// Room left for upper-layer payload in a data frame to `dst`.
    pub fn payload_mtu(&self, dst: MacAddress) -> usize {
        let header = MacFrame::data(0, self.config.pan_id, self.config.address, dst, Bytes::new(), false)
            .header_len();
        self.phy_mtu.saturating_sub(header)
    }

    pub async fn run(
        mut self,
        mut phy_rx: mpsc::Receiver<PhyFrame>,
        mut requests: mpsc::Receiver<MacRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("MAC task started");
        loop {
            let deadline = self.current.as_ref().and_then(|out| out.deadline);
            // A new request is only taken once the previous frame has finished.
            let idle = self.current.is_none();

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(frame) = phy_rx.recv() => self.on_phy_frame(frame).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timer().await
                }
                Some(request) = requests.recv(), if idle => self.start(request).await,
                else => break,
            }
            self.stats.send_replace(self.counters);
        }

        if let Some(mut out) = self.current.take() {
            if let Some(reply) = out.reply.take() {
                let _ = reply.send(Err(RadioError::Shutdown));
            }
        }
        info!("MAC task stopped");
    }

    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence;
        self.sequence = sequence.wrapping_add(1);
        sequence
    }

    async fn start(&mut self, request: MacRequest) {
        let MacRequest {
            dst,
            payload,
            ack_request,
            mut reply,
        } = request;

        let mtu = self.payload_mtu(dst);
        if payload.len() > mtu {
            if let Some(reply) = reply.take() {
                let _ = reply.send(Err(RadioError::PacketTooLarge {
                    size: payload.len(),
                    mtu,
                }));
            }
            return;
        }

        let sequence = self.next_sequence();
        let ack_request = ack_request && !dst.is_broadcast();
        let frame = MacFrame::data(sequence, self.config.pan_id, self.config.address, dst, payload, ack_request);
        let encoded = Bytes::from(frame.encode());
        self.counters.frames_queued += 1;
        trace!("MAC queued DSN {} to {} ({} bytes)", sequence, dst, encoded.len());

        let out = Outgoing {
            frame,
            encoded,
            csma: CsmaCa::new(self.config.min_be, self.config.max_be, self.config.max_csma_backoffs),
            state: TxState::Idle,
            attempts: 0,
            deadline: None,
            reply,
        };
        self.access_channel(out).await;
    }

    /// Idle: sense the channel, then transmit or back off.
    async fn access_channel(&mut self, mut out: Outgoing) {
        if self.cca.is_clear() {
            self.transmit(out).await;
        } else if out.csma.on_busy() {
            let wait = out.csma.backoff(&mut self.rng, self.config.unit_backoff);
            trace!(
                "MAC channel busy, DSN {} backing off {:?} (stage {})",
                out.frame.sequence,
                wait,
                out.csma.stage()
            );
            out.state = TxState::BackoffWait;
            out.deadline = Some(Instant::now() + wait);
            self.current = Some(out);
        } else {
            self.counters.channel_access_failures += 1;
            let sequence = out.frame.sequence;
            warn!("MAC channel access failure for DSN {}", sequence);
            self.finish(out, Err(RadioError::ChannelAccessFailure { sequence }));
        }
    }

    async fn transmit(&mut self, mut out: Outgoing) {
        out.state = TxState::Transmitting;
        out.attempts += 1;
        self.counters.transmissions += 1;
        if out.attempts > 1 {
            self.counters.retransmissions += 1;
        }

        if self.phy_tx.send(out.encoded.clone()).await.is_err() {
            self.finish(out, Err(RadioError::Shutdown));
            return;
        }
        trace!("MAC sent DSN {} (attempt {})", out.frame.sequence, out.attempts);

        if out.frame.ack_request {
            self.neighbors.set_pending_ack(out.frame.dst, true, Instant::now());
            out.state = TxState::AwaitingAck;
            out.deadline = Some(Instant::now() + self.config.ack_timeout);
            self.current = Some(out);
        } else {
            let report = TxReport {
                sequence: out.frame.sequence,
                attempts: out.attempts,
                acked: false,
            };
            self.finish(out, Ok(report));
        }
    }

    async fn on_timer(&mut self) {
        let Some(mut out) = self.current.take() else {
            return;
        };
        out.deadline = None;

        match out.state {
            TxState::BackoffWait => {
                out.state = TxState::Idle;
                self.access_channel(out).await;
            }
            TxState::AwaitingAck if out.attempts >= self.config.retry_limit => {
                self.counters.delivery_failures += 1;
                let (sequence, attempts) = (out.frame.sequence, out.attempts);
                warn!("MAC DSN {} not acknowledged after {} attempts", sequence, attempts);
                self.finish(out, Err(RadioError::DeliveryFailed { sequence, attempts }));
            }
            TxState::AwaitingAck => {
                debug!("MAC ACK timeout for DSN {}, retrying", out.frame.sequence);
                out.csma.reset();
                let wait = out.csma.backoff(&mut self.rng, self.config.unit_backoff);
                out.state = TxState::BackoffWait;
                out.deadline = Some(Instant::now() + wait);
                self.current = Some(out);
            }
            _ => self.current = Some(out),
        }
    }

    fn finish(&mut self, mut out: Outgoing, result: TxResult) {
        out.state = if result.is_ok() { TxState::Acked } else { TxState::Failed };
        if out.frame.ack_request {
            self.neighbors.set_pending_ack(out.frame.dst, false, Instant::now());
        }
        trace!("MAC DSN {} finished in state {:?}", out.frame.sequence, out.state);
        if let Some(reply) = out.reply.take() {
            let _ = reply.send(result);
        }
        self.current = None;
    }

    async fn on_phy_frame(&mut self, phy: PhyFrame) {
        let frame = match MacFrame::from_phy(&phy) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.malformed += 1;
                debug!("MAC dropping malformed frame: {}", e);
                return;
            }
        };

        match frame.frame_type {
            FrameType::Ack => self.on_ack(frame.sequence),
            FrameType::Data => self.on_data(frame, &phy).await,
            other => {
                self.counters.filtered += 1;
                trace!("MAC ignoring {:?} frame", other);
            }
        }
    }

    fn on_ack(&mut self, sequence: u8) {
        let matches = self
            .current
            .as_ref()
            .is_some_and(|out| out.state == TxState::AwaitingAck && out.frame.sequence == sequence);
        if !matches {
            self.counters.stray_acks += 1;
            trace!("MAC stray ACK for DSN {}", sequence);
            return;
        }

        if let Some(out) = self.current.take() {
            self.counters.acks_received += 1;
            let report = TxReport {
                sequence,
                attempts: out.attempts,
                acked: true,
            };
            self.finish(out, Ok(report));
        }
    }

    fn accepts(&self, frame: &MacFrame) -> bool {
        if self.config.promiscuous {
            return true;
        }
        if frame.src == self.config.address {
            return false;
        }
        let pan_ok = matches!(frame.dst_pan, Some(pan) if pan == self.config.pan_id || pan == BROADCAST_PAN);
        let dst_ok = frame.dst == self.config.address || frame.dst.is_broadcast();
        pan_ok && dst_ok
    }

    async fn on_data(&mut self, frame: MacFrame, phy: &PhyFrame) {
        if !self.accepts(&frame) {
            self.counters.filtered += 1;
            trace!("MAC filtered frame for {} on PAN {:?}", frame.dst, frame.dst_pan);
            return;
        }

        let now = Instant::now();
        let evicted = self.neighbors.evict_inactive(now);
        self.counters.neighbors_evicted += evicted as u64;
        let fresh = self
            .neighbors
            .observe(frame.src, frame.sequence, phy.lqi, phy.rssi_db, now);

        // Duplicates are acknowledged again: the sender missed our last ACK.
        if frame.ack_request && !frame.dst.is_broadcast() {
            let ack = Bytes::from(MacFrame::ack(frame.sequence).encode());
            if self.phy_tx.send(ack).await.is_ok() {
                self.counters.acks_sent += 1;
            }
        }

        if !fresh {
            self.counters.duplicates += 1;
            debug!("MAC duplicate DSN {} from {}", frame.sequence, frame.src);
            return;
        }

        match self.up.try_send(frame) {
            Ok(()) => self.counters.delivered_up += 1,
            Err(TrySendError::Full(frame)) => {
                self.counters.upstream_dropped += 1;
                warn!("MAC upstream queue full, dropping DSN {}", frame.sequence);
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.upstream_dropped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wpan_core::CrcKind;

    struct FixedCca(bool);

    impl ClearChannelAssessment for FixedCca {
        fn is_clear(&self) -> bool {
            self.0
        }
    }

    struct Harness {
        requests: mpsc::Sender<MacRequest>,
        phy_rx: mpsc::Sender<PhyFrame>,
        phy_tx: mpsc::Receiver<Bytes>,
        up: mpsc::Receiver<MacFrame>,
        stats: watch::Receiver<MacStats>,
        _shutdown: watch::Sender<bool>,
    }

    fn config() -> MacConfig {
        MacConfig {
            address: MacAddress::Short(1),
            initial_sequence: Some(5),
            ..Default::default()
        }
    }

    fn spawn(config: MacConfig, clear: bool) -> Harness {
        let (phy_tx, phy_tx_rx) = mpsc::channel(16);
        let (up_tx, up) = mpsc::channel(16);
        let (requests, requests_rx) = mpsc::channel(4);
        let (phy_rx_tx, phy_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let (mac, stats) = MacLayer::new(config, 125, Arc::new(FixedCca(clear)), phy_tx, up_tx).unwrap();
        tokio::spawn(mac.run(phy_rx, requests_rx, shutdown));

        Harness {
            requests,
            phy_rx: phy_rx_tx,
            phy_tx: phy_tx_rx,
            up,
            stats,
            _shutdown: shutdown_tx,
        }
    }

    fn on_air(frame: &MacFrame) -> PhyFrame {
        PhyFrame::from_payload(Bytes::from(frame.encode()), CrcKind::Crc16)
    }

    fn parse(mpdu: Bytes) -> MacFrame {
        MacFrame::decode(mpdu, 0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_exhausts_retries() {
        let mut h = spawn(config(), true);
        let (request, reply) = MacRequest::new(MacAddress::Short(2), Bytes::from_static(b"ping"), true);
        h.requests.send(request).await.unwrap();

        let result = reply.await.unwrap();
        assert!(matches!(
            result,
            Err(RadioError::DeliveryFailed { sequence: 5, attempts: 3 })
        ));

        let mut sent = Vec::new();
        while let Ok(mpdu) = h.phy_tx.try_recv() {
            sent.push(parse(mpdu));
        }
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|f| f.sequence == 5 && f.ack_request));

        let stats = *h.stats.wait_for(|s| s.delivery_failures == 1).await.unwrap();
        assert_eq!(stats.retransmissions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_completes_delivery() {
        let mut h = spawn(config(), true);
        let (request, reply) = MacRequest::new(MacAddress::Short(2), Bytes::from_static(b"ping"), true);
        h.requests.send(request).await.unwrap();

        let sent = parse(h.phy_tx.recv().await.unwrap());
        assert_eq!(sent.sequence, 5);
        h.phy_rx.send(on_air(&MacFrame::ack(5))).await.unwrap();

        let report = reply.await.unwrap().unwrap();
        assert_eq!(report, TxReport { sequence: 5, attempts: 1, acked: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_channel_fails_access() {
        let mut h = spawn(config(), false);
        let (request, reply) = MacRequest::new(MacAddress::Short(2), Bytes::from_static(b"x"), true);
        h.requests.send(request).await.unwrap();

        let result = reply.await.unwrap();
        assert!(matches!(result, Err(RadioError::ChannelAccessFailure { sequence: 5 })));
        assert!(h.phy_tx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_increase() {
        let mut h = spawn(config(), true);
        for _ in 0..3 {
            let (request, reply) = MacRequest::new(MacAddress::BROADCAST, Bytes::from_static(b"b"), true);
            h.requests.send(request).await.unwrap();
            let report = reply.await.unwrap().unwrap();
            assert!(!report.acked);
        }

        let sequences: Vec<u8> = (0..3).map(|_| parse(h.phy_tx.try_recv().unwrap()).sequence).collect();
        assert_eq!(sequences, vec![5, 6, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_rejected() {
        let h = spawn(config(), true);
        let (request, reply) = MacRequest::new(MacAddress::Short(2), Bytes::from(vec![0u8; 120]), false);
        h.requests.send(request).await.unwrap();
        assert!(matches!(
            reply.await.unwrap(),
            Err(RadioError::PacketTooLarge { size: 120, mtu: 116 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_acks_and_drops_duplicates() {
        let mut h = spawn(config(), true);
        let data = MacFrame::data(
            10,
            0x1234,
            MacAddress::Short(2),
            MacAddress::Short(1),
            Bytes::from_static(b"hello"),
            true,
        );

        h.phy_rx.send(on_air(&data)).await.unwrap();
        let ack = parse(h.phy_tx.recv().await.unwrap());
        assert_eq!((ack.frame_type, ack.sequence), (FrameType::Ack, 10));
        let delivered = h.up.recv().await.unwrap();
        assert_eq!(&delivered.payload[..], b"hello");

        h.phy_rx.send(on_air(&data)).await.unwrap();
        let ack = parse(h.phy_tx.recv().await.unwrap());
        assert_eq!(ack.sequence, 10);

        let stats = *h.stats.wait_for(|s| s.duplicates == 1).await.unwrap();
        assert_eq!(stats.delivered_up, 1);
        assert_eq!(stats.acks_sent, 2);
        assert!(h.up.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_filtering() {
        let mut h = spawn(config(), true);
        let other = MacFrame::data(1, 0x1234, MacAddress::Short(2), MacAddress::Short(9), Bytes::new(), false);
        let foreign_pan = MacFrame::data(2, 0x9999, MacAddress::Short(2), MacAddress::Short(1), Bytes::new(), false);
        let broadcast = MacFrame::data(
            3,
            0x1234,
            MacAddress::Short(2),
            MacAddress::BROADCAST,
            Bytes::from_static(b"all"),
            true,
        );

        for frame in [&other, &foreign_pan, &broadcast] {
            h.phy_rx.send(on_air(frame)).await.unwrap();
        }
        h.phy_rx
            .send(PhyFrame::from_payload(Bytes::from_static(&[0x41]), CrcKind::Crc16))
            .await
            .unwrap();

        let delivered = h.up.recv().await.unwrap();
        assert_eq!(delivered.sequence, 3);
        let stats = *h.stats.wait_for(|s| s.malformed == 1).await.unwrap();
        assert_eq!(stats.filtered, 2);
        // Broadcasts are never acknowledged.
        assert!(h.phy_tx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_ack_counted() {
        let mut h = spawn(config(), true);
        h.phy_rx.send(on_air(&MacFrame::ack(99))).await.unwrap();
        let stats = *h.stats.wait_for(|s| s.stray_acks == 1).await.unwrap();
        assert_eq!(stats.acks_received, 0);
    }

    #[test]
    fn test_invalid_config_rejected_before_running() {
        let bad = [
            MacConfig { min_be: 40, max_be: 40, ..config() },
            MacConfig { min_be: 6, max_be: 4, ..config() },
            MacConfig { retry_limit: 0, ..config() },
            MacConfig { ack_timeout: Duration::MAX, ..config() },
            MacConfig { ack_timeout: Duration::ZERO, ..config() },
            MacConfig { address: MacAddress::BROADCAST, ..config() },
        ];
        for cfg in bad {
            let (phy_tx, _phy_rx) = mpsc::channel(1);
            let (up_tx, _up_rx) = mpsc::channel(1);
            let result = MacLayer::new(cfg.clone(), 125, Arc::new(FixedCca(false)), phy_tx, up_tx);
            assert!(matches!(result, Err(RadioError::InvalidConfig(_))), "{cfg:?} accepted");
        }
        assert!(config().validate().is_ok());
        assert_eq!(CsmaCa::new(3, 40, 4).window(), 1 << 3);
    }
}
