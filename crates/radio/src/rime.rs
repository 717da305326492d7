//! Rime: broadcast flooding and anycast passthrough above the MAC.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};

use crate::mac::{MacRequest, TxResult};
use crate::mac_frame::{MacAddress, MacFrame};
use crate::RadioError;

pub const RIME_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RimeAddress(pub [u8; 2]);

impl fmt::Display for RimeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0[0], self.0[1])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RimeMode {
    /// Flooded to every neighbor, bounded by the hop count.
    Broadcast,
    /// Acknowledged unicast to the configured next hop.
    Anycast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RimePacket {
    pub channel: u16,
    pub origin: RimeAddress,
    pub packet_id: u16,
    pub hops: u8,
    pub payload: Bytes,
}

impl RimePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RIME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.channel.to_le_bytes());
        buf.extend_from_slice(&self.origin.0);
        buf.extend_from_slice(&self.packet_id.to_le_bytes());
        buf.push(self.hops);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(data: Bytes) -> Result<Self, RadioError> {
        if data.len() < RIME_HEADER_LEN {
            return Err(RadioError::InvalidFrame("truncated rime header"));
        }
        Ok(Self {
            channel: u16::from_le_bytes([data[0], data[1]]),
            origin: RimeAddress([data[2], data[3]]),
            packet_id: u16::from_le_bytes([data[4], data[5]]),
            hops: data[6],
            payload: data.slice(RIME_HEADER_LEN..),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RimeConfig {
    pub address: RimeAddress,
    pub broadcast_channel: u16,
    pub unicast_channel: u16,
    /// Hop count stamped on packets this node originates.
    pub max_hops: u8,
    /// MAC neighbour that receives anycast packets; anycast is refused
    /// without one.
    pub next_hop: Option<MacAddress>,
    pub seen_capacity: usize,
    pub seen_ttl: Duration,
}

impl RimeConfig {
    pub fn validate(&self) -> Result<(), RadioError> {
        if let Some(hop) = self.next_hop {
            if hop.is_none() || hop.is_broadcast() {
                return Err(RadioError::InvalidConfig(format!("{hop} cannot be an anycast next hop")));
            }
        }
        if self.max_hops == 0 || self.seen_capacity == 0 {
            return Err(RadioError::InvalidConfig("max_hops and seen_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for RimeConfig {
    fn default() -> Self {
        Self {
            address: RimeAddress([23, 42]),
            broadcast_channel: 129,
            unicast_channel: 131,
            max_hops: 1,
            next_hop: None,
            seen_capacity: 64,
            seen_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RimeDelivery {
    pub mode: RimeMode,
    pub origin: RimeAddress,
    pub hops: u8,
    pub payload: Bytes,
}

/// A MAC transmission requested by the rime layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RimeOutbound {
    pub dst: MacAddress,
    pub ack_request: bool,
    pub payload: Bytes,
}

impl RimeOutbound {
    pub fn into_request(self, reply: Option<oneshot::Sender<TxResult>>) -> MacRequest {
        MacRequest {
            dst: self.dst,
            payload: self.payload,
            ack_request: self.ack_request,
            reply,
        }
    }
}

/// What to do with one packet received from the MAC.
#[derive(Debug, Default)]
pub struct RimeReceive {
    pub delivery: Option<RimeDelivery>,
    pub forward: Option<RimeOutbound>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RimeStats {
    pub sent: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub duplicates: u64,
    pub own_echoes: u64,
    pub malformed: u64,
    pub unknown_channel: u64,
    pub oversize_rejected: u64,
    pub dropped: u64,
}

/// Recently seen `(origin, packet id)` pairs, bounded in size and age.
#[derive(Debug)]
struct SeenCache {
    order: VecDeque<((RimeAddress, u16), Instant)>,
    keys: HashSet<(RimeAddress, u16)>,
    capacity: usize,
    ttl: Duration,
}

impl SeenCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns `false` if the key is already present.
    fn insert(&mut self, key: (RimeAddress, u16), now: Instant) -> bool {
        while let Some(&(old, at)) = self.order.front() {
            if now.saturating_duration_since(at) <= self.ttl {
                break;
            }
            self.order.pop_front();
            self.keys.remove(&old);
        }
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
        self.keys.insert(key);
        self.order.push_back((key, now));
        true
    }
}

pub struct RimeStack {
    config: RimeConfig,
    mac_mtu: usize,
    next_id: u16,
    seen: SeenCache,
    stats: RimeStats,
}

impl RimeStack {
    /// `mac_mtu` is the MAC payload room for a data frame.
    pub fn new(config: RimeConfig, mac_mtu: usize) -> Self {
        let seen = SeenCache::new(config.seen_capacity, config.seen_ttl);
        Self {
            config,
            mac_mtu,
            next_id: 0,
            seen,
            stats: RimeStats::default(),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mac_mtu.saturating_sub(RIME_HEADER_LEN)
    }

    pub fn stats(&self) -> RimeStats {
        self.stats
    }

    pub fn address(&self) -> RimeAddress {
        self.config.address
    }

    pub fn send_down(&mut self, payload: Bytes, mode: RimeMode, now: Instant) -> Result<RimeOutbound, RadioError> {
        let mtu = self.mtu();
        if payload.len() > mtu {
            self.stats.oversize_rejected += 1;
            return Err(RadioError::PacketTooLarge {
                size: payload.len(),
                mtu,
            });
        }

        let (channel, dst, ack_request) = match (mode, self.config.next_hop) {
            (RimeMode::Broadcast, _) => (self.config.broadcast_channel, MacAddress::BROADCAST, false),
            (RimeMode::Anycast, Some(hop)) => (self.config.unicast_channel, hop, true),
            (RimeMode::Anycast, None) => {
                return Err(RadioError::InvalidConfig("anycast requires a configured next hop".into()));
            }
        };

        let packet_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.seen.insert((self.config.address, packet_id), now);
        let packet = RimePacket {
            channel,
            origin: self.config.address,
            packet_id,
            hops: self.config.max_hops,
            payload,
        };
        self.stats.sent += 1;
        trace!("rime {:?} packet {} ({} bytes)", mode, packet_id, packet.payload.len());

        Ok(RimeOutbound {
            dst,
            ack_request,
            payload: Bytes::from(packet.encode()),
        })
    }

    /// Application data entering the stack from above goes out as broadcast.
    pub fn send_up(&mut self, payload: Bytes, now: Instant) -> Result<RimeOutbound, RadioError> {
        self.send_down(payload, RimeMode::Broadcast, now)
    }

    pub fn on_receive_from_mac(&mut self, frame: &MacFrame, now: Instant) -> RimeReceive {
        let packet = match RimePacket::decode(frame.payload.clone()) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.malformed += 1;
                return RimeReceive::default();
            }
        };

        let mode = if packet.channel == self.config.broadcast_channel {
            RimeMode::Broadcast
        } else if packet.channel == self.config.unicast_channel {
            RimeMode::Anycast
        } else {
            self.stats.unknown_channel += 1;
            trace!("rime ignoring channel {}", packet.channel);
            return RimeReceive::default();
        };

        if packet.origin == self.config.address {
            self.stats.own_echoes += 1;
            return RimeReceive::default();
        }
        if !self.seen.insert((packet.origin, packet.packet_id), now) {
            self.stats.duplicates += 1;
            debug!("rime duplicate packet {} from {}", packet.packet_id, packet.origin);
            return RimeReceive::default();
        }

        let remaining = packet.hops.saturating_sub(1);
        let forward = (mode == RimeMode::Broadcast && remaining > 0).then(|| {
            self.stats.forwarded += 1;
            let relayed = RimePacket {
                hops: remaining,
                ..packet.clone()
            };
            RimeOutbound {
                dst: MacAddress::BROADCAST,
                ack_request: false,
                payload: Bytes::from(relayed.encode()),
            }
        });

        self.stats.delivered += 1;
        RimeReceive {
            delivery: Some(RimeDelivery {
                mode,
                origin: packet.origin,
                hops: packet.hops,
                payload: packet.payload,
            }),
            forward,
        }
    }

    pub async fn run(
        mut self,
        mut mac_up: mpsc::Receiver<MacFrame>,
        mut requests: mpsc::Receiver<RimeRequest>,
        mac_tx: mpsc::Sender<MacRequest>,
        deliveries: mpsc::Sender<RimeDelivery>,
        stats: watch::Sender<RimeStats>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("rime task started as {}", self.config.address);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(frame) = mac_up.recv() => {
                    let received = self.on_receive_from_mac(&frame, Instant::now());
                    if let Some(forward) = received.forward {
                        // Relays must not stall the receive path.
                        if mac_tx.try_send(forward.into_request(None)).is_err() {
                            self.stats.dropped += 1;
                        }
                    }
                    if let Some(delivery) = received.delivery {
                        match deliveries.try_send(delivery) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                self.stats.dropped += 1;
                                warn!("rime delivery queue full, dropping packet");
                            }
                            Err(TrySendError::Closed(_)) => self.stats.dropped += 1,
                        }
                    }
                }
                Some(request) = requests.recv() => {
                    let RimeRequest { payload, mode, reply } = request;
                    match self.send_down(payload, mode, Instant::now()) {
                        Ok(outbound) => {
                            if mac_tx.send(outbound.into_request(reply)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            if let Some(reply) = reply {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                }
                else => break,
            }
            stats.send_replace(self.stats);
        }
        info!("rime task stopped");
    }
}

/// Outbound application payload handed to the rime task.
pub struct RimeRequest {
    pub payload: Bytes,
    pub mode: RimeMode,
    pub reply: Option<oneshot::Sender<TxResult>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(address: [u8; 2], max_hops: u8) -> RimeStack {
        let config = RimeConfig {
            address: RimeAddress(address),
            max_hops,
            next_hop: Some(MacAddress::Short(7)),
            ..Default::default()
        };
        RimeStack::new(config, 104)
    }

    fn carried(outbound: &RimeOutbound) -> MacFrame {
        MacFrame::data(
            0,
            0x1234,
            MacAddress::Short(2),
            outbound.dst,
            outbound.payload.clone(),
            outbound.ack_request,
        )
    }

    #[test]
    fn test_header_layout() {
        let mut node = stack([23, 42], 1);
        let out = node.send_down(Bytes::from_static(b"hi"), RimeMode::Broadcast, Instant::now()).unwrap();
        assert_eq!(&out.payload[..], &[129, 0, 23, 42, 0, 0, 1, b'h', b'i']);
        assert_eq!(out.dst, MacAddress::BROADCAST);
        assert!(!out.ack_request);

        let out = node.send_down(Bytes::new(), RimeMode::Anycast, Instant::now()).unwrap();
        assert_eq!(&out.payload[..6], &[131, 0, 23, 42, 1, 0]);
        assert_eq!(out.dst, MacAddress::Short(7));
        assert!(out.ack_request);
    }

    #[test]
    fn test_mtu_enforced() {
        let mut node = stack([1, 1], 1);
        assert_eq!(node.mtu(), 97);
        let result = node.send_up(Bytes::from(vec![0u8; 98]), Instant::now());
        assert!(matches!(result, Err(RadioError::PacketTooLarge { size: 98, mtu: 97 })));
        assert!(node.send_up(Bytes::from(vec![0u8; 97]), Instant::now()).is_ok());
    }

    #[test]
    fn test_flood_delivers_once_and_respects_hops() {
        let now = Instant::now();
        let mut origin = stack([1, 0], 2);
        let mut relay = stack([2, 0], 1);
        let mut leaf = stack([3, 0], 1);

        let out = origin.send_down(Bytes::from_static(b"flood"), RimeMode::Broadcast, now).unwrap();
        let frame = carried(&out);

        let at_relay = relay.on_receive_from_mac(&frame, now);
        let delivered = at_relay.delivery.unwrap();
        assert_eq!(delivered.payload, Bytes::from_static(b"flood"));
        assert_eq!(delivered.hops, 2);
        let relayed = at_relay.forward.unwrap();

        // The leaf hears both the original and the relay.
        assert!(leaf.on_receive_from_mac(&frame, now).delivery.is_some());
        let second = leaf.on_receive_from_mac(&carried(&relayed), now);
        assert!(second.delivery.is_none());
        assert_eq!(leaf.stats().duplicates, 1);

        // Hop count 1 on the relayed copy stops it at the next receiver.
        let mut far = stack([4, 0], 1);
        let at_far = far.on_receive_from_mac(&carried(&relayed), now);
        assert_eq!(at_far.delivery.unwrap().hops, 1);
        assert!(at_far.forward.is_none());

        // Our own flood coming back is suppressed.
        assert!(origin.on_receive_from_mac(&carried(&relayed), now).delivery.is_none());
        assert_eq!(origin.stats().own_echoes, 1);
    }

    #[test]
    fn test_anycast_is_delivered_not_relayed() {
        let now = Instant::now();
        let mut sender = stack([1, 0], 3);
        let mut receiver = stack([2, 0], 3);
        let out = sender.send_down(Bytes::from_static(b"direct"), RimeMode::Anycast, now).unwrap();

        let received = receiver.on_receive_from_mac(&carried(&out), now);
        assert_eq!(received.delivery.unwrap().mode, RimeMode::Anycast);
        assert!(received.forward.is_none());
    }

    #[test]
    fn test_anycast_without_next_hop_is_refused() {
        let now = Instant::now();
        let mut node = RimeStack::new(RimeConfig::default(), 104);
        assert!(matches!(
            node.send_down(Bytes::from_static(b"where to"), RimeMode::Anycast, now),
            Err(RadioError::InvalidConfig(_))
        ));
        assert_eq!(node.stats().sent, 0);
        assert!(node.send_down(Bytes::from_static(b"everyone"), RimeMode::Broadcast, now).is_ok());

        let broadcast_hop = RimeConfig {
            next_hop: Some(MacAddress::BROADCAST),
            ..Default::default()
        };
        assert!(broadcast_hop.validate().is_err());
        assert!(RimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_malformed_and_unknown_channel() {
        let now = Instant::now();
        let mut node = stack([1, 0], 1);
        let frame = |payload: Bytes| {
            MacFrame::data(0, 0x1234, MacAddress::Short(2), MacAddress::BROADCAST, payload, false)
        };
        assert!(node.on_receive_from_mac(&frame(Bytes::from_static(&[1, 2])), now).delivery.is_none());

        let packet = RimePacket {
            channel: 132,
            origin: RimeAddress([9, 9]),
            packet_id: 0,
            hops: 1,
            payload: Bytes::new(),
        };
        assert!(node.on_receive_from_mac(&frame(Bytes::from(packet.encode())), now).delivery.is_none());

        let stats = node.stats();
        assert_eq!((stats.malformed, stats.unknown_channel), (1, 1));
    }

    #[test]
    fn test_seen_cache_expires() {
        let start = Instant::now();
        let mut cache = SeenCache::new(2, Duration::from_secs(1));
        let a = (RimeAddress([1, 1]), 1);
        assert!(cache.insert(a, start));
        assert!(!cache.insert(a, start));
        assert!(cache.insert(a, start + Duration::from_secs(2)));

        assert!(cache.insert((RimeAddress([1, 1]), 2), start + Duration::from_secs(2)));
        assert!(cache.insert((RimeAddress([1, 1]), 3), start + Duration::from_secs(2)));
        // Capacity pushed the first key out.
        assert!(cache.insert(a, start + Duration::from_secs(2)));
    }
}
