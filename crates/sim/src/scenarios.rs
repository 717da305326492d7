//! Simulation scenarios for exercising the transceiver over the simulated air

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{debug, info};
use tokio::time::{timeout, Instant};
use wpan_core::Sample;
use wpan_radio::{
    AirConfig, FrontEnd, MacAddress, MacConfig, PhyConfig, PhyFramer, RimeAddress, RimeConfig,
    RimeMode, SimulatedAir, Transceiver, TransceiverConfig,
};

const DELIVERY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SweepPoint {
    pub snr_db: f32,
    pub sent: usize,
    pub decoded: usize,
    pub crc_failures: u64,
}

impl SweepPoint {
    pub fn frame_success_rate(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        self.decoded as f64 / self.sent as f64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExchangeReport {
    pub sent: usize,
    pub acked: usize,
    pub failed: usize,
    pub delivered: usize,
    pub retransmissions: u64,
    pub elapsed: Duration,
    pub payload_bytes: usize,
}

impl ExchangeReport {
    pub fn goodput_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.payload_bytes * 8) as f64 / secs
    }
}

#[derive(Debug, Clone)]
pub struct FloodReport {
    pub nodes: usize,
    pub messages: usize,
    /// Deliveries seen by each receiving node.
    pub deliveries: Vec<usize>,
    pub relays: u64,
    pub duplicates: u64,
}

fn node_config(index: u16, next_hop: u16, max_hops: u8) -> TransceiverConfig {
    TransceiverConfig {
        mac: MacConfig {
            address: MacAddress::Short(index + 1),
            ack_timeout: Duration::from_millis(100),
            ..Default::default()
        },
        rime: RimeConfig {
            address: RimeAddress([index as u8 + 1, 0]),
            next_hop: Some(MacAddress::Short(next_hop + 1)),
            max_hops,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn start_node(air: &Arc<SimulatedAir>, config: TransceiverConfig) -> Result<Transceiver> {
    let front_end = Arc::new(air.join().await);
    let cca = front_end.cca();
    Transceiver::start(config, front_end, Some(cca), None)
        .await
        .context("failed to start simulated node")
}

/// Sends `frames` bursts through the air at each SNR and counts how many the
/// PHY recovers on the far side.
pub async fn phy_snr_sweep(snrs: &[f32], frames: usize) -> Result<Vec<SweepPoint>> {
    println!("\n=== PHY SNR Sweep ===");
    let framer = PhyFramer::new(PhyConfig::default())?;
    let mut points = Vec::with_capacity(snrs.len());

    for &snr_db in snrs {
        let air = SimulatedAir::new(AirConfig {
            snr_db,
            pace_airtime: false,
            ..Default::default()
        });
        let tx = air.join().await;
        let rx = air.join().await;

        let mut received: Vec<Sample> = Vec::new();
        for i in 0..frames {
            let payload = format!("sweep frame {i:04}");
            tx.write_samples(framer.transmit(payload.as_bytes())?.collect()).await?;
            rx.read_samples(&mut received).await?;
        }

        let mut stream = framer.receive(received);
        let decoded = stream.by_ref().count();
        let point = SweepPoint {
            snr_db,
            sent: frames,
            decoded,
            crc_failures: stream.stats().crc_failures,
        };
        println!(
            "  SNR {:>5.1} dB: {}/{} frames ({:.1}%), {} CRC failures",
            snr_db,
            point.decoded,
            point.sent,
            point.frame_success_rate() * 100.0,
            point.crc_failures
        );
        points.push(point);
    }
    Ok(points)
}

/// Node A sends `messages` acknowledged anycasts to node B.
pub async fn two_node_exchange(config: AirConfig, messages: usize) -> Result<ExchangeReport> {
    println!("\n=== Two-Node Exchange ===");
    println!("air config: {:?}", config);

    let air = SimulatedAir::new(config);
    let a = start_node(&air, node_config(0, 1, 1)).await?;
    let mut b = start_node(&air, node_config(1, 0, 1)).await?;
    let mut at_b = b.take_deliveries().context("deliveries already taken")?;
    let handle = a.handle();

    let mut report = ExchangeReport::default();
    let start = Instant::now();
    for i in 0..messages {
        let payload = Bytes::from(format!("reading {i}: 21.{i} C"));
        report.sent += 1;
        match handle.send_down(payload.clone(), RimeMode::Anycast).await {
            Ok(tx) => {
                report.acked += 1;
                report.payload_bytes += payload.len();
                debug!("message {} acked after {} attempts", i, tx.attempts);
            }
            Err(e) => {
                report.failed += 1;
                println!("  ✗ message {} failed: {}", i, e);
            }
        }
    }
    report.elapsed = start.elapsed();

    while let Ok(Some(_)) = timeout(Duration::from_millis(200), at_b.recv()).await {
        report.delivered += 1;
    }
    report.retransmissions = a.stats().await.mac.retransmissions;

    println!("Sent {} messages:", report.sent);
    println!("  Acked: {}", report.acked);
    println!("  Failed: {}", report.failed);
    println!("  Delivered at B: {}", report.delivered);
    println!("  Retransmissions: {}", report.retransmissions);
    println!("  Time: {:?}", report.elapsed);
    println!("  Effective goodput: {:.0} bps", report.goodput_bps());

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(report)
}

/// Node 0 floods `messages` broadcasts with two hops, so every other node
/// relays once and drops the copies relayed by its peers.
pub async fn broadcast_flood(config: AirConfig, nodes: usize, messages: usize) -> Result<FloodReport> {
    println!("\n=== Broadcast Flood ({} nodes) ===", nodes);
    anyhow::ensure!(nodes >= 2, "a flood needs at least two nodes");

    let air = SimulatedAir::new(config);
    let mut members = Vec::with_capacity(nodes);
    for index in 0..nodes as u16 {
        let max_hops = if index == 0 { 2 } else { 1 };
        members.push(start_node(&air, node_config(index, 0, max_hops)).await?);
    }
    let mut inboxes = Vec::with_capacity(nodes - 1);
    for member in members.iter_mut().skip(1) {
        inboxes.push(member.take_deliveries().context("deliveries already taken")?);
    }

    let origin = members[0].handle();
    for i in 0..messages {
        let payload = Bytes::from(format!("flood {i}"));
        if let Err(e) = origin.send_down(payload, RimeMode::Broadcast).await {
            println!("  ✗ broadcast {} failed: {}", i, e);
        }
    }

    let deadline = Instant::now() + DELIVERY_WAIT;
    let mut deliveries = vec![0usize; inboxes.len()];
    for (count, inbox) in deliveries.iter_mut().zip(inboxes.iter_mut()) {
        while *count < messages {
            match tokio::time::timeout_at(deadline, inbox.recv()).await {
                Ok(Some(_)) => *count += 1,
                _ => break,
            }
        }
    }

    let mut relays = 0;
    let mut duplicates = 0;
    for member in &members {
        let stats = member.stats().await;
        relays += stats.rime.forwarded;
        duplicates += stats.rime.duplicates;
    }

    for (i, count) in deliveries.iter().enumerate() {
        let mark = if *count == messages { "✓" } else { "✗" };
        println!("  {} node {} received {}/{}", mark, i + 1, count, messages);
    }
    println!("  relays: {}, duplicates suppressed: {}", relays, duplicates);

    for member in members {
        member.shutdown().await?;
    }
    info!("flood finished");
    Ok(FloodReport {
        nodes,
        messages,
        deliveries,
        relays,
        duplicates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulationPresets;

    #[tokio::test]
    async fn test_sweep_decodes_clean_air() {
        let points = phy_snr_sweep(&[25.0], 5).await.unwrap();
        assert_eq!(points[0].decoded, 5);
        assert_eq!(points[0].frame_success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_exchange_in_good_conditions() {
        let report = two_node_exchange(SimulationPresets::good_conditions(), 3)
            .await
            .unwrap();
        assert_eq!(report.acked, 3);
        assert_eq!(report.delivered, 3);
        assert!(report.goodput_bps() > 0.0);
    }

    #[tokio::test]
    async fn test_flood_reaches_every_node_once() {
        let report = broadcast_flood(SimulationPresets::good_conditions(), 3, 2)
            .await
            .unwrap();
        assert_eq!(report.deliveries, vec![2, 2]);
    }
}
