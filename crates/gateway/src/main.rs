use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{info, warn};
use tokio::sync::{mpsc, watch};

use wpan_radio::bridge::DEFAULT_UDP_PORT;
use wpan_radio::{
    spawn_capture, AirConfig, MacAddress, MacConfig, RadioConfig, RimeAddress, RimeConfig,
    RimeDelivery, SimulatedAir, Transceiver, TransceiverConfig, TransceiverHandle, UdpBridge,
};

const DEFAULT_CAPTURE: &str = "/tmp/sensor.pcap";
const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid {name}={value}")),
        Err(_) => Ok(default),
    }
}

fn node_config(radio: &RadioConfig, short: u16, rime: [u8; 2]) -> TransceiverConfig {
    TransceiverConfig {
        radio: radio.clone(),
        mac: MacConfig {
            address: MacAddress::Short(short),
            ..Default::default()
        },
        rime: RimeConfig {
            address: RimeAddress(rime),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let defaults = RadioConfig::default();
    let radio = RadioConfig {
        channel: env_or("WPAN_CHANNEL", defaults.channel)?,
        gain_db: env_or("WPAN_GAIN", defaults.gain_db)?,
        ..defaults
    };
    radio.validate().context("radio configuration")?;
    let udp_port: u16 = env_or("WPAN_UDP_PORT", DEFAULT_UDP_PORT)?;
    let capture_path: String = env_or("WPAN_CAPTURE", DEFAULT_CAPTURE.to_string())?;

    let air = SimulatedAir::new(AirConfig::default());

    let gateway_fe = Arc::new(air.join().await);
    let capture = spawn_capture(&capture_path)
        .await
        .with_context(|| format!("cannot open capture file {capture_path}"))?;
    let mut gateway = Transceiver::start(
        node_config(&radio, 1, [23, 42]),
        gateway_fe.clone(),
        Some(gateway_fe.cca()),
        Some(capture),
    )
    .await
    .context("failed to start gateway node")?;

    let sensor_fe = Arc::new(air.join().await);
    let mut sensor = Transceiver::start(
        node_config(&radio, 2, [23, 43]),
        sensor_fe.clone(),
        Some(sensor_fe.cca()),
        None,
    )
    .await
    .context("failed to start sensor node")?;

    let (shutdown_tx, shutdown) = watch::channel(false);

    let sensor_rx = sensor.take_deliveries().context("sensor deliveries already taken")?;
    let echo = tokio::spawn(echo_sensor(sensor.handle(), sensor_rx, shutdown.clone()));

    let bridge_addr = SocketAddr::from(([0, 0, 0, 0], udp_port));
    let bridge = UdpBridge::bind(bridge_addr)
        .await
        .with_context(|| format!("cannot bind UDP bridge on {bridge_addr}"))?;
    let gateway_rx = gateway.take_deliveries().context("gateway deliveries already taken")?;
    let bridge_task = tokio::spawn(bridge.run(gateway.handle(), gateway_rx, shutdown.clone()));

    info!(
        "gateway up: channel {}, UDP port {}, capturing to {}",
        radio.channel, udp_port, capture_path
    );

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = gateway.stopped() => {
                warn!("gateway pipeline stopped");
                break;
            }
            _ = ticker.tick() => {
                let stats = gateway.stats().await;
                info!(
                    "PHY {} ok / {} dropped, MAC {} tx / {} retries, rime {} delivered, {} ring overruns",
                    stats.phy.frames_ok,
                    stats.phy.dropped(),
                    stats.mac.transmissions,
                    stats.mac.retransmissions,
                    stats.rime.delivered,
                    stats.ring_overruns
                );
            }
        }
    }

    shutdown_tx.send_replace(true);
    if let Ok(Err(e)) = bridge_task.await {
        warn!("UDP bridge ended with error: {}", e);
    }
    let _ = echo.await;
    sensor.shutdown().await.context("sensor node")?;
    gateway.shutdown().await.context("gateway node")?;
    Ok(())
}

/// Simulated peer: answers every broadcast it hears with an echo.
async fn echo_sensor(
    handle: TransceiverHandle,
    mut deliveries: mpsc::Receiver<RimeDelivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let mut echo = b"echo: ".to_vec();
        echo.extend_from_slice(&delivery.payload);
        echo.truncate(handle.rime_mtu());
        if let Err(e) = handle.send_up(Bytes::from(echo)).await {
            warn!("sensor echo failed: {}", e);
            break;
        }
    }
}
