//! Simulated air medium for testing: several front-ends sharing one band

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, Instant};
use wpan_core::Sample;

use crate::csma::ClearChannelAssessment;
use crate::frontend::FrontEnd;
use crate::{RadioConfig, RadioError, MAX_GAIN_DB, MIN_GAIN_DB};

const NODE_QUEUE: usize = 1024;

/// Channel conditions shared by every link of the medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirConfig {
    pub snr_db: f32,
    pub packet_loss: f32,
    pub latency: Duration,
    /// Sleep for the burst airtime before it reaches the receivers.
    pub pace_airtime: bool,
    pub sample_rate: f64,
    /// Noise samples surrounding each delivered burst.
    pub gap_samples: usize,
    pub random_phase: bool,
}

impl Default for AirConfig {
    fn default() -> Self {
        Self {
            snr_db: 20.0,
            packet_loss: 0.0,
            latency: Duration::ZERO,
            pace_airtime: true,
            sample_rate: 4_000_000.0,
            gap_samples: 512,
            random_phase: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AirStats {
    pub bursts_sent: u64,
    pub bursts_delivered: u64,
    pub bursts_lost: u64,
    pub bursts_overflowed: u64,
    pub samples_sent: u64,
}

struct AirNode {
    id: usize,
    frequency: Arc<AtomicU64>,
    tx: mpsc::Sender<Vec<Sample>>,
}

pub struct SimulatedAir {
    config: AirConfig,
    nodes: RwLock<Vec<AirNode>>,
    busy_until: StdMutex<HashMap<u64, Instant>>,
    stats: Mutex<AirStats>,
}

impl SimulatedAir {
    pub fn new(config: AirConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(Vec::new()),
            busy_until: StdMutex::new(HashMap::new()),
            stats: Mutex::new(AirStats::default()),
        })
    }

    pub fn config(&self) -> &AirConfig {
        &self.config
    }

    pub async fn join(self: &Arc<Self>) -> SimulatedFrontEnd {
        let (tx, rx) = mpsc::channel(NODE_QUEUE);
        let radio = RadioConfig::default();
        let frequency = Arc::new(AtomicU64::new(
            radio.center_frequency().map(hz_key).unwrap_or_default(),
        ));

        let mut nodes = self.nodes.write().await;
        let id = nodes.len();
        nodes.push(AirNode {
            id,
            frequency: frequency.clone(),
            tx,
        });
        debug!("simulated node {} joined the air", id);

        SimulatedFrontEnd {
            id,
            air: Arc::clone(self),
            frequency,
            gain_db: AtomicU64::new(radio.gain_db.to_bits()),
            sample_rate: AtomicU64::new(radio.sample_rate.to_bits()),
            rx: Mutex::new(rx),
        }
    }

    pub async fn stats(&self) -> AirStats {
        *self.stats.lock().await
    }

    fn is_busy(&self, frequency: u64) -> bool {
        let busy = self.busy_until.lock().unwrap_or_else(|e| e.into_inner());
        busy.get(&frequency).is_some_and(|until| *until > Instant::now())
    }

    async fn transmit(&self, from: usize, frequency: u64, burst: Vec<Sample>) {
        let airtime = Duration::from_secs_f64(burst.len() as f64 / self.config.sample_rate);
        {
            let mut busy = self.busy_until.lock().unwrap_or_else(|e| e.into_inner());
            let until = busy.entry(frequency).or_insert_with(Instant::now);
            *until = (*until).max(Instant::now()) + airtime;
        }
        self.stats.lock().await.samples_sent += burst.len() as u64;
        self.stats.lock().await.bursts_sent += 1;

        if self.config.pace_airtime {
            sleep(airtime).await;
        }
        if !self.config.latency.is_zero() {
            sleep(self.config.latency).await;
        }

        let nodes = self.nodes.read().await;
        for node in nodes.iter() {
            if node.id == from || node.frequency.load(Ordering::Relaxed) != frequency {
                continue;
            }
            let lost = rand::rng().random::<f32>() < self.config.packet_loss;
            if lost {
                self.stats.lock().await.bursts_lost += 1;
                debug!("simulated burst from node {} lost before node {}", from, node.id);
                continue;
            }

            let received = self.impair(&burst);
            match node.tx.try_send(received) {
                Ok(()) => {
                    trace!("burst from node {} reached node {}", from, node.id);
                    self.stats.lock().await.bursts_delivered += 1;
                }
                Err(e) => {
                    warn!("node {} receive queue unavailable: {}", node.id, e);
                    self.stats.lock().await.bursts_overflowed += 1;
                }
            }
        }
    }

    /// Adds carrier phase, AWGN and surrounding noise to a unit-power burst.
    fn impair(&self, burst: &[Sample]) -> Vec<Sample> {
        let mut rng = rand::rng();
        let noise_power = 10f32.powf(-self.config.snr_db / 10.0);
        let sigma = (noise_power / 2.0).sqrt();
        let noise = Normal::new(0.0f32, sigma).ok();
        let mut awgn = move |rng: &mut rand::rngs::ThreadRng| match &noise {
            Some(normal) => Sample::new(normal.sample(rng), normal.sample(rng)),
            None => Sample::default(),
        };

        let phase = if self.config.random_phase {
            rng.random_range(-PI..PI)
        } else {
            0.0
        };
        let rotation = Sample::from_polar(1.0, phase);

        let gap = self.config.gap_samples;
        let mut out = Vec::with_capacity(burst.len() + 2 * gap);
        out.extend((0..gap).map(|_| awgn(&mut rng)));
        out.extend(burst.iter().map(|&s| s * rotation + awgn(&mut rng)));
        out.extend((0..gap).map(|_| awgn(&mut rng)));
        out
    }
}

fn hz_key(frequency: f64) -> u64 {
    frequency.round() as u64
}

pub struct SimulatedFrontEnd {
    id: usize,
    air: Arc<SimulatedAir>,
    frequency: Arc<AtomicU64>,
    gain_db: AtomicU64,
    sample_rate: AtomicU64,
    rx: Mutex<mpsc::Receiver<Vec<Sample>>>,
}

impl SimulatedFrontEnd {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn gain_db(&self) -> f64 {
        f64::from_bits(self.gain_db.load(Ordering::Relaxed))
    }

    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate.load(Ordering::Relaxed))
    }

    /// Carrier sense against the shared medium on this node's frequency.
    pub fn cca(&self) -> Arc<dyn ClearChannelAssessment> {
        Arc::new(AirCarrierSense {
            air: self.air.clone(),
            frequency: self.frequency.clone(),
        })
    }
}

#[async_trait]
impl FrontEnd for SimulatedFrontEnd {
    async fn read_samples(&self, buf: &mut Vec<Sample>) -> Result<usize, RadioError> {
        match self.rx.lock().await.recv().await {
            Some(block) => {
                buf.extend_from_slice(&block);
                Ok(block.len())
            }
            None => Ok(0),
        }
    }

    async fn write_samples(&self, samples: Vec<Sample>) -> Result<(), RadioError> {
        let frequency = self.frequency.load(Ordering::Relaxed);
        trace!("node {} transmitting {} samples", self.id, samples.len());
        self.air.transmit(self.id, frequency, samples).await;
        Ok(())
    }

    async fn set_gain(&self, gain_db: f64) -> Result<(), RadioError> {
        if !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&gain_db) {
            return Err(RadioError::InvalidGain(gain_db));
        }
        self.gain_db.store(gain_db.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    async fn set_center_frequency(&self, frequency_hz: f64) -> Result<(), RadioError> {
        self.frequency.store(hz_key(frequency_hz), Ordering::Relaxed);
        Ok(())
    }

    async fn set_sample_rate(&self, sample_rate: f64) -> Result<(), RadioError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(RadioError::InvalidSampleRate(sample_rate));
        }
        self.sample_rate.store(sample_rate.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

struct AirCarrierSense {
    air: Arc<SimulatedAir>,
    frequency: Arc<AtomicU64>,
}

impl ClearChannelAssessment for AirCarrierSense {
    fn is_clear(&self) -> bool {
        !self.air.is_busy(self.frequency.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn quiet() -> AirConfig {
        AirConfig {
            pace_airtime: false,
            gap_samples: 4,
            random_phase: false,
            snr_db: 200.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_burst_reaches_other_nodes_only() {
        let air = SimulatedAir::new(quiet());
        let a = air.join().await;
        let b = air.join().await;

        let burst = vec![Sample::new(1.0, 0.0); 10];
        a.write_samples(burst).await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(b.read_samples(&mut buf).await.unwrap(), 18);
        assert!((buf[4].re - 1.0).abs() < 1e-3);
        assert!(buf[0].norm() < 1e-3);
        assert!(a.rx.lock().await.try_recv().is_err());

        let stats = air.stats().await;
        assert_eq!((stats.bursts_sent, stats.bursts_delivered), (1, 1));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let air = SimulatedAir::new(quiet());
        let a = air.join().await;
        let b = air.join().await;
        b.set_center_frequency(2_480_000_000.0).await.unwrap();

        a.write_samples(vec![Sample::new(1.0, 0.0); 10]).await.unwrap();
        assert!(b.rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_total_loss_drops_everything() {
        let air = SimulatedAir::new(AirConfig {
            packet_loss: 1.0,
            ..quiet()
        });
        let a = air.join().await;
        let b = air.join().await;
        a.write_samples(vec![Sample::default(); 10]).await.unwrap();

        assert!(b.rx.lock().await.try_recv().is_err());
        assert_eq!(air.stats().await.bursts_lost, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_carrier_sense_tracks_airtime() {
        let air = SimulatedAir::new(AirConfig {
            sample_rate: 1000.0,
            ..quiet()
        });
        let a = air.join().await;
        let b = air.join().await;
        let cca = b.cca();
        assert!(cca.is_clear());

        let burst = vec![Sample::default(); 100];
        let sender = tokio::spawn(async move { a.write_samples(burst).await });
        tokio::task::yield_now().await;
        assert!(!cca.is_clear());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cca.is_clear());
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gain_range_enforced() {
        let air = SimulatedAir::new(quiet());
        let node = air.join().await;
        assert_ok!(node.set_gain(30.0).await);
        assert_eq!(node.gain_db(), 30.0);
        assert_err!(node.set_gain(150.0).await);
        assert_err!(node.set_sample_rate(f64::NAN).await);
    }
}
