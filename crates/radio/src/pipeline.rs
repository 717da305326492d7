//! Transceiver pipeline: front-end reader → sample ring → PHY RX → MAC → rime
//! on the way up, and rime → MAC → PHY TX → front-end on the way down.
//!
//! Every stage runs as its own tokio task connected by bounded queues. The
//! transmit side waits for queue capacity; the receive side never does and
//! counts what it has to drop instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use wpan_core::{Sample, SampleStream};

use crate::capture::CaptureSink;
use crate::csma::{ClearChannelAssessment, EnergyDetector};
use crate::framing::{DemodStep, Demodulator, PhyConfig, PhyFrame, PhyFramer, PhyStats};
use crate::frontend::{FrontEnd, LinearResampler, RadioControl, Resampler};
use crate::mac::{MacConfig, MacLayer, MacStats, TxReport};
use crate::mac_frame::MacAddress;
use crate::rime::{RimeConfig, RimeDelivery, RimeMode, RimeRequest, RimeStack, RimeStats};
use crate::{RadioConfig, RadioError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransceiverConfig {
    pub radio: RadioConfig,
    pub phy: PhyConfig,
    pub mac: MacConfig,
    pub rime: RimeConfig,
    /// Samples held between the front-end and the PHY before the oldest
    /// are overwritten.
    pub ring_capacity: usize,
    pub read_block: usize,
    pub queue_depth: usize,
    /// Optional `(interpolation, decimation)` applied to received samples.
    pub resample: Option<(u64, u64)>,
    /// Energy-detect threshold when no CCA is supplied.
    pub cca_threshold_db: f32,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            radio: RadioConfig::default(),
            phy: PhyConfig::default(),
            mac: MacConfig::default(),
            rime: RimeConfig::default(),
            ring_capacity: 1 << 20,
            read_block: 4096,
            queue_depth: 64,
            resample: None,
            cca_threshold_db: -10.0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub phy: PhyStats,
    pub mac: MacStats,
    pub rime: RimeStats,
    pub samples_read: u64,
    pub ring_overruns: u64,
    /// Frames the PHY decoded but the MAC queue had no room for.
    pub rx_dropped: u64,
}

/// Cloneable entry point for application traffic and radio control.
#[derive(Clone)]
pub struct TransceiverHandle {
    rime_tx: mpsc::Sender<RimeRequest>,
    control: RadioControl,
    rime_mtu: usize,
}

impl TransceiverHandle {
    pub(crate) fn new(rime_tx: mpsc::Sender<RimeRequest>, control: RadioControl, rime_mtu: usize) -> Self {
        Self {
            rime_tx,
            control,
            rime_mtu,
        }
    }

    fn check_mtu(&self, payload: &Bytes) -> Result<(), RadioError> {
        if payload.len() > self.rime_mtu {
            return Err(RadioError::PacketTooLarge {
                size: payload.len(),
                mtu: self.rime_mtu,
            });
        }
        Ok(())
    }

    /// Sends `payload` and waits for the MAC outcome.
    pub async fn send_down(&self, payload: Bytes, mode: RimeMode) -> Result<TxReport, RadioError> {
        self.check_mtu(&payload)?;
        let (reply, outcome) = oneshot::channel();
        let request = RimeRequest {
            payload,
            mode,
            reply: Some(reply),
        };
        self.rime_tx.send(request).await.map_err(|_| RadioError::Shutdown)?;
        outcome.await.map_err(|_| RadioError::Shutdown)?
    }

    /// Queues application data for broadcast without waiting for the outcome.
    pub async fn send_up(&self, payload: Bytes) -> Result<(), RadioError> {
        self.check_mtu(&payload)?;
        let request = RimeRequest {
            payload,
            mode: RimeMode::Broadcast,
            reply: None,
        };
        self.rime_tx.send(request).await.map_err(|_| RadioError::Shutdown)
    }

    pub fn control(&self) -> &RadioControl {
        &self.control
    }

    pub fn rime_mtu(&self) -> usize {
        self.rime_mtu
    }
}

struct Shared {
    ring: StdMutex<SampleStream>,
    ready: Notify,
    source_done: AtomicBool,
    samples_read: AtomicU64,
    rx_dropped: AtomicU64,
    phy_stats: Mutex<PhyStats>,
    fault: StdMutex<Option<RadioError>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn new(ring_capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ring: StdMutex::new(SampleStream::new(ring_capacity)),
            ready: Notify::new(),
            source_done: AtomicBool::new(false),
            samples_read: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            phy_stats: Mutex::new(PhyStats::default()),
            fault: StdMutex::new(None),
            shutdown,
        }
    }

    /// Front-end errors are fatal: record the first and stop every task.
    fn fail(&self, e: RadioError) {
        error!("front-end failure, shutting down pipeline: {}", e);
        let mut fault = self.fault.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if fault.is_none() {
            *fault = Some(e);
        }
        self.shutdown.send_replace(true);
    }
}

pub struct Transceiver {
    shared: Arc<Shared>,
    handle: TransceiverHandle,
    deliveries: Option<mpsc::Receiver<RimeDelivery>>,
    mac_stats: watch::Receiver<MacStats>,
    rime_stats: watch::Receiver<RimeStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transceiver {
    /// Validates the configuration, tunes the front-end and spawns the
    /// pipeline tasks. Without `cca`, an energy detector fed by the receive
    /// path decides whether the channel is clear.
    pub async fn start(
        config: TransceiverConfig,
        front_end: Arc<dyn FrontEnd>,
        cca: Option<Arc<dyn ClearChannelAssessment>>,
        capture: Option<CaptureSink>,
    ) -> Result<Self, RadioError> {
        let control = RadioControl::new(config.radio.clone())?;
        let framer = PhyFramer::new(config.phy.clone())?;
        let resampler = match config.resample {
            Some((interpolation, decimation)) => Some(LinearResampler::new(interpolation, decimation)?),
            None => None,
        };
        if config.read_block == 0 || config.queue_depth == 0 {
            return Err(RadioError::InvalidConfig("read_block and queue_depth must be non-zero".into()));
        }
        config.mac.validate()?;
        config.rime.validate()?;

        let mut applied = 0;
        control.apply(front_end.as_ref(), &mut applied).await?;

        let (energy, cca) = match cca {
            Some(cca) => (None, cca),
            None => {
                let detector = Arc::new(EnergyDetector::new(config.cca_threshold_db));
                (Some(detector.clone()), detector as Arc<dyn ClearChannelAssessment>)
            }
        };

        let shared = Arc::new(Shared::new(config.ring_capacity));

        let depth = config.queue_depth;
        let (phy_rx_tx, phy_rx) = mpsc::channel::<PhyFrame>(depth);
        let (phy_tx_tx, phy_tx) = mpsc::channel::<Bytes>(depth);
        let (mac_up_tx, mac_up) = mpsc::channel(depth);
        let (mac_req_tx, mac_req) = mpsc::channel(depth);
        let (rime_req_tx, rime_req) = mpsc::channel(depth);
        let (delivery_tx, deliveries) = mpsc::channel(depth);
        let (rime_stats_tx, rime_stats) = watch::channel(RimeStats::default());

        let (mac, mac_stats) = MacLayer::new(config.mac.clone(), framer.mtu(), cca, phy_tx_tx, mac_up_tx)?;
        let mac_mtu = match config.rime.next_hop {
            Some(hop) => mac.payload_mtu(MacAddress::BROADCAST).min(mac.payload_mtu(hop)),
            None => mac.payload_mtu(MacAddress::BROADCAST),
        };
        let rime = RimeStack::new(config.rime.clone(), mac_mtu);
        let handle = TransceiverHandle::new(rime_req_tx, control.clone(), rime.mtu());

        info!(
            "transceiver starting: channel {}, MAC {}, rime {} (MTU {} bytes)",
            config.radio.channel,
            config.mac.address,
            rime.address(),
            rime.mtu()
        );

        let tasks = vec![
            tokio::spawn(read_front_end(
                shared.clone(),
                front_end.clone(),
                control.clone(),
                applied,
                resampler,
            )),
            tokio::spawn(phy_receive(
                shared.clone(),
                framer.clone(),
                config.read_block,
                energy,
                capture.clone(),
                phy_rx_tx,
            )),
            tokio::spawn(phy_transmit(
                shared.clone(),
                framer,
                front_end,
                control,
                applied,
                capture,
                phy_tx,
            )),
            tokio::spawn(mac.run(phy_rx, mac_req, shared.shutdown.subscribe())),
            tokio::spawn(rime.run(
                mac_up,
                rime_req,
                mac_req_tx,
                delivery_tx,
                rime_stats_tx,
                shared.shutdown.subscribe(),
            )),
        ];

        Ok(Self {
            shared,
            handle,
            deliveries: Some(deliveries),
            mac_stats,
            rime_stats,
            tasks,
        })
    }

    pub fn handle(&self) -> TransceiverHandle {
        self.handle.clone()
    }

    /// Rime deliveries for the application; available once.
    pub fn take_deliveries(&mut self) -> Option<mpsc::Receiver<RimeDelivery>> {
        self.deliveries.take()
    }

    pub async fn stats(&self) -> PipelineStats {
        let phy = *self.shared.phy_stats.lock().await;
        let ring_overruns = self
            .shared
            .ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .overruns();
        PipelineStats {
            phy,
            mac: *self.mac_stats.borrow(),
            rime: *self.rime_stats.borrow(),
            samples_read: self.shared.samples_read.load(Ordering::Relaxed),
            ring_overruns,
            rx_dropped: self.shared.rx_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shared.shutdown.borrow()
    }

    /// Resolves once the pipeline has been asked to stop, e.g. after a
    /// front-end failure.
    pub async fn stopped(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Stops every task and reports the front-end failure, if any, that
    /// brought the pipeline down.
    pub async fn shutdown(mut self) -> Result<(), RadioError> {
        self.shared.shutdown.send_replace(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("pipeline task ended abnormally: {}", e);
            }
        }
        info!("transceiver stopped");
        match self.shared.fault.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn read_front_end(
    shared: Arc<Shared>,
    front_end: Arc<dyn FrontEnd>,
    control: RadioControl,
    mut applied: u64,
    mut resampler: Option<LinearResampler>,
) {
    info!("front-end reader started");
    let mut shutdown = shared.shutdown.subscribe();
    let mut raw = Vec::new();
    let mut resampled = Vec::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = control.apply(front_end.as_ref(), &mut applied).await {
            shared.fail(e);
            break;
        }

        raw.clear();
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = front_end.read_samples(&mut raw) => read,
        };
        match read {
            Ok(0) => {
                info!("front-end source exhausted");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.fail(e);
                break;
            }
        }

        let block: &[Sample] = match resampler.as_mut() {
            Some(resampler) => {
                resampled.clear();
                resampler.process(&raw, &mut resampled);
                &resampled
            }
            None => &raw,
        };
        shared.samples_read.fetch_add(block.len() as u64, Ordering::Relaxed);
        let overwritten = shared
            .ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_slice(block);
        if overwritten > 0 {
            debug!("sample ring overrun, {} samples lost", overwritten);
        }
        shared.ready.notify_one();
    }

    shared.source_done.store(true, Ordering::Release);
    shared.ready.notify_one();
    info!("front-end reader stopped");
}

async fn phy_receive(
    shared: Arc<Shared>,
    framer: PhyFramer,
    read_block: usize,
    energy: Option<Arc<EnergyDetector>>,
    capture: Option<CaptureSink>,
    to_mac: mpsc::Sender<PhyFrame>,
) {
    info!("PHY receive task started");
    let mut shutdown = shared.shutdown.subscribe();
    let mut demod = framer.demodulator();
    let mut chunk = Vec::with_capacity(read_block);

    let deliver = |frame: PhyFrame| {
        if let Some(capture) = &capture {
            capture.record(&frame);
        }
        match to_mac.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                shared.rx_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("MAC queue full, dropping frame at sample {}", frame.sample_offset);
            }
            Err(TrySendError::Closed(_)) => {
                shared.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    loop {
        if *shutdown.borrow() {
            break;
        }

        chunk.clear();
        let popped = shared
            .ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_into(&mut chunk, read_block);

        if popped == 0 {
            if shared.source_done.load(Ordering::Acquire) {
                // The final block may have landed after the pop above.
                finish_stream(&shared, &mut demod, &mut chunk, read_block, &deliver);
                publish_rx_stats(&shared, &demod).await;
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = shared.ready.notified() => continue,
            }
        }

        if let Some(energy) = &energy {
            energy.update(&chunk);
        }
        demod.push(&chunk);
        loop {
            match demod.step(false) {
                DemodStep::Frame(frame) => deliver(frame),
                // Bounded search step done; let the other stages run.
                DemodStep::Progress => tokio::task::yield_now().await,
                DemodStep::NeedMore => break,
            }
        }
        publish_rx_stats(&shared, &demod).await;
        trace!("PHY processed {} samples", popped);
    }
    info!("PHY receive task stopped");
}

/// Decodes everything still in the ring once the source is exhausted, then
/// flushes the demodulator with end-of-stream semantics.
fn finish_stream(
    shared: &Shared,
    demod: &mut Demodulator,
    chunk: &mut Vec<Sample>,
    read_block: usize,
    deliver: impl Fn(PhyFrame),
) {
    loop {
        chunk.clear();
        let popped = shared
            .ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_into(chunk, read_block);
        if popped == 0 {
            break;
        }
        demod.push(chunk);
        loop {
            match demod.step(false) {
                DemodStep::Frame(frame) => deliver(frame),
                DemodStep::Progress => continue,
                DemodStep::NeedMore => break,
            }
        }
    }
    loop {
        match demod.step(true) {
            DemodStep::Frame(frame) => deliver(frame),
            DemodStep::Progress => continue,
            DemodStep::NeedMore => break,
        }
    }
}

async fn publish_rx_stats(shared: &Shared, demod: &Demodulator) {
    let rx = demod.stats();
    let mut stats = shared.phy_stats.lock().await;
    *stats = PhyStats {
        frames_sent: stats.frames_sent,
        samples_sent: stats.samples_sent,
        ..rx
    };
}

async fn phy_transmit(
    shared: Arc<Shared>,
    framer: PhyFramer,
    front_end: Arc<dyn FrontEnd>,
    control: RadioControl,
    mut applied: u64,
    capture: Option<CaptureSink>,
    mut from_mac: mpsc::Receiver<Bytes>,
) {
    info!("PHY transmit task started");
    let mut shutdown = shared.shutdown.subscribe();
    let crc = framer.config().crc;

    loop {
        let mpdu = tokio::select! {
            _ = shutdown.changed() => break,
            mpdu = from_mac.recv() => match mpdu {
                Some(mpdu) => mpdu,
                None => break,
            },
        };

        if let Err(e) = control.apply(front_end.as_ref(), &mut applied).await {
            shared.fail(e);
            break;
        }

        let burst = match framer.transmit(&mpdu) {
            Ok(burst) => burst,
            Err(e) => {
                warn!("PHY refused {} byte MPDU: {}", mpdu.len(), e);
                continue;
            }
        };
        let mut samples: Vec<Sample> = Vec::with_capacity(burst.len() + framer.guard_len());
        samples.extend(burst);
        samples.resize(samples.len() + framer.guard_len(), Sample::default());
        let sent = samples.len() as u64;

        if let Some(capture) = &capture {
            capture.record(&PhyFrame::from_payload(mpdu.clone(), crc));
        }
        trace!("PHY transmitting {} bytes as {} samples: {}", mpdu.len(), sent, hex::encode(&mpdu));
        if let Err(e) = front_end.write_samples(samples).await {
            shared.fail(e);
            break;
        }

        let mut stats = shared.phy_stats.lock().await;
        stats.frames_sent += 1;
        stats.samples_sent += sent;
    }
    info!("PHY transmit task stopped");
}
