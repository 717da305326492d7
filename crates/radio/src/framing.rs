//! PHY framing: byte packets to O-QPSK sample bursts and back.
//!
//! On air a PPDU is `preamble (0x00 * n) | SFD 0xA7 | PHR | payload | CRC`,
//! spread 4 bits at a time onto 32-chip sequences. Even chips ride the I rail,
//! odd chips the Q rail one chip later, each shaped by a half-sine spanning
//! two chip periods.

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use wpan_core::{CrcKind, Sample, MAX_PSDU_LEN};

use crate::chips::{chip_at, despread, CHIPS_PER_BYTE, CHIPS_PER_SYMBOL};
use crate::RadioError;

pub const SFD: u8 = 0xA7;

/// Symbols examined after a threshold crossing when looking for the
/// correlation peak.
const PEAK_SEARCH_SYMBOLS: usize = 4;
const READ_CHUNK: usize = 4096;
const COMPACT_AT: usize = 1 << 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhyConfig {
    pub chip_rate: f64,
    pub samples_per_chip: usize,
    /// Preamble length in bytes of `0x00`.
    pub preamble_len: usize,
    /// Normalized preamble correlation needed to start a burst.
    pub threshold: f32,
    pub crc: CrcKind,
    /// Correlation offsets examined per demodulator step.
    pub search_window: usize,
    /// Silence appended after every transmitted burst.
    pub guard_symbols: usize,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            chip_rate: 2_000_000.0,
            samples_per_chip: 2,
            preamble_len: 4,
            threshold: 0.7,
            crc: CrcKind::Crc16,
            search_window: 4096,
            guard_symbols: 1,
        }
    }
}

impl PhyConfig {
    pub fn sample_rate(&self) -> f64 {
        self.chip_rate * self.samples_per_chip as f64
    }

    pub fn symbol_rate(&self) -> f64 {
        self.chip_rate / CHIPS_PER_SYMBOL as f64
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PhyStats {
    pub bursts_detected: u64,
    pub frames_ok: u64,
    pub crc_failures: u64,
    pub sync_failures: u64,
    pub invalid_length: u64,
    pub truncated: u64,
    pub frames_sent: u64,
    pub samples_sent: u64,
}

impl PhyStats {
    /// Transient signal errors: counted, never surfaced past the PHY.
    pub fn dropped(&self) -> u64 {
        self.crc_failures + self.sync_failures + self.invalid_length + self.truncated
    }
}

/// Decoded, CRC-checked PHY payload.
#[derive(Debug, Clone)]
pub struct PhyFrame {
    pub payload: Bytes,
    /// PHR length field: payload plus CRC.
    pub length: u8,
    pub fcs: u32,
    pub crc: CrcKind,
    pub rssi_db: f32,
    pub lqi: u8,
    pub timestamp: SystemTime,
    pub sample_offset: u64,
}

impl PhyFrame {
    /// Builds a frame as if it had just been received, for loopback paths.
    pub fn from_payload(payload: Bytes, crc: CrcKind) -> Self {
        Self {
            length: (payload.len() + crc.len()) as u8,
            fcs: crc.compute(&payload),
            crc,
            payload,
            rssi_db: 0.0,
            lqi: u8::MAX,
            timestamp: SystemTime::now(),
            sample_offset: 0,
        }
    }

    /// Payload followed by the FCS, as it was on air.
    pub fn psdu(&self) -> Vec<u8> {
        let mut psdu = Vec::with_capacity(self.payload.len() + self.crc.len());
        psdu.extend_from_slice(&self.payload);
        psdu.extend_from_slice(&self.fcs.to_le_bytes()[..self.crc.len()]);
        psdu
    }
}

/// A detected sample run carrying one frame.
#[derive(Debug, Clone, Copy)]
pub struct Burst {
    /// Absolute index of the first burst sample in the received stream.
    pub start: u64,
    /// Burst length in samples, known once the PHR is decoded.
    pub span: usize,
    pub symbol_rate: f64,
    pub correlation: f32,
    pub phase: f32,
}

struct Waveforms {
    pulse: Vec<f32>,
    reference: Vec<Sample>,
    reference_energy: f32,
}

#[derive(Clone)]
pub struct PhyFramer {
    config: PhyConfig,
    waveforms: Arc<Waveforms>,
}

impl PhyFramer {
    pub fn new(config: PhyConfig) -> Result<Self, RadioError> {
        if config.samples_per_chip == 0 {
            return Err(RadioError::InvalidConfig("samples_per_chip must be at least 1".into()));
        }
        if config.preamble_len == 0 {
            return Err(RadioError::InvalidConfig("preamble_len must be at least 1".into()));
        }
        if !(config.threshold > 0.0 && config.threshold <= 1.0) {
            return Err(RadioError::InvalidConfig(format!(
                "threshold {} outside (0, 1]",
                config.threshold
            )));
        }
        if config.search_window == 0 {
            return Err(RadioError::InvalidConfig("search_window must be at least 1".into()));
        }

        let spc = config.samples_per_chip;
        let pulse: Vec<f32> = (0..2 * spc)
            .map(|j| (PI * j as f32 / (2 * spc) as f32).sin())
            .collect();

        let mut sync = vec![0u8; config.preamble_len];
        sync.push(SFD);
        // Only the samples fully determined by the sync bytes.
        let reference_len = sync.len() * CHIPS_PER_BYTE * spc;
        let reference: Vec<Sample> = BurstSamples::new(sync, pulse.clone(), spc)
            .take(reference_len)
            .collect();
        let reference_energy = reference.iter().map(|s| s.norm_sqr()).sum();

        Ok(Self {
            config,
            waveforms: Arc::new(Waveforms {
                pulse,
                reference,
                reference_energy,
            }),
        })
    }

    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// Largest payload one burst can carry.
    pub fn mtu(&self) -> usize {
        MAX_PSDU_LEN - self.config.crc.len()
    }

    /// Samples in the burst for a payload of `payload_len` bytes.
    pub fn burst_len(&self, payload_len: usize) -> usize {
        let bytes = self.config.preamble_len + 2 + payload_len + self.config.crc.len();
        (bytes * CHIPS_PER_BYTE + 1) * self.config.samples_per_chip
    }

    pub fn guard_len(&self) -> usize {
        self.config.guard_symbols * CHIPS_PER_SYMBOL * self.config.samples_per_chip
    }

    /// The full on-air byte sequence for `payload`.
    pub fn encode_ppdu(&self, payload: &[u8]) -> Result<Vec<u8>, RadioError> {
        let mtu = self.mtu();
        if payload.len() > mtu {
            return Err(RadioError::PacketTooLarge {
                size: payload.len(),
                mtu,
            });
        }

        let crc = self.config.crc;
        let mut ppdu = vec![0u8; self.config.preamble_len];
        ppdu.push(SFD);
        ppdu.push((payload.len() + crc.len()) as u8);
        let body_start = ppdu.len();
        ppdu.extend_from_slice(payload);
        let fcs = crc.compute(&ppdu[body_start..]);
        ppdu.extend_from_slice(&fcs.to_le_bytes()[..crc.len()]);
        Ok(ppdu)
    }

    pub fn modulate(&self, ppdu: Vec<u8>) -> BurstSamples {
        BurstSamples::new(ppdu, self.waveforms.pulse.clone(), self.config.samples_per_chip)
    }

    /// Encodes and modulates `payload` into a finite, lazily generated burst.
    pub fn transmit(&self, payload: &[u8]) -> Result<BurstSamples, RadioError> {
        let ppdu = self.encode_ppdu(payload)?;
        trace!("PHY modulating {} byte PPDU", ppdu.len());
        Ok(self.modulate(ppdu))
    }

    /// Lazily demodulates every frame found in `stream`.
    pub fn receive<I>(&self, stream: I) -> FrameStream<I::IntoIter>
    where
        I: IntoIterator<Item = Sample>,
    {
        FrameStream {
            source: stream.into_iter(),
            demod: self.demodulator(),
            chunk: Vec::with_capacity(READ_CHUNK),
            exhausted: false,
        }
    }

    pub fn demodulator(&self) -> Demodulator {
        Demodulator {
            framer: self.clone(),
            buffer: Vec::new(),
            base: 0,
            cursor: 0,
            locked: None,
            stats: PhyStats::default(),
        }
    }
}

/// Modulated samples of one PPDU, generated on demand.
pub struct BurstSamples {
    ppdu: Vec<u8>,
    pulse: Vec<f32>,
    spc: usize,
    chips: usize,
    pos: usize,
    len: usize,
}

impl BurstSamples {
    fn new(ppdu: Vec<u8>, pulse: Vec<f32>, spc: usize) -> Self {
        let chips = ppdu.len() * CHIPS_PER_BYTE;
        Self {
            ppdu,
            pulse,
            spc,
            chips,
            pos: 0,
            // The last Q chip ends one chip after the last I chip.
            len: (chips + 1) * spc,
        }
    }

    fn sample(&self, n: usize) -> Sample {
        let period = 2 * self.spc;

        let i_chip = 2 * (n / period);
        let re = if i_chip < self.chips {
            chip_at(&self.ppdu, i_chip) * self.pulse[n - i_chip * self.spc]
        } else {
            0.0
        };

        let im = if n >= self.spc {
            let q_chip = 2 * ((n - self.spc) / period) + 1;
            if q_chip < self.chips {
                chip_at(&self.ppdu, q_chip) * self.pulse[n - q_chip * self.spc]
            } else {
                0.0
            }
        } else {
            0.0
        };

        Sample::new(re, im)
    }
}

impl Iterator for BurstSamples {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.pos >= self.len {
            return None;
        }
        let sample = self.sample(self.pos);
        self.pos += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BurstSamples {}

#[derive(Debug)]
pub enum DemodStep {
    Frame(PhyFrame),
    /// The buffered samples are exhausted.
    NeedMore,
    /// The search window for this step ran out; call again.
    Progress,
}

#[derive(Clone, Copy)]
struct Correlation {
    score: f32,
    value: Sample,
}

/// Push-based burst detector and demodulator.
pub struct Demodulator {
    framer: PhyFramer,
    buffer: Vec<Sample>,
    /// Absolute stream index of `buffer[0]`.
    base: u64,
    cursor: usize,
    locked: Option<Burst>,
    stats: PhyStats,
}

impl Demodulator {
    pub fn push(&mut self, samples: &[Sample]) {
        self.buffer.extend_from_slice(samples);
    }

    pub fn stats(&self) -> PhyStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// Drops buffered samples and any partially received burst.
    pub fn reset(&mut self) {
        self.base += self.buffer.len() as u64;
        self.buffer.clear();
        self.cursor = 0;
        self.locked = None;
    }

    /// Runs the detector for at most one search window. With `end_of_stream`
    /// set, a burst that cannot complete is dropped as truncated.
    pub fn step(&mut self, end_of_stream: bool) -> DemodStep {
        let step = match self.locked.take() {
            Some(burst) => self.decode(burst, end_of_stream),
            None => self.search(end_of_stream),
        };
        self.compact();
        step
    }

    fn search(&mut self, end_of_stream: bool) -> DemodStep {
        let reference_len = self.framer.waveforms.reference.len();
        let threshold = self.framer.config.threshold;
        let peak_span = PEAK_SEARCH_SYMBOLS * CHIPS_PER_SYMBOL * self.framer.config.samples_per_chip;

        for _ in 0..self.framer.config.search_window {
            if self.cursor + reference_len > self.buffer.len() {
                if end_of_stream {
                    // Too short to hold a preamble.
                    self.cursor = self.buffer.len();
                }
                return DemodStep::NeedMore;
            }

            let crossing = self.correlate(self.cursor);
            if crossing.score < threshold {
                self.cursor += 1;
                continue;
            }

            let mut last = self.cursor + peak_span;
            if last + reference_len > self.buffer.len() {
                if !end_of_stream {
                    return DemodStep::NeedMore;
                }
                last = self.buffer.len() - reference_len;
            }

            let (offset, peak) = (self.cursor..=last)
                .map(|offset| (offset, self.correlate(offset)))
                .fold((self.cursor, crossing), |best, candidate| {
                    if candidate.1.score > best.1.score {
                        candidate
                    } else {
                        best
                    }
                });

            let burst = Burst {
                start: self.base + offset as u64,
                span: 0,
                symbol_rate: self.framer.config.symbol_rate(),
                correlation: peak.score,
                phase: peak.value.arg(),
            };
            self.stats.bursts_detected += 1;
            self.cursor = offset;
            trace!(
                "PHY burst at sample {} (correlation {:.3}, phase {:.2} rad)",
                burst.start,
                burst.correlation,
                burst.phase
            );
            return self.decode(burst, end_of_stream);
        }

        DemodStep::Progress
    }

    fn decode(&mut self, mut burst: Burst, end_of_stream: bool) -> DemodStep {
        let config = &self.framer.config;
        let spc = config.samples_per_chip;
        let crc = config.crc;
        let preamble_len = config.preamble_len;
        let reference_len = self.framer.waveforms.reference.len();
        let offset = (burst.start - self.base) as usize;
        let derotate = Sample::from_polar(1.0, -burst.phase);

        let header_bytes = preamble_len + 2;
        if offset + (header_bytes * CHIPS_PER_BYTE + 1) * spc > self.buffer.len() {
            return self.await_samples(burst, end_of_stream);
        }

        let sfd = self.demod_byte(offset, preamble_len, derotate);
        if sfd != SFD {
            self.stats.sync_failures += 1;
            debug!("PHY SFD mismatch at sample {}: {:#04x}", burst.start, sfd);
            self.cursor = offset + reference_len;
            return DemodStep::Progress;
        }

        let length = self.demod_byte(offset, preamble_len + 1, derotate) & 0x7F;
        let psdu_len = length as usize;
        if psdu_len < crc.len() {
            self.stats.invalid_length += 1;
            debug!("PHY invalid length {} at sample {}", length, burst.start);
            self.cursor = offset + reference_len;
            return DemodStep::Progress;
        }

        burst.span = ((header_bytes + psdu_len) * CHIPS_PER_BYTE + 1) * spc;
        if offset + burst.span > self.buffer.len() {
            return self.await_samples(burst, end_of_stream);
        }

        let psdu: Vec<u8> = (0..psdu_len)
            .map(|i| self.demod_byte(offset, header_bytes + i, derotate))
            .collect();
        // Resume exactly at the burst end so a following burst is never merged.
        self.cursor = offset + burst.span;

        let Some(fcs) = crc.verify(&psdu) else {
            self.stats.crc_failures += 1;
            debug!("PHY CRC failure, {} byte PSDU at sample {}", psdu_len, burst.start);
            return DemodStep::Progress;
        };

        let window = &self.buffer[offset..offset + burst.span];
        let power = window.iter().map(|s| s.norm_sqr()).sum::<f32>() / window.len() as f32;
        let rssi_db = 10.0 * power.max(1e-12).log10();
        let lqi = (burst.correlation * 255.0).round().clamp(0.0, 255.0) as u8;

        self.stats.frames_ok += 1;
        let payload = Bytes::copy_from_slice(&psdu[..psdu_len - crc.len()]);
        trace!("PHY frame ok: {} bytes, rssi {:.1} dB, lqi {}", payload.len(), rssi_db, lqi);
        DemodStep::Frame(PhyFrame {
            payload,
            length,
            fcs,
            crc,
            rssi_db,
            lqi,
            timestamp: SystemTime::now(),
            sample_offset: burst.start,
        })
    }

    fn await_samples(&mut self, burst: Burst, end_of_stream: bool) -> DemodStep {
        if end_of_stream {
            self.stats.truncated += 1;
            debug!("PHY truncated burst at sample {}", burst.start);
            self.cursor = self.buffer.len();
        } else {
            self.locked = Some(burst);
        }
        DemodStep::NeedMore
    }

    fn correlate(&self, offset: usize) -> Correlation {
        let waveforms = &self.framer.waveforms;
        let window = &self.buffer[offset..offset + waveforms.reference.len()];

        let mut value = Sample::default();
        let mut energy = 0.0f32;
        for (x, r) in window.iter().zip(&waveforms.reference) {
            value += *x * r.conj();
            energy += x.norm_sqr();
        }

        let norm = (energy * waveforms.reference_energy).sqrt();
        let score = if norm > f32::EPSILON { value.norm() / norm } else { 0.0 };
        Correlation { score, value }
    }

    fn demod_byte(&self, offset: usize, byte_index: usize, derotate: Sample) -> u8 {
        let mut soft = [0f32; CHIPS_PER_SYMBOL];
        let mut byte = 0u8;
        for nibble in 0..2 {
            let first_chip = byte_index * CHIPS_PER_BYTE + nibble * CHIPS_PER_SYMBOL;
            for (i, value) in soft.iter_mut().enumerate() {
                *value = self.soft_chip(offset, first_chip + i, derotate);
            }
            let (symbol, _) = despread(&soft);
            byte |= symbol << (4 * nibble);
        }
        byte
    }

    /// Matched-filter output for chip `chip` of the burst at `offset`.
    fn soft_chip(&self, offset: usize, chip: usize, derotate: Sample) -> f32 {
        let spc = self.framer.config.samples_per_chip;
        let start = offset + chip * spc;
        let pulse = &self.framer.waveforms.pulse;
        self.buffer[start..start + pulse.len()]
            .iter()
            .zip(pulse)
            .map(|(x, p)| {
                let y = *x * derotate;
                let rail = if chip % 2 == 0 { y.re } else { y.im };
                rail * p
            })
            .sum()
    }

    fn compact(&mut self) {
        if self.locked.is_some() {
            return;
        }
        if self.cursor >= COMPACT_AT || self.cursor == self.buffer.len() {
            self.buffer.drain(..self.cursor);
            self.base += self.cursor as u64;
            self.cursor = 0;
        }
    }
}

/// Iterator adapter returned by [`PhyFramer::receive`].
pub struct FrameStream<I> {
    source: I,
    demod: Demodulator,
    chunk: Vec<Sample>,
    exhausted: bool,
}

impl<I> FrameStream<I> {
    pub fn stats(&self) -> PhyStats {
        self.demod.stats()
    }
}

impl<I: Iterator<Item = Sample>> Iterator for FrameStream<I> {
    type Item = PhyFrame;

    fn next(&mut self) -> Option<PhyFrame> {
        loop {
            match self.demod.step(self.exhausted) {
                DemodStep::Frame(frame) => return Some(frame),
                DemodStep::Progress => continue,
                DemodStep::NeedMore if self.exhausted => return None,
                DemodStep::NeedMore => {
                    self.chunk.clear();
                    self.chunk.extend(self.source.by_ref().take(READ_CHUNK));
                    if self.chunk.is_empty() {
                        self.exhausted = true;
                    } else {
                        self.demod.push(&self.chunk);
                    }
                }
            }
        }
    }
}
