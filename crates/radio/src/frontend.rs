//! Front-end collaborators: the sample source/sink, runtime tuning and
//! sample-rate conversion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::info;
use wpan_core::Sample;

use crate::{RadioConfig, RadioError, MAX_GAIN_DB, MIN_GAIN_DB};

/// Radio hardware (or a stand-in) producing and consuming baseband samples.
///
/// Errors returned here are fatal to the pipeline.
#[async_trait]
pub trait FrontEnd: Send + Sync {
    /// Appends the next block of received samples to `buf` and returns how
    /// many were added. `Ok(0)` means the source is exhausted.
    async fn read_samples(&self, buf: &mut Vec<Sample>) -> Result<usize, RadioError>;

    async fn write_samples(&self, samples: Vec<Sample>) -> Result<(), RadioError>;

    async fn set_gain(&self, gain_db: f64) -> Result<(), RadioError>;

    async fn set_center_frequency(&self, frequency_hz: f64) -> Result<(), RadioError>;

    async fn set_sample_rate(&self, sample_rate: f64) -> Result<(), RadioError>;
}

struct ControlState {
    config: RwLock<RadioConfig>,
    version: AtomicU64,
}

/// Shared, validated radio settings. Changes take effect on the front-end
/// before the next burst is sent or the next sample block is read.
#[derive(Clone)]
pub struct RadioControl {
    state: Arc<ControlState>,
}

impl RadioControl {
    pub fn new(config: RadioConfig) -> Result<Self, RadioError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(ControlState {
                config: RwLock::new(config),
                // Starts ahead of every consumer so the first check applies it.
                version: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> RadioConfig {
        self.state
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.state.version.load(Ordering::Acquire)
    }

    fn update(&self, change: impl FnOnce(&mut RadioConfig)) -> Result<(), RadioError> {
        let mut config = self.state.config.write().unwrap_or_else(|e| e.into_inner());
        let mut next = config.clone();
        change(&mut next);
        next.validate()?;
        *config = next;
        self.state.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn set_channel(&self, channel: u8) -> Result<(), RadioError> {
        self.update(|c| c.channel = channel)
    }

    pub fn set_gain(&self, gain_db: f64) -> Result<(), RadioError> {
        if !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&gain_db) {
            return Err(RadioError::InvalidGain(gain_db));
        }
        self.update(|c| c.gain_db = gain_db)
    }

    pub fn set_sample_rate(&self, sample_rate: f64) -> Result<(), RadioError> {
        self.update(|c| c.sample_rate = sample_rate)
    }

    /// Pushes the current settings to `front_end` if they changed since
    /// `applied`, which is updated on success.
    pub async fn apply(&self, front_end: &dyn FrontEnd, applied: &mut u64) -> Result<(), RadioError> {
        let version = self.version();
        if version == *applied {
            return Ok(());
        }
        let config = self.config();
        let frequency = config.center_frequency()?;
        front_end.set_center_frequency(frequency).await?;
        front_end.set_gain(config.gain_db).await?;
        front_end.set_sample_rate(config.sample_rate).await?;
        info!(
            "front-end tuned to channel {} ({:.0} MHz), gain {} dB, {} S/s",
            config.channel,
            frequency / 1e6,
            config.gain_db,
            config.sample_rate
        );
        *applied = version;
        Ok(())
    }
}

pub trait Resampler: Send {
    /// Output rate over input rate.
    fn ratio(&self) -> f64;

    /// Resamples one block, appending to `output`. State carries across
    /// calls so a stream may be split at any point.
    fn process(&mut self, input: &[Sample], output: &mut Vec<Sample>);
}

/// Linear interpolation at a fixed rational ratio.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    ratio: f64,
    step: f64,
    /// Next output position in input samples, relative to the current block.
    pos: f64,
    last: Sample,
}

impl LinearResampler {
    pub fn new(interpolation: u64, decimation: u64) -> Result<Self, RadioError> {
        if interpolation == 0 || decimation == 0 {
            return Err(RadioError::InvalidConfig(format!(
                "resampling ratio {interpolation}/{decimation}"
            )));
        }
        let ratio = interpolation as f64 / decimation as f64;
        Ok(Self {
            ratio,
            step: 1.0 / ratio,
            pos: 0.0,
            last: Sample::default(),
        })
    }
}

impl Resampler for LinearResampler {
    fn ratio(&self) -> f64 {
        self.ratio
    }

    fn process(&mut self, input: &[Sample], output: &mut Vec<Sample>) {
        let Some(&tail) = input.last() else {
            return;
        };
        let last = self.last;
        let at = |i: isize| if i < 0 { last } else { input[i as usize] };

        let limit = (input.len() - 1) as f64;
        while self.pos < limit {
            let base = self.pos.floor();
            let frac = (self.pos - base) as f32;
            let i = base as isize;
            let (a, b) = (at(i), at(i + 1));
            output.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        self.pos -= input.len() as f64;
        self.last = tail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new(i as f32, -(i as f32))).collect()
    }

    #[test]
    fn test_original_ratio_output_count() {
        let mut resampler = LinearResampler::new(4_000_000, 4_166_667).unwrap();
        let input = ramp(100_000);
        let mut output = Vec::new();
        for block in input.chunks(1000) {
            resampler.process(block, &mut output);
        }
        let expected = 100_000.0 * resampler.ratio();
        assert!((output.len() as f64 - expected).abs() <= 2.0, "{} vs {}", output.len(), expected);
    }

    #[test]
    fn test_interpolates_across_blocks() {
        let mut resampler = LinearResampler::new(2, 1).unwrap();
        let input = ramp(10);
        let mut output = Vec::new();
        resampler.process(&input[..3], &mut output);
        resampler.process(&input[3..], &mut output);

        let expected: Vec<f32> = (0..18).map(|i| i as f32 * 0.5).collect();
        let got: Vec<f32> = output.iter().map(|s| s.re).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_decimation_picks_every_other() {
        let mut resampler = LinearResampler::new(1, 2).unwrap();
        let mut output = Vec::new();
        resampler.process(&ramp(9), &mut output);
        let got: Vec<f32> = output.iter().map(|s| s.re).collect();
        assert_eq!(got, vec![0.0, 2.0, 4.0, 6.0]);
        assert!(LinearResampler::new(0, 1).is_err());
    }

    #[test]
    fn test_control_validates_and_versions() {
        let control = RadioControl::new(RadioConfig::default()).unwrap();
        let before = control.version();

        assert!(matches!(control.set_channel(30), Err(RadioError::InvalidChannel(30))));
        assert!(matches!(control.set_gain(-1.0), Err(RadioError::InvalidGain(_))));
        assert_eq!(control.version(), before);

        control.set_channel(26).unwrap();
        assert_eq!(control.version(), before + 1);
        assert_eq!(control.config().center_frequency().unwrap(), 2_480_000_000.0);
    }
}
