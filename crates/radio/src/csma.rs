//! Unslotted CSMA-CA backoff and clear channel assessment.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;
use tokio::time::Duration;
use wpan_core::Sample;

/// Answers whether the medium is free right now.
pub trait ClearChannelAssessment: Send + Sync {
    fn is_clear(&self) -> bool;
}

/// Backoff state of one frame's channel access attempt.
/// Largest backoff exponent allowed by 802.15.4 (macMaxBE).
pub const MAX_BE: u8 = 8;

#[derive(Debug, Clone)]
pub struct CsmaCa {
    min_be: u8,
    max_be: u8,
    max_backoffs: u8,
    stage: u8,
}

impl CsmaCa {
    pub fn new(min_be: u8, max_be: u8, max_backoffs: u8) -> Self {
        Self {
            min_be,
            max_be: max_be.max(min_be).min(MAX_BE),
            max_backoffs,
            stage: 0,
        }
    }

    pub fn reset(&mut self) {
        self.stage = 0;
    }

    pub fn stage(&self) -> u8 {
        self.stage
    }

    /// Current contention window in backoff periods.
    pub fn window(&self) -> u32 {
        let exponent = (self.min_be as u32 + self.stage as u32).min(self.max_be as u32);
        1 << exponent
    }

    /// Registers a busy channel. Returns `false` once the number of backoffs
    /// exceeds the limit and the attempt must be abandoned.
    pub fn on_busy(&mut self) -> bool {
        self.stage = self.stage.saturating_add(1);
        self.stage <= self.max_backoffs
    }

    /// Random backoff in unit periods, uniform over the current window.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        rng.random_range(0..self.window())
    }

    pub fn backoff<R: Rng + ?Sized>(&self, rng: &mut R, unit: Duration) -> Duration {
        unit * self.draw(rng)
    }
}

/// Energy-detect CCA fed from the receive path.
#[derive(Debug)]
pub struct EnergyDetector {
    power: AtomicU32,
    threshold_db: f32,
    smoothing: f32,
}

impl EnergyDetector {
    pub fn new(threshold_db: f32) -> Self {
        Self {
            power: AtomicU32::new(0f32.to_bits()),
            threshold_db,
            smoothing: 0.25,
        }
    }

    /// Folds a block of received samples into the smoothed power estimate.
    /// Single writer: only the receive task updates the detector.
    pub fn update(&self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        let block = samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len() as f32;
        let old = f32::from_bits(self.power.load(Ordering::Relaxed));
        let new = old + self.smoothing * (block - old);
        self.power.store(new.to_bits(), Ordering::Relaxed);
    }

    pub fn power_db(&self) -> f32 {
        10.0 * f32::from_bits(self.power.load(Ordering::Relaxed)).max(1e-12).log10()
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }
}

impl ClearChannelAssessment for EnergyDetector {
    fn is_clear(&self) -> bool {
        self.power_db() < self.threshold_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_window_grows_and_caps() {
        let mut csma = CsmaCa::new(3, 5, 4);
        assert_eq!(csma.window(), 8);
        for _ in 0..3 {
            assert!(csma.on_busy());
        }
        assert_eq!(csma.stage(), 3);
        assert_eq!(csma.window(), 32);

        csma.reset();
        assert_eq!(csma.window(), 8);
    }

    #[test]
    fn test_gives_up_after_max_backoffs() {
        let mut csma = CsmaCa::new(3, 5, 4);
        for _ in 0..4 {
            assert!(csma.on_busy());
        }
        assert!(!csma.on_busy());
    }

    #[test]
    fn test_draw_stays_in_window() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut csma = CsmaCa::new(3, 5, 4);
        csma.on_busy();
        for _ in 0..1000 {
            assert!(csma.draw(&mut rng) < 16);
        }
        let unit = Duration::from_micros(320);
        assert!(csma.backoff(&mut rng, unit) < unit * 16);
    }

    #[test]
    fn test_energy_detector() {
        let detector = EnergyDetector::new(-20.0);
        assert!(detector.is_clear());

        let loud = vec![Sample::new(1.0, 0.0); 64];
        for _ in 0..20 {
            detector.update(&loud);
        }
        assert!(!detector.is_clear());
        assert!(detector.power_db() > -1.0);

        let quiet = vec![Sample::default(); 64];
        for _ in 0..60 {
            detector.update(&quiet);
        }
        assert!(detector.is_clear());
    }
}
