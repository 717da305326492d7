//! radio layers for the WPAN transceiver: PHY framing, CSMA-CA MAC and the
//! rime broadcast/unicast stack, plus the collaborators they are wired to

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wpan_core::{channel_frequency, MAX_CHANNEL, MIN_CHANNEL};

pub mod bridge;
pub mod capture;
pub mod chips;
pub mod csma;
pub mod framing;
pub mod frontend;
pub mod mac;
pub mod mac_frame;
pub mod neighbor;
pub mod pipeline;
pub mod rime;
pub mod simulated;

pub use bridge::UdpBridge;
pub use capture::{spawn_capture, CaptureSink, CaptureWriter};
pub use csma::{ClearChannelAssessment, CsmaCa, EnergyDetector};
pub use framing::{Burst, Demodulator, PhyConfig, PhyFrame, PhyFramer, PhyStats};
pub use frontend::{FrontEnd, LinearResampler, RadioControl, Resampler};
pub use mac::{MacConfig, MacLayer, MacRequest, MacStats, TxReport, TxState};
pub use mac_frame::{FrameType, MacAddress, MacFrame};
pub use neighbor::{NeighborEntry, NeighborTable};
pub use pipeline::{PipelineStats, Transceiver, TransceiverConfig, TransceiverHandle};
pub use rime::{RimeAddress, RimeConfig, RimeDelivery, RimeMode, RimePacket, RimeStack, RimeStats};
pub use simulated::{AirConfig, SimulatedAir, SimulatedFrontEnd};

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("packet of {size} bytes exceeds MTU of {mtu} bytes")]
    PacketTooLarge { size: usize, mtu: usize },

    #[error("invalid channel {0}, expected {MIN_CHANNEL}..={MAX_CHANNEL}")]
    InvalidChannel(u8),

    #[error("invalid gain {0} dB")]
    InvalidGain(f64),

    #[error("invalid sample rate {0} Hz")]
    InvalidSampleRate(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid frame format: {0}")]
    InvalidFrame(&'static str),

    #[error("frame {sequence} not acknowledged after {attempts} attempts")]
    DeliveryFailed { sequence: u8, attempts: u8 },

    #[error("channel access failure for frame {sequence}")]
    ChannelAccessFailure { sequence: u8 },

    #[error("front-end failure: {0}")]
    FrontEnd(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline shut down")]
    Shutdown,
}

pub const MIN_GAIN_DB: f64 = 0.0;
pub const MAX_GAIN_DB: f64 = 100.0;

/// Front-end settings that can change while the pipeline is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    pub channel: u8,
    pub gain_db: f64,
    pub sample_rate: f64,
}

impl RadioConfig {
    pub fn validate(&self) -> Result<(), RadioError> {
        self.center_frequency()?;
        if !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&self.gain_db) {
            return Err(RadioError::InvalidGain(self.gain_db));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(RadioError::InvalidSampleRate(self.sample_rate));
        }
        Ok(())
    }

    pub fn center_frequency(&self) -> Result<f64, RadioError> {
        channel_frequency(self.channel).ok_or(RadioError::InvalidChannel(self.channel))
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: 17,
            gain_db: 30.0,
            sample_rate: 4_000_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RadioConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.center_frequency().ok(), Some(2_435_000_000.0));
    }

    #[test]
    fn test_rejects_out_of_range_settings() {
        let bad_channel = RadioConfig { channel: 27, ..Default::default() };
        assert!(matches!(bad_channel.validate(), Err(RadioError::InvalidChannel(27))));

        let bad_gain = RadioConfig { gain_db: 101.0, ..Default::default() };
        assert!(matches!(bad_gain.validate(), Err(RadioError::InvalidGain(_))));

        let bad_rate = RadioConfig { sample_rate: 0.0, ..Default::default() };
        assert!(matches!(bad_rate.validate(), Err(RadioError::InvalidSampleRate(_))));
    }
}
