//! simulation tools for the WPAN transceiver

pub mod scenarios;

use std::time::Duration;
use wpan_radio::AirConfig;

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> AirConfig {
        AirConfig {
            snr_db: 20.0,
            packet_loss: 0.0,
            latency: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn average_conditions() -> AirConfig {
        AirConfig {
            snr_db: 10.0,
            packet_loss: 0.05,
            latency: Duration::from_millis(1),
            ..Default::default()
        }
    }

    pub fn poor_conditions() -> AirConfig {
        AirConfig {
            snr_db: 6.0,
            packet_loss: 0.15,
            latency: Duration::from_millis(5),
            ..Default::default()
        }
    }

    /// Close to the detection floor: most bursts still sync, many are lost.
    pub fn extreme_conditions() -> AirConfig {
        AirConfig {
            snr_db: 3.0,
            packet_loss: 0.30,
            latency: Duration::from_millis(10),
            ..Default::default()
        }
    }
}
