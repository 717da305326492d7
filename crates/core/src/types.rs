use num_complex::Complex32;

pub type ShortAddress = u16;
pub type ExtendedAddress = u64;
pub type PanId = u16;
pub type SequenceNumber = u8;

/// Largest PSDU the PHY header can describe (7-bit length field).
pub const MAX_PSDU_LEN: usize = 127;
pub const BROADCAST_PAN: PanId = 0xFFFF;
pub const BROADCAST_SHORT: ShortAddress = 0xFFFF;
pub const MIN_CHANNEL: u8 = 11;
pub const MAX_CHANNEL: u8 = 26;

/// Complex baseband sample (I/Q).
pub type Sample = Complex32;

/// Maps an 802.15.4 2.4 GHz channel number to its center frequency in Hz.
pub fn channel_frequency(channel: u8) -> Option<f64> {
    if (MIN_CHANNEL..=MAX_CHANNEL).contains(&channel) {
        Some(1_000_000.0 * (2400.0 + 5.0 * (channel as f64 - 10.0)))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complex_multiply_rotates() {
        let a = Sample::new(1.0, 0.0);
        let j = Sample::new(0.0, 1.0);
        assert_eq!(a * j, j);
        assert_eq!(j * j, Sample::new(-1.0, 0.0));
        assert_eq!((j * j.conj()).norm_sqr(), 1.0);
        assert_eq!(Sample::default(), Sample::new(0.0, 0.0));
    }

    #[test]
    fn test_channel_frequency_range() {
        assert_eq!(channel_frequency(11), Some(2_405_000_000.0));
        assert_eq!(channel_frequency(16), Some(2_430_000_000.0));
        assert_eq!(channel_frequency(26), Some(2_480_000_000.0));
        assert_eq!(channel_frequency(10), None);
        assert_eq!(channel_frequency(27), None);
    }
}
