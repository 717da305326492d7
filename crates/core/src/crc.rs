use crc::{Crc, CRC_16_KERMIT, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

/// 802.15.4 FCS: CRC-16/ITU-T, reflected, init 0, no final xor.
pub const FCS16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);
/// CRC-32/IEEE 802.3.
pub const FCS32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc16(data: &[u8]) -> u16 {
    FCS16.checksum(data)
}

pub fn crc32(data: &[u8]) -> u32 {
    FCS32.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrcKind {
    #[default]
    Crc16,
    Crc32,
}

impl CrcKind {
    pub fn len(self) -> usize {
        match self {
            CrcKind::Crc16 => 2,
            CrcKind::Crc32 => 4,
        }
    }

    pub fn compute(self, data: &[u8]) -> u32 {
        match self {
            CrcKind::Crc16 => crc16(data) as u32,
            CrcKind::Crc32 => crc32(data),
        }
    }

    /// Appends the checksum of `buf` to `buf`, little-endian.
    pub fn append(self, buf: &mut Vec<u8>) {
        let crc = self.compute(buf);
        buf.extend_from_slice(&crc.to_le_bytes()[..self.len()]);
    }

    /// Checks a `data || fcs` buffer. Returns the received FCS when it matches.
    pub fn verify(self, psdu: &[u8]) -> Option<u32> {
        let n = self.len();
        if psdu.len() < n {
            return None;
        }
        let (data, fcs) = psdu.split_at(psdu.len() - n);
        let mut raw = [0u8; 4];
        raw[..n].copy_from_slice(fcs);
        let received = u32::from_le_bytes(raw);
        (received == self.compute(data)).then_some(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x2189);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_crc16_residue_is_zero() {
        let mut frame = vec![0x41, 0x88, 0x01, 0x34, 0x12, 0xff, 0xff, 0x01, 0x00, 0xde, 0xad];
        CrcKind::Crc16.append(&mut frame);
        assert_eq!(crc16(&frame), 0);
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_verify_detects_single_bit_flip() {
        for kind in [CrcKind::Crc16, CrcKind::Crc32] {
            let mut psdu = b"hello radio".to_vec();
            kind.append(&mut psdu);
            assert!(kind.verify(&psdu).is_some());
            for bit in 0..psdu.len() * 8 {
                let mut corrupted = psdu.clone();
                corrupted[bit / 8] ^= 1 << (bit % 8);
                assert!(kind.verify(&corrupted).is_none(), "{kind:?} missed flip at bit {bit}");
            }
        }
    }

    #[test]
    fn test_verify_short_buffer() {
        assert!(CrcKind::Crc32.verify(&[1, 2, 3]).is_none());
        assert_eq!(CrcKind::Crc16.verify(&[0, 0]), Some(0));
    }
}
