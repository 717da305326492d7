//! 2.4 GHz O-QPSK spreading: 4-bit symbols to 32-chip PN sequences.

pub const CHIPS_PER_SYMBOL: usize = 32;
pub const CHIPS_PER_BYTE: usize = 2 * CHIPS_PER_SYMBOL;

/// Chip sequence of symbol 0, c0 first.
const SYMBOL_ZERO: &[u8; CHIPS_PER_SYMBOL] = b"11011001110000110101001000101110";

// Symbols 1..=7 rotate symbol 0 right by four chips per step, symbols 8..=15
// repeat 0..=7 with every odd chip inverted.
const fn build_chip_table() -> [u32; 16] {
    let mut table = [0u32; 16];
    let mut symbol = 0;
    while symbol < 16 {
        let shift = 4 * (symbol % 8);
        let mut word = 0u32;
        let mut i = 0;
        while i < CHIPS_PER_SYMBOL {
            let src = (i + CHIPS_PER_SYMBOL - shift) % CHIPS_PER_SYMBOL;
            let mut chip = (SYMBOL_ZERO[src] - b'0') as u32;
            if symbol >= 8 && i % 2 == 1 {
                chip ^= 1;
            }
            word |= chip << i;
            i += 1;
        }
        table[symbol] = word;
        symbol += 1;
    }
    table
}

/// Bit `i` of entry `s` is chip `c_i` of symbol `s`.
pub const CHIP_TABLE: [u32; 16] = build_chip_table();

/// Chip `index` of an on-air byte sequence as a bipolar value. Bytes go out
/// low nibble first.
pub fn chip_at(bytes: &[u8], index: usize) -> f32 {
    let byte = bytes[index / CHIPS_PER_BYTE];
    let nibble = if (index / CHIPS_PER_SYMBOL) % 2 == 0 {
        byte & 0x0F
    } else {
        byte >> 4
    };
    if (CHIP_TABLE[nibble as usize] >> (index % CHIPS_PER_SYMBOL)) & 1 == 1 {
        1.0
    } else {
        -1.0
    }
}

/// Maximum-correlation symbol decision over one symbol of soft chips.
pub fn despread(soft: &[f32]) -> (u8, f32) {
    let mut best = (0u8, f32::MIN);
    for (symbol, &sequence) in CHIP_TABLE.iter().enumerate() {
        let score: f32 = soft
            .iter()
            .take(CHIPS_PER_SYMBOL)
            .enumerate()
            .map(|(i, &s)| if (sequence >> i) & 1 == 1 { s } else { -s })
            .sum();
        if score > best.1 {
            best = (symbol as u8, score);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_chips(s: &str) -> u32 {
        s.bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .enumerate()
            .fold(0, |acc, (i, b)| acc | (((b - b'0') as u32) << i))
    }

    #[test]
    fn test_table_matches_standard_rows() {
        assert_eq!(CHIP_TABLE[0], parse_chips("1101 1001 1100 0011 0101 0010 0010 1110"));
        assert_eq!(CHIP_TABLE[1], parse_chips("1110 1101 1001 1100 0011 0101 0010 0010"));
        assert_eq!(CHIP_TABLE[8], parse_chips("1000 1100 1001 0110 0000 0111 0111 1011"));
        assert_eq!(CHIP_TABLE[15], parse_chips("1100 1001 0110 0000 0111 0111 1011 1000"));
    }

    #[test]
    fn test_sequences_are_well_separated() {
        for a in 0..16 {
            for b in (a + 1)..16 {
                let distance = (CHIP_TABLE[a] ^ CHIP_TABLE[b]).count_ones();
                assert!(distance >= 12, "symbols {a} and {b} differ in {distance} chips");
            }
        }
    }

    #[test]
    fn test_despread_recovers_every_symbol() {
        for symbol in 0..16u8 {
            let byte = [symbol];
            let soft: Vec<f32> = (0..CHIPS_PER_SYMBOL).map(|i| chip_at(&byte, i)).collect();
            let (decided, score) = despread(&soft);
            assert_eq!(decided, symbol);
            assert_eq!(score, CHIPS_PER_SYMBOL as f32);
        }
    }

    #[test]
    fn test_high_nibble_follows_low() {
        let byte = [0xA7];
        let low: Vec<f32> = (0..CHIPS_PER_SYMBOL).map(|i| chip_at(&byte, i)).collect();
        let high: Vec<f32> = (CHIPS_PER_SYMBOL..CHIPS_PER_BYTE).map(|i| chip_at(&byte, i)).collect();
        assert_eq!(despread(&low).0, 0x7);
        assert_eq!(despread(&high).0, 0xA);
    }
}
