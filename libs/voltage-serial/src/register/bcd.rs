//! Packed BCD helpers
//!
//! A packed BCD value keeps one decimal digit per nibble, most significant
//! byte first on the wire. `0x1234` read as BCD16 is decimal 1234.

/// Decode `size` bytes of packed BCD, least significant byte first
pub fn packed_bcd_to_int(packed: u64, size: u8) -> u64 {
    let mut result = 0u64;
    let mut exp = 1u64;
    for i in 0..u32::from(size) {
        let byte = (packed >> (i * 8)) as u8;
        result += u64::from(byte & 0x0F) * exp;
        exp *= 10;
        result += u64::from(byte >> 4) * exp;
        exp *= 10;
    }
    result
}

/// Encode the lowest `2 * size` decimal digits of `value` as packed BCD
pub fn int_to_packed_bcd(mut value: u64, size: u8) -> u64 {
    let mut packed = 0u64;
    for i in 0..u32::from(size) {
        let mut byte = (value % 10) as u8;
        value /= 10;
        byte |= ((value % 10) as u8) << 4;
        value /= 10;
        packed |= u64::from(byte) << (i * 8);
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        assert_eq!(packed_bcd_to_int(0x1234, 2), 1234);
        assert_eq!(packed_bcd_to_int(0x99, 1), 99);
        assert_eq!(packed_bcd_to_int(0x0012_3456, 4), 123_456);
    }

    #[test]
    fn test_encode() {
        assert_eq!(int_to_packed_bcd(1234, 2), 0x1234);
        assert_eq!(int_to_packed_bcd(7, 1), 0x07);
        assert_eq!(int_to_packed_bcd(123_456, 3), 0x12_3456);
        // digits beyond the width are dropped
        assert_eq!(int_to_packed_bcd(12_345, 2), 0x2345);
    }
}
