//! CRC-16 as used by the AF layer and ETI headers
//!
//! Both use CRC-16/GENIBUS: polynomial 0x1021, initial value 0xFFFF, no
//! reflection, final complement.

use crc::{Crc, CRC_16_GENIBUS};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_GENIBUS);

/// Compute the CRC-16/GENIBUS over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genibus_check_value() {
        // Standard check input for CRC-16/GENIBUS
        assert_eq!(crc16(b"123456789"), 0xd64e);
    }

    #[test]
    fn empty_input() {
        // init 0xFFFF complemented
        assert_eq!(crc16(&[]), 0x0000);
    }
}
