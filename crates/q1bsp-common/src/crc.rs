// crc.rs — 16-bit CCITT CRC used to key external entity files
//
// Delegates to the `crc` crate (CRC-16/IBM-3740 == CRC-16/CCITT-FALSE).

use crc::{Crc, CRC_16_IBM_3740};

const CRC_CALC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

#[inline]
pub fn crc_init() -> u16 {
    0xffff
}

/// Process a single byte into a running CRC.
#[inline]
pub fn crc_process_byte(crc: u16, data: u8) -> u16 {
    let mut digest = CRC_CALC.digest_with_initial(crc);
    digest.update(&[data]);
    digest.finalize()
}

/// Compute the CRC for an entire block of data.
pub fn crc_block(data: &[u8]) -> u16 {
    CRC_CALC.checksum(data)
}

/// CRC of an entity lump as used in `maps/<map>@<crc>.ent` names. The
/// trailing NUL terminator of the lump is not part of the checksum.
pub fn entity_lump_crc(lump: &[u8]) -> u16 {
    let len = lump.len().saturating_sub(1);
    crc_block(&lump[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_empty() {
        assert_eq!(crc_block(&[]), crc_init());
    }

    #[test]
    fn test_crc_check_value() {
        // CRC-16/CCITT-FALSE check value
        assert_eq!(crc_block(b"123456789"), 0x29b1);
    }

    #[test]
    fn test_crc_byte_by_byte() {
        let data = b"{\n\"classname\" \"worldspawn\"\n}\n";
        let mut crc = crc_init();
        for &b in data.iter() {
            crc = crc_process_byte(crc, b);
        }
        assert_eq!(crc, crc_block(data));
    }

    #[test]
    fn test_entity_lump_crc_skips_terminator() {
        let mut lump = b"{ }".to_vec();
        let plain = crc_block(&lump);
        lump.push(0);
        assert_eq!(entity_lump_crc(&lump), plain);
        assert_eq!(entity_lump_crc(&[]), crc_init());
    }
}
