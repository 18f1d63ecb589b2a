// CRC-32/MPEG-2: polynomial 0x04C11DB7, no reflection, no final xor.

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = make_table();

#[must_use]
pub fn gen_crc32(crc: u32, data: &[u8]) -> u32 {
    data.iter().fold(crc, |crc, byte| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ byte) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(gen_crc32(0xffff_ffff, b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_section_with_crc_verifies_to_zero() {
        let mut section = vec![0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00];
        let crc = gen_crc32(0xffff_ffff, &section);
        section.extend_from_slice(&crc.to_be_bytes());
        assert_eq!(gen_crc32(0xffff_ffff, &section), 0);
    }
}
