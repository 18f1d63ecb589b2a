//! H.264 bitstream helpers: AVCC (length-prefixed) versus Annex-B (start codes).

pub mod errors;

use {
    bytes::{BufMut, Bytes, BytesMut},
    errors::{H264Error, H264ErrorValue},
};

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const AUD_NAL: [u8; 2] = [0x09, 0xF0];

#[must_use]
pub fn nal_unit_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

#[must_use]
pub fn is_annex_b(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&START_CODE)
}

/// Split an Annex-B buffer into NAL units (start codes stripped).
#[must_use]
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                let mut end = i;
                while end > s && data[end - 1] == 0 {
                    end -= 1;
                }
                if end > s {
                    nals.push(&data[s..end]);
                }
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        if s < data.len() {
            nals.push(&data[s..]);
        }
    }
    nals
}

/// Split a length-prefixed buffer into NAL units.
pub fn split_avcc(data: &[u8], length_size: u8) -> Result<Vec<&[u8]>, H264Error> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(H264ErrorValue::UnsupportedLengthSize(length_size).into());
    }
    let length_size = usize::from(length_size);
    let mut nals = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + length_size > data.len() {
            return Err(H264ErrorValue::TruncatedNal {
                length: length_size,
                remaining: data.len() - offset,
            }
            .into());
        }
        let length = data[offset..offset + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        offset += length_size;
        if length > data.len() - offset {
            return Err(H264ErrorValue::TruncatedNal {
                length,
                remaining: data.len() - offset,
            }
            .into());
        }
        nals.push(&data[offset..offset + length]);
        offset += length;
    }
    Ok(nals)
}

/// Convert an Annex-B access unit to 4-byte length-prefixed form.
#[must_use]
pub fn annex_b_to_avcc(data: &[u8]) -> BytesMut {
    let nals = split_annex_b(data);
    let mut out = BytesMut::with_capacity(data.len() + nals.len() * 4);
    for nal in nals {
        out.put_u32(nal.len() as u32);
        out.put_slice(nal);
    }
    out
}

/// Parsed `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 5.2.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    pub length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfig {
    pub fn parse(record: &[u8]) -> Result<Self, H264Error> {
        let invalid = |why| H264Error::from(H264ErrorValue::InvalidDecoderConfig(why));
        if record.len() < 7 {
            return Err(invalid("record too short"));
        }
        if record[0] != 1 {
            return Err(invalid("configuration version is not 1"));
        }

        let length_size = (record[4] & 0x03) + 1;
        let mut offset = 5;
        let read_sets = |count: usize, offset: &mut usize| -> Result<Vec<Bytes>, H264Error> {
            let mut sets = Vec::with_capacity(count);
            for _ in 0..count {
                let header = record
                    .get(*offset..*offset + 2)
                    .ok_or_else(|| invalid("parameter set length truncated"))?;
                let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
                *offset += 2;
                let set = record
                    .get(*offset..*offset + len)
                    .ok_or_else(|| invalid("parameter set truncated"))?;
                sets.push(Bytes::copy_from_slice(set));
                *offset += len;
            }
            Ok(sets)
        };

        let sps_count = usize::from(record[5] & 0x1F);
        offset += 1;
        let sps = read_sets(sps_count, &mut offset)?;
        let pps_count = usize::from(
            *record
                .get(offset)
                .ok_or_else(|| invalid("pps count missing"))?,
        );
        offset += 1;
        let pps = read_sets(pps_count, &mut offset)?;

        if sps.is_empty() {
            return Err(invalid("no sequence parameter set"));
        }

        Ok(Self {
            profile_idc: record[1],
            profile_compatibility: record[2],
            level_idc: record[3],
            length_size,
            sps,
            pps,
        })
    }

    /// Build an avcC record from raw parameter sets.
    pub fn from_parameter_sets(sps: &[u8], pps: &[u8]) -> Result<Self, H264Error> {
        if sps.len() < 4 {
            return Err(H264ErrorValue::InvalidDecoderConfig("sps too short").into());
        }
        Ok(Self {
            profile_idc: sps[1],
            profile_compatibility: sps[2],
            level_idc: sps[3],
            length_size: 4,
            sps: vec![Bytes::copy_from_slice(sps)],
            pps: vec![Bytes::copy_from_slice(pps)],
        })
    }

    #[must_use]
    pub fn to_record(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(1);
        out.put_u8(self.profile_idc);
        out.put_u8(self.profile_compatibility);
        out.put_u8(self.level_idc);
        out.put_u8(0xFC | (self.length_size - 1));
        out.put_u8(0xE0 | self.sps.len() as u8);
        for sps in &self.sps {
            out.put_u16(sps.len() as u16);
            out.put_slice(sps);
        }
        out.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            out.put_u16(pps.len() as u16);
            out.put_slice(pps);
        }
        out.freeze()
    }

    /// Codec string for playlists and logs, e.g. `avc1.64001f`.
    #[must_use]
    pub fn rfc6381_codec(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.profile_compatibility, self.level_idc
        )
    }
}

/// Build an Annex-B access unit suitable for MPEG-TS.
///
/// Accepts either Annex-B or length-prefixed input. An access unit delimiter
/// is prepended, and SPS/PPS from `config` are inserted ahead of key frames
/// that do not already carry them in band.
pub fn to_annex_b_access_unit(
    data: &[u8],
    config: Option<&AvcDecoderConfig>,
    key: bool,
) -> Result<BytesMut, H264Error> {
    let nals = if is_annex_b(data) {
        split_annex_b(data)
    } else {
        split_avcc(data, config.map_or(4, |c| c.length_size))?
    };

    let mut out = BytesMut::with_capacity(data.len() + 64);
    out.put_slice(&START_CODE);
    out.put_slice(&AUD_NAL);

    let has_sps = nals.iter().any(|n| nal_unit_type(n) == Some(NAL_SPS));
    if key && !has_sps {
        if let Some(config) = config {
            for set in config.sps.iter().chain(config.pps.iter()) {
                out.put_slice(&START_CODE);
                out.put_slice(set);
            }
        }
    }

    for nal in nals {
        if nal_unit_type(nal) == Some(NAL_AUD) {
            continue;
        }
        out.put_slice(&START_CODE);
        out.put_slice(nal);
    }
    Ok(out)
}

/// True when the access unit contains an IDR slice.
#[must_use]
pub fn contains_idr(data: &[u8], length_size: u8) -> bool {
    let nals = if is_annex_b(data) {
        split_annex_b(data)
    } else {
        split_avcc(data, length_size).unwrap_or_default()
    };
    nals.iter().any(|n| nal_unit_type(n) == Some(NAL_IDR))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 6] = [0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
    const PPS: [u8; 4] = [0x68, 0xEB, 0xE3, 0xCB];

    fn record() -> Bytes {
        AvcDecoderConfig::from_parameter_sets(&SPS, &PPS)
            .unwrap()
            .to_record()
    }

    #[test]
    fn test_parse_decoder_config() {
        let config = AvcDecoderConfig::parse(&record()).unwrap();
        assert_eq!(config.length_size, 4);
        assert_eq!(&config.sps[0][..], &SPS);
        assert_eq!(&config.pps[0][..], &PPS);
        assert_eq!(config.rfc6381_codec(), "avc1.64001f");
    }

    #[test]
    fn test_parse_rejects_truncated_record() {
        let record = record();
        assert!(AvcDecoderConfig::parse(&record[..record.len() - 2]).is_err());
        assert!(AvcDecoderConfig::parse(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_split_annex_b_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4, 5];
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![&[0x67u8, 1, 2][..], &[0x68u8, 3][..], &[0x65u8, 4, 5][..]]);
    }

    #[test]
    fn test_split_avcc_truncated() {
        assert!(split_avcc(&[0, 0, 0, 5, 1, 2], 4).is_err());
        assert!(split_avcc(&[0, 0, 0, 2, 1, 2], 3).is_err());
        assert_eq!(split_avcc(&[0, 2, 1, 2, 0, 1, 9], 2).unwrap(), vec![&[1u8, 2][..], &[9u8][..]]);
    }

    #[test]
    fn test_annex_b_to_avcc() {
        let avcc = annex_b_to_avcc(&[0, 0, 1, 0x65, 7, 7, 0, 0, 1, 0x06, 1]);
        assert_eq!(&avcc[..], &[0, 0, 0, 3, 0x65, 7, 7, 0, 0, 0, 2, 0x06, 1]);
    }

    #[test]
    fn test_key_frame_gets_parameter_sets() {
        let config = AvcDecoderConfig::parse(&record()).unwrap();
        let avcc = [0, 0, 0, 3, 0x65, 0x88, 0x84];
        let au = to_annex_b_access_unit(&avcc, Some(&config), true).unwrap();
        let nals = split_annex_b(&au);
        let types: Vec<_> = nals.iter().filter_map(|n| nal_unit_type(n)).collect();
        assert_eq!(types, vec![NAL_AUD, NAL_SPS, NAL_PPS, NAL_IDR]);
        assert!(contains_idr(&avcc, 4));
    }

    #[test]
    fn test_delta_frame_has_no_parameter_sets() {
        let config = AvcDecoderConfig::parse(&record()).unwrap();
        let au = to_annex_b_access_unit(&[0, 0, 0, 2, 0x41, 0x9A], Some(&config), false).unwrap();
        let types: Vec<_> = split_annex_b(&au)
            .iter()
            .filter_map(|n| nal_unit_type(n))
            .collect();
        assert_eq!(types, vec![NAL_AUD, NAL_SLICE]);
        assert!(!contains_idr(&[0, 0, 0, 2, 0x41, 0x9A], 4));
    }
}
