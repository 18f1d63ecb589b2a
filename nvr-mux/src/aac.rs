//! AAC `AudioSpecificConfig` parsing and ADTS framing for MPEG-TS.

use bytes::{BufMut, BytesMut};

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];
const ADTS_HEADER_LEN: usize = 7;
const MAX_ADTS_FRAME_LEN: usize = 0x1FFF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AacError {
    #[error("audio specific config too short")]
    ConfigTooShort,
    #[error("explicit sampling frequency is not supported")]
    ExplicitFrequency,
    #[error("frame of {0} bytes does not fit an ADTS header")]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sampling_index: u8,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self, AacError> {
        if data.len() < 2 {
            return Err(AacError::ConfigTooShort);
        }
        let object_type = data[0] >> 3;
        let sampling_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        if sampling_index == 0x0F {
            return Err(AacError::ExplicitFrequency);
        }
        let channel_config = (data[1] >> 3) & 0x0F;
        Ok(Self {
            object_type,
            sampling_index,
            channel_config,
        })
    }

    #[must_use]
    pub fn sample_rate(&self) -> Option<u32> {
        SAMPLE_RATES.get(usize::from(self.sampling_index)).copied()
    }

    /// Prefix a raw AAC frame with an ADTS header.
    pub fn to_adts(&self, frame: &[u8]) -> Result<BytesMut, AacError> {
        let total = frame.len() + ADTS_HEADER_LEN;
        if total > MAX_ADTS_FRAME_LEN {
            return Err(AacError::FrameTooLarge(frame.len()));
        }
        // ADTS carries profile as object type minus one (2 bits).
        let profile = self.object_type.saturating_sub(1) & 0x03;
        let total = total as u16;

        let mut out = BytesMut::with_capacity(usize::from(total));
        out.put_u8(0xFF);
        // MPEG-4, layer 0, no CRC
        out.put_u8(0xF1);
        out.put_u8((profile << 6) | ((self.sampling_index & 0x0F) << 2) | ((self.channel_config >> 2) & 0x01));
        out.put_u8(((self.channel_config & 0x03) << 6) | ((total >> 11) as u8 & 0x03));
        out.put_u8((total >> 3) as u8);
        out.put_u8((((total & 0x07) as u8) << 5) | 0x1F);
        out.put_u8(0xFC);
        out.put_slice(frame);
        Ok(out)
    }
}

/// True when `data` already starts with an ADTS sync word.
#[must_use]
pub fn is_adts(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lc_48k_stereo() {
        // AAC-LC, 48 kHz, 2 channels
        let config = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
        assert_eq!(config.object_type, 2);
        assert_eq!(config.sampling_index, 3);
        assert_eq!(config.channel_config, 2);
        assert_eq!(config.sample_rate(), Some(48000));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(AudioSpecificConfig::parse(&[0x11]), Err(AacError::ConfigTooShort));
        assert_eq!(
            AudioSpecificConfig::parse(&[0x17, 0x80]),
            Err(AacError::ExplicitFrequency)
        );
    }

    #[test]
    fn test_adts_header() {
        let config = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
        let frame = config.to_adts(&[0xAA; 100]).unwrap();
        assert_eq!(frame.len(), 107);
        assert!(is_adts(&frame));
        assert_eq!(frame[2] >> 6, 1);
        assert_eq!((frame[2] >> 2) & 0x0F, 3);
        let length = (usize::from(frame[3] & 0x03) << 11)
            | (usize::from(frame[4]) << 3)
            | usize::from(frame[5] >> 5);
        assert_eq!(length, 107);
        assert_eq!(&frame[7..], &[0xAA; 100]);
    }

    #[test]
    fn test_oversized_frame() {
        let config = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
        assert!(config.to_adts(&vec![0; 9000]).is_err());
    }
}
