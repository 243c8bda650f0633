use heapless::Vec;

pub mod alaw;
pub mod ulaw;

/// Largest payload one call to [`Codec::encode`] produces.
pub const FRAME_CAPACITY: usize = 512;

/// Static RTP payload types we can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Pcmu,
    Pcma,
}

impl Codec {
    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(Codec::Pcmu),
            8 => Some(Codec::Pcma),
            _ => None,
        }
    }

    pub fn payload_type(self) -> u8 {
        match self {
            Codec::Pcmu => 0,
            Codec::Pcma => 8,
        }
    }

    pub fn encoding_name(self) -> &'static str {
        match self {
            Codec::Pcmu => "PCMU",
            Codec::Pcma => "PCMA",
        }
    }

    /// Encode up to [`FRAME_CAPACITY`] samples; the rest is dropped.
    pub fn encode(self, samples: &[i16]) -> Vec<u8, FRAME_CAPACITY> {
        let samples = &samples[..samples.len().min(FRAME_CAPACITY)];
        let encode: fn(i16) -> u8 = match self {
            Codec::Pcmu => ulaw::encode_sample,
            Codec::Pcma => alaw::encode_sample,
        };
        samples.iter().map(|&s| encode(s)).collect()
    }

    pub fn decode(self, bytes: &[u8]) -> Vec<i16, FRAME_CAPACITY> {
        let bytes = &bytes[..bytes.len().min(FRAME_CAPACITY)];
        let decode: fn(u8) -> i16 = match self {
            Codec::Pcmu => ulaw::decode_sample,
            Codec::Pcma => alaw::decode_sample,
        };
        bytes.iter().map(|&b| decode(b)).collect()
    }
}
