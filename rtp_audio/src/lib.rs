//! G.711 codecs and RTP packetization for narrowband (8 kHz) audio.

pub mod codecs;
pub mod error;
pub mod rtp;

pub use codecs::{Codec, FRAME_CAPACITY};
pub use error::AudioError;
pub use rtp::{Packetizer, RtpHeader, RtpPacket, RTP_HEADER_LEN};

/// Sample rate of every codec in this crate.
pub const SAMPLE_RATE: u32 = 8_000;
/// Samples in one 20 ms packet.
pub const SAMPLES_PER_FRAME: usize = 160;
