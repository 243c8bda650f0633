use heapless::Vec;

use crate::{codecs::Codec, error::AudioError, SAMPLES_PER_FRAME};

pub const RTP_HEADER_LEN: usize = 12;
/// Largest datagram [`RtpPacket::pack`] produces.
pub const MAX_PACKET_LEN: usize = 524;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
        }
    }
}

impl RtpHeader {
    fn write(&self, out: &mut Vec<u8, MAX_PACKET_LEN>) -> Result<(), AudioError> {
        let b0 = (self.version & 0b11) << 6
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0f);
        let b1 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        out.extend_from_slice(&[b0, b1])
            .map_err(|_| AudioError::BufferFull)?;
        out.extend_from_slice(&self.sequence_number.to_be_bytes())
            .map_err(|_| AudioError::BufferFull)?;
        out.extend_from_slice(&self.timestamp.to_be_bytes())
            .map_err(|_| AudioError::BufferFull)?;
        out.extend_from_slice(&self.ssrc.to_be_bytes())
            .map_err(|_| AudioError::BufferFull)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<const N: usize> {
    pub header: RtpHeader,
    pub payload: Vec<u8, N>,
}

impl<const N: usize> RtpPacket<N> {
    pub fn new(header: RtpHeader, payload: Vec<u8, N>) -> Self {
        Self { header, payload }
    }

    /// Serialize without CSRCs or extension; those flags are cleared on the wire.
    pub fn pack(&self) -> Result<Vec<u8, MAX_PACKET_LEN>, AudioError> {
        let mut out = Vec::new();
        let header = RtpHeader {
            csrc_count: 0,
            extension: false,
            padding: false,
            ..self.header
        };
        header.write(&mut out)?;
        for &b in &self.payload {
            out.push(b)?;
        }
        Ok(out)
    }

    /// Parse a datagram, skipping CSRCs, header extension and padding.
    pub fn unpack(bytes: &[u8]) -> Result<Self, AudioError> {
        if bytes.len() < RTP_HEADER_LEN {
            return Err(AudioError::InvalidPacket);
        }

        let b0 = bytes[0];
        let b1 = bytes[1];
        let header = RtpHeader {
            version: b0 >> 6,
            padding: (b0 & 0x20) != 0,
            extension: (b0 & 0x10) != 0,
            csrc_count: b0 & 0x0f,
            marker: (b1 & 0x80) != 0,
            payload_type: b1 & 0x7f,
            sequence_number: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        };
        if header.version != 2 {
            return Err(AudioError::UnsupportedVersion(header.version));
        }

        let mut start = RTP_HEADER_LEN + 4 * header.csrc_count as usize;
        if header.extension {
            let ext = bytes.get(start..start + 4).ok_or(AudioError::InvalidPacket)?;
            let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
            start += 4 + 4 * words;
        }
        let mut end = bytes.len();
        if header.padding {
            let pad = *bytes.last().ok_or(AudioError::InvalidPacket)? as usize;
            end = end.checked_sub(pad).ok_or(AudioError::InvalidPacket)?;
        }
        let body = bytes.get(start..end).ok_or(AudioError::InvalidPacket)?;

        let mut payload: Vec<u8, N> = Vec::new();
        for &b in body {
            payload.push(b)?;
        }

        Ok(Self { header, payload })
    }
}

/// Turns 20 ms PCM frames into consecutive RTP packets of one stream.
#[derive(Debug, Clone)]
pub struct Packetizer {
    codec: Codec,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    first: bool,
}

impl Packetizer {
    pub fn new(codec: Codec, ssrc: u32, initial_sequence: u16, initial_timestamp: u32) -> Self {
        Self {
            codec,
            ssrc,
            sequence: initial_sequence,
            timestamp: initial_timestamp,
            first: true,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Encode one frame. Short frames are padded with silence.
    pub fn packetize(&mut self, frame: &[i16]) -> Result<Vec<u8, MAX_PACKET_LEN>, AudioError> {
        let mut pcm = [0i16; SAMPLES_PER_FRAME];
        let n = frame.len().min(SAMPLES_PER_FRAME);
        pcm[..n].copy_from_slice(&frame[..n]);

        let header = RtpHeader {
            marker: self.first,
            payload_type: self.codec.payload_type(),
            sequence_number: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            ..RtpHeader::default()
        };
        let packet: RtpPacket<SAMPLES_PER_FRAME> = RtpPacket::new(
            header,
            Vec::from_slice(&self.codec.encode(&pcm)).map_err(|_| AudioError::BufferFull)?,
        );

        self.first = false;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);
        packet.pack()
    }
}
