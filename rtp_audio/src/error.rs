use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("invalid packet")]
    InvalidPacket,
    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),
    #[error("buffer full")]
    BufferFull,
}

// heapless::Vec::push hands the rejected element back.
impl From<u8> for AudioError {
    fn from(_: u8) -> Self {
        AudioError::BufferFull
    }
}
