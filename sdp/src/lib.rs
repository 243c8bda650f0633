//! Just enough SDP (RFC 4566) for one audio stream offered over RTP/AVP.

use core::fmt::Write;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Static payload types we offer, in preference order.
pub const OFFERED_PAYLOAD_TYPES: [(u8, &str); 2] = [(0, "PCMU"), (8, "PCMA")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn from_attribute(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    /// Direction as seen from the other side.
    pub fn reversed(self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: u64,
    pub session_version: u64,
    pub origin_address: String,
    pub connection_address: String,
    pub media_port: u16,
    pub payload_types: Vec<u8>,
    pub direction: Direction,
    pub ptime: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("invalid SDP: {0}")]
    Invalid(String),
    #[error("missing SDP field: {0}")]
    MissingField(&'static str),
    #[error("no audio stream in SDP")]
    NoAudio,
}

impl SessionDescription {
    /// Offer a send/receive audio stream on `address:port`.
    pub fn offer(address: IpAddr, port: u16, session_id: u64) -> Self {
        Self {
            session_id,
            session_version: session_id,
            origin_address: address.to_string(),
            connection_address: address.to_string(),
            media_port: port,
            payload_types: OFFERED_PAYLOAD_TYPES.iter().map(|(pt, _)| *pt).collect(),
            direction: Direction::SendRecv,
            ptime: Some(20),
        }
    }

    pub fn render(&self) -> String {
        let addr_type = |a: &str| if a.contains(':') { "IP6" } else { "IP4" };
        let mut out = String::with_capacity(256);
        let _ = write!(out, "v=0\r\n");
        let _ = write!(
            out,
            "o=- {} {} IN {} {}\r\n",
            self.session_id,
            self.session_version,
            addr_type(&self.origin_address),
            self.origin_address
        );
        let _ = write!(out, "s=caller\r\n");
        let _ = write!(
            out,
            "c=IN {} {}\r\n",
            addr_type(&self.connection_address),
            self.connection_address
        );
        let _ = write!(out, "t=0 0\r\n");
        let _ = write!(out, "m=audio {} RTP/AVP", self.media_port);
        for pt in &self.payload_types {
            let _ = write!(out, " {pt}");
        }
        out.push_str("\r\n");
        for pt in &self.payload_types {
            if let Some((_, name)) = OFFERED_PAYLOAD_TYPES.iter().find(|(p, _)| p == pt) {
                let _ = write!(out, "a=rtpmap:{pt} {name}/8000\r\n");
            }
        }
        if let Some(ptime) = self.ptime {
            let _ = write!(out, "a=ptime:{ptime}\r\n");
        }
        let _ = write!(out, "a={}\r\n", self.direction.as_str());
        out
    }

    /// Where to send RTP, or `None` when the stream is disabled or on hold.
    pub fn media_address(&self) -> Option<SocketAddr> {
        if self.media_port == 0 {
            return None;
        }
        let ip: IpAddr = self.connection_address.parse().ok()?;
        if ip.is_unspecified() {
            return None;
        }
        Some(SocketAddr::new(ip, self.media_port))
    }

    /// The remote end accepts audio from us.
    pub fn accepts_audio(&self) -> bool {
        matches!(self.direction, Direction::SendRecv | Direction::RecvOnly) && self.media_address().is_some()
    }

    /// First payload type of this description that `ours` also lists.
    pub fn first_common_payload(&self, ours: &[u8]) -> Option<u8> {
        self.payload_types.iter().copied().find(|pt| ours.contains(pt))
    }
}

/// Parse a session description, keeping the first audio stream.
pub fn parse(input: &str) -> Result<SessionDescription, SdpError> {
    let mut session_id = 0;
    let mut session_version = 0;
    let mut origin_address = None;
    let mut session_connection = None;
    let mut media_connection = None;
    let mut session_direction = Direction::SendRecv;
    let mut media_direction = None;
    let mut ptime = None;
    let mut audio: Option<(u16, Vec<u8>)> = None;
    // Inside an m= block; only the first audio one is kept.
    let mut in_media = false;
    let mut in_audio = false;
    let mut saw_version = false;

    for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (kind, value) = line
            .split_once('=')
            .ok_or_else(|| SdpError::Invalid(line.to_string()))?;
        match kind {
            "v" => {
                if value.trim() != "0" {
                    return Err(SdpError::Invalid(format!("version {value}")));
                }
                saw_version = true;
            }
            "o" => {
                let fields: Vec<&str> = value.split_whitespace().collect();
                if fields.len() < 6 {
                    return Err(SdpError::Invalid(line.to_string()));
                }
                session_id = fields[1].parse().unwrap_or(0);
                session_version = fields[2].parse().unwrap_or(0);
                origin_address = Some(fields[5].to_string());
            }
            "c" => {
                let addr = parse_connection(value)?;
                if !in_media {
                    session_connection = Some(addr);
                } else if in_audio {
                    media_connection = Some(addr);
                }
            }
            "m" => {
                in_media = true;
                in_audio = false;
                let mut fields = value.split_whitespace();
                let media = fields.next().unwrap_or("");
                if media != "audio" || audio.is_some() {
                    continue;
                }
                let port = fields
                    .next()
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| SdpError::Invalid(line.to_string()))?;
                let _proto = fields.next();
                let formats = fields.filter_map(|f| f.parse().ok()).collect();
                audio = Some((port, formats));
                in_audio = true;
            }
            "a" => {
                let attr = value.trim();
                if let Some(dir) = Direction::from_attribute(attr) {
                    if !in_media {
                        session_direction = dir;
                    } else if in_audio {
                        media_direction = Some(dir);
                    }
                } else if let Some(p) = attr.strip_prefix("ptime:") {
                    if in_audio {
                        ptime = p.trim().parse().ok();
                    }
                }
            }
            _ => {}
        }
    }

    if !saw_version {
        return Err(SdpError::MissingField("v"));
    }
    let (media_port, payload_types) = audio.ok_or(SdpError::NoAudio)?;
    let connection_address = media_connection
        .or(session_connection)
        .ok_or(SdpError::MissingField("c"))?;

    log::debug!("remote audio at {connection_address}:{media_port}, formats {payload_types:?}");

    Ok(SessionDescription {
        session_id,
        session_version,
        origin_address: origin_address.unwrap_or_else(|| connection_address.clone()),
        connection_address,
        media_port,
        payload_types,
        direction: media_direction.unwrap_or(session_direction),
        ptime,
    })
}

fn parse_connection(value: &str) -> Result<String, SdpError> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    match fields.as_slice() {
        ["IN", "IP4" | "IP6", addr, ..] => {
            // Multicast TTL / count suffixes.
            let addr: &str = addr;
            Ok(addr.split('/').next().unwrap_or(addr).to_string())
        }
        _ => Err(SdpError::Invalid(format!("c={value}"))),
    }
}
