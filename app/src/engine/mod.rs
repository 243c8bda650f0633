//! Boundary between the call logic and the SIP/RTP machinery.
//!
//! The state machines in this crate only see [`Endpoint`] and implement the
//! notification traits. The engine keeps `Weak` references to them and never
//! holds one of its own locks while it calls into them.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::player::PlaybackSource;
use crate::settings::AccountConfig;

pub mod endpoint;
pub mod media;
#[cfg(test)]
pub mod mock;

pub use endpoint::SipEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u32);

/// INVITE session state as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    Null,
    Calling,
    Early,
    Connecting,
    Confirmed,
    Disconnected,
}

impl InviteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteState::Null => "NULL",
            InviteState::Calling => "CALLING",
            InviteState::Early => "EARLY",
            InviteState::Connecting => "CONNECTING",
            InviteState::Confirmed => "CONFIRMED",
            InviteState::Disconnected => "DISCONNCTD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: CallId,
    pub remote_uri: String,
    pub state: InviteState,
    pub state_text: String,
    pub last_status: u16,
    pub last_reason: String,
}

impl CallInfo {
    pub fn new(id: CallId, remote_uri: &str, state: InviteState, last_status: u16, last_reason: &str) -> Self {
        Self {
            id,
            remote_uri: remote_uri.to_string(),
            state,
            state_text: state.as_str().to_string(),
            last_status,
            last_reason: last_reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub audio_count: u32,
    pub video_count: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            audio_count: 1,
            video_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    Accept,
    Reject,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("engine not started")]
    NotStarted,
    #[error("unknown account")]
    UnknownAccount,
    #[error("unsupported media: {0}")]
    UnsupportedMedia(&'static str),
    #[error(transparent)]
    Sip(#[from] sip_core::SipError),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("engine is shutting down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no active audio media")]
    NotActive,
    #[error("audio media is already transmitting")]
    Busy,
    #[error("media i/o error: {0}")]
    Io(#[from] io::Error),
}

pub trait AccountEvents: Send + Sync {
    fn on_reg_state(&self, code: u16, reason: &str, active: bool);
}

pub trait CallEvents: Send + Sync {
    fn on_call_state(&self, info: &CallInfo);
    /// Media was (re)negotiated. Fetch it with [`Endpoint::audio_media`].
    fn on_media_state(&self, call: CallId);
    fn on_redirected(&self, target: &str) -> RedirectOp;
}

/// Where a playback source is transmitted to.
pub trait AudioSink: Send + Sync {
    /// Take ownership of `source` and start sending it. On error the source
    /// has already been dropped.
    fn start_transmit(&self, source: PlaybackSource) -> Result<(), MediaError>;
    /// Stop transmitting; the current source is dropped before this returns.
    fn stop_transmit(&self);
}

pub trait Endpoint: Send + Sync {
    fn create_transport(&self, local_port: u16) -> Result<SocketAddr, EngineError>;
    fn start(&self) -> Result<(), EngineError>;
    /// Unregister what is left and stop the worker. Idempotent.
    fn shutdown(&self);

    fn add_account(&self, config: &AccountConfig, events: Weak<dyn AccountEvents>) -> Result<AccountId, EngineError>;
    fn remove_account(&self, account: AccountId);

    fn make_call(
        &self,
        account: AccountId,
        destination: &str,
        options: &CallOptions,
        events: Weak<dyn CallEvents>,
    ) -> Result<CallId, EngineError>;
    fn call_info(&self, call: CallId) -> Option<CallInfo>;
    fn audio_media(&self, call: CallId) -> Result<Arc<dyn AudioSink>, MediaError>;
    fn hangup(&self, call: CallId);
    fn hangup_all(&self);
}
