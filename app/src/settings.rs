//! Runtime configuration, assembled from the command line.

use std::path::PathBuf;
use std::time::Duration;

/// Pause between hanging up and tearing the account down.
pub const HANGUP_GRACE: Duration = Duration::from_secs(4);
pub const DEFAULT_REGISTRATION_EXPIRES: u32 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub id_uri: String,
    pub registrar_uri: String,
    pub proxy: Option<String>,
    pub realm: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// UDP port for SIP; 0 picks an ephemeral one.
    pub local_port: u16,
    pub registration_expires: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            registration_expires: DEFAULT_REGISTRATION_EXPIRES,
        }
    }
}

/// What to do when the first registration attempt does not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPolicy {
    #[default]
    Proceed,
    Require,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub sound: PathBuf,
    pub destination: String,
    pub account: AccountConfig,
    pub engine: EngineConfig,
    pub log_level: u8,
    /// Upper bound for every blocking wait; `None` waits forever.
    pub wait_timeout: Option<Duration>,
    pub registration: RegistrationPolicy,
    pub hangup_grace: Duration,
}

/// `env_logger` filter for a `--loglevel` value. Our own status lines stay
/// at info; the protocol layers follow the requested level.
pub fn log_filter(level: u8) -> String {
    let protocol = match level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    };
    format!("info,sip_core={protocol},sdp={protocol},rtp_audio={protocol},caller::engine={protocol}")
}
