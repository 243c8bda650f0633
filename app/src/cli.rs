use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sip_core::SipUri;

use crate::settings::{AccountConfig, EngineConfig, RegistrationPolicy, Settings, HANGUP_GRACE};

const EXAMPLES: &str = "Examples:
  caller -s test.wav -i sip:120@sipserver -r sip:sipserver \\
        --proxy=sip:sipserver --realm='*' -u 120 \\
        -p test -d sip:103@sipserver";

/// Place one SIP call, play a WAV message into it, then hang up.
#[derive(Debug, Parser)]
#[command(name = "caller", version, after_help = EXAMPLES)]
pub struct Cli {
    /// The message to play.
    #[arg(short = 's', long = "sound", value_name = "WAV_FILE")]
    pub sound: PathBuf,

    /// The SIP URI the call originates from.
    #[arg(short = 'i', long = "id", value_name = "URI", value_parser = sip_uri)]
    pub id: String,

    /// The SIP URI where to register.
    #[arg(short = 'r', long = "reg_uri", value_name = "URI", value_parser = sip_uri)]
    pub reg_uri: String,

    /// The SIP URI of the proxy.
    #[arg(long = "proxy", value_name = "URI", value_parser = sip_uri)]
    pub proxy: Option<String>,

    /// The authentication realm (`*` answers any).
    #[arg(long = "realm", value_name = "REALM", default_value = "*")]
    pub realm: String,

    /// The SIP user to authenticate with.
    #[arg(short = 'u', long = "user", value_name = "USER")]
    pub user: String,

    /// The password to authenticate with.
    #[arg(short = 'p', long = "pw", value_name = "PASSWORD")]
    pub pw: String,

    /// The SIP URI to call.
    #[arg(short = 'd', long = "dst_uri", value_name = "URI", value_parser = sip_uri)]
    pub dst_uri: String,

    /// Protocol log verbosity, 0 (off) to 5 (trace).
    #[arg(long = "loglevel", value_name = "LEVEL", default_value_t = 0)]
    pub loglevel: u8,

    /// Give up on any single wait after this many seconds.
    #[arg(long = "timeout", value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Exit with an error if the first registration attempt fails.
    #[arg(long = "require-registration")]
    pub require_registration: bool,

    /// Local SIP port (0 = ephemeral).
    #[arg(long = "local-port", value_name = "PORT", default_value_t = 0)]
    pub local_port: u16,
}

fn sip_uri(value: &str) -> Result<String, String> {
    SipUri::parse(value)
        .map(|_| value.trim().to_string())
        .map_err(|e| e.to_string())
}

pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::try_parse_from(args)
}

impl From<Cli> for Settings {
    fn from(cli: Cli) -> Self {
        Settings {
            sound: cli.sound,
            destination: cli.dst_uri,
            account: AccountConfig {
                id_uri: cli.id,
                registrar_uri: cli.reg_uri,
                proxy: cli.proxy,
                realm: cli.realm,
                user: cli.user,
                password: cli.pw,
            },
            engine: EngineConfig {
                local_port: cli.local_port,
                ..EngineConfig::default()
            },
            log_level: cli.loglevel,
            wait_timeout: cli.timeout.map(Duration::from_secs),
            registration: if cli.require_registration {
                RegistrationPolicy::Require
            } else {
                RegistrationPolicy::Proceed
            },
            hangup_grace: HANGUP_GRACE,
        }
    }
}
