use core::fmt;

use crate::{Result, SipError};

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_SIPS_PORT: u16 = 5061;

/// The parts of a `sip:`/`sips:` URI this stack cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn parse(input: &str) -> Result<Self> {
        let input = if input.contains('<') { name_addr_uri(input) } else { input.trim() };
        let (secure, rest) = if let Some(rest) = strip_scheme(input, "sips:") {
            (true, rest)
        } else if let Some(rest) = strip_scheme(input, "sip:") {
            (false, rest)
        } else {
            return Err(SipError::InvalidUri(input.to_string()));
        };

        // Headers (`?a=b`) are not used by this stack.
        let rest = rest.split('?').next().unwrap_or(rest);
        let mut segments = rest.split(';');
        let addr = segments.next().unwrap_or("");

        let (user, hostport) = match addr.rsplit_once('@') {
            Some((userinfo, hostport)) => {
                let user = userinfo.split(':').next().unwrap_or(userinfo);
                (Some(user.to_string()), hostport)
            }
            None => (None, addr),
        };

        let (host, port) = split_host_port(hostport)
            .ok_or_else(|| SipError::InvalidUri(input.to_string()))?;
        if host.is_empty() {
            return Err(SipError::InvalidUri(input.to_string()));
        }

        let params = segments
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        Ok(Self {
            secure,
            user: user.filter(|u| !u.is_empty()),
            host: host.to_string(),
            port,
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn is_loose_router(&self) -> bool {
        self.param("lr").is_some()
    }

    /// Host and port to send to, honouring `maddr` and the scheme default port.
    pub fn host_port(&self) -> (String, u16) {
        let host = match self.param("maddr") {
            Some(Some(maddr)) => maddr.to_string(),
            _ => self.host.trim_start_matches('[').trim_end_matches(']').to_string(),
        };
        let default = if self.secure { DEFAULT_SIPS_PORT } else { DEFAULT_SIP_PORT };
        (host, self.port.unwrap_or(default))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for (k, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{k}={v}")?,
                None => write!(f, ";{k}")?,
            }
        }
        Ok(())
    }
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    match input.get(..scheme.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(scheme) => input.get(scheme.len()..),
        _ => None,
    }
}

fn split_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if hostport.starts_with('[') {
        let end = hostport.find(']')?;
        let host = &hostport[..=end];
        let rest = &hostport[end + 1..];
        let port = match rest.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if rest.is_empty() => None,
            None => return None,
        };
        return Some((host, port));
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((hostport, None)),
    }
}

/// Extract the URI out of a `name-addr` / `addr-spec` header value.
///
/// `"Bob" <sip:bob@host>;tag=1` and `sip:bob@host;tag=1` both yield the URI
/// without the header parameters (for the bare form, everything after the
/// first `;` is treated as header parameters, as RFC 3261 mandates).
pub fn name_addr_uri(value: &str) -> &str {
    let value = value.trim();
    if let Some(start) = value.find('<') {
        let rest = &value[start + 1..];
        let end = rest.find('>').unwrap_or(rest.len());
        return rest[..end].trim();
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// Look up a header parameter (the part after the URI) such as `tag` or `expires`.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.find('<') {
        Some(start) => {
            let rest = &value[start..];
            let end = rest.find('>')?;
            &rest[end + 1..]
        }
        None => match value.find(';') {
            Some(pos) => &value[pos..],
            None => return None,
        },
    };
    params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .find_map(|p| {
            let (k, v) = p.split_once('=').unwrap_or((p, ""));
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = SipUri::parse("sip:120:secret@sip.example.com:5070;transport=udp;lr").unwrap();
        assert_eq!(uri.user.as_deref(), Some("120"));
        assert_eq!(uri.host, "sip.example.com");
        assert_eq!(uri.port, Some(5070));
        assert!(uri.is_loose_router());
        assert_eq!(uri.param("transport"), Some(Some("udp")));
        assert_eq!(uri.host_port(), ("sip.example.com".to_string(), 5070));
    }

    #[test]
    fn defaults_port_and_handles_ipv6() {
        let uri = SipUri::parse("sip:[2001:db8::1]").unwrap();
        assert_eq!(uri.host_port(), ("2001:db8::1".to_string(), DEFAULT_SIP_PORT));
        let uri = SipUri::parse("sips:[2001:db8::1]:5071").unwrap();
        assert_eq!(uri.host_port(), ("2001:db8::1".to_string(), 5071));
    }

    #[test]
    fn rejects_non_sip() {
        assert!(SipUri::parse("tel:+123").is_err());
        assert!(SipUri::parse("sip:").is_err());
        assert!(SipUri::parse("sip:host:notaport").is_err());
    }

    #[test]
    fn rejects_non_ascii_scheme_without_panicking() {
        assert!(SipUri::parse("s\u{e9}\u{e9}x@host").is_err());
        assert!(SipUri::parse("<s\u{e9}\u{e9}x@10.0.0.1>").is_err());
        assert!(SipUri::parse("\u{e9}").is_err());
        let uri = SipUri::parse("sip:j\u{f6}rg@example.com").unwrap();
        assert_eq!(uri.user.as_deref(), Some("j\u{f6}rg"));
    }

    #[test]
    fn extracts_name_addr_and_params() {
        let value = r#""Bob" <sip:bob@example.com;transport=udp>;tag=abc123;expires=60"#;
        assert_eq!(name_addr_uri(value), "sip:bob@example.com;transport=udp");
        assert_eq!(header_param(value, "tag"), Some("abc123"));
        assert_eq!(header_param(value, "expires"), Some("60"));
        assert_eq!(header_param("sip:bob@example.com;tag=x", "tag"), Some("x"));
        assert_eq!(header_param("<sip:bob@example.com>", "tag"), None);
    }

    #[test]
    fn display_round_trips() {
        let raw = "sip:alice@10.0.0.1:5062;lr";
        assert_eq!(SipUri::parse(raw).unwrap().to_string(), raw);
    }
}
