use core::fmt::Write;

use crate::{
    auth::{parse_challenge, DigestChallenge},
    message::{header_value, header_values, Header, Method, Request, Response},
    stack::LocalContact,
    uri::{header_param, name_addr_uri},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationResult {
    /// Binding accepted for the given number of seconds.
    Registered(u32),
    /// Binding removed (response to an `Expires: 0` REGISTER).
    Unregistered,
    /// Challenge stored; send the REGISTER again with credentials.
    AuthRequired,
    /// 423: retry with the registrar's minimum interval.
    IntervalTooBrief(u32),
    Failed(u16),
}

#[derive(Debug)]
pub struct RegistrationTransaction {
    state: RegistrationState,
    cseq: u32,
    call_id: String,
    from_tag: String,
    requested_expires: u32,
    last_expires: u32,
    last_challenge: Option<DigestChallenge>,
    /// Nonce our last credentials were computed with; a second challenge for
    /// the same nonce means the credentials were rejected.
    answered_nonce: Option<String>,
    nonce_count: u32,
}

impl RegistrationTransaction {
    pub fn new(call_id: String, from_tag: String, expires: u32) -> Self {
        Self {
            state: RegistrationState::Unregistered,
            cseq: 0,
            call_id,
            from_tag,
            requested_expires: expires,
            last_expires: expires,
            last_challenge: None,
            answered_nonce: None,
            nonce_count: 0,
        }
    }

    /// Build the next REGISTER. `expires == 0` removes the binding.
    #[allow(clippy::too_many_arguments)]
    pub fn build_register(
        &mut self,
        registrar_uri: &str,
        aor: &str,
        contact_uri: &str,
        local: &LocalContact,
        branch: &str,
        expires: u32,
        extra_headers: Vec<Header>,
    ) -> Request {
        self.cseq = self.cseq.wrapping_add(1);
        self.requested_expires = expires;
        self.state = if expires == 0 {
            RegistrationState::Unregistering
        } else {
            RegistrationState::Registering
        };

        let mut req = Request::new(Method::Register, registrar_uri);
        req.add_header(local.via(branch));
        req.add_header(Header::new("Max-Forwards", "70"));
        req.add_header(Header::new("From", &format!("<{aor}>;tag={}", self.from_tag)));
        req.add_header(Header::new("To", &format!("<{aor}>")));
        req.add_header(Header::new("Call-ID", &self.call_id));
        req.add_header(Header::new("CSeq", &format_cseq(self.cseq, Method::Register)));
        for header in extra_headers {
            req.add_header(header);
        }
        req.add_header(Header::new("Contact", &format!("<{contact_uri}>")));
        req.add_header(Header::new("Expires", &expires.to_string()));
        req.add_header(Header::new("Content-Length", "0"));
        req
    }

    /// Handle a final REGISTER response. Provisional responses yield `None`.
    pub fn handle_response(&mut self, resp: &Response, contact_uri: &str) -> Option<RegistrationResult> {
        match resp.status_code {
            100..=199 => None,
            200..=299 => {
                self.answered_nonce = None;
                if self.requested_expires == 0 {
                    self.state = RegistrationState::Unregistered;
                    return Some(RegistrationResult::Unregistered);
                }
                self.state = RegistrationState::Registered;
                let expires = granted_expires(resp, contact_uri).unwrap_or(self.requested_expires);
                self.last_expires = expires;
                Some(RegistrationResult::Registered(expires))
            }
            401 | 407 => {
                let proxy = resp.status_code == 407;
                let name = if proxy { "Proxy-Authenticate" } else { "WWW-Authenticate" };
                let challenge = resp
                    .headers
                    .iter()
                    .filter(|h| h.name.eq_ignore_ascii_case(name))
                    .find_map(|h| parse_challenge(&h.value, proxy).ok());

                match challenge {
                    Some(chal)
                        if chal.stale || self.answered_nonce.as_deref() != Some(chal.nonce.as_str()) =>
                    {
                        self.last_challenge = Some(chal);
                        self.state = RegistrationState::Unregistered;
                        Some(RegistrationResult::AuthRequired)
                    }
                    _ => {
                        self.state = RegistrationState::Error;
                        Some(RegistrationResult::Failed(resp.status_code))
                    }
                }
            }
            423 => match header_value(&resp.headers, "Min-Expires").and_then(|v| v.trim().parse().ok()) {
                Some(min) if min > self.requested_expires => {
                    self.requested_expires = min;
                    self.state = RegistrationState::Unregistered;
                    Some(RegistrationResult::IntervalTooBrief(min))
                }
                _ => {
                    self.state = RegistrationState::Error;
                    Some(RegistrationResult::Failed(423))
                }
            },
            code => {
                self.state = RegistrationState::Error;
                Some(RegistrationResult::Failed(code))
            }
        }
    }

    /// The request got no answer at all.
    pub fn handle_timeout(&mut self) -> RegistrationResult {
        self.state = RegistrationState::Error;
        RegistrationResult::Failed(408)
    }

    /// Record that the next REGISTER answers `challenge`; returns the nonce count to use.
    pub fn note_answered(&mut self, challenge: &DigestChallenge) -> u32 {
        if self.answered_nonce.as_deref() != Some(challenge.nonce.as_str()) {
            self.nonce_count = 0;
        }
        self.nonce_count = self.nonce_count.wrapping_add(1);
        self.answered_nonce = Some(challenge.nonce.clone());
        self.nonce_count
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn requested_expires(&self) -> u32 {
        self.requested_expires
    }

    pub fn last_expires(&self) -> u32 {
        self.last_expires
    }

    pub fn last_challenge(&self) -> Option<&DigestChallenge> {
        self.last_challenge.as_ref()
    }

    pub fn next_refresh_interval_secs(&self) -> u64 {
        let expires = self.last_expires.max(5);
        (expires as u64 * 8) / 10
    }
}

/// Expiry granted for our binding: the Contact `expires` param that matches
/// our contact, else the `Expires` header.
fn granted_expires(resp: &Response, contact_uri: &str) -> Option<u32> {
    header_values(&resp.headers, "Contact")
        .into_iter()
        .find(|c| name_addr_uri(c) == contact_uri)
        .and_then(|c| header_param(c, "expires"))
        .or_else(|| header_value(&resp.headers, "Expires"))
        .and_then(|v| v.trim().parse().ok())
}

pub(crate) fn format_cseq(seq: u32, method: Method) -> String {
    let mut buf = String::new();
    let _ = write!(buf, "{} {}", seq, method);
    buf
}
