use core::fmt::Write;

use md5::Digest;

use crate::{Header, Result, SipError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub opaque: Option<String>,
    pub qop_auth: bool,
    pub stale: bool,
    /// `Proxy-Authenticate` (407) rather than `WWW-Authenticate` (401).
    pub proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials<'a> {
    /// `*` answers a challenge from any realm.
    pub realm: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

impl DigestCredentials<'_> {
    pub fn matches(&self, challenge: &DigestChallenge) -> bool {
        self.realm == "*" || self.realm == challenge.realm
    }
}

/// Client nonce and count for `qop=auth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientNonce<'a> {
    pub cnonce: &'a str,
    pub nc: u32,
}

/// Parse a `WWW-Authenticate` or `Proxy-Authenticate` value.
pub fn parse_challenge(input: &str, proxy: bool) -> Result<DigestChallenge> {
    let input = input.trim();
    let (scheme, params) = input
        .split_once(char::is_whitespace)
        .ok_or(SipError::Invalid("auth params"))?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return Err(SipError::Invalid("auth scheme"));
    }

    let mut realm: Option<String> = None;
    let mut nonce: Option<String> = None;
    let mut algorithm = String::from("MD5");
    let mut opaque = None;
    let mut qop_auth = false;
    let mut stale = false;

    for param in crate::message::split_list(params) {
        let (key, raw_val) = param
            .split_once('=')
            .ok_or(SipError::Invalid("auth value"))?;
        let val = raw_val.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(val.to_string()),
            "nonce" => nonce = Some(val.to_string()),
            "algorithm" => algorithm = val.to_string(),
            "opaque" => opaque = Some(val.to_string()),
            "qop" => qop_auth = val.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")),
            "stale" => stale = val.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    if !algorithm.eq_ignore_ascii_case("MD5") {
        return Err(SipError::Auth("unsupported digest algorithm"));
    }

    Ok(DigestChallenge {
        realm: realm.ok_or(SipError::Invalid("realm"))?,
        nonce: nonce.ok_or(SipError::Invalid("nonce"))?,
        algorithm,
        opaque,
        qop_auth,
        stale,
        proxy,
    })
}

pub fn authorization_header(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    client_nonce: Option<&ClientNonce<'_>>,
) -> Result<Header> {
    if !creds.matches(challenge) {
        return Err(SipError::Auth("no credentials for realm"));
    }
    let client_nonce = client_nonce.filter(|_| challenge.qop_auth);
    let response = compute_digest_response(challenge, creds, method, uri, client_nonce);

    let mut value = String::new();
    let _ = write!(
        value,
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
        creds.username, challenge.realm, challenge.nonce, uri, response, challenge.algorithm
    );
    if let Some(cn) = client_nonce {
        let _ = write!(value, ", qop=auth, nc={:08x}, cnonce=\"{}\"", cn.nc, cn.cnonce);
    }
    if let Some(opaque) = &challenge.opaque {
        let _ = write!(value, ", opaque=\"{opaque}\"");
    }

    let name = if challenge.proxy { "Proxy-Authorization" } else { "Authorization" };
    Ok(Header::new(name, &value))
}

pub fn compute_digest_response(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    client_nonce: Option<&ClientNonce<'_>>,
) -> String {
    let ha1 = md5_hex(format!("{}:{}:{}", creds.username, challenge.realm, creds.password).as_bytes());
    let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());

    let combo = match client_nonce {
        Some(cn) => format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, challenge.nonce, cn.nc, cn.cnonce, ha2
        ),
        None => format!("{}:{}:{}", ha1, challenge.nonce, ha2),
    };

    md5_hex(combo.as_bytes())
}

fn md5_hex(data: &[u8]) -> String {
    let digest = md5::Md5::digest(data);
    let mut out = String::with_capacity(32);
    for b in &digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
