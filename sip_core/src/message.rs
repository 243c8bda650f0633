use core::fmt::Write;

use crate::{Result, SipError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Update,
    Prack,
    Notify,
    Refer,
    Message,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const SIP_2_0: Version = Version { major: 2, minor: 0 };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

pub type HeaderList = Vec<Header>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: HeaderList,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: Version,
    pub status_code: u16,
    pub reason: String,
    pub headers: HeaderList,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Header {
    pub fn new(name: &str, value: &str) -> Self {
        Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            version: Version::SIP_2_0,
            headers: HeaderList::new(),
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_body(&mut self, body: &str) {
        self.body.clear();
        self.body.push_str(body);
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512 + self.body.len());
        let _ = write!(
            out,
            "{} {} SIP/{}.{}\r\n",
            self.method, self.uri, self.version.major, self.version.minor
        );
        render_tail(&mut out, &self.headers, &self.body);
        out
    }
}

impl Response {
    pub fn new(status_code: u16, reason: &str) -> Self {
        Self {
            version: Version::SIP_2_0,
            status_code,
            reason: reason.to_string(),
            headers: HeaderList::new(),
            body: String::new(),
        }
    }

    pub fn add_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_body(&mut self, body: &str) {
        self.body.clear();
        self.body.push_str(body);
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(256 + self.body.len());
        let _ = write!(
            out,
            "SIP/{}.{} {} {}\r\n",
            self.version.major, self.version.minor, self.status_code, self.reason
        );
        render_tail(&mut out, &self.headers, &self.body);
        out
    }
}

fn render_tail(out: &mut String, headers: &[Header], body: &str) {
    for header in headers {
        let _ = write!(out, "{}: {}\r\n", header.name, header.value);
    }
    out.push_str("\r\n");
    out.push_str(body);
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Message => "MESSAGE",
            Method::Subscribe => "SUBSCRIBE",
        }
    }
}

impl core::str::FromStr for Method {
    type Err = SipError;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "REGISTER" => Ok(Method::Register),
            "INVITE" => Ok(Method::Invite),
            "ACK" => Ok(Method::Ack),
            "BYE" => Ok(Method::Bye),
            "CANCEL" => Ok(Method::Cancel),
            "OPTIONS" => Ok(Method::Options),
            "INFO" => Ok(Method::Info),
            "UPDATE" => Ok(Method::Update),
            "PRACK" => Ok(Method::Prack),
            "NOTIFY" => Ok(Method::Notify),
            "REFER" => Ok(Method::Refer),
            "MESSAGE" => Ok(Method::Message),
            "SUBSCRIBE" => Ok(Method::Subscribe),
            _ => Err(SipError::Invalid("unknown method")),
        }
    }
}

// Basic parser: decide request vs response by first line.
pub fn parse_message(input: &str) -> Result<Message> {
    let (head, body) = split_head_body(input);
    let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));
    let first = lines
        .by_ref()
        .find(|l| !l.is_empty())
        .ok_or(SipError::Invalid("empty message"))?;

    let headers = parse_headers(lines)?;
    let body = trim_body(body, &headers);

    if first.starts_with("SIP/") {
        parse_response(first, headers, body)
    } else {
        parse_request(first, headers, body)
    }
}

fn split_head_body(input: &str) -> (&str, &str) {
    if let Some(pos) = input.find("\r\n\r\n") {
        (&input[..pos], &input[pos + 4..])
    } else if let Some(pos) = input.find("\n\n") {
        (&input[..pos], &input[pos + 2..])
    } else {
        (input, "")
    }
}

fn trim_body<'a>(body: &'a str, headers: &[Header]) -> &'a str {
    match header_value(headers, "Content-Length").and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(len) if len <= body.len() && body.is_char_boundary(len) => &body[..len],
        _ => body,
    }
}

fn parse_request(start_line: &str, headers: HeaderList, body: &str) -> Result<Message> {
    let mut parts = start_line.split_whitespace();
    let method = parts.next().ok_or(SipError::Invalid("missing method"))?;
    let uri = parts.next().ok_or(SipError::Invalid("missing uri"))?;
    let version = parts.next().ok_or(SipError::Invalid("missing version"))?;
    if version != "SIP/2.0" {
        return Err(SipError::Invalid("unsupported version"));
    }

    let mut req = Request::new(method.parse()?, uri);
    req.headers = headers;
    req.set_body(body);
    Ok(Message::Request(req))
}

fn parse_response(start_line: &str, headers: HeaderList, body: &str) -> Result<Message> {
    let mut parts = start_line.splitn(3, ' ');
    let version = parts.next().ok_or(SipError::Invalid("missing version"))?;
    if version != "SIP/2.0" {
        return Err(SipError::Invalid("unsupported version"));
    }
    let status: u16 = parts
        .next()
        .ok_or(SipError::Invalid("missing status"))?
        .parse()
        .map_err(|_| SipError::Invalid("status parse"))?;
    if !(100..700).contains(&status) {
        return Err(SipError::Invalid("status out of range"));
    }
    let reason = parts.next().unwrap_or("").trim();

    let mut resp = Response::new(status, reason);
    resp.headers = headers;
    resp.set_body(body);
    Ok(Message::Response(resp))
}

fn parse_headers<'a, I>(lines: I) -> Result<HeaderList>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HeaderList::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // Folded continuation line.
        if line.starts_with(' ') || line.starts_with('\t') {
            let last = headers
                .last_mut()
                .ok_or(SipError::Invalid("continuation without header"))?;
            last.value.push(' ');
            last.value.push_str(line.trim());
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(SipError::Invalid("header without colon"))?;
        headers.push(Header::new(expand_compact(name.trim()), value.trim()));
    }
    Ok(headers)
}

fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "k" | "K" => "Supported",
        _ => name,
    }
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// All values of a header, in order, with comma-joined values split apart.
pub fn header_values<'a>(headers: &'a [Header], name: &'a str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
        .flat_map(|h| split_list(&h.value))
        .collect()
}

/// Split a comma separated header value, ignoring commas inside quotes or `<>`.
pub fn split_list(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth_angle = 0u32;
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth_angle += 1,
            '>' if !in_quotes => depth_angle = depth_angle.saturating_sub(1),
            ',' if !in_quotes && depth_angle == 0 => {
                out.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = value[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

/// Parse a CSeq value into its number and method.
pub fn parse_cseq(value: &str) -> Option<(u32, Method)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = parts.next()?.parse().ok()?;
    Some((seq, method))
}
