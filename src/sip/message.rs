/// SIP datagram parsing
/// Reference: RFC 3261 - SIP: Session Initiation Protocol
///
/// One datagram, one message. The mandatory header subset the state
/// machine relies on (Via, From, To, Call-ID, CSeq, ...) is parsed into
/// typed fields; everything else lands in a fallback map so nothing is
/// lost for logging or echoing.

use std::collections::HashMap;
use thiserror::Error;

use super::digest::DigestChallenge;

pub const SIP_VERSION: &str = "SIP/2.0";
pub const DEF_SIP_PORT: u16 = 5060;

/// Methods this agent can receive; REGISTER is only ever sent.
pub const COMPATIBLE_METHODS: [Method; 4] =
    [Method::Invite, Method::Ack, Method::Bye, Method::Cancel];

// Known response status subset
pub const SS_TRYING: u16 = 100;
pub const SS_PUSH_SENT: u16 = 110;
pub const SS_RINGING: u16 = 180;
pub const SS_TERMINATED: u16 = 199;
pub const SS_OK: u16 = 200;
pub const SS_BAD_REQUEST: u16 = 400;
pub const SS_UNAUTHORIZED: u16 = 401;
pub const SS_FORBIDDEN: u16 = 403;
pub const SS_NOT_FOUND: u16 = 404;
pub const SS_PROXY_AUTH_REQUIRED: u16 = 407;
pub const SS_REQUEST_TIMEOUT: u16 = 408;
pub const SS_TEMPORARILY_UNAVAILABLE: u16 = 480;
pub const SS_TRANSACTION_DOES_NOT_EXIST: u16 = 481;
pub const SS_BUSY_HERE: u16 = 486;
pub const SS_REQUEST_TERMINATED: u16 = 487;
pub const SS_NOT_ACCEPTABLE_HERE: u16 = 488;
pub const SS_INTERNAL_SERVER_ERROR: u16 = 500;
pub const SS_NOT_IMPLEMENTED: u16 = 501;
pub const SS_SERVICE_UNAVAILABLE: u16 = 503;
pub const SS_DECLINE: u16 = 603;

/// Reason phrase for the known status subset
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        SS_TRYING => "Trying",
        SS_PUSH_SENT => "Push sent",
        SS_RINGING => "Ringing",
        SS_TERMINATED => "Early Dialog Terminated",
        SS_OK => "OK",
        SS_BAD_REQUEST => "Bad Request",
        SS_UNAUTHORIZED => "Unauthorized",
        SS_FORBIDDEN => "Forbidden",
        SS_NOT_FOUND => "Not Found",
        SS_PROXY_AUTH_REQUIRED => "Proxy Authentication Required",
        SS_REQUEST_TIMEOUT => "Request Timeout",
        SS_TEMPORARILY_UNAVAILABLE => "Temporarily Unavailable",
        SS_TRANSACTION_DOES_NOT_EXIST => "Call/Transaction Does Not Exist",
        SS_BUSY_HERE => "Busy Here",
        SS_REQUEST_TERMINATED => "Request Terminated",
        SS_NOT_ACCEPTABLE_HERE => "Not Acceptable Here",
        SS_INTERNAL_SERVER_ERROR => "Internal Server Error",
        SS_NOT_IMPLEMENTED => "Not Implemented",
        SS_SERVICE_UNAVAILABLE => "Service Unavailable",
        SS_DECLINE => "Declined",
        _ => "Unknown",
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("no CRLF CRLF header terminator")]
    NoHeaderEnd,
    #[error("malformed start line")]
    BadStartLine,
    #[error("SIP version {0} not compatible")]
    BadVersion(String),
    #[error("Content-Encoding present, encoded bodies not supported")]
    EncodedBody,
    #[error("mandatory header {0} missing or empty")]
    MissingHeader(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Prack,
    Subscribe,
    Notify,
    Publish,
    Info,
    Refer,
    Message,
    Update,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "INVITE" => Some(Method::Invite),
            "ACK" => Some(Method::Ack),
            "BYE" => Some(Method::Bye),
            "CANCEL" => Some(Method::Cancel),
            "REGISTER" => Some(Method::Register),
            "OPTIONS" => Some(Method::Options),
            "PRACK" => Some(Method::Prack),
            "SUBSCRIBE" => Some(Method::Subscribe),
            "NOTIFY" => Some(Method::Notify),
            "PUBLISH" => Some(Method::Publish),
            "INFO" => Some(Method::Info),
            "REFER" => Some(Method::Refer),
            "MESSAGE" => Some(Method::Message),
            "UPDATE" => Some(Method::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Prack => "PRACK",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Publish => "PUBLISH",
            Method::Info => "INFO",
            Method::Refer => "REFER",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
        }
    }

    pub fn is_compatible(&self) -> bool {
        COMPATIBLE_METHODS.contains(self)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: String },
    Response { status: u16 },
}

/// One Via entry. The raw value is kept because responses must echo the
/// header verbatim, parameters the parser does not know included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub raw: String,
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub branch: Option<String>,
    /// None: absent; Some(None): flag without value; Some(Some(p)): filled in
    pub rport: Option<Option<u16>>,
    pub received: Option<String>,
}

/// Parsed From/To header
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameAddr {
    /// Header value without the tag parameter
    pub raw: String,
    /// Display part before the URI (caller id), quotes stripped
    pub cid: String,
    /// user@host or just host
    pub address: String,
    pub user: Option<String>,
    pub host: String,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: String,
}

/// Typed mandatory subset plus a fallback map for the rest
#[derive(Debug, Clone, Default)]
pub struct Headers {
    pub via: Vec<Via>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: Option<CSeq>,
    pub contact: Option<String>,
    pub record_route: Vec<String>,
    pub route: Vec<String>,
    pub www_authenticate: Option<DigestChallenge>,
    pub proxy_authenticate: Option<DigestChallenge>,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,
    pub allow: Vec<String>,
    pub supported: Vec<String>,
    pub expires: Option<u32>,
    pub max_forwards: Option<u32>,
    pub other: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    None,
    Sdp(Sdp),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Body,
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let split = find_header_end(data).ok_or(ParseError::NoHeaderEnd)?;
        let head = std::str::from_utf8(&data[..split]).map_err(|_| ParseError::NotUtf8)?;
        let body_bytes = &data[split + 4..];

        let mut lines = head.split("\r\n");
        let start_line = lines.next().ok_or(ParseError::BadStartLine)?;
        let start = parse_start_line(start_line)?;

        let mut headers = Headers::default();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = match line.split_once(':') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => continue, // tolerate stray lines
            };
            parse_header(&mut headers, name, value)?;
        }

        if headers.other.contains_key("content-encoding") {
            return Err(ParseError::EncodedBody);
        }
        if headers.via.is_empty() {
            return Err(ParseError::MissingHeader("Via"));
        }
        if headers.call_id.is_empty() {
            return Err(ParseError::MissingHeader("Call-ID"));
        }
        if headers.cseq.is_none() {
            return Err(ParseError::MissingHeader("CSeq"));
        }
        if headers.from.raw.is_empty() {
            return Err(ParseError::MissingHeader("From"));
        }
        if headers.to.raw.is_empty() {
            return Err(ParseError::MissingHeader("To"));
        }

        let body = if body_bytes.is_empty() {
            Body::None
        } else if headers
            .content_type
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case("application/sdp"))
            .unwrap_or(false)
        {
            match std::str::from_utf8(body_bytes).ok().and_then(Sdp::parse) {
                Some(sdp) => Body::Sdp(sdp),
                None => Body::Raw(body_bytes.to_vec()),
            }
        } else {
            Body::Raw(body_bytes.to_vec())
        };

        Ok(SipMessage { start, headers, body })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(*method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    /// The digest challenge of a 401 or 407, whichever is present.
    pub fn challenge(&self) -> Option<&DigestChallenge> {
        self.headers
            .www_authenticate
            .as_ref()
            .or(self.headers.proxy_authenticate.as_ref())
    }

    pub fn sdp(&self) -> Option<&Sdp> {
        match &self.body {
            Body::Sdp(sdp) => Some(sdp),
            _ => None,
        }
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_start_line(line: &str) -> Result<StartLine, ParseError> {
    let mut parts = line.split(' ');
    let first = parts.next().ok_or(ParseError::BadStartLine)?;

    if let Some(method) = Method::from_token(first) {
        let uri = parts.next().ok_or(ParseError::BadStartLine)?.to_string();
        let version = parts.next().ok_or(ParseError::BadStartLine)?;
        if version != SIP_VERSION {
            return Err(ParseError::BadVersion(version.to_string()));
        }
        return Ok(StartLine::Request { method, uri });
    }

    if first != SIP_VERSION {
        return Err(ParseError::BadVersion(first.to_string()));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::BadStartLine)?;
    Ok(StartLine::Response { status })
}

fn parse_header(headers: &mut Headers, name: &str, value: &str) -> Result<(), ParseError> {
    match name.to_ascii_lowercase().as_str() {
        "via" => {
            if let Some(via) = parse_via(value) {
                headers.via.push(via);
            }
        }
        "from" => headers.from = parse_name_addr(value),
        "to" => headers.to = parse_name_addr(value),
        "call-id" => headers.call_id = value.to_string(),
        "cseq" => {
            let mut parts = value.split_whitespace();
            let seq = parts.next().and_then(|s| s.parse().ok());
            let method = parts.next();
            if let (Some(seq), Some(method)) = (seq, method) {
                headers.cseq = Some(CSeq { seq, method: method.to_string() });
            }
        }
        "contact" => headers.contact = Some(value.to_string()),
        "record-route" => headers.record_route.push(value.to_string()),
        "route" => headers.route.push(value.to_string()),
        "www-authenticate" => headers.www_authenticate = DigestChallenge::parse(value),
        "proxy-authenticate" => headers.proxy_authenticate = DigestChallenge::parse(value),
        "content-type" => headers.content_type = Some(value.to_string()),
        "content-length" => headers.content_length = value.parse().ok(),
        "allow" => headers.allow = value.split(',').map(|s| s.trim().to_string()).collect(),
        "supported" => headers.supported = value.split(',').map(|s| s.trim().to_string()).collect(),
        "expires" => headers.expires = value.parse().ok(),
        "max-forwards" => headers.max_forwards = value.parse().ok(),
        other => {
            headers.other.insert(other.to_string(), value.to_string());
        }
    }
    Ok(())
}

/// Via: SIP/2.0/UDP host:port;rport;received=1.2.3.4;branch=z9hG4bK...
fn parse_via(value: &str) -> Option<Via> {
    let mut parts = value.split(';');
    let sent = parts.next()?.trim();
    let mut sent_parts = sent.split_whitespace();
    let transport = sent_parts.next()?.to_string();
    let hostport = sent_parts.next()?;

    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(DEF_SIP_PORT)),
        None => (hostport.to_string(), DEF_SIP_PORT),
    };

    let mut via = Via {
        raw: value.to_string(),
        transport,
        host,
        port,
        branch: None,
        rport: None,
        received: None,
    };

    for param in parts {
        let param = param.trim();
        match param.split_once('=') {
            Some(("branch", v)) => via.branch = Some(v.to_string()),
            Some(("received", v)) => via.received = Some(v.to_string()),
            Some(("rport", v)) => via.rport = Some(v.parse().ok()),
            Some(_) => {}
            None => {
                if param == "rport" {
                    via.rport = Some(None);
                }
            }
        }
    }
    Some(via)
}

/// From/To: optional display, <sip:user@host>;tag=...
/// A value without angle brackets is used as-is for the address part.
fn parse_name_addr(value: &str) -> NameAddr {
    let (raw, tag) = match value.split_once(";tag=") {
        Some((raw, tag)) => (raw.trim(), Some(tag.trim().to_string())),
        None => (value.trim(), None),
    };

    let (cid, address) = match raw.split_once("<sip:").or_else(|| raw.split_once("<sips:")) {
        Some((display, rest)) => {
            // The URI ends at the closing bracket; header parameters after
            // it do not belong to the address.
            let address = rest.split('>').next().unwrap_or("").to_string();
            let cid = display.trim().trim_matches('"').trim_matches('\'').to_string();
            (cid, address)
        }
        None => {
            // No angle brackets: use the raw header, stripping a bare
            // sip: scheme when present.
            let address = raw.strip_prefix("sip:").unwrap_or(raw).to_string();
            (String::new(), address)
        }
    };

    // URI parameters do not belong to the address either
    let address = address.split(';').next().unwrap_or("").to_string();

    let (user, host) = match address.split_once('@') {
        Some((user, host)) => (Some(user.to_string()), host.to_string()),
        None => (None, address.clone()),
    };

    NameAddr {
        raw: raw.to_string(),
        cid,
        address,
        user,
        host,
        tag,
    }
}

/// SDP body subset
/// Reference: RFC 4566 - Session Description Protocol
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sdp {
    /// c= connection address
    pub connection: Option<String>,
    /// m=audio port
    pub media_port: u16,
    /// m=audio payload types in offer order
    pub payload_types: Vec<u8>,
    /// a=rtpmap entries: (payload type, encoding name, clock rate)
    pub rtpmaps: Vec<(u8, String, u32)>,
}

impl Sdp {
    pub fn parse(text: &str) -> Option<Self> {
        let mut sdp = Sdp::default();
        let mut saw_media = false;

        for line in text.lines() {
            let line = line.trim_end();
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            match key {
                "c" => {
                    // c=IN IP4 <address>
                    sdp.connection = value.split_whitespace().nth(2).map(|s| s.to_string());
                }
                "m" => {
                    // m=audio <port> RTP/AVP <pt> <pt> ...
                    let mut parts = value.split_whitespace();
                    if parts.next() != Some("audio") {
                        continue;
                    }
                    sdp.media_port = parts.next().and_then(|p| p.parse().ok())?;
                    let _protocol = parts.next();
                    sdp.payload_types = parts.filter_map(|p| p.parse().ok()).collect();
                    saw_media = true;
                }
                "a" => {
                    // a=rtpmap:<pt> <name>/<rate>
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        let mut parts = rest.split_whitespace();
                        let pt = parts.next().and_then(|p| p.parse().ok());
                        let encoding = parts.next().and_then(|e| {
                            let (name, rate) = e.split_once('/')?;
                            Some((name.to_string(), rate.split('/').next()?.parse().ok()?))
                        });
                        if let (Some(pt), Some((name, rate))) = (pt, encoding) {
                            sdp.rtpmaps.push((pt, name, rate));
                        }
                    }
                }
                _ => {}
            }
        }

        saw_media.then_some(sdp)
    }

    /// The payload type the peer registered for telephone-event, if any.
    pub fn telephone_event_pt(&self) -> Option<u8> {
        self.rtpmaps
            .iter()
            .find(|(_, name, _)| name.eq_ignore_ascii_case("telephone-event"))
            .map(|(pt, _, _)| *pt)
    }
}
