/// Digest authentication for REGISTER and INVITE
/// Reference: RFC 2617, carried into SIP by RFC 3261 section 22
///
/// The registrar or proxy rejects a bare request with 401/407 plus a
/// challenge; the retry carries credentials hashed with the md5 crate.
/// `AuthState` holds one challenge episode and the nonce-counter
/// bookkeeping the retries need.

use digest::Digest;
use md5::Md5;
use std::collections::HashMap;
use tracing::debug;

/// The challenge a WWW-Authenticate or Proxy-Authenticate header carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Md5Sess,
}

impl DigestChallenge {
    /// Parse a header value like
    /// `Digest realm="asterisk", nonce="1234", algorithm=MD5`.
    /// Yields None when realm or nonce is missing or the algorithm is
    /// one we cannot answer.
    pub fn parse(header_value: &str) -> Option<Self> {
        let params_str = header_value.strip_prefix("Digest ").unwrap_or(header_value);
        let params = parse_params(params_str);

        let realm = params.get("realm")?.clone();
        let nonce = params.get("nonce")?.clone();

        let algorithm = match params.get("algorithm").map(|s| s.to_uppercase()).as_deref() {
            Some("MD5") | None => DigestAlgorithm::Md5,
            Some("MD5-SESS") => DigestAlgorithm::Md5Sess,
            Some(other) => {
                debug!("digest algorithm {} not supported, challenge ignored", other);
                return None;
            }
        };

        Some(DigestChallenge {
            realm,
            nonce,
            algorithm,
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
            stale: params
                .get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

/// One authentication episode: the active challenge, which status code
/// raised it (401 vs 407 decides the Authorization header name), and the
/// nonce counter that increments on every resend under the same nonce.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub challenge: DigestChallenge,
    pub cause: u16,
    nonce_count: u32,
}

impl AuthState {
    pub fn new(challenge: DigestChallenge, cause: u16) -> Self {
        Self { challenge, cause, nonce_count: 0 }
    }

    /// A 407 answer expects Proxy-Authorization instead of Authorization.
    pub fn header_name(&self) -> &'static str {
        if self.cause == super::message::SS_PROXY_AUTH_REQUIRED {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }

    /// Build the credentials value for the next authenticated request.
    /// Increments nc and draws a fresh cnonce when qop is in play.
    pub fn authorization(&mut self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let (nc, cnonce) = if self.challenge.qop.is_some() {
            self.nonce_count += 1;
            (Some(format!("{:08x}", self.nonce_count)), Some(generate_cnonce()))
        } else {
            (None, None)
        };

        let response = compute_response(
            &self.challenge,
            username,
            password,
            method,
            uri,
            nc.as_deref(),
            cnonce.as_deref(),
        );

        let mut value = format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm={}, username=\"{}\", uri=\"{}\"",
            self.challenge.realm,
            self.challenge.nonce,
            match self.challenge.algorithm {
                DigestAlgorithm::Md5 => "MD5",
                DigestAlgorithm::Md5Sess => "MD5-sess",
            },
            username,
            uri
        );
        if let (Some(nc), Some(cnonce), Some(qop)) = (&nc, &cnonce, &self.challenge.qop) {
            value.push_str(&format!(", nc={}, cnonce=\"{}\", qop={}", nc, cnonce, qop));
        }
        if let Some(opaque) = &self.challenge.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        value.push_str(&format!(", response=\"{}\"", response));
        value
    }
}

/// Compute the digest response hash per RFC 2617
pub fn compute_response(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));

    // For MD5-sess: HA1 = MD5(MD5(username:realm:password):nonce:cnonce)
    let ha1 = if challenge.algorithm == DigestAlgorithm::Md5Sess {
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, cnonce.unwrap_or("")))
    } else {
        ha1
    };

    // HA2 = MD5(method:uri)
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    match &challenge.qop {
        Some(qop) if qop.contains("auth") => {
            let qop_value = if qop.contains("auth-int") { "auth-int" } else { "auth" };
            md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                challenge.nonce,
                nc.unwrap_or("00000001"),
                cnonce.unwrap_or(""),
                qop_value,
                ha2
            ))
        }
        // Unknown or absent qop: MD5(HA1:nonce:HA2)
        _ => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    }
}

/// Compute MD5 hash and return as lowercase hex string
fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Generate a random 32-hex-digit client nonce
fn generate_cnonce() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse the key=value / key="value" list of a challenge. The list is
/// split on commas outside quotes first, so a quoted value may contain
/// commas (qop="auth,auth-int"); quotes are stripped from the stored
/// value, an unterminated quote runs to the end of its segment.
fn parse_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for segment in split_outside_quotes(s) {
        let (key, value) = match segment.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = match value.strip_prefix('"') {
            Some(quoted) => quoted.strip_suffix('"').unwrap_or(quoted),
            None => value,
        };
        params.insert(key, value.to_string());
    }
    params
}

/// Comma-split that ignores commas inside double quotes.
fn split_outside_quotes(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == ',' && !in_quotes {
            parts.push(&s[start..i]);
            start = i + 1;
        }
    }
    parts.push(&s[start..]);
    parts
}
