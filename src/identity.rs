//! Pseudo-identities for counting requests without authentication.

use actix_web::http::header::{HeaderMap, USER_AGENT};
use actix_web::HttpRequest;
use std::fmt::{Display, Formatter};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// `user:<address>:<hash>`, where the hash is the first 8 hex characters of the MD5 digest of
/// the user agent.
///
/// # Security
///
/// Forwarding headers are trusted as sent, which is only suitable for deployments behind a proxy
/// that you control. The identity is a counting key, not an authenticated user.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn from_request(req: &HttpRequest) -> Self {
        let peer = req.peer_addr().map(|addr| addr.ip().to_string());
        Self::from_parts(req.headers(), peer.as_deref())
    }

    /// Derives the identity from request headers and the connection's peer address.
    ///
    /// The address is the first non-empty of `X-Forwarded-For` (its first entry), `X-Real-IP`
    /// and the peer address.
    pub fn from_parts(headers: &HeaderMap, peer: Option<&str>) -> Self {
        let forwarded = header_str(headers, X_FORWARDED_FOR)
            .and_then(|value| value.split(',').map(str::trim).find(|s| !s.is_empty()));
        let real_ip = header_str(headers, X_REAL_IP).map(str::trim);
        let address = [forwarded, real_ip, peer]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .unwrap_or("unknown");
        let user_agent = header_str(headers, USER_AGENT.as_str()).unwrap_or("");
        Self::new(address, user_agent)
    }

    pub fn new(address: &str, user_agent: &str) -> Self {
        let digest = format!("{:x}", md5::compute(user_agent.as_bytes()));
        Self(format!("user:{address}:{}", &digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
