//! Caller identity derived from proxy headers and the transport peer.
//!
//! The forwarding headers are trusted as-is, so this must sit behind a
//! reverse proxy that overwrites them. It is not a defense against spoofing by
//! the proxy itself.

use http::HeaderMap;
use std::{
    fmt,
    net::IpAddr,
};

pub const UNKNOWN_IDENTITY: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Precedence: `X-Real-IP`, first `X-Forwarded-For` hop, peer address, then
/// the `"unknown"` sentinel.
pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>) -> ClientIdentity {
    if let Some(real_ip) = header_str(headers, "x-real-ip")
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return ClientIdentity::new(real_ip);
    }

    if let Some(origin) = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return ClientIdentity::new(origin);
    }

    match peer {
        Some(ip) => ClientIdentity::new(ip.to_string()),
        None => ClientIdentity::new(UNKNOWN_IDENTITY),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
