use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    time::Instant,
};

use crate::{identity::ClientIdentity, ratelimit::AdmissionDecision};

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub peer_ip: Option<IpAddr>,
    pub started_at: Instant,
    /// Set once the limiter has been consulted. Exempt requests have neither.
    pub identity: Option<ClientIdentity>,
    pub decision: Option<AdmissionDecision>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        peer_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            peer_ip,
            started_at: Instant::now(),
            identity: None,
            decision: None,
        }
    }
}
