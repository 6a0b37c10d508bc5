//! Identity resolution from inbound requests.

use axum::extract::{ConnectInfo, Request};
use axum::http::header::{HeaderName, InvalidHeaderName};
use std::net::SocketAddr;

use crate::ratelimit::Identity;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Maps a request to the identity its rate limit is scoped to.
///
/// Credential contents are opaque here; classification is the resolver's call
/// and nothing downstream re-derives it.
pub trait IdentityResolver: Send + Sync {
    /// `None` when the request carries nothing to identify it by.
    fn resolve(&self, request: &Request) -> Option<Identity>;
}

/// Credential from a configured header, falling back to the client address.
#[derive(Debug, Clone)]
pub struct HeaderIdentityResolver {
    credential_header: HeaderName,
    trust_forwarded_for: bool,
}

impl HeaderIdentityResolver {
    pub fn new(credential_header: &str, trust_forwarded_for: bool) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            credential_header: HeaderName::try_from(credential_header.to_ascii_lowercase())?,
            trust_forwarded_for,
        })
    }

    fn credential(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get(&self.credential_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn address(&self, request: &Request) -> Option<String> {
        if self.trust_forwarded_for {
            let forwarded = request
                .headers()
                .get(FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty());
            if let Some(client) = forwarded {
                return Some(client.to_string());
            }
        }

        // Port is dropped so every connection from a host shares one identity.
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve(&self, request: &Request) -> Option<Identity> {
        if let Some(credential) = self.credential(request) {
            return Some(Identity::credential(credential));
        }
        self.address(request).map(Identity::address)
    }
}
