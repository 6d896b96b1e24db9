//! Real client address resolution behind a chain of trusted proxies.
//!
//! Each trusted proxy appends the address it received the request from, so
//! the client is the entry `trusted_hops` positions from the right. Entries
//! further left were supplied by the client and are ignored.

use axum::http::{HeaderMap, HeaderName};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
};
use tracing::debug;

pub const DEFAULT_FORWARDED_HEADER: &str = "x-forwarded-for";

#[derive(Clone, Debug)]
pub struct TrustedProxies {
    header: HeaderName,
    trusted_hops: NonZeroUsize,
}

impl TrustedProxies {
    #[must_use]
    pub fn new(header: HeaderName, trusted_hops: NonZeroUsize) -> Self {
        Self {
            header,
            trusted_hops,
        }
    }

    #[must_use]
    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    #[must_use]
    pub fn trusted_hops(&self) -> NonZeroUsize {
        self.trusted_hops
    }

    /// Resolve the client address for a request received from `peer`.
    #[must_use]
    pub fn client_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        let chain: Vec<&str> = headers
            .get_all(&self.header)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect();

        if chain.is_empty() {
            return peer;
        }

        let index = chain.len().saturating_sub(self.trusted_hops.get());
        chain
            .get(index)
            .and_then(|entry| parse_entry(entry))
            .unwrap_or_else(|| {
                debug!("unparseable forwarded entry, using peer address");
                peer
            })
    }
}

fn parse_entry(entry: &str) -> Option<IpAddr> {
    entry
        .parse::<IpAddr>()
        .ok()
        .or_else(|| entry.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}
