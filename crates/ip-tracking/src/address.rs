//! Client address extraction.
//!
//! The origin address of a request is the left-most entry of the
//! `X-Forwarded-For` header when present, otherwise the transport peer.
//! Every component that needs an address derives it through
//! [`client_address`] so that blocking and logging always agree.
//!
//! Addresses come out in canonical form: an IPv4-mapped IPv6 address such as
//! `::ffff:192.0.2.1`, as reported by dual-stack listeners, becomes
//! `192.0.2.1`.
//!
//! Trusting `X-Forwarded-For` is only sound when the service sits behind a
//! reverse proxy that overwrites the header. Exposed directly, a client can
//! put any address it likes in there.

use std::net::{IpAddr, SocketAddr};

use tracing::warn;

/// Name of the forwarding header, lower-cased.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Address-related metadata of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Raw value of the `X-Forwarded-For` header, if sent.
    pub forwarded_for: Option<String>,
    /// Transport-level peer address, if known.
    pub peer: Option<IpAddr>,
}

impl RequestMeta {
    /// Metadata for a direct connection.
    #[must_use]
    pub const fn from_peer(peer: IpAddr) -> Self {
        Self {
            forwarded_for: None,
            peer: Some(peer),
        }
    }

    /// Set the forwarding header value.
    #[must_use]
    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    /// Build metadata from a header list and the socket peer.
    ///
    /// Header names are matched case-insensitively; the first matching header
    /// wins.
    pub fn from_headers<'a, I>(headers: I, peer: Option<SocketAddr>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let forwarded_for = headers
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(FORWARDED_FOR_HEADER))
            .map(|(_, value)| value.to_string());

        Self {
            forwarded_for,
            peer: peer.map(|p| p.ip()),
        }
    }
}

/// Derive the client's origin address.
///
/// Returns `None` only when there is neither a usable forwarded entry nor a
/// peer address.
#[must_use]
pub fn client_address(meta: &RequestMeta) -> Option<IpAddr> {
    origin(meta).map(|ip| ip.to_canonical())
}

fn origin(meta: &RequestMeta) -> Option<IpAddr> {
    if let Some(first) = meta
        .forwarded_for
        .as_deref()
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
    {
        match parse_forwarded_entry(first) {
            Some(ip) => return Some(ip),
            None => warn!(entry = %first, "Unparseable X-Forwarded-For entry, using peer address"),
        }
    }

    meta.peer
}

/// Parse one forwarded entry: a bare IP, `ip:port`, or `[ipv6]:port`.
fn parse_forwarded_entry(entry: &str) -> Option<IpAddr> {
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(sock) = entry.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    entry
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| inner.parse().ok())
}
