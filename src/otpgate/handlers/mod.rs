pub mod health;
pub use self::health::health;

pub mod otp;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header::COOKIE, request::Parts},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
};

static EMAIL_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok());

/// Basic email format check on already-normalized input.
pub fn valid_email(email: &str) -> bool {
    EMAIL_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(email))
}

/// Socket address of the connected peer.
///
/// Present when the server runs with `into_make_service_with_connect_info`.
/// Behind a proxy this is the proxy, not the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Client address used for rate limiting.
///
/// The socket peer is authoritative. `x-forwarded-for` and `x-real-ip` are
/// only read when the peer itself is a trusted proxy; the forwarded chain is
/// walked from the right and the first hop that is not a trusted proxy wins.
pub(crate) fn client_ip(
    headers: &HeaderMap,
    peer: PeerAddr,
    trusted_proxies: &[IpAddr],
) -> Option<String> {
    let peer = peer.0?.ip().to_canonical();
    if !trusted_proxies.contains(&peer) {
        return Some(peer.to_string());
    }
    let forwarded = forwarded_client(headers, trusted_proxies)
        .or_else(|| header_ip(headers, "x-real-ip"))
        .unwrap_or(peer);
    Some(forwarded.to_string())
}

fn forwarded_client(headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> Option<IpAddr> {
    let chain = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect::<Vec<_>>();
    for hop in chain.into_iter().rev() {
        let ip = hop.parse::<IpAddr>().ok()?.to_canonical();
        if !trusted_proxies.contains(&ip) {
            return Some(ip);
        }
    }
    None
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .map(|ip| ip.to_canonical())
}

/// Read a cookie value by name from the `Cookie` header.
pub(crate) fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            let val = val.trim();
            if key.trim() == name && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}
