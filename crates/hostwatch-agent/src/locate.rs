//! Public IP and location lookup via Cloudflare's trace endpoint.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::debug;

/// Trace endpoint.
pub const TRACE_URL: &str = "https://www.cloudflare.com/cdn-cgi/trace";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lookup failures.
#[derive(Debug, Error)]
pub enum LocateError {
    /// Request or body read failed.
    #[error("trace request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The response had no `ip=` line.
    #[error("trace response did not include an ip")]
    MissingIp,
}

/// Public address as seen from the edge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    /// Public IP.
    pub ip: String,
    /// Two-letter country code, as returned.
    pub loc: String,
}

/// Parse the `key=value` lines of a trace body.
pub fn parse_trace(body: &str) -> Option<Location> {
    let mut location = Location::default();
    for line in body.lines() {
        match line.trim().split_once('=') {
            Some(("ip", v)) => v.clone_into(&mut location.ip),
            Some(("loc", v)) => v.clone_into(&mut location.loc),
            _ => {}
        }
    }
    (!location.ip.is_empty()).then_some(location)
}

/// Fetch and parse the trace from `url`.
pub async fn lookup(client: &Client, url: &str) -> Result<Location, LocateError> {
    let body = client
        .get(url)
        .timeout(LOOKUP_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let location = parse_trace(&body).ok_or(LocateError::MissingIp)?;
    debug!(ip = %location.ip, loc = %location.loc, "public location resolved");
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_and_loc() {
        let body = "fl=12f\nh=www.cloudflare.com\nip=203.0.113.7\nts=1700000000.1\nloc=DE\ntls=TLSv1.3\n";
        let loc = parse_trace(body).unwrap();
        assert_eq!(loc.ip, "203.0.113.7");
        assert_eq!(loc.loc, "DE");
    }

    #[test]
    fn ipv6_and_crlf() {
        let body = "ip=2001:db8::1\r\nloc=JP\r\n";
        let loc = parse_trace(body).unwrap();
        assert_eq!(loc.ip, "2001:db8::1");
        assert_eq!(loc.loc, "JP");
    }

    #[test]
    fn missing_ip_is_none() {
        assert!(parse_trace("loc=US\n").is_none());
        assert!(parse_trace("").is_none());
    }
}
