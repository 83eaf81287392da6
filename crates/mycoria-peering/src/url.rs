//! Peering URLs.
//!
//! Full form `scheme://host:port[/path][#option]`, or the compact
//! authority-less form `scheme:port[/path]` used for listeners. A missing
//! port is only accepted for schemes with a well-known default.

use std::cmp::Ordering;
use std::fmt;

use crate::{PeeringError, Result};

/// A parsed peering URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeeringUrl {
    pub scheme: String,
    /// Host part; empty in the compact listener form.
    pub domain: String,
    pub port: u16,
    /// Path, without the leading slash; empty when absent.
    pub path: String,
    /// Fragment option; empty when absent.
    pub option: String,
}

/// Default port for a scheme, if it has one.
fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

/// Whether the scheme is one this implementation knows at all.
fn known_scheme(scheme: &str) -> bool {
    matches!(scheme, "tcp" | "http" | "ws" | "https" | "wss" | "udp" | "kcp")
}

impl PeeringUrl {
    /// Parse a peering URL in either form.
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| PeeringError::InvalidUrl(format!("{raw}: missing scheme")))?;
        if !known_scheme(scheme) {
            return Err(PeeringError::InvalidUrl(format!("{raw}: unknown scheme {scheme}")));
        }

        let (option, rest_no_frag) = match rest.split_once('#') {
            Some((before, option)) => (option.to_string(), before),
            None => (String::new(), rest),
        };

        if let Some(authority) = rest_no_frag.strip_prefix("//") {
            // Full form.
            let (hostport, path) = match authority.split_once('/') {
                Some((hp, path)) => (hp, path.to_string()),
                None => (authority, String::new()),
            };
            let (domain, port) = split_host_port(hostport)?;
            let port = match port {
                Some(port) => port,
                None => default_port(scheme).ok_or_else(|| {
                    PeeringError::InvalidUrl(format!("{raw}: scheme {scheme} requires a port"))
                })?,
            };
            Ok(Self {
                scheme: scheme.to_string(),
                domain,
                port,
                path,
                option,
            })
        } else {
            // Compact form: scheme:port[/path].
            let (port_str, path) = match rest_no_frag.split_once('/') {
                Some((port, path)) => (port, path.to_string()),
                None => (rest_no_frag, String::new()),
            };
            let port = port_str
                .parse::<u16>()
                .map_err(|_| PeeringError::InvalidUrl(format!("{raw}: bad port {port_str}")))?;
            Ok(Self {
                scheme: scheme.to_string(),
                domain: String::new(),
                port,
                path,
                option,
            })
        }
    }

    /// Rebuild the URL with a concrete host, e.g. pairing a listener with
    /// an IANA hostname.
    pub fn with_host(&self, host: &str) -> Self {
        Self {
            domain: host.to_string(),
            ..self.clone()
        }
    }

    /// The `host:port` dial target.
    pub fn dial_addr(&self) -> String {
        if self.domain.contains(':') && !self.domain.starts_with('[') {
            format!("[{}]:{}", self.domain, self.port)
        } else {
            format!("{}:{}", self.domain, self.port)
        }
    }
}

/// Stable ordering: tcp first, then http, then everything else; ties break
/// by port, domain, path and option.
fn scheme_rank(scheme: &str) -> u8 {
    match scheme {
        "tcp" => 0,
        "http" => 1,
        _ => 2,
    }
}

impl Ord for PeeringUrl {
    fn cmp(&self, other: &Self) -> Ordering {
        scheme_rank(&self.scheme)
            .cmp(&scheme_rank(&other.scheme))
            .then_with(|| self.scheme.cmp(&other.scheme))
            .then_with(|| self.port.cmp(&other.port))
            .then_with(|| self.domain.cmp(&other.domain))
            .then_with(|| self.path.cmp(&other.path))
            .then_with(|| self.option.cmp(&other.option))
    }
}

impl PartialOrd for PeeringUrl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeeringUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}:{}", self.scheme, self.port)?;
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.domain, self.port)?;
        }
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        if !self.option.is_empty() {
            write!(f, "#{}", self.option)?;
        }
        Ok(())
    }
}

fn split_host_port(hostport: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| PeeringError::InvalidUrl(format!("{hostport}: unterminated bracket")))?;
        match rest.strip_prefix(':') {
            Some(port) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| PeeringError::InvalidUrl(format!("{hostport}: bad port")))?;
                Ok((host.to_string(), Some(port)))
            }
            None => Ok((host.to_string(), None)),
        }
    } else {
        match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| PeeringError::InvalidUrl(format!("{hostport}: bad port")))?;
                Ok((host.to_string(), Some(port)))
            }
            None => Ok((hostport.to_string(), None)),
        }
    }
}
