//! Outbound request guard against server-side request forgery.
//!
//! A target is rejected before any network call when its scheme is not
//! http(s), its host names the local machine or an internal zone, or its
//! address (literal or resolved) is loopback, private, link-local,
//! unspecified or a cloud metadata endpoint.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Error, PartialEq)]
pub enum SsrfViolation {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("forbidden scheme: {0}")]
    Scheme(String),

    #[error("forbidden host: {0}")]
    Host(String),

    #[error("forbidden address: {host} -> {ip}")]
    Address { host: String, ip: IpAddr },
}

const METADATA_V4: [[u8; 4]; 3] = [
    [169, 254, 169, 254], // AWS / GCP / Azure
    [169, 254, 170, 2],   // ECS task metadata
    [100, 100, 100, 200], // Alibaba Cloud
];

const BLOCKED_SUFFIXES: [&str; 3] = [".internal", ".local", ".localhost"];

pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.octets()[0] == 0
        || METADATA_V4.contains(&ip.octets())
}

fn is_blocked_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
        || *ip == Ipv6Addr::new(0xfd00, 0xec2, 0, 0, 0, 0, 0, 0x254) // AWS IMDS over IPv6
}

/// Check a target URL without touching the network.
pub fn validate_target(raw: &str) -> Result<Url, SsrfViolation> {
    let url = Url::parse(raw).map_err(|e| SsrfViolation::InvalidUrl(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(SsrfViolation::Scheme(other.to_owned())),
    }

    match url.host() {
        None => return Err(SsrfViolation::InvalidUrl(format!("{raw}: missing host"))),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost"
                || BLOCKED_SUFFIXES.iter().any(|suffix| domain.ends_with(suffix))
            {
                return Err(SsrfViolation::Host(domain));
            }
        }
        Some(Host::Ipv4(ip)) => check_ip(&ip.to_string(), IpAddr::V4(ip))?,
        Some(Host::Ipv6(ip)) => check_ip(&ip.to_string(), IpAddr::V6(ip))?,
    }

    Ok(url)
}

fn check_ip(host: &str, ip: IpAddr) -> Result<(), SsrfViolation> {
    if is_blocked_ip(&ip) {
        return Err(SsrfViolation::Address {
            host: host.to_owned(),
            ip,
        });
    }
    Ok(())
}

/// Resolve a domain target and reject it if any address is blocked, so a
/// public name pointing at an internal address is caught too.
pub async fn validate_resolved(url: &Url) -> Result<(), SsrfViolation> {
    let Some(Host::Domain(domain)) = url.host() else {
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(80);
    resolve_allowed(domain, port).await.map(|_| ())
}

/// Look `host` up and return its addresses, failing if any is blocked.
pub async fn resolve_allowed(host: &str, port: u16) -> Result<Vec<SocketAddr>, SsrfViolation> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SsrfViolation::InvalidUrl(format!("{host}: dns resolution failed: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(SsrfViolation::InvalidUrl(format!("{host}: no addresses")));
    }
    for addr in &addrs {
        check_ip(host, addr.ip())?;
    }
    Ok(addrs)
}

/// DNS resolver for the HTTP client. Connections only go to addresses that
/// pass [`is_blocked_ip`] at connect time, so a name that re-resolves to an
/// internal address after [`validate_resolved`] is still refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardedResolver;

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_owned();
        Box::pin(async move {
            match resolve_allowed(&host, 0).await {
                Ok(addrs) => Ok(Box::new(addrs.into_iter()) as Addrs),
                Err(violation) => Err(Box::new(violation) as Box<dyn std::error::Error + Send + Sync>),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_local_private_and_metadata_targets() {
        for target in [
            "http://169.254.169.254/",
            "http://localhost/",
            "http://10.0.0.5/",
            "file:///etc/passwd",
            "http://127.0.0.1:8080/admin",
            "http://192.168.1.1/",
            "http://172.16.4.2/",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://metadata.google.internal/",
            "http://printer.local/",
            "http://0.0.0.0/",
            "ftp://example.com/",
        ] {
            assert!(validate_target(target).is_err(), "{target} should be blocked");
        }
    }

    #[test]
    fn accepts_public_https_target() {
        let url = validate_target("https://api.example.com/").unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));
    }

    #[tokio::test]
    async fn resolved_local_name_is_refused() {
        let err = resolve_allowed("localhost", 80).await.unwrap_err();
        assert!(matches!(err, SsrfViolation::Address { ip, .. } if ip.is_loopback()));
    }

    #[test]
    fn violation_kinds_are_specific() {
        assert_eq!(
            validate_target("file:///etc/passwd"),
            Err(SsrfViolation::Scheme("file".into()))
        );
        assert!(matches!(
            validate_target("http://169.254.169.254/latest/meta-data"),
            Err(SsrfViolation::Address { .. })
        ));
    }
}
