//! Endpoint sources for the publisher.
//!
//! Each source yields at most one endpoint. A failing source is logged and
//! skipped; it never aborts a publish.

use std::{
    net::{IpAddr, Ipv6Addr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::envelope::{Endpoint, Family, PRIORITY_IP, PRIORITY_ONION, PRIORITY_PROVISIONED_ONION};

/// Public resolver address used only to pick the outbound IPv6 interface.
/// No packet is sent.
const IPV6_PROBE: &str = "[2001:4860:4860::8888]:80";
pub const EXTERNAL_IP_URL: &str = "https://api.ipify.org";
const EXTERNAL_IP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSource {
    /// Operator supplied IPv4 or IPv6 address.
    ManualIp(String),
    /// Global IPv6 address of the outbound interface.
    LocalIpv6,
    /// Public IP as reported by an HTTP echo service.
    ExternalIp { url: String },
    /// Operator supplied `.onion` host.
    ManualOnion(String),
    /// `.onion` host read from a hidden service directory's `hostname` file.
    ProvisionedOnion(PathBuf),
}

impl EndpointSource {
    pub async fn discover(&self, port: u16) -> Result<Option<Endpoint>> {
        match self {
            EndpointSource::ManualIp(raw) => {
                let ip: IpAddr = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid ip address {raw:?}"))?;
                Ok(Some(ip_endpoint(ip, port)))
            }
            EndpointSource::LocalIpv6 => Ok(local_ipv6().await?.map(|ip| ip_endpoint(IpAddr::V6(ip), port))),
            EndpointSource::ExternalIp { url } => {
                let ip = external_ip(url).await?;
                Ok(Some(ip_endpoint(ip, port)))
            }
            EndpointSource::ManualOnion(host) => {
                Ok(Some(onion_endpoint(host.trim(), port, PRIORITY_ONION)?))
            }
            EndpointSource::ProvisionedOnion(dir) => {
                let path = dir.join("hostname");
                let host = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok(Some(onion_endpoint(host.trim(), port, PRIORITY_PROVISIONED_ONION)?))
            }
        }
    }

    fn yields_ip(&self) -> bool {
        matches!(
            self,
            EndpointSource::ManualIp(_) | EndpointSource::LocalIpv6 | EndpointSource::ExternalIp { .. }
        )
    }
}

/// What the operator asked the publisher to advertise.
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    pub ip: Option<String>,
    /// Fall back to the external lookup when no IP was found locally.
    pub discover_ip: bool,
    pub onion: Option<String>,
    pub onion_dir: Option<PathBuf>,
    pub port: u16,
}

impl EndpointConfig {
    /// Sources in collection order: provisioned onion, manual onion, IP.
    pub fn sources(&self) -> Vec<EndpointSource> {
        let mut sources = Vec::new();
        if let Some(dir) = &self.onion_dir {
            sources.push(EndpointSource::ProvisionedOnion(dir.clone()));
        }
        if let Some(onion) = &self.onion {
            sources.push(EndpointSource::ManualOnion(onion.clone()));
        }
        match &self.ip {
            Some(ip) => sources.push(EndpointSource::ManualIp(ip.clone())),
            None => {
                sources.push(EndpointSource::LocalIpv6);
                if self.discover_ip {
                    sources.push(EndpointSource::ExternalIp {
                        url: EXTERNAL_IP_URL.to_string(),
                    });
                }
            }
        }
        sources
    }
}

/// Run `sources` in order. An IP source is skipped once another one produced
/// an address.
pub async fn collect_endpoints(sources: &[EndpointSource], port: u16) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    let mut have_ip = false;
    for source in sources {
        if source.yields_ip() && have_ip {
            continue;
        }
        match source.discover(port).await {
            Ok(Some(ep)) => {
                info!(uri = %ep.uri, family = ?ep.family, "adding endpoint");
                have_ip |= source.yields_ip();
                endpoints.push(ep);
            }
            Ok(None) => debug!(?source, "no endpoint"),
            Err(e) => warn!(?source, "endpoint source failed: {e:#}"),
        }
    }
    endpoints
}

fn ip_endpoint(ip: IpAddr, port: u16) -> Endpoint {
    match ip {
        IpAddr::V4(v4) => Endpoint::tcp(format!("{v4}:{port}"), PRIORITY_IP, Family::Ipv4),
        IpAddr::V6(v6) => Endpoint::tcp(format!("[{v6}]:{port}"), PRIORITY_IP, Family::Ipv6),
    }
}

fn onion_endpoint(host: &str, port: u16, priority: u32) -> Result<Endpoint> {
    if !host.ends_with(".onion") || host.len() <= ".onion".len() {
        return Err(anyhow!("not an onion host: {host:?}"));
    }
    Ok(Endpoint::tcp(format!("{host}:{port}"), priority, Family::Onion))
}

/// Address the kernel would use for outbound IPv6, if it looks public.
async fn local_ipv6() -> Result<Option<Ipv6Addr>> {
    let socket = UdpSocket::bind("[::]:0").await?;
    socket.connect(IPV6_PROBE).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V6(ip) if is_public_ipv6(&ip) => Ok(Some(ip)),
        other => {
            debug!(%other, "outbound address is not a public ipv6");
            Ok(None)
        }
    }
}

/// Excludes unspecified, loopback, link-local (`fe80::/10`) and unique-local
/// (`fc00::/7`) addresses.
fn is_public_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_unspecified() || ip.is_loopback() || (first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00)
}

async fn external_ip(url: &str) -> Result<IpAddr> {
    let client = reqwest::Client::builder().timeout(EXTERNAL_IP_TIMEOUT).build()?;
    let body = client.get(url).send().await?.error_for_status()?.text().await?;
    body.trim()
        .parse()
        .with_context(|| format!("{url} returned {body:?}"))
}
