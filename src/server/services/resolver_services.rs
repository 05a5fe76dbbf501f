use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use tracing::{debug, error, warn};
use url::{Host, Url};

use crate::server::error::{AppResult, Error};

use super::address_services::{AddressPolicy, Verdict, is_blocked_hostname};

pub type DynHostResolver = Arc<dyn HostResolverTrait + Send + Sync>;

/// dns seam so tests can script what a hostname resolves to
#[automock]
#[async_trait]
pub trait HostResolverTrait {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// plain getaddrinfo through tokio
pub struct SystemHostResolver;

#[async_trait]
impl HostResolverTrait for SystemHostResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// a url that made it through validation. there's no way to build one without going through
/// `TargetResolver::resolve`, so holding one means the address was checked
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    raw_url: String,
    url: Url,
    scheme: Scheme,
    hostname: String,
    port: u16,
    resolved_address: IpAddr,
}

impl ProxyTarget {
    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn resolved_address(&self) -> IpAddr {
        self.resolved_address
    }

    /// true when the url names an ip directly and no dns was involved
    pub fn is_ip_literal(&self) -> bool {
        !matches!(self.url.host(), Some(Host::Domain(_)))
    }
}

/// parse -> scheme -> hostname blocklist -> literal or dns -> address check
///
/// only the first address dns hands back is used and it gets pinned for the connect, see
/// `UpstreamFetcher`
#[derive(Clone)]
pub struct TargetResolver {
    resolver: DynHostResolver,
    policy: AddressPolicy,
}

impl TargetResolver {
    pub fn new(resolver: DynHostResolver, policy: AddressPolicy) -> Self {
        Self { resolver, policy }
    }

    pub async fn resolve(&self, raw_url: &str) -> AppResult<ProxyTarget> {
        let url = Url::parse(raw_url).map_err(|e| {
            debug!("rejecting unparseable url: {}", e);
            Error::InvalidUrl
        })?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                debug!("rejecting scheme {}", other);
                return Err(Error::UnsupportedScheme);
            }
        };

        let port = url.port_or_known_default().ok_or(Error::InvalidUrl)?;

        let (hostname, resolved_address) = match url.host() {
            Some(Host::Ipv4(v4)) => (v4.to_string(), IpAddr::V4(v4)),
            Some(Host::Ipv6(v6)) => (v6.to_string(), IpAddr::V6(v6)),
            Some(Host::Domain(domain)) => {
                if is_blocked_hostname(domain) {
                    warn!("blocked hostname {}", domain);
                    return Err(Error::BlockedHost);
                }
                let address = self.lookup_first(domain, port).await?;
                (domain.to_string(), address)
            }
            None => return Err(Error::InvalidUrl),
        };

        if self.policy.verdict(&resolved_address) == Verdict::Blocked {
            // the address itself stays out of the logs on purpose, the hostname is enough to
            // find the offender
            warn!("blocked target address for host {}", hostname);
            return Err(Error::BlockedAddress);
        }

        debug!("target {} validated", hostname);

        Ok(ProxyTarget {
            raw_url: raw_url.to_string(),
            url,
            scheme,
            hostname,
            port,
            resolved_address,
        })
    }

    async fn lookup_first(&self, host: &str, port: u16) -> AppResult<IpAddr> {
        let addresses = self.resolver.lookup(host, port).await.map_err(|e| {
            error!("dns lookup for {} failed: {}", host, e);
            Error::FetchFailed(format!("dns lookup failed: {}", e))
        })?;

        addresses.into_iter().next().ok_or_else(|| {
            error!("dns lookup for {} returned nothing", host);
            Error::FetchFailed("dns lookup returned no addresses".to_string())
        })
    }
}
