use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;

use super::{
    address_services::AddressPolicy,
    playlist_services::PlaylistRewriter,
    resolver_services::{DynHostResolver, SystemHostResolver, TargetResolver},
    upstream_services::UpstreamFetcher,
};

/// everything a proxy request needs. all of it is read only after startup, there's no state
/// that one request can leave behind for the next
#[derive(Clone)]
pub struct ProxyServices {
    pub targets: TargetResolver,
    pub fetcher: Arc<UpstreamFetcher>,
    pub rewriter: Arc<PlaylistRewriter>,
    pub config: Arc<AppConfig>,
}

impl ProxyServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self::with_resolver(config, Arc::new(SystemHostResolver))
    }

    /// same as `new` but with a different dns resolver, tests use this to script lookups
    pub fn with_resolver(config: Arc<AppConfig>, resolver: DynHostResolver) -> Self {
        info!("starting proxy services...");

        if !config.ssrf_allowlist.is_empty() {
            info!(
                "{} range(s) exempt from the private address blocklist",
                config.ssrf_allowlist.len()
            );
        }

        let policy = AddressPolicy::new(config.ssrf_allowlist.clone());
        let targets = TargetResolver::new(resolver, policy);
        let fetcher = Arc::new(UpstreamFetcher::new(&config));
        let rewriter = Arc::new(PlaylistRewriter::new(config.proxy_path.clone()));

        Self {
            targets,
            fetcher,
            rewriter,
            config,
        }
    }
}
