pub mod address_services;
pub mod playlist_services;
pub mod proxy_services;
pub mod relay_services;
pub mod resolver_services;
pub mod upstream_services;

pub use proxy_services::ProxyServices;
pub use resolver_services::DynHostResolver;
