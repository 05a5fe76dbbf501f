use ipnet::IpNet;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // path the proxy is mounted on, rewritten playlists point back at this path so if you put
    // the app behind a prefix (like /api/v1/proxy) set it here
    #[clap(long, env, default_value = "/proxy", value_parser = parse_proxy_path)]
    pub proxy_path: String,

    // only sent upstream when the caller didn't send one
    #[clap(long, env, default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    // upstream connect timeout
    #[clap(long, env, default_value = "10")]
    pub connect_timeout_secs: u64,

    // max time a single upstream read (headers or a body chunk) may sit idle. live streams can
    // be long lived so this is per read and not for the whole response
    #[clap(long, env, default_value = "30")]
    pub idle_timeout_secs: u64,

    // comma separated list of CIDRs that are exempt from the private address blocklist, like
    // 10.20.0.0/16,fd00:abcd::/32. leave empty unless you really trust what lives there
    #[clap(long, env, value_delimiter = ',')]
    pub ssrf_allowlist: Vec<IpNet>,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

// axum refuses to mount a route that doesn't start with a slash, catch it here instead of
// panicking while the router gets built
fn parse_proxy_path(value: &str) -> Result<String, String> {
    if !value.starts_with('/') {
        return Err(format!("proxy path must start with '/', got {:?}", value));
    }
    if value.len() > 1 && value.ends_with('/') {
        return Err(format!("proxy path must not end with '/', got {:?}", value));
    }
    if value.contains(['?', '#', '{', '}', '*']) {
        return Err(format!("proxy path must be a plain path, got {:?}", value));
    }
    Ok(value.to_string())
}

impl Default for AppConfig {
    // mirrors the clap defaults, mostly used by tests
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            proxy_path: "/proxy".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 30,
            ssrf_allowlist: Vec::new(),
            sentry_dsn: None,
        }
    }
}
