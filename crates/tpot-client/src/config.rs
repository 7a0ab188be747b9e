//! Client configuration

use regex_lite::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tpot_proto::CONNECT_PATH;
use url::Url;

use crate::TunnelError;

/// Accepted endpoint grammar: optional scheme, bare host, optional port, optional trailing slash
const ENDPOINT_PATTERN: &str = r"(?i)^(?:(https?)://)?([a-z0-9.]+)(?::([0-9]+))?/?$";

/// Letters, digits and hyphens, not starting with a hyphen
const SUBDOMAIN_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9-]{0,23}$";

fn endpoint_regex() -> &'static Regex {
    static ENDPOINT: OnceLock<Regex> = OnceLock::new();
    ENDPOINT.get_or_init(|| Regex::new(ENDPOINT_PATTERN).unwrap())
}

fn subdomain_regex() -> &'static Regex {
    static SUBDOMAIN: OnceLock<Regex> = OnceLock::new();
    SUBDOMAIN.get_or_init(|| Regex::new(SUBDOMAIN_PATTERN).unwrap())
}

const SERVER_EXAMPLES: &str = "Server is not valid. Examples of valid formats:
  tpot.example.com
  tpot.example.com:1234
  http://tpot.example.com
  https://tpot.example.com
  https://tpot.example.com:1234";

const TARGET_EXAMPLES: &str = "Target is not valid. Examples of valid formats:
  127.0.0.1
  127.0.0.1:8080
  http://127.0.0.1
  http://localhost:1234";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_CLOSE_LINGER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    fn websocket(self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `[scheme://]host[:port]` endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlComponents {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Host plus the port exactly as written, if one was written
    pub host_with_port: String,
}

impl UrlComponents {
    /// Parse an endpoint. Returns `None` if it does not match the accepted grammar.
    pub fn parse(input: &str) -> Option<Self> {
        let captures = endpoint_regex().captures(input.trim())?;

        let scheme = match captures.get(1).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(s) if s == "https" => Scheme::Https,
            _ => Scheme::Http,
        };
        let host = captures[2].to_string();

        let (port, host_with_port) = match captures.get(3) {
            Some(port) => match port.as_str().parse::<u16>() {
                Ok(p) => (p, format!("{}:{}", host, port.as_str())),
                Err(_) => return None,
            },
            None => (scheme.default_port(), host.clone()),
        };

        Some(Self {
            scheme,
            host,
            port,
            host_with_port,
        })
    }
}

impl std::fmt::Display for UrlComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host_with_port)
    }
}

/// What to do with the `Host` header of tunneled requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRewrite {
    To(String),
    Disabled,
}

impl HostRewrite {
    pub fn host(&self) -> Option<&str> {
        match self {
            HostRewrite::To(host) => Some(host),
            HostRewrite::Disabled => None,
        }
    }
}

/// Resolved tunnel configuration
#[derive(Clone)]
pub struct TunnelConfig {
    pub server: UrlComponents,
    pub auth_key: Option<String>,
    pub subdomain: Option<String>,
    pub target: UrlComponents,
    pub host_rewrite: HostRewrite,
    /// Upper bound on each upstream dial
    pub connect_timeout: Duration,
    /// Interval between WebSocket pings
    pub keepalive_interval: Duration,
    /// How long a half-closed conversation waits for the other side
    pub close_linger: Duration,
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("server", &self.server)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("subdomain", &self.subdomain)
            .field("target", &self.target)
            .field("host_rewrite", &self.host_rewrite)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("close_linger", &self.close_linger)
            .finish()
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// WebSocket URL of the relay's upgrade endpoint
    pub fn connection_url(&self) -> Result<Url, TunnelError> {
        let mut url = Url::parse(&format!(
            "{}://{}{}",
            self.server.scheme.websocket(),
            self.server.host_with_port,
            CONNECT_PATH
        ))
        .map_err(|e| TunnelError::ConfigError(format!("Invalid server URL: {}", e)))?;

        if let Some(subdomain) = &self.subdomain {
            url.query_pairs_mut().append_pair("subdomain", subdomain);
        }

        Ok(url)
    }

    /// Public URL of the tunnel once the relay has assigned a subdomain
    pub fn tunnel_url(&self, assigned_subdomain: &str) -> String {
        format!(
            "{}://{}.{}",
            self.server.scheme, assigned_subdomain, self.server.host_with_port
        )
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    server: Option<String>,
    auth_key: Option<String>,
    subdomain: Option<String>,
    target: Option<String>,
    rewrite_host: Option<String>,
    no_host_rewrite: bool,
    connect_timeout: Option<Duration>,
    keepalive_interval: Option<Duration>,
    close_linger: Option<Duration>,
}

impl TunnelConfigBuilder {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn auth_key(mut self, key: Option<String>) -> Self {
        self.auth_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn subdomain(mut self, subdomain: Option<String>) -> Self {
        self.subdomain = subdomain;
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn rewrite_host(mut self, host: Option<String>) -> Self {
        self.rewrite_host = host;
        self
    }

    pub fn no_host_rewrite(mut self, disabled: bool) -> Self {
        self.no_host_rewrite = disabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn close_linger(mut self, linger: Duration) -> Self {
        self.close_linger = Some(linger);
        self
    }

    pub fn build(self) -> Result<TunnelConfig, TunnelError> {
        let server = self.server.ok_or_else(|| {
            TunnelError::ConfigError(
                "Server is not specified by configuration file or CLI option.".to_string(),
            )
        })?;
        let server = UrlComponents::parse(&server)
            .ok_or_else(|| TunnelError::ConfigError(SERVER_EXAMPLES.to_string()))?;

        let target = self
            .target
            .ok_or_else(|| TunnelError::ConfigError("Target is not specified.".to_string()))?;
        let target = UrlComponents::parse(&target)
            .ok_or_else(|| TunnelError::ConfigError(TARGET_EXAMPLES.to_string()))?;
        if target.scheme == Scheme::Https {
            return Err(TunnelError::ConfigError(
                "HTTPS targets not yet implemented. Check back soon!".to_string(),
            ));
        }

        if let Some(subdomain) = &self.subdomain {
            if !subdomain_regex().is_match(subdomain) {
                return Err(TunnelError::ConfigError(
                    "Subdomain is not valid. Subdomains may contain uppercase and lowercase letters, digits 0-9, and hyphens, must not start with a hyphen, and may be at most 24 characters long.".to_string(),
                ));
            }
        }

        let host_rewrite = if self.no_host_rewrite {
            HostRewrite::Disabled
        } else {
            match self.rewrite_host.filter(|h| !h.is_empty()) {
                Some(host) => HostRewrite::To(host),
                None => HostRewrite::To(target.host_with_port.clone()),
            }
        };

        Ok(TunnelConfig {
            server,
            auth_key: self.auth_key,
            subdomain: self.subdomain,
            target,
            host_rewrite,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            keepalive_interval: self
                .keepalive_interval
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
            close_linger: self.close_linger.unwrap_or(DEFAULT_CLOSE_LINGER),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Option<UrlComponents> {
        UrlComponents::parse(input)
    }

    #[test]
    fn test_parse_endpoint_defaults() {
        let url = parse("tpot.example.com").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "tpot.example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.host_with_port, "tpot.example.com");

        let url = parse("HTTPS://Tpot.Example.com/").unwrap();
        assert_eq!(url.scheme, Scheme::Https);
        assert_eq!(url.port, 443);
    }

    #[test]
    fn test_parse_endpoint_with_port() {
        let url = parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 8080);
        assert_eq!(url.host_with_port, "127.0.0.1:8080");
        assert_eq!(url.to_string(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_parse_endpoint_rejects_paths_and_junk() {
        assert!(parse("http://example.com/path").is_none());
        assert!(parse("ftp://example.com").is_none());
        assert!(parse("exa mple.com").is_none());
        assert!(parse("example.com:99999").is_none());
        assert!(parse("").is_none());
    }

    fn base() -> TunnelConfigBuilder {
        TunnelConfig::builder()
            .server("https://tpot.example.com")
            .target("localhost:3000")
    }

    #[test]
    fn test_build_defaults() {
        let config = base().build().unwrap();

        assert_eq!(config.host_rewrite, HostRewrite::To("localhost:3000".into()));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert!(config.auth_key.is_none());
    }

    #[test]
    fn test_build_host_rewrite_policy() {
        let config = base()
            .rewrite_host(Some("app.internal".into()))
            .build()
            .unwrap();
        assert_eq!(config.host_rewrite, HostRewrite::To("app.internal".into()));

        let config = base()
            .rewrite_host(Some("app.internal".into()))
            .no_host_rewrite(true)
            .build()
            .unwrap();
        assert_eq!(config.host_rewrite, HostRewrite::Disabled);
    }

    #[test]
    fn test_build_rejects_https_target() {
        let result = TunnelConfig::builder()
            .server("tpot.example.com")
            .target("https://localhost:3000")
            .build();
        assert!(matches!(result, Err(TunnelError::ConfigError(_))));
    }

    #[test]
    fn test_build_requires_server() {
        let result = TunnelConfig::builder().target("localhost").build();
        assert!(matches!(result, Err(TunnelError::ConfigError(msg)) if msg.contains("Server is not specified")));
    }

    #[test]
    fn test_build_validates_subdomain() {
        assert!(base().subdomain(Some("my-App-1".into())).build().is_ok());
        assert!(base().subdomain(Some("-bad".into())).build().is_err());
        assert!(base().subdomain(Some("has.dot".into())).build().is_err());
        assert!(base().subdomain(Some("a".repeat(25))).build().is_err());
    }

    #[test]
    fn test_connection_url() {
        let config = base().build().unwrap();
        assert_eq!(
            config.connection_url().unwrap().as_str(),
            "wss://tpot.example.com/create-tpot"
        );

        let config = TunnelConfig::builder()
            .server("localhost:9000")
            .target("localhost:3000")
            .subdomain(Some("demo".into()))
            .build()
            .unwrap();
        assert_eq!(
            config.connection_url().unwrap().as_str(),
            "ws://localhost:9000/create-tpot?subdomain=demo"
        );
    }

    #[test]
    fn test_tunnel_url() {
        let config = TunnelConfig::builder()
            .server("https://tpot.example.com:8443")
            .target("localhost:3000")
            .build()
            .unwrap();
        assert_eq!(
            config.tunnel_url("quiet-lake"),
            "https://quiet-lake.tpot.example.com:8443"
        );
    }

    #[test]
    fn test_debug_redacts_auth_key() {
        let config = base().auth_key(Some("topsecret".into())).build().unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("topsecret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_patterns_are_compiled_once() {
        assert!(std::ptr::eq(endpoint_regex(), endpoint_regex()));
        assert!(std::ptr::eq(subdomain_regex(), subdomain_regex()));
        assert!(subdomain_regex().is_match("a-1"));
        assert!(!subdomain_regex().is_match("-a"));
    }
}
