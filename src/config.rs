//! Configuration file model, validation and resolution
//!
//! The on-disk format is JSON with camelCase keys. A [`ConfigFile`] is
//! validated, merged with environment overrides and resolved into a
//! [`RuntimeConfig`]: TLS files read, regexes compiled and every route
//! given a fresh [`RuleId`](crate::models::RuleId).

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use regex::RegexBuilder;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, RouterError};
use crate::models::{
    DomainMatcher, OneOrMany, ProxyListenOptions, ProxyRuntimeConfig, RouteMatch, RouteRule,
    ServerType, TlsMaterial, UpstreamSpec,
};
use crate::proxy::upstream::Upstream;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_API_HOST: &str = "0.0.0.0";
pub const DEFAULT_API_PORT: u16 = 3000;
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

pub const ENV_CONFIG_PATH: &str = "PROXY_ROUTER_CONFIG";
pub const ENV_API_HOST: &str = "PROXY_ROUTER_API_HOST";
pub const ENV_API_PORT: &str = "PROXY_ROUTER_API_PORT";
pub const ENV_API_TOKEN: &str = "PROXY_ROUTER_API_TOKEN";

// ---------------------------------------------------------------------------
// File model
// ---------------------------------------------------------------------------

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub api: ApiConfigInput,
    pub proxy: ProxyConfigInput,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiConfigInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The `proxy` section; also the body of `PUT /v1/proxy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyConfigInput {
    pub listen: ListenConfigInput,
    #[serde(default)]
    pub routes: Vec<RouteRuleInput>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_realm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListenConfigInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<ServerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<HttpsInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpsInput {
    pub key_file: String,
    pub cert_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteRuleInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<RouteMatchInput>,
    /// Absent: no decision. `null`: direct. String or list: upstream(s).
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub upstream: Option<Option<OneOrMany<String>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteMatchInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainMatcherInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<DomainMatcherInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<OneOrMany<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_http: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<OneOrMany<String>>,
}

/// A domain string, or `{ "pattern": "...", "flags": "i" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainMatcherInput {
    Literal(String),
    Pattern(PatternInput),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternInput {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

/// Distinguishes an explicit `null` from an absent field
fn deserialize_some<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl ConfigFile {
    /// Parse and validate a configuration document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ConfigFile = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation. The API token is checked later, after
    /// environment overrides are applied.
    pub fn validate(&self) -> Result<()> {
        if self.api.port == Some(0) {
            return Err(invalid("api.port", "must be between 1 and 65535"));
        }
        self.proxy.validate()
    }
}

impl ProxyConfigInput {
    pub fn validate(&self) -> Result<()> {
        let listen = &self.listen;
        if listen.port == 0 {
            return Err(invalid("proxy.listen.port", "must be between 1 and 65535"));
        }

        if let Some(https) = &listen.https {
            if https.key_file.is_empty() {
                return Err(invalid("proxy.listen.https.keyFile", "must not be empty"));
            }
            if https.cert_file.is_empty() {
                return Err(invalid("proxy.listen.https.certFile", "must not be empty"));
            }
        }

        if listen.server_type == Some(ServerType::Https) && listen.https.is_none() {
            return Err(invalid(
                "proxy.listen",
                "HTTPS listen configuration requires https.keyFile and https.certFile",
            ));
        }

        validate_routes(&self.routes)
    }
}

/// Validate a route list, as sent to `PUT /v1/routes`
pub fn validate_routes(routes: &[RouteRuleInput]) -> Result<()> {
    for (index, route) in routes.iter().enumerate() {
        route.to_rule(index)?;
    }
    Ok(())
}

impl RouteRuleInput {
    /// Build a rule with a fresh identity
    pub fn to_rule(&self, index: usize) -> Result<RouteRule> {
        let path = format!("proxy.routes[{}]", index);

        let matcher = self
            .matcher
            .as_ref()
            .map(|m| m.to_match(&path))
            .transpose()?;

        let upstream = match &self.upstream {
            None => UpstreamSpec::Unset,
            Some(None) => UpstreamSpec::Direct,
            Some(Some(OneOrMany::One(url))) => {
                check_upstream(&path, url)?;
                UpstreamSpec::Single(url.clone())
            }
            Some(Some(OneOrMany::Many(urls))) => {
                if urls.is_empty() {
                    return Err(invalid(&format!("{}.upstream", path), "must not be empty"));
                }
                for url in urls {
                    check_upstream(&path, url)?;
                }
                UpstreamSpec::RoundRobin(urls.clone())
            }
        };

        Ok(RouteRule::new(self.name.clone(), matcher, upstream))
    }
}

impl RouteMatchInput {
    fn to_match(&self, rule_path: &str) -> Result<RouteMatch> {
        let path = format!("{}.match", rule_path);

        let domain = self
            .domain
            .as_ref()
            .map(|d| d.compile(&format!("{}.domain", path)))
            .transpose()?;
        let hostname = self
            .hostname
            .as_ref()
            .map(|d| d.compile(&format!("{}.hostname", path)))
            .transpose()?;

        if let Some(port) = &self.port {
            if port.is_empty() {
                return Err(invalid(&format!("{}.port", path), "must not be empty"));
            }
            if port.contains(&0) {
                return Err(invalid(
                    &format!("{}.port", path),
                    "must be between 1 and 65535",
                ));
            }
        }

        if let Some(method) = &self.method {
            if method.is_empty() {
                return Err(invalid(&format!("{}.method", path), "must not be empty"));
            }
        }

        Ok(RouteMatch {
            domain,
            hostname,
            port: self.port.clone(),
            is_http: self.is_http,
            method: self.method.as_ref().map(|m| m.map(|s| s.to_uppercase())),
        })
    }
}

impl DomainMatcherInput {
    fn compile(&self, path: &str) -> Result<DomainMatcher> {
        match self {
            DomainMatcherInput::Literal(domain) => {
                if domain.is_empty() {
                    return Err(invalid(path, "must not be empty"));
                }
                Ok(DomainMatcher::literal(domain))
            }
            DomainMatcherInput::Pattern(input) => {
                if input.pattern.is_empty() {
                    return Err(invalid(&format!("{}.pattern", path), "must not be empty"));
                }

                let mut builder = RegexBuilder::new(&input.pattern);
                for flag in input.flags.as_deref().unwrap_or("").chars() {
                    match flag {
                        'i' => {
                            builder.case_insensitive(true);
                        }
                        'm' => {
                            builder.multi_line(true);
                        }
                        's' => {
                            builder.dot_matches_new_line(true);
                        }
                        // Unicode is always on; global/sticky have no meaning
                        // for a stateless match.
                        'u' | 'g' | 'y' => {}
                        other => {
                            return Err(invalid(
                                &format!("{}.flags", path),
                                &format!("unsupported flag '{}'", other),
                            ));
                        }
                    }
                }

                builder
                    .build()
                    .map(DomainMatcher::Pattern)
                    .map_err(|e| invalid(&format!("{}.pattern", path), &e.to_string()))
            }
        }
    }
}

fn check_upstream(rule_path: &str, url: &str) -> Result<()> {
    Upstream::parse(url)
        .map(|_| ())
        .map_err(|e| invalid(&format!("{}.upstream", rule_path), &e.to_string()))
}

fn invalid(path: &str, message: &str) -> RouterError {
    RouterError::InvalidConfig(format!("{}: {}", path, message))
}

// ---------------------------------------------------------------------------
// Environment overrides and resolution
// ---------------------------------------------------------------------------

/// API settings taken from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    pub api_token: Option<String>,
}

impl EnvOverrides {
    /// Read overrides. Empty values are ignored, as is a non-numeric port.
    pub fn from_env() -> Self {
        Self {
            api_host: non_empty_env(ENV_API_HOST),
            api_port: non_empty_env(ENV_API_PORT).and_then(|p| p.trim().parse().ok()),
            api_token: non_empty_env(ENV_API_TOKEN),
        }
    }

    pub fn apply(&self, api: &ApiConfigInput) -> ApiConfigInput {
        ApiConfigInput {
            host: self.api_host.clone().or_else(|| api.host.clone()),
            port: self.api_port.or(api.port),
            token: self.api_token.clone().or_else(|| api.token.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRuntimeConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
}

impl ApiRuntimeConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub api: ApiRuntimeConfig,
    pub proxy: ProxyRuntimeConfig,
}

/// Validate `config`, apply `env` and resolve it against `base_dir`
pub async fn build_runtime_config(
    config: &ConfigFile,
    base_dir: &Path,
    env: &EnvOverrides,
) -> Result<RuntimeConfig> {
    config.validate()?;

    let api = resolve_api(&env.apply(&config.api))?;
    let proxy = resolve_proxy(&config.proxy, base_dir).await?;

    Ok(RuntimeConfig { api, proxy })
}

fn resolve_api(api: &ApiConfigInput) -> Result<ApiRuntimeConfig> {
    let token = api.token.clone().filter(|t| !t.is_empty()).ok_or_else(|| {
        RouterError::InvalidConfig(format!(
            "API token is required. Set api.token in the config file or {}.",
            ENV_API_TOKEN
        ))
    })?;

    let port = api.port.unwrap_or(DEFAULT_API_PORT);
    if port == 0 {
        return Err(invalid("api.port", "must be between 1 and 65535"));
    }

    Ok(ApiRuntimeConfig {
        host: api.host.clone().unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
        port,
        token,
    })
}

/// Resolve the proxy section into a runtime config with fresh rule ids
pub async fn resolve_proxy(proxy: &ProxyConfigInput, base_dir: &Path) -> Result<ProxyRuntimeConfig> {
    proxy.validate()?;

    let routes = proxy
        .routes
        .iter()
        .enumerate()
        .map(|(index, route)| route.to_rule(index))
        .collect::<Result<Vec<_>>>()?;

    Ok(ProxyRuntimeConfig {
        listen: resolve_listen(&proxy.listen, base_dir).await?,
        routes: Arc::from(routes),
        verbose: proxy.verbose,
        auth_realm: proxy.auth_realm.clone(),
    })
}

async fn resolve_listen(listen: &ListenConfigInput, base_dir: &Path) -> Result<ProxyListenOptions> {
    let host = listen
        .host
        .clone()
        .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string());
    let server_type = listen.server_type.unwrap_or_default();

    let tls = match (server_type, &listen.https) {
        (ServerType::Https, Some(https)) => {
            let key = read_file(&resolve_file_path(base_dir, &https.key_file)).await?;
            let cert = read_file(&resolve_file_path(base_dir, &https.cert_file)).await?;
            let ca = match &https.ca_file {
                Some(ca_file) if !ca_file.is_empty() => {
                    Some(read_file(&resolve_file_path(base_dir, ca_file)).await?)
                }
                _ => None,
            };

            Some(Arc::new(TlsMaterial {
                key,
                cert,
                ca,
                passphrase: https.passphrase.clone().filter(|p| !p.is_empty()),
            }))
        }
        (ServerType::Https, None) => {
            return Err(invalid(
                "proxy.listen",
                "HTTPS listen configuration requires https.keyFile and https.certFile",
            ));
        }
        (ServerType::Http, _) => None,
    };

    Ok(ProxyListenOptions {
        host,
        port: listen.port,
        server_type,
        tls,
    })
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|source| RouterError::ConfigFile {
            path: path.display().to_string(),
            source,
        })
}

/// Absolute paths are kept; relative paths are joined onto `base_dir`
pub fn resolve_file_path(base_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

// ---------------------------------------------------------------------------
// Process settings
// ---------------------------------------------------------------------------

/// Command-line arguments, each backed by an environment variable
#[derive(Debug, Parser)]
#[command(name = "proxy-router")]
#[command(about = "Rule-based upstream routing for a forward proxy", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path of the JSON configuration file
    #[arg(short, long, env = ENV_CONFIG_PATH, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level or filter directive
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, ignore_case = true, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Process-level settings from arguments and environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Path of the JSON configuration file
    pub config_path: PathBuf,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level or filter directive (default: info)
    pub level: String,
    pub format: LogFormat,
}

impl From<Cli> for AppConfig {
    fn from(cli: Cli) -> Self {
        let config_path = if cli.config.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_CONFIG_PATH)
        } else {
            cli.config
        };

        AppConfig {
            config_path,
            log: LogConfig {
                level: cli.log_level,
                format: cli.log_format,
            },
        }
    }
}

impl AppConfig {
    /// Parse settings from an argument list whose first item is the program
    /// name. `--config` wins over `PROXY_ROUTER_CONFIG`.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Cli::try_parse_from(args)
            .map(AppConfig::from)
            .map_err(|e| RouterError::InvalidConfig(e.to_string()))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
