use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::info;

const ENV_USERNAME: &str = "CF_USERNAME";
const ENV_PASSWORD: &str = "CF_PASSWORD";
const ENV_PORT: &str = "PORT";

fn default_port() -> u16 {
    8080
}

fn default_instances() -> u16 {
    1
}

/// Process-wide configuration: global credentials, listen port and the
/// deployment targets, keyed by lower-cased environment name.
#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub environments: HashMap<String, Environment>,
}

/// Static configuration for one deployment target. Read-only during a
/// deploy; the ordered foundation list is the exact fan-out set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub domain: String,
    pub foundations: Vec<String>,
    pub authenticate: bool,
    pub skip_ssl: bool,
    pub disable_first_deploy_rollback: bool,
    pub instances: u16,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    environments: Option<Vec<RawEnvironment>>,
}

#[derive(Debug, Deserialize)]
struct RawEnvironment {
    name: Option<String>,
    domain: Option<String>,
    foundations: Option<Vec<String>>,
    #[serde(default)]
    authenticate: bool,
    #[serde(default)]
    skip_ssl: bool,
    #[serde(default)]
    disable_first_deploy_rollback: bool,
    instances: Option<u16>,
}

impl Config {
    /// Load configuration from the process environment and a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_sources(|key| std::env::var(key).ok(), path)
    }

    /// Like [`Config::load`] with an injectable environment lookup.
    pub fn from_sources(
        getenv: impl Fn(&str) -> Option<String>,
        path: &Path,
    ) -> Result<Self> {
        let (username, password) = required_credentials(&getenv)?;
        let port = match getenv(ENV_PORT).filter(|p| !p.is_empty()) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid {ENV_PORT} value: {raw}"))?,
            None => default_port(),
        };

        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let environments = parse_environments(&content)?;

        Ok(Self {
            username,
            password,
            port,
            environments,
        })
    }
}

fn required_credentials(
    getenv: &impl Fn(&str) -> Option<String>,
) -> Result<(String, String)> {
    let username = getenv(ENV_USERNAME).unwrap_or_default();
    let password = getenv(ENV_PASSWORD).unwrap_or_default();

    let missing: Vec<&str> = [(ENV_USERNAME, &username), (ENV_PASSWORD, &password)]
        .iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(key, _)| *key)
        .collect();

    if !missing.is_empty() {
        bail!("missing environment variables: {}", missing.join(", "));
    }
    Ok((username, password))
}

fn parse_environments(content: &str) -> Result<HashMap<String, Environment>> {
    let raw: RawConfig =
        serde_yaml::from_str(content).context("Failed to parse configuration file")?;

    let entries = raw
        .environments
        .filter(|entries| !entries.is_empty())
        .ok_or_else(|| anyhow!("environments key not specified in the configuration"))?;

    let mut environments = HashMap::new();
    for entry in entries {
        let environment = validate_environment(entry)?;
        environments.insert(environment.name.to_lowercase(), environment);
    }
    Ok(environments)
}

fn validate_environment(raw: RawEnvironment) -> Result<Environment> {
    let name = raw.name.filter(|n| !n.is_empty());
    let domain = raw.domain.filter(|d| !d.is_empty());
    let foundations = raw.foundations.filter(|f| !f.is_empty());

    match (name, domain, foundations) {
        (Some(name), Some(domain), Some(foundations)) => Ok(Environment {
            name,
            domain,
            foundations,
            authenticate: raw.authenticate,
            skip_ssl: raw.skip_ssl,
            disable_first_deploy_rollback: raw.disable_first_deploy_rollback,
            instances: raw.instances.unwrap_or_else(default_instances),
        }),
        _ => bail!("missing required environment parameter in the configuration"),
    }
}
