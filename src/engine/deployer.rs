//! The deploy pipeline: one inbound request becomes N coordinated
//! foundation pushes with all-or-nothing semantics.
//!
//! The pipeline is a straight-line state machine. Descriptor assembly,
//! credential resolution and manifest acquisition happen before any event
//! fires; once the evented phase is entered, `deploy.finish` is guaranteed
//! to fire on every exit path, after exactly one of
//! `deploy.success`/`deploy.failure` when the push phase was reached.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::courier::CourierError;
use crate::engine::bluegreen::BlueGreener;
use crate::engine::events::{DeployEventData, Event, EventManager};
use crate::engine::fetcher::Fetcher;
use crate::engine::prechecker::Prechecker;
use crate::engine::sink::ProgressSink;

const UUID_LENGTH: usize = 128;

const BASIC_AUTH_NOT_FOUND: &str = "basic auth header not found";
const CANNOT_OPEN_MANIFEST: &str = "cannot open manifest file";
const CANNOT_FIND_MANIFEST: &str = "cannot find manifest file in zip";
const DEPLOY_START_ERROR: &str = "an error occurred in the deploy.start event";

const SUCCESS_BANNER: &str = "Your deploy was successful! (^_^)d
If you experience any problems after this point, check that you can manually push your application to Cloud Foundry on a lower environment.
It is likely that it is an error with your application and not with Deployadactyl.
Thanks for using Deployadactyl! Please push down pull up on your lap bar and exit to your left.";

/// Request body formats the pipeline accepts. Anything else is rejected by
/// the HTTP layer before the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeployContentType {
    #[default]
    Json,
    Zip,
}

/// The recognized fields of a JSON deploy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployDescriptor {
    pub artifact_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<u16>,
}

/// The authoritative descriptor of one deploy attempt. Assembled once at
/// pipeline entry and frozen before `deploy.start` fires.
#[derive(Debug, Clone, Default)]
pub struct DeploymentInfo {
    pub artifact_url: String,
    pub username: String,
    pub password: String,
    pub environment: String,
    pub org: String,
    pub space: String,
    pub app_name: String,
    pub manifest: String,
    pub uuid: String,
    pub skip_ssl: bool,
    pub instances: Option<u16>,
    pub content_type: DeployContentType,
}

/// Everything the HTTP layer hands the pipeline for one request.
#[derive(Debug, Clone)]
pub struct DeployParams {
    pub environment: String,
    pub org: String,
    pub space: String,
    pub app_name: String,
    pub content_type: DeployContentType,
    /// Raw JSON request body; empty for zip deploys.
    pub body: Bytes,
    /// Extracted application directory; present for zip deploys.
    pub app_path: Option<PathBuf>,
    pub basic_auth: Option<(String, String)>,
}

/// A pipeline failure together with the HTTP status it maps to.
#[derive(Debug)]
pub struct DeployError {
    status: StatusCode,
    source: anyhow::Error,
}

impl DeployError {
    fn new(status: StatusCode, source: anyhow::Error) -> Self {
        Self { status, source }
    }

    fn bad_request(source: anyhow::Error) -> Self {
        Self::new(StatusCode::BAD_REQUEST, source)
    }

    fn unauthorized(source: anyhow::Error) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, source)
    }

    fn internal(source: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, source)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl std::fmt::Display for DeployError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

impl std::error::Error for DeployError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub struct Deployer {
    config: Config,
    blue_greener: Arc<dyn BlueGreener>,
    fetcher: Arc<dyn Fetcher>,
    prechecker: Arc<dyn Prechecker>,
    event_manager: Arc<EventManager>,
}

impl Deployer {
    pub fn new(
        config: Config,
        blue_greener: Arc<dyn BlueGreener>,
        fetcher: Arc<dyn Fetcher>,
        prechecker: Arc<dyn Prechecker>,
        event_manager: Arc<EventManager>,
    ) -> Self {
        Self {
            config,
            blue_greener,
            fetcher,
            prechecker,
            event_manager,
        }
    }

    /// Run one deploy end to end, writing live progress to `sink`.
    ///
    /// `Ok(())` means every foundation displays the new version (HTTP 200);
    /// an error carries the status code the failure maps to.
    pub async fn deploy(
        &self,
        params: DeployParams,
        sink: &ProgressSink,
    ) -> Result<(), DeployError> {
        let descriptor = match params.content_type {
            DeployContentType::Json => match parse_descriptor(&params.body) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    sink.write_line(format!("{err:#}"));
                    return Err(DeployError::internal(err));
                }
            },
            DeployContentType::Zip => DeployDescriptor {
                artifact_url: None,
                manifest: None,
                instances: None,
            },
        };

        let environment_key = params.environment.to_lowercase();
        let environment_config = self.config.environments.get(&environment_key);

        let authenticate = environment_config.map(|e| e.authenticate).unwrap_or(false);
        let (username, password) = match params.basic_auth.clone() {
            Some(credentials) => credentials,
            None if authenticate => {
                return Err(DeployError::unauthorized(anyhow!(BASIC_AUTH_NOT_FOUND)));
            }
            None => (self.config.username.clone(), self.config.password.clone()),
        };

        let artifact_url = match params.content_type {
            DeployContentType::Json => descriptor.artifact_url.clone().unwrap_or_default(),
            DeployContentType::Zip => format!(
                "Local Developer App Deploy {}",
                params.app_path.as_deref().unwrap_or(Path::new("")).display()
            ),
        };

        let mut info = DeploymentInfo {
            artifact_url,
            username,
            password,
            environment: params.environment.clone(),
            org: params.org.clone(),
            space: params.space.clone(),
            app_name: params.app_name.clone(),
            manifest: String::new(),
            uuid: random_runes(UUID_LENGTH),
            skip_ssl: environment_config.map(|e| e.skip_ssl).unwrap_or(false),
            instances: descriptor.instances,
            content_type: params.content_type,
        };

        let summary = format!(
            "Deployment Parameters:\n\tArtifact URL: {},\n\tUsername:     {},\n\tEnvironment:  {},\n\tOrg:          {},\n\tSpace:        {},\n\tAppName:      {}",
            info.artifact_url, info.username, info.environment, info.org, info.space, info.app_name
        );
        debug!("{summary}");
        sink.write_line(&summary);

        match params.content_type {
            DeployContentType::Json => {
                if let Some(encoded) = descriptor.manifest.as_deref().filter(|m| !m.is_empty()) {
                    match BASE64_STANDARD.decode(encoded) {
                        Ok(decoded) => {
                            info.manifest = String::from_utf8_lossy(&decoded).into_owned();
                        }
                        Err(err) => {
                            sink.write_line(err.to_string());
                            return Err(DeployError::bad_request(anyhow!(CANNOT_OPEN_MANIFEST)));
                        }
                    }
                }
            }
            DeployContentType::Zip => {
                let manifest_path = params
                    .app_path
                    .as_deref()
                    .unwrap_or(Path::new(""))
                    .join("manifest.yml");
                match tokio::fs::read_to_string(&manifest_path).await {
                    Ok(contents) => info.manifest = contents,
                    Err(_) => sink.write_line(CANNOT_FIND_MANIFEST),
                }
            }
        }

        // Frozen from here on; every worker reads the same descriptor.
        let info = Arc::new(info);
        let event_data = DeployEventData {
            sink: sink.clone(),
            info: info.clone(),
            request_body: params.body.clone(),
        };

        let result = self.evented_deploy(&params, &info, &event_data, sink).await;

        if let Err(err) = self
            .event_manager
            .emit(&Event::DeployFinish(event_data.clone()))
        {
            sink.write_line(format!("{err:#}"));
        }

        result
    }

    /// The stages bracketed by `deploy.start` and `deploy.finish`.
    async fn evented_deploy(
        &self,
        params: &DeployParams,
        info: &Arc<DeploymentInfo>,
        event_data: &DeployEventData,
        sink: &ProgressSink,
    ) -> Result<(), DeployError> {
        if let Err(err) = self
            .event_manager
            .emit(&Event::DeployStart(event_data.clone()))
        {
            sink.write_line(format!("{err:#}"));
            return Err(DeployError::internal(anyhow!(DEPLOY_START_ERROR)));
        }

        let environment = match self
            .config
            .environments
            .get(&info.environment.to_lowercase())
        {
            Some(environment) => environment.clone(),
            None => {
                if let Err(err) = self
                    .event_manager
                    .emit(&Event::DeployError(event_data.clone()))
                {
                    sink.write_line(format!("{err:#}"));
                }
                let err = anyhow!("environment not found: {}", info.environment);
                sink.write_line(err.to_string());
                return Err(DeployError::internal(err));
            }
        };

        if let Err(err) = self.prechecker.assert_all_foundations_up(&environment).await {
            sink.write_line(format!("{err:#}"));
            return Err(DeployError::internal(err));
        }

        // For JSON deploys the artifact directory lives exactly as long as
        // this scope: dropping the handle removes it on every exit path.
        let fetched;
        let app_path: &Path = match info.content_type {
            DeployContentType::Json => {
                match self.fetcher.fetch(&info.artifact_url, &info.manifest).await {
                    Ok(dir) => {
                        fetched = dir;
                        fetched.path()
                    }
                    Err(err) => {
                        sink.write_line(format!("{err:#}"));
                        return Err(DeployError::internal(err));
                    }
                }
            }
            DeployContentType::Zip => params.app_path.as_deref().unwrap_or(Path::new("")),
        };

        match self
            .blue_greener
            .push(&environment, app_path, info, sink)
            .await
        {
            Ok(()) => {
                sink.write_line(format!("\n{SUCCESS_BANNER}"));
                if let Err(err) = self
                    .event_manager
                    .emit(&Event::DeploySuccess(event_data.clone()))
                {
                    sink.write_line(format!("{err:#}"));
                }
                Ok(())
            }
            Err(err) => {
                sink.write_line(format!("{err:#}"));
                if let Err(event_err) = self
                    .event_manager
                    .emit(&Event::DeployFailure(event_data.clone()))
                {
                    sink.write_line(format!("{event_err:#}"));
                }
                let status = if is_login_failure(&err) {
                    StatusCode::UNAUTHORIZED
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                Err(DeployError::new(status, err))
            }
        }
    }
}

fn parse_descriptor(body: &[u8]) -> Result<DeployDescriptor> {
    let descriptor: DeployDescriptor =
        serde_json::from_slice(body).context("invalid deploy request")?;
    if descriptor.artifact_url.as_deref().map_or(true, str::is_empty) {
        bail!("The following properties are missing: artifact_url");
    }
    Ok(descriptor)
}

/// True when the error is a foundation login failure anywhere in its chain.
/// The rendered-text check is a fallback for errors produced outside the
/// courier layer.
fn is_login_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<CourierError>(),
            Some(CourierError::LoginFailed(_))
        )
    }) || format!("{err:#}").contains("login failed")
}

/// Deploy identifier: `n` random alphanumeric runes.
fn random_runes(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}
