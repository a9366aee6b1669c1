//! Per-foundation command surface over the platform CLI.
//!
//! A courier owns one foundation's CLI session for the lifetime of one
//! deploy. Each courier gets a private `CF_HOME` so concurrent logins
//! against different foundations never share token state.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const CF_BINARY: &str = "cf";

/// Errors from foundation commands.
///
/// Login failures are their own variant so callers can map them to an
/// authentication status without scraping message text; the Display text
/// still contains `login failed` for consumers of the rendered error.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("{command} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

/// Command surface for one foundation. Every call returns the captured
/// command output so it can be multiplexed into the deploy's progress
/// stream.
#[async_trait]
pub trait Courier: Send + Sync {
    async fn login(
        &self,
        api: &str,
        username: &str,
        password: &str,
        org: &str,
        space: &str,
        skip_ssl: bool,
    ) -> Result<Vec<u8>, CourierError>;

    async fn push(
        &self,
        app_name: &str,
        app_dir: &Path,
        instances: u16,
    ) -> Result<Vec<u8>, CourierError>;

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<Vec<u8>, CourierError>;

    async fn delete(&self, app_name: &str) -> Result<Vec<u8>, CourierError>;

    async fn map_route(
        &self,
        app_name: &str,
        domain: &str,
        hostname: &str,
    ) -> Result<Vec<u8>, CourierError>;

    async fn exists(&self, app_name: &str) -> bool;

    /// Release any session state held for the foundation.
    async fn clean_up(&self) -> Result<(), CourierError>;
}

/// Creates one courier per foundation; the seam the blue/green coordinator
/// uses so tests can substitute scripted couriers.
#[async_trait]
pub trait CourierFactory: Send + Sync {
    async fn create(&self, foundation_url: &str) -> anyhow::Result<Box<dyn Courier>>;
}

/// Courier backed by the Cloud Foundry CLI.
pub struct CfCourier {
    cf_home: TempDir,
}

impl CfCourier {
    pub fn new() -> anyhow::Result<Self> {
        let cf_home = tempfile::tempdir()
            .map_err(|e| anyhow::anyhow!("failed to create CF_HOME directory: {e}"))?;
        Ok(Self { cf_home })
    }

    /// Whether the platform CLI is on the PATH.
    pub async fn is_available() -> bool {
        Command::new(CF_BINARY)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(
        &self,
        label: &str,
        args: &[&str],
        dir: Option<&Path>,
    ) -> Result<Vec<u8>, CourierError> {
        debug!(command = label, "running cf command");

        let mut command = Command::new(CF_BINARY);
        command
            .args(args)
            .env("CF_HOME", self.cf_home.path())
            .stdin(Stdio::null());
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|source| CourierError::Spawn {
            command: label.to_string(),
            source,
        })?;

        let mut captured = output.stdout;
        captured.extend_from_slice(&output.stderr);

        if output.status.success() {
            Ok(captured)
        } else {
            Err(CourierError::CommandFailed {
                command: label.to_string(),
                detail: String::from_utf8_lossy(&captured).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Courier for CfCourier {
    async fn login(
        &self,
        api: &str,
        username: &str,
        password: &str,
        org: &str,
        space: &str,
        skip_ssl: bool,
    ) -> Result<Vec<u8>, CourierError> {
        let mut args = vec![
            "login", "-a", api, "-u", username, "-p", password, "-o", org, "-s", space,
        ];
        if skip_ssl {
            args.push("--skip-ssl-validation");
        }

        self.run("cf login", &args, None)
            .await
            .map_err(|err| match err {
                CourierError::CommandFailed { detail, .. } => {
                    CourierError::LoginFailed(detail)
                }
                other => other,
            })
    }

    async fn push(
        &self,
        app_name: &str,
        app_dir: &Path,
        instances: u16,
    ) -> Result<Vec<u8>, CourierError> {
        let instances = instances.to_string();
        self.run(
            "cf push",
            &["push", app_name, "-i", instances.as_str()],
            Some(app_dir),
        )
        .await
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<Vec<u8>, CourierError> {
        self.run("cf rename", &["rename", old_name, new_name], None)
            .await
    }

    async fn delete(&self, app_name: &str) -> Result<Vec<u8>, CourierError> {
        self.run("cf delete", &["delete", app_name, "-f"], None).await
    }

    async fn map_route(
        &self,
        app_name: &str,
        domain: &str,
        hostname: &str,
    ) -> Result<Vec<u8>, CourierError> {
        self.run(
            "cf map-route",
            &["map-route", app_name, domain, "-n", hostname],
            None,
        )
        .await
    }

    async fn exists(&self, app_name: &str) -> bool {
        self.run("cf app", &["app", app_name], None).await.is_ok()
    }

    async fn clean_up(&self) -> Result<(), CourierError> {
        // CF_HOME is removed when the TempDir drops; nothing else to release.
        Ok(())
    }
}

/// Production factory: a fresh [`CfCourier`] per foundation.
pub struct CfCourierFactory;

#[async_trait]
impl CourierFactory for CfCourierFactory {
    async fn create(&self, _foundation_url: &str) -> anyhow::Result<Box<dyn Courier>> {
        Ok(Box::new(CfCourier::new()?))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_failure_display_keeps_the_inherited_substring() {
        let err = CourierError::LoginFailed("Credentials were rejected".to_string());
        assert!(err.to_string().contains("login failed"));
    }

    #[test]
    fn command_failures_name_the_command() {
        let err = CourierError::CommandFailed {
            command: "cf push".to_string(),
            detail: "insufficient memory".to_string(),
        };
        assert_eq!(err.to_string(), "cf push failed: insufficient memory");
    }
}
