//! Foundation reachability checks run before any deploy work starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use crate::config::Environment;
use crate::engine::events::{Event, EventManager, PrecheckerEventData};

const PROBE_PATH: &str = "/v2/info";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Prechecker: Send + Sync {
    async fn assert_all_foundations_up(&self, environment: &Environment) -> Result<()>;
}

pub struct FoundationPrechecker {
    event_manager: Arc<EventManager>,
}

impl FoundationPrechecker {
    pub fn new(event_manager: Arc<EventManager>) -> Self {
        Self { event_manager }
    }
}

#[async_trait]
impl Prechecker for FoundationPrechecker {
    async fn assert_all_foundations_up(&self, environment: &Environment) -> Result<()> {
        if environment.foundations.is_empty() {
            bail!(
                "no foundations configured for environment {}",
                environment.name
            );
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(environment.skip_ssl)
            .timeout(PROBE_TIMEOUT)
            .build()?;

        let probes = environment.foundations.iter().map(|foundation| {
            let client = &client;
            async move {
                let url = format!("{foundation}{PROBE_PATH}");
                match client.get(&url).send().await {
                    Ok(response) if response.status().is_success() => None,
                    Ok(response) => Some(format!("{foundation} ({})", response.status())),
                    Err(err) => Some(format!("{foundation} ({err})")),
                }
            }
        });

        let unavailable: Vec<String> = join_all(probes).await.into_iter().flatten().collect();
        if unavailable.is_empty() {
            return Ok(());
        }

        let description = format!("unavailable foundations: {}", unavailable.join(", "));
        let event = Event::FoundationsUnavailable(PrecheckerEventData {
            environment: environment.clone(),
            description: description.clone(),
        });
        if let Err(err) = self.event_manager.emit(&event) {
            warn!(error = %err, "foundationsUnavailable handler failed");
        }

        bail!("Deploy aborted, one or more foundations unavailable: {description}")
    }
}
