//! Fan-out coordinator for blue/green pushes.
//!
//! One pusher per foundation, two barrier points. Phase A runs
//! login/exists/push on every foundation concurrently; only if every
//! foundation succeeds does Phase B delete the venerable copies. Any Phase A
//! failure rolls back every foundation whose login succeeded, so an
//! environment is never left half-committed: either all foundations display
//! the new version or all display the prior one.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tracing::{error, warn};

use crate::config::Environment;
use crate::courier::CourierFactory;
use crate::engine::deployer::DeploymentInfo;
use crate::engine::pusher::Pusher;
use crate::engine::sink::ProgressSink;

#[async_trait]
pub trait BlueGreener: Send + Sync {
    async fn push(
        &self,
        environment: &Environment,
        app_path: &Path,
        info: &DeploymentInfo,
        sink: &ProgressSink,
    ) -> Result<()>;
}

pub struct BlueGreen {
    courier_factory: Arc<dyn CourierFactory>,
}

impl BlueGreen {
    pub fn new(courier_factory: Arc<dyn CourierFactory>) -> Self {
        Self { courier_factory }
    }
}

#[async_trait]
impl BlueGreener for BlueGreen {
    async fn push(
        &self,
        environment: &Environment,
        app_path: &Path,
        info: &DeploymentInfo,
        sink: &ProgressSink,
    ) -> Result<()> {
        let mut pushers = Vec::with_capacity(environment.foundations.len());
        for foundation in &environment.foundations {
            let courier = self.courier_factory.create(foundation).await?;
            pushers.push(Pusher::new(
                foundation.clone(),
                courier,
                &info.app_name,
                sink.clone(),
            ));
        }

        // Phase A: every foundation logs in, checks for a live app and
        // pushes. Within one foundation the steps are strictly sequential.
        let results = join_all(pushers.iter_mut().map(|pusher| async move {
            pusher.login(environment, info).await?;
            pusher.exists(&info.app_name).await;
            pusher.push(environment, info, app_path).await
        }))
        .await;

        for (pusher, result) in pushers.iter().zip(&results) {
            if let Err(err) = result {
                sink.write_line(format!(
                    "push to {} failed: {err:#}",
                    pusher.foundation()
                ));
                error!(foundation = %pusher.foundation(), error = %format!("{err:#}"), "push failed");
            }
        }

        let outcome = if results.iter().all(|r| r.is_ok()) {
            self.finish(&mut pushers, sink).await;
            Ok(())
        } else {
            let rollback_failures = self.rollback(&mut pushers, environment, info, sink).await;
            // Report the first push error; rollback problems are attached so
            // a partial rollback is never silently swallowed.
            let first = results
                .into_iter()
                .find_map(|r| r.err())
                .expect("at least one push failed");
            if rollback_failures == 0 {
                Err(first)
            } else {
                Err(first.context(format!(
                    "rollback incomplete on {rollback_failures} foundation(s)"
                )))
            }
        };

        let cleanups = join_all(pushers.iter_mut().map(|p| p.clean_up())).await;
        for (pusher, result) in pushers.iter().zip(cleanups) {
            if let Err(err) = result {
                warn!(foundation = %pusher.foundation(), error = %err, "courier cleanup failed");
            }
        }

        outcome
    }
}

impl BlueGreen {
    /// Phase B: drop the venerable copies. Failures are reported but never
    /// undo a deploy that is already live everywhere.
    async fn finish(&self, pushers: &mut [Pusher], sink: &ProgressSink) {
        let results = join_all(pushers.iter_mut().map(|p| p.finish_push())).await;
        for (pusher, result) in pushers.iter().zip(results) {
            if let Err(err) = result {
                sink.write_line(format!(
                    "cleanup of venerable app on {} failed: {err:#}",
                    pusher.foundation()
                ));
                error!(foundation = %pusher.foundation(), error = %format!("{err:#}"), "venerable cleanup failed");
            }
        }
    }

    /// Roll back every foundation that got as far as logging in. Returns
    /// the number of foundations whose rollback itself failed.
    async fn rollback(
        &self,
        pushers: &mut [Pusher],
        environment: &Environment,
        info: &DeploymentInfo,
        sink: &ProgressSink,
    ) -> usize {
        let results = join_all(
            pushers
                .iter_mut()
                .filter(|p| p.record().login_succeeded)
                .map(|p| p.undo(environment, info)),
        )
        .await;

        let mut failures = 0;
        for result in results {
            if let Err(err) = result {
                sink.write_line(format!("{err:#}"));
                error!(error = %format!("{err:#}"), "rollback failed");
                failures += 1;
            }
        }
        failures
    }
}
