//! One foundation's side of a blue/green deploy.
//!
//! A pusher owns a courier handle and a [`PushRecord`] for exactly one
//! deploy attempt. The record captures what actually happened on the
//! foundation so that rollback is deterministic: it never has to guess
//! which steps completed.

use std::path::Path;

use anyhow::{anyhow, Result};

use crate::config::Environment;
use crate::courier::Courier;
use crate::engine::deployer::DeploymentInfo;
use crate::engine::sink::ProgressSink;

/// What a deploy attempt has done on one foundation.
#[derive(Debug, Clone)]
pub struct PushRecord {
    pub app_existed_before: bool,
    pub venerable_name: String,
    pub login_succeeded: bool,
    pub push_succeeded: bool,
}

impl PushRecord {
    fn new(app_name: &str) -> Self {
        Self {
            app_existed_before: false,
            venerable_name: format!("{app_name}-venerable"),
            login_succeeded: false,
            push_succeeded: false,
        }
    }
}

pub struct Pusher {
    foundation: String,
    courier: Box<dyn Courier>,
    record: PushRecord,
    sink: ProgressSink,
}

impl Pusher {
    pub fn new(
        foundation: impl Into<String>,
        courier: Box<dyn Courier>,
        app_name: &str,
        sink: ProgressSink,
    ) -> Self {
        Self {
            foundation: foundation.into(),
            courier,
            record: PushRecord::new(app_name),
            sink,
        }
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn record(&self) -> &PushRecord {
        &self.record
    }

    /// Authenticate against the foundation.
    pub async fn login(&mut self, environment: &Environment, info: &DeploymentInfo) -> Result<()> {
        let result = self
            .courier
            .login(
                &self.foundation,
                &info.username,
                &info.password,
                &info.org,
                &info.space,
                info.skip_ssl || environment.skip_ssl,
            )
            .await;

        match result {
            Ok(_) => {
                self.record.login_succeeded = true;
                self.sink
                    .write_line(format!("logged in to {}", self.foundation));
                Ok(())
            }
            Err(err) => {
                self.sink
                    .write_line(format!("could not log in to {}", self.foundation));
                Err(err.into())
            }
        }
    }

    /// Record whether a live app already exists under the deploy's name.
    pub async fn exists(&mut self, app_name: &str) {
        self.record.app_existed_before = self.courier.exists(app_name).await;
    }

    /// Rename any live app aside, push the new one, map its route.
    pub async fn push(
        &mut self,
        environment: &Environment,
        info: &DeploymentInfo,
        app_path: &Path,
    ) -> Result<()> {
        if self.record.app_existed_before {
            self.sink.write_line(format!(
                "renaming {} to {} on {}",
                info.app_name, self.record.venerable_name, self.foundation
            ));
            self.courier
                .rename(&info.app_name, &self.record.venerable_name)
                .await?;
        }

        self.sink.write_line(format!(
            "pushing {} to {}",
            info.app_name, self.foundation
        ));
        let instances = info.instances.unwrap_or(environment.instances);
        let output = self
            .courier
            .push(&info.app_name, app_path, instances)
            .await?;
        self.sink.write_chunk(&output);

        self.sink.write_line(format!(
            "mapping route {}.{} on {}",
            info.app_name, environment.domain, self.foundation
        ));
        self.courier
            .map_route(&info.app_name, &environment.domain, &info.app_name)
            .await?;

        self.record.push_succeeded = true;
        Ok(())
    }

    /// Put the foundation back the way it was before this deploy.
    ///
    /// Deletes the new app when one was (even partially) pushed, then
    /// restores the venerable app under its original name. For a first
    /// deploy with rollback disabled nothing is touched, so the failed
    /// app's logs stay available for diagnosis.
    pub async fn undo(&mut self, environment: &Environment, info: &DeploymentInfo) -> Result<()> {
        if !self.record.app_existed_before && environment.disable_first_deploy_rollback {
            self.sink.write_line(format!(
                "first-deploy rollback is disabled for {}: leaving {} on {} for diagnosis",
                environment.name, info.app_name, self.foundation
            ));
            return Ok(());
        }

        self.sink.write_line(format!(
            "rolling back {} on {}",
            info.app_name, self.foundation
        ));

        let mut failures: Vec<String> = Vec::new();

        if self.record.push_succeeded || self.courier.exists(&info.app_name).await {
            match self.courier.delete(&info.app_name).await {
                Ok(_) => self.sink.write_line(format!(
                    "deleted {} on {}",
                    info.app_name, self.foundation
                )),
                Err(err) => failures.push(err.to_string()),
            }
        }

        if self.record.app_existed_before {
            match self
                .courier
                .rename(&self.record.venerable_name, &info.app_name)
                .await
            {
                Ok(_) => self.sink.write_line(format!(
                    "renamed {} back to {} on {}",
                    self.record.venerable_name, info.app_name, self.foundation
                )),
                Err(err) => failures.push(err.to_string()),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "rollback on {} incomplete: {}",
                self.foundation,
                failures.join("; ")
            ))
        }
    }

    /// Commit: drop the venerable copy now that the new app is live.
    pub async fn finish_push(&mut self) -> Result<()> {
        if self.record.app_existed_before && self.record.push_succeeded {
            self.courier.delete(&self.record.venerable_name).await?;
            self.sink.write_line(format!(
                "deleted {} on {}",
                self.record.venerable_name, self.foundation
            ));
        }
        Ok(())
    }

    /// Release the courier's session resources.
    pub async fn clean_up(&mut self) -> Result<()> {
        self.courier.clean_up().await?;
        Ok(())
    }
}
