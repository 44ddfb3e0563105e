//! Controls the Solr container through the container runtime's compose CLI.

use std::path::PathBuf;

use async_trait::async_trait;
use moodle_solr_shared::time::Duration;
use snafu::{ResultExt, ensure};
use tokio::process::Command;

use crate::{
    external::{CommandFailedSnafu, Result, ServiceControl, SpawnCommandSnafu},
    solr::SolrClient,
};

/// A compose-managed Solr service, e.g. `docker compose stop -t 30 solr`.
#[derive(Clone, Debug)]
pub struct ComposeService {
    runtime: String,
    compose_file: Option<PathBuf>,
    service: String,
    probe: SolrClient,
}

impl ComposeService {
    pub fn new(
        runtime: impl Into<String>,
        compose_file: Option<PathBuf>,
        service: impl Into<String>,
        probe: SolrClient,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            compose_file,
            service: service.into(),
            probe,
        }
    }

    fn arguments(&self, action: &[String]) -> Vec<String> {
        let mut arguments = vec!["compose".to_owned()];
        if let Some(compose_file) = &self.compose_file {
            arguments.push("-f".to_owned());
            arguments.push(compose_file.display().to_string());
        }
        arguments.extend_from_slice(action);
        arguments.push(self.service.clone());
        arguments
    }

    async fn compose(&self, action: &[String]) -> Result<()> {
        let arguments = self.arguments(action);
        let command = format!("{} {}", self.runtime, arguments.join(" "));
        tracing::debug!(%command, "running compose command");

        let output = Command::new(&self.runtime)
            .args(&arguments)
            .kill_on_drop(true)
            .output()
            .await
            .context(SpawnCommandSnafu { command: &command })?;

        ensure!(
            output.status.success(),
            CommandFailedSnafu {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
        );
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for ComposeService {
    #[tracing::instrument(skip(self), fields(service = %self.service))]
    async fn stop(&self, grace_period: Duration) -> Result<()> {
        self.compose(&[
            "stop".to_owned(),
            "-t".to_owned(),
            grace_period.as_secs().to_string(),
        ])
        .await?;
        tracing::info!("stopped service");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(service = %self.service))]
    async fn start(&self) -> Result<()> {
        self.compose(&["start".to_owned()]).await?;
        tracing::info!("started service");
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        match self.probe.system_info().await {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(%error, "service not ready yet");
                false
            }
        }
    }
}
