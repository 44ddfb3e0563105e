//! Interfaces to the systems the tenant workflows drive but do not own: Solr's
//! core administration, the container running Solr, and plain queries used to
//! verify access rules.

use std::fmt::Display;

use async_trait::async_trait;
use moodle_solr_shared::time::Duration;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{operation}: request failed"))]
    Http {
        source: reqwest::Error,
        operation: String,
    },

    #[snafu(display("{operation}: Solr answered with HTTP {status}: {message}"))]
    Rejected {
        operation: String,
        status: u16,
        message: String,
    },

    #[snafu(display("{operation}: unexpected response: {message}"))]
    UnexpectedResponse { operation: String, message: String },

    #[snafu(display("failed to run {command:?}"))]
    SpawnCommand {
        source: std::io::Error,
        command: String,
    },

    #[snafu(display("{command:?} exited with {status}: {stderr}"))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[snafu(display("service did not become ready within {timeout}"))]
    ReadinessTimeout { timeout: Duration },
}

/// State of one Solr core as reported by the Core Admin API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    pub name: String,
    pub document_count: Option<u64>,
    pub index_size_bytes: Option<u64>,
    pub instance_dir: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotStatus {
    InProgress,
    Completed,
    Failed { message: String },
}

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Creates a core from the named config set.
    async fn create_resource(&self, name: &str, template: &str) -> Result<()>;

    /// Unloads a core. With `purge_data` its index, data and instance
    /// directories are removed as well.
    async fn delete_resource(&self, name: &str, purge_data: bool) -> Result<()>;

    /// Returns `None` if no such core exists.
    async fn resource_status(&self, name: &str) -> Result<Option<ResourceStatus>>;

    async fn list_resources(&self) -> Result<Vec<ResourceStatus>>;

    /// Hard-commits pending updates so they are part of the index on disk.
    async fn flush(&self, name: &str) -> Result<()>;

    async fn document_count(&self, name: &str) -> Result<u64>;

    /// Asks the core to write a point-in-time snapshot named `snapshot` into
    /// `location` (a path as seen by Solr).
    async fn request_snapshot(&self, name: &str, snapshot: &str, location: &str) -> Result<()>;

    async fn snapshot_status(&self, name: &str, snapshot: &str) -> Result<SnapshotStatus>;
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn stop(&self, grace_period: Duration) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// A single readiness probe.
    async fn is_ready(&self) -> bool;

    /// Probes every `interval` until the service is ready, failing with
    /// [`Error::ReadinessTimeout`] once `timeout` has elapsed.
    async fn poll_readiness(&self, timeout: Duration, interval: Duration) -> Result<()> {
        let probe = async {
            loop {
                if self.is_ready().await {
                    return;
                }
                tokio::time::sleep(*interval).await;
            }
        };

        tokio::time::timeout(*timeout, probe)
            .await
            .map_err(|_| Error::ReadinessTimeout { timeout })
    }
}

/// Basic auth credentials for a query.
#[derive(Clone, Debug)]
pub struct QueryCredentials {
    pub username: String,
    pub password: zeroize::Zeroizing<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    Success,
    AccessDenied,
    Error { message: String },
}

impl Display for QueryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::AccessDenied => f.write_str("access denied"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&self, resource: &str, credentials: &QueryCredentials) -> QueryOutcome;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct ReadyAfter {
        probes: AtomicU32,
        ready_after: u32,
    }

    #[async_trait]
    impl ServiceControl for ReadyAfter {
        async fn stop(&self, _grace_period: Duration) -> Result<()> {
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_ready() {
        let service = ReadyAfter {
            probes: AtomicU32::new(0),
            ready_after: 3,
        };

        service
            .poll_readiness(Duration::from_secs(60), Duration::from_secs(2))
            .await
            .expect("ready on third probe");
        assert_eq!(service.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_times_out() {
        let service = ReadyAfter {
            probes: AtomicU32::new(0),
            ready_after: u32::MAX,
        };

        let error = service
            .poll_readiness(Duration::from_secs(10), Duration::from_secs(2))
            .await
            .expect_err("never ready");
        assert!(matches!(error, Error::ReadinessTimeout { .. }));
    }
}
