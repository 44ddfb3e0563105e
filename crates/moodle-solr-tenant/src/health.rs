//! Point-in-time health report of Solr, the tenant cores and the security
//! document.

use jiff::Timestamp;
use moodle_solr_security::{SecurityManager, lock::LockState};
use serde::Serialize;

use crate::{
    external::ResourceManager,
    identifier::TenantId,
    solr::{SolrClient, SystemInfo},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Working, but something needs attention.
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: Timestamp,
    pub solr: SolrHealth,
    pub cores: Vec<CoreHealth>,
    pub security: SecurityHealth,
    pub lock: LockHealth,
}

#[derive(Clone, Debug, Serialize)]
pub struct SolrHealth {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub system: Option<SystemInfo>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CoreHealth {
    pub name: String,
    pub tenant: Option<String>,
    pub document_count: Option<u64>,
    pub index_size_bytes: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SecurityHealth {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub users: usize,
    pub permissions: usize,
    pub orphan_roles: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LockHealth {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

pub async fn check(solr: &SolrClient, security: &SecurityManager) -> HealthReport {
    let (solr_health, cores) = match solr.system_info().await {
        Ok(system) => {
            let cores = match solr.list_resources().await {
                Ok(cores) => cores
                    .into_iter()
                    .map(|core| CoreHealth {
                        tenant: TenantId::from_core(&core.name).map(|tenant| tenant.to_string()),
                        name: core.name,
                        document_count: core.document_count,
                        index_size_bytes: core.index_size_bytes,
                    })
                    .collect(),
                Err(error) => {
                    tracing::warn!(%error, "failed to list cores");
                    Vec::new()
                }
            };
            let health = SolrHealth {
                reachable: true,
                error: None,
                system: Some(system),
            };
            (health, cores)
        }
        Err(error) => {
            let health = SolrHealth {
                reachable: false,
                error: Some(error.to_string()),
                system: None,
            };
            (health, Vec::new())
        }
    };

    let security_health = match security.load_document() {
        Ok(document) => SecurityHealth {
            valid: true,
            error: None,
            users: document.authentication.credentials.len(),
            permissions: document.authorization.permissions.len(),
            orphan_roles: document.orphan_roles(),
        },
        Err(error) => SecurityHealth {
            valid: false,
            error: Some(snafu::Report::from_error(error).to_string()),
            users: 0,
            permissions: 0,
            orphan_roles: Vec::new(),
        },
    };

    let lock = match security.lock().inspect() {
        LockState::Free => LockHealth {
            state: "free",
            owner: None,
        },
        LockState::Held { owner, stale } => LockHealth {
            state: if stale { "stale" } else { "held" },
            owner: Some(owner.to_string()),
        },
        LockState::Unreadable => LockHealth {
            state: "unreadable",
            owner: None,
        },
    };

    let status = if !solr_health.reachable || !security_health.valid {
        HealthStatus::Unhealthy
    } else if !security_health.orphan_roles.is_empty() || matches!(lock.state, "stale" | "unreadable")
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthReport {
        status,
        timestamp: Timestamp::now(),
        solr: solr_health,
        cores,
        security: security_health,
        lock,
    }
}
