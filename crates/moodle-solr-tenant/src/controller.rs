//! Tenant provisioning, deprovisioning, backup and listing.
//!
//! A tenant is a Solr core `moodle_<id>` plus a credential, a role assignment
//! and a permission in the security document, plus a credentials file handed
//! to the Moodle site. The security document changes of one workflow run in a
//! single transaction that is verified by restarting Solr; core creation and
//! deletion happen outside of it. Partial tenants are reported, never cleaned
//! up automatically.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use jiff::Timestamp;
use moodle_solr_security::{
    SecurityManager,
    document::{self, Permission, SecurityDocument},
    files::FilePermissions,
    hashing::SecretHasher,
    lock::{self, Backoff, LockManager},
    transaction,
    transform::{Transform, TransformOutcome},
};
use moodle_solr_shared::time::Duration;
use serde::Serialize;
use snafu::{ResultExt, Snafu, ensure};

use crate::{
    external::{
        self, QueryCredentials, QueryExecutor, QueryOutcome, ResourceManager, ResourceStatus,
        ServiceControl, SnapshotStatus,
    },
    identifier::{self, PERMISSION_PATH, TenantId, TenantNames},
    prompt::Prompt,
    secret::{self, SecretStore, TenantCredentials, generate_password},
};

type Result<T, E = Error> = std::result::Result<T, E>;

const BIN: &str = "moodle-solr-tenant";

const BACKUP_METADATA_FILE: &str = "metadata.json";
const BACKUP_SECRET_PERMISSIONS: FilePermissions = FilePermissions::new(0o600);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid tenant identifier"))]
    InvalidIdentifier { source: identifier::InvalidIdentifier },

    #[snafu(display("failed to look up core {core}"))]
    InspectCore {
        source: external::Error,
        core: String,
    },

    #[snafu(display("core {core} already exists"))]
    CoreExists { core: String },

    #[snafu(display("credentials file {path:?} already exists"))]
    SecretExists { path: PathBuf },

    #[snafu(display("failed to read the confirmation"))]
    Confirm { source: io::Error },

    #[snafu(display("failed to create core {core}"))]
    CreateCore {
        source: external::Error,
        core: String,
    },

    #[snafu(display(
        "failed to secure tenant {tenant}: core {core} exists but has no access rules"
    ))]
    SecureTenant {
        source: transaction::Error,
        tenant: TenantId,
        core: String,
    },

    #[snafu(display("tenant {tenant} was created but its credentials could not be stored"))]
    PersistSecret {
        source: secret::Error,
        tenant: TenantId,
    },

    #[snafu(display("tenant {tenant} cannot query its own core {core}: {outcome}"))]
    AccessCheck {
        tenant: TenantId,
        core: String,
        outcome: QueryOutcome,
    },

    #[snafu(display("tenant {tenant} can query core {core} of another tenant"))]
    IsolationViolated { tenant: TenantId, core: String },

    #[snafu(display(
        "isolation of tenant {tenant} is unverified, no other core denied access (inconclusive: {})",
        inconclusive.join(", ")
    ))]
    IsolationUnverified {
        tenant: TenantId,
        inconclusive: Vec<String>,
    },

    #[snafu(display("failed to list cores for the isolation check of tenant {tenant}"))]
    IsolationCheck {
        source: external::Error,
        tenant: TenantId,
    },

    #[snafu(display("deletion of tenant {tenant} was not confirmed"))]
    Aborted { tenant: TenantId },

    #[snafu(display("backup of tenant {tenant} failed, nothing was deleted"))]
    BackupBeforeDelete {
        source: Box<Error>,
        tenant: TenantId,
    },

    #[snafu(display("failed to delete core {core}"))]
    DeleteCore {
        source: external::Error,
        core: String,
    },

    #[snafu(display(
        "core of tenant {tenant} is gone but its access rules could not be revoked"
    ))]
    RevokeTenant {
        source: transaction::Error,
        tenant: TenantId,
    },

    #[snafu(display("tenant {tenant} was deleted but its credentials file could not be archived"))]
    ArchiveSecret {
        source: secret::Error,
        tenant: TenantId,
    },

    #[snafu(display("failed to acquire the backup lock of tenant {tenant}"))]
    BackupLock {
        source: lock::Error,
        tenant: TenantId,
    },

    #[snafu(display("core {core} does not exist"))]
    CoreMissing { core: String },

    #[snafu(display("failed to flush core {core}, backup aborted"))]
    Flush {
        source: external::Error,
        core: String,
    },

    #[snafu(display("failed to count the documents of core {core}"))]
    DocumentCount {
        source: external::Error,
        core: String,
    },

    #[snafu(display("failed to request snapshot {snapshot} of core {core}"))]
    RequestSnapshot {
        source: external::Error,
        core: String,
        snapshot: String,
    },

    #[snafu(display("failed to read the status of snapshot {snapshot} of core {core}"))]
    SnapshotState {
        source: external::Error,
        core: String,
        snapshot: String,
    },

    #[snafu(display("snapshot {snapshot} of core {core} failed: {message}"))]
    SnapshotFailed {
        core: String,
        snapshot: String,
        message: String,
    },

    #[snafu(display("snapshot {snapshot} of core {core} did not complete within {timeout}"))]
    SnapshotTimeout {
        core: String,
        snapshot: String,
        timeout: Duration,
    },

    #[snafu(display("failed to write tenant backup {path:?}"))]
    WriteBackup { source: io::Error, path: PathBuf },

    #[snafu(display("failed to serialize tenant backup metadata"))]
    SerializeBackupMetadata { source: serde_json::Error },

    #[snafu(display("failed to list cores"))]
    ListCores { source: external::Error },

    #[snafu(display("failed to load the security document"))]
    LoadDocument { source: document::Error },
}

impl Error {
    /// Whether the failure left a tenant half created or half deleted.
    pub fn is_consistency_warning(&self) -> bool {
        match self {
            Self::SecureTenant { .. }
            | Self::PersistSecret { .. }
            | Self::AccessCheck { .. }
            | Self::IsolationViolated { .. }
            | Self::IsolationUnverified { .. }
            | Self::IsolationCheck { .. }
            | Self::RevokeTenant { .. }
            | Self::ArchiveSecret { .. } => true,
            Self::BackupBeforeDelete { source, .. } => source.is_consistency_warning(),
            _ => false,
        }
    }

    /// A command or action that resolves the failure, if there is one.
    pub fn remediation(&self) -> Option<String> {
        let remediation = match self {
            Self::InvalidIdentifier { .. } => {
                "use only lowercase letters, digits and '_', at most 30 characters".to_owned()
            }
            Self::CoreExists { .. } => {
                format!("choose another identifier or inspect existing tenants with `{BIN} list`")
            }
            Self::SecretExists { path } => {
                format!("move {} aside and run the command again", path.display())
            }
            Self::SecureTenant { source, tenant, .. } => match source {
                transaction::Error::Rollback { backup, .. } => format!(
                    "restore the security document with `{BIN} security restore {}`, then run `{BIN} delete {tenant}`",
                    file_name(backup)
                ),
                source if source.is_lock_timeout() => format!(
                    "inspect the holder with `{BIN} lock-status`, then run `{BIN} delete {tenant}` and create the tenant again"
                ),
                _ => format!(
                    "run `{BIN} delete {tenant}` to remove the unsecured core, then create the tenant again"
                ),
            },
            Self::PersistSecret { tenant, .. } => format!(
                "the generated password is lost; run `{BIN} delete {tenant}` and create the tenant again"
            ),
            Self::AccessCheck { tenant, .. }
            | Self::IsolationViolated { tenant, .. }
            | Self::IsolationUnverified { tenant, .. }
            | Self::IsolationCheck { tenant, .. } => format!(
                "review the access rules with `{BIN} list` and `{BIN} security validate`; run `{BIN} delete {tenant}` to remove the tenant"
            ),
            Self::RevokeTenant { source, tenant } => match source {
                transaction::Error::Rollback { backup, .. } => format!(
                    "restore the security document with `{BIN} security restore {}`, then run `{BIN} delete {tenant}` again",
                    file_name(backup)
                ),
                source if source.is_lock_timeout() => format!(
                    "inspect the holder with `{BIN} lock-status`, then run `{BIN} delete {tenant}` again"
                ),
                _ => format!("run `{BIN} delete {tenant}` again once the cause is fixed"),
            },
            Self::ArchiveSecret { tenant, .. } => {
                format!("move the credentials file of tenant {tenant} aside manually")
            }
            Self::BackupBeforeDelete { source, .. } => return source.remediation(),
            Self::BackupLock { source, tenant } if source.is_timeout() => {
                format!("another backup of tenant {tenant} is running; wait for it to finish")
            }
            Self::CoreMissing { .. } => format!("list existing tenants with `{BIN} list`"),
            Self::Flush { .. }
            | Self::DocumentCount { .. }
            | Self::RequestSnapshot { .. }
            | Self::SnapshotState { .. }
            | Self::SnapshotFailed { .. }
            | Self::SnapshotTimeout { .. } => {
                format!("check the state of Solr with `{BIN} health`")
            }
            _ => return None,
        };
        Some(remediation)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}

/// The external systems a [`Controller`] drives.
#[derive(Clone)]
pub struct Collaborators {
    pub resources: Arc<dyn ResourceManager>,
    pub service: Arc<dyn ServiceControl>,
    pub queries: Arc<dyn QueryExecutor>,
    pub hasher: Arc<dyn SecretHasher>,
    pub prompt: Arc<dyn Prompt>,
}

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Config set every tenant core is created from.
    pub config_set: String,

    /// Solr origin as reachable by Moodle sites.
    pub solr_public_url: String,

    pub stop_grace_period: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,

    /// Pause between the hard commit and the snapshot request of a backup.
    pub flush_settle_delay: Duration,
    pub snapshot_timeout: Duration,
    pub snapshot_poll_interval: Duration,

    pub tenant_backup_dir: PathBuf,

    /// Snapshot directory as seen by Solr.
    pub solr_backup_location: String,

    /// The same directory as seen by this process, if it is mounted here.
    pub solr_backup_host_dir: Option<PathBuf>,

    /// Wait for the per-tenant backup lock.
    pub backup_lock_timeout: Duration,
    pub lock_retry_delay: Duration,
}

#[derive(Clone, Debug)]
pub struct CreatedTenant {
    pub names: TenantNames,
    pub secret_path: PathBuf,

    /// Other cores the new credentials were checked to be denied on.
    pub denied_cores: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct DeletedTenant {
    pub names: TenantNames,
    pub backup: Option<TenantBackup>,
    pub core_deleted: bool,

    /// Whether any access rule was still present.
    pub rules_revoked: bool,
    pub archived_secret: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenantBackupMetadata {
    pub tenant: String,
    pub core: String,
    pub document_count: u64,
    pub snapshot_name: String,
    pub snapshot_location: String,
    pub created_at: Timestamp,
}

#[derive(Clone, Debug)]
pub struct TenantBackup {
    pub path: PathBuf,
    pub metadata: TenantBackupMetadata,

    /// Whether the snapshot files were copied into the backup.
    pub includes_snapshot: bool,
}

#[derive(Debug, Default)]
pub struct BackupAllReport {
    pub succeeded: Vec<TenantBackup>,
    pub failed: Vec<(TenantId, Error)>,
}

/// What exists of one tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantSummary {
    pub names: TenantNames,
    pub core: Option<ResourceStatus>,
    pub credential: bool,
    pub role: bool,
    pub permission: bool,
    pub secret: bool,
}

impl TenantSummary {
    fn new(tenant: TenantId) -> Self {
        Self {
            names: tenant.names(),
            core: None,
            credential: false,
            role: false,
            permission: false,
            secret: false,
        }
    }

    /// Parts of the tenant that are absent.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.core.is_some(), "core"),
            (self.credential, "credential"),
            (self.role, "role"),
            (self.permission, "permission"),
            (self.secret, "credentials file"),
        ]
        .into_iter()
        .filter_map(|(present, part)| (!present).then_some(part))
        .collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.missing().is_empty()
    }
}

pub struct Controller {
    security: SecurityManager,
    secrets: SecretStore,
    collaborators: Collaborators,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(
        security: SecurityManager,
        secrets: SecretStore,
        collaborators: Collaborators,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            security,
            secrets,
            collaborators,
            settings,
        }
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    /// Provisions a new tenant.
    #[tracing::instrument(skip(self))]
    pub async fn create_tenant(&self, tenant: &str) -> Result<CreatedTenant> {
        let tenant: TenantId = tenant.parse().context(InvalidIdentifierSnafu)?;
        let names = tenant.names();
        let resources = &self.collaborators.resources;

        let existing = resources
            .resource_status(&names.core)
            .await
            .context(InspectCoreSnafu { core: &names.core })?;
        ensure!(existing.is_none(), CoreExistsSnafu { core: &names.core });

        if self.secrets.exists(&tenant) {
            let path = self.secrets.path_for(&tenant);
            let overwrite = self
                .collaborators
                .prompt
                .confirm(
                    &format!(
                        "Credentials file {} already exists and will be overwritten.",
                        path.display()
                    ),
                    &format!("overwrite {tenant}"),
                )
                .context(ConfirmSnafu)?;
            ensure!(overwrite, SecretExistsSnafu { path });
        }

        let password = generate_password();
        let hash = self.collaborators.hasher.hash(password.as_str());

        resources
            .create_resource(&names.core, &self.settings.config_set)
            .await
            .context(CreateCoreSnafu { core: &names.core })?;

        self.secure(&names, hash)
            .await
            .context(SecureTenantSnafu {
                tenant: tenant.clone(),
                core: &names.core,
            })?;

        let credentials = TenantCredentials {
            tenant: tenant.to_string(),
            solr_url: format!(
                "{}/solr",
                self.settings.solr_public_url.trim_end_matches('/')
            ),
            core: names.core.clone(),
            username: names.username.clone(),
            password,
            created_at: Timestamp::now(),
        };
        let secret_path = self
            .secrets
            .write(&tenant, &credentials)
            .context(PersistSecretSnafu {
                tenant: tenant.clone(),
            })?;

        let denied_cores = self.verify_access(&names, &credentials).await?;

        tracing::info!(%tenant, core = %names.core, "tenant is active");
        Ok(CreatedTenant {
            names,
            secret_path,
            denied_cores,
        })
    }

    /// Adds the access rules of a tenant in one verified transaction.
    async fn secure(&self, names: &TenantNames, hash: String) -> Result<(), transaction::Error> {
        let mut transaction = self
            .security
            .transactions()
            .begin(&format!("create tenant {}", names.id))
            .await?;

        transaction.apply(
            &Transform::AddCredential {
                username: names.username.clone(),
                hash,
            },
            &format!("add credential of tenant {}", names.id),
        )?;
        transaction.apply(
            &Transform::AddUserRole {
                username: names.username.clone(),
                roles: vec![names.role.clone()],
            },
            &format!("assign role of tenant {}", names.id),
        )?;
        transaction.apply(
            &Transform::AddPermission {
                permission: Permission::for_collection(
                    &names.permission,
                    &names.role,
                    &names.core,
                    PERMISSION_PATH,
                ),
            },
            &format!("grant permission of tenant {}", names.id),
        )?;

        transaction
            .verify("service restart", self.restart_service())
            .await?;
        transaction.commit()
    }

    /// Checks that the new credentials work on the tenant's own core and are
    /// denied on at least one other core, if there is any.
    async fn verify_access(
        &self,
        names: &TenantNames,
        credentials: &TenantCredentials,
    ) -> Result<Vec<String>> {
        let queries = &self.collaborators.queries;
        let credentials = QueryCredentials {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };

        let own = queries.query(&names.core, &credentials).await;
        ensure!(
            own == QueryOutcome::Success,
            AccessCheckSnafu {
                tenant: names.id.clone(),
                core: &names.core,
                outcome: own,
            }
        );

        let cores = self
            .collaborators
            .resources
            .list_resources()
            .await
            .context(IsolationCheckSnafu {
                tenant: names.id.clone(),
            })?;

        let mut denied = Vec::new();
        let mut inconclusive = Vec::new();
        for core in cores
            .into_iter()
            .map(|status| status.name)
            .filter(|name| *name != names.core)
        {
            match queries.query(&core, &credentials).await {
                QueryOutcome::AccessDenied => denied.push(core),
                QueryOutcome::Success => {
                    return IsolationViolatedSnafu {
                        tenant: names.id.clone(),
                        core,
                    }
                    .fail();
                }
                QueryOutcome::Error { message } => {
                    tracing::warn!(%core, %message, "isolation check inconclusive");
                    inconclusive.push(core);
                }
            }
        }

        ensure!(
            !denied.is_empty() || inconclusive.is_empty(),
            IsolationUnverifiedSnafu {
                tenant: names.id.clone(),
                inconclusive,
            }
        );
        if denied.is_empty() {
            tracing::info!(tenant = %names.id, "no other core to check isolation against");
        }
        Ok(denied)
    }

    /// Removes a tenant after a typed confirmation.
    #[tracing::instrument(skip(self))]
    pub async fn delete_tenant(&self, tenant: &str, with_backup: bool) -> Result<DeletedTenant> {
        let tenant: TenantId = tenant.parse().context(InvalidIdentifierSnafu)?;
        let names = tenant.names();

        let confirmed = self
            .collaborators
            .prompt
            .confirm(
                &format!(
                    "This deletes core {} with all its documents and revokes the access of tenant {tenant}.",
                    names.core
                ),
                &format!("delete {tenant}"),
            )
            .context(ConfirmSnafu)?;
        ensure!(
            confirmed,
            AbortedSnafu {
                tenant: tenant.clone()
            }
        );

        let backup = if with_backup {
            let backup = self
                .backup(&tenant)
                .await
                .map_err(Box::new)
                .context(BackupBeforeDeleteSnafu {
                    tenant: tenant.clone(),
                })?;
            Some(backup)
        } else {
            None
        };

        let resources = &self.collaborators.resources;
        let core_deleted = match resources
            .resource_status(&names.core)
            .await
            .context(InspectCoreSnafu { core: &names.core })?
        {
            Some(_) => {
                resources
                    .delete_resource(&names.core, true)
                    .await
                    .context(DeleteCoreSnafu { core: &names.core })?;
                true
            }
            None => {
                tracing::info!(core = %names.core, "core already absent");
                false
            }
        };

        let rules_revoked = self
            .revoke(&names)
            .await
            .context(RevokeTenantSnafu {
                tenant: tenant.clone(),
            })?;

        let archived_secret = self
            .secrets
            .archive(&tenant)
            .context(ArchiveSecretSnafu {
                tenant: tenant.clone(),
            })?;

        tracing::info!(%tenant, core_deleted, rules_revoked, "tenant deleted");
        Ok(DeletedTenant {
            names,
            backup,
            core_deleted,
            rules_revoked,
            archived_secret,
        })
    }

    /// Removes the access rules of a tenant in one transaction. Solr is only
    /// restarted if anything was removed.
    async fn revoke(&self, names: &TenantNames) -> Result<bool, transaction::Error> {
        let mut transaction = self
            .security
            .transactions()
            .begin(&format!("delete tenant {}", names.id))
            .await?;

        let outcomes = [
            transaction.apply(
                &Transform::RemovePermission {
                    name: names.permission.clone(),
                },
                &format!("revoke permission of tenant {}", names.id),
            )?,
            transaction.apply(
                &Transform::RemoveUserRole {
                    username: names.username.clone(),
                },
                &format!("revoke role of tenant {}", names.id),
            )?,
            transaction.apply(
                &Transform::RemoveCredential {
                    username: names.username.clone(),
                },
                &format!("revoke credential of tenant {}", names.id),
            )?,
        ];

        let changed = outcomes.contains(&TransformOutcome::Applied);
        if changed {
            transaction
                .verify("service restart", self.restart_service())
                .await?;
        } else {
            transaction.log_operation("nothing to revoke, service restart skipped")?;
        }
        transaction.commit()?;
        Ok(changed)
    }

    async fn restart_service(&self) -> Result<(), external::Error> {
        let service = &self.collaborators.service;
        service.stop(self.settings.stop_grace_period).await?;
        service.start().await?;
        service
            .poll_readiness(
                self.settings.readiness_timeout,
                self.settings.readiness_poll_interval,
            )
            .await
    }

    /// Backs up the index, document count and credentials of one tenant.
    #[tracing::instrument(skip(self))]
    pub async fn backup_tenant(&self, tenant: &str) -> Result<TenantBackup> {
        let tenant: TenantId = tenant.parse().context(InvalidIdentifierSnafu)?;
        self.backup(&tenant).await
    }

    /// Backs up every tenant core. Failures of single tenants do not stop the
    /// others.
    #[tracing::instrument(skip(self))]
    pub async fn backup_all(&self) -> Result<BackupAllReport> {
        let tenants: BTreeSet<TenantId> = self
            .collaborators
            .resources
            .list_resources()
            .await
            .context(ListCoresSnafu)?
            .iter()
            .filter_map(|status| TenantId::from_core(&status.name))
            .collect();

        let mut report = BackupAllReport::default();
        for tenant in tenants {
            match self.backup(&tenant).await {
                Ok(backup) => report.succeeded.push(backup),
                Err(error) => {
                    tracing::error!(%tenant, %error, "tenant backup failed");
                    report.failed.push((tenant, error));
                }
            }
        }
        Ok(report)
    }

    async fn backup(&self, tenant: &TenantId) -> Result<TenantBackup> {
        let names = tenant.names();
        let lock = LockManager::new(
            self.security
                .config()
                .lock_dir
                .join(format!("backup_{tenant}.lock")),
        );
        let guard = lock
            .acquire(
                self.settings.backup_lock_timeout,
                Backoff::Fixed(self.settings.lock_retry_delay),
            )
            .await
            .context(BackupLockSnafu {
                tenant: tenant.clone(),
            })?;

        let resources = &self.collaborators.resources;
        let status = resources
            .resource_status(&names.core)
            .await
            .context(InspectCoreSnafu { core: &names.core })?;
        ensure!(status.is_some(), CoreMissingSnafu { core: &names.core });

        resources
            .flush(&names.core)
            .await
            .context(FlushSnafu { core: &names.core })?;
        tokio::time::sleep(*self.settings.flush_settle_delay).await;

        let document_count = resources
            .document_count(&names.core)
            .await
            .context(DocumentCountSnafu { core: &names.core })?;

        let created_at = Timestamp::now();
        let stamp = format!(
            "{}.{:06}",
            created_at.strftime("%Y%m%dT%H%M%S"),
            created_at.subsec_microsecond()
        );
        let snapshot = format!("{}_{stamp}", names.core);
        resources
            .request_snapshot(
                &names.core,
                &snapshot,
                &self.settings.solr_backup_location,
            )
            .await
            .context(RequestSnapshotSnafu {
                core: &names.core,
                snapshot: &snapshot,
            })?;

        tokio::time::timeout(
            *self.settings.snapshot_timeout,
            self.await_snapshot(&names.core, &snapshot),
        )
        .await
        .map_err(|_| {
            SnapshotTimeoutSnafu {
                core: &names.core,
                snapshot: &snapshot,
                timeout: self.settings.snapshot_timeout,
            }
            .build()
        })??;

        let metadata = TenantBackupMetadata {
            tenant: tenant.to_string(),
            core: names.core.clone(),
            document_count,
            snapshot_name: snapshot,
            snapshot_location: self.settings.solr_backup_location.clone(),
            created_at,
        };

        let tenant_dir = self.settings.tenant_backup_dir.join(tenant.as_str());
        let staging = tenant_dir.join(format!(".{stamp}.partial"));
        let destination = tenant_dir.join(&stamp);

        let written = self
            .write_backup(&staging, tenant, &metadata)
            .and_then(|includes_snapshot| {
                fs::rename(&staging, &destination).context(WriteBackupSnafu {
                    path: &destination,
                })?;
                Ok(includes_snapshot)
            });
        let includes_snapshot = match written {
            Ok(includes_snapshot) => includes_snapshot,
            Err(error) => {
                if let Err(cleanup_error) = fs::remove_dir_all(&staging) {
                    tracing::warn!(%cleanup_error, path = %staging.display(), "failed to remove partial backup");
                }
                return Err(error);
            }
        };

        if let Err(error) = guard.release() {
            tracing::warn!(%error, "failed to release the backup lock");
        }

        tracing::info!(
            %tenant,
            path = %destination.display(),
            document_count,
            includes_snapshot,
            "tenant backup complete"
        );
        Ok(TenantBackup {
            path: destination,
            metadata,
            includes_snapshot,
        })
    }

    async fn await_snapshot(&self, core: &str, snapshot: &str) -> Result<()> {
        loop {
            let status = self
                .collaborators
                .resources
                .snapshot_status(core, snapshot)
                .await
                .context(SnapshotStateSnafu { core, snapshot })?;

            match status {
                SnapshotStatus::Completed => return Ok(()),
                SnapshotStatus::Failed { message } => {
                    return SnapshotFailedSnafu {
                        core,
                        snapshot,
                        message,
                    }
                    .fail();
                }
                SnapshotStatus::InProgress => {
                    tokio::time::sleep(*self.settings.snapshot_poll_interval).await;
                }
            }
        }
    }

    /// Fills `staging` with the backup contents. Returns whether the snapshot
    /// files could be included.
    fn write_backup(
        &self,
        staging: &Path,
        tenant: &TenantId,
        metadata: &TenantBackupMetadata,
    ) -> Result<bool> {
        fs::create_dir_all(staging).context(WriteBackupSnafu { path: staging })?;

        let metadata_path = staging.join(BACKUP_METADATA_FILE);
        let mut content =
            serde_json::to_vec_pretty(metadata).context(SerializeBackupMetadataSnafu)?;
        content.push(b'\n');
        fs::write(&metadata_path, content).context(WriteBackupSnafu {
            path: &metadata_path,
        })?;

        let secret = self.secrets.path_for(tenant);
        match secret.file_name() {
            Some(name) if secret.exists() => {
                let copy = staging.join(name);
                fs::copy(&secret, &copy).context(WriteBackupSnafu { path: &copy })?;
                BACKUP_SECRET_PERMISSIONS
                    .apply(&copy)
                    .context(WriteBackupSnafu { path: &copy })?;
            }
            _ => tracing::warn!(%tenant, "no credentials file to include in the backup"),
        }

        let Some(host_dir) = &self.settings.solr_backup_host_dir else {
            return Ok(false);
        };
        let snapshot_dir = format!("snapshot.{}", metadata.snapshot_name);
        let source = host_dir.join(&snapshot_dir);
        if !source.is_dir() {
            tracing::warn!(
                path = %source.display(),
                "snapshot directory not found, backup only records its name"
            );
            return Ok(false);
        }

        let target = staging.join(&snapshot_dir);
        copy_dir(&source, &target).context(WriteBackupSnafu { path: &target })?;
        Ok(true)
    }

    /// Cross-references tenant cores with the security document and the
    /// credentials files. Takes no lock.
    #[tracing::instrument(skip(self))]
    pub async fn list_tenants(&self) -> Result<Vec<TenantSummary>> {
        let cores = self
            .collaborators
            .resources
            .list_resources()
            .await
            .context(ListCoresSnafu)?;
        let document = self.security.load_document().context(LoadDocumentSnafu)?;

        let mut tenants: BTreeMap<TenantId, TenantSummary> = BTreeMap::new();
        for core in cores {
            if let Some(tenant) = TenantId::from_core(&core.name) {
                tenants
                    .entry(tenant.clone())
                    .or_insert_with(|| TenantSummary::new(tenant))
                    .core = Some(core);
            }
        }

        let mentioned = document
            .authentication
            .credentials
            .keys()
            .chain(document.authorization.user_role.keys())
            .filter_map(|username| TenantId::from_username(username))
            .chain(
                document
                    .authorization
                    .permissions
                    .iter()
                    .filter_map(|permission| TenantId::from_permission(&permission.name)),
            );
        for tenant in mentioned {
            tenants
                .entry(tenant.clone())
                .or_insert_with(|| TenantSummary::new(tenant));
        }

        Ok(tenants
            .into_values()
            .map(|summary| self.complete_summary(summary, &document))
            .collect())
    }

    fn complete_summary(&self, summary: TenantSummary, document: &SecurityDocument) -> TenantSummary {
        let names = &summary.names;
        let credential = document.credential(&names.username).is_some();
        let role = document
            .roles_of(&names.username)
            .is_some_and(|roles| roles.contains(&names.role));
        let permission = document.permission(&names.permission).is_some_and(|permission| {
            permission.grants_role(&names.role)
                && permission
                    .collection
                    .as_ref()
                    .and_then(Option::as_ref)
                    .is_some_and(|collections| collections.contains(&names.core))
        });
        let secret = self.secrets.exists(&names.id);

        TenantSummary {
            credential,
            role,
            permission,
            secret,
            ..summary
        }
    }
}

fn copy_dir(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}
