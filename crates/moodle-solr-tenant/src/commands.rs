//! Runs a parsed [`Command`] and prints its result.
//!
//! Results go to stdout, warnings and errors to stderr.

use std::{
    io::{self, BufRead},
    sync::Arc,
};

use moodle_solr_security::{
    SecurityManager, backup,
    document::{self, SecurityDocument},
    hashing::{self, SecretHasher, SolrBasicAuthHasher},
    lock::{self, Backoff, LockState},
};
use moodle_solr_shared::time::Duration;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use zeroize::Zeroizing;

use crate::{
    cli::{Command, HashPasswordArguments, RuntimeOptions, SecurityCommand},
    controller::{self, Collaborators, Controller, TenantSummary},
    external,
    health,
    prompt::{Prompt, TerminalPrompt},
    secret::SecretStore,
    service::ComposeService,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to set up the Solr client"))]
    SolrClient { source: external::Error },

    #[snafu(transparent)]
    Tenant { source: controller::Error },

    #[snafu(display("failed to read the password from stdin"))]
    ReadPassword { source: io::Error },

    #[snafu(display("the password must not be empty"))]
    EmptyPassword,

    #[snafu(display("security document is invalid"))]
    InvalidDocument { source: document::Error },

    #[snafu(display("failed to list security document backups"))]
    ListBackups { source: backup::Error },

    #[snafu(display("failed to acquire the security document lock"))]
    AcquireLock { source: lock::Error },

    #[snafu(display("a retention of {days} days is out of range"))]
    RetentionOutOfRange { days: u64 },

    #[snafu(display("failed to rotate security document backups"))]
    RotateBackups { source: backup::Error },

    #[snafu(display("failed to restore the security document"))]
    Restore {
        source: moodle_solr_security::Error,
    },

    #[snafu(display("failed to read the confirmation"))]
    Confirm { source: io::Error },

    #[snafu(display("{action} was not confirmed"))]
    NotConfirmed { action: String },

    #[snafu(display("failed to serialize the health report"))]
    SerializeReport { source: serde_json::Error },
}

impl Error {
    pub fn is_consistency_warning(&self) -> bool {
        match self {
            Self::Tenant { source } => source.is_consistency_warning(),
            _ => false,
        }
    }

    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::Tenant { source } => source.remediation(),
            Self::AcquireLock { source } if source.is_timeout() => {
                Some("inspect the holder with `moodle-solr-tenant lock-status`".to_owned())
            }
            Self::InvalidDocument { .. } => Some(
                "list backups with `moodle-solr-tenant security backups` and restore one with `moodle-solr-tenant security restore <backup>`"
                    .to_owned(),
            ),
            _ => None,
        }
    }
}

/// How a successfully run command ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,

    /// The command ran but found a problem, e.g. an unhealthy service.
    Failure,
}

pub async fn run(command: Command, options: &RuntimeOptions) -> Result<Outcome> {
    let security = SecurityManager::new(options.security_config());

    match command {
        Command::Create { tenant } => {
            let created = controller(options, security)?.create_tenant(&tenant).await?;
            let names = &created.names;
            println!("Tenant {} created.", names.id);
            println!("  core:             {}", names.core);
            println!("  username:         {}", names.username);
            println!("  role:             {}", names.role);
            println!("  permission:       {}", names.permission);
            println!("  credentials file: {}", created.secret_path.display());
            println!(
                "  isolation:        denied on {} other core(s)",
                created.denied_cores.len()
            );
            Ok(Outcome::Success)
        }
        Command::Delete {
            tenant,
            with_backup,
        } => {
            let deleted = controller(options, security)?
                .delete_tenant(&tenant, with_backup)
                .await?;
            println!("Tenant {} deleted.", deleted.names.id);
            if let Some(backup) = &deleted.backup {
                println!("  backup:           {}", backup.path.display());
            }
            if !deleted.core_deleted {
                println!("  core:             {} was already absent", deleted.names.core);
            }
            if !deleted.rules_revoked {
                println!("  access rules:     none were left");
            }
            if let Some(archived) = &deleted.archived_secret {
                println!("  credentials file: archived as {}", archived.display());
            }
            Ok(Outcome::Success)
        }
        Command::List => {
            let tenants = controller(options, security)?.list_tenants().await?;
            print_tenants(&tenants);
            Ok(Outcome::Success)
        }
        Command::Backup { tenant, all } => {
            let controller = controller(options, security)?;
            match tenant {
                Some(tenant) if !all => {
                    let backup = controller.backup_tenant(&tenant).await?;
                    println!(
                        "{}: {} documents in {}",
                        backup.metadata.tenant,
                        backup.metadata.document_count,
                        backup.path.display()
                    );
                    Ok(Outcome::Success)
                }
                _ => {
                    let report = controller.backup_all().await?;
                    for backup in &report.succeeded {
                        println!(
                            "{}: {} documents in {}",
                            backup.metadata.tenant,
                            backup.metadata.document_count,
                            backup.path.display()
                        );
                    }
                    for (tenant, error) in &report.failed {
                        eprintln!("{tenant}: {}", snafu::Report::from_error(error));
                    }
                    Ok(if report.failed.is_empty() {
                        Outcome::Success
                    } else {
                        Outcome::Failure
                    })
                }
            }
        }
        Command::HashPassword(arguments) => hash_password(&arguments, &security),
        Command::Health => {
            let solr = options.solr_client().context(SolrClientSnafu)?;
            let report = health::check(&solr, &security).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context(SerializeReportSnafu)?
            );
            Ok(if report.is_healthy() {
                Outcome::Success
            } else {
                Outcome::Failure
            })
        }
        Command::Security(command) => run_security(command, &security, &TerminalPrompt).await,
        Command::LockStatus => {
            match security.lock().inspect() {
                LockState::Free => println!("free"),
                LockState::Held { owner, stale } => {
                    println!("held by {owner}");
                    if stale {
                        println!("stale: the owning process is gone, the next writer reclaims it");
                    }
                }
                LockState::Unreadable => {
                    println!("held, but the owner record cannot be read");
                }
            }
            Ok(Outcome::Success)
        }
    }
}

fn controller(options: &RuntimeOptions, security: SecurityManager) -> Result<Controller> {
    let solr = options.solr_client().context(SolrClientSnafu)?;
    let service = ComposeService::new(
        &options.service.container_runtime,
        options.service.compose_file.clone(),
        &options.service.solr_service_name,
        solr.clone(),
    );
    let solr = Arc::new(solr);

    Ok(Controller::new(
        security,
        SecretStore::new(&options.paths.tenant_secrets_dir),
        Collaborators {
            resources: solr.clone(),
            service: Arc::new(service),
            queries: solr,
            hasher: Arc::new(SolrBasicAuthHasher),
            prompt: Arc::new(TerminalPrompt),
        },
        options.controller_settings(),
    ))
}

fn print_tenants(tenants: &[TenantSummary]) {
    println!("{:<32} {:<40} {:>10}  STATUS", "TENANT", "CORE", "DOCUMENTS");
    for tenant in tenants {
        let documents = tenant
            .core
            .as_ref()
            .and_then(|core| core.document_count)
            .map_or_else(|| "-".to_owned(), |count| count.to_string());
        let status = if tenant.is_consistent() {
            "ok".to_owned()
        } else {
            format!("incomplete, missing {}", tenant.missing().join(", "))
        };
        println!(
            "{:<32} {:<40} {documents:>10}  {status}",
            tenant.names.id, tenant.names.core
        );
    }

    for tenant in tenants.iter().filter(|tenant| !tenant.is_consistent()) {
        eprintln!(
            "WARNING: tenant {id} is incomplete; remove it with `moodle-solr-tenant delete {id}`",
            id = tenant.names.id
        );
    }
}

fn hash_password(arguments: &HashPasswordArguments, security: &SecurityManager) -> Result<Outcome> {
    let password = match &arguments.password {
        Some(password) => Zeroizing::new(password.clone()),
        None => {
            let mut line = Zeroizing::new(String::new());
            io::stdin()
                .lock()
                .read_line(&mut line)
                .context(ReadPasswordSnafu)?;
            Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_owned())
        }
    };
    ensure!(!password.is_empty(), EmptyPasswordSnafu);

    if let Some(stored) = &arguments.verify {
        let matches = hashing::verify(&password, stored);
        println!("{}", if matches { "match" } else { "no match" });
        return Ok(if matches {
            Outcome::Success
        } else {
            Outcome::Failure
        });
    }

    let hash = match &arguments.reuse {
        Some(username) => reuse_hash(security, username, &password)?,
        None => SolrBasicAuthHasher.hash(&password),
    };
    println!("{hash}");
    Ok(Outcome::Success)
}

/// The stored hash of `username` if `password` matches it, a fresh hash
/// otherwise, including for users without a stored credential.
fn reuse_hash(security: &SecurityManager, username: &str, password: &str) -> Result<String> {
    let document = security.load_document().context(InvalidDocumentSnafu)?;
    if document.credential(username).is_none() {
        tracing::debug!(username, "no stored credential, generating a fresh hash");
    }
    Ok(hashing::verify_or_rehash(
        &SolrBasicAuthHasher,
        &document,
        username,
        password,
    ))
}

async fn run_security(
    command: SecurityCommand,
    security: &SecurityManager,
    prompt: &dyn Prompt,
) -> Result<Outcome> {
    match command {
        SecurityCommand::Validate => {
            let document = security.load_document().context(InvalidDocumentSnafu)?;
            print_validation(&document);
            Ok(Outcome::Success)
        }
        SecurityCommand::Backups => {
            for entry in security.recorder().list().context(ListBackupsSnafu)? {
                let created_at = entry
                    .created_at()
                    .map_or_else(|| "-".to_owned(), |timestamp| timestamp.to_string());
                let description = entry
                    .metadata
                    .as_ref()
                    .map_or("(no metadata)", |metadata| metadata.description.as_str());
                println!("{}  {created_at}  {description}", entry.file_name());
            }
            Ok(Outcome::Success)
        }
        SecurityCommand::Rotate { retention_days } => {
            confirm(
                prompt,
                &format!(
                    "This deletes all security document backups older than {retention_days} days."
                ),
                "rotate backups",
            )?;

            let retention = Duration::checked_from_days(retention_days)
                .context(RetentionOutOfRangeSnafu {
                    days: retention_days,
                })?;

            let config = security.config();
            let guard = security
                .lock()
                .acquire(config.lock_timeout, Backoff::Fixed(config.lock_retry_delay))
                .await
                .context(AcquireLockSnafu)?;
            let removed = security
                .recorder()
                .rotate(retention)
                .context(RotateBackupsSnafu)?;
            if let Err(error) = guard.release() {
                tracing::warn!(%error, "failed to release the security document lock");
            }

            for path in &removed {
                println!("removed {}", path.display());
            }
            println!("{} backup(s) removed", removed.len());
            Ok(Outcome::Success)
        }
        SecurityCommand::Restore { backup } => {
            confirm(
                prompt,
                &format!(
                    "This replaces {} with backup {backup}. Solr must be restarted afterwards.",
                    security.document_path().display()
                ),
                &format!("restore {backup}"),
            )?;

            let report = security.restore_backup(&backup).await.context(RestoreSnafu)?;
            println!("restored {}", report.restored.file_name());
            if let Some(previous) = &report.previous {
                println!("previous document saved as {}", previous.file_name());
            }
            Ok(Outcome::Success)
        }
    }
}

fn confirm(prompt: &dyn Prompt, message: &str, phrase: &str) -> Result<()> {
    let confirmed = prompt.confirm(message, phrase).context(ConfirmSnafu)?;
    ensure!(confirmed, NotConfirmedSnafu { action: phrase });
    Ok(())
}

fn print_validation(document: &SecurityDocument) {
    println!(
        "security document is valid: {} user(s), {} permission(s)",
        document.authentication.credentials.len(),
        document.authorization.permissions.len()
    );
    for role in document.orphan_roles() {
        eprintln!("WARNING: role {role:?} is assigned but not granted by any permission");
    }
}
