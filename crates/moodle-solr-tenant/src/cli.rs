//! Command line interface. Every option can also be set through the
//! environment variable of the same name.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use moodle_solr_security::{
    SecurityConfig,
    files::{FileMode, FileOwner, FilePermissions},
};
use moodle_solr_shared::time::Duration;
use moodle_solr_telemetry::tracing::TelemetryOptions;
use zeroize::Zeroizing;

use crate::{
    controller::ControllerSettings,
    external::{self, QueryCredentials},
    solr::SolrClient,
};

/// A century. Longer retentions cannot be subtracted from the current time.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(
    name = "moodle-solr-tenant",
    author,
    version,
    about = "Manage the tenants of a multi-tenant Moodle Solr deployment"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub options: RuntimeOptions,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Create a tenant: its core, Solr user, role, permission and credentials file.
    Create {
        /// Tenant identifier, lowercase letters, digits and '_' only.
        tenant: String,
    },

    /// Delete a tenant. Asks for a typed confirmation first.
    Delete {
        tenant: String,

        /// Back up the tenant first and keep it if the backup fails.
        #[arg(long)]
        with_backup: bool,
    },

    /// List tenants and flag incomplete ones.
    List,

    /// Back up the index and credentials of one or all tenants.
    Backup {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        tenant: Option<String>,

        /// Back up every tenant core.
        #[arg(long)]
        all: bool,
    },

    /// Hash a password the way Solr's BasicAuthPlugin stores it.
    HashPassword(HashPasswordArguments),

    /// Print a JSON health report. Exits with 1 when unhealthy.
    Health,

    /// Inspect and recover the security document.
    #[command(subcommand)]
    Security(SecurityCommand),

    /// Show who holds the security document lock.
    LockStatus,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct HashPasswordArguments {
    /// Password to hash. Read from stdin if omitted.
    pub password: Option<String>,

    /// Check the password against a stored "<hash> <salt>" value instead.
    #[arg(long, value_name = "STORED", conflicts_with = "reuse")]
    pub verify: Option<String>,

    /// Print the hash currently stored for USER if the password still matches it.
    #[arg(long, value_name = "USER")]
    pub reuse: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum SecurityCommand {
    /// Validate the security document and report orphan roles.
    Validate,

    /// List security document backups, oldest first.
    Backups,

    /// Delete security document backups older than the retention period.
    Rotate {
        #[arg(
            long,
            env = "BACKUP_RETENTION_DAYS",
            default_value_t = 30,
            value_parser = clap::value_parser!(u64).range(..=MAX_RETENTION_DAYS)
        )]
        retention_days: u64,
    },

    /// Replace the security document with a backup.
    Restore {
        /// File name of the backup, as printed by `security backups`.
        backup: String,
    },
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RuntimeOptions {
    #[command(flatten)]
    pub paths: PathOptions,

    #[command(flatten)]
    pub timeouts: TimeoutOptions,

    #[command(flatten)]
    pub solr: SolrOptions,

    #[command(flatten)]
    pub service: ServiceOptions,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Path Options")]
pub struct PathOptions {
    /// Solr's security.json.
    #[arg(long, env, value_name = "FILE", default_value = "/var/solr/data/security.json")]
    pub security_json_path: PathBuf,

    #[arg(
        long,
        env,
        value_name = "DIRECTORY",
        default_value = "/var/lib/moodle-solr/backups/security"
    )]
    pub security_backup_dir: PathBuf,

    #[arg(long, env, value_name = "DIRECTORY", default_value = "/var/lib/moodle-solr/locks")]
    pub lock_dir: PathBuf,

    #[arg(
        long,
        env,
        value_name = "DIRECTORY",
        default_value = "/var/lib/moodle-solr/transactions"
    )]
    pub transaction_log_dir: PathBuf,

    /// Where tenant credentials files are written.
    #[arg(long, env, value_name = "DIRECTORY", default_value = "/var/lib/moodle-solr/secrets")]
    pub tenant_secrets_dir: PathBuf,

    #[arg(
        long,
        env,
        value_name = "DIRECTORY",
        default_value = "/var/lib/moodle-solr/backups/tenants"
    )]
    pub tenant_backup_dir: PathBuf,

    /// Permission bits of security.json after every change, in octal.
    #[arg(long, env, value_name = "MODE", default_value = "640")]
    pub security_json_mode: FileMode,

    /// Numeric owner of security.json after every change.
    #[arg(long, env, value_name = "UID:GID")]
    pub security_json_owner: Option<FileOwner>,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Timeout Options")]
pub struct TimeoutOptions {
    /// Wait for the security document lock of a single change.
    #[arg(long, env, value_name = "DURATION", default_value = "30s")]
    pub lock_timeout: Duration,

    /// Wait for the security document lock when opening a transaction.
    #[arg(long, env, value_name = "DURATION", default_value = "5m")]
    pub transaction_lock_timeout: Duration,

    #[arg(long, env, value_name = "DURATION", default_value = "1s")]
    pub lock_retry_delay: Duration,

    /// How long Solr may take to answer again after a restart.
    #[arg(long, env, value_name = "DURATION", default_value = "2m")]
    pub readiness_timeout: Duration,

    #[arg(long, env, value_name = "DURATION", default_value = "2s")]
    pub readiness_poll_interval: Duration,

    #[arg(long, env, value_name = "DURATION", default_value = "30s")]
    pub stop_grace_period: Duration,

    /// Pause between committing a core and requesting its snapshot.
    #[arg(long, env, value_name = "DURATION", default_value = "5s")]
    pub flush_settle_delay: Duration,

    #[arg(long, env, value_name = "DURATION", default_value = "10m")]
    pub snapshot_timeout: Duration,

    #[arg(long, env, value_name = "DURATION", default_value = "2s")]
    pub snapshot_poll_interval: Duration,

    /// Timeout of a single Solr HTTP request.
    #[arg(long, env, value_name = "DURATION", default_value = "30s")]
    pub http_timeout: Duration,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Solr Options")]
pub struct SolrOptions {
    /// Solr origin as reachable from this host.
    #[arg(long, env, value_name = "URL", default_value = "http://localhost:8983")]
    pub solr_url: String,

    /// Solr origin as reachable by Moodle sites, written into credentials files.
    /// Defaults to --solr-url.
    #[arg(long, env, value_name = "URL")]
    pub solr_public_url: Option<String>,

    #[arg(long, env, value_name = "USER")]
    pub solr_admin_user: Option<String>,

    #[arg(long, env, value_name = "PASSWORD", hide_env_values = true, requires = "solr_admin_user")]
    pub solr_admin_password: Option<String>,

    /// Config set tenant cores are created from.
    #[arg(long, env, value_name = "NAME", default_value = "moodle")]
    pub solr_config_set: String,

    /// Directory Solr writes snapshots to, as seen inside the Solr container.
    #[arg(long, env, value_name = "DIRECTORY", default_value = "/var/solr/backups")]
    pub solr_backup_location: String,

    /// The snapshot directory as mounted on this host. Snapshots are copied into
    /// tenant backups only when this is set.
    #[arg(long, env, value_name = "DIRECTORY")]
    pub solr_backup_host_dir: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Service Options")]
pub struct ServiceOptions {
    /// CLI providing `compose`, e.g. docker or podman.
    #[arg(long, env, value_name = "COMMAND", default_value = "docker")]
    pub container_runtime: String,

    #[arg(long, env, value_name = "FILE")]
    pub compose_file: Option<PathBuf>,

    #[arg(long, env, value_name = "NAME", default_value = "solr")]
    pub solr_service_name: String,
}

impl RuntimeOptions {
    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            document_path: self.paths.security_json_path.clone(),
            backup_dir: self.paths.security_backup_dir.clone(),
            lock_dir: self.paths.lock_dir.clone(),
            transaction_log_dir: self.paths.transaction_log_dir.clone(),
            permissions: FilePermissions::new(self.paths.security_json_mode.0)
                .with_owner(self.paths.security_json_owner),
            lock_timeout: self.timeouts.lock_timeout,
            lock_retry_delay: self.timeouts.lock_retry_delay,
            transaction_lock_timeout: self.timeouts.transaction_lock_timeout,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        let timeouts = &self.timeouts;
        ControllerSettings {
            config_set: self.solr.solr_config_set.clone(),
            solr_public_url: self
                .solr
                .solr_public_url
                .clone()
                .unwrap_or_else(|| self.solr.solr_url.clone()),
            stop_grace_period: timeouts.stop_grace_period,
            readiness_timeout: timeouts.readiness_timeout,
            readiness_poll_interval: timeouts.readiness_poll_interval,
            flush_settle_delay: timeouts.flush_settle_delay,
            snapshot_timeout: timeouts.snapshot_timeout,
            snapshot_poll_interval: timeouts.snapshot_poll_interval,
            tenant_backup_dir: self.paths.tenant_backup_dir.clone(),
            solr_backup_location: self.solr.solr_backup_location.clone(),
            solr_backup_host_dir: self.solr.solr_backup_host_dir.clone(),
            backup_lock_timeout: timeouts.lock_timeout,
            lock_retry_delay: timeouts.lock_retry_delay,
        }
    }

    /// A client authenticating as the configured admin user, if any.
    pub fn solr_client(&self) -> Result<SolrClient, external::Error> {
        let admin = self
            .solr
            .solr_admin_user
            .as_ref()
            .map(|username| QueryCredentials {
                username: username.clone(),
                password: Zeroizing::new(self.solr.solr_admin_password.clone().unwrap_or_default()),
            });
        SolrClient::new(&self.solr.solr_url, admin, self.timeouts.http_timeout)
    }
}
