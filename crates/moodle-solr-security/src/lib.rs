//! Lock-protected, transactional management of Solr's `security.json`.
//!
//! The building blocks, from the bottom up:
//!
//! - [`lock::LockManager`]: cross-process mutual exclusion with stale lock
//!   reclaim.
//! - [`backup::BackupRecorder`]: checksummed snapshots of the document.
//! - [`mutator::AtomicMutator`]: copy, transform, validate, rename.
//! - [`transaction::TransactionCoordinator`]: several mutations and an external
//!   verification step as one all-or-nothing unit.
//!
//! [`SecurityManager`] wires them together for one document.

use std::path::{Path, PathBuf};

use moodle_solr_shared::time::Duration;
use snafu::{ResultExt, Snafu};

use crate::{
    backup::{BackupHandle, BackupRecorder},
    document::SecurityDocument,
    files::FilePermissions,
    lock::{Backoff, LockManager},
    mutator::AtomicMutator,
    transaction::TransactionCoordinator,
};

pub mod backup;
pub mod document;
pub mod files;
pub mod hashing;
pub mod lock;
pub mod mutator;
pub mod transaction;
pub mod transform;

/// File name of the lock protecting the security document.
pub const SECURITY_LOCK_NAME: &str = "security.lock";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to acquire the security document lock"))]
    AcquireLock { source: lock::Error },

    #[snafu(display("failed to look up backup {name:?}"))]
    FindBackup {
        source: backup::Error,
        name: String,
    },

    #[snafu(display("failed to read backup {path:?}"))]
    ReadBackup {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("backup {path:?} does not contain a valid security document"))]
    InvalidBackup {
        source: document::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to restore backup {path:?}"))]
    Restore {
        source: backup::Error,
        path: PathBuf,
    },
}

/// Locations and limits for managing one security document.
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub document_path: PathBuf,
    pub backup_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub transaction_log_dir: PathBuf,
    pub permissions: FilePermissions,

    /// Lock wait of a single mutation or restore.
    pub lock_timeout: Duration,
    pub lock_retry_delay: Duration,

    /// Lock wait when opening a transaction.
    pub transaction_lock_timeout: Duration,
}

/// What [`SecurityManager::restore_backup`] did.
#[derive(Clone, Debug)]
pub struct RestoreReport {
    pub restored: BackupHandle,

    /// Snapshot of the document as it was right before the restore, if it
    /// could be read.
    pub previous: Option<BackupHandle>,
}

#[derive(Clone, Debug)]
pub struct SecurityManager {
    config: SecurityConfig,
    lock: LockManager,
    recorder: BackupRecorder,
    mutator: AtomicMutator,
    transactions: TransactionCoordinator,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Self {
        let lock = LockManager::new(config.lock_dir.join(SECURITY_LOCK_NAME));
        let recorder = BackupRecorder::new(
            &config.document_path,
            &config.backup_dir,
            config.permissions,
        );
        let mutator = AtomicMutator::new(
            &config.document_path,
            lock.clone(),
            recorder.clone(),
            config.permissions,
        )
        .with_lock_timeout(config.lock_timeout, config.lock_retry_delay);
        let transactions = TransactionCoordinator::new(
            mutator.clone(),
            lock.clone(),
            recorder.clone(),
            &config.transaction_log_dir,
            config.transaction_lock_timeout,
        )
        .with_backoff(Backoff::exponential(config.lock_retry_delay));

        Self {
            config,
            lock,
            recorder,
            mutator,
            transactions,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn document_path(&self) -> &Path {
        &self.config.document_path
    }

    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    pub fn recorder(&self) -> &BackupRecorder {
        &self.recorder
    }

    pub fn mutator(&self) -> &AtomicMutator {
        &self.mutator
    }

    pub fn transactions(&self) -> &TransactionCoordinator {
        &self.transactions
    }

    /// Reads the live document without taking the lock. Readers always see a
    /// complete document because writers only ever rename.
    pub fn load_document(&self) -> Result<SecurityDocument, document::Error> {
        SecurityDocument::load(&self.config.document_path)
    }

    /// Replaces the live document with a backup, for disaster recovery.
    ///
    /// The backup must pass its checksum and parse as a valid document. The
    /// current document is snapshotted first when it is readable.
    #[tracing::instrument(skip(self))]
    pub async fn restore_backup(&self, name: &str) -> Result<RestoreReport, Error> {
        let guard = self
            .lock
            .acquire(
                self.config.lock_timeout,
                Backoff::Fixed(self.config.lock_retry_delay),
            )
            .await
            .context(AcquireLockSnafu)?;

        let restored = self.recorder.find(name).context(FindBackupSnafu { name })?;
        let content = std::fs::read(&restored.path).context(ReadBackupSnafu {
            path: &restored.path,
        })?;
        SecurityDocument::from_slice(&content).context(InvalidBackupSnafu {
            path: &restored.path,
        })?;

        let previous = match self
            .recorder
            .snapshot(&format!("before restoring {}", restored.file_name()))
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                tracing::warn!(%error, "current security document could not be backed up before restore");
                None
            }
        };

        self.recorder.restore(&restored).context(RestoreSnafu {
            path: &restored.path,
        })?;

        if let Err(error) = guard.release() {
            tracing::warn!(%error, "failed to release the security document lock");
        }
        Ok(RestoreReport { restored, previous })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::{document::tests::INITIAL_DOCUMENT, transform::Transform};

    fn manager(root: &Path) -> SecurityManager {
        let document_path = root.join("security.json");
        fs::write(&document_path, INITIAL_DOCUMENT).expect("write document");

        SecurityManager::new(SecurityConfig {
            document_path,
            backup_dir: root.join("backups"),
            lock_dir: root.join("locks"),
            transaction_log_dir: root.join("transactions"),
            permissions: FilePermissions::new(0o640),
            lock_timeout: Duration::from_secs(2),
            lock_retry_delay: Duration::from_millis(20),
            transaction_lock_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn restore_backup_round_trip() {
        let dir = tempdir().expect("create temporary directory");
        let manager = manager(dir.path());
        let original = fs::read(manager.document_path()).expect("read document");

        let mutation = manager
            .mutator()
            .apply_transform(
                &Transform::RemoveUserRole {
                    username: "admin".to_owned(),
                },
                "drop admin roles",
            )
            .await
            .expect("mutation");
        assert_ne!(fs::read(manager.document_path()).expect("read document"), original);

        let report = manager
            .restore_backup(&mutation.backup.file_name())
            .await
            .expect("restore");

        assert_eq!(fs::read(manager.document_path()).expect("read document"), original);
        assert!(report.previous.is_some());
        assert!(manager.lock().inspect() == lock::LockState::Free);
    }

    #[tokio::test]
    async fn restore_rejects_invalid_backup_content() {
        let dir = tempdir().expect("create temporary directory");
        let manager = manager(dir.path());
        let before = fs::read(manager.document_path()).expect("read document");

        // A checksummed but unusable backup.
        fs::write(manager.document_path(), b"{\"not\": \"security\"}").expect("corrupt document");
        let handle = manager.recorder().snapshot("corrupt").expect("snapshot");
        fs::write(manager.document_path(), &before).expect("repair document");

        let error = manager
            .restore_backup(&handle.file_name())
            .await
            .expect_err("invalid backup is refused");

        assert!(matches!(error, Error::InvalidBackup { .. }));
        assert_eq!(fs::read(manager.document_path()).expect("read document"), before);
    }
}
