//! The only code path that writes the live security document.
//!
//! A mutation snapshots the current document, renders the transform into a
//! private staging file, re-reads and validates that file, and renames it over
//! the live document. Until that rename nothing visible has changed, so every
//! failure before it leaves the live document byte-for-byte intact.

use std::{
    fs,
    path::{Path, PathBuf},
};

use moodle_solr_shared::time::Duration;
use snafu::{ResultExt, Snafu, ensure};

use crate::{
    backup::{self, BackupHandle, BackupRecorder},
    document::{self, SecurityDocument},
    files::{FilePermissions, StagedFile},
    lock::{self, Backoff, LockGuard, LockManager},
    transform::{self, Transform, TransformOutcome},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to acquire the security document lock"))]
    AcquireLock { source: lock::Error },

    #[snafu(display("the lock guard for {held:?} does not protect {expected:?}"))]
    ForeignLock { held: PathBuf, expected: PathBuf },

    #[snafu(display("failed to back up the security document before {description:?}"))]
    Backup {
        source: backup::Error,
        description: String,
    },

    #[snafu(display("the current security document is invalid"))]
    LoadDocument { source: document::Error },

    #[snafu(display("failed to apply {transform}"))]
    ApplyTransform {
        source: transform::Error,
        transform: String,
    },

    #[snafu(display("failed to render the transformed security document"))]
    Render { source: document::Error },

    #[snafu(display("failed to stage the transformed security document next to {path:?}"))]
    Stage {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to re-read the staged security document {path:?}"))]
    ReadStaged {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("{transform} produces an invalid security document"))]
    InvalidResult {
        source: document::Error,
        transform: String,
    },

    #[snafu(display("{transform} would leave the security document without any credential"))]
    EmptyCredentials { transform: String },

    #[snafu(display("failed to replace the security document {path:?}"))]
    Replace {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl Error {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::AcquireLock { source } if source.is_timeout())
    }
}

/// Result of a successful mutation.
#[derive(Clone, Debug)]
pub struct Mutation {
    pub outcome: TransformOutcome,

    /// The snapshot taken before the transform was rendered.
    pub backup: BackupHandle,
}

#[derive(Clone, Debug)]
pub struct AtomicMutator {
    document_path: PathBuf,
    lock: LockManager,
    recorder: BackupRecorder,
    permissions: FilePermissions,
    lock_timeout: Duration,
    backoff: Backoff,
}

impl AtomicMutator {
    pub fn new(
        document_path: impl Into<PathBuf>,
        lock: LockManager,
        recorder: BackupRecorder,
        permissions: FilePermissions,
    ) -> Self {
        Self {
            document_path: document_path.into(),
            lock,
            recorder,
            permissions,
            lock_timeout: Duration::from_secs(30),
            backoff: Backoff::Fixed(Duration::from_secs(1)),
        }
    }

    /// Lock wait used by [`Self::apply_transform`]; polls every `retry_delay`.
    pub fn with_lock_timeout(mut self, timeout: Duration, retry_delay: Duration) -> Self {
        self.lock_timeout = timeout;
        self.backoff = Backoff::Fixed(retry_delay);
        self
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    /// Applies a single transform under its own lock.
    #[tracing::instrument(skip(self, transform), fields(%transform))]
    pub async fn apply_transform(&self, transform: &Transform, description: &str) -> Result<Mutation> {
        let guard = self
            .lock
            .acquire(self.lock_timeout, self.backoff)
            .await
            .context(AcquireLockSnafu)?;

        let result = self.apply_locked(&guard, transform, description);

        if let Err(error) = guard.release() {
            tracing::warn!(%error, "failed to release the security document lock");
        }
        result
    }

    /// Applies a transform while the caller already holds the document lock.
    pub fn apply_locked(
        &self,
        guard: &LockGuard,
        transform: &Transform,
        description: &str,
    ) -> Result<Mutation> {
        ensure!(
            guard.path() == self.lock.path(),
            ForeignLockSnafu {
                held: guard.path(),
                expected: self.lock.path(),
            }
        );

        let backup = self
            .recorder
            .snapshot(description)
            .context(BackupSnafu { description })?;

        let current = SecurityDocument::load(&self.document_path).context(LoadDocumentSnafu)?;
        let (next, outcome) = transform.apply(&current).context(ApplyTransformSnafu {
            transform: transform.to_string(),
        })?;

        if outcome == TransformOutcome::Unchanged {
            tracing::debug!(%transform, "transform does not change the security document");
            return Ok(Mutation { outcome, backup });
        }

        let rendered = next.to_vec_pretty().context(RenderSnafu)?;
        let staged = StagedFile::create(&self.document_path, &rendered).context(StageSnafu {
            path: &self.document_path,
        })?;

        let staged_content = fs::read(staged.path()).context(ReadStagedSnafu {
            path: staged.path(),
        })?;
        let staged_document =
            SecurityDocument::from_slice(&staged_content).context(InvalidResultSnafu {
                transform: transform.to_string(),
            })?;
        ensure!(
            !staged_document.authentication.credentials.is_empty(),
            EmptyCredentialsSnafu {
                transform: transform.to_string(),
            }
        );

        staged
            .persist(&self.document_path, &self.permissions)
            .context(ReplaceSnafu {
                path: &self.document_path,
            })?;

        tracing::info!(%transform, description, "updated security document");
        Ok(Mutation { outcome, backup })
    }
}
