//! All-or-nothing groups of mutations.
//!
//! A [`Transaction`] holds the document lock from [`TransactionCoordinator::begin`]
//! until it is committed or rolled back, across every mutation and the external
//! verification step in between. Any failure inside the transaction restores
//! the document from the snapshot taken at `begin` before the error is
//! returned, so no caller ever sees a transaction left open on an error path.

use std::{
    fmt::Display,
    fs::{self, File, OpenOptions},
    future::Future,
    io::{self, Write},
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use moodle_solr_shared::time::Duration;
use snafu::{ResultExt, Snafu, ensure};

use crate::{
    backup::{self, BackupHandle, BackupRecorder},
    lock::{self, Backoff, LockGuard, LockManager},
    mutator::{self, AtomicMutator},
    transform::{Transform, TransformOutcome},
};

type Result<T, E = Error> = std::result::Result<T, E>;

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to acquire the security document lock for a transaction"))]
    AcquireLock { source: lock::Error },

    #[snafu(display("failed to record the rollback point of transaction {id}"))]
    RollbackPoint { source: backup::Error, id: String },

    #[snafu(display("failed to open transaction log {path:?}"))]
    OpenLog { source: io::Error, path: PathBuf },

    #[snafu(display("failed to write transaction log {path:?}"))]
    WriteLog { source: io::Error, path: PathBuf },

    #[snafu(display("transaction {id} is {state}, not open"))]
    NotOpen { id: String, state: TransactionState },

    #[snafu(display("transaction {id} was rolled back after {transform} failed"))]
    Mutation {
        source: mutator::Error,
        id: String,
        transform: String,
    },

    #[snafu(display("transaction {id} was rolled back because {step} failed"))]
    Verification {
        source: BoxedError,
        id: String,
        step: String,
    },

    #[snafu(display(
        "transaction {id} could not be rolled back, the rollback point is kept at {backup:?}"
    ))]
    Rollback {
        source: backup::Error,
        id: String,
        backup: PathBuf,
    },
}

impl Error {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::AcquireLock { source } if source.is_timeout())
    }

    /// Whether the document is known to have been restored to its state at
    /// `begin`, or was never touched.
    pub fn document_untouched(&self) -> bool {
        !matches!(self, Self::Rollback { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

#[derive(Clone, Debug)]
pub struct TransactionCoordinator {
    mutator: AtomicMutator,
    lock: LockManager,
    recorder: BackupRecorder,
    log_dir: PathBuf,
    lock_timeout: Duration,
    backoff: Backoff,
}

impl TransactionCoordinator {
    /// `lock_timeout` bounds the wait in [`Self::begin`]. It is separate from
    /// the per-mutation timeout because a transaction holds the lock across a
    /// service restart.
    pub fn new(
        mutator: AtomicMutator,
        lock: LockManager,
        recorder: BackupRecorder,
        log_dir: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            mutator,
            lock,
            recorder,
            log_dir: log_dir.into(),
            lock_timeout,
            backoff: Backoff::exponential(Duration::from_secs(1)),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Opens a transaction. Nothing is left held if this fails.
    #[tracing::instrument(skip(self))]
    pub async fn begin(&self, description: &str) -> Result<Transaction> {
        let guard = self
            .lock
            .acquire(self.lock_timeout, self.backoff)
            .await
            .context(AcquireLockSnafu)?;

        let started_at = Timestamp::now();
        let id = format!(
            "{}-{}-{:08x}",
            started_at.strftime("%Y%m%dT%H%M%S"),
            std::process::id(),
            rand::random::<u32>()
        );

        let rollback_point = self
            .recorder
            .snapshot(&format!("rollback point of transaction {id}: {description}"))
            .context(RollbackPointSnafu { id: &id })?;

        let log = match TransactionLog::open(&self.log_dir, &id, description) {
            Ok(log) => log,
            Err(error) => {
                if let Err(discard_error) = self.recorder.discard(&rollback_point) {
                    tracing::warn!(%discard_error, "failed to discard unused rollback point");
                }
                return Err(error);
            }
        };

        tracing::info!(transaction = %id, description, "began transaction");
        Ok(Transaction {
            id,
            started_at,
            state: TransactionState::Open,
            guard: Some(guard),
            rollback_point,
            log,
            mutator: self.mutator.clone(),
            recorder: self.recorder.clone(),
        })
    }
}

/// An open unit of work. Must end in [`Transaction::commit`] or
/// [`Transaction::rollback`]; dropping it while open rolls it back.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    started_at: Timestamp,
    state: TransactionState,
    guard: Option<LockGuard>,
    rollback_point: BackupHandle,
    log: TransactionLog,
    mutator: AtomicMutator,
    recorder: BackupRecorder,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn rollback_point(&self) -> &BackupHandle {
        &self.rollback_point
    }

    /// Appends a line to the operation log. Does nothing once the transaction
    /// has ended.
    pub fn log_operation(&mut self, message: &str) -> Result<()> {
        if self.state != TransactionState::Open {
            return Ok(());
        }
        self.log.append(message)
    }

    /// Applies `transform` as part of this transaction. On failure the
    /// transaction is rolled back before the error is returned.
    pub fn apply(&mut self, transform: &Transform, description: &str) -> Result<TransformOutcome> {
        self.ensure_open()?;
        self.log_operation(&format!("apply {transform}"))?;

        let result = match &self.guard {
            Some(guard) => self.mutator.apply_locked(guard, transform, description),
            None => {
                return NotOpenSnafu {
                    id: &self.id,
                    state: self.state,
                }
                .fail();
            }
        };

        match result {
            Ok(mutation) => {
                let outcome = match mutation.outcome {
                    TransformOutcome::Applied => "applied",
                    TransformOutcome::Unchanged => "unchanged",
                };
                self.log_operation(&format!("{outcome} {transform}"))?;
                Ok(mutation.outcome)
            }
            Err(source) => {
                tracing::error!(transaction = %self.id, %transform, error = %source, "mutation failed");
                self.abort(&format!("{transform} failed: {source}"))?;
                Err(source).context(MutationSnafu {
                    id: &self.id,
                    transform: transform.to_string(),
                })
            }
        }
    }

    /// Runs an external verification step while the lock is still held. On
    /// failure the transaction is rolled back before the error is returned.
    pub async fn verify<F, E>(&mut self, step: &str, check: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), E>>,
        E: Into<BoxedError>,
    {
        self.ensure_open()?;
        self.log_operation(&format!("verify {step}"))?;

        match check.await {
            Ok(()) => {
                self.log_operation(&format!("verified {step}"))?;
                Ok(())
            }
            Err(error) => {
                let source: BoxedError = error.into();
                tracing::error!(transaction = %self.id, step, error = %source, "verification failed");
                self.abort(&format!("{step} failed: {source}"))?;
                Err(source).context(VerificationSnafu { id: &self.id, step })
            }
        }
    }

    /// Makes the applied changes final and releases the lock.
    #[tracing::instrument(skip(self), fields(transaction = %self.id))]
    pub fn commit(mut self) -> Result<()> {
        self.ensure_open()?;
        self.log_operation("commit")?;
        self.state = TransactionState::Committed;

        self.log.archive("commit");
        if let Err(error) = self.recorder.discard(&self.rollback_point) {
            tracing::warn!(%error, "failed to discard rollback point of committed transaction");
        }
        self.release_lock();

        tracing::info!("committed transaction");
        Ok(())
    }

    /// Restores the document to its state at `begin` and releases the lock.
    #[tracing::instrument(skip(self), fields(transaction = %self.id))]
    pub fn rollback(mut self, reason: &str) -> Result<()> {
        self.ensure_open()?;
        self.abort(reason)
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(
            self.state == TransactionState::Open,
            NotOpenSnafu {
                id: &self.id,
                state: self.state,
            }
        );
        Ok(())
    }

    /// Rolls back an open transaction. The lock is released even if the
    /// restore fails; the rollback point is then kept for manual recovery.
    fn abort(&mut self, reason: &str) -> Result<()> {
        if self.state != TransactionState::Open {
            return Ok(());
        }
        if let Err(error) = self.log.append(&format!("rollback: {reason}")) {
            tracing::warn!(%error, "failed to log rollback");
        }
        self.state = TransactionState::RolledBack;

        let restored = self.recorder.restore(&self.rollback_point);
        let result = match restored {
            Ok(()) => {
                if let Err(error) = self.recorder.discard(&self.rollback_point) {
                    tracing::warn!(%error, "failed to discard rollback point");
                }
                tracing::warn!(transaction = %self.id, reason, "rolled back transaction");
                Ok(())
            }
            Err(source) => {
                tracing::error!(
                    transaction = %self.id,
                    backup = %self.rollback_point.path.display(),
                    error = %source,
                    "failed to roll back transaction"
                );
                Err(source).context(RollbackSnafu {
                    id: &self.id,
                    backup: &self.rollback_point.path,
                })
            }
        };

        self.log.archive("rollback");
        self.release_lock();
        result
    }

    fn release_lock(&mut self) {
        if let Some(guard) = self.guard.take() {
            if let Err(error) = guard.release() {
                tracing::error!(transaction = %self.id, %error, "failed to release lock");
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            tracing::warn!(transaction = %self.id, "transaction dropped while open");
            // Errors are logged by abort.
            let _ = self.abort("dropped while open");
        }
    }
}

/// Append-only log of a transaction, moved to `commit/` or `rollback/` when the
/// transaction ends.
#[derive(Debug)]
struct TransactionLog {
    log_dir: PathBuf,
    file_name: String,
    path: PathBuf,
    file: File,
}

impl TransactionLog {
    fn open(log_dir: &Path, id: &str, description: &str) -> Result<Self> {
        let active_dir = log_dir.join("active");
        fs::create_dir_all(&active_dir).context(OpenLogSnafu { path: &active_dir })?;

        let file_name = format!("{id}.log");
        let path = active_dir.join(&file_name);
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .context(OpenLogSnafu { path: &path })?;

        let mut log = Self {
            log_dir: log_dir.to_path_buf(),
            file_name,
            path,
            file,
        };
        log.append(&format!("begin {description}"))?;
        Ok(log)
    }

    fn append(&mut self, message: &str) -> Result<()> {
        writeln!(self.file, "{} {message}", Timestamp::now())
            .and_then(|()| self.file.sync_data())
            .context(WriteLogSnafu { path: &self.path })
    }

    /// Archiving is best effort: the outcome of the transaction is already
    /// decided when this runs.
    fn archive(&mut self, designation: &str) {
        let target_dir = self.log_dir.join(designation);
        let target = target_dir.join(&self.file_name);

        let moved = fs::create_dir_all(&target_dir).and_then(|()| fs::rename(&self.path, &target));
        match moved {
            Ok(()) => self.path = target,
            Err(error) => tracing::warn!(
                %error,
                log = %self.path.display(),
                designation,
                "failed to archive transaction log"
            ),
        }
    }
}
