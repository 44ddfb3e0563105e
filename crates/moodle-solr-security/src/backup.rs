//! Timestamped, checksummed copies of the security document.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use jiff::{SignedDuration, Timestamp};
use moodle_solr_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

use crate::files::{self, FilePermissions, checksum, sync_directory};

type Result<T, E = Error> = std::result::Result<T, E>;

const BACKUP_PREFIX: &str = "security.";
const BACKUP_SUFFIX: &str = ".json";
const METADATA_SUFFIX: &str = ".meta.json";

/// Backups can contain credential hashes, so they are private to the owner.
const BACKUP_PERMISSIONS: FilePermissions = FilePermissions::new(0o600);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read security document {path:?}"))]
    ReadDocument { source: io::Error, path: PathBuf },

    #[snafu(display("failed to create backup directory {path:?}"))]
    CreateBackupDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("failed to write backup {path:?}"))]
    WriteBackup { source: io::Error, path: PathBuf },

    #[snafu(display("failed to serialize backup metadata"))]
    SerializeMetadata { source: serde_json::Error },

    #[snafu(display("failed to write backup metadata {path:?}"))]
    WriteMetadata { source: io::Error, path: PathBuf },

    #[snafu(display("failed to read backup metadata {path:?}"))]
    ReadMetadata { source: io::Error, path: PathBuf },

    #[snafu(display("backup metadata {path:?} is malformed"))]
    ParseMetadata {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read backup {path:?}"))]
    ReadBackup { source: io::Error, path: PathBuf },

    #[snafu(display(
        "backup {path:?} does not match its recorded checksum (expected {expected}, found {actual})"
    ))]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[snafu(display("failed to restore security document {path:?}"))]
    RestoreDocument { source: io::Error, path: PathBuf },

    #[snafu(display("failed to remove backup file {path:?}"))]
    RemoveBackup { source: io::Error, path: PathBuf },

    #[snafu(display("failed to list backup directory {path:?}"))]
    ListBackups { source: io::Error, path: PathBuf },

    #[snafu(display("retention period {retention} is out of range"))]
    RetentionOutOfRange {
        source: jiff::Error,
        retention: Duration,
    },
}

/// Sidecar record stored next to every backup.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackupMetadata {
    pub timestamp: Timestamp,
    pub description: String,
    pub checksum: String,
    pub creator_pid: u32,
}

/// A backup whose metadata is known, and which can therefore be restored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupHandle {
    pub path: PathBuf,
    pub metadata_path: PathBuf,
    pub metadata: BackupMetadata,
}

impl BackupHandle {
    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

/// A backup found on disk. The sidecar may be missing if a snapshot was
/// interrupted or the file was copied in by hand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub metadata: Option<BackupMetadata>,
    pub modified: Option<Timestamp>,
}

impl BackupEntry {
    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }

    /// The recorded snapshot time, falling back to the file modification time.
    pub fn created_at(&self) -> Option<Timestamp> {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.timestamp)
            .or(self.modified)
    }
}

#[derive(Clone, Debug)]
pub struct BackupRecorder {
    document_path: PathBuf,
    backup_dir: PathBuf,
    permissions: FilePermissions,
}

impl BackupRecorder {
    /// `permissions` are reapplied to the live document on restore.
    pub fn new(
        document_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        permissions: FilePermissions,
    ) -> Self {
        Self {
            document_path: document_path.into(),
            backup_dir: backup_dir.into(),
            permissions,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copies the live document into the backup directory.
    pub fn snapshot(&self, description: &str) -> Result<BackupHandle> {
        let content = fs::read(&self.document_path).context(ReadDocumentSnafu {
            path: &self.document_path,
        })?;
        fs::create_dir_all(&self.backup_dir).context(CreateBackupDirectorySnafu {
            path: &self.backup_dir,
        })?;

        let timestamp = Timestamp::now();
        let stamp = format!(
            "{}.{:06}",
            timestamp.strftime("%Y%m%dT%H%M%S"),
            timestamp.subsec_microsecond()
        );
        let path = self.write_backup_file(&stamp, &content)?;

        let metadata = BackupMetadata {
            timestamp,
            description: description.to_owned(),
            checksum: checksum(&content),
            creator_pid: std::process::id(),
        };
        let metadata_path = metadata_path_for(&path);
        let rendered = serde_json::to_vec_pretty(&metadata).context(SerializeMetadataSnafu)?;
        files::write_atomically(&metadata_path, &rendered, &BACKUP_PERMISSIONS).context(
            WriteMetadataSnafu {
                path: &metadata_path,
            },
        )?;

        tracing::info!(
            backup = %path.display(),
            description,
            checksum = %metadata.checksum,
            "created security document backup"
        );

        Ok(BackupHandle {
            path,
            metadata_path,
            metadata,
        })
    }

    /// Creates the backup file under the first free name for `stamp`.
    fn write_backup_file(&self, stamp: &str, content: &[u8]) -> Result<PathBuf> {
        let mut attempt = 0u32;
        loop {
            let name = match attempt {
                0 => format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"),
                n => format!("{BACKUP_PREFIX}{stamp}_{n}{BACKUP_SUFFIX}"),
            };
            let path = self.backup_dir.join(name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                    continue;
                }
                Err(source) => return Err(source).context(WriteBackupSnafu { path }),
            };

            let written = file
                .write_all(content)
                .and_then(|()| file.sync_all())
                .and_then(|()| BACKUP_PERMISSIONS.apply(&path))
                .and_then(|()| sync_directory(&self.backup_dir));
            if let Err(source) = written {
                discard_partial(&path);
                return Err(source).context(WriteBackupSnafu { path });
            }

            return Ok(path);
        }
    }

    /// Replaces the live document with the content of `handle`, after checking
    /// the content against the recorded checksum.
    pub fn restore(&self, handle: &BackupHandle) -> Result<()> {
        let content = fs::read(&handle.path).context(ReadBackupSnafu { path: &handle.path })?;
        let actual = checksum(&content);
        ensure!(
            actual == handle.metadata.checksum,
            ChecksumMismatchSnafu {
                path: &handle.path,
                expected: &handle.metadata.checksum,
                actual,
            }
        );

        files::write_atomically(&self.document_path, &content, &self.permissions).context(
            RestoreDocumentSnafu {
                path: &self.document_path,
            },
        )?;

        tracing::info!(
            backup = %handle.path.display(),
            document = %self.document_path.display(),
            "restored security document from backup"
        );
        Ok(())
    }

    /// Removes the backup and its metadata. Missing files are ignored.
    pub fn discard(&self, handle: &BackupHandle) -> Result<()> {
        remove_if_present(&handle.path)?;
        remove_if_present(&handle.metadata_path)
    }

    /// All backups in the directory, oldest first.
    pub fn list(&self) -> Result<Vec<BackupEntry>> {
        let read_dir = match fs::read_dir(&self.backup_dir) {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(source).context(ListBackupsSnafu {
                    path: &self.backup_dir,
                });
            }
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.context(ListBackupsSnafu {
                path: &self.backup_dir,
            })?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if !is_backup_file_name(&name) {
                continue;
            }

            let path = dir_entry.path();
            let metadata = match read_metadata(&metadata_path_for(&path)) {
                Ok(metadata) => Some(metadata),
                Err(error) => {
                    tracing::debug!(%error, backup = %path.display(), "backup has no usable metadata");
                    None
                }
            };
            let modified = dir_entry
                .metadata()
                .and_then(|stat| stat.modified())
                .ok()
                .and_then(|modified| Timestamp::try_from(modified).ok());

            entries.push(BackupEntry {
                path,
                metadata,
                modified,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Looks up a backup by file name (or path) for restoring.
    pub fn find(&self, name: &str) -> Result<BackupHandle> {
        let candidate = Path::new(name);
        let path = if candidate.components().count() > 1 {
            candidate.to_path_buf()
        } else {
            self.backup_dir.join(candidate)
        };
        let metadata_path = metadata_path_for(&path);
        let metadata = read_metadata(&metadata_path)?;

        Ok(BackupHandle {
            path,
            metadata_path,
            metadata,
        })
    }

    /// Deletes backups older than `retention`, returning the removed paths.
    pub fn rotate(&self, retention: Duration) -> Result<Vec<PathBuf>> {
        let cutoff = SignedDuration::try_from(*retention)
            .and_then(|retention| Timestamp::now().checked_sub(retention))
            .context(RetentionOutOfRangeSnafu { retention })?;

        let mut removed = Vec::new();
        for entry in self.list()? {
            let Some(created_at) = entry.created_at() else {
                continue;
            };
            if created_at >= cutoff {
                continue;
            }

            remove_if_present(&entry.path)?;
            remove_if_present(&metadata_path_for(&entry.path))?;
            tracing::info!(backup = %entry.path.display(), %created_at, "removed expired backup");
            removed.push(entry.path);
        }

        Ok(removed)
    }
}

fn is_backup_file_name(name: &str) -> bool {
    name.starts_with(BACKUP_PREFIX)
        && name.ends_with(BACKUP_SUFFIX)
        && !name.ends_with(METADATA_SUFFIX)
}

fn metadata_path_for(backup: &Path) -> PathBuf {
    let name = display_name(backup);
    let stem = name.strip_suffix(BACKUP_SUFFIX).unwrap_or(&name);
    backup.with_file_name(format!("{stem}{METADATA_SUFFIX}"))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_metadata(path: &Path) -> Result<BackupMetadata> {
    let content = fs::read(path).context(ReadMetadataSnafu { path })?;
    serde_json::from_slice(&content).context(ParseMetadataSnafu { path })
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(source).context(RemoveBackupSnafu { path }),
    }
}

/// Best-effort removal of a backup file whose write failed.
fn discard_partial(path: &Path) {
    if let Err(error) = remove_if_present(path) {
        tracing::warn!(%error, backup = %path.display(), "failed to remove partial backup");
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use tempfile::{TempDir, tempdir};

    use super::*;

    fn recorder() -> (TempDir, BackupRecorder) {
        let dir = tempdir().expect("create temporary directory");
        let document = dir.path().join("security.json");
        fs::write(&document, b"{\"v\": 1}\n").expect("write document");
        let recorder = BackupRecorder::new(
            document,
            dir.path().join("backups"),
            FilePermissions::new(0o640),
        );
        (dir, recorder)
    }

    #[test]
    fn partial_backup_cleanup_is_best_effort() {
        let dir = tempdir().expect("create temporary directory");
        let partial = dir.path().join("security.20240101T000000.000000.json");
        fs::write(&partial, b"{").expect("write partial backup");

        discard_partial(&partial);
        assert!(!partial.exists());

        // Already gone.
        discard_partial(&partial);

        // Removal fails, the error is only logged.
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).expect("create directory");
        discard_partial(&blocked);
        assert!(blocked.is_dir());
    }

    #[test]
    fn snapshot_writes_backup_and_metadata() {
        let (_dir, recorder) = recorder();

        let handle = recorder.snapshot("before add-credential").expect("snapshot");

        assert_eq!(fs::read(&handle.path).expect("read backup"), b"{\"v\": 1}\n");
        assert_eq!(handle.metadata.description, "before add-credential");
        assert_eq!(handle.metadata.creator_pid, std::process::id());
        assert!(handle.metadata.checksum.starts_with("sha256:"));
        assert_eq!(
            read_metadata(&handle.metadata_path).expect("read sidecar"),
            handle.metadata
        );
        let name = handle.file_name();
        assert!(name.starts_with("security.") && name.ends_with(".json"), "{name}");
        let mode = fs::metadata(&handle.path).expect("stat backup").mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn snapshots_in_quick_succession_get_distinct_names() {
        let (_dir, recorder) = recorder();

        let handles: Vec<_> = (0..5)
            .map(|i| recorder.snapshot(&format!("snapshot {i}")).expect("snapshot"))
            .collect();

        let mut names: Vec<_> = handles.iter().map(BackupHandle::file_name).collect();
        names.dedup();
        assert_eq!(names.len(), 5);
        assert_eq!(recorder.list().expect("list backups").len(), 5);
    }

    #[test]
    fn snapshot_of_missing_document_fails() {
        let dir = tempdir().expect("create temporary directory");
        let recorder = BackupRecorder::new(
            dir.path().join("missing.json"),
            dir.path().join("backups"),
            FilePermissions::default(),
        );

        assert!(matches!(
            recorder.snapshot("nothing to copy"),
            Err(Error::ReadDocument { .. })
        ));
    }

    #[test]
    fn restore_brings_back_exact_bytes() {
        let (dir, recorder) = recorder();
        let document = dir.path().join("security.json");
        let handle = recorder.snapshot("rollback point").expect("snapshot");

        fs::write(&document, b"{\"v\": 2}").expect("overwrite document");
        recorder.restore(&handle).expect("restore");

        assert_eq!(fs::read(&document).expect("read document"), b"{\"v\": 1}\n");
        let mode = fs::metadata(&document).expect("stat document").mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn restore_refuses_tampered_backup() {
        let (dir, recorder) = recorder();
        let document = dir.path().join("security.json");
        let handle = recorder.snapshot("rollback point").expect("snapshot");

        fs::write(&handle.path, b"{}").expect("tamper with backup");
        fs::write(&document, b"{\"v\": 2}").expect("overwrite document");

        assert!(matches!(
            recorder.restore(&handle),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert_eq!(fs::read(&document).expect("read document"), b"{\"v\": 2}");
    }

    #[test]
    fn discard_is_idempotent() {
        let (_dir, recorder) = recorder();
        let handle = recorder.snapshot("temporary").expect("snapshot");

        recorder.discard(&handle).expect("discard");
        recorder.discard(&handle).expect("discard again");

        assert!(recorder.list().expect("list backups").is_empty());
    }

    #[test]
    fn find_resolves_file_names() {
        let (_dir, recorder) = recorder();
        let handle = recorder.snapshot("findable").expect("snapshot");

        let found = recorder.find(&handle.file_name()).expect("find backup");
        assert_eq!(found, handle);
        assert!(matches!(
            recorder.find("security.19700101T000000.000000.json"),
            Err(Error::ReadMetadata { .. })
        ));
    }

    #[test]
    fn rotate_removes_only_expired_backups() {
        let (_dir, recorder) = recorder();
        let old = recorder.snapshot("old").expect("snapshot");
        let fresh = recorder.snapshot("fresh").expect("snapshot");

        let mut expired = old.metadata.clone();
        expired.timestamp = Timestamp::now()
            .checked_sub(SignedDuration::from_hours(24 * 40))
            .expect("in range");
        fs::write(
            &old.metadata_path,
            serde_json::to_vec(&expired).expect("serialize metadata"),
        )
        .expect("backdate metadata");

        let removed = recorder.rotate(Duration::from_secs(30 * 24 * 60 * 60)).expect("rotate");

        assert_eq!(removed, vec![old.path.clone()]);
        assert!(!old.metadata_path.exists());
        assert!(fresh.path.exists());
        assert!(fresh.metadata_path.exists());
    }
}
