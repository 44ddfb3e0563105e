//! Filesystem primitives shared by the recorder, the mutator and the lock manager.
//!
//! Every write to a file another process may read goes through [`StagedFile`]:
//! the content is written to a uniquely named sibling, flushed to disk, and then
//! renamed over the destination. Rename is atomic on the same filesystem, so
//! readers see either the old or the new content, never a torn write.

use std::{
    fmt::Display,
    fs::{self, File, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::{PermissionsExt, chown},
    path::{Path, PathBuf},
    str::FromStr,
};

use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu};

/// Prefix of [`checksum`] values, naming the digest algorithm.
pub const CHECKSUM_PREFIX: &str = "sha256:";

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum FileOwnerParseError {
    #[snafu(display("expected owner in the form UID:GID, got {input:?}"))]
    MissingSeparator { input: String },

    #[snafu(display("invalid numeric id {value:?}"))]
    InvalidId {
        value: String,
        source: std::num::ParseIntError,
    },
}

#[derive(Debug, PartialEq, Eq, Snafu)]
#[snafu(display("invalid octal file mode {input:?}"))]
pub struct FileModeParseError {
    input: String,
    source: std::num::ParseIntError,
}

/// Numeric owner applied to the live document, e.g. the uid/gid the Solr
/// container runs as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
}

impl FromStr for FileOwner {
    type Err = FileOwnerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (uid, gid) = s.split_once(':').context(MissingSeparatorSnafu { input: s })?;

        Ok(Self {
            uid: uid.trim().parse().context(InvalidIdSnafu { value: uid })?,
            gid: gid.trim().parse().context(InvalidIdSnafu { value: gid })?,
        })
    }
}

impl Display for FileOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Unix permission bits, parsed from octal notation like `640`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FromStr for FileMode {
    type Err = FileModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("0o");
        u32::from_str_radix(trimmed, 8)
            .map(Self)
            .context(FileModeParseSnafu { input: s })
    }
}

impl Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

/// Permission bits and (optionally) ownership that must hold on a file after it
/// has been replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilePermissions {
    pub mode: FileMode,
    pub owner: Option<FileOwner>,
}

impl FilePermissions {
    pub const fn new(mode: u32) -> Self {
        Self {
            mode: FileMode(mode),
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: Option<FileOwner>) -> Self {
        self.owner = owner;
        self
    }

    pub fn apply(&self, path: &Path) -> io::Result<()> {
        fs::set_permissions(path, Permissions::from_mode(self.mode.0))?;
        if let Some(FileOwner { uid, gid }) = self.owner {
            chown(path, Some(uid), Some(gid))?;
        }
        Ok(())
    }
}

impl Default for FilePermissions {
    fn default() -> Self {
        Self::new(0o640)
    }
}

/// Returns the content checksum in the `sha256:<hex>` notation stored in backup
/// metadata.
pub fn checksum(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut out = String::with_capacity(CHECKSUM_PREFIX.len() + digest.len() * 2);
    out.push_str(CHECKSUM_PREFIX);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Flushes directory metadata (the rename itself) to disk.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Returns the directory containing `path`, treating a bare filename as
/// relative to the current directory.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// A private sibling file that is either renamed over its destination or
/// removed when dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    persisted: bool,
}

impl StagedFile {
    /// Creates a uniquely named staging file next to `destination` containing
    /// `content`, flushed to disk.
    pub fn create(destination: &Path, content: &[u8]) -> io::Result<Self> {
        let file_name = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = parent_dir(destination).join(format!(
            ".{file_name}.{pid}.{nonce:016x}.tmp",
            pid = std::process::id(),
            nonce = rand::random::<u64>()
        ));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let staged = Self {
            path,
            persisted: false,
        };
        file.write_all(content)?;
        file.sync_all()?;

        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `permissions` and renames the staged file over `destination`.
    pub fn persist(mut self, destination: &Path, permissions: &FilePermissions) -> io::Result<()> {
        permissions.apply(&self.path)?;
        fs::rename(&self.path, destination)?;
        self.persisted = true;
        sync_directory(parent_dir(destination))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(error) = fs::remove_file(&self.path) {
                if error.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(%error, path = %self.path.display(), "failed to remove staging file");
                }
            }
        }
    }
}

/// Atomically replaces `destination` with `content`.
pub fn write_atomically(
    destination: &Path,
    content: &[u8],
    permissions: &FilePermissions,
) -> io::Result<()> {
    StagedFile::create(destination, content)?.persist(destination, permissions)
}
