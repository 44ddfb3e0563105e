//! Generated tenant secrets and the credential files handed to Moodle admins.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use moodle_solr_security::files::{FilePermissions, write_atomically};
use rand::Rng;
use snafu::{OptionExt, ResultExt, Snafu};
use zeroize::Zeroizing;

use crate::identifier::TenantId;

type Result<T, E = Error> = std::result::Result<T, E>;

pub const PASSWORD_LENGTH: usize = 32;

/// Characters a generated password is drawn from. Excludes quotes, `$`, `#`,
/// backslash and whitespace so the value can be used unquoted in env files.
const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@%^*-_=+.";

const CREDENTIALS_PERMISSIONS: FilePermissions = FilePermissions::new(0o600);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create secrets directory {path:?}"))]
    CreateDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("failed to write credentials file {path:?}"))]
    WriteCredentials { source: io::Error, path: PathBuf },

    #[snafu(display("failed to read credentials file {path:?}"))]
    ReadCredentials { source: io::Error, path: PathBuf },

    #[snafu(display("credentials file {path:?} has no {key} entry"))]
    MissingKey { path: PathBuf, key: &'static str },

    #[snafu(display("credentials file {path:?} has an invalid CREATED_AT value"))]
    InvalidTimestamp { source: jiff::Error, path: PathBuf },

    #[snafu(display("failed to archive credentials file {path:?}"))]
    ArchiveCredentials { source: io::Error, path: PathBuf },
}

/// Generates a password from a cryptographically secure source.
pub fn generate_password() -> Zeroizing<String> {
    let mut rng = rand::rng();
    let password = (0..PASSWORD_LENGTH)
        .map(|_| char::from(PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())]))
        .collect();
    Zeroizing::new(password)
}

/// Everything a Moodle instance needs to connect to its core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantCredentials {
    pub tenant: String,
    pub solr_url: String,
    pub core: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub created_at: Timestamp,
}

impl TenantCredentials {
    fn render(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "# Solr credentials for tenant {tenant}\n\
             TENANT_ID={tenant}\n\
             SOLR_URL={solr_url}\n\
             SOLR_CORE={core}\n\
             SOLR_USERNAME={username}\n\
             SOLR_PASSWORD={password}\n\
             CREATED_AT={created_at}\n",
            tenant = self.tenant,
            solr_url = self.solr_url,
            core = self.core,
            username = self.username,
            password = self.password.as_str(),
            created_at = self.created_at,
        ))
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let value = |key: &'static str| -> Result<String> {
            content
                .lines()
                .filter(|line| !line.trim_start().starts_with('#'))
                .filter_map(|line| line.split_once('='))
                .find(|(candidate, _)| candidate.trim() == key)
                .map(|(_, value)| value.trim().to_owned())
                .context(MissingKeySnafu { path, key })
        };

        Ok(Self {
            tenant: value("TENANT_ID")?,
            solr_url: value("SOLR_URL")?,
            core: value("SOLR_CORE")?,
            username: value("SOLR_USERNAME")?,
            password: Zeroizing::new(value("SOLR_PASSWORD")?),
            created_at: value("CREATED_AT")?
                .parse()
                .context(InvalidTimestampSnafu { path })?,
        })
    }
}

/// The directory holding one `<tenant>_credentials.env` file per tenant.
#[derive(Clone, Debug)]
pub struct SecretStore {
    dir: PathBuf,
}

impl SecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, tenant: &TenantId) -> PathBuf {
        self.dir.join(format!("{tenant}_credentials.env"))
    }

    pub fn exists(&self, tenant: &TenantId) -> bool {
        self.path_for(tenant).exists()
    }

    /// Writes the credentials file, readable by the owner only.
    pub fn write(&self, tenant: &TenantId, credentials: &TenantCredentials) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).context(CreateDirectorySnafu { path: &self.dir })?;

        let path = self.path_for(tenant);
        let rendered = credentials.render();
        write_atomically(&path, rendered.as_bytes(), &CREDENTIALS_PERMISSIONS)
            .context(WriteCredentialsSnafu { path: &path })?;

        tracing::info!(%tenant, path = %path.display(), "stored tenant credentials");
        Ok(path)
    }

    pub fn read(&self, tenant: &TenantId) -> Result<TenantCredentials> {
        let path = self.path_for(tenant);
        let content = Zeroizing::new(
            fs::read_to_string(&path).context(ReadCredentialsSnafu { path: &path })?,
        );
        TenantCredentials::parse(&path, &content)
    }

    /// Renames the credentials file with a deletion timestamp suffix. Returns
    /// `None` if there was no file.
    pub fn archive(&self, tenant: &TenantId) -> Result<Option<PathBuf>> {
        let path = self.path_for(tenant);
        let archived = path.with_file_name(format!(
            "{tenant}_credentials.env.deleted.{}",
            Timestamp::now().strftime("%Y%m%dT%H%M%S")
        ));

        match fs::rename(&path, &archived) {
            Ok(()) => {
                tracing::info!(%tenant, archived = %archived.display(), "archived tenant credentials");
                Ok(Some(archived))
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(ArchiveCredentialsSnafu { path }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use tempfile::tempdir;

    use super::*;

    fn acme() -> TenantId {
        "acme".parse().expect("valid identifier")
    }

    fn credentials(password: &str) -> TenantCredentials {
        TenantCredentials {
            tenant: "acme".to_owned(),
            solr_url: "http://solr.example.com:8983/solr".to_owned(),
            core: "moodle_acme".to_owned(),
            username: "acme_customer".to_owned(),
            password: Zeroizing::new(password.to_owned()),
            created_at: "2026-03-01T12:00:00Z".parse().expect("valid timestamp"),
        }
    }

    #[test]
    fn generated_passwords_use_the_alphabet() {
        let first = generate_password();
        let second = generate_password();

        assert_eq!(first.len(), PASSWORD_LENGTH);
        assert!(first.bytes().all(|byte| PASSWORD_ALPHABET.contains(&byte)));
        assert_ne!(first, second);
    }

    #[test]
    fn write_then_read() {
        let dir = tempdir().expect("create temporary directory");
        let store = SecretStore::new(dir.path().join("secrets"));

        let path = store
            .write(&acme(), &credentials("s3cr=t!@%"))
            .expect("write credentials");

        assert_eq!(path, dir.path().join("secrets/acme_credentials.env"));
        let mode = fs::metadata(&path).expect("stat file").mode() & 0o777;
        assert_eq!(mode, 0o600);
        let content = fs::read_to_string(&path).expect("read file");
        assert!(content.contains("SOLR_USERNAME=acme_customer\n"));
        assert!(content.contains("SOLR_PASSWORD=s3cr=t!@%\n"));

        assert_eq!(store.read(&acme()).expect("read credentials"), credentials("s3cr=t!@%"));
    }

    #[test]
    fn archive_keeps_the_file() {
        let dir = tempdir().expect("create temporary directory");
        let store = SecretStore::new(dir.path());
        store
            .write(&acme(), &credentials("password"))
            .expect("write credentials");

        let archived = store
            .archive(&acme())
            .expect("archive")
            .expect("file existed");

        assert!(!store.exists(&acme()));
        assert!(
            archived
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("acme_credentials.env.deleted."))
        );
        assert!(archived.exists());
        assert_eq!(store.archive(&acme()).expect("archive again"), None);
    }
}
