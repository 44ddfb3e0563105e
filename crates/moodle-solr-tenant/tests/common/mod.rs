//! In-memory stand-ins for Solr, the container runtime and the operator.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use indoc::indoc;
use moodle_solr_security::{
    SecurityConfig, SecurityManager,
    document::{CATCH_ALL_PERMISSION, OneOrMany, SecurityDocument},
    files::FilePermissions,
    hashing::{self, SolrBasicAuthHasher},
};
use moodle_solr_shared::time::Duration;
use moodle_solr_tenant::{
    controller::{Collaborators, Controller, ControllerSettings},
    external::{
        QueryCredentials, QueryExecutor, QueryOutcome, RejectedSnafu, ResourceManager,
        ResourceStatus, Result, ServiceControl, SnapshotStatus,
    },
    prompt::Prompt,
    secret::SecretStore,
};
use tempfile::TempDir;

pub const INITIAL_DOCUMENT: &str = indoc! {r#"
    {
      "authentication": {
        "blockUnknown": true,
        "class": "solr.BasicAuthPlugin",
        "credentials": {
          "admin": "IV0EHq1OnNrj6gvRCwvFwTrZ1+z1oBbnQdiVC3otuq0= Ndd7LKvVBAaZIF0QAVi1ekCfAJXr1GGfLtRUXhgrF8c="
        },
        "realm": "Moodle Solr",
        "forwardCredentials": false
      },
      "authorization": {
        "class": "solr.RuleBasedAuthorizationPlugin",
        "permissions": [
          { "name": "security-edit", "role": "admin" },
          { "name": "all", "role": "admin" }
        ],
        "user-role": {
          "admin": ["admin"]
        }
      }
    }
"#};

#[derive(Debug, Default)]
struct SolrState {
    cores: BTreeMap<String, u64>,
    snapshots: BTreeMap<String, SnapshotStatus>,
    unreachable: BTreeSet<String>,
    calls: Vec<String>,
}

/// Solr with cores in memory. Queries are authorized against the live
/// security document the way `RuleBasedAuthorizationPlugin` would.
pub struct FakeSolr {
    state: Mutex<SolrState>,
    document_path: PathBuf,
    snapshot_dir: PathBuf,
    pub fail_flush: AtomicBool,
    pub fail_list: AtomicBool,
}

impl FakeSolr {
    pub fn new(document_path: &Path, snapshot_dir: &Path) -> Self {
        Self {
            state: Mutex::default(),
            document_path: document_path.to_owned(),
            snapshot_dir: snapshot_dir.to_owned(),
            fail_flush: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SolrState> {
        self.state.lock().expect("solr state is not poisoned")
    }

    pub fn add_core(&self, name: &str, documents: u64) {
        self.state().cores.insert(name.to_owned(), documents);
    }

    pub fn remove_core(&self, name: &str) {
        self.state().cores.remove(name);
    }

    pub fn has_core(&self, name: &str) -> bool {
        self.state().cores.contains_key(name)
    }

    /// Queries against `name` fail without an authorization decision.
    pub fn make_unreachable(&self, name: &str) {
        self.state().unreachable.insert(name.to_owned());
    }

    /// Mutating calls made so far, e.g. `create moodle_acme`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn authorize(&self, resource: &str, credentials: &QueryCredentials) -> QueryOutcome {
        let document = match SecurityDocument::load(&self.document_path) {
            Ok(document) => document,
            Err(error) => {
                return QueryOutcome::Error {
                    message: error.to_string(),
                };
            }
        };

        let authenticated = document
            .credential(&credentials.username)
            .is_some_and(|stored| hashing::verify(&credentials.password, stored));
        if !authenticated {
            return QueryOutcome::AccessDenied;
        }

        let roles = document
            .roles_of(&credentials.username)
            .map(OneOrMany::to_vec)
            .unwrap_or_default();
        let matching = document.authorization.permissions.iter().find(|permission| {
            permission.name == CATCH_ALL_PERMISSION
                || permission
                    .collection
                    .as_ref()
                    .and_then(Option::as_ref)
                    .is_some_and(|collections| collections.contains(resource))
        });

        match matching {
            Some(permission) if !roles.iter().any(|role| permission.grants_role(role)) => {
                QueryOutcome::AccessDenied
            }
            _ => QueryOutcome::Success,
        }
    }
}

#[async_trait]
impl ResourceManager for FakeSolr {
    async fn create_resource(&self, name: &str, _template: &str) -> Result<()> {
        let mut state = self.state();
        if state.cores.contains_key(name) {
            return RejectedSnafu {
                operation: format!("create core {name}"),
                status: 500_u16,
                message: "core already exists",
            }
            .fail();
        }
        state.cores.insert(name.to_owned(), 0);
        state.calls.push(format!("create {name}"));
        Ok(())
    }

    async fn delete_resource(&self, name: &str, purge_data: bool) -> Result<()> {
        let mut state = self.state();
        if state.cores.remove(name).is_none() {
            return RejectedSnafu {
                operation: format!("unload core {name}"),
                status: 400_u16,
                message: "no such core",
            }
            .fail();
        }
        state.calls.push(format!("delete {name} purge={purge_data}"));
        Ok(())
    }

    async fn resource_status(&self, name: &str) -> Result<Option<ResourceStatus>> {
        Ok(self
            .state()
            .cores
            .get(name)
            .map(|documents| ResourceStatus {
                name: name.to_owned(),
                document_count: Some(*documents),
                ..ResourceStatus::default()
            }))
    }

    async fn list_resources(&self) -> Result<Vec<ResourceStatus>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return RejectedSnafu {
                operation: "list cores",
                status: 503_u16,
                message: "service unavailable",
            }
            .fail();
        }
        Ok(self
            .state()
            .cores
            .iter()
            .map(|(name, documents)| ResourceStatus {
                name: name.clone(),
                document_count: Some(*documents),
                ..ResourceStatus::default()
            })
            .collect())
    }

    async fn flush(&self, name: &str) -> Result<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return RejectedSnafu {
                operation: format!("commit core {name}"),
                status: 503_u16,
                message: "service unavailable",
            }
            .fail();
        }
        self.state().calls.push(format!("flush {name}"));
        Ok(())
    }

    async fn document_count(&self, name: &str) -> Result<u64> {
        match self.state().cores.get(name) {
            Some(documents) => Ok(*documents),
            None => RejectedSnafu {
                operation: format!("count documents of {name}"),
                status: 404_u16,
                message: "no such core",
            }
            .fail(),
        }
    }

    async fn request_snapshot(&self, name: &str, snapshot: &str, _location: &str) -> Result<()> {
        let dir = self.snapshot_dir.join(format!("snapshot.{snapshot}"));
        fs::create_dir_all(&dir).expect("create snapshot directory");
        fs::write(dir.join("segments_1"), name).expect("write snapshot file");

        let mut state = self.state();
        state
            .snapshots
            .insert(snapshot.to_owned(), SnapshotStatus::Completed);
        state.calls.push(format!("snapshot {name}"));
        Ok(())
    }

    async fn snapshot_status(&self, _name: &str, snapshot: &str) -> Result<SnapshotStatus> {
        Ok(self
            .state()
            .snapshots
            .get(snapshot)
            .cloned()
            .unwrap_or(SnapshotStatus::InProgress))
    }
}

#[async_trait]
impl QueryExecutor for FakeSolr {
    async fn query(&self, resource: &str, credentials: &QueryCredentials) -> QueryOutcome {
        {
            let state = self.state();
            if !state.cores.contains_key(resource) || state.unreachable.contains(resource) {
                return QueryOutcome::Error {
                    message: format!("core {resource} is not available"),
                };
            }
        }
        self.authorize(resource, credentials)
    }
}

pub struct FakeService {
    pub ready: AtomicBool,
    pub restarts: AtomicU32,
}

impl FakeService {
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceControl for FakeService {
    async fn stop(&self, _grace_period: Duration) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Answers every confirmation the same way and records the phrases asked for.
pub struct ScriptedPrompt {
    pub answer: AtomicBool,
    pub asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().expect("prompt is not poisoned").clone()
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&self, _message: &str, phrase: &str) -> io::Result<bool> {
        self.asked
            .lock()
            .expect("prompt is not poisoned")
            .push(phrase.to_owned());
        Ok(self.answer.load(Ordering::SeqCst))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub solr: Arc<FakeSolr>,
    pub service: Arc<FakeService>,
    pub prompt: Arc<ScriptedPrompt>,
    pub secrets: SecretStore,
    pub controller: Controller,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temporary directory");
        let root = dir.path();

        let document_path = root.join("security.json");
        fs::write(&document_path, INITIAL_DOCUMENT).expect("write security document");

        let security = SecurityManager::new(SecurityConfig {
            document_path: document_path.clone(),
            backup_dir: root.join("backups/security"),
            lock_dir: root.join("locks"),
            transaction_log_dir: root.join("transactions"),
            permissions: FilePermissions::new(0o640),
            lock_timeout: Duration::from_secs(2),
            lock_retry_delay: Duration::from_millis(10),
            transaction_lock_timeout: Duration::from_secs(10),
        });

        let solr = Arc::new(FakeSolr::new(&document_path, &root.join("solr-backups")));
        let service = Arc::new(FakeService {
            ready: AtomicBool::new(true),
            restarts: AtomicU32::new(0),
        });
        let prompt = Arc::new(ScriptedPrompt {
            answer: AtomicBool::new(true),
            asked: Mutex::default(),
        });
        let secrets = SecretStore::new(root.join("secrets"));

        let controller = Controller::new(
            security,
            secrets.clone(),
            Collaborators {
                resources: solr.clone(),
                service: service.clone(),
                queries: solr.clone(),
                hasher: Arc::new(SolrBasicAuthHasher),
                prompt: prompt.clone(),
            },
            ControllerSettings {
                config_set: "moodle".to_owned(),
                solr_public_url: "https://search.example.com".to_owned(),
                stop_grace_period: Duration::from_secs(30),
                readiness_timeout: Duration::from_millis(200),
                readiness_poll_interval: Duration::from_millis(10),
                flush_settle_delay: Duration::from_millis(1),
                snapshot_timeout: Duration::from_secs(2),
                snapshot_poll_interval: Duration::from_millis(10),
                tenant_backup_dir: root.join("backups/tenants"),
                solr_backup_location: "/var/solr/backups".to_owned(),
                solr_backup_host_dir: Some(root.join("solr-backups")),
                backup_lock_timeout: Duration::from_secs(2),
                lock_retry_delay: Duration::from_millis(10),
            },
        );

        Self {
            dir,
            solr,
            service,
            prompt,
            secrets,
            controller,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn document_path(&self) -> PathBuf {
        self.root().join("security.json")
    }

    pub fn document_bytes(&self) -> Vec<u8> {
        fs::read(self.document_path()).expect("read security document")
    }

    pub fn document(&self) -> SecurityDocument {
        SecurityDocument::load(&self.document_path()).expect("security document is valid")
    }

    pub fn transaction_logs(&self, state: &str) -> Vec<PathBuf> {
        let dir = self.root().join("transactions").join(state);
        if !dir.exists() {
            return Vec::new();
        }
        fs::read_dir(dir)
            .expect("list transaction logs")
            .map(|entry| entry.expect("read log entry").path())
            .collect()
    }

    pub fn decline_confirmations(&self) {
        self.prompt.answer.store(false, Ordering::SeqCst);
    }
}
