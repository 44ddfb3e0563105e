//! Cross-process mutual exclusion based on a marker directory.
//!
//! A lock is held while a directory exists at the lock path. The directory
//! always contains an `owner.json` record: it is assembled under a private
//! staging name and then renamed into place, and `rename(2)` refuses to replace
//! a non-empty directory. Whoever wins that rename owns the lock.
//!
//! Markers are never deleted in place. Release and stale-lock reclaim both
//! rename the marker aside first, confirm that the moved marker is the one they
//! meant to remove, and only then delete it.
//!
//! Reclaimers hold an advisory `flock(2)` on the `<lock>.reclaim` sentinel
//! while they work, and re-read the owner record in place before moving
//! anything. The kernel drops the sentinel lock when its holder exits, so a
//! crashed reclaimer never blocks the next one. The sentinel file itself is
//! never deleted.

use std::{
    fmt::Display,
    fs, io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use jiff::Timestamp;
use moodle_solr_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::time::Instant;

use crate::files::{parent_dir, sync_directory};

type Result<T, E = Error> = std::result::Result<T, E>;

const OWNER_FILE: &str = "owner.json";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create lock directory {path:?}"))]
    CreateLockDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("failed to stage lock marker {path:?}"))]
    StageMarker { source: io::Error, path: PathBuf },

    #[snafu(display("failed to serialize lock owner record"))]
    SerializeOwner { source: serde_json::Error },

    #[snafu(display("failed to publish lock marker {path:?}"))]
    PublishMarker { source: io::Error, path: PathBuf },

    #[snafu(display("failed to move lock marker {path:?} aside"))]
    MoveMarker { source: io::Error, path: PathBuf },

    #[snafu(display("failed to remove retired lock marker {path:?}"))]
    RemoveMarker { source: io::Error, path: PathBuf },

    #[snafu(display(
        "lock marker {path:?} changed hands while being retired and could not be moved back from {aside:?}"
    ))]
    RestoreMarker {
        source: io::Error,
        path: PathBuf,
        aside: PathBuf,
    },

    #[snafu(display("failed to lock the reclaim sentinel {path:?}"))]
    ReclaimSentinel { source: io::Error, path: PathBuf },

    #[snafu(display("timed out after {timeout} waiting for lock {path:?} held by {holder}"))]
    LockTimeout {
        path: PathBuf,
        timeout: Duration,
        holder: String,
    },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// The record stored inside a lock marker.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LockOwner {
    pub pid: u32,
    pub hostname: String,
    pub user: String,
    pub acquired_at: Timestamp,

    /// Distinguishes holders that share a pid.
    pub token: String,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: current_hostname(),
            user: current_user(),
            acquired_at: Timestamp::now(),
            token: format!("{:032x}", rand::random::<u128>()),
        }
    }

    fn is_same_holder(&self, other: &Self) -> bool {
        self.pid == other.pid && self.token == other.token
    }

    /// A lock is stale when it was taken on this host by a process that no
    /// longer exists. Liveness of processes on other hosts cannot be checked,
    /// so their locks are never considered stale.
    pub fn is_stale(&self) -> bool {
        self.hostname == current_hostname() && !process_is_alive(self.pid)
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} on {} (user {}) since {}",
            self.pid, self.hostname, self.user, self.acquired_at
        )
    }
}

/// How long to sleep between acquisition attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),

    /// Doubles after every attempt, up to `cap`.
    Exponential { initial: Duration, cap: Duration },
}

impl Backoff {
    pub const DEFAULT_CAP: Duration = Duration::from_secs(10);

    pub fn exponential(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            cap: Self::DEFAULT_CAP,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, cap } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                let delay = initial.checked_mul(factor).unwrap_or(*cap);
                Duration::from(delay.min(*cap))
            }
        }
    }
}

/// What a lock path currently holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held { owner: LockOwner, stale: bool },

    /// A marker exists but its owner record cannot be read. Treated as held.
    Unreadable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,

    /// The marker belongs to someone else and was left alone.
    NotOwner,
    AlreadyGone,
}

#[derive(Clone, Debug)]
pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits until the lock is acquired or `timeout` has elapsed.
    ///
    /// Stale markers are reclaimed immediately without counting as a wait.
    pub async fn acquire(&self, timeout: Duration, backoff: Backoff) -> Result<LockGuard> {
        let deadline = Instant::now() + *timeout;
        let mut attempt = 0u32;

        loop {
            let holder = match self.try_acquire()? {
                Ok(guard) => return Ok(guard),
                Err(state) => state,
            };

            if let LockState::Held { owner, stale: true } = &holder {
                if self.reclaim_stale(owner)? {
                    continue;
                }
            }

            let holder_description = match &holder {
                LockState::Held { owner, .. } => owner.to_string(),
                LockState::Unreadable => "an unknown owner".to_owned(),
                // Released between the attempt and the inspection
                LockState::Free => continue,
            };

            let now = Instant::now();
            if now >= deadline {
                return LockTimeoutSnafu {
                    path: &self.path,
                    timeout,
                    holder: holder_description,
                }
                .fail();
            }

            if attempt == 0 {
                tracing::info!(
                    lock = %self.path.display(),
                    holder = %holder_description,
                    %timeout,
                    "waiting for lock"
                );
            }

            let delay = (*backoff.delay(attempt)).min(deadline - now);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Makes a single attempt, returning the current state if the lock is taken.
    pub fn try_acquire(&self) -> Result<std::result::Result<LockGuard, LockState>> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(dir).context(CreateLockDirectorySnafu { path: dir })?;

        let owner = LockOwner::current();
        let staging = self.sibling("staging", &owner);

        fs::create_dir(&staging).context(StageMarkerSnafu { path: &staging })?;
        let record = serde_json::to_vec_pretty(&owner).context(SerializeOwnerSnafu)?;
        let written = write_owner_record(&staging, &record);
        if let Err(source) = written {
            discard_dir(&staging);
            return Err(source).context(StageMarkerSnafu { path: &staging });
        }

        match fs::rename(&staging, &self.path) {
            Ok(()) => {
                sync_directory(dir).context(PublishMarkerSnafu { path: &self.path })?;
                tracing::debug!(lock = %self.path.display(), %owner, "acquired lock");
                Ok(Ok(LockGuard {
                    manager: self.clone(),
                    owner,
                    released: false,
                }))
            }
            Err(error) if is_occupied(&error) => {
                discard_dir(&staging);
                Ok(Err(self.inspect()))
            }
            Err(source) => {
                discard_dir(&staging);
                Err(source).context(PublishMarkerSnafu { path: &self.path })
            }
        }
    }

    /// Reads the current state of the lock without modifying it.
    pub fn inspect(&self) -> LockState {
        match read_owner_record(&self.path) {
            Ok(owner) => {
                let stale = owner.is_stale();
                LockState::Held { owner, stale }
            }
            Err(OwnerRecord::Missing) => LockState::Free,
            Err(OwnerRecord::Unreadable) => LockState::Unreadable,
        }
    }

    /// Removes the marker if, and only if, it belongs to `owner`.
    ///
    /// Calling this again after a successful release, or after someone else
    /// removed the marker, returns [`ReleaseOutcome::AlreadyGone`].
    pub fn release(&self, owner: &LockOwner) -> Result<ReleaseOutcome> {
        match self.inspect() {
            LockState::Free => Ok(ReleaseOutcome::AlreadyGone),
            LockState::Held { owner: current, .. } if current.is_same_holder(owner) => {
                if self.retire(owner)? {
                    tracing::debug!(lock = %self.path.display(), %owner, "released lock");
                    Ok(ReleaseOutcome::Released)
                } else {
                    Ok(ReleaseOutcome::AlreadyGone)
                }
            }
            LockState::Held { owner: current, .. } => {
                tracing::warn!(
                    lock = %self.path.display(),
                    holder = %current,
                    "not releasing lock owned by someone else"
                );
                Ok(ReleaseOutcome::NotOwner)
            }
            LockState::Unreadable => {
                tracing::warn!(
                    lock = %self.path.display(),
                    "not releasing lock with unreadable owner record"
                );
                Ok(ReleaseOutcome::NotOwner)
            }
        }
    }

    /// Removes the marker of `observed` if it is still in place.
    ///
    /// Returns whether the lock should be attempted again right away, which is
    /// the case when the marker was removed or has changed since it was
    /// observed. While another process is reclaiming, nothing is touched.
    fn reclaim_stale(&self, observed: &LockOwner) -> Result<bool> {
        let sentinel = self.reclaim_sentinel();
        let Some(_reclaiming) = ReclaimGuard::try_lock(&sentinel)? else {
            tracing::debug!(lock = %self.path.display(), "another process is reclaiming the lock");
            return Ok(false);
        };

        match read_owner_record(&self.path) {
            Ok(current) if current.is_same_holder(observed) => {}
            Err(OwnerRecord::Unreadable) => return Ok(false),
            _ => return Ok(true),
        }

        tracing::warn!(
            lock = %self.path.display(),
            holder = %observed,
            "reclaiming stale lock"
        );
        self.retire(observed)?;
        Ok(true)
    }

    /// Moves the marker aside and deletes it if it still belongs to `expected`.
    fn retire(&self, expected: &LockOwner) -> Result<bool> {
        let aside = self.sibling("retired", &LockOwner::current());

        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(source).context(MoveMarkerSnafu { path: &self.path }),
        }

        match read_owner_record(&aside) {
            Ok(moved) if moved.is_same_holder(expected) => {
                fs::remove_dir_all(&aside).context(RemoveMarkerSnafu { path: &aside })?;
                Ok(true)
            }
            _ => {
                fs::rename(&aside, &self.path).context(RestoreMarkerSnafu {
                    path: &self.path,
                    aside: &aside,
                })?;
                Ok(false)
            }
        }
    }

    fn reclaim_sentinel(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".reclaim");
        PathBuf::from(name)
    }

    fn sibling(&self, purpose: &str, owner: &LockOwner) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        parent_dir(&self.path).join(format!(".{name}.{purpose}.{}.{}", owner.pid, owner.token))
    }
}

/// Proof of holding a lock. Dropping the guard releases the lock on a best
/// effort basis; call [`LockGuard::release`] to observe failures.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    owner: LockOwner,
    released: bool,
}

impl LockGuard {
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        self.manager.path()
    }

    pub fn release(mut self) -> Result<ReleaseOutcome> {
        self.released = true;
        self.manager.release(&self.owner)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(error) = self.manager.release(&self.owner) {
                tracing::error!(
                    %error,
                    lock = %self.manager.path.display(),
                    "failed to release lock"
                );
            }
        }
    }
}

/// Exclusive right to reclaim a stale marker, held until dropped.
struct ReclaimGuard {
    _file: fs::File,
}

impl ReclaimGuard {
    /// Returns [`None`] while another holder has the sentinel locked.
    fn try_lock(path: &Path) -> Result<Option<Self>> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .context(ReclaimSentinelSnafu { path })?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(Some(Self { _file: file }));
        }

        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(error).context(ReclaimSentinelSnafu { path })
        }
    }
}

enum OwnerRecord {
    Missing,
    Unreadable,
}

fn read_owner_record(marker: &Path) -> std::result::Result<LockOwner, OwnerRecord> {
    let content = match fs::read(marker.join(OWNER_FILE)) {
        Ok(content) => content,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(if marker.exists() {
                OwnerRecord::Unreadable
            } else {
                OwnerRecord::Missing
            });
        }
        Err(_) => return Err(OwnerRecord::Unreadable),
    };
    serde_json::from_slice(&content).map_err(|_| OwnerRecord::Unreadable)
}

fn write_owner_record(staging: &Path, record: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let mut file = fs::File::create_new(staging.join(OWNER_FILE))?;
    file.write_all(record)?;
    file.sync_all()
}

fn discard_dir(path: &Path) {
    if let Err(error) = fs::remove_dir_all(path) {
        tracing::warn!(%error, path = %path.display(), "failed to remove staging directory");
    }
}

fn is_occupied(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(libc::ENOTEMPTY | libc::EEXIST))
}

fn process_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs only the existence and permission checks, no
    // signal is delivered.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn current_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use std::{
        process::Command,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use rstest::rstest;
    use tempfile::{TempDir, tempdir};

    use super::*;

    fn manager() -> (TempDir, LockManager) {
        let dir = tempdir().expect("create temporary directory");
        let manager = LockManager::new(dir.path().join("security.lock"));
        (dir, manager)
    }

    fn plant_marker(manager: &LockManager, owner: &LockOwner) {
        fs::create_dir(manager.path()).expect("create marker");
        fs::write(
            manager.path().join(OWNER_FILE),
            serde_json::to_vec(owner).expect("serialize owner"),
        )
        .expect("write owner record");
    }

    fn exited_pid() -> u32 {
        let mut child = Command::new("true").spawn().expect("spawn child");
        let pid = child.id();
        child.wait().expect("wait for child");
        pid
    }

    #[test]
    fn acquire_and_release() {
        let (_dir, manager) = manager();

        let guard = manager
            .try_acquire()
            .expect("attempt succeeds")
            .expect("lock is free");
        let owner = guard.owner().clone();
        assert!(matches!(manager.inspect(), LockState::Held { stale: false, .. }));

        assert!(
            manager
                .try_acquire()
                .expect("attempt succeeds")
                .is_err(),
            "second holder must be refused"
        );

        assert_eq!(guard.release().expect("release"), ReleaseOutcome::Released);
        assert_eq!(manager.inspect(), LockState::Free);
        assert_eq!(
            manager.release(&owner).expect("second release"),
            ReleaseOutcome::AlreadyGone
        );
    }

    #[test]
    fn release_leaves_foreign_lock_alone() {
        let (_dir, manager) = manager();
        let guard = manager
            .try_acquire()
            .expect("attempt succeeds")
            .expect("lock is free");

        let mut impostor = guard.owner().clone();
        impostor.token = "0".repeat(32);

        assert_eq!(
            manager.release(&impostor).expect("release"),
            ReleaseOutcome::NotOwner
        );
        assert!(manager.path().join(OWNER_FILE).exists());
        drop(guard);
        assert_eq!(manager.inspect(), LockState::Free);
    }

    #[test]
    fn no_leftover_staging_directories() {
        let (dir, manager) = manager();
        let guard = manager
            .try_acquire()
            .expect("attempt succeeds")
            .expect("lock is free");
        let _ = manager.try_acquire().expect("attempt succeeds");
        guard.release().expect("release");

        assert_eq!(fs::read_dir(dir.path()).expect("list dir").count(), 0);
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_without_waiting() {
        let (_dir, manager) = manager();
        let mut dead = LockOwner::current();
        dead.pid = exited_pid();
        plant_marker(&manager, &dead);
        assert!(matches!(manager.inspect(), LockState::Held { stale: true, .. }));

        let started = std::time::Instant::now();
        let guard = manager
            .acquire(Duration::from_secs(30), Backoff::Fixed(Duration::from_secs(5)))
            .await
            .expect("stale lock is reclaimed");

        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(guard.owner().pid, std::process::id());
    }

    #[test]
    fn reclaim_backs_off_while_another_reclaimer_holds_the_sentinel() {
        let (_dir, manager) = manager();
        let mut dead = LockOwner::current();
        dead.pid = exited_pid();
        plant_marker(&manager, &dead);

        let other = ReclaimGuard::try_lock(&manager.reclaim_sentinel())
            .expect("lock sentinel")
            .expect("sentinel is free");
        assert!(
            ReclaimGuard::try_lock(&manager.reclaim_sentinel())
                .expect("lock sentinel")
                .is_none()
        );
        assert!(!manager.reclaim_stale(&dead).expect("reclaim"));
        assert_eq!(
            manager.inspect(),
            LockState::Held {
                owner: dead.clone(),
                stale: true
            }
        );

        drop(other);
        assert!(manager.reclaim_stale(&dead).expect("reclaim"));
        assert_eq!(manager.inspect(), LockState::Free);
    }

    #[test]
    fn late_reclaimer_leaves_the_new_holder_alone() {
        let (dir, manager) = manager();
        let late = manager.clone();
        let mut dead = LockOwner::current();
        dead.pid = exited_pid();
        plant_marker(&manager, &dead);

        // Both observed the same stale owner, the first one finishes first.
        assert!(manager.reclaim_stale(&dead).expect("reclaim"));
        let guard = manager
            .try_acquire()
            .expect("attempt succeeds")
            .expect("lock is free");

        assert!(late.reclaim_stale(&dead).expect("reclaim"));
        assert_eq!(
            late.inspect(),
            LockState::Held {
                owner: guard.owner().clone(),
                stale: false
            }
        );

        assert_eq!(guard.release().expect("release"), ReleaseOutcome::Released);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("list dir")
            .map(|entry| entry.expect("dir entry").path())
            .collect();
        assert_eq!(leftovers, vec![manager.reclaim_sentinel()]);
    }

    #[test]
    fn concurrent_reclaimers_admit_a_single_holder() {
        let (_dir, manager) = manager();
        let mut dead = LockOwner::current();
        dead.pid = exited_pid();
        plant_marker(&manager, &dead);

        let start = Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let dead = dead.clone();
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    manager.reclaim_stale(&dead).expect("reclaim");
                    manager.try_acquire().expect("attempt succeeds").ok()
                })
            })
            .collect();

        let holders: Vec<LockGuard> = threads
            .into_iter()
            .filter_map(|thread| thread.join().expect("thread finished"))
            .collect();

        assert_eq!(holders.len(), 1);
        assert_eq!(
            manager.inspect(),
            LockState::Held {
                owner: holders[0].owner().clone(),
                stale: false
            }
        );
    }

    #[tokio::test]
    async fn lock_from_other_host_is_never_stale() {
        let (_dir, manager) = manager();
        let mut remote = LockOwner::current();
        remote.pid = exited_pid();
        remote.hostname = "some-other-host.invalid".to_owned();
        plant_marker(&manager, &remote);

        let error = manager
            .acquire(
                Duration::from_millis(200),
                Backoff::Fixed(Duration::from_millis(50)),
            )
            .await
            .expect_err("remote lock is respected");
        assert!(error.is_timeout());
    }

    #[tokio::test]
    async fn times_out_while_held() {
        let (_dir, manager) = manager();
        let _guard = manager
            .try_acquire()
            .expect("attempt succeeds")
            .expect("lock is free");

        let error = manager
            .acquire(
                Duration::from_millis(300),
                Backoff::exponential(Duration::from_millis(20)),
            )
            .await
            .expect_err("lock stays held");

        assert!(matches!(error, Error::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn waits_for_release() {
        let (_dir, manager) = manager();
        let guard = manager
            .try_acquire()
            .expect("attempt succeeds")
            .expect("lock is free");

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            guard.release().expect("release");
        });

        manager
            .acquire(Duration::from_secs(5), Backoff::Fixed(Duration::from_millis(20)))
            .await
            .expect("acquired after release");
        releaser.await.expect("releaser finished");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn holders_are_mutually_exclusive() {
        let (_dir, manager) = manager();
        let inside = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let inside = Arc::clone(&inside);
                let entries = Arc::clone(&entries);
                tokio::spawn(async move {
                    let guard = manager
                        .acquire(Duration::from_secs(30), Backoff::Fixed(Duration::from_millis(5)))
                        .await
                        .expect("acquire");
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    inside.store(false, Ordering::SeqCst);
                    entries.fetch_add(1, Ordering::SeqCst);
                    guard.release().expect("release");
                })
            })
            .collect();

        for task in tasks {
            task.await.expect("task finished");
        }
        assert_eq!(entries.load(Ordering::SeqCst), 8);
    }

    #[rstest]
    #[case(0, 1_000)]
    #[case(1, 2_000)]
    #[case(3, 8_000)]
    #[case(4, 10_000)]
    #[case(40, 10_000)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(attempt), Duration::from_millis(expected_ms));
    }
}
