//! Scheduled ingestion of one advisory source.
//!
//! A run walks `Locked → Fetching → Resolving → Persisting → Done`. If the
//! source's lock is already held it stops at `LockFailed` and asks to be
//! rescheduled; if the source cannot be read completely it stops at `Failed`
//! without touching persisted state.

use crate::advisory::SecurityAdvisory;
use crate::config::Config;
use crate::error::{AdvisoryError, Result};
use crate::id_generator::AdvisoryIdGenerator;
use crate::lock::{MemoryLock, RedisLock, RunLock};
use crate::models::RemoteSecurityAdvisoryCollection;
use crate::resolver::SecurityAdvisoryResolver;
use crate::sources::friendsofphp::{self, FriendsOfPhpSecurityAdvisoriesSource};
use crate::sources::github::{self, GitHubSecurityAdvisoriesSource};
use crate::sources::AdvisorySource;
use crate::store::{AdvisoryStore, ChangeSet, DragonflyStore, MemoryStore};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

pub const LOCK_NAME_PREFIX: &str = "security-advisory-worker:";
/// Attempts at committing a change set whose fresh ids keep colliding.
pub const MAX_COMMIT_ATTEMPTS: usize = 5;
/// Attempts at load, resolve and commit while other writers keep changing
/// the loaded records.
pub const MAX_RESOLVE_ATTEMPTS: usize = 3;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(1800);
const DEFAULT_RESCHEDULE_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Locked,
    Fetching,
    Resolving,
    Persisting,
    Done,
    LockFailed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Locked => "locked",
            Self::Fetching => "fetching",
            Self::Resolving => "resolving",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::LockFailed => "lock_failed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Counts for one completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub source_name: String,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Another run holds the lock; try again after `after`.
    Reschedule { after: Duration },
    /// The source could not be read. Nothing was written.
    Failed { source_name: String, message: String },
}

/// Aggregate of a [`IngestionWorker::run_all`] pass.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub outcomes: BTreeMap<String, RunOutcome>,
}

impl SyncStats {
    fn record(&mut self, source_name: String, outcome: RunOutcome) {
        match &outcome {
            RunOutcome::Completed(report) => {
                self.completed += 1;
                self.created += report.created;
                self.updated += report.updated;
                self.removed += report.removed;
            }
            RunOutcome::Reschedule { .. } => self.rescheduled += 1,
            RunOutcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.insert(source_name, outcome);
    }
}

/// Holds a run lock and releases it on drop, so a panicking or cancelled run
/// does not keep the source locked until the TTL runs out.
struct LockGuard {
    lock: Arc<dyn RunLock>,
    name: String,
    armed: bool,
}

impl LockGuard {
    fn new(lock: Arc<dyn RunLock>, name: String) -> Self {
        Self { lock, name, armed: true }
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.lock.release(&self.name).await {
            warn!(lock = %self.name, "Failed to release run lock: {}", e);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lock = self.lock.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(lock = %name, "Run ended abnormally, releasing run lock");
                handle.spawn(async move {
                    if let Err(e) = lock.release(&name).await {
                        warn!(lock = %name, "Failed to release run lock: {}", e);
                    }
                });
            }
            Err(_) => warn!(lock = %name, "No runtime to release run lock, it expires with its TTL"),
        }
    }
}

#[derive(Clone)]
pub struct IngestionWorker {
    store: Arc<dyn AdvisoryStore>,
    lock: Arc<dyn RunLock>,
    sources: Vec<Arc<dyn AdvisorySource>>,
    resolver: SecurityAdvisoryResolver,
    lock_ttl: Duration,
    reschedule_delay: Duration,
}

impl IngestionWorker {
    pub fn new(store: Arc<dyn AdvisoryStore>, lock: Arc<dyn RunLock>) -> Self {
        Self {
            store,
            lock,
            sources: Vec::new(),
            resolver: SecurityAdvisoryResolver::default(),
            lock_ttl: DEFAULT_LOCK_TTL,
            reschedule_delay: DEFAULT_RESCHEDULE_DELAY,
        }
    }

    /// Wire store, lock and the enabled sources from `config`.
    ///
    /// A `redis_url` selects [`DragonflyStore`] and [`RedisLock`]; otherwise
    /// both are in-process.
    pub fn from_config(config: &Config) -> Result<Self> {
        let (store, lock): (Arc<dyn AdvisoryStore>, Arc<dyn RunLock>) = match &config.redis_url {
            Some(url) => (Arc::new(DragonflyStore::new(url)?), Arc::new(RedisLock::new(url)?)),
            None => (Arc::new(MemoryStore::new()), Arc::new(MemoryLock::new())),
        };

        let mut worker = Self::new(store, lock)
            .with_resolver(
                SecurityAdvisoryResolver::new(AdvisoryIdGenerator::new())
                    .with_threshold(config.fuzzy_threshold),
            )
            .with_lock_ttl(config.lock_ttl)
            .with_reschedule_delay(config.reschedule_delay);

        for name in &config.sources {
            let source: Arc<dyn AdvisorySource> = match name.as_str() {
                github::SOURCE_NAME => Arc::new(
                    GitHubSecurityAdvisoriesSource::new(config.github_tokens.clone())
                        .with_api_url(&config.github_api_url),
                ),
                friendsofphp::SOURCE_NAME => {
                    Arc::new(FriendsOfPhpSecurityAdvisoriesSource::new(&config.packagist_url))
                }
                other => {
                    return Err(AdvisoryError::config(format!("unknown source '{}'", other)));
                }
            };
            worker = worker.with_source(source);
        }

        Ok(worker)
    }

    pub fn with_source(mut self, source: Arc<dyn AdvisorySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_resolver(mut self, resolver: SecurityAdvisoryResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_reschedule_delay(mut self, delay: Duration) -> Self {
        self.reschedule_delay = delay;
        self
    }

    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.name())
    }

    pub fn lock_name(source_name: &str) -> String {
        format!("{LOCK_NAME_PREFIX}{source_name}")
    }

    /// Run one ingestion pass for `source_name`.
    ///
    /// Lock contention and fetch failures are outcomes, not errors. `Err` is
    /// reserved for persistence failures and unknown source names.
    #[instrument(skip(self), fields(source = source_name))]
    pub async fn run(&self, source_name: &str) -> Result<RunOutcome> {
        let source = self
            .sources
            .iter()
            .find(|s| s.name() == source_name)
            .cloned()
            .ok_or_else(|| AdvisoryError::config(format!("source '{}' is not configured", source_name)))?;

        let lock_name = Self::lock_name(source_name);
        if !self.lock.try_acquire(&lock_name, self.lock_ttl).await? {
            info!(
                state = %RunState::LockFailed,
                retry_in_secs = self.reschedule_delay.as_secs(),
                "Another run holds the lock, rescheduling"
            );
            return Ok(RunOutcome::Reschedule {
                after: self.reschedule_delay,
            });
        }
        let guard = LockGuard::new(self.lock.clone(), lock_name);
        info!(state = %RunState::Locked, "Acquired run lock");

        let result = self.run_locked(source.as_ref()).await;
        guard.release().await;
        result
    }

    async fn run_locked(&self, source: &dyn AdvisorySource) -> Result<RunOutcome> {
        let source_name = source.name();

        info!(state = %RunState::Fetching, "Fetching advisories");
        let remote = match source.fetch().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(state = %RunState::Failed, "Fetch failed, leaving stored advisories untouched: {}", e);
                return Ok(RunOutcome::Failed {
                    source_name: source_name.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let mut attempt = 1;
        let changes = loop {
            match self.reconcile(source_name, &remote).await {
                Ok(changes) => break changes,
                Err(AdvisoryError::ConcurrentModification(id)) if attempt < MAX_RESOLVE_ATTEMPTS => {
                    warn!(attempt, advisory = %id, "Stored advisory changed during the run, resolving again");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let report = RunReport {
            source_name: source_name.to_string(),
            fetched: remote.len(),
            created: changes.inserted.len(),
            updated: changes.updated.len(),
            removed: changes.removed.len(),
        };
        info!(state = %RunState::Done, "Run complete");
        Ok(RunOutcome::Completed(report))
    }

    /// Load the candidates for `remote`, resolve and commit. Returns what was
    /// written.
    async fn reconcile(
        &self,
        source_name: &str,
        remote: &RemoteSecurityAdvisoryCollection,
    ) -> Result<ChangeSet> {
        info!(state = %RunState::Resolving, fetched = remote.len(), "Resolving advisories");
        let mut existing = self.store.find_by_source(source_name).await?;
        let mut seen: HashSet<String> = existing
            .iter()
            .map(|a| a.packagist_advisory_id().to_string())
            .collect();

        // Other sources' records for the same packages are fuzzy-match candidates
        let package_names: Vec<String> = remote.package_names().map(str::to_string).collect();
        for advisory in self.store.find_by_package_names(&package_names).await? {
            if seen.insert(advisory.packagist_advisory_id().to_string()) {
                existing.push(advisory);
            }
        }

        let before: HashMap<String, SecurityAdvisory> = existing
            .iter()
            .map(|a| (a.packagist_advisory_id().to_string(), a.clone()))
            .collect();

        let resolution = self.resolver.resolve(&mut existing, remote, source_name);

        let updated: Vec<SecurityAdvisory> = existing
            .into_iter()
            .filter(|a| before.get(a.packagist_advisory_id()) != Some(a))
            .collect();

        let mut changes = ChangeSet {
            inserted: resolution.new_advisories,
            updated,
            removed: resolution.removed_advisories,
        };

        info!(
            state = %RunState::Persisting,
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            "Persisting changes"
        );
        if !changes.is_empty() {
            self.commit_with_retry(&mut changes).await?;
        }
        Ok(changes)
    }

    /// Commit `changes`, minting a fresh id for an inserted record whose id
    /// is already taken.
    async fn commit_with_retry(&self, changes: &mut ChangeSet) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.commit(changes).await {
                Ok(()) => return Ok(()),
                Err(AdvisoryError::DuplicateAdvisoryId(id)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    let fresh = self.resolver.id_generator().generate();
                    warn!(attempt, colliding = %id, fresh = %fresh, "Advisory id collision, retrying commit");
                    if let Some(advisory) = changes
                        .inserted
                        .iter_mut()
                        .find(|a| a.packagist_advisory_id() == id)
                    {
                        advisory.reassign_id(fresh);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run every configured source concurrently, one task per source.
    pub async fn run_all(&self) -> SyncStats {
        info!(sources = self.sources.len(), "Starting ingestion for all sources");

        let mut handles = Vec::new();
        for source in &self.sources {
            let worker = self.clone();
            let name = source.name().to_string();
            let handle = tokio::spawn(async move {
                let outcome = worker.run(&name).await;
                (name, outcome)
            });
            handles.push((source.name().to_string(), handle));
        }

        let mut stats = SyncStats::default();
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok((_, Ok(outcome))) => outcome,
                Ok((_, Err(e))) => {
                    error!(source = %name, "Ingestion run failed: {}", e);
                    RunOutcome::Failed {
                        source_name: name.clone(),
                        message: e.to_string(),
                    }
                }
                Err(e) => {
                    error!(source = %name, "Task join error: {}", e);
                    RunOutcome::Failed {
                        source_name: name.clone(),
                        message: e.to_string(),
                    }
                }
            };
            stats.record(name, outcome);
        }

        info!(
            completed = stats.completed,
            rescheduled = stats.rescheduled,
            failed = stats.failed,
            "Ingestion finished"
        );
        stats
    }
}
