//! Persistence of [`SecurityAdvisory`] records.
//!
//! The worker only needs lookups by source and by package plus one atomic
//! commit per run. Two backends are provided: an in-process [`MemoryStore`]
//! and [`DragonflyStore`] for Redis/DragonflyDB.

use crate::advisory::SecurityAdvisory;
use crate::error::{AdvisoryError, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Everything one ingestion run writes, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub inserted: Vec<SecurityAdvisory>,
    pub updated: Vec<SecurityAdvisory>,
    pub removed: Vec<SecurityAdvisory>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[async_trait]
pub trait AdvisoryStore: Send + Sync {
    /// All records currently attributed to `source`.
    async fn find_by_source(&self, source: &str) -> Result<Vec<SecurityAdvisory>>;

    /// All records for any of `package_names`.
    async fn find_by_package_names(&self, package_names: &[String]) -> Result<Vec<SecurityAdvisory>>;

    async fn get(&self, id: &str) -> Result<Option<SecurityAdvisory>>;

    /// Apply a change set atomically.
    ///
    /// Fails with [`AdvisoryError::DuplicateAdvisoryId`] and writes nothing if
    /// an inserted record's id is already taken. Fails with
    /// [`AdvisoryError::ConcurrentModification`] and writes nothing if an
    /// updated or removed record is no longer at the revision it was loaded
    /// at. Every written record is stored one revision ahead.
    async fn commit(&self, changes: &ChangeSet) -> Result<()>;
}

/// In-process store, mainly for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    advisories: RwLock<BTreeMap<String, SecurityAdvisory>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.advisories.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.advisories.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<SecurityAdvisory> {
        self.advisories.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl AdvisoryStore for MemoryStore {
    async fn find_by_source(&self, source: &str) -> Result<Vec<SecurityAdvisory>> {
        let advisories = self.advisories.read().await;
        Ok(advisories
            .values()
            .filter(|a| a.source(source).is_some())
            .cloned()
            .collect())
    }

    async fn find_by_package_names(&self, package_names: &[String]) -> Result<Vec<SecurityAdvisory>> {
        let wanted: HashSet<&str> = package_names.iter().map(String::as_str).collect();
        let advisories = self.advisories.read().await;
        Ok(advisories
            .values()
            .filter(|a| wanted.contains(a.package_name()))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<SecurityAdvisory>> {
        Ok(self.advisories.read().await.get(id).cloned())
    }

    #[instrument(skip(self, changes), fields(
        inserted = changes.inserted.len(),
        updated = changes.updated.len(),
        removed = changes.removed.len()
    ))]
    async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        let mut advisories = self.advisories.write().await;

        for advisory in &changes.inserted {
            if advisories.contains_key(advisory.packagist_advisory_id()) {
                return Err(AdvisoryError::DuplicateAdvisoryId(
                    advisory.packagist_advisory_id().to_string(),
                ));
            }
        }
        check_revisions(changes, |id| advisories.get(id).map(SecurityAdvisory::revision))?;

        for advisory in changes.inserted.iter().chain(&changes.updated) {
            advisories.insert(advisory.packagist_advisory_id().to_string(), advisory.next_revision());
        }
        for advisory in &changes.removed {
            advisories.remove(advisory.packagist_advisory_id());
        }

        debug!("Committed change set");
        Ok(())
    }
}

/// Updated and removed records must still be stored at the revision the
/// caller loaded them at.
fn check_revisions<F>(changes: &ChangeSet, stored_revision: F) -> Result<()>
where
    F: Fn(&str) -> Option<u64>,
{
    for advisory in changes.updated.iter().chain(&changes.removed) {
        let id = advisory.packagist_advisory_id();
        if stored_revision(id) != Some(advisory.revision()) {
            return Err(AdvisoryError::ConcurrentModification(id.to_string()));
        }
    }
    Ok(())
}

const DATA_PREFIX: &str = "advisory:data:";
const SOURCE_INDEX_PREFIX: &str = "advisory:idx:source:";
const PACKAGE_INDEX_PREFIX: &str = "advisory:idx:package:";

fn data_key(id: &str) -> String {
    format!("{DATA_PREFIX}{id}")
}

fn source_index_key(source: &str) -> String {
    format!("{SOURCE_INDEX_PREFIX}{source}")
}

fn package_index_key(package: &str) -> String {
    format!("{PACKAGE_INDEX_PREFIX}{package}")
}

/// Redis/DragonflyDB backed store.
///
/// Records are zstd-compressed JSON. Set indices per source and per package
/// back the two lookups.
pub struct DragonflyStore {
    client: redis::Client,
}

impl DragonflyStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), 3)?;
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = zstd::stream::read::Decoder::new(data)?;
        let mut decoded = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut decoded)?;
        Ok(decoded)
    }

    fn encode(advisory: &SecurityAdvisory) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(advisory)?;
        Self::compress(&json)
    }

    fn decode(bytes: &[u8]) -> Result<SecurityAdvisory> {
        let decompressed = Self::decompress(bytes)?;
        Ok(serde_json::from_slice(&decompressed)?)
    }

    async fn load_many(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: Vec<String>,
    ) -> Result<Vec<SecurityAdvisory>> {
        let mut advisories = Vec::with_capacity(ids.len());
        for id in ids {
            let data: Option<Vec<u8>> = conn.get(data_key(&id)).await?;
            if let Some(bytes) = data {
                advisories.push(Self::decode(&bytes)?);
            }
        }
        Ok(advisories)
    }
}

#[async_trait]
impl AdvisoryStore for DragonflyStore {
    async fn find_by_source(&self, source: &str) -> Result<Vec<SecurityAdvisory>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut ids: Vec<String> = conn.smembers(source_index_key(source)).await?;
        ids.sort();
        self.load_many(&mut conn, ids).await
    }

    async fn find_by_package_names(&self, package_names: &[String]) -> Result<Vec<SecurityAdvisory>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut ids = Vec::new();
        for package in package_names {
            let members: Vec<String> = conn.smembers(package_index_key(package)).await?;
            ids.extend(members);
        }
        ids.sort();
        ids.dedup();
        self.load_many(&mut conn, ids).await
    }

    async fn get(&self, id: &str) -> Result<Option<SecurityAdvisory>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let data: Option<Vec<u8>> = conn.get(data_key(id)).await?;
        data.map(|bytes| Self::decode(&bytes)).transpose()
    }

    #[instrument(skip(self, changes), fields(
        inserted = changes.inserted.len(),
        updated = changes.updated.len(),
        removed = changes.removed.len()
    ))]
    async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        // a dedicated connection so WATCH only covers this transaction
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let touched: Vec<String> = changes
            .inserted
            .iter()
            .chain(&changes.updated)
            .chain(&changes.removed)
            .map(|a| data_key(a.packagist_advisory_id()))
            .collect();
        redis::cmd("WATCH")
            .arg(&touched)
            .query_async::<()>(&mut conn)
            .await?;

        for advisory in &changes.inserted {
            let exists: bool = conn.exists(data_key(advisory.packagist_advisory_id())).await?;
            if exists {
                redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                return Err(AdvisoryError::DuplicateAdvisoryId(
                    advisory.packagist_advisory_id().to_string(),
                ));
            }
        }

        // previous versions tell us which index entries to drop
        let mut previous: HashMap<String, SecurityAdvisory> = HashMap::new();
        for advisory in changes.updated.iter().chain(&changes.removed) {
            let id = advisory.packagist_advisory_id();
            let data: Option<Vec<u8>> = conn.get(data_key(id)).await?;
            if let Some(bytes) = data {
                previous.insert(id.to_string(), Self::decode(&bytes)?);
            }
        }
        if let Err(e) = check_revisions(changes, |id| previous.get(id).map(SecurityAdvisory::revision)) {
            redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
            return Err(e);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();

        for old in previous.values() {
            let id = old.packagist_advisory_id();
            for source in old.sources().keys() {
                pipe.srem(source_index_key(source), id).ignore();
            }
            pipe.srem(package_index_key(old.package_name()), id).ignore();
        }

        for advisory in changes.inserted.iter().chain(&changes.updated) {
            let id = advisory.packagist_advisory_id();
            pipe.set(data_key(id), Self::encode(&advisory.next_revision())?).ignore();
            for source in advisory.sources().keys() {
                pipe.sadd(source_index_key(source), id).ignore();
            }
            pipe.sadd(package_index_key(advisory.package_name()), id).ignore();
        }

        for advisory in &changes.removed {
            pipe.del(data_key(advisory.packagist_advisory_id())).ignore();
        }

        let reply: Option<redis::Value> = pipe.query_async(&mut conn).await?;
        if reply.is_none() {
            // WATCH fired: another writer touched one of these keys after our reads
            let first = touched.first().map(|key| key.trim_start_matches(DATA_PREFIX));
            return Err(AdvisoryError::ConcurrentModification(
                first.unwrap_or_default().to_string(),
            ));
        }

        info!(
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            "Committed advisories"
        );
        Ok(())
    }
}
