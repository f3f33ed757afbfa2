//! The persisted advisory record.
//!
//! A [`SecurityAdvisory`] outlives ingestion runs. It carries a stable
//! internal id and the set of sources currently vouching for it.

use crate::models::{RemoteSecurityAdvisory, Severity};
use crate::parser::AdvisoryParser;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One source's claim on a persisted advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAttribution {
    /// The id this source uses for the advisory.
    pub remote_id: String,
    /// Severity as reported by this source, if it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAdvisory {
    packagist_advisory_id: String,
    package_name: String,
    title: String,
    link: String,
    cve: Option<String>,
    affected_versions: String,
    reported_at: DateTime<Utc>,
    composer_repository: Option<String>,
    severity: Option<Severity>,
    #[serde(default)]
    references: Vec<String>,
    sources: BTreeMap<String, SourceAttribution>,
    updated_at: DateTime<Utc>,
    /// Bumped by the store on every write; 0 until first committed.
    #[serde(default)]
    revision: u64,
}

impl SecurityAdvisory {
    /// Create a record for an advisory no existing record matched.
    ///
    /// Sources without their own ids are attributed with the new internal id.
    pub fn from_remote(remote: &RemoteSecurityAdvisory, packagist_advisory_id: String) -> Self {
        let remote_id = if remote.remote_id().is_empty() {
            packagist_advisory_id.clone()
        } else {
            remote.remote_id().to_string()
        };

        let mut sources = BTreeMap::new();
        sources.insert(
            remote.source().to_string(),
            SourceAttribution {
                remote_id,
                severity: remote.severity(),
            },
        );

        Self {
            packagist_advisory_id,
            package_name: remote.package_name().to_string(),
            title: remote.title().to_string(),
            link: remote.link().to_string(),
            cve: remote.cve().map(str::to_string),
            affected_versions: remote.affected_versions().to_string(),
            reported_at: remote.date(),
            composer_repository: remote.composer_repository().map(str::to_string),
            severity: remote.severity(),
            references: remote.references().to_vec(),
            sources,
            updated_at: Utc::now(),
            revision: 0,
        }
    }

    pub fn packagist_advisory_id(&self) -> &str {
        &self.packagist_advisory_id
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Title for display, without a leading CVE token.
    pub fn display_title(&self) -> &str {
        AdvisoryParser::title_without_cve(&self.title)
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn cve(&self) -> Option<&str> {
        self.cve.as_deref()
    }

    pub fn affected_versions(&self) -> &str {
        &self.affected_versions
    }

    pub fn reported_at(&self) -> DateTime<Utc> {
        self.reported_at
    }

    pub fn composer_repository(&self) -> Option<&str> {
        self.composer_repository.as_deref()
    }

    /// Highest severity reported by any attributed source.
    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    pub fn references(&self) -> &[String] {
        &self.references
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Store revision this copy was loaded at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The copy a store persists when committing this record.
    pub(crate) fn next_revision(&self) -> Self {
        Self {
            revision: self.revision + 1,
            ..self.clone()
        }
    }

    pub fn sources(&self) -> &BTreeMap<String, SourceAttribution> {
        &self.sources
    }

    pub fn source(&self, source_name: &str) -> Option<&SourceAttribution> {
        self.sources.get(source_name)
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Attach (or refresh) a source attribution.
    pub fn add_source(&mut self, source_name: &str, remote_id: &str, severity: Option<Severity>) {
        let remote_id = if remote_id.is_empty() {
            self.sources
                .get(source_name)
                .map(|a| a.remote_id.clone())
                .unwrap_or_else(|| self.packagist_advisory_id.clone())
        } else {
            remote_id.to_string()
        };

        let attribution = SourceAttribution {
            remote_id,
            severity,
        };
        if self.sources.get(source_name) != Some(&attribution) {
            self.sources.insert(source_name.to_string(), attribution);
            self.refresh_severity();
            self.touch();
        }
    }

    /// Drop a source attribution. Returns whether it was present.
    pub fn remove_source(&mut self, source_name: &str) -> bool {
        if self.sources.remove(source_name).is_some() {
            self.refresh_severity();
            self.touch();
            true
        } else {
            false
        }
    }

    /// Copy the fields of a matched remote advisory into this record.
    ///
    /// Also refreshes the attribution of the remote's source. Returns whether
    /// anything changed.
    pub fn update_from(&mut self, remote: &RemoteSecurityAdvisory) -> bool {
        let before = self.clone();

        self.add_source(remote.source(), remote.remote_id(), remote.severity());
        self.title = remote.title().to_string();
        self.link = remote.link().to_string();
        self.cve = remote.cve().map(str::to_string);
        self.affected_versions = remote.affected_versions().to_string();
        self.reported_at = remote.date();
        self.composer_repository = remote.composer_repository().map(str::to_string);
        if !remote.references().is_empty() {
            self.references = remote.references().to_vec();
        }

        let changed = {
            // updated_at is compared separately so add_source alone counts
            let mut unstamped = self.clone();
            unstamped.updated_at = before.updated_at;
            unstamped != before
        };
        if changed {
            self.touch();
        }
        changed
    }

    /// How different a remote advisory looks from this record.
    ///
    /// One point each for a distinct title, CVE and disclosure day. A shared
    /// CVE on both sides means the same advisory, whatever else differs.
    pub fn difference_score(&self, remote: &RemoteSecurityAdvisory) -> u32 {
        if let (Some(ours), Some(theirs)) = (self.cve(), remote.cve())
            && ours == theirs
            && self.package_name == remote.package_name()
        {
            return 0;
        }

        let mut score = 0;
        if self.title != remote.title() {
            score += 1;
        }
        if self.cve() != remote.cve() {
            score += 1;
        }
        if self.reported_at.date_naive() != remote.date().date_naive() {
            score += 1;
        }
        score
    }

    /// Replace the id of a record that has never been committed.
    pub(crate) fn reassign_id(&mut self, packagist_advisory_id: String) {
        for attribution in self.sources.values_mut() {
            if attribution.remote_id == self.packagist_advisory_id {
                attribution.remote_id = packagist_advisory_id.clone();
            }
        }
        self.packagist_advisory_id = packagist_advisory_id;
    }

    fn refresh_severity(&mut self) {
        self.severity = self.sources.values().filter_map(|a| a.severity).max();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
