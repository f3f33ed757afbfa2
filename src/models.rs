//! Normalized advisory values as produced by the sources.
//!
//! This module defines [`RemoteSecurityAdvisory`], the shape every source
//! converts its data to, and [`RemoteSecurityAdvisoryCollection`], the result
//! of one source fetch.

use crate::error::{AdvisoryError, Result};
use crate::parser::AdvisoryParser;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The primary public package repository, used when a source gives no hint.
pub const PACKAGIST_ORG: &str = "https://packagist.org";

/// Normalized severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a source-specific severity label onto the fixed set.
    ///
    /// Accepts the normalized names plus GitHub's `MODERATE`, in any case.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "low" => Some(Self::Low),
            "medium" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Normalize a package name for matching: trimmed and lower-case.
pub fn normalize_package_name(package_name: &str) -> String {
    package_name.trim().to_ascii_lowercase()
}

/// Midnight UTC of the current day. Last resort for the disclosure date.
pub fn today() -> DateTime<Utc> {
    Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// One advisory as seen from one source at one point in time.
///
/// Values are immutable once built; use [`RemoteSecurityAdvisory::builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSecurityAdvisory {
    remote_id: String,
    title: String,
    package_name: String,
    affected_versions: String,
    link: String,
    cve: Option<String>,
    date: DateTime<Utc>,
    composer_repository: Option<String>,
    severity: Option<Severity>,
    references: Vec<String>,
    source: String,
}

impl RemoteSecurityAdvisory {
    pub fn builder(
        source: impl Into<String>,
        remote_id: impl Into<String>,
        package_name: impl Into<String>,
    ) -> RemoteSecurityAdvisoryBuilder {
        RemoteSecurityAdvisoryBuilder {
            source: source.into(),
            remote_id: remote_id.into(),
            package_name: package_name.into(),
            title: String::new(),
            affected_versions: Vec::new(),
            link: String::new(),
            cve: None,
            date: None,
            composer_repository: Some(PACKAGIST_ORG.to_string()),
            severity: None,
            references: Vec::new(),
        }
    }

    /// Source-assigned identifier; empty when the source has none.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Title with any leading CVE token removed.
    pub fn display_title(&self) -> &str {
        AdvisoryParser::title_without_cve(&self.title)
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Affected version constraints, one `|`-separated entry per branch.
    pub fn affected_versions(&self) -> &str {
        &self.affected_versions
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn cve(&self) -> Option<&str> {
        self.cve.as_deref()
    }

    /// Best-effort disclosure date.
    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    /// Repository the package lives in; `None` means explicitly none.
    pub fn composer_repository(&self) -> Option<&str> {
        self.composer_repository.as_deref()
    }

    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// Name of the source that produced this value.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Builder for [`RemoteSecurityAdvisory`] enforcing its invariants.
#[derive(Debug, Clone)]
pub struct RemoteSecurityAdvisoryBuilder {
    source: String,
    remote_id: String,
    package_name: String,
    title: String,
    affected_versions: Vec<String>,
    link: String,
    cve: Option<String>,
    date: Option<DateTime<Utc>>,
    composer_repository: Option<String>,
    severity: Option<Severity>,
    references: Vec<String>,
}

impl RemoteSecurityAdvisoryBuilder {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Add the constraint of one branch/release line.
    pub fn affected_range(mut self, range: impl Into<String>) -> Self {
        self.affected_versions.push(range.into());
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into();
        self
    }

    /// Set the CVE; placeholder or malformed values are dropped.
    pub fn cve(mut self, cve: Option<impl Into<String>>) -> Self {
        self.cve = cve
            .map(Into::into)
            .map(|c: String| c.trim().to_string())
            .filter(|c| AdvisoryParser::is_valid_cve(c));
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Override the repository hint. `None` is the explicit "none" sentinel.
    pub fn composer_repository(mut self, repository: Option<impl Into<String>>) -> Self {
        self.composer_repository = repository.map(Into::into);
        self
    }

    pub fn severity(mut self, severity: Option<Severity>) -> Self {
        self.severity = severity;
        self
    }

    pub fn references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    pub fn build(self) -> Result<RemoteSecurityAdvisory> {
        let package_name = normalize_package_name(&self.package_name);
        if package_name.is_empty() {
            return Err(AdvisoryError::invalid(format!(
                "advisory '{}' from {} has no package name",
                self.remote_id, self.source
            )));
        }

        let ranges: Vec<String> = self
            .affected_versions
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if ranges.is_empty() {
            return Err(AdvisoryError::invalid(format!(
                "advisory '{}' for {} has no affected versions",
                self.remote_id, package_name
            )));
        }

        let date = self.date.unwrap_or_else(|| {
            self.cve
                .as_deref()
                .and_then(AdvisoryParser::cve_year)
                .and_then(|year| chrono::NaiveDate::from_ymd_opt(year, 1, 1))
                .map(|d| d.and_time(NaiveTime::MIN).and_utc())
                .unwrap_or_else(today)
        });

        Ok(RemoteSecurityAdvisory {
            remote_id: self.remote_id.trim().to_string(),
            title: self.title.trim().to_string(),
            package_name,
            affected_versions: ranges.join("|"),
            link: self.link,
            cve: self.cve,
            date,
            composer_repository: self.composer_repository,
            severity: self.severity,
            references: self.references,
            source: self.source,
        })
    }
}

/// Advisories from one source fetch, grouped by package name.
#[derive(Debug, Clone, Default)]
pub struct RemoteSecurityAdvisoryCollection {
    by_package: BTreeMap<String, Vec<RemoteSecurityAdvisory>>,
}

impl RemoteSecurityAdvisoryCollection {
    pub fn new(advisories: Vec<RemoteSecurityAdvisory>) -> Self {
        let mut by_package: BTreeMap<String, Vec<RemoteSecurityAdvisory>> = BTreeMap::new();
        for advisory in advisories {
            by_package
                .entry(advisory.package_name.clone())
                .or_default()
                .push(advisory);
        }
        Self { by_package }
    }

    /// Package names present, in sorted order.
    pub fn package_names(&self) -> impl Iterator<Item = &str> {
        self.by_package.keys().map(String::as_str)
    }

    /// Advisories for `package_name`; empty if the package is absent.
    pub fn advisories_for_package(&self, package_name: &str) -> &[RemoteSecurityAdvisory] {
        self.by_package
            .get(package_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteSecurityAdvisory> {
        self.by_package.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_package.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_package.is_empty()
    }
}
