//! Reconciliation of a fresh source fetch against persisted advisories.
//!
//! Remote advisories are matched against persisted records in two passes:
//!
//! 1. **Exact**: same package and the same remote id already recorded for the
//!    source.
//! 2. **Fuzzy**: same package and a [difference score] strictly below the
//!    threshold. This keeps the internal id stable when an upstream file is
//!    renamed, a CVE is assigned late or a title is edited.
//!
//! Unmatched remote advisories become new records. Records the source no
//! longer vouches for lose its attribution and are removed once no source is
//! left.
//!
//! [difference score]: SecurityAdvisory::difference_score

use crate::advisory::SecurityAdvisory;
use crate::id_generator::AdvisoryIdGenerator;
use crate::models::{RemoteSecurityAdvisory, RemoteSecurityAdvisoryCollection};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// A candidate must score strictly below this to be merged.
pub const DEFAULT_FUZZY_MATCH_THRESHOLD: u32 = 3;

/// Outcome of one [`SecurityAdvisoryResolver::resolve`] call.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Records to insert.
    pub new_advisories: Vec<SecurityAdvisory>,
    /// Records that lost their last source attribution.
    pub removed_advisories: Vec<SecurityAdvisory>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.new_advisories.is_empty() && self.removed_advisories.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SecurityAdvisoryResolver {
    id_generator: AdvisoryIdGenerator,
    threshold: u32,
}

impl Default for SecurityAdvisoryResolver {
    fn default() -> Self {
        Self::new(AdvisoryIdGenerator::new())
    }
}

impl SecurityAdvisoryResolver {
    pub fn new(id_generator: AdvisoryIdGenerator) -> Self {
        Self {
            id_generator,
            threshold: DEFAULT_FUZZY_MATCH_THRESHOLD,
        }
    }

    /// Override the fuzzy-match threshold.
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn id_generator(&self) -> &AdvisoryIdGenerator {
        &self.id_generator
    }

    /// Reconcile `existing` with the advisories `source_name` just returned.
    ///
    /// Matched records are updated in place. Records that lost their last
    /// attribution are moved out of `existing` into
    /// [`Resolution::removed_advisories`]; everything left in `existing`
    /// afterwards is retained.
    pub fn resolve(
        &self,
        existing: &mut Vec<SecurityAdvisory>,
        remote: &RemoteSecurityAdvisoryCollection,
        source_name: &str,
    ) -> Resolution {
        // (package, remote id) -> index into `existing`
        let mut attributed: HashMap<(String, String), usize> = HashMap::new();
        // package -> indices into `existing`, in iteration order
        let mut unmatched_existing: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (idx, advisory) in existing.iter().enumerate() {
            let key = advisory
                .source(source_name)
                .filter(|a| !a.remote_id.is_empty())
                .map(|a| (advisory.package_name().to_string(), a.remote_id.clone()));

            match key {
                Some(key) if !attributed.contains_key(&key) => {
                    attributed.insert(key, idx);
                }
                _ => unmatched_existing
                    .entry(advisory.package_name().to_string())
                    .or_default()
                    .push(idx),
            }
        }

        let mut unmatched_remote: Vec<&RemoteSecurityAdvisory> = Vec::new();
        let mut exact_matches = 0usize;

        for package_name in remote.package_names() {
            for advisory in remote.advisories_for_package(package_name) {
                let matched = if advisory.remote_id().is_empty() {
                    None
                } else {
                    attributed.remove(&(package_name.to_string(), advisory.remote_id().to_string()))
                };
                match matched {
                    Some(idx) => {
                        existing[idx].update_from(advisory);
                        exact_matches += 1;
                    }
                    None => unmatched_remote.push(advisory),
                }
            }
        }

        // the upstream id for these disappeared; they may still match fuzzily
        let mut orphaned: Vec<((String, String), usize)> = attributed.into_iter().collect();
        orphaned.sort_by_key(|(_, idx)| *idx);
        for ((package_name, _), idx) in orphaned {
            unmatched_existing.entry(package_name).or_default().push(idx);
        }

        let mut resolution = Resolution::default();
        let mut fuzzy_matches = 0usize;

        for advisory in unmatched_remote {
            let best = unmatched_existing.get(advisory.package_name()).and_then(|pool| {
                let mut best: Option<(usize, u32)> = None;
                for (pos, &idx) in pool.iter().enumerate() {
                    let score = existing[idx].difference_score(advisory);
                    if score < self.threshold && best.is_none_or(|(_, s)| score < s) {
                        best = Some((pos, score));
                    }
                }
                best
            });

            match best {
                Some((pos, score)) => {
                    let Some(pool) = unmatched_existing.get_mut(advisory.package_name()) else {
                        continue;
                    };
                    let idx = pool.remove(pos);
                    let record = &mut existing[idx];
                    debug!(
                        source = source_name,
                        advisory_id = record.packagist_advisory_id(),
                        remote_id = advisory.remote_id(),
                        score,
                        "Fuzzy matched remote advisory"
                    );
                    record.update_from(advisory);
                    fuzzy_matches += 1;
                }
                None => {
                    let record =
                        SecurityAdvisory::from_remote(advisory, self.id_generator.generate());
                    debug!(
                        source = source_name,
                        advisory_id = record.packagist_advisory_id(),
                        remote_id = advisory.remote_id(),
                        "New advisory"
                    );
                    resolution.new_advisories.push(record);
                }
            }
        }

        let mut removed: Vec<usize> = Vec::new();
        for idx in unmatched_existing.into_values().flatten() {
            let record = &mut existing[idx];
            if record.remove_source(source_name) {
                debug!(
                    source = source_name,
                    advisory_id = record.packagist_advisory_id(),
                    "Source no longer lists advisory"
                );
            }
            if !record.has_sources() {
                removed.push(idx);
            }
        }
        removed.sort_unstable();

        if !removed.is_empty() {
            let mut kept = Vec::with_capacity(existing.len() - removed.len());
            for (idx, record) in std::mem::take(existing).into_iter().enumerate() {
                if removed.binary_search(&idx).is_ok() {
                    resolution.removed_advisories.push(record);
                } else {
                    kept.push(record);
                }
            }
            *existing = kept;
        }

        info!(
            source = source_name,
            exact_matches,
            fuzzy_matches,
            new = resolution.new_advisories.len(),
            removed = resolution.removed_advisories.len(),
            "Resolved advisories"
        );

        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::{DateTime, TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn remote(
        source: &str,
        remote_id: &str,
        package: &str,
        title: &str,
        cve: Option<&str>,
        date: DateTime<Utc>,
    ) -> RemoteSecurityAdvisory {
        RemoteSecurityAdvisory::builder(source, remote_id, package)
            .title(title)
            .link("https://example.com/advisory")
            .affected_range(">=1.0,<1.5")
            .cve(cve)
            .date(date)
            .build()
            .unwrap()
    }

    fn flysystem(remote_id: &str, cve: Option<&str>) -> RemoteSecurityAdvisory {
        remote(
            "F",
            remote_id,
            "league/flysystem",
            "TOCTOU Race Condition enabling remote code execution",
            cve,
            date(2021, 6, 24),
        )
    }

    fn collection(advisories: Vec<RemoteSecurityAdvisory>) -> RemoteSecurityAdvisoryCollection {
        RemoteSecurityAdvisoryCollection::new(advisories)
    }

    #[test]
    fn test_empty_state() {
        let resolver = SecurityAdvisoryResolver::default();
        let mut existing = Vec::new();
        let resolution =
            resolver.resolve(&mut existing, &RemoteSecurityAdvisoryCollection::default(), "F");
        assert!(resolution.new_advisories.is_empty());
        assert!(resolution.removed_advisories.is_empty());
    }

    #[test]
    fn test_new_advisories_are_created() {
        let resolver = SecurityAdvisoryResolver::default();
        let mut existing = Vec::new();
        let remote = collection(vec![
            flysystem("league/flysystem/2021-06-24.yaml", None),
            remote("F", "symfony/http-kernel/CVE-2019-18887.yaml", "symfony/http-kernel", "Timing attack", Some("CVE-2019-18887"), date(2019, 11, 12)),
        ]);

        let resolution = resolver.resolve(&mut existing, &remote, "F");
        assert_eq!(resolution.new_advisories.len(), 2);
        assert!(resolution.removed_advisories.is_empty());
        for advisory in &resolution.new_advisories {
            assert!(AdvisoryIdGenerator::is_generated_id(advisory.packagist_advisory_id()));
            assert_eq!(advisory.sources().len(), 1);
        }
    }

    #[test]
    fn test_idempotence() {
        let resolver = SecurityAdvisoryResolver::default();
        let remote = collection(vec![
            flysystem("league/flysystem/2021-06-24.yaml", None),
            remote("F", "a/b/2020-01-01.yaml", "a/b", "First", None, date(2020, 1, 1)),
            remote("F", "a/b/2020-02-01.yaml", "a/b", "Second", None, date(2020, 2, 1)),
        ]);

        let mut existing = Vec::new();
        let first = resolver.resolve(&mut existing, &remote, "F");
        existing.extend(first.new_advisories);

        let snapshot = existing.clone();
        let second = resolver.resolve(&mut existing, &remote, "F");
        assert!(second.is_empty());
        assert_eq!(existing, snapshot);
    }

    #[test]
    fn test_exact_match_updates_in_place() {
        let resolver = SecurityAdvisoryResolver::default();
        let original = flysystem("league/flysystem/2021-06-24.yaml", None);
        let mut existing = vec![SecurityAdvisory::from_remote(
            &original,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        let edited = remote(
            "F",
            "league/flysystem/2021-06-24.yaml",
            "league/flysystem",
            "A completely new title",
            Some("CVE-2021-32708"),
            date(2021, 7, 1),
        );
        let resolution = resolver.resolve(&mut existing, &collection(vec![edited]), "F");

        assert!(resolution.is_empty());
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].packagist_advisory_id(), "PKSA-bcdf-ghjk-mnpq");
        assert_eq!(existing[0].title(), "A completely new title");
        assert_eq!(existing[0].cve(), Some("CVE-2021-32708"));
    }

    #[test]
    fn test_renamed_file_with_new_cve_is_fuzzy_matched() {
        let resolver = SecurityAdvisoryResolver::default();
        let original = flysystem("league/flysystem/2021-06-24.yaml", None);
        let mut existing = vec![SecurityAdvisory::from_remote(
            &original,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        let renamed = flysystem("league/flysystem/CVE-2021-32708.yaml", Some("CVE-2021-32708"));
        assert_eq!(existing[0].difference_score(&renamed), 1);

        let resolution = resolver.resolve(&mut existing, &collection(vec![renamed]), "F");

        assert!(resolution.new_advisories.is_empty());
        assert!(resolution.removed_advisories.is_empty());
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].packagist_advisory_id(), "PKSA-bcdf-ghjk-mnpq");
        assert_eq!(existing[0].cve(), Some("CVE-2021-32708"));
        assert_eq!(
            existing[0].source("F").map(|a| a.remote_id.as_str()),
            Some("league/flysystem/CVE-2021-32708.yaml")
        );
    }

    #[test]
    fn test_fuzzy_match_attaches_source_once() {
        let resolver = SecurityAdvisoryResolver::default();
        let github = remote(
            "GitHub",
            "GHSA-9f46-5r25-5wfm",
            "league/flysystem",
            "TOCTOU Race Condition enabling remote code execution",
            Some("CVE-2021-32708"),
            date(2021, 6, 24),
        );
        let mut existing = vec![SecurityAdvisory::from_remote(
            &github,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        let friends = flysystem("league/flysystem/CVE-2021-32708.yaml", Some("CVE-2021-32708"));
        let resolution = resolver.resolve(&mut existing, &collection(vec![friends]), "F");

        assert!(resolution.is_empty());
        let record = &existing[0];
        assert_eq!(record.sources().len(), 2);
        assert_eq!(
            record.source("GitHub").map(|a| a.remote_id.as_str()),
            Some("GHSA-9f46-5r25-5wfm")
        );
        assert_eq!(
            record.source("F").map(|a| a.remote_id.as_str()),
            Some("league/flysystem/CVE-2021-32708.yaml")
        );
    }

    #[test]
    fn test_three_differences_are_never_merged() {
        let resolver = SecurityAdvisoryResolver::default();
        let original = flysystem("league/flysystem/2021-06-24.yaml", None);
        let mut existing = vec![SecurityAdvisory::from_remote(
            &original,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        let different = remote(
            "F",
            "league/flysystem/CVE-2022-1111.yaml",
            "league/flysystem",
            "Path traversal",
            Some("CVE-2022-1111"),
            date(2022, 3, 3),
        );
        let resolution = resolver.resolve(&mut existing, &collection(vec![different]), "F");

        assert_eq!(resolution.new_advisories.len(), 1);
        assert_eq!(resolution.removed_advisories.len(), 1);
        assert_eq!(
            resolution.removed_advisories[0].packagist_advisory_id(),
            "PKSA-bcdf-ghjk-mnpq"
        );
        assert!(existing.is_empty());
    }

    #[test]
    fn test_two_differences_are_merged() {
        let resolver = SecurityAdvisoryResolver::default();
        let original = flysystem("league/flysystem/2021-06-24.yaml", None);
        let mut existing = vec![SecurityAdvisory::from_remote(
            &original,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        let retitled = remote(
            "F",
            "league/flysystem/CVE-2021-32708.yaml",
            "league/flysystem",
            "Race condition in file handling",
            Some("CVE-2021-32708"),
            date(2021, 6, 24),
        );
        let resolution = resolver.resolve(&mut existing, &collection(vec![retitled]), "F");
        assert!(resolution.is_empty());
        assert_eq!(existing[0].title(), "Race condition in file handling");
    }

    #[test]
    fn test_fuzzy_match_requires_same_package() {
        let resolver = SecurityAdvisoryResolver::default();
        let original = flysystem("league/flysystem/2021-06-24.yaml", None);
        let mut existing = vec![SecurityAdvisory::from_remote(
            &original,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        let other_package = remote(
            "F",
            "league/flysystem-sftp/2021-06-24.yaml",
            "league/flysystem-sftp",
            "TOCTOU Race Condition enabling remote code execution",
            None,
            date(2021, 6, 24),
        );
        let resolution = resolver.resolve(&mut existing, &collection(vec![other_package]), "F");
        assert_eq!(resolution.new_advisories.len(), 1);
        assert_eq!(resolution.removed_advisories.len(), 1);
    }

    #[test]
    fn test_lowest_score_wins_and_ties_keep_order() {
        let resolver = SecurityAdvisoryResolver::default();
        let a = remote("F", "a/b/one.yaml", "a/b", "Same title", None, date(2020, 1, 1));
        let b = remote("F", "a/b/two.yaml", "a/b", "Same title", None, date(2020, 5, 5));
        let mut existing = vec![
            SecurityAdvisory::from_remote(&a, "PKSA-bbbb-bbbb-bbbb".to_string()),
            SecurityAdvisory::from_remote(&b, "PKSA-cccc-cccc-cccc".to_string()),
        ];

        // scores 1 against the first record, 0 against the second
        let incoming = remote("F", "a/b/three.yaml", "a/b", "Same title", None, date(2020, 5, 5));
        let resolution = resolver.resolve(&mut existing, &collection(vec![incoming]), "F");

        assert!(resolution.new_advisories.is_empty());
        assert_eq!(resolution.removed_advisories.len(), 1);
        assert_eq!(
            resolution.removed_advisories[0].packagist_advisory_id(),
            "PKSA-bbbb-bbbb-bbbb"
        );
        assert_eq!(existing[0].packagist_advisory_id(), "PKSA-cccc-cccc-cccc");

        // equal scores: the first candidate wins
        let c = remote("F", "x/y/one.yaml", "x/y", "Title", None, date(2020, 1, 1));
        let d = remote("F", "x/y/two.yaml", "x/y", "Title", None, date(2020, 1, 1));
        let mut existing = vec![
            SecurityAdvisory::from_remote(&c, "PKSA-dddd-dddd-dddd".to_string()),
            SecurityAdvisory::from_remote(&d, "PKSA-ffff-ffff-ffff".to_string()),
        ];
        let incoming = remote("F", "x/y/three.yaml", "x/y", "Title", None, date(2020, 1, 1));
        let resolution = resolver.resolve(&mut existing, &collection(vec![incoming]), "F");
        assert_eq!(
            resolution.removed_advisories[0].packagist_advisory_id(),
            "PKSA-ffff-ffff-ffff"
        );
        assert_eq!(
            existing[0].source("F").map(|a| a.remote_id.as_str()),
            Some("x/y/three.yaml")
        );
    }

    #[test]
    fn test_multi_source_survival() {
        let resolver = SecurityAdvisoryResolver::default();
        let from_f = flysystem("league/flysystem/2021-06-24.yaml", Some("CVE-2021-32708"));
        let mut existing = vec![SecurityAdvisory::from_remote(
            &from_f,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        // B vouches for the same advisory under its own id
        let from_b = RemoteSecurityAdvisory::builder("B", "GHSA-9f46-5r25-5wfm", "league/flysystem")
            .title("TOCTOU Race Condition enabling remote code execution")
            .affected_range(">=1.0,<1.5")
            .cve(Some("CVE-2021-32708"))
            .date(date(2021, 6, 24))
            .severity(Some(Severity::High))
            .build()
            .unwrap();
        let resolution = resolver.resolve(&mut existing, &collection(vec![from_b.clone()]), "B");
        assert!(resolution.is_empty());
        assert_eq!(existing[0].sources().len(), 2);
        assert_eq!(existing[0].severity(), Some(Severity::High));

        // F drops it: B still vouches
        let resolution = resolver.resolve(&mut existing, &collection(vec![]), "F");
        assert!(resolution.removed_advisories.is_empty());
        assert_eq!(existing.len(), 1);
        assert!(existing[0].source("F").is_none());
        assert!(existing[0].source("B").is_some());

        // B drops it too
        let resolution = resolver.resolve(&mut existing, &collection(vec![]), "B");
        assert_eq!(resolution.removed_advisories.len(), 1);
        assert!(existing.is_empty());
    }

    #[test]
    fn test_other_sources_records_are_untouched() {
        let resolver = SecurityAdvisoryResolver::default();
        let from_b = remote("B", "GHSA-aaaa-bbbb-cccc", "a/b", "Some issue", None, date(2020, 1, 1));
        let mut existing = vec![SecurityAdvisory::from_remote(
            &from_b,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];
        let snapshot = existing.clone();

        let resolution = resolver.resolve(&mut existing, &collection(vec![]), "F");
        assert!(resolution.is_empty());
        assert_eq!(existing, snapshot);
    }

    #[test]
    fn test_threshold_is_configurable() {
        let resolver = SecurityAdvisoryResolver::default().with_threshold(1);
        let original = flysystem("league/flysystem/2021-06-24.yaml", None);
        let mut existing = vec![SecurityAdvisory::from_remote(
            &original,
            "PKSA-bcdf-ghjk-mnpq".to_string(),
        )];

        let renamed = flysystem("league/flysystem/CVE-2021-32708.yaml", Some("CVE-2021-32708"));
        let resolution = resolver.resolve(&mut existing, &collection(vec![renamed]), "F");
        assert_eq!(resolution.new_advisories.len(), 1);
        assert_eq!(resolution.removed_advisories.len(), 1);
    }

    #[test]
    fn test_new_records_are_not_fuzzy_candidates_within_one_fetch() {
        let resolver = SecurityAdvisoryResolver::default();
        let mut existing = Vec::new();
        let remote = collection(vec![
            remote("F", "a/b/one.yaml", "a/b", "Title", None, date(2020, 1, 1)),
            remote("F", "a/b/two.yaml", "a/b", "Title", None, date(2020, 1, 1)),
        ]);
        let resolution = resolver.resolve(&mut existing, &remote, "F");
        assert_eq!(resolution.new_advisories.len(), 2);
    }
}
