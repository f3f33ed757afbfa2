use super::AdvisorySource;
use crate::error::{AdvisoryError, Result};
use crate::parser::AdvisoryParser;
use crate::models::{PACKAGIST_ORG, RemoteSecurityAdvisory, RemoteSecurityAdvisoryCollection};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const SOURCE_NAME: &str = "FriendsOfPHP/security-advisories";
/// The Composer package the advisory database is distributed as.
pub const SECURITY_PACKAGE: &str = "friendsofphp/security-advisories";
pub const PACKAGIST_REPO_URL: &str = "https://repo.packagist.org";

const DEFAULT_BRANCH_VERSION: &str = "9999999-dev";
const COMPOSER_REFERENCE_PREFIX: &str = "composer://";

static FILENAME_DATE_REGEX: Lazy<std::result::Result<Regex, regex_lite::Error>> =
    Lazy::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})"));

/// The FriendsOfPHP advisory database, one YAML file per advisory.
pub struct FriendsOfPhpSecurityAdvisoriesSource {
    client: ClientWithMiddleware,
    repository_url: String,
    scratch_root: Option<PathBuf>,
}

impl FriendsOfPhpSecurityAdvisoriesSource {
    /// Create a source resolving the package through the Composer repository
    /// at `repository_url`.
    pub fn new(repository_url: impl Into<String>) -> Self {
        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("packagist-advisories")
            .build()
            .unwrap_or_default();

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            repository_url: repository_url.into().trim_end_matches('/').to_string(),
            scratch_root: None,
        }
    }

    /// Unpack archives below `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    /// Dist URL of the default-branch revision.
    ///
    /// A repository that cannot name that revision is treated as unreachable:
    /// an empty result here would read as every advisory being withdrawn.
    async fn dist_url(&self) -> Result<String> {
        let url = format!("{}/p2/{}~dev.json", self.repository_url, SECURITY_PACKAGE);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            warn!(source = SOURCE_NAME, url = %url, status = %response.status(), "Package metadata unavailable");
            return Err(AdvisoryError::source_fetch(
                SOURCE_NAME,
                format!("{} returned {}", url, response.status()),
            ));
        }

        let metadata: PackageMetadata = response.json().await?;
        let version = metadata
            .packages
            .get(SECURITY_PACKAGE)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|v| v.version_normalized.as_deref() == Some(DEFAULT_BRANCH_VERSION))
            })
            .ok_or_else(|| {
                AdvisoryError::source_fetch(
                    SOURCE_NAME,
                    format!("{} lists no {} revision", url, DEFAULT_BRANCH_VERSION),
                )
            })?;

        version.dist.as_ref().map(|d| d.url.clone()).ok_or_else(|| {
            AdvisoryError::source_fetch(
                SOURCE_NAME,
                format!("{} revision of {} has no dist", DEFAULT_BRANCH_VERSION, SECURITY_PACKAGE),
            )
        })
    }

    async fn download(&self, url: &str, target: &Path) -> Result<()> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AdvisoryError::source_fetch(
                SOURCE_NAME,
                format!("Failed to fetch archive {}: {}", url, response.status()),
            ));
        }

        let mut file = std::fs::File::create(target)?;
        let mut content = response.bytes_stream();
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Extract `archive` into `target`, dropping the top-level directory.
    fn unpack(archive: &Path, target: &Path) -> Result<()> {
        let file = std::fs::File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file)?;
        std::fs::create_dir_all(target)?;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let Some(enclosed) = entry.enclosed_name() else {
                return Err(AdvisoryError::source_fetch(
                    SOURCE_NAME,
                    format!("archive entry '{}' escapes the target directory", entry.name()),
                ));
            };

            let mut components = enclosed.components();
            components.next();
            let relative = components.as_path();
            if relative.as_os_str().is_empty() {
                continue;
            }

            let path = target.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&path)?;
                continue;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        Ok(())
    }

    /// Unpack `archive.zip` inside `scratch` and parse it, then remove
    /// `scratch`.
    fn unpack_and_parse(scratch: tempfile::TempDir) -> Result<Vec<RemoteSecurityAdvisory>> {
        let archive = scratch.path().join("archive.zip");
        let package_root = scratch.path().join("package");
        let parsed = Self::unpack(&archive, &package_root).and_then(|()| Self::parse_tree(&package_root));

        debug!(scratch = %scratch.path().display(), "Removing scratch directory");
        scratch.close()?;
        parsed
    }

    /// Parse every `*.yaml` file below `root`, in path order.
    fn parse_tree(root: &Path) -> Result<Vec<RemoteSecurityAdvisory>> {
        let mut advisories = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("yaml")
            {
                continue;
            }

            let relative = path.strip_prefix(root).unwrap_or(path);
            let remote_id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let content = std::fs::read_to_string(path)?;
            let document: Value = serde_yaml::from_str(&content)
                .map_err(|e| AdvisoryError::malformed(&remote_id, e.to_string()))?;
            advisories.push(Self::from_yaml(&remote_id, &document)?);
        }

        Ok(advisories)
    }

    /// Convert one advisory document. `remote_id` is its path relative to the
    /// package root.
    fn from_yaml(remote_id: &str, document: &Value) -> Result<RemoteSecurityAdvisory> {
        let file: AdvisoryFile = serde_yaml::from_value(document.clone())
            .map_err(|e| AdvisoryError::malformed(remote_id, e.to_string()))?;

        let package_name = file
            .reference
            .strip_prefix(COMPOSER_REFERENCE_PREFIX)
            .unwrap_or(&file.reference);

        let mut builder = RemoteSecurityAdvisory::builder(SOURCE_NAME, remote_id, package_name)
            .title(file.title)
            .link(file.link.unwrap_or_default())
            .cve(file.cve.or_else(|| AdvisoryParser::extract_cve(remote_id)));

        let mut earliest: Option<DateTime<Utc>> = None;
        for (name, branch) in &file.branches {
            let branch: Branch = serde_yaml::from_value(branch.clone()).map_err(|e| {
                AdvisoryError::malformed(remote_id, format!("branch {:?}: {}", name, e))
            })?;
            if let Some(time) = branch_time(remote_id, branch.time.as_ref())? {
                earliest = Some(earliest.map_or(time, |current| current.min(time)));
            }
            builder = builder.affected_range(branch.versions.join(","));
        }

        if let Some(date) = filename_date(remote_id).or(earliest) {
            builder = builder.date(date);
        }

        builder = match file.composer_repository {
            None | Some(Value::Null) => builder.composer_repository(Some(PACKAGIST_ORG)),
            Some(Value::Bool(false)) => builder.composer_repository(None::<String>),
            Some(Value::String(url)) => builder.composer_repository(Some(url)),
            Some(other) => {
                return Err(AdvisoryError::malformed(
                    remote_id,
                    format!("unsupported composer-repository value {:?}", other),
                ));
            }
        };

        builder.build().map_err(|e| AdvisoryError::malformed(remote_id, e.to_string()))
    }
}

/// Date encoded in a `YYYY-MM-DD*.yaml` file name.
fn filename_date(remote_id: &str) -> Option<DateTime<Utc>> {
    let file_name = remote_id.rsplit('/').next()?;
    let regex = FILENAME_DATE_REGEX.as_ref().ok()?;
    let caps = regex.captures(file_name)?;
    NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// A branch `time` is either unix seconds or a date string.
fn branch_time(remote_id: &str, time: Option<&Value>) -> Result<Option<DateTime<Utc>>> {
    let parsed = match time {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Some(Value::String(s)) => parse_date_string(s),
        Some(_) => None,
    };

    parsed.map(Some).ok_or_else(|| {
        AdvisoryError::malformed(remote_id, format!("unparseable branch time {:?}", time))
    })
}

fn parse_date_string(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

#[async_trait]
impl AdvisorySource for FriendsOfPhpSecurityAdvisoriesSource {
    async fn fetch(&self) -> Result<RemoteSecurityAdvisoryCollection> {
        let dist_url = self.dist_url().await?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("friendsofphp-advisories-");
        // Removed on drop, whichever way this function returns
        let scratch = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let archive = scratch.path().join("archive.zip");
        info!(source = SOURCE_NAME, url = %dist_url, "Downloading advisory archive");
        self.download(&dist_url, &archive).await?;

        // The blocking task owns the scratch dir so a cancelled fetch cannot
        // remove it while files are still being unpacked
        let advisories = tokio::task::spawn_blocking(move || Self::unpack_and_parse(scratch))
            .await??;

        info!(
            source = SOURCE_NAME,
            "Parsed {} advisories from archive",
            advisories.len()
        );
        Ok(RemoteSecurityAdvisoryCollection::new(advisories))
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

#[derive(Deserialize)]
struct PackageMetadata {
    #[serde(default)]
    packages: HashMap<String, Vec<PackageVersion>>,
}

#[derive(Deserialize)]
struct PackageVersion {
    version_normalized: Option<String>,
    dist: Option<Dist>,
}

#[derive(Deserialize)]
struct Dist {
    url: String,
}

#[derive(Deserialize)]
struct AdvisoryFile {
    title: String,
    link: Option<String>,
    cve: Option<String>,
    reference: String,
    #[serde(default)]
    branches: Mapping,
    #[serde(rename = "composer-repository", default)]
    composer_repository: Option<Value>,
}

#[derive(Deserialize)]
struct Branch {
    time: Option<Value>,
    #[serde(default)]
    versions: Vec<String>,
}
