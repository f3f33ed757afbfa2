use super::AdvisorySource;
use crate::error::{AdvisoryError, Result};
use crate::models::{
    RemoteSecurityAdvisory, RemoteSecurityAdvisoryCollection, Severity, normalize_package_name,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SOURCE_NAME: &str = "GitHub";
pub const API_URL: &str = "https://api.github.com/graphql";

const REQUESTS_PER_SECOND: NonZeroU32 = NonZeroU32::new(5).unwrap();

// Fields are comma separated so the query survives whitespace removal
const QUERY: &str = r#"
query {
    securityVulnerabilities(ecosystem: COMPOSER, first: 100{after}) {
        nodes {
            advisory {
                summary,
                permalink,
                publishedAt,
                withdrawnAt,
                severity,
                identifiers {
                    type,
                    value
                },
                references {
                    url
                }
            },
            vulnerableVersionRange,
            package {
                name
            }
        },
        pageInfo {
            hasNextPage,
            endCursor
        }
    }
}
"#;

/// GitHub security advisories for the Composer ecosystem.
pub struct GitHubSecurityAdvisoriesSource {
    tokens: Vec<String>,
    next_token: AtomicUsize,
    client: ClientWithMiddleware,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>>,
    api_url: String,
}

impl GitHubSecurityAdvisoriesSource {
    /// Create a source rotating through `tokens`, one per request.
    ///
    /// With no tokens requests are sent anonymously.
    pub fn new(tokens: Vec<String>) -> Self {
        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("packagist-advisories")
            .build()
            .unwrap_or_default();

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(REQUESTS_PER_SECOND)));

        Self {
            tokens: tokens.into_iter().filter(|t| !t.trim().is_empty()).collect(),
            next_token: AtomicUsize::new(0),
            client,
            limiter,
            api_url: API_URL.to_string(),
        }
    }

    /// Override the API URL (useful for mock servers in tests).
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn next_token(&self) -> Option<&str> {
        if self.tokens.is_empty() {
            return None;
        }
        let idx = self.next_token.fetch_add(1, Ordering::Relaxed) % self.tokens.len();
        Some(self.tokens[idx].as_str())
    }

    /// The query for one page, with all whitespace removed.
    fn query(after: Option<&str>) -> String {
        let collapsed: String = QUERY.split_whitespace().collect();
        let after = after
            .map(|cursor| format!(",after:{}", json!(cursor)))
            .unwrap_or_default();
        collapsed.replace("{after}", &after)
    }

    /// GitHub inserts spaces after commas and operators; drop them all.
    fn normalize_range(range: &str) -> String {
        range.chars().filter(|c| !c.is_whitespace()).collect()
    }

    async fn fetch_page(&self, cursor: Option<&str>, page: usize) -> Result<SecurityVulnerabilities> {
        let body = serde_json::to_string(&json!({ "query": Self::query(cursor) }))?;

        self.limiter.until_ready().await;

        let mut request = self
            .client
            .post(&self.api_url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(token) = self.next_token() {
            request = request.header("Authorization", format!("token {}", token));
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(source = SOURCE_NAME, page, "GitHub API error {}: {}", status, text);
            return Err(AdvisoryError::source_fetch(
                SOURCE_NAME,
                format!("API returned {} on page {}: {}", status, page, text),
            ));
        }

        let data: GraphQlResponse = response.json().await?;

        if let Some(errors) = data.errors
            && !errors.is_empty()
        {
            warn!(source = SOURCE_NAME, page, "GraphQL errors: {:?}", errors);
            return Err(AdvisoryError::graphql(format!(
                "page {}: {:?}",
                page, errors
            )));
        }

        data.data
            .map(|d| d.security_vulnerabilities)
            .ok_or_else(|| {
                AdvisoryError::source_fetch(SOURCE_NAME, format!("page {} carried no data", page))
            })
    }
}

/// One advisory/package pair while pages are still being collected.
struct PendingAdvisory {
    remote_id: String,
    package_name: String,
    title: String,
    link: String,
    cve: Option<String>,
    ranges: Vec<String>,
    date: DateTime<Utc>,
    references: Vec<String>,
    severity: Option<Severity>,
}

#[async_trait]
impl AdvisorySource for GitHubSecurityAdvisoriesSource {
    async fn fetch(&self) -> Result<RemoteSecurityAdvisoryCollection> {
        let mut pending: Vec<PendingAdvisory> = Vec::new();
        let mut positions: HashMap<(String, String), usize> = HashMap::new();
        let mut cursor: Option<String> = None;
        let mut page = 0;
        let mut withdrawn = 0usize;

        info!(source = SOURCE_NAME, "Starting GitHub advisory fetch");

        loop {
            page += 1;
            let vulnerabilities = self.fetch_page(cursor.as_deref(), page).await?;

            for node in vulnerabilities.nodes {
                let advisory = node.advisory;
                if advisory.withdrawn_at.is_some() {
                    withdrawn += 1;
                    continue;
                }

                let mut remote_id = None;
                let mut cve = None;
                for identifier in &advisory.identifiers {
                    match identifier.id_type.as_str() {
                        "GHSA" => remote_id = Some(identifier.value.clone()),
                        "CVE" => cve = Some(identifier.value.clone()),
                        _ => {}
                    }
                }
                let Some(remote_id) = remote_id else {
                    debug!("Skipping vulnerability without GHSA identifier: {}", advisory.permalink);
                    continue;
                };

                let package_name = normalize_package_name(&node.package.name);
                let range = Self::normalize_range(&node.vulnerable_version_range);
                let key = (remote_id.clone(), package_name.clone());

                if let Some(&pos) = positions.get(&key) {
                    pending[pos].ranges.push(range);
                    continue;
                }

                positions.insert(key, pending.len());
                pending.push(PendingAdvisory {
                    remote_id,
                    package_name,
                    title: advisory.summary,
                    link: advisory.permalink,
                    cve,
                    ranges: vec![range],
                    date: advisory.published_at,
                    references: advisory
                        .references
                        .into_iter()
                        .filter_map(|r| r.url)
                        .collect(),
                    severity: advisory.severity.as_deref().and_then(Severity::parse),
                });
            }

            if vulnerabilities.page_info.has_next_page {
                let Some(end_cursor) = vulnerabilities.page_info.end_cursor else {
                    return Err(AdvisoryError::source_fetch(
                        SOURCE_NAME,
                        format!("page {} reports more pages but no cursor", page),
                    ));
                };
                cursor = Some(end_cursor);
                if page % 10 == 0 {
                    info!(
                        "GitHub fetch progress: {} pages, {} advisories so far",
                        page,
                        pending.len()
                    );
                }
                debug!("Fetching next page of GitHub advisories...");
            } else {
                break;
            }
        }

        let mut advisories = Vec::with_capacity(pending.len());
        for entry in pending {
            let mut builder =
                RemoteSecurityAdvisory::builder(SOURCE_NAME, entry.remote_id, entry.package_name)
                    .title(entry.title)
                    .link(entry.link)
                    .cve(entry.cve)
                    .date(entry.date)
                    .severity(entry.severity)
                    .references(entry.references);
            for range in entry.ranges {
                builder = builder.affected_range(range);
            }
            advisories.push(builder.build()?);
        }

        info!(
            source = SOURCE_NAME,
            pages = page,
            withdrawn,
            "Fetched {} advisories from GitHub",
            advisories.len()
        );
        Ok(RemoteSecurityAdvisoryCollection::new(advisories))
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<Data>,
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct Data {
    #[serde(rename = "securityVulnerabilities")]
    security_vulnerabilities: SecurityVulnerabilities,
}

#[derive(Deserialize)]
struct SecurityVulnerabilities {
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
    nodes: Vec<VulnerabilityNode>,
}

#[derive(Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
struct VulnerabilityNode {
    advisory: AdvisoryNode,
    #[serde(rename = "vulnerableVersionRange")]
    vulnerable_version_range: String,
    package: PackageNode,
}

#[derive(Deserialize)]
struct AdvisoryNode {
    summary: String,
    permalink: String,
    #[serde(rename = "publishedAt")]
    published_at: DateTime<Utc>,
    #[serde(rename = "withdrawnAt")]
    withdrawn_at: Option<DateTime<Utc>>,
    severity: Option<String>,
    identifiers: Vec<Identifier>,
    #[serde(default)]
    references: Vec<ReferenceNode>,
}

#[derive(Deserialize)]
struct Identifier {
    #[serde(rename = "type")]
    id_type: String,
    value: String,
}

#[derive(Deserialize)]
struct ReferenceNode {
    url: Option<String>,
}

#[derive(Deserialize)]
struct PackageNode {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node(
        ghsa: &str,
        cve: Option<&str>,
        package: &str,
        range: &str,
        withdrawn: bool,
        severity: &str,
    ) -> Value {
        let mut identifiers = vec![json!({ "type": "GHSA", "value": ghsa })];
        if let Some(cve) = cve {
            identifiers.push(json!({ "type": "CVE", "value": cve }));
        }
        let withdrawn_at = if withdrawn {
            json!("2021-07-01T00:00:00Z")
        } else {
            Value::Null
        };
        json!({
            "advisory": {
                "summary": format!("Advisory {ghsa}"),
                "permalink": format!("https://github.com/advisories/{ghsa}"),
                "publishedAt": "2021-06-29T12:00:00Z",
                "withdrawnAt": withdrawn_at,
                "severity": severity,
                "identifiers": identifiers,
                "references": [
                    { "url": format!("https://nvd.nist.gov/vuln/detail/{}", cve.unwrap_or("none")) }
                ]
            },
            "vulnerableVersionRange": range,
            "package": { "name": package }
        })
    }

    fn page(nodes: Vec<Value>, next: Option<&str>) -> Value {
        json!({
            "data": {
                "securityVulnerabilities": {
                    "pageInfo": { "hasNextPage": next.is_some(), "endCursor": next },
                    "nodes": nodes
                }
            }
        })
    }

    #[test]
    fn test_query_has_no_whitespace() {
        let first = GitHubSecurityAdvisoriesSource::query(None);
        assert!(!first.chars().any(char::is_whitespace));
        assert!(first.contains("securityVulnerabilities(ecosystem:COMPOSER,first:100)"));
        assert!(first.contains("identifiers{type,value}"));

        let next = GitHubSecurityAdvisoriesSource::query(Some("Y3Vyc29yOjI="));
        assert!(next.contains(r#"first:100,after:"Y3Vyc29yOjI=")"#));
    }

    #[test]
    fn test_normalize_range() {
        assert_eq!(
            GitHubSecurityAdvisoriesSource::normalize_range(">= 2.0.0, < 2.1.1"),
            ">=2.0.0,<2.1.1"
        );
    }

    #[test]
    fn test_token_rotation() {
        let source = GitHubSecurityAdvisoriesSource::new(vec![
            "alpha".to_string(),
            " ".to_string(),
            "beta".to_string(),
        ]);
        assert_eq!(source.next_token(), Some("alpha"));
        assert_eq!(source.next_token(), Some("beta"));
        assert_eq!(source.next_token(), Some("alpha"));

        let anonymous = GitHubSecurityAdvisoriesSource::new(vec![]);
        assert_eq!(anonymous.next_token(), None);
    }

    #[tokio::test]
    async fn test_fetch_paginates_and_normalizes() {
        let mock_server = MockServer::start().await;
        let source = GitHubSecurityAdvisoriesSource::new(vec!["alpha".into(), "beta".into()])
            .with_api_url(mock_server.uri());

        let second = page(
            vec![
                node("GHSA-9f46-5r25-5wfm", Some("CVE-2021-32708"), "league/flysystem", ">= 1.0.0, < 1.1.4", false, "HIGH"),
                node("GHSA-wwww-xxxx-yyyy", None, "acme/withdrawn", "< 1.0", true, "LOW"),
            ],
            None,
        );
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("Y3Vyc29yOjI="))
            .and(header("Authorization", "token beta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(second))
            .with_priority(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        let first = page(
            vec![
                node("GHSA-9f46-5r25-5wfm", Some("CVE-2021-32708"), "League/Flysystem", ">= 2.0.0, < 2.1.1", false, "HIGH"),
                node("GHSA-3q9p-7x2v-abcd", Some("CVE-2022-xxxx"), "symfony/http-kernel", "< 4.4.50", false, "MODERATE"),
            ],
            Some("Y3Vyc29yOjI="),
        );
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("securityVulnerabilities"))
            .and(header("Authorization", "token alpha"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first))
            .expect(1)
            .mount(&mock_server)
            .await;

        let collection = source.fetch().await.unwrap();
        assert_eq!(collection.len(), 2);

        let flysystem = &collection.advisories_for_package("league/flysystem")[0];
        assert_eq!(flysystem.remote_id(), "GHSA-9f46-5r25-5wfm");
        assert_eq!(flysystem.cve(), Some("CVE-2021-32708"));
        assert_eq!(flysystem.affected_versions(), ">=2.0.0,<2.1.1|>=1.0.0,<1.1.4");
        assert_eq!(flysystem.severity(), Some(Severity::High));
        assert_eq!(flysystem.source(), SOURCE_NAME);
        assert_eq!(flysystem.references().len(), 1);

        let kernel = &collection.advisories_for_package("symfony/http-kernel")[0];
        assert_eq!(kernel.severity(), Some(Severity::Medium));
        assert_eq!(kernel.cve(), None);

        assert!(collection.advisories_for_package("acme/withdrawn").is_empty());
    }

    #[tokio::test]
    async fn test_graphql_errors_fail_the_fetch() {
        let mock_server = MockServer::start().await;
        let source = GitHubSecurityAdvisoriesSource::new(vec![]).with_api_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{ "message": "API rate limit exceeded" }]
            })))
            .mount(&mock_server)
            .await;

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, AdvisoryError::GraphQL(_)));
    }

    #[tokio::test]
    async fn test_failed_second_page_discards_first() {
        let mock_server = MockServer::start().await;
        let source = GitHubSecurityAdvisoriesSource::new(vec![]).with_api_url(mock_server.uri());

        Mock::given(method("POST"))
            .and(body_string_contains("Y3Vyc29yOjI="))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
            .with_priority(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                vec![node("GHSA-9f46-5r25-5wfm", None, "league/flysystem", "<1.1.4", false, "HIGH")],
                Some("Y3Vyc29yOjI="),
            )))
            .mount(&mock_server)
            .await;

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, AdvisoryError::SourceFetch { .. }));
    }

    #[tokio::test]
    async fn test_anonymous_requests_send_no_authorization() {
        let mock_server = MockServer::start().await;
        let source = GitHubSecurityAdvisoriesSource::new(vec![]).with_api_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![], None)))
            .mount(&mock_server)
            .await;

        let collection = source.fetch().await.unwrap();
        assert!(collection.is_empty());

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
    }
}
