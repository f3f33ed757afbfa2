//! Upstream advisory feeds.
//!
//! Each feed implements the [`AdvisorySource`] trait and converts its data to
//! a [`RemoteSecurityAdvisoryCollection`].
//!
//! # Available Sources
//!
//! - [`github::GitHubSecurityAdvisoriesSource`] - GitHub GraphQL API (tokens optional)
//! - [`friendsofphp::FriendsOfPhpSecurityAdvisoriesSource`] - FriendsOfPHP YAML
//!   database, distributed as a Composer package

pub mod friendsofphp;
pub mod github;

use crate::error::Result;
use crate::models::RemoteSecurityAdvisoryCollection;
use async_trait::async_trait;

/// Trait for upstream advisory feeds.
///
/// Implement this trait to add a new feed; the resolver does not change.
///
/// # Example
///
/// ```ignore
/// use packagist_advisories::sources::AdvisorySource;
/// use packagist_advisories::models::RemoteSecurityAdvisoryCollection;
/// use async_trait::async_trait;
///
/// struct MySource;
///
/// #[async_trait]
/// impl AdvisorySource for MySource {
///     async fn fetch(&self) -> Result<RemoteSecurityAdvisoryCollection> {
///         Ok(RemoteSecurityAdvisoryCollection::default())
///     }
///
///     fn name(&self) -> &str {
///         "MySource"
///     }
/// }
/// ```
#[async_trait]
pub trait AdvisorySource: Send + Sync {
    /// Fetch every advisory the feed currently lists.
    ///
    /// An empty collection means the feed was reachable and lists nothing.
    /// An error means the feed could not be read completely; callers must
    /// leave persisted state alone rather than treat it as removals.
    async fn fetch(&self) -> Result<RemoteSecurityAdvisoryCollection>;

    /// Name of this source, used for attributions, locks and logging.
    fn name(&self) -> &str;
}
