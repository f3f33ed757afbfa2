//! Ingestion and reconciliation of Composer security advisories.
//!
//! Upstream feeds ([`sources`]) are fetched into a
//! [`RemoteSecurityAdvisoryCollection`], reconciled against the stored
//! [`SecurityAdvisory`] records by the [`SecurityAdvisoryResolver`], and the
//! resulting [`store::ChangeSet`] is committed atomically. The
//! [`IngestionWorker`] drives one run per source under an exclusive lock.
//!
//! ```ignore
//! use packagist_advisories::{Config, IngestionWorker};
//!
//! let config = Config::from_env()?;
//! let worker = IngestionWorker::from_config(&config)?;
//! let stats = worker.run_all().await;
//! ```

pub mod advisory;
pub mod config;
pub mod error;
pub mod id_generator;
pub mod lock;
pub mod logging;
pub mod models;
pub mod parser;
pub mod resolver;
pub mod sources;
pub mod store;
pub mod worker;

pub use advisory::{SecurityAdvisory, SourceAttribution};
pub use config::Config;
pub use error::{AdvisoryError, Result};
pub use id_generator::AdvisoryIdGenerator;
pub use models::{RemoteSecurityAdvisory, RemoteSecurityAdvisoryCollection, Severity};
pub use parser::AdvisoryParser;
pub use resolver::{Resolution, SecurityAdvisoryResolver};
pub use sources::AdvisorySource;
pub use worker::{IngestionWorker, RunOutcome, RunReport, SyncStats};
