//! Run configuration loaded from TOML.
//!
//! ```toml
//! [connection]
//! url = "/tmp/foodmart.db"
//! olap_connect_string = "Provider=mondrian;Jdbc=sqlite:/tmp/foodmart.db;Catalog=x;"
//! user = "tck"
//!
//! [compliance]
//! level = 3
//!
//! [harness]
//! workers = 10
//! connection_source = { kind = "pooled", size = 5 }
//! cancellations = 20
//! cancel_policy = { kind = "random_with_seed", seed = 42 }
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tck_error::{Result, TckError};
use tracing::debug;

use crate::comparator::ComplianceLevel;
use crate::context::CancelPolicy;
use crate::driver::Credentials;
use crate::harness::{HarnessConfig, QueryOrder, RunLimit};
use crate::pool::ConnectionSource;
use crate::registry::ConnectionFactoryRegistry;
use crate::{SEED_ENV, TCK_SEED};

/// Environment variable overriding `[compliance] level`.
pub const LEVEL_ENV: &str = "TCK_COMPLIANCE_LEVEL";

/// Whole configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TckConfig {
    pub connection: ConnectionSection,
    pub compliance: ComplianceSection,
    pub harness: HarnessSection,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSection {
    /// Tabular driver URL; for SQLite a file path, optionally `sqlite:`
    /// prefixed.
    pub url: String,
    /// Connect string handed to the multidimensional driver.
    pub olap_connect_string: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ConnectionSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSection")
            .field("url", &self.url)
            .field("olap_connect_string", &self.olap_connect_string)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ConnectionSection {
    /// `olap_connect_string` with its `Catalog=` segment pointed at a file,
    /// owned by `registry`, holding `catalog`.
    pub fn olap_connect_string_for(
        &self,
        registry: &ConnectionFactoryRegistry,
        catalog: &str,
    ) -> Result<String> {
        if self.olap_connect_string.is_empty() {
            return Err(TckError::configuration(
                "[connection] olap_connect_string is not set",
            ));
        }
        registry.connect_string_for_catalog(&self.olap_connect_string, catalog)
    }

    /// Credentials for the tabular driver; empty fields are omitted.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: (!self.user.is_empty()).then(|| self.user.clone()),
            password: (!self.password.is_empty()).then(|| self.password.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComplianceSection {
    pub level: ComplianceLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSection {
    pub workers: usize,
    pub connection_source: ConnectionSource,
    /// Run for this long; when absent each worker runs `runs` queries.
    pub duration_ms: Option<u64>,
    pub runs: usize,
    pub order: QueryOrder,
    pub cancellations: usize,
    pub cancel_interval_ms: u64,
    pub cancel_policy: CancelPolicy,
    pub seed: u64,
    pub deadline_ms: u64,
    pub shutdown_grace_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for HarnessSection {
    fn default() -> Self {
        Self {
            workers: 10,
            connection_source: ConnectionSource::Pooled { size: 5 },
            duration_ms: None,
            runs: 10,
            order: QueryOrder::Random,
            cancellations: 20,
            cancel_interval_ms: 10,
            cancel_policy: CancelPolicy::Never,
            seed: TCK_SEED,
            deadline_ms: 60_000,
            shutdown_grace_ms: 5_000,
            acquire_timeout_ms: 10_000,
        }
    }
}

impl HarnessSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl TckConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| TckError::configuration(format!("invalid tck config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            TckError::configuration(format!("cannot read tck config {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        debug!(path = %path.display(), level = ?config.compliance.level, "tck config loaded");
        Ok(config)
    }

    /// Apply `TCK_SEED` and `TCK_COMPLIANCE_LEVEL` from the process
    /// environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(SEED_ENV) {
            self.harness.seed = raw.trim().parse().map_err(|_| {
                TckError::configuration(format!("{SEED_ENV} must be an unsigned integer, got {raw:?}"))
            })?;
            debug!(seed = self.harness.seed, "seed overridden from environment");
        }
        if let Some(raw) = lookup(LEVEL_ENV) {
            let level: u8 = raw.trim().parse().map_err(|_| {
                TckError::configuration(format!("{LEVEL_ENV} must be 1, 2 or 3, got {raw:?}"))
            })?;
            self.compliance.level = ComplianceLevel::try_from(level)?;
            debug!(level, "compliance level overridden from environment");
        }
        Ok(())
    }

    /// Harness parameters derived from `[harness]` and `[compliance]`.
    pub fn harness_config(&self) -> HarnessConfig {
        let h = &self.harness;
        HarnessConfig {
            workers: h.workers,
            limit: h.duration_ms.map_or(RunLimit::Runs(h.runs), |ms| {
                RunLimit::Duration(Duration::from_millis(ms))
            }),
            order: h.order,
            cancellations: h.cancellations,
            cancel_interval: Duration::from_millis(h.cancel_interval_ms),
            seed: h.seed,
            deadline: Duration::from_millis(h.deadline_ms),
            shutdown_grace: Duration::from_millis(h.shutdown_grace_ms),
            cancel_policy: h.cancel_policy,
            level: self.compliance.level,
        }
    }

    fn validate(&self) -> Result<()> {
        let h = &self.harness;
        if h.workers == 0 {
            return Err(TckError::configuration("harness.workers must be positive"));
        }
        if h.connection_source == (ConnectionSource::Pooled { size: 0 }) {
            return Err(TckError::configuration(
                "harness.connection_source pool size must be positive",
            ));
        }
        if h.duration_ms == Some(0) || (h.duration_ms.is_none() && h.runs == 0) {
            return Err(TckError::configuration("harness run limit must be positive"));
        }
        Ok(())
    }
}
