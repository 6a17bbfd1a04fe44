//! Grid Connections
//!
//! Domain engine for administering utility connection requests:
//! - Six-level ownership hierarchy with a table-driven path resolver
//! - Pairwise placement validation before every create/re-parent
//! - Connection lifecycle state machine with EAN assignment
//! - Idempotent one-time and monthly billing emission
//! - Neo4j or in-memory persistence behind one `Repository` trait

pub mod billing;
pub mod connection;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_helpers;

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use billing::{BilledMonth, BillingItem, MonthlyBillingSweep, SweepReport, TariffSettings};
use connection::{ConnectionLifecycle, ConnectionStatus, EanGenerator, EanSettings, TransitionOutcome};
use events::EventBus;
use hierarchy::{HierarchyLevel, HierarchyService, PartialHierarchy};
use store::{CallPolicy, MemoryRepository, Neo4jRepository, Repository, StoreSettings};

pub use error::{DomainError, StoreError};

// ============================================================================
// Config file layout
// ============================================================================

/// `config.yaml`; every section is optional
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub neo4j: Neo4jYamlConfig,
    pub tariffs: TariffSettings,
    pub ean: EanSettings,
    pub store: StoreSettings,
}

/// `neo4j:` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Neo4jYamlConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl Default for Neo4jYamlConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".into(),
            user: "neo4j".into(),
            password: "grid-connections".into(),
        }
    }
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Settings after applying env overrides to the file
#[derive(Debug, Clone)]
pub struct Config {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub tariffs: TariffSettings,
    pub ean: EanSettings,
    pub store: StoreSettings,
}

/// Parse an env var, ignoring it when unset or malformed
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

impl Config {
    /// `config.yaml` from the working directory plus env overrides
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Read `yaml_path` (or `config.yaml`), then apply env overrides.
    ///
    /// Env beats the file, the file beats built-in defaults. `.env` is read
    /// into the environment first.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let yaml = Self::load_yaml(yaml_path);

        let mut tariffs = yaml.tariffs;
        if let Some(v) = env_parse("CONNECTION_FEE_CENTS") {
            tariffs.connection_fee_cents = v;
        }
        if let Some(v) = env_parse("PROJECT_FEE_CENTS") {
            tariffs.project_fee_cents = v;
        }
        if let Some(v) = env_parse("MONTHLY_EAN_RATE_CENTS") {
            tariffs.default_monthly_ean_rate_cents = v;
        }

        let mut ean = yaml.ean;
        if let Ok(prefix) = std::env::var("EAN_PREFIX") {
            ean.prefix = prefix;
        }

        let mut store = yaml.store;
        if let Some(v) = env_parse("STORE_TIMEOUT_MS") {
            store.timeout_ms = v;
        }

        Ok(Self {
            neo4j_uri: std::env::var("NEO4J_URI").unwrap_or(yaml.neo4j.uri),
            neo4j_user: std::env::var("NEO4J_USER").unwrap_or(yaml.neo4j.user),
            neo4j_password: std::env::var("NEO4J_PASSWORD").unwrap_or(yaml.neo4j.password),
            tariffs,
            ean,
            store,
        })
    }

    /// Missing or unparsable files fall back to defaults
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let path = yaml_path.unwrap_or(Path::new("config.yaml"));

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Config file loaded");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(path = %path.display(), "No config file");
                YamlConfig::default()
            }
        }
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy::from(&self.store)
    }
}

impl Default for Config {
    fn default() -> Self {
        let yaml = YamlConfig::default();
        Self {
            neo4j_uri: yaml.neo4j.uri,
            neo4j_user: yaml.neo4j.user,
            neo4j_password: yaml.neo4j.password,
            tariffs: yaml.tariffs,
            ean: yaml.ean,
            store: yaml.store,
        }
    }
}

// ============================================================================
// Application state
// ============================================================================

/// Shared application state: the repository and the engines built on it
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub hierarchy: Arc<HierarchyService>,
    pub lifecycle: Arc<ConnectionLifecycle>,
    pub sweep: Arc<MonthlyBillingSweep>,
    pub events: EventBus,
    pub config: Arc<Config>,
}

impl AppState {
    /// Connect to Neo4j and build every engine
    pub async fn new(config: Config) -> Result<Self> {
        let repo = Arc::new(
            Neo4jRepository::new(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
                .await?,
        );
        Self::with_repository(config, repo)
    }

    /// Build every engine over an empty in-memory repository
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::with_repository(config, Arc::new(MemoryRepository::new()))
    }

    pub fn with_repository(config: Config, repo: Arc<dyn Repository>) -> Result<Self> {
        let policy = config.call_policy();
        let events = EventBus::default();
        let emitter: Arc<dyn events::EventEmitter> = Arc::new(events.clone());
        let ean = EanGenerator::new(&config.ean)?;

        Ok(Self {
            hierarchy: Arc::new(HierarchyService::new(
                repo.clone(),
                policy,
                config.tariffs.clone(),
                emitter.clone(),
            )),
            lifecycle: Arc::new(ConnectionLifecycle::new(
                repo.clone(),
                policy,
                config.tariffs.clone(),
                ean,
                emitter.clone(),
            )),
            sweep: Arc::new(MonthlyBillingSweep::new(
                repo.clone(),
                policy,
                config.tariffs.clone(),
                emitter,
            )),
            repo,
            events,
            config: Arc::new(config),
        })
    }

    // ========================================================================
    // Library API
    // ========================================================================

    pub async fn resolve_path(&self, id: Uuid, level: HierarchyLevel) -> error::Result<hierarchy::Path> {
        self.hierarchy.resolve_path(id, level).await
    }

    pub async fn validate_full_hierarchy(&self, partial: &PartialHierarchy) -> error::Result<bool> {
        self.hierarchy.validate_full_hierarchy(partial).await
    }

    pub async fn apply_transition(
        &self,
        connection_id: Uuid,
        target: ConnectionStatus,
    ) -> error::Result<TransitionOutcome> {
        self.lifecycle.apply_transition(connection_id, target).await
    }

    pub async fn run_monthly_billing_sweep(&self, month: BilledMonth) -> error::Result<Vec<BillingItem>> {
        self.sweep.run_monthly_billing_sweep(month).await
    }

    /// Sweep with the full per-connection report
    pub async fn run_sweep_report(&self, month: BilledMonth) -> error::Result<SweepReport> {
        self.sweep.run(month).await
    }
}

// ============================================================================
// Tests
// ============================================================================
