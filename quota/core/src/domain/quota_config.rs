// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Quota Service Configuration
//
// Defines the configuration schema for a quotad node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Process-wide default limits, one per resource kind
// - Reservation expiry and sweep cadence
// - Limit store backend selection
// - Network and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::domain::quota::{QuotaSet, ResourceKind, UNLIMITED};
use crate::domain::repository::{PostgresConfig, StorageBackend};

pub const API_VERSION: &str = "quotad.io/v1";
pub const KIND: &str = "QuotaConfig";

/// Top-level Kubernetes-style configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfigManifest {
    /// API version (must be "quotad.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "QuotaConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: QuotaConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Manifest body (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfigSpec {
    /// Process-wide default limits, used where no override exists
    #[serde(default)]
    pub defaults: DefaultLimits,

    #[serde(default)]
    pub reservations: ReservationConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,

    /// Projects known at startup
    #[serde(default)]
    pub projects: Vec<String>,
}

/// Default limit per resource; -1 means unlimited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultLimits {
    #[serde(default = "default_shares")]
    pub shares: i64,
    #[serde(default = "default_gigabytes")]
    pub gigabytes: i64,
    #[serde(default = "default_snapshots")]
    pub snapshots: i64,
    #[serde(default = "default_gigabytes")]
    pub snapshot_gigabytes: i64,
    #[serde(default = "default_share_networks")]
    pub share_networks: i64,
    #[serde(default = "default_share_groups")]
    pub share_groups: i64,
    #[serde(default = "default_share_groups")]
    pub share_group_snapshots: i64,
}

impl DefaultLimits {
    pub fn get(&self, resource: ResourceKind) -> i64 {
        match resource {
            ResourceKind::Shares => self.shares,
            ResourceKind::Gigabytes => self.gigabytes,
            ResourceKind::Snapshots => self.snapshots,
            ResourceKind::SnapshotGigabytes => self.snapshot_gigabytes,
            ResourceKind::ShareNetworks => self.share_networks,
            ResourceKind::ShareGroups => self.share_groups,
            ResourceKind::ShareGroupSnapshots => self.share_group_snapshots,
        }
    }

    pub fn to_quota_set(&self) -> QuotaSet {
        ResourceKind::ALL
            .into_iter()
            .map(|resource| (resource, self.get(resource)))
            .collect()
    }
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            shares: default_shares(),
            gigabytes: default_gigabytes(),
            snapshots: default_snapshots(),
            snapshot_gigabytes: default_gigabytes(),
            share_networks: default_share_networks(),
            share_groups: default_share_groups(),
            share_group_snapshots: default_share_groups(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Age after which a held reservation is rolled back by the sweeper
    #[serde(default = "default_expire", with = "humantime_serde")]
    pub expire: Duration,

    /// How often the sweeper runs
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Compare-and-swap attempts before a counter update gives up
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            expire: default_expire(),
            sweep_interval: default_sweep_interval(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// PostgreSQL connection string (required for the postgres backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Memory,
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl StorageConfig {
    pub fn to_backend(&self) -> anyhow::Result<StorageBackend> {
        match self.backend {
            StorageBackendKind::Memory => Ok(StorageBackend::InMemory),
            StorageBackendKind::Postgres => {
                let connection_string = self
                    .database_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("spec.storage.database_url is required for the postgres backend"))?;
                Ok(StorageBackend::PostgreSQL(PostgresConfig {
                    connection_string,
                    max_connections: self.max_connections,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_shares() -> i64 {
    50
}

fn default_gigabytes() -> i64 {
    1000
}

fn default_snapshots() -> i64 {
    50
}

fn default_share_networks() -> i64 {
    10
}

fn default_share_groups() -> i64 {
    50
}

fn default_expire() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_cas_retries() -> u32 {
    8
}

fn default_max_connections() -> u32 {
    5
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8786
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for QuotaConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "quotad".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: QuotaConfigSpec::default(),
        }
    }
}

impl QuotaConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. QUOTAD_CONFIG_PATH environment variable
    /// 2. ./quotad-config.yaml (working directory)
    /// 3. ~/.quotad/config.yaml (user home)
    /// 4. /etc/quotad/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("QUOTAD_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./quotad-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".quotad").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/quotad/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("QUOTAD_RESERVATION_EXPIRE_SECONDS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    tracing::info!("Environment override: QUOTAD_RESERVATION_EXPIRE_SECONDS={}", secs);
                    self.spec.reservations.expire = Duration::from_secs(secs);
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for QUOTAD_RESERVATION_EXPIRE_SECONDS: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(url) = std::env::var("QUOTAD_DATABASE_URL") {
            tracing::info!("Environment override: QUOTAD_DATABASE_URL set, using postgres backend");
            self.spec.storage.backend = StorageBackendKind::Postgres;
            self.spec.storage.database_url = Some(url);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        for resource in ResourceKind::ALL {
            let limit = self.spec.defaults.get(resource);
            if limit < UNLIMITED {
                anyhow::bail!(
                    "spec.defaults.{} is {}; limits must be -1 (unlimited) or greater",
                    resource,
                    limit
                );
            }
        }

        let reservations = &self.spec.reservations;
        if reservations.expire.is_zero() {
            anyhow::bail!("spec.reservations.expire must be greater than zero");
        }
        if reservations.sweep_interval.is_zero() {
            anyhow::bail!("spec.reservations.sweep_interval must be greater than zero");
        }
        if reservations.max_cas_retries == 0 {
            anyhow::bail!("spec.reservations.max_cas_retries must be at least 1");
        }

        self.spec.storage.to_backend()?;

        for project in &self.spec.projects {
            if project.trim().is_empty() {
                anyhow::bail!("spec.projects cannot contain empty project ids");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = QuotaConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.defaults.shares, 50);
        assert_eq!(manifest.spec.defaults.gigabytes, 1000);
        assert_eq!(manifest.spec.defaults.share_networks, 10);
        assert_eq!(manifest.spec.reservations.expire, Duration::from_secs(86400));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_defaults_cover_every_resource() {
        let set = DefaultLimits::default().to_quota_set();
        assert_eq!(set.len(), ResourceKind::ALL.len());
        assert_eq!(set[&ResourceKind::SnapshotGigabytes], 1000);
        assert_eq!(set[&ResourceKind::ShareGroupSnapshots], 50);
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
apiVersion: quotad.io/v1
kind: QuotaConfig
metadata:
  name: test-node
spec:
  defaults:
    shares: 10
    gigabytes: -1
  reservations:
    expire: 2h
    sweep_interval: 30s
  projects:
    - proj-a
"#;
        let manifest = QuotaConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "test-node");
        assert_eq!(manifest.spec.defaults.shares, 10);
        assert_eq!(manifest.spec.defaults.gigabytes, UNLIMITED);
        assert_eq!(manifest.spec.defaults.snapshots, 50);
        assert_eq!(manifest.spec.reservations.expire, Duration::from_secs(7200));
        assert_eq!(manifest.spec.reservations.sweep_interval, Duration::from_secs(30));
        assert_eq!(manifest.spec.reservations.max_cas_retries, 8);
        assert_eq!(manifest.spec.projects, vec!["proj-a".to_string()]);
        assert_eq!(manifest.spec.storage.backend, StorageBackendKind::Memory);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotad-config.yaml");

        let mut manifest = QuotaConfigManifest::default();
        manifest.spec.defaults.snapshots = 7;
        manifest.to_yaml_file(&path).unwrap();

        let loaded = QuotaConfigManifest::from_yaml_file(&path).unwrap();
        assert_eq!(loaded.spec.defaults.snapshots, 7);
        assert_eq!(loaded.spec.reservations.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validation() {
        let mut manifest = QuotaConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.defaults.shares = -5;
        assert!(manifest.validate().is_err());
        manifest.spec.defaults.shares = 50;

        manifest.spec.reservations.max_cas_retries = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.reservations.max_cas_retries = 3;

        manifest.spec.storage.backend = StorageBackendKind::Postgres;
        assert!(manifest.validate().is_err());
        manifest.spec.storage.database_url = Some("postgres://localhost/quotad".to_string());
        assert!(manifest.validate().is_ok());
    }
}
