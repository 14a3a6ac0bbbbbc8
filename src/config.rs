// src/config.rs

//! Manages server configuration: loading, defaults, and validation.

use crate::core::permissions::{FieldRule, PermissionRule};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for the per-session coalescing writer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WriterSection {
    /// One of `conservative`, `balanced`, `high_throughput`, `aggressive`.
    #[serde(default = "default_writer_preset")]
    pub preset: String,
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            preset: default_writer_preset(),
        }
    }
}

fn default_writer_preset() -> String {
    "balanced".to_string()
}

/// Connection admission limits.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_connections_per_second")]
    pub max_connections_per_second: usize,
    #[serde(default = "default_max_pending_connections")]
    pub max_pending_connections: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections_per_second: default_max_connections_per_second(),
            max_pending_connections: default_max_pending_connections(),
        }
    }
}

fn default_max_connections_per_second() -> usize {
    500
}
fn default_max_pending_connections() -> usize {
    1000
}

/// Heartbeat reaper settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde", default = "default_heartbeat_check_interval")]
    pub check_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_heartbeat_timeout")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: default_heartbeat_check_interval(),
            timeout: default_heartbeat_timeout(),
        }
    }
}

fn default_heartbeat_check_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(20)
}

/// Cluster topology settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
    /// Static peer ids for in-process transports; the external transport
    /// keeps the live view current.
    #[serde(default)]
    pub seed_members: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            partition_count: default_partition_count(),
            backup_count: default_backup_count(),
            seed_members: Vec::new(),
        }
    }
}

fn default_partition_count() -> u32 {
    271
}
fn default_backup_count() -> usize {
    1
}

/// GC consensus cadence and tombstone age.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GcConfig {
    #[serde(with = "humantime_serde", default = "default_gc_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_gc_age")]
    pub age: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: default_gc_interval(),
            age: default_gc_age(),
        }
    }
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_gc_age() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

/// Write pipeline backpressure and write-concern settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_pending_ops")]
    pub max_pending_ops: usize,
    /// Above this pending depth, batches are drained synchronously.
    #[serde(default = "default_force_sync_threshold")]
    pub force_sync_threshold: usize,
    #[serde(with = "humantime_serde", default = "default_write_concern_timeout")]
    pub write_concern_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_capacity_wait")]
    pub capacity_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pending_ops: default_max_pending_ops(),
            force_sync_threshold: default_force_sync_threshold(),
            write_concern_timeout: default_write_concern_timeout(),
            capacity_wait: default_capacity_wait(),
        }
    }
}

fn default_max_pending_ops() -> usize {
    50_000
}
fn default_force_sync_threshold() -> usize {
    40_000
}
fn default_write_concern_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_capacity_wait() -> Duration {
    Duration::from_secs(2)
}

/// Query engine settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueryConfig {
    #[serde(with = "humantime_serde", default = "default_cluster_query_timeout")]
    pub cluster_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_cursor_max_age")]
    pub cursor_max_age: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cluster_timeout: default_cluster_query_timeout(),
            cursor_max_age: default_cursor_max_age(),
        }
    }
}

fn default_cluster_query_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_cursor_max_age() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Change journal settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_journal_capacity")]
    pub capacity: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: default_journal_capacity(),
        }
    }
}

fn default_journal_capacity() -> usize {
    10_000
}

/// Full-text search settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SearchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Maps to index; empty means every map.
    #[serde(default)]
    pub maps: Vec<String>,
}

/// Permission rules and field-level filters.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
    #[serde(default)]
    pub field_rules: Vec<FieldRule>,
}

/// Optional HTTP facade.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// `None` answers CORS preflights with `*`.
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_http_port(),
            cors_allowed_origin: None,
        }
    }
}

fn default_http_port() -> u16 {
    8980
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8978
}

/// Optional TLS for the client listener.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// The complete server configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Stable node identity; generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer-token verification secret. A value beginning with
    /// `-----BEGIN` selects RSA public-key verification; anything else is
    /// used as a symmetric HMAC secret.
    #[serde(default)]
    pub auth_secret: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When set, only these map name patterns are served.
    #[serde(default)]
    pub allowed_maps: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub enable_mutations: bool,
    #[serde(default = "default_true")]
    pub enable_subscriptions: bool,
    #[serde(default)]
    pub writer: WriterSection,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8970
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes from defaults")
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from `path` when it exists, otherwise starts from defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.cluster.partition_count > 0,
            "cluster.partition_count must be positive"
        );
        anyhow::ensure!(
            self.pipeline.force_sync_threshold <= self.pipeline.max_pending_ops,
            "pipeline.force_sync_threshold must not exceed pipeline.max_pending_ops"
        );
        if self.tls.enabled {
            anyhow::ensure!(
                self.tls.cert_file.is_some() && self.tls.key_file.is_some(),
                "tls.cert_file and tls.key_file are required when TLS is enabled"
            );
        }
        Ok(())
    }

    /// The effective node id, generating a stable-for-this-process one when
    /// not configured.
    pub fn effective_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()))
    }
}

