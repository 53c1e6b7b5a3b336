use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for callhook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Shared in-process cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Tool-call answering configuration
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Persistence gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Price table and service areas
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path segment the voice platform posts events to
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,

    /// How long shutdown waits for pending background writes
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8787
}

fn default_webhook_path() -> String {
    "webhook".to_string()
}

const fn default_drain_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_path: default_webhook_path(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".callhook/callhook.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    /// Maximum number of live entries before LRU eviction
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// TTL applied when a caller does not pass one
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

const fn default_cache_capacity() -> usize {
    500
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            default_ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub const fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Tool-call answering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ToolsConfig {
    /// How long a computed tool result stays cached
    #[serde(default = "default_tool_ttl_secs")]
    pub result_ttl_secs: u64,

    /// Number of business days offered by the availability lookup
    #[serde(default = "default_availability_days")]
    pub availability_days: u32,
}

const fn default_tool_ttl_secs() -> u64 {
    3600
}

const fn default_availability_days() -> u32 {
    3
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            result_ttl_secs: default_tool_ttl_secs(),
            availability_days: default_availability_days(),
        }
    }
}

impl ToolsConfig {
    pub const fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// Persistence gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GatewayConfig {
    /// TTL of cached read results
    #[serde(default = "default_read_ttl_secs")]
    pub read_ttl_secs: u64,

    /// Page size used when a request does not set one
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Maximum rows the in-process aggregation fallback will fold
    #[serde(default = "default_aggregate_row_ceiling")]
    pub aggregate_row_ceiling: usize,

    /// Number of query metrics retained for diagnostics
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
}

const fn default_read_ttl_secs() -> u64 {
    60
}

const fn default_page_size() -> usize {
    50
}

const fn default_aggregate_row_ceiling() -> usize {
    10_000
}

const fn default_metrics_capacity() -> usize {
    100
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            read_ttl_secs: default_read_ttl_secs(),
            default_page_size: default_page_size(),
            aggregate_row_ceiling: default_aggregate_row_ceiling(),
            metrics_capacity: default_metrics_capacity(),
        }
    }
}

impl GatewayConfig {
    pub const fn read_ttl(&self) -> Duration {
        Duration::from_secs(self.read_ttl_secs)
    }
}

/// A postal-code prefix served by the company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceArea {
    /// Postal-code prefix, upper case, no spaces
    pub prefix: String,
    /// Human-readable region name
    pub region: String,
    /// Whether interventions in this area carry the travel surcharge
    #[serde(default)]
    pub surcharge: bool,
}

impl ServiceArea {
    fn new(prefix: &str, region: &str, surcharge: bool) -> Self {
        Self {
            prefix: prefix.to_string(),
            region: region.to_string(),
            surcharge,
        }
    }
}

/// Price table and geography used by the tool-call answers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PricingConfig {
    /// Base rate per service type, in whole dollars
    #[serde(default = "default_base_rates")]
    pub base_rates: BTreeMap<String, u32>,

    /// Flat fee added for far-zone interventions, in whole dollars
    #[serde(default = "default_surcharge")]
    pub surcharge: u32,

    /// Locality names that always carry the surcharge
    #[serde(default = "default_far_zones")]
    pub far_zones: Vec<String>,

    /// Served postal-code prefixes
    #[serde(default = "default_service_areas")]
    pub service_areas: Vec<ServiceArea>,
}

fn default_base_rates() -> BTreeMap<String, u32> {
    [
        ("debouchage", 350),
        ("inspection", 295),
        ("nettoyage", 450),
        ("urgence", 550),
        ("installation", 650),
    ]
    .into_iter()
    .map(|(service, rate)| (service.to_string(), rate))
    .collect()
}

const fn default_surcharge() -> u32 {
    75
}

fn default_far_zones() -> Vec<String> {
    ["saint-jerome", "joliette", "granby", "saint-hyacinthe"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_service_areas() -> Vec<ServiceArea> {
    vec![
        ServiceArea::new("H", "Montréal", false),
        ServiceArea::new("H7", "Laval", false),
        ServiceArea::new("J4", "Rive-Sud", false),
        ServiceArea::new("J5", "Rive-Sud", false),
        ServiceArea::new("J7", "Rive-Nord", false),
        ServiceArea::new("J7Z", "Saint-Jérôme", true),
        ServiceArea::new("J6E", "Joliette", true),
        ServiceArea::new("J2G", "Granby", true),
        ServiceArea::new("J2S", "Saint-Hyacinthe", true),
    ]
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_rates: default_base_rates(),
            surcharge: default_surcharge(),
            far_zones: default_far_zones(),
            service_areas: default_service_areas(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rotation of file output: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
