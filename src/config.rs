//! Pool configuration.
//!
//! A [`PoolConfiguration`] is fixed when a pool is created, apart from the few
//! settings the pool exposes setters for (swap-on-navigation, cache model).
//! Platform and feature variation is expressed through [`Capabilities`]
//! rather than compile-time switches.
//!
//! # Environment Variables
//!
//! - `SITEPOOL_PROCESS_SWAP` - Enable/disable process swap on navigation
//! - `SITEPOOL_SINGLE_PROCESS` - Force single content process mode
//! - `SITEPOOL_CACHE_MODEL` - document-viewer, document-browser, primary-web-browser
//! - `SITEPOOL_PROCESS_CACHE_SIZE` - Explicit Process Cache capacity

use crate::error::{PoolError, Result};
use crate::types::DataStoreId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on cached processes regardless of memory size.
const MAXIMUM_DERIVED_PROCESS_CACHE_SIZE: usize = 30;

/// Cache sizing policy of the embedding application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheModel {
    /// Viewer of local documents: no caching.
    DocumentViewer,
    /// Browser of documents with modest caching.
    DocumentBrowser,
    /// Full web browser (default).
    #[default]
    PrimaryWebBrowser,
}

impl CacheModel {
    /// Number of suspended pages kept for back/forward navigation.
    pub fn back_forward_capacity(self, system_memory_mib: u64) -> usize {
        match self {
            Self::DocumentViewer => 0,
            Self::DocumentBrowser => usize::from(system_memory_mib >= 512),
            Self::PrimaryWebBrowser => {
                if system_memory_mib >= 512 {
                    2
                } else if system_memory_mib >= 256 {
                    1
                } else {
                    0
                }
            }
        }
    }

    /// Number of idle processes worth keeping warm, by installed memory.
    pub fn process_cache_capacity(self, system_memory_mib: u64) -> usize {
        if self != Self::PrimaryWebBrowser {
            return 0;
        }
        let gib = (system_memory_mib / 1024) as usize;
        if gib < 3 {
            return 0;
        }
        (gib * 2).min(MAXIMUM_DERIVED_PROCESS_CACHE_SIZE)
    }
}

impl FromStr for CacheModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "document-viewer" => Ok(Self::DocumentViewer),
            "document-browser" => Ok(Self::DocumentBrowser),
            "primary-web-browser" => Ok(Self::PrimaryWebBrowser),
            _ => Err(format!(
                "Unknown cache model: '{}'. Valid options: document-viewer, document-browser, primary-web-browser",
                s
            )),
        }
    }
}

/// Special handling registered for a URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSchemeKind {
    EmptyDocument,
    Secure,
    BypassingContentSecurityPolicy,
    Local,
    NoAccess,
    DisplayIsolated,
    CorsEnabled,
    CachePartitioned,
}

/// A URL scheme registration forwarded to every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlSchemeRegistration {
    pub scheme: String,
    pub kind: UrlSchemeKind,
}

/// Platform and feature capabilities, resolved once per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Workers are sandboxed against the primary data store, so a prewarmed
    /// process cannot be handed to another store.
    pub sandbox_enabled: bool,
    /// Several data stores may coexist; single-process reuse must match the
    /// store exactly.
    pub multiple_data_stores: bool,
    pub gpu_process: bool,
    pub gamepads: bool,
    pub service_workers: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            sandbox_enabled: false,
            multiple_data_stores: true,
            gpu_process: true,
            gamepads: true,
            service_workers: true,
        }
    }
}

/// Configuration for a process pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfiguration {
    /// Swap processes on cross-site navigation.
    pub process_swaps_on_navigation: bool,
    /// Allow swapping for windows opened by script that kept their opener.
    pub process_swaps_on_window_open_with_opener: bool,
    /// Host every page in a single content process.
    pub uses_single_process: bool,
    /// Keep swapped-away pages resident for back/forward navigation.
    pub uses_back_forward_cache: bool,
    /// Explicit back/forward capacity (derived from the cache model when unset).
    pub back_forward_cache_capacity: Option<usize>,
    /// Keep idle processes warm for repeat visits.
    pub uses_process_cache: bool,
    /// Explicit Process Cache capacity (derived from the cache model when unset).
    pub maximum_process_cache_size: Option<usize>,
    /// How long an idle process may sit in the Process Cache.
    #[serde(with = "duration_ms")]
    pub cached_process_lifetime: Duration,
    pub cache_model: CacheModel,
    /// Automatic prewarming; `None` lets the pool decide.
    pub automatic_process_warming: Option<bool>,
    /// Delay between "good time to prewarm" and the actual launch.
    #[serde(with = "duration_ms")]
    pub prewarm_delay: Duration,
    /// Debug/testing mode: never terminate swapped-out processes and reuse them
    /// per registrable domain.
    pub always_keep_and_reuse_swapped_processes: bool,
    /// Start with process termination disabled until
    /// `enable_process_termination` is called.
    pub process_termination_grace: bool,
    pub ignore_synchronous_messaging_timeouts_for_testing: bool,
    #[serde(with = "duration_ms")]
    pub sync_message_timeout: Duration,
    pub use_separate_service_worker_process: bool,
    /// Minimum spacing between two memory-pressure warnings.
    #[serde(with = "duration_ms")]
    pub memory_pressure_debounce: Duration,
    /// The store used by prewarmed processes before they are assigned.
    pub primary_data_store: DataStoreId,
    pub sandbox_profile: Option<String>,
    pub additional_read_access_paths: Vec<PathBuf>,
    pub additional_read_write_paths: Vec<PathBuf>,
    pub languages: Vec<String>,
    pub feature_flags: BTreeMap<String, bool>,
    pub url_schemes: Vec<UrlSchemeRegistration>,
    pub capabilities: Capabilities,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            process_swaps_on_navigation: true,
            process_swaps_on_window_open_with_opener: false,
            uses_single_process: false,
            uses_back_forward_cache: true,
            back_forward_cache_capacity: None,
            uses_process_cache: true,
            maximum_process_cache_size: None,
            cached_process_lifetime: Duration::from_secs(30 * 60),
            cache_model: CacheModel::PrimaryWebBrowser,
            automatic_process_warming: None,
            prewarm_delay: Duration::from_millis(100),
            always_keep_and_reuse_swapped_processes: false,
            process_termination_grace: false,
            ignore_synchronous_messaging_timeouts_for_testing: false,
            sync_message_timeout: Duration::from_secs(10),
            use_separate_service_worker_process: false,
            memory_pressure_debounce: Duration::from_secs(5),
            primary_data_store: DataStoreId(0),
            sandbox_profile: None,
            additional_read_access_paths: Vec::new(),
            additional_read_write_paths: Vec::new(),
            languages: vec!["en-US".to_string()],
            feature_flags: BTreeMap::new(),
            url_schemes: Vec::new(),
            capabilities: Capabilities::default(),
        }
    }
}

impl PoolConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file; missing fields keep defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PoolError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_process_swaps_on_navigation(mut self, enabled: bool) -> Self {
        self.process_swaps_on_navigation = enabled;
        self
    }

    pub fn with_single_process(mut self, enabled: bool) -> Self {
        self.uses_single_process = enabled;
        self
    }

    pub fn with_back_forward_cache(mut self, enabled: bool) -> Self {
        self.uses_back_forward_cache = enabled;
        self
    }

    pub fn with_process_cache_size(mut self, capacity: usize) -> Self {
        self.maximum_process_cache_size = Some(capacity);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(enabled) = env_bool("SITEPOOL_PROCESS_SWAP") {
            self.process_swaps_on_navigation = enabled;
        }
        if let Some(enabled) = env_bool("SITEPOOL_SINGLE_PROCESS") {
            self.uses_single_process = enabled;
        }
        if let Ok(model) = std::env::var("SITEPOOL_CACHE_MODEL")
            && let Ok(model) = model.parse()
        {
            self.cache_model = model;
        }
        if let Ok(size) = std::env::var("SITEPOOL_PROCESS_CACHE_SIZE")
            && let Ok(size) = size.trim().parse()
        {
            self.maximum_process_cache_size = Some(size);
        }
        self
    }

    /// Reject combinations the pool cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.sync_message_timeout.is_zero()
            && !self.ignore_synchronous_messaging_timeouts_for_testing
        {
            return Err(PoolError::Config(
                "sync_message_timeout must be non-zero unless timeouts are ignored".into(),
            ));
        }
        if self.url_schemes.iter().any(|r| r.scheme.trim().is_empty()) {
            return Err(PoolError::Config("URL scheme registrations need a scheme".into()));
        }
        Ok(())
    }

    /// Process Cache capacity for the current settings.
    ///
    /// Caching is only profitable when processes are swapped on navigation.
    pub fn process_cache_capacity(&self, system_memory_mib: u64) -> usize {
        if !self.process_swaps_on_navigation
            || !self.uses_process_cache
            || self.uses_single_process
            || self.cache_model != CacheModel::PrimaryWebBrowser
        {
            return 0;
        }
        self.maximum_process_cache_size
            .unwrap_or_else(|| self.cache_model.process_cache_capacity(system_memory_mib))
    }

    /// Back/forward retention capacity for the current settings.
    pub fn back_forward_capacity(&self, system_memory_mib: u64) -> usize {
        if !self.uses_back_forward_cache {
            return 0;
        }
        self.back_forward_cache_capacity
            .unwrap_or_else(|| self.cache_model.back_forward_capacity(system_memory_mib))
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Durations as integer milliseconds in JSON.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = PoolConfiguration::default();
        assert!(config.process_swaps_on_navigation);
        assert!(!config.uses_single_process);
        assert_eq!(config.cache_model, CacheModel::PrimaryWebBrowser);
        assert_eq!(config.cached_process_lifetime, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_process_cache_capacity_requires_swapping() {
        let config = PoolConfiguration::default().with_process_cache_size(4);
        assert_eq!(config.process_cache_capacity(16 * 1024), 4);

        let disabled = config.clone().with_process_swaps_on_navigation(false);
        assert_eq!(disabled.process_cache_capacity(16 * 1024), 0);

        let single = config.with_single_process(true);
        assert_eq!(single.process_cache_capacity(16 * 1024), 0);
    }

    #[test]
    fn test_derived_capacities() {
        assert_eq!(CacheModel::PrimaryWebBrowser.process_cache_capacity(2 * 1024), 0);
        assert_eq!(CacheModel::PrimaryWebBrowser.process_cache_capacity(8 * 1024), 16);
        assert_eq!(CacheModel::PrimaryWebBrowser.process_cache_capacity(64 * 1024), 30);
        assert_eq!(CacheModel::DocumentBrowser.process_cache_capacity(64 * 1024), 0);

        assert_eq!(CacheModel::PrimaryWebBrowser.back_forward_capacity(8 * 1024), 2);
        assert_eq!(CacheModel::DocumentBrowser.back_forward_capacity(8 * 1024), 1);
        assert_eq!(CacheModel::DocumentViewer.back_forward_capacity(8 * 1024), 0);
    }

    #[test]
    fn test_cache_model_from_str() {
        assert_eq!(
            "primary-web-browser".parse::<CacheModel>().unwrap(),
            CacheModel::PrimaryWebBrowser
        );
        assert_eq!(
            "DOCUMENT_VIEWER".parse::<CacheModel>().unwrap(),
            CacheModel::DocumentViewer
        );
        assert!("huge".parse::<CacheModel>().is_err());
    }

    #[test]
    fn test_from_json_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"uses_single_process": true, "maximum_process_cache_size": 1, "prewarm_delay": 5, "cache_model": "document-browser"}}"#
        )
        .unwrap();

        let config = PoolConfiguration::from_json_file(file.path()).unwrap();
        assert!(config.uses_single_process);
        assert_eq!(config.maximum_process_cache_size, Some(1));
        assert_eq!(config.prewarm_delay, Duration::from_millis(5));
        assert_eq!(config.cache_model, CacheModel::DocumentBrowser);
        // Unspecified fields keep their defaults.
        assert!(config.uses_back_forward_cache);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = PoolConfiguration {
            sync_message_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let ignored = PoolConfiguration {
            sync_message_timeout: Duration::ZERO,
            ignore_synchronous_messaging_timeouts_for_testing: true,
            ..Default::default()
        };
        assert!(ignored.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = PoolConfiguration::from_json_file("/nonexistent/sitepool.json").unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }
}
