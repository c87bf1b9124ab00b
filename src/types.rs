//! Identifiers and small value types shared across the pool.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Orchestrator-side identity of a worker process (not the OS pid).
    ProcessId,
    "process-"
);
define_id!(
    /// A page (browsing context) hosted by some content worker.
    PageId,
    "page-"
);
define_id!(
    /// A page kept resident for back/forward navigation.
    SuspendedPageId,
    "suspended-"
);
define_id!(
    /// Opaque identity of a data store (session partition).
    DataStoreId,
    "store-"
);
define_id!(PoolId, "pool-");
define_id!(DownloadId, "download-");
define_id!(AutomationSessionId, "automation-");

/// Role of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Content,
    Network,
    Gpu,
    Plugin,
    ServiceWorkerHost,
}

impl ProcessRole {
    /// Roles that host web content and count toward the live process list.
    pub fn is_web_content(self) -> bool {
        matches!(self, Self::Content | Self::ServiceWorkerHost)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Network => "network",
            Self::Gpu => "gpu",
            Self::Plugin => "plugin",
            Self::ServiceWorkerHost => "service-worker-host",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "content" => Ok(Self::Content),
            "network" => Ok(Self::Network),
            "gpu" => Ok(Self::Gpu),
            "plugin" => Ok(Self::Plugin),
            "service-worker-host" | "service_worker_host" => Ok(Self::ServiceWorkerHost),
            _ => Err(format!(
                "Unknown process role: '{}'. Valid options: content, network, gpu, plugin, service-worker-host",
                s
            )),
        }
    }
}

/// Data store handle as seen by the pool.
///
/// The pool never looks inside a data store; it only needs a stable key for
/// cache affinity and to know whether the session is ephemeral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataStore {
    pub id: DataStoreId,
    #[serde(default)]
    pub ephemeral: bool,
}

impl DataStore {
    pub const fn persistent(id: u64) -> Self {
        Self {
            id: DataStoreId(id),
            ephemeral: false,
        }
    }

    pub const fn ephemeral(id: u64) -> Self {
        Self {
            id: DataStoreId(id),
            ephemeral: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(ProcessId(7).to_string(), "process-7");
        assert_eq!(DataStoreId(1).to_string(), "store-1");
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("content".parse::<ProcessRole>().unwrap(), ProcessRole::Content);
        assert_eq!("GPU".parse::<ProcessRole>().unwrap(), ProcessRole::Gpu);
        assert_eq!(
            "service-worker-host".parse::<ProcessRole>().unwrap(),
            ProcessRole::ServiceWorkerHost
        );
        assert!("renderer".parse::<ProcessRole>().is_err());
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&ProcessRole::ServiceWorkerHost).unwrap();
        assert_eq!(json, "\"service_worker_host\"");
        assert!(ProcessRole::Content.is_web_content());
        assert!(!ProcessRole::Network.is_web_content());
    }
}
