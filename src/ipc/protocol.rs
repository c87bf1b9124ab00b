//! Message envelope exchanged between the orchestrator and workers.
//!
//! Every frame on a channel is one [`Envelope`] serialized as a JSON line.
//! The envelope names its receiver (and optionally a destination id within
//! that receiver), the message name, and how the sender expects a reply.

use crate::config::{CacheModel, UrlSchemeRegistration};
use crate::domain::RegistrableDomain;
use crate::error::Result;
use crate::types::{
    AutomationSessionId, DataStore, DownloadId, PageId, ProcessId, ProcessRole,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Receiver names.
pub mod receivers {
    /// Orchestrator-side receiver for messages about the sending worker itself.
    pub const WORKER_PROCESS: &str = "WorkerProcess";
    /// Orchestrator-side receiver for page-scoped messages (destination = page id).
    pub const PAGE: &str = "Page";
    /// Worker-side receiver for process-wide commands.
    pub const PROCESS: &str = "Process";
}

/// Message names.
pub mod names {
    // Orchestrator -> worker
    pub const INITIALIZE: &str = "Initialize";
    pub const LOAD_URL: &str = "LoadUrl";
    pub const CLOSE_PAGE: &str = "ClosePage";
    pub const PREWARM_WITH_DOMAIN_INFORMATION: &str = "PrewarmWithDomainInformation";
    pub const MEMORY_PRESSURE_EVENT: &str = "MemoryPressureEvent";
    pub const GPU_PROCESS_CRASHED: &str = "GpuProcessCrashed";
    pub const ENABLE_SERVICE_WORKERS: &str = "EnableServiceWorkers";
    pub const DISABLE_SERVICE_WORKERS: &str = "DisableServiceWorkers";
    pub const ENSURE_AUTOMATION_SESSION_PROXY: &str = "EnsureAutomationSessionProxy";
    pub const DESTROY_AUTOMATION_SESSION_PROXY: &str = "DestroyAutomationSessionProxy";
    pub const SET_CACHE_MODEL: &str = "SetCacheModel";
    pub const SET_CACHE_MODEL_SYNCHRONOUSLY: &str = "SetCacheModelSynchronously";
    pub const REGISTER_URL_SCHEME: &str = "RegisterUrlScheme";
    pub const DOWNLOAD: &str = "Download";
    pub const ACTIVE_PAGES_ORIGINS: &str = "ActivePagesOrigins";
    pub const PING: &str = "Ping";
    pub const EXIT: &str = "Exit";

    // Worker -> orchestrator
    pub const DID_FINISH_LAUNCHING: &str = "DidFinishLaunching";
    pub const DID_COMMIT_LOAD: &str = "DidCommitLoad";
    pub const DID_COLLECT_PREWARM_INFORMATION: &str = "DidCollectPrewarmInformation";
    pub const STARTED_USING_GAMEPADS: &str = "StartedUsingGamepads";
    pub const STOPPED_USING_GAMEPADS: &str = "StoppedUsingGamepads";
}

/// How a message expects to be answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Fire-and-forget.
    #[default]
    Oneway,
    /// The sender blocks until the reply arrives.
    Sync,
    /// The sender resumes a continuation when the reply arrives.
    Async,
    /// Answer to a sync or async request, matched by `request_id`.
    Reply,
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub receiver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    /// A fire-and-forget message with an empty body.
    pub fn new(receiver: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            destination: None,
            name: name.into(),
            kind: MessageKind::Oneway,
            request_id: None,
            body: Value::Null,
        }
    }

    /// A fire-and-forget message carrying `body`.
    pub fn with_body<T: Serialize>(
        receiver: impl Into<String>,
        name: impl Into<String>,
        body: &T,
    ) -> Result<Self> {
        let mut envelope = Self::new(receiver, name);
        envelope.body = serde_json::to_value(body)?;
        Ok(envelope)
    }

    /// Scope the message to a destination within its receiver.
    pub fn to_destination(mut self, destination: u64) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Build the reply to this request.
    pub fn reply(&self, body: Value) -> Self {
        Self {
            receiver: self.receiver.clone(),
            destination: self.destination,
            name: self.name.clone(),
            kind: MessageKind::Reply,
            request_id: self.request_id,
            body,
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(self.kind, MessageKind::Sync | MessageKind::Async)
    }

    /// Decode the body into a typed payload.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Serialize to a single JSON line (without newline).
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Role-specific configuration sent in `Initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializationParameters {
    pub process_id: Option<ProcessId>,
    pub role: Option<ProcessRole>,
    pub sandbox_profile: Option<String>,
    pub additional_read_access_paths: Vec<PathBuf>,
    pub additional_read_write_paths: Vec<PathBuf>,
    pub feature_flags: BTreeMap<String, bool>,
    pub url_schemes: Vec<UrlSchemeRegistration>,
    pub cache_model: CacheModel,
    pub languages: Vec<String>,
    pub prewarmed: bool,
    pub data_store: Option<DataStore>,
    /// Role-specific extras (e.g. the plugin path for plugin workers).
    pub extra: BTreeMap<String, String>,
}

/// Handshake sent by a worker once it is ready for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidFinishLaunching {
    pub pid: u32,
    pub role: ProcessRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadUrl {
    pub page: PageId,
    pub url: String,
    pub data_store: DataStore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePage {
    pub page: PageId,
}

/// Sent to the orchestrator's `Page` receiver, scoped to the committing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidCommitLoad {
    pub url: String,
}

/// Warm-up hints a worker gathered while serving a registrable domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewarmInformation {
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPrewarmInformation {
    pub domain: RegistrableDomain,
    pub information: PrewarmInformation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPressureEvent {
    pub critical: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCacheModel {
    pub model: CacheModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationSessionProxy {
    pub session: AutomationSessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub id: DownloadId,
    pub data_store: DataStore,
    pub url: String,
    pub suggested_filename: Option<String>,
}
