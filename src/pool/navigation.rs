//! Navigation requests and the outcome of process selection.

use crate::types::{ProcessId, SuspendedPageId};
use serde::Serialize;
use std::fmt;
use url::Url;

/// The back/forward history entry a navigation targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackForwardItem {
    /// Suspended page kept for this entry, if it is still around.
    pub suspended_page: Option<SuspendedPageId>,
    /// Process that last served this entry.
    pub process: Option<ProcessId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationRequest {
    pub target_url: Url,
    /// The client asked for a fresh process.
    pub requested_swap: bool,
    pub back_forward_item: Option<BackForwardItem>,
    /// The embedder vouches that the target is same-origin with the source.
    pub same_origin_marker: bool,
}

impl NavigationRequest {
    pub fn new(target_url: Url) -> Self {
        Self {
            target_url,
            requested_swap: false,
            back_forward_item: None,
            same_origin_marker: false,
        }
    }

    pub fn with_requested_swap(mut self, requested: bool) -> Self {
        self.requested_swap = requested;
        self
    }

    pub fn with_back_forward_item(mut self, item: BackForwardItem) -> Self {
        self.back_forward_item = Some(item);
        self
    }

    pub fn with_same_origin_marker(mut self, marker: bool) -> Self {
        self.same_origin_marker = marker;
        self
    }
}

/// Why the selector picked the process it picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionReason {
    SingleProcess,
    ClientRequestedSwap,
    SwapDisabled,
    AutomationSession,
    NoCommittedLoad,
    ScriptRelatedWindow,
    BackForwardSuspendedPage,
    BackForwardProcess,
    SameOriginMarker,
    SameSite,
    CrossSite,
    /// The source process was unusable; a new one was selected by domain.
    SourceProcessTerminated,
}

impl SelectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleProcess => "single-process",
            Self::ClientRequestedSwap => "client-requested-swap",
            Self::SwapDisabled => "swap-disabled",
            Self::AutomationSession => "automation-session",
            Self::NoCommittedLoad => "no-committed-load",
            Self::ScriptRelatedWindow => "script-related-window",
            Self::BackForwardSuspendedPage => "back-forward-suspended-page",
            Self::BackForwardProcess => "back-forward-process",
            Self::SameOriginMarker => "same-origin-marker",
            Self::SameSite => "same-site",
            Self::CrossSite => "cross-site",
            Self::SourceProcessTerminated => "source-process-terminated",
        }
    }
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the selected process came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessSource {
    /// The page's current process.
    Source,
    Cache,
    SuspendedPage,
    Prewarmed,
    Spawned,
    /// An existing live process matched in single-process mode.
    LiveProcess,
    /// Debug retention of swapped-out processes.
    RetainedSwapped,
    BackForwardProcess,
}

/// Outcome of [`super::ProcessPool::navigate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationResult {
    pub process: ProcessId,
    pub previous_process: ProcessId,
    pub swapped: bool,
    pub reason: SelectionReason,
    pub source: ProcessSource,
    /// The page left behind in the previous process.
    pub suspended_page_created: Option<SuspendedPageId>,
    /// The suspended page this navigation resumed.
    pub suspended_page_used: Option<SuspendedPageId>,
}
