//! Process Selector: which process serves a navigation.
//!
//! [`decide`] is the pure precedence walk; the pool gathers its inputs and
//! carries out the decision. Domain-based selection lives here too because it
//! is the fallback every cross-site decision ends in.

use super::ProcessPool;
use super::navigation::{ProcessSource, SelectionReason};
use crate::domain::RegistrableDomain;
use crate::error::{PoolError, Result};
use crate::types::{DataStore, ProcessId, ProcessRole, SuspendedPageId};
use url::Url;

/// Everything the precedence walk looks at.
#[derive(Debug, Clone)]
pub struct SelectionInputs<'a> {
    pub single_process: bool,
    pub requested_swap: bool,
    pub swap_on_navigation: bool,
    pub automation_session: bool,
    pub source_has_committed_load: bool,
    /// Opened by script with an opener, or has opened windows itself.
    pub script_related_window: bool,
    /// Suspended page of the target history item, if still retained.
    pub valid_suspended_page: Option<SuspendedPageId>,
    /// Process of the target history item, if still alive.
    pub live_history_process: Option<ProcessId>,
    pub same_origin_marker: bool,
    /// Last committed URL of the page, if any.
    pub source_url: Option<&'a Url>,
    pub target_url: &'a Url,
    /// Debug retention hit for the target domain and data store.
    pub retained_swapped_process: Option<ProcessId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ReuseSource(SelectionReason),
    UseSuspendedPage(SuspendedPageId),
    UseHistoryProcess(ProcessId),
    UseRetainedProcess(ProcessId),
    SelectByDomain(SelectionReason),
}

/// Walk the selection precedence. First match wins.
pub fn decide(inputs: &SelectionInputs<'_>) -> Decision {
    use Decision::*;
    use SelectionReason::*;

    if inputs.single_process {
        return ReuseSource(SingleProcess);
    }
    if inputs.requested_swap {
        return SelectByDomain(ClientRequestedSwap);
    }
    if !inputs.swap_on_navigation {
        return ReuseSource(SwapDisabled);
    }
    if inputs.automation_session {
        return ReuseSource(AutomationSession);
    }
    if !inputs.source_has_committed_load {
        return ReuseSource(NoCommittedLoad);
    }
    if inputs.script_related_window {
        return ReuseSource(ScriptRelatedWindow);
    }
    if let Some(suspended) = inputs.valid_suspended_page {
        return UseSuspendedPage(suspended);
    }
    if let Some(process) = inputs.live_history_process {
        return UseHistoryProcess(process);
    }
    if inputs.same_origin_marker {
        return ReuseSource(SameOriginMarker);
    }
    if is_same_site(inputs.source_url, inputs.target_url) {
        return ReuseSource(SameSite);
    }
    match inputs.retained_swapped_process {
        Some(process) => UseRetainedProcess(process),
        None => SelectByDomain(CrossSite),
    }
}

/// Same-site check. A missing or `about:` source counts as same-site.
pub fn is_same_site(source: Option<&Url>, target: &Url) -> bool {
    match source {
        None => true,
        Some(source) if source.scheme() == "about" => true,
        Some(source) => RegistrableDomain::from_url(source).matches(target),
    }
}

impl ProcessPool {
    /// Domain-based selection: cache, then suspended page, then the prewarmed
    /// process, then a new or (single-process) matching live process.
    ///
    /// Cached and suspended-page processes equal to `source` are skipped, so a
    /// swap never lands back on the process the page is leaving.
    pub fn process_for_registrable_domain(
        &mut self,
        data_store: DataStore,
        domain: &RegistrableDomain,
        source: Option<ProcessId>,
    ) -> Result<(ProcessId, ProcessSource)> {
        let cached_source = source.is_some_and(|source| {
            self.cache.entries().any(|e| {
                e.process == source && e.domain == *domain && e.data_store == data_store.id
            })
        });
        let cached = if cached_source {
            None
        } else {
            self.cache.take(domain, data_store.id)
        };
        if let Some(process) = cached {
            self.arena.release(process);
            if self.is_usable(process) {
                self.stats.cache_hits += 1;
                tracing::debug!(process_id = %process, domain = %domain, "Using cached process");
                return Ok((process, ProcessSource::Cache));
            }
            tracing::debug!(process_id = %process, "Cached process is gone");
        } else if !domain.is_empty() && self.cache.capacity() > 0 {
            self.stats.cache_misses += 1;
        }

        if let Some(suspended) = self.back_forward.take_for_domain(domain, data_store.id, source) {
            let process = suspended.process;
            self.discard_suspended_page(suspended, true);
            if self.is_usable(process) {
                tracing::debug!(process_id = %process, domain = %domain, "Using suspended page process");
                return Ok((process, ProcessSource::SuspendedPage));
            }
        }

        if let Some(process) = self.take_prewarmed_process(data_store) {
            if let Some(worker) = self.arena.get_mut(process) {
                worker.prewarmed = false;
                worker.data_store = Some(data_store);
            }
            self.forward_prewarm_information(process, domain);
            tracing::debug!(process_id = %process, domain = %domain, "Using prewarmed process");
            return Ok((process, ProcessSource::Prewarmed));
        }

        if self.config.uses_single_process {
            let exact = self.config.capabilities.multiple_data_stores;
            let existing = self.live.iter().copied().find(|id| {
                self.arena.get(*id).is_some_and(|p| {
                    p.role() == ProcessRole::Content
                        && p.is_usable()
                        && (!exact || p.data_store().map(|s| s.id) == Some(data_store.id))
                })
            });
            if let Some(process) = existing {
                return Ok((process, ProcessSource::LiveProcess));
            }
        }

        let process = self.spawn_content_process(data_store)?;
        Ok((process, ProcessSource::Spawned))
    }

    /// Take the prewarmed process if it may serve `data_store`.
    fn take_prewarmed_process(&mut self, data_store: DataStore) -> Option<ProcessId> {
        let process = self.prewarmed?;
        if !self.is_usable(process) {
            self.prewarmed = None;
            return None;
        }
        // Sandboxed prewarmed processes are bound to the primary store.
        if self.config.capabilities.sandbox_enabled && data_store.id != self.config.primary_data_store {
            return None;
        }
        self.prewarmed = None;
        self.prewarm_timer.stop();
        Some(process)
    }

    /// Launch a content process, retrying once before giving up.
    fn spawn_content_process(&mut self, data_store: DataStore) -> Result<ProcessId> {
        match self.create_worker_process(ProcessRole::Content, Some(data_store), false) {
            Ok(process) => Ok(process),
            Err(first) => {
                tracing::warn!(error = %first, "Content process launch failed, retrying");
                self.create_worker_process(ProcessRole::Content, Some(data_store), false)
                    .map_err(|e| {
                        tracing::error!(error = %e, "Content process launch failed again");
                        PoolError::LaunchFailed {
                            role: ProcessRole::Content,
                            attempts: 2,
                        }
                    })
            }
        }
    }
}
