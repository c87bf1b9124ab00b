//! Worker-side message handling and the worker process entry point.
//!
//! The same [`WorkerState`] serves both a real child (`sitepool worker`)
//! and the in-process loopback used by tests, so both paths speak exactly
//! the same protocol.

use crate::config::{CacheModel, UrlSchemeRegistration};
use crate::domain::RegistrableDomain;
use crate::error::Result;
use crate::ipc::pipe::{FrameReader, FrameWriter, PipeFd};
use crate::ipc::protocol::{
    AutomationSessionProxy, ClosePage, DidCommitLoad, DidFinishLaunching,
    DomainPrewarmInformation, Download, Envelope, InitializationParameters, LoadUrl,
    MemoryPressureEvent, PrewarmInformation, SetCacheModel, names, receivers,
};
use crate::ipc::transport::PeerOutput;
use crate::types::{AutomationSessionId, PageId, ProcessRole};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Everything a worker remembers between messages.
#[derive(Debug)]
pub struct WorkerState {
    pid: u32,
    role: ProcessRole,
    parameters: Option<InitializationParameters>,
    pages: BTreeMap<PageId, Url>,
    cache_model: CacheModel,
    url_schemes: Vec<UrlSchemeRegistration>,
    service_workers_enabled: bool,
    automation_session: Option<AutomationSessionId>,
    prewarm_hints_applied: usize,
    memory_pressure_events: usize,
    gpu_crashes_seen: usize,
    downloads: usize,
}

impl WorkerState {
    pub fn new(pid: u32, role: ProcessRole) -> Self {
        Self {
            pid,
            role,
            parameters: None,
            pages: BTreeMap::new(),
            cache_model: CacheModel::default(),
            url_schemes: Vec::new(),
            service_workers_enabled: false,
            automation_session: None,
            prewarm_hints_applied: 0,
            memory_pressure_events: 0,
            gpu_crashes_seen: 0,
            downloads: 0,
        }
    }

    /// Frames sent as soon as the worker starts.
    pub fn launch_frames(&self) -> Result<Vec<Envelope>> {
        let handshake = Envelope::with_body(
            receivers::WORKER_PROCESS,
            names::DID_FINISH_LAUNCHING,
            &DidFinishLaunching {
                pid: self.pid,
                role: self.role,
            },
        )?;
        Ok(vec![handshake])
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn memory_pressure_events(&self) -> usize {
        self.memory_pressure_events
    }

    /// Handle one inbound frame.
    pub fn handle(&mut self, message: &Envelope) -> PeerOutput {
        let mut output = PeerOutput::default();
        match self.handle_inner(message, &mut output) {
            Ok(reply) => {
                if message.expects_reply() {
                    output.frames.push(message.reply(reply));
                }
            }
            Err(e) => {
                tracing::warn!(message = %message.name, error = %e, "Worker could not handle message");
                if message.expects_reply() {
                    output.frames.push(message.reply(Value::Null));
                }
            }
        }
        output
    }

    fn handle_inner(&mut self, message: &Envelope, output: &mut PeerOutput) -> Result<Value> {
        match message.name.as_str() {
            names::INITIALIZE => {
                let parameters: InitializationParameters = message.body_as()?;
                self.cache_model = parameters.cache_model;
                self.url_schemes = parameters.url_schemes.clone();
                tracing::debug!(
                    role = %self.role,
                    prewarmed = parameters.prewarmed,
                    "Worker initialized"
                );
                self.parameters = Some(parameters);
            }
            names::LOAD_URL => {
                let load: LoadUrl = message.body_as()?;
                let url = Url::parse(&load.url)?;
                self.pages.insert(load.page, url.clone());

                let commit = Envelope::with_body(
                    receivers::PAGE,
                    names::DID_COMMIT_LOAD,
                    &DidCommitLoad {
                        url: load.url.clone(),
                    },
                )?
                .to_destination(load.page.0);
                output.frames.push(commit);

                let domain = RegistrableDomain::from_url(&url);
                if !domain.is_empty() {
                    let information = Envelope::with_body(
                        receivers::WORKER_PROCESS,
                        names::DID_COLLECT_PREWARM_INFORMATION,
                        &DomainPrewarmInformation {
                            domain,
                            information: PrewarmInformation {
                                resources: vec![url.origin().ascii_serialization()],
                            },
                        },
                    )?;
                    output.frames.push(information);
                }
            }
            names::CLOSE_PAGE => {
                let close: ClosePage = message.body_as()?;
                self.pages.remove(&close.page);
            }
            names::PREWARM_WITH_DOMAIN_INFORMATION => {
                let _: DomainPrewarmInformation = message.body_as()?;
                self.prewarm_hints_applied += 1;
            }
            names::MEMORY_PRESSURE_EVENT => {
                let event: MemoryPressureEvent = message.body_as()?;
                self.memory_pressure_events += 1;
                tracing::debug!(critical = event.critical, "Releasing memory");
            }
            names::GPU_PROCESS_CRASHED => self.gpu_crashes_seen += 1,
            names::ENABLE_SERVICE_WORKERS => self.service_workers_enabled = true,
            names::DISABLE_SERVICE_WORKERS => self.service_workers_enabled = false,
            names::ENSURE_AUTOMATION_SESSION_PROXY => {
                let proxy: AutomationSessionProxy = message.body_as()?;
                self.automation_session = Some(proxy.session);
            }
            names::DESTROY_AUTOMATION_SESSION_PROXY => self.automation_session = None,
            names::SET_CACHE_MODEL | names::SET_CACHE_MODEL_SYNCHRONOUSLY => {
                let model: SetCacheModel = message.body_as()?;
                self.cache_model = model.model;
            }
            names::REGISTER_URL_SCHEME => {
                let registration: UrlSchemeRegistration = message.body_as()?;
                self.url_schemes.push(registration);
            }
            names::DOWNLOAD => {
                let download: Download = message.body_as()?;
                self.downloads += 1;
                tracing::debug!(download = %download.id, url = %download.url, "Download started");
            }
            names::ACTIVE_PAGES_ORIGINS => {
                let origins: Vec<String> = self
                    .pages
                    .values()
                    .map(|url| url.origin().ascii_serialization())
                    .collect();
                return Ok(serde_json::to_value(origins)?);
            }
            names::PING => return Ok(Value::String("pong".into())),
            names::EXIT => output.exit = true,
            other => {
                tracing::debug!(message = other, "Ignoring unknown message");
            }
        }
        Ok(Value::Null)
    }
}

/// Serve frames from `reader` until EOF or `Exit`.
fn worker_loop(
    state: &mut WorkerState,
    reader: &mut FrameReader<PipeFd>,
    writer: &mut FrameWriter<PipeFd>,
) -> Result<()> {
    for frame in state.launch_frames()? {
        writer.write_frame(&frame.to_line()?)?;
    }

    loop {
        let line = match reader.read_frame()? {
            Some(line) => line.to_string(),
            None => return Ok(()),
        };

        let message = match Envelope::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                continue;
            }
        };

        let output = state.handle(&message);
        for frame in output.frames {
            writer.write_frame(&frame.to_line()?)?;
        }
        if output.exit {
            return Ok(());
        }
    }
}

/// Run the worker process. stdin/stdout carry the channel; logs go to stderr.
pub fn run_worker_main(role: ProcessRole) -> ! {
    // Pipe errors surface as io::Error instead of killing the worker.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let result = (|| -> Result<()> {
        let mut reader = FrameReader::new(PipeFd::stdin()?);
        let mut writer = FrameWriter::new(PipeFd::stdout()?);
        let mut state = WorkerState::new(std::process::id(), role);
        worker_loop(&mut state, &mut reader, &mut writer)
    })();

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, role = %role, "Worker failed");
            std::process::exit(1);
        }
    }
}

/// Handshake frame check shared by launchers.
pub fn is_launch_handshake(message: &Envelope) -> bool {
    message.receiver == receivers::WORKER_PROCESS && message.name == names::DID_FINISH_LAUNCHING
}
