//! Startup orchestration.
//!
//! The [`StartupRunner`] sequences host startup through fixed stages:
//!
//! ```text
//! DiscoverModules -> SelectCore -> AwaitSession -> ApplyPatch
//!     -> StartEngine -> AttachModules -> Ready
//! ```
//!
//! Each completed stage publishes an event on the process bus. The
//! await-session stage blocks on a [`StartupGate`]: a one-shot latch set by
//! the session-established bus event, plus a hold counter other subsystems
//! may keep open via [`StartupHold`] guards. The gate is pushed, never
//! re-polled on a timer, and deliberately has no timeout - a stalled
//! precondition hangs startup rather than running half-initialized.
//!
//! Patch application happens inside the engine-start callback, against the
//! base image, exactly once. A patch failure is fatal: the process exits
//! with [`exit_codes::PATCH_FAILED`], because a partially patched image
//! cannot safely run.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use modhost_shared::{ImageHeader, Participant, Version};

use crate::config::Config;
use crate::engine::Engine;
use crate::events::{CoreEvent, EventBus, topics};
use crate::modules::{CoreMatch, LifecycleStage, ModuleRegistry, NULL_CORE_ID};
use crate::net::{ClientEvent, HostEvent, NegotiatorConfig, SessionHost, SessionNegotiator};
use crate::patch::{PatchRegistry, format_id};

/// Process exit codes for fatal startup failures.
pub mod exit_codes {
    /// Patch application failed; the image may be partially patched.
    pub const PATCH_FAILED: i32 = 160;
}

/// Interval between pump iterations in [`StartupRunner::run_to_ready`].
const PUMP_INTERVAL: Duration = Duration::from_millis(1);

/// Startup stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DiscoverModules,
    SelectCore,
    AwaitSession,
    ApplyPatch,
    StartEngine,
    AttachModules,
    Ready,
}

/// Payload of the session-established event the runner waits on.
#[derive(Debug, Clone)]
pub struct SessionEstablished {
    pub participant: Participant,
    pub patch: Vec<u8>,
    pub patch_name: String,
}

/// One-shot latch plus hold counter gating the await-session stage.
///
/// The latch is set by the session-established bus handler; holds are taken
/// by subsystems that need startup delayed past an unrelated precondition
/// and release on drop.
pub struct StartupGate {
    established: RefCell<Option<SessionEstablished>>,
    holds: Cell<u32>,
}

impl StartupGate {
    pub fn new() -> Self {
        Self {
            established: RefCell::new(None),
            holds: Cell::new(0),
        }
    }

    /// Set the latch. A later establish replaces the stored payload; the
    /// runner consumes it when the gate opens.
    pub fn establish(&self, session: SessionEstablished) {
        self.established.borrow_mut().replace(session);
    }

    /// Keep the gate closed until the returned guard drops.
    pub fn hold(self: &Rc<Self>) -> StartupHold {
        self.holds.set(self.holds.get() + 1);
        StartupHold {
            gate: Rc::clone(self),
        }
    }

    pub fn holds(&self) -> u32 {
        self.holds.get()
    }

    pub fn is_open(&self) -> bool {
        self.holds.get() == 0 && self.established.borrow().is_some()
    }

    /// Consume the latch if the gate is open.
    pub fn take(&self) -> Option<SessionEstablished> {
        if self.holds.get() > 0 {
            return None;
        }
        self.established.borrow_mut().take()
    }
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`StartupGate::hold`].
pub struct StartupHold {
    gate: Rc<StartupGate>,
}

impl Drop for StartupHold {
    fn drop(&mut self) {
        self.gate.holds.set(self.gate.holds.get() - 1);
    }
}

struct PendingPatch {
    payload: Vec<u8>,
    format: Option<String>,
}

/// The startup state machine.
pub struct StartupRunner<E: Engine> {
    config: Config,
    version: Version,
    bus: Rc<EventBus<CoreEvent>>,
    gate: Rc<StartupGate>,
    modules: ModuleRegistry,
    patches: PatchRegistry,
    engine: E,
    host: Option<SessionHost>,
    client: Option<SessionNegotiator>,
    stage: Stage,
    header: Option<ImageHeader>,
    participant: Option<Participant>,
    pending_patch: Option<PendingPatch>,
    engine_started: bool,
}

impl<E: Engine> StartupRunner<E> {
    pub fn new(
        config: Config,
        version: Version,
        engine: E,
        modules: ModuleRegistry,
        patches: PatchRegistry,
    ) -> Self {
        let bus = Rc::new(EventBus::new());
        let gate = Rc::new(StartupGate::new());

        {
            let gate = Rc::clone(&gate);
            bus.on(topics::NETWORK_CONNECT, move |event| {
                if let CoreEvent::NetworkConnect {
                    participant,
                    patch,
                    patch_name,
                } = event
                {
                    gate.establish(SessionEstablished {
                        participant: participant.clone(),
                        patch: patch.clone(),
                        patch_name: patch_name.clone(),
                    });
                }
                Ok(())
            });
        }

        Self {
            config,
            version,
            bus,
            gate,
            modules,
            patches,
            engine,
            host: None,
            client: None,
            stage: Stage::DiscoverModules,
            header: None,
            participant: None,
            pending_patch: None,
            engine_started: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn bus(&self) -> Rc<EventBus<CoreEvent>> {
        Rc::clone(&self.bus)
    }

    pub fn gate(&self) -> Rc<StartupGate> {
        Rc::clone(&self.gate)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn host(&self) -> Option<&SessionHost> {
        self.host.as_ref()
    }

    pub fn host_mut(&mut self) -> Option<&mut SessionHost> {
        self.host.as_mut()
    }

    pub fn client_mut(&mut self) -> Option<&mut SessionNegotiator> {
        self.client.as_mut()
    }

    pub fn participant(&self) -> Option<&Participant> {
        self.participant.as_ref()
    }

    /// Pump the runner once: network first, then the current stage.
    pub fn pump(&mut self) -> Result<Stage> {
        self.pump_network();

        match self.stage {
            Stage::DiscoverModules => self.discover_modules(),
            Stage::SelectCore => self.select_core()?,
            Stage::AwaitSession => self.await_session(),
            Stage::ApplyPatch => self.apply_patch(),
            Stage::StartEngine => self.start_engine()?,
            Stage::AttachModules => self.attach_modules(),
            Stage::Ready => self.steady_state(),
        }

        Ok(self.stage)
    }

    /// Pump until the runner reaches [`Stage::Ready`].
    ///
    /// The await-session gate has no timeout, so this blocks indefinitely
    /// on a stalled precondition.
    pub fn run_to_ready(&mut self) -> Result<()> {
        loop {
            if self.pump()? == Stage::Ready {
                return Ok(());
            }
            std::thread::sleep(PUMP_INTERVAL);
        }
    }

    fn pump_network(&mut self) {
        if let Some(host) = &mut self.host {
            loop {
                match host.poll() {
                    HostEvent::None => break,
                    event => tracing::debug!(?event, "host event"),
                }
            }
        }
        if let Some(client) = &mut self.client {
            loop {
                match client.poll() {
                    ClientEvent::None => break,
                    event => tracing::debug!(?event, "client event"),
                }
            }
        }
    }

    fn complete_stage(&mut self, next: Stage) {
        let finished = self.stage;
        tracing::info!(stage = ?finished, "startup stage complete");
        self.bus
            .emit(topics::STAGE_COMPLETED, &CoreEvent::StageCompleted(finished));
        self.stage = next;
    }

    fn discover_modules(&mut self) {
        tracing::info!(
            cores = self.modules.core_ids().len(),
            plugins = self.modules.plugin_count(),
            "discovered extension modules"
        );
        self.complete_stage(Stage::SelectCore);
    }

    fn select_core(&mut self) -> Result<()> {
        let header = self
            .engine
            .image_header()
            .context("failed to parse image header")?;
        tracing::info!(id = %header.id, title = %header.title, "parsed image header");

        let override_id = (!self.config.modhost.core_override.is_empty())
            .then_some(self.config.modhost.core_override.as_str());
        match self.modules.resolve_core(&header.id, override_id) {
            CoreMatch::Matched(id) => {
                tracing::info!(core = %id, "auto-selected core");
                self.modules.select_core(&id);
            }
            CoreMatch::Fallback => {
                // Degrade gracefully: an unmatched image must not crash the
                // host.
                tracing::error!(
                    id = %header.id,
                    "no compatible core for the loaded image; falling back to the null core"
                );
                self.modules.select_core(NULL_CORE_ID);
            }
        }

        self.modules
            .run_stage(LifecycleStage::Construct, Some(&header), None);
        self.modules
            .run_stage(LifecycleStage::PreInit, Some(&header), None);

        if !self.config.modhost.is_server && !self.config.modhost.is_client {
            tracing::warn!("neither server nor client role is enabled; startup will stall");
        }

        if self.config.modhost.is_server {
            let addr = format!("0.0.0.0:{}", self.config.server.port);
            let mut host = SessionHost::bind(&addr, self.version, Rc::clone(&self.bus))?;
            host.set_session_fields(self.modules.session_fields().to_vec());
            self.host = Some(host);

            if !self.config.modhost.is_client {
                // Standalone host: no negotiation will happen, so synthesize
                // the local participant to release the barrier.
                self.bus.emit(
                    topics::NETWORK_CONNECT,
                    &CoreEvent::NetworkConnect {
                        participant: Participant::generate("Host"),
                        patch: Vec::new(),
                        patch_name: String::new(),
                    },
                );
            }
        }

        if self.config.modhost.is_client {
            let patch = self.load_patch_artifact()?;
            let patch_name = self.config.modhost.patch.clone();
            // Port 0 follows the in-process host, which binds an
            // OS-assigned port in that case.
            let port = match (self.config.client.port, &self.host) {
                (0, Some(host)) => host.port(),
                (port, _) => port,
            };
            let addr = format!("{}:{}", self.config.client.ip, port);
            let negotiator_config = NegotiatorConfig {
                version: self.version.to_string(),
                nickname: self.config.client.nickname.clone(),
                session: self.config.client.session.clone(),
                passphrase: self.config.client.passphrase.clone(),
                patch,
                patch_name,
            };
            self.client = Some(SessionNegotiator::connect(
                &addr,
                negotiator_config,
                Rc::clone(&self.bus),
            )?);
        }

        self.header = Some(header);
        self.complete_stage(Stage::AwaitSession);
        Ok(())
    }

    fn load_patch_artifact(&self) -> Result<Vec<u8>> {
        let path = &self.config.modhost.patch;
        if path.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::read(path).with_context(|| format!("failed to read patch artifact '{path}'"))
    }

    fn await_session(&mut self) {
        // The gate is pushed by the bus handler; nothing is re-polled here.
        let Some(established) = self.gate.take() else {
            return;
        };

        tracing::info!(
            participant = %established.participant,
            patch_bytes = established.patch.len(),
            "session established"
        );
        self.participant = Some(established.participant);

        let format = (!established.patch.is_empty())
            .then(|| format_id(&established.patch_name))
            .flatten();
        self.pending_patch = Some(PendingPatch {
            payload: established.patch,
            format,
        });

        let participant = self.participant.clone();
        self.modules.run_stage(
            LifecycleStage::Init,
            self.header.as_ref(),
            participant.as_ref(),
        );

        self.complete_stage(Stage::ApplyPatch);
    }

    fn apply_patch(&mut self) {
        // Validate the codec up front; the bytes are applied inside the
        // engine-start callback where the base image first exists.
        if let Some(pending) = &self.pending_patch {
            if !pending.payload.is_empty() {
                match &pending.format {
                    Some(format) if self.patches.contains(format) => {}
                    Some(format) => {
                        tracing::error!(format = %format, "no patch codec registered for session patch");
                        std::process::exit(exit_codes::PATCH_FAILED);
                    }
                    None => {
                        tracing::error!("session patch artifact has no format suffix");
                        std::process::exit(exit_codes::PATCH_FAILED);
                    }
                }
            }
        }

        let save_dir = PathBuf::from("./saves").join(&self.config.client.session);
        self.engine.set_save_dir(&save_dir);

        self.complete_stage(Stage::StartEngine);
    }

    fn start_engine(&mut self) -> Result<()> {
        if !self.engine_started {
            let pending = self.pending_patch.take();
            let original_size = self.engine.original_size();
            let patches = &self.patches;
            let failure: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
            let failure_slot = Rc::clone(&failure);

            self.engine.start(Box::new(move |mut image: Vec<u8>| {
                let Some(pending) = pending else {
                    return image;
                };
                if pending.payload.is_empty() {
                    return image;
                }
                let format = pending.format.unwrap_or_default();
                let before = hex::encode(Sha256::digest(&image));
                let base_len = original_size.min(image.len());
                match patches.apply(&format, &image[..base_len], &pending.payload) {
                    Ok(patched) => {
                        let copy_len = patched.len().min(image.len());
                        image[..copy_len].copy_from_slice(&patched[..copy_len]);
                        let after = hex::encode(Sha256::digest(&image));
                        tracing::info!(%before, %after, "image patched");
                    }
                    Err(err) => {
                        *failure_slot.borrow_mut() = Some(err.to_string());
                    }
                }
                image
            }))?;
            self.engine_started = true;

            if let Some(err) = failure.borrow().as_ref() {
                tracing::error!(error = %err, "patch application failed; image is unsafe to run");
                std::process::exit(exit_codes::PATCH_FAILED);
            }
        }

        if self.engine.is_ready() {
            self.bus.emit(topics::ENGINE_STARTED, &CoreEvent::EngineStarted);
            self.complete_stage(Stage::AttachModules);
        }
        Ok(())
    }

    fn attach_modules(&mut self) {
        let participant = self.participant.clone();
        self.modules.run_stage(
            LifecycleStage::PostInit,
            self.header.as_ref(),
            participant.as_ref(),
        );
        self.complete_stage(Stage::Ready);
    }

    /// After readiness, a fresh session-established event re-runs only
    /// participant rebinding, not the full startup.
    fn steady_state(&mut self) {
        if let Some(established) = self.gate.take() {
            tracing::info!(participant = %established.participant, "rebinding participant");
            self.participant = Some(established.participant.clone());
            self.modules.rebind_all(&established.participant);
        }
    }
}
