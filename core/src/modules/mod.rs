//! Extension module registry and core matcher.
//!
//! Two kinds of extension modules exist:
//!
//! - **Cores** are specialized for one binary image family and are selected
//!   by matching their declared fingerprint(s) against the loaded image's
//!   fingerprint. Exactly one core is active at a time.
//! - **Plugins** layer on top of the selected core and are attached in
//!   registration order. They are not fingerprint-matched.
//!
//! Discovery (scanning directories, verifying archives) is an external
//! collaborator; it populates the registry before startup. Lifecycle hooks
//! run in a fixed order: `construct`, `pre_init`, `init`, `post_init`. A
//! hook error deactivates only the failing module.

use anyhow::Result;
use serde_json::Value;

use modhost_shared::{ImageHeader, Participant};

/// Identifier of the built-in fallback core.
pub const NULL_CORE_ID: &str = "null-core";

/// Kind of an extension module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Core,
    Plugin,
}

/// Declared compatibility fingerprint(s) of a core module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Single(String),
    Multiple(Vec<String>),
}

impl Fingerprint {
    /// Whether this fingerprint set contains the image fingerprint.
    pub fn matches(&self, image_id: &str) -> bool {
        match self {
            Fingerprint::Single(id) => id == image_id,
            Fingerprint::Multiple(ids) => ids.iter().any(|id| id == image_id),
        }
    }
}

/// Immutable description of a registered module.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub id: String,
    pub kind: ModuleKind,
    /// Cores declare zero, one, or many fingerprints; plugins declare none.
    pub fingerprint: Option<Fingerprint>,
}

/// A shared-storage field declared by a module.
///
/// The prototype value is cloned into each new session's storage, so
/// sessions never share mutable field state.
#[derive(Debug, Clone)]
pub struct SharedField {
    pub owner: String,
    pub name: String,
    pub prototype: Value,
}

impl SharedField {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, prototype: Value) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            prototype,
        }
    }

    /// Storage key for this field.
    pub fn key(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

/// Context handed to lifecycle hooks.
pub struct ModuleContext<'a> {
    /// Header of the loaded image, once parsed.
    pub header: Option<&'a ImageHeader>,
    /// The local participant, once the session is established.
    pub participant: Option<&'a Participant>,
    session_fields: &'a mut Vec<SharedField>,
}

impl ModuleContext<'_> {
    /// Declare a shared-storage field for future sessions.
    ///
    /// Meaningful during `construct`; the collected fields are handed to the
    /// session host before it starts accepting joins.
    pub fn declare_session_field(&mut self, field: SharedField) {
        self.session_fields.push(field);
    }
}

/// An extension module.
pub trait Module {
    fn descriptor(&self) -> ModuleDescriptor;

    fn construct(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn pre_init(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn init(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn post_init(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Re-bind the local participant after a reconnect.
    fn rebind_participant(&mut self, _participant: &Participant) {}
}

/// The built-in fallback core. Does nothing; exists so an unmatched image
/// degrades gracefully instead of crashing the host.
pub struct NullCore;

impl Module for NullCore {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: NULL_CORE_ID.to_string(),
            kind: ModuleKind::Core,
            fingerprint: None,
        }
    }
}

/// Lifecycle hook selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Construct,
    PreInit,
    Init,
    PostInit,
}

/// Result of core resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreMatch {
    /// A registered core matched the image fingerprint (or the override).
    Matched(String),
    /// Nothing matched; the caller should fall back to [`NULL_CORE_ID`].
    Fallback,
}

struct Entry {
    id: String,
    module: Box<dyn Module>,
    active: bool,
}

impl Entry {
    fn new(module: Box<dyn Module>) -> Self {
        let id = module.descriptor().id;
        Self {
            id,
            module,
            active: true,
        }
    }
}

/// Registry of discovered extension modules.
pub struct ModuleRegistry {
    cores: Vec<Entry>,
    plugins: Vec<Entry>,
    selected_core: Option<String>,
    session_fields: Vec<SharedField>,
}

impl ModuleRegistry {
    /// Empty registry with the fallback core pre-registered.
    pub fn new() -> Self {
        let mut registry = Self {
            cores: Vec::new(),
            plugins: Vec::new(),
            selected_core: None,
            session_fields: Vec::new(),
        };
        registry.register_core(Box::new(NullCore));
        registry
    }

    /// Register a core module.
    ///
    /// A duplicate id replaces the earlier registration in place; the
    /// shadowing is logged as a configuration diagnostic.
    pub fn register_core(&mut self, module: Box<dyn Module>) {
        let entry = Entry::new(module);
        if let Some(existing) = self.cores.iter_mut().find(|e| e.id == entry.id) {
            tracing::warn!(id = %entry.id, "core replaced by later registration");
            *existing = entry;
        } else {
            self.cores.push(entry);
        }
    }

    /// Register a plugin module. Plugins attach in registration order.
    pub fn register_plugin(&mut self, module: Box<dyn Module>) {
        let entry = Entry::new(module);
        if let Some(existing) = self.plugins.iter_mut().find(|e| e.id == entry.id) {
            tracing::warn!(id = %entry.id, "plugin replaced by later registration");
            *existing = entry;
        } else {
            self.plugins.push(entry);
        }
    }

    pub fn core_ids(&self) -> Vec<&str> {
        self.cores.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Match a core against the image fingerprint.
    ///
    /// A configured override id is tried first and short-circuits matching.
    /// Otherwise every registered core's fingerprint set is consulted; the
    /// fallback is returned when nothing matches.
    pub fn resolve_core(&self, image_id: &str, override_id: Option<&str>) -> CoreMatch {
        if let Some(id) = override_id.filter(|id| !id.is_empty()) {
            if self.cores.iter().any(|e| e.id == id) {
                return CoreMatch::Matched(id.to_string());
            }
            tracing::warn!(id, "core override does not name a registered core");
        }

        for entry in &self.cores {
            let descriptor = entry.module.descriptor();
            if let Some(fingerprint) = &descriptor.fingerprint {
                if fingerprint.matches(image_id) {
                    return CoreMatch::Matched(entry.id.clone());
                }
            }
        }

        CoreMatch::Fallback
    }

    /// Select the active core by id.
    pub fn select_core(&mut self, id: &str) {
        self.selected_core = Some(id.to_string());
    }

    pub fn selected_core(&self) -> Option<&str> {
        self.selected_core.as_deref()
    }

    /// Fields declared by modules during `construct`.
    pub fn session_fields(&self) -> &[SharedField] {
        &self.session_fields
    }

    /// Run one lifecycle hook over the selected core and every plugin.
    ///
    /// A hook error deactivates the failing module and leaves the rest
    /// untouched.
    pub fn run_stage(
        &mut self,
        stage: LifecycleStage,
        header: Option<&ImageHeader>,
        participant: Option<&Participant>,
    ) {
        let selected = self.selected_core.clone();
        let session_fields = &mut self.session_fields;

        let core = self
            .cores
            .iter_mut()
            .filter(|entry| Some(entry.id.as_str()) == selected.as_deref());

        for entry in core.chain(self.plugins.iter_mut()) {
            if !entry.active {
                continue;
            }
            let mut ctx = ModuleContext {
                header,
                participant,
                session_fields: &mut *session_fields,
            };
            let outcome = match stage {
                LifecycleStage::Construct => entry.module.construct(&mut ctx),
                LifecycleStage::PreInit => entry.module.pre_init(&mut ctx),
                LifecycleStage::Init => entry.module.init(&mut ctx),
                LifecycleStage::PostInit => entry.module.post_init(&mut ctx),
            };
            if let Err(err) = outcome {
                tracing::error!(
                    module = %entry.id,
                    ?stage,
                    error = %err,
                    "lifecycle hook failed; deactivating module"
                );
                entry.active = false;
            }
        }
    }

    /// Re-bind the local participant on every active module.
    pub fn rebind_all(&mut self, participant: &Participant) {
        let selected = self.selected_core.clone();
        let core = self
            .cores
            .iter_mut()
            .filter(|entry| Some(entry.id.as_str()) == selected.as_deref());
        for entry in core.chain(self.plugins.iter_mut()) {
            if entry.active {
                entry.module.rebind_participant(participant);
            }
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.cores
            .iter()
            .chain(self.plugins.iter())
            .find(|entry| entry.id == id)
            .map(|entry| entry.active)
            .unwrap_or(false)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("cores", &self.core_ids())
            .field("plugins", &self.plugins.len())
            .field("selected_core", &self.selected_core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct TestCore {
        id: &'static str,
        fingerprint: Option<Fingerprint>,
    }

    impl Module for TestCore {
        fn descriptor(&self) -> ModuleDescriptor {
            ModuleDescriptor {
                id: self.id.to_string(),
                kind: ModuleKind::Core,
                fingerprint: self.fingerprint.clone(),
            }
        }
    }

    #[derive(Default)]
    struct Recording {
        stages: Vec<&'static str>,
        participant: Option<String>,
    }

    struct TestPlugin {
        id: &'static str,
        fail_on_init: bool,
        log: Rc<RefCell<Recording>>,
        field: Option<SharedField>,
    }

    impl Module for TestPlugin {
        fn descriptor(&self) -> ModuleDescriptor {
            ModuleDescriptor {
                id: self.id.to_string(),
                kind: ModuleKind::Plugin,
                fingerprint: None,
            }
        }

        fn construct(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
            self.log.borrow_mut().stages.push("construct");
            if let Some(field) = self.field.take() {
                ctx.declare_session_field(field);
            }
            Ok(())
        }

        fn init(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
            if self.fail_on_init {
                anyhow::bail!("init failed");
            }
            self.log.borrow_mut().stages.push("init");
            Ok(())
        }

        fn post_init(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
            self.log.borrow_mut().stages.push("post_init");
            Ok(())
        }

        fn rebind_participant(&mut self, participant: &Participant) {
            self.log.borrow_mut().participant = Some(participant.id.clone());
        }
    }

    fn core(id: &'static str, fingerprint: Option<Fingerprint>) -> Box<dyn Module> {
        Box::new(TestCore { id, fingerprint })
    }

    #[test]
    fn resolve_matches_single_fingerprint() {
        let mut registry = ModuleRegistry::new();
        registry.register_core(core("zelda", Some(Fingerprint::Single("ZLDA".into()))));
        registry.register_core(core("metro", Some(Fingerprint::Single("MTRD".into()))));

        assert_eq!(
            registry.resolve_core("MTRD", None),
            CoreMatch::Matched("metro".into())
        );
    }

    #[test]
    fn resolve_matches_fingerprint_collection() {
        let mut registry = ModuleRegistry::new();
        registry.register_core(core(
            "multi",
            Some(Fingerprint::Multiple(vec!["AAAA".into(), "BBBB".into()])),
        ));

        assert_eq!(
            registry.resolve_core("BBBB", None),
            CoreMatch::Matched("multi".into())
        );
        assert_eq!(registry.resolve_core("CCCC", None), CoreMatch::Fallback);
    }

    #[test]
    fn resolve_falls_back_when_nothing_matches() {
        let registry = ModuleRegistry::new();
        assert_eq!(registry.resolve_core("ANY", None), CoreMatch::Fallback);
    }

    #[test]
    fn override_short_circuits_matching() {
        let mut registry = ModuleRegistry::new();
        registry.register_core(core("match", Some(Fingerprint::Single("GAME".into()))));
        registry.register_core(core("forced", None));

        assert_eq!(
            registry.resolve_core("GAME", Some("forced")),
            CoreMatch::Matched("forced".into())
        );
    }

    #[test]
    fn unknown_override_falls_through_to_matching() {
        let mut registry = ModuleRegistry::new();
        registry.register_core(core("match", Some(Fingerprint::Single("GAME".into()))));

        assert_eq!(
            registry.resolve_core("GAME", Some("missing")),
            CoreMatch::Matched("match".into())
        );
    }

    #[test]
    fn empty_override_is_ignored() {
        let registry = ModuleRegistry::new();
        assert_eq!(registry.resolve_core("GAME", Some("")), CoreMatch::Fallback);
    }

    #[test]
    fn duplicate_core_id_replaces_earlier() {
        let mut registry = ModuleRegistry::new();
        registry.register_core(core("dup", Some(Fingerprint::Single("OLD!".into()))));
        registry.register_core(core("dup", Some(Fingerprint::Single("NEW!".into()))));

        assert_eq!(registry.resolve_core("OLD!", None), CoreMatch::Fallback);
        assert_eq!(
            registry.resolve_core("NEW!", None),
            CoreMatch::Matched("dup".into())
        );
        // Still a single entry besides the fallback core.
        assert_eq!(registry.core_ids().len(), 2);
    }

    #[test]
    fn failing_hook_deactivates_only_that_module() {
        let log_a = Rc::new(RefCell::new(Recording::default()));
        let log_b = Rc::new(RefCell::new(Recording::default()));

        let mut registry = ModuleRegistry::new();
        registry.select_core(NULL_CORE_ID);
        registry.register_plugin(Box::new(TestPlugin {
            id: "a",
            fail_on_init: true,
            log: Rc::clone(&log_a),
            field: None,
        }));
        registry.register_plugin(Box::new(TestPlugin {
            id: "b",
            fail_on_init: false,
            log: Rc::clone(&log_b),
            field: None,
        }));

        registry.run_stage(LifecycleStage::Init, None, None);
        registry.run_stage(LifecycleStage::PostInit, None, None);

        assert!(!registry.is_active("a"));
        assert!(registry.is_active("b"));
        assert!(log_a.borrow().stages.is_empty());
        assert_eq!(&log_b.borrow().stages, &["init", "post_init"]);
    }

    #[test]
    fn construct_collects_session_fields() {
        let log = Rc::new(RefCell::new(Recording::default()));
        let mut registry = ModuleRegistry::new();
        registry.select_core(NULL_CORE_ID);
        registry.register_plugin(Box::new(TestPlugin {
            id: "inventory",
            fail_on_init: false,
            log,
            field: Some(SharedField::new(
                "inventory",
                "items",
                serde_json::json!({ "slots": [] }),
            )),
        }));

        registry.run_stage(LifecycleStage::Construct, None, None);

        let fields = registry.session_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].key(), "inventory.items");
    }

    #[test]
    fn rebind_reaches_active_modules() {
        let log = Rc::new(RefCell::new(Recording::default()));
        let mut registry = ModuleRegistry::new();
        registry.select_core(NULL_CORE_ID);
        registry.register_plugin(Box::new(TestPlugin {
            id: "p",
            fail_on_init: false,
            log: Rc::clone(&log),
            field: None,
        }));

        let participant = Participant::new("pid-1", "Ana");
        registry.rebind_all(&participant);
        assert_eq!(log.borrow().participant.as_deref(), Some("pid-1"));
    }
}
