//! Modhost Core - orchestration core for a pluggable emulation host
//!
//! This crate coordinates everything that happens between "a binary image
//! was selected" and "the emulation engine is running with extensions
//! attached":
//!
//! - [`ModuleRegistry`] - discovers which core module matches the loaded
//!   image's fingerprint and tracks the plugins layered on top
//! - [`SessionHost`] / [`SessionNegotiator`] - the MHSP multiplayer session
//!   protocol between one host and multiple remote participants
//! - [`PatchRegistry`] - interchangeable patch codecs applied to the loaded
//!   image before the engine starts
//! - [`StartupRunner`] - sequences discovery, core selection, session
//!   formation, patching, engine start, and extension attachment through
//!   asynchronous readiness signals
//! - [`EventBus`] - the synchronous pub/sub channel decoupling all of the
//!   above

pub mod config;
pub mod engine;
pub mod events;
pub mod modules;
pub mod net;
pub mod patch;
pub mod runner;
#[cfg(test)]
pub mod test_support;

// Re-export core types
pub use config::Config;
pub use engine::{Engine, PatchFn, StubEngine};
pub use events::{CoreEvent, EventBus, topics};
pub use modules::{
    CoreMatch, Fingerprint, LifecycleStage, Module, ModuleContext, ModuleDescriptor, ModuleKind,
    ModuleRegistry, NULL_CORE_ID, NullCore, SharedField,
};
pub use net::{
    ClientEvent, HostEvent, NegotiatorConfig, NegotiatorState, Packet, RoutedPacket, SessionHost,
    SessionNegotiator, WireMessage,
};
pub use patch::{CodecError, PatchCodec, PatchError, PatchRegistry};
pub use runner::{
    SessionEstablished, Stage, StartupGate, StartupHold, StartupRunner, exit_codes,
};

// Re-export the shared leaf types for convenience
pub use modhost_shared::{ImageHeader, Participant, Version, hash_secret};
