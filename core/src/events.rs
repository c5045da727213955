//! Process-wide publish/subscribe event bus.
//!
//! Every subsystem publishes and observes events through an [`EventBus`]
//! instead of calling each other directly. Delivery is synchronous and
//! in registration order; handlers registered while an emission is in
//! progress are not invoked for that emission. A handler error is logged at
//! the bus boundary and never reaches the emitter.
//!
//! Buses are constructed once at startup and passed around as `Rc` service
//! objects; the core is single-threaded, so no locking is involved.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use modhost_shared::Participant;

/// A subscribed event handler.
pub type Handler<E> = Box<dyn FnMut(&E) -> anyhow::Result<()>>;

/// Topic-keyed synchronous event bus.
///
/// `E` is the payload type carried by every event on this bus; different
/// subsystems own buses with different payload types (lifecycle events,
/// routed packets).
pub struct EventBus<E> {
    handlers: RefCell<HashMap<String, Vec<Rc<RefCell<Handler<E>>>>>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            handlers: RefCell::new(HashMap::new()),
        }
    }

    /// Subscribe a handler to a topic.
    pub fn on<F>(&self, topic: &str, handler: F)
    where
        F: FnMut(&E) -> anyhow::Result<()> + 'static,
    {
        self.handlers
            .borrow_mut()
            .entry(topic.to_string())
            .or_default()
            .push(Rc::new(RefCell::new(Box::new(handler))));
    }

    /// Emit a payload to every handler currently subscribed to `topic`.
    ///
    /// The subscriber list is snapshotted before delivery, so a handler may
    /// subscribe or emit while the bus is dispatching. A handler that
    /// re-enters itself is skipped.
    pub fn emit(&self, topic: &str, payload: &E) {
        let snapshot = {
            let handlers = self.handlers.borrow();
            match handlers.get(topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for handler in snapshot {
            match handler.try_borrow_mut() {
                Ok(mut handler) => {
                    if let Err(err) = (&mut *handler)(payload) {
                        tracing::error!(topic, error = %err, "event handler failed");
                    }
                }
                Err(_) => {
                    tracing::warn!(topic, "skipping re-entrant event handler");
                }
            }
        }
    }

    /// Number of handlers subscribed to a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .borrow()
            .get(topic)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle events published on the main process bus.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A session was established for the local participant. Carries the
    /// session-embedded patch payload (may be empty). This is the sole
    /// trigger the startup runner waits on.
    NetworkConnect {
        participant: Participant,
        patch: Vec<u8>,
        patch_name: String,
    },
    /// A session was created on the host.
    SessionCreated { name: String },
    /// A participant joined a session on the host.
    SessionJoined { participant: Participant },
    /// A participant left a session.
    SessionLeft { participant: Participant },
    /// A startup stage finished.
    StageCompleted(crate::runner::Stage),
    /// The emulation engine reported ready.
    EngineStarted,
    /// The host is shutting down.
    Shutdown,
}

/// Topic names used on the main process bus.
pub mod topics {
    pub const NETWORK_CONNECT: &str = "network:connect";
    pub const SESSION_CREATED: &str = "session:created";
    pub const SESSION_JOINED: &str = "session:joined";
    pub const SESSION_LEFT: &str = "session:left";
    pub const STAGE_COMPLETED: &str = "startup:stage";
    pub const ENGINE_STARTED: &str = "engine:started";
    pub const SHUTDOWN: &str = "shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn delivers_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Rc::clone(&seen);
            bus.on("tick", move |value| {
                seen.borrow_mut().push(format!("{tag}:{value}"));
                Ok(())
            });
        }

        bus.emit("tick", &7);
        assert_eq!(&*seen.borrow(), &["a:7", "b:7", "c:7"]);
    }

    #[test]
    fn failing_handler_does_not_stop_later_handlers() {
        let bus: EventBus<()> = EventBus::new();
        let reached = Rc::new(RefCell::new(false));

        bus.on("boom", |_| anyhow::bail!("handler exploded"));
        {
            let reached = Rc::clone(&reached);
            bus.on("boom", move |_| {
                *reached.borrow_mut() = true;
                Ok(())
            });
        }

        bus.emit("boom", &());
        assert!(*reached.borrow());
    }

    #[test]
    fn unknown_topic_is_a_no_op() {
        let bus: EventBus<u32> = EventBus::new();
        bus.emit("nobody-listens", &1);
        assert_eq!(bus.subscriber_count("nobody-listens"), 0);
    }

    #[test]
    fn handler_registered_during_emit_misses_that_emit() {
        let bus: Rc<EventBus<u32>> = Rc::new(EventBus::new());
        let late_calls = Rc::new(RefCell::new(0u32));

        {
            let bus2 = Rc::clone(&bus);
            let late_calls = Rc::clone(&late_calls);
            bus.on("evt", move |_| {
                let late_calls = Rc::clone(&late_calls);
                bus2.on("evt", move |_| {
                    *late_calls.borrow_mut() += 1;
                    Ok(())
                });
                Ok(())
            });
        }

        bus.emit("evt", &1);
        assert_eq!(*late_calls.borrow(), 0, "late handler must not see first emit");

        bus.emit("evt", &2);
        assert_eq!(*late_calls.borrow(), 1);
    }

    #[test]
    fn handler_may_emit_on_other_topic() {
        let bus: Rc<EventBus<u32>> = Rc::new(EventBus::new());
        let chained = Rc::new(RefCell::new(None));

        {
            let chained = Rc::clone(&chained);
            bus.on("second", move |value| {
                *chained.borrow_mut() = Some(*value);
                Ok(())
            });
        }
        {
            let bus2 = Rc::clone(&bus);
            bus.on("first", move |value| {
                bus2.emit("second", &(value + 1));
                Ok(())
            });
        }

        bus.emit("first", &10);
        assert_eq!(*chained.borrow(), Some(11));
    }
}
