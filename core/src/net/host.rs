//! MHSP host: session ("lobby") management and packet routing.
//!
//! The host owns every active session. A session springs into existence on
//! the first `JoinRequest` for its name, admits later joiners whose secret
//! hash matches, and is destroyed when its last member disconnects. Because
//! the core is single-threaded, session creation is atomic with respect to
//! concurrent join requests: two requests for the same name processed in
//! the same pump always land in one session.
//!
//! Inbound packets are published on two independent buses - keyed by
//! packet id and by channel tag - with a consistent snapshot of the
//! session's shared storage attached, then relayed to the other members
//! when flagged forwardable.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use serde_json::Value;

use modhost_shared::{Participant, Version};

use crate::events::{CoreEvent, EventBus, topics};
use crate::modules::SharedField;

use super::messages::{
    AssignId, JoinRequest, Left, Packet, SessionReady, VersionBad, VersionGood, VersionHello,
    WireMessage,
};
use super::socket::{HostListener, MessageStream, SocketError};

/// How long a version-rejected participant keeps its transport before the
/// host forcibly closes it.
pub const VERSION_MISMATCH_GRACE: Duration = Duration::from_millis(1000);

/// A packet as republished on the host-side buses.
///
/// `storage` is a snapshot of the owning session's shared storage taken
/// before publication, so subscribers observe field values consistent with
/// the packet.
#[derive(Debug, Clone)]
pub struct RoutedPacket {
    pub packet: Packet,
    pub sender: Participant,
    pub storage: HashMap<String, Value>,
}

/// One active session.
pub struct Session {
    pub config: super::messages::SessionConfig,
    /// Participant id of the creator
    pub owner: String,
    /// Shared storage, seeded from the declared field prototypes
    pub storage: HashMap<String, Value>,
    /// Member participant ids in join order
    pub members: Vec<String>,
}

struct Connection {
    stream: MessageStream,
    participant: Option<Participant>,
    session: Option<String>,
    version_ok: bool,
    kill_at: Option<Instant>,
}

/// Events surfaced by [`SessionHost::poll`].
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// No events pending
    None,
    /// A transport connected and received its participant id
    Connected { participant_id: String },
    /// A participant failed the version handshake
    VersionRejected {
        participant_id: String,
        version: String,
    },
    /// A session was created
    SessionCreated { name: String },
    /// A participant joined a session
    ParticipantJoined {
        session: String,
        participant: Participant,
    },
    /// A join was denied over a secret mismatch
    JoinDenied {
        session: String,
        participant: Participant,
    },
    /// A participant disconnected
    ParticipantLeft {
        session: String,
        participant: Participant,
    },
}

/// MHSP session host.
pub struct SessionHost {
    listener: HostListener,
    version: Version,
    connections: HashMap<String, Connection>,
    sessions: HashMap<String, Session>,
    session_fields: Vec<SharedField>,
    bus: Rc<EventBus<CoreEvent>>,
    packet_bus: Rc<EventBus<RoutedPacket>>,
    channel_bus: Rc<EventBus<RoutedPacket>>,
    events: VecDeque<HostEvent>,
}

impl SessionHost {
    /// Bind the host listener.
    pub fn bind(
        addr: &str,
        version: Version,
        bus: Rc<EventBus<CoreEvent>>,
    ) -> Result<Self, SocketError> {
        let listener = HostListener::bind(addr)?;
        tracing::info!(port = listener.port(), "session host listening");

        Ok(Self {
            listener,
            version,
            connections: HashMap::new(),
            sessions: HashMap::new(),
            session_fields: Vec::new(),
            bus,
            packet_bus: Rc::new(EventBus::new()),
            channel_bus: Rc::new(EventBus::new()),
            events: VecDeque::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    /// Install the shared-storage field prototypes cloned into new sessions.
    pub fn set_session_fields(&mut self, fields: Vec<SharedField>) {
        self.session_fields = fields;
    }

    /// Bus keyed by packet id.
    pub fn packet_bus(&self) -> Rc<EventBus<RoutedPacket>> {
        Rc::clone(&self.packet_bus)
    }

    /// Bus keyed by channel tag.
    pub fn channel_bus(&self) -> Rc<EventBus<RoutedPacket>> {
        Rc::clone(&self.channel_bus)
    }

    pub fn session(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Mutate one shared-storage field of a session. Returns false when the
    /// session or field does not exist.
    pub fn update_session_field(&mut self, session: &str, key: &str, value: Value) -> bool {
        match self.sessions.get_mut(session) {
            Some(session) => match session.storage.get_mut(key) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Send a message directly to a participant by id.
    pub fn send_to(&mut self, participant_id: &str, msg: &WireMessage) {
        if let Some(conn) = self.connections.get_mut(participant_id) {
            if let Err(err) = conn.stream.send(msg) {
                tracing::warn!(participant = participant_id, error = %err, "send failed");
            }
        }
    }

    /// Pump the host: accept, enforce deadlines, read, route.
    ///
    /// Returns the next queued event; call until [`HostEvent::None`].
    pub fn poll(&mut self) -> HostEvent {
        self.accept_new();
        self.enforce_kill_deadlines();
        self.pump_connections();
        self.events.pop_front().unwrap_or(HostEvent::None)
    }

    fn accept_new(&mut self) {
        while let Some(accepted) = self.listener.accept() {
            match accepted {
                Ok(mut stream) => {
                    let id = uuid::Uuid::new_v4().to_string();
                    tracing::info!(participant = %id, peer = %stream.peer_addr(), "client connected");
                    if let Err(err) = stream.send(&WireMessage::AssignId(AssignId {
                        participant_id: id.clone(),
                    })) {
                        tracing::warn!(error = %err, "failed to assign participant id");
                        continue;
                    }
                    self.connections.insert(
                        id.clone(),
                        Connection {
                            stream,
                            participant: None,
                            session: None,
                            version_ok: false,
                            kill_at: None,
                        },
                    );
                    self.events
                        .push_back(HostEvent::Connected { participant_id: id });
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }

    /// Close transports whose version-mismatch grace period expired.
    fn enforce_kill_deadlines(&mut self) {
        let now = Instant::now();
        for conn in self.connections.values_mut() {
            if let Some(deadline) = conn.kill_at {
                if now >= deadline && !conn.stream.is_closed() {
                    conn.stream.shutdown();
                }
            }
        }
    }

    fn pump_connections(&mut self) {
        let ids: Vec<String> = self.connections.keys().cloned().collect();
        for id in ids {
            loop {
                let msg = match self.connections.get_mut(&id) {
                    Some(conn) => conn.stream.poll(),
                    None => break,
                };
                match msg {
                    Some(msg) => self.handle_message(&id, msg),
                    None => break,
                }
            }

            let closed = self
                .connections
                .get(&id)
                .map(|conn| conn.stream.is_closed())
                .unwrap_or(false);
            if closed {
                self.drop_connection(&id);
            }
        }
    }

    fn handle_message(&mut self, conn_id: &str, msg: WireMessage) {
        match msg {
            WireMessage::Version(hello) => self.handle_version(conn_id, hello),
            WireMessage::JoinRequest(req) => self.handle_join(conn_id, req),
            WireMessage::Msg(packet) => self.handle_packet(conn_id, packet),
            WireMessage::ToParticipant(unicast) => {
                // Direct addressing bypasses session membership.
                self.send_to(&unicast.participant_id, &WireMessage::Msg(unicast.packet));
            }
            other => {
                tracing::warn!(participant = conn_id, ?other, "unexpected message");
            }
        }
    }

    fn handle_version(&mut self, conn_id: &str, hello: VersionHello) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        let compatible = Version::parse(&hello.version)
            .map(|client| self.version.compatible(&client))
            .unwrap_or(false);

        if compatible {
            conn.version_ok = true;
            let _ = conn.stream.send(&WireMessage::VersionGood(VersionGood {
                server: self.version.to_string(),
            }));
        } else {
            tracing::warn!(
                participant = conn_id,
                client = %hello.version,
                server = %self.version,
                "version mismatch; scheduling disconnect"
            );
            let _ = conn.stream.send(&WireMessage::VersionBad(VersionBad {
                server: self.version.to_string(),
                client: hello.version.clone(),
            }));
            conn.kill_at = Some(Instant::now() + VERSION_MISMATCH_GRACE);
            self.events.push_back(HostEvent::VersionRejected {
                participant_id: conn_id.to_string(),
                version: hello.version,
            });
        }
    }

    fn handle_join(&mut self, conn_id: &str, req: JoinRequest) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        if !conn.version_ok {
            tracing::warn!(participant = conn_id, "join before version handshake");
            return;
        }

        // The assigned id is canonical; only the nickname is taken from the
        // request.
        let participant = Participant::new(conn_id, req.participant.nickname);
        let name = req.config.name.clone();

        if let Some(session) = self.sessions.get_mut(&name) {
            if session.config.secret_hash == req.config.secret_hash {
                session.members.push(conn_id.to_string());
                conn.participant = Some(participant.clone());
                conn.session = Some(name.clone());
                let _ = conn.stream.send(&WireMessage::SessionReady(SessionReady {
                    config: session.config.clone(),
                }));
                tracing::info!(session = %name, participant = %participant, "participant joined");
                self.bus.emit(
                    topics::SESSION_JOINED,
                    &CoreEvent::SessionJoined {
                        participant: participant.clone(),
                    },
                );
                self.events.push_back(HostEvent::ParticipantJoined {
                    session: name,
                    participant,
                });
            } else {
                tracing::warn!(session = %name, participant = %participant, "join denied: bad secret");
                let _ = conn.stream.send(&WireMessage::DeniedBadSecret);
                self.events.push_back(HostEvent::JoinDenied {
                    session: name,
                    participant,
                });
            }
        } else {
            tracing::info!(session = %name, "creating session");
            let mut storage = HashMap::new();
            for field in &self.session_fields {
                storage.insert(field.key(), field.prototype.clone());
            }
            let session = Session {
                config: req.config.clone(),
                owner: conn_id.to_string(),
                storage,
                members: vec![conn_id.to_string()],
            };
            self.sessions.insert(name.clone(), session);
            conn.participant = Some(participant.clone());
            conn.session = Some(name.clone());
            let _ = conn.stream.send(&WireMessage::SessionReady(SessionReady {
                config: req.config,
            }));
            self.bus.emit(
                topics::SESSION_CREATED,
                &CoreEvent::SessionCreated { name: name.clone() },
            );
            self.bus.emit(
                topics::SESSION_JOINED,
                &CoreEvent::SessionJoined {
                    participant: participant.clone(),
                },
            );
            self.events
                .push_back(HostEvent::SessionCreated { name: name.clone() });
            self.events.push_back(HostEvent::ParticipantJoined {
                session: name,
                participant,
            });
        }
    }

    fn handle_packet(&mut self, conn_id: &str, packet: Packet) {
        let Some(conn) = self.connections.get(conn_id) else {
            return;
        };
        let Some(sender) = conn.participant.clone() else {
            tracing::warn!(participant = conn_id, "packet before joining a session");
            return;
        };

        // Snapshot the session storage so bus subscribers observe values
        // consistent with this packet.
        let storage = self
            .sessions
            .get(&packet.session)
            .map(|session| session.storage.clone())
            .unwrap_or_default();

        let routed = RoutedPacket {
            packet: packet.clone(),
            sender,
            storage,
        };
        self.packet_bus.emit(&packet.packet_id, &routed);
        self.channel_bus.emit(&packet.channel, &routed);

        if packet.forward {
            let members = self
                .sessions
                .get(&packet.session)
                .map(|session| session.members.clone())
                .unwrap_or_default();
            for member in members {
                if member != conn_id {
                    self.send_to(&member, &WireMessage::Msg(packet.clone()));
                }
            }
        }
    }

    fn drop_connection(&mut self, conn_id: &str) {
        let Some(conn) = self.connections.remove(conn_id) else {
            return;
        };

        let (Some(participant), Some(name)) = (conn.participant, conn.session) else {
            tracing::info!(participant = conn_id, "client disconnected before joining");
            return;
        };

        let mut remaining = Vec::new();
        if let Some(session) = self.sessions.get_mut(&name) {
            session.members.retain(|member| member != conn_id);
            remaining = session.members.clone();
            if remaining.is_empty() {
                self.sessions.remove(&name);
                tracing::info!(session = %name, "session destroyed");
            }
        }

        for member in remaining {
            self.send_to(
                &member,
                &WireMessage::Left(Left {
                    participant: participant.clone(),
                }),
            );
        }

        tracing::info!(session = %name, participant = %participant, "participant left");
        self.bus.emit(
            topics::SESSION_LEFT,
            &CoreEvent::SessionLeft {
                participant: participant.clone(),
            },
        );
        self.events.push_back(HostEvent::ParticipantLeft {
            session: name,
            participant,
        });
    }
}
