//! MHSP participant: session negotiation for one remote player.
//!
//! The negotiator walks a strictly ordered handshake:
//!
//! 1. connect transport
//! 2. receive the assigned participant id
//! 3. send the local version string
//! 4. `VersionGood` -> proceed, `VersionBad` -> terminal (the host closes
//!    the transport after its grace delay)
//! 5. send `JoinRequest` with the desired session name and the hashed
//!    passphrase
//! 6. `SessionReady` -> established, `DeniedBadSecret` -> terminal
//!
//! On `SessionReady` the negotiator publishes a single session-established
//! event carrying the participant and the session-embedded patch payload -
//! the sole trigger the startup runner waits on.

use std::rc::Rc;

use modhost_shared::{Participant, hash_secret};

use crate::events::{CoreEvent, EventBus, topics};

use super::messages::{
    JoinRequest, Packet, SessionConfig, ToParticipant, VersionHello, WireMessage,
};
use super::socket::{MessageStream, SocketError};

/// Join parameters for one negotiation, sourced from the external
/// configuration collaborator.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Local version string sent during the handshake
    pub version: String,
    /// Display name for the local participant
    pub nickname: String,
    /// Desired session name
    pub session: String,
    /// Join passphrase (hashed before it leaves the process)
    pub passphrase: String,
    /// Patch artifact to embed in the session config (may be empty)
    pub patch: Vec<u8>,
    /// Name of the patch artifact ("" when none)
    pub patch_name: String,
}

/// Negotiation states, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    /// Connected, waiting for the assigned participant id
    AwaitingId,
    /// Version string sent, waiting for the verdict
    VersionSent,
    /// Join request sent, waiting for the session
    Joining,
    /// Session established
    Established,
    /// Terminal: the host rejected our version
    VersionRejected,
    /// Terminal: secret mismatch
    Denied,
    /// Terminal: transport gone
    Disconnected,
}

/// Events surfaced by [`SessionNegotiator::poll`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// No events pending
    None,
    /// Version accepted by the host
    VersionAccepted,
    /// Version rejected by the host (terminal)
    VersionRejected { server: String },
    /// Session established
    SessionEstablished { session: String },
    /// Join denied over the secret (terminal)
    Denied,
    /// An application packet arrived
    PacketReceived(Packet),
    /// Another participant left the session
    ParticipantLeft(Participant),
    /// The transport closed
    Disconnected,
}

/// MHSP participant-side negotiator.
pub struct SessionNegotiator {
    stream: MessageStream,
    config: NegotiatorConfig,
    state: NegotiatorState,
    me: Option<Participant>,
    bus: Rc<EventBus<CoreEvent>>,
    packet_bus: Rc<EventBus<Packet>>,
    channel_bus: Rc<EventBus<Packet>>,
}

impl SessionNegotiator {
    /// Connect to a session host (e.g. "127.0.0.1:8082").
    pub fn connect(
        addr: &str,
        config: NegotiatorConfig,
        bus: Rc<EventBus<CoreEvent>>,
    ) -> Result<Self, SocketError> {
        log::info!("connecting to session host at {}", addr);
        let stream = MessageStream::connect(addr)?;
        Ok(Self {
            stream,
            config,
            state: NegotiatorState::AwaitingId,
            me: None,
            bus,
            packet_bus: Rc::new(EventBus::new()),
            channel_bus: Rc::new(EventBus::new()),
        })
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// The local participant, once the host assigned an id.
    pub fn me(&self) -> Option<&Participant> {
        self.me.as_ref()
    }

    /// Client-side bus keyed by packet id.
    pub fn packet_bus(&self) -> Rc<EventBus<Packet>> {
        Rc::clone(&self.packet_bus)
    }

    /// Client-side bus keyed by channel tag.
    pub fn channel_bus(&self) -> Rc<EventBus<Packet>> {
        Rc::clone(&self.channel_bus)
    }

    /// Send an application packet to the host.
    pub fn send_packet(&mut self, packet: Packet) -> Result<(), SocketError> {
        self.stream.send(&WireMessage::Msg(packet))
    }

    /// Unicast an application packet to a specific participant.
    pub fn send_to_participant(
        &mut self,
        participant_id: &str,
        packet: Packet,
    ) -> Result<(), SocketError> {
        self.stream.send(&WireMessage::ToParticipant(ToParticipant {
            participant_id: participant_id.to_string(),
            packet,
        }))
    }

    /// Pump the negotiator. Returns the next event; call until
    /// [`ClientEvent::None`].
    pub fn poll(&mut self) -> ClientEvent {
        while let Some(msg) = self.stream.poll() {
            if let Some(event) = self.handle_message(msg) {
                return event;
            }
        }

        if self.stream.is_closed() && self.state != NegotiatorState::Disconnected {
            log::info!("transport closed (state {:?})", self.state);
            self.state = NegotiatorState::Disconnected;
            return ClientEvent::Disconnected;
        }

        ClientEvent::None
    }

    fn handle_message(&mut self, msg: WireMessage) -> Option<ClientEvent> {
        match msg {
            WireMessage::AssignId(assign) if self.state == NegotiatorState::AwaitingId => {
                self.me = Some(Participant::new(
                    assign.participant_id,
                    self.config.nickname.clone(),
                ));
                if let Err(err) = self.stream.send(&WireMessage::Version(VersionHello {
                    version: self.config.version.clone(),
                })) {
                    log::error!("failed to send version: {}", err);
                    return None;
                }
                self.state = NegotiatorState::VersionSent;
                None
            }
            WireMessage::VersionGood(good) if self.state == NegotiatorState::VersionSent => {
                log::info!("version accepted by host {}", good.server);
                let Some(me) = self.me.clone() else {
                    return None;
                };
                let config = SessionConfig {
                    name: self.config.session.clone(),
                    secret_hash: hash_secret(&self.config.passphrase),
                    patch_name: self.config.patch_name.clone(),
                    patch: self.config.patch.clone(),
                };
                if let Err(err) = self.stream.send(&WireMessage::JoinRequest(JoinRequest {
                    config,
                    participant: me,
                })) {
                    log::error!("failed to send join request: {}", err);
                    return None;
                }
                self.state = NegotiatorState::Joining;
                Some(ClientEvent::VersionAccepted)
            }
            WireMessage::VersionBad(bad) => {
                log::error!(
                    "version rejected by host: server {}, client {}",
                    bad.server,
                    bad.client
                );
                self.state = NegotiatorState::VersionRejected;
                Some(ClientEvent::VersionRejected { server: bad.server })
            }
            WireMessage::SessionReady(ready) if self.state == NegotiatorState::Joining => {
                log::info!("joined session {}", ready.config.name);
                self.state = NegotiatorState::Established;
                let Some(me) = self.me.clone() else {
                    return None;
                };
                // The session config may embed a patch payload; either way
                // this event is what releases the startup barrier.
                self.bus.emit(
                    topics::NETWORK_CONNECT,
                    &CoreEvent::NetworkConnect {
                        participant: me,
                        patch: ready.config.patch.clone(),
                        patch_name: ready.config.patch_name.clone(),
                    },
                );
                Some(ClientEvent::SessionEstablished {
                    session: ready.config.name,
                })
            }
            WireMessage::DeniedBadSecret => {
                log::error!("failed to join session: bad secret");
                self.state = NegotiatorState::Denied;
                Some(ClientEvent::Denied)
            }
            WireMessage::Msg(packet) => {
                self.packet_bus.emit(&packet.packet_id, &packet);
                self.channel_bus.emit(&packet.channel, &packet);
                Some(ClientEvent::PacketReceived(packet))
            }
            WireMessage::Left(left) => {
                self.bus.emit(
                    topics::SESSION_LEFT,
                    &CoreEvent::SessionLeft {
                        participant: left.participant.clone(),
                    },
                );
                Some(ClientEvent::ParticipantLeft(left.participant))
            }
            other => {
                log::warn!("unexpected message in state {:?}: {:?}", self.state, other);
                None
            }
        }
    }
}
