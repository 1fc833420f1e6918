//! Server endpoint: the client table, the connect handshake, the loading
//! barrier, and per-client update packets carrying a delta snapshot against
//! whatever frame that client last acknowledged.

use std::io;
use std::net::SocketAddr;

use crate::entity::{
    EntityId, EntityRef, PlayerHuman, PlayerManager, World, MAX_ENTITIES, MAX_GAMEPADS,
    MAX_PLAYERS, MAX_USERNAME,
};

use super::bitstream::{BitReader, StreamError, StreamResult};
use super::entity_codec::entity_write;
use super::msg::{calculate_rtt, msgs_read, msgs_write, MessageHistory};
use super::packet::{packet_finalize, packet_init, packet_open};
use super::sequence::{
    sequence_relative_to, Ack, SequenceHistory, SequenceId, NET_SEQUENCE_INVALID,
};
use super::state::{state_frame_build, StateFrame};
use super::transport::Socket;
use super::{
    level_write, msg_finalize, msg_new, msgs_out_consolidate, remote_control_read, ClientPacket,
    LevelDescriptor, MessageSource, MessageType, ServerPacket, StateCommon, GAME_VERSION,
    MESSAGE_TYPE_COUNT, NET_ACK_PREVIOUS_SEQUENCES, NET_SEQUENCE_COUNT,
    NET_SEQUENCE_RESEND_BUFFER, NET_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Waiting,
    Active,
}

/// Per-client record: address, reliability state, and the humans it owns.
pub struct ServerClient {
    pub address: SocketAddr,
    pub timeout: f32,
    pub rtt: f32,
    /// Most recent ack we have received from this client.
    pub ack: Ack,
    pub msgs_in_history: MessageHistory,
    pub recently_resent: SequenceHistory,
    pub processed_sequence_id: SequenceId,
    pub players: Vec<EntityRef>,
    pub connected: bool,
    pub loading_done: bool,
}

impl ServerClient {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            timeout: 0.0,
            rtt: 0.5,
            ack: Ack::default(),
            msgs_in_history: MessageHistory::new(),
            recently_resent: SequenceHistory::new(NET_SEQUENCE_RESEND_BUFFER),
            processed_sequence_id: NET_SEQUENCE_INVALID,
            players: Vec::new(),
            connected: false,
            loading_done: false,
        }
    }
}

pub struct Server {
    pub common: StateCommon,
    sock: Socket,
    clients: Vec<ServerClient>,
    mode: ServerMode,
    expected_clients: usize,
    level: LevelDescriptor,
}

impl Server {
    pub fn bind(addr: SocketAddr, expected_clients: usize, level: LevelDescriptor) -> io::Result<Self> {
        Ok(Self {
            common: StateCommon::new(),
            sock: Socket::bind(addr)?,
            clients: Vec::new(),
            mode: ServerMode::Waiting,
            expected_clients,
            level,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    pub fn expected_clients(&self) -> usize {
        self.expected_clients
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.iter().filter(|c| c.connected).count()
    }

    pub fn client_rtt(&self, world: &World, player: EntityId) -> f32 {
        for client in &self.clients {
            for r in &client.players {
                if world.resolve(*r) == Some(player) {
                    return client.rtt;
                }
            }
        }
        0.0
    }

    fn all_clients_loaded(&self) -> bool {
        self.clients.iter().all(|c| c.loading_done)
    }

    fn client_owns(world: &World, client: &ServerClient, entity: EntityId) -> bool {
        let Some(control) = world.player_control(entity) else {
            return false;
        };
        let Some(player) = world.resolve(control.player) else {
            return false;
        };
        client
            .players
            .iter()
            .any(|r| world.resolve(*r) == Some(player))
    }

    /// Drain the socket and apply each connected client's queued inbound
    /// messages, in sequence order, through the ownership-checked dispatcher.
    pub fn update_start(&mut self, world: &mut World, dt: f32) {
        self.common.advance_time(dt);

        loop {
            let datagram = self
                .sock
                .recv()
                .map(|(addr, data)| (addr, data.to_vec()));
            let Some((addr, data)) = datagram else { break };
            self.common.count_inbound(data.len());
            let Some(reader) = packet_open(&data) else {
                continue;
            };
            if self.packet_handle(reader, addr, world).is_err() {
                log::debug!("malformed packet from {addr}; dropped");
            }
        }

        // apply queued messages; the +1s target always drains whatever is
        // next in sequence
        let timestamp = self.common.timestamp + 1.0;
        let now = self.common.timestamp;
        for i in 0..self.clients.len() {
            if !self.clients[i].connected {
                continue;
            }
            loop {
                let mut cursor = self.clients[i].processed_sequence_id;
                let Some((sequence_id, payload)) =
                    self.clients[i]
                        .msgs_in_history
                        .advance(&mut cursor, timestamp, now)
                else {
                    break;
                };
                self.clients[i].processed_sequence_id = cursor;

                let mut r = BitReader::new(payload.clone());
                while r.bytes_read() < payload.len() {
                    if self.msg_process(&mut r, i, world).is_err() {
                        log::debug!("failed to process client message in seq {sequence_id}");
                        break;
                    }
                }
            }
        }
    }

    /// Fixed-rate tick: consolidate outbound messages, build the state frame
    /// once all clients are loaded, and send each client its update packet.
    pub fn update_end(&mut self, world: &World, dt: f32) {
        let frame_built = if self.mode == ServerMode::Active {
            msgs_out_consolidate(&mut self.common);
            if self.all_clients_loaded() {
                // messages get the whole packet budget while clients load
                let frame = state_frame_build(
                    world,
                    self.common.local_sequence_id,
                    self.common.timestamp,
                );
                self.common.state_history.add(frame);
                true
            } else {
                false
            }
        } else {
            false
        };

        let mut i = 0;
        while i < self.clients.len() {
            self.clients[i].timeout += dt;
            if self.clients[i].timeout > NET_TIMEOUT {
                log::debug!("client {} timed out", self.clients[i].address);
                self.drop_client(i, world);
                continue;
            }
            if self.clients[i].connected {
                let packet = self.build_packet_update(i, frame_built);
                let address = self.clients[i].address;
                self.sock.send(address, &packet);
                self.common.count_outbound(packet.len());
            }
            i += 1;
        }

        if self.mode == ServerMode::Active {
            self.common.sequence_increment();
        }
    }

    fn drop_client(&mut self, index: usize, _world: &World) {
        self.clients.remove(index);
    }

    fn build_packet_init(&self) -> Vec<u8> {
        let mut w = packet_init();
        w.int(ServerPacket::Init as i64, 0, 3);
        level_write(&mut w, &self.level);
        packet_finalize(w)
    }

    fn build_packet_disconnect(&self) -> Vec<u8> {
        let mut w = packet_init();
        w.int(ServerPacket::Disconnect as i64, 0, 3);
        packet_finalize(w)
    }

    pub fn build_packet_keepalive(&self) -> Vec<u8> {
        let mut w = packet_init();
        w.int(ServerPacket::Keepalive as i64, 0, 3);
        packet_finalize(w)
    }

    fn build_packet_update(&mut self, index: usize, frame_built: bool) -> Vec<u8> {
        let now = self.common.timestamp;
        let client = &mut self.clients[index];

        let mut w = packet_init();
        w.int(ServerPacket::Update as i64, 0, 3);

        let ack = client.msgs_in_history.ack(now);
        w.int(ack.sequence_id as i64, 0, NET_SEQUENCE_COUNT as i64);
        w.u64(ack.previous_sequences);

        msgs_write(
            &mut w,
            &self.common.msgs_out_history,
            &client.ack,
            &mut client.recently_resent,
            client.rtt,
            now,
        );

        if frame_built {
            // delta against whatever frame the client last acknowledged
            let base_sequence_id = client.ack.sequence_id;
            w.int(base_sequence_id as i64, 0, NET_SEQUENCE_COUNT as i64);
            let base: Option<&StateFrame> = self
                .common
                .state_history
                .frame_by_sequence(base_sequence_id, now);
            if let Some(frame) = self.common.state_history.current() {
                super::state::write_state_frame(&mut w, frame, base);
            }
        }

        packet_finalize(w)
    }

    fn packet_handle(
        &mut self,
        mut r: BitReader,
        address: SocketAddr,
        world: &mut World,
    ) -> StreamResult<()> {
        let kind = ClientPacket::from_u8(r.int(0, 3)? as u8).ok_or(StreamError::Range)?;
        let client_index = self
            .clients
            .iter()
            .position(|c| super::transport::address_equals(c.address, address));

        match kind {
            ClientPacket::Connect => {
                if self.clients.len() < self.expected_clients || client_index.is_some() {
                    let version = r.bits(16)? as u16;
                    if version == GAME_VERSION {
                        if client_index.is_none() {
                            log::debug!("connect request from {address}");
                            self.clients.push(ServerClient::new(address));
                        }
                        let packet = self.build_packet_init();
                        self.sock.send(address, &packet);
                        self.common.count_outbound(packet.len());
                    } else {
                        // wrong version: reply Disconnect, nothing else
                        let packet = self.build_packet_disconnect();
                        self.sock.send(address, &packet);
                        self.common.count_outbound(packet.len());
                    }
                }
            }
            ClientPacket::AckInit => {
                let Some(index) = client_index else {
                    log::debug!("discarding AckInit from unknown client {address}");
                    return Ok(());
                };
                if !self.clients[index].connected {
                    log::debug!("client {address} connected");
                    self.clients[index].connected = true;

                    let mut username_bytes =
                        vec![0u8; r.int(0, MAX_USERNAME as i64)? as usize];
                    r.bytes(&mut username_bytes)?;
                    let username = String::from_utf8_lossy(&username_bytes).into_owned();

                    let local_players = r.int(0, MAX_GAMEPADS as i64)? as usize;
                    for _ in 0..local_players {
                        let team = r.int(0, MAX_PLAYERS as i64 - 1)? as i8;
                        let gamepad = r.int(0, MAX_GAMEPADS as i64 - 1)? as u8;
                        let uuid = r.u64()?;

                        let entity = world.spawn();
                        let name = if gamepad == 0 {
                            username.clone()
                        } else {
                            format!("{} [{}]", username, gamepad + 1)
                        };
                        world.attach_player_manager(
                            entity,
                            PlayerManager {
                                team,
                                username: name,
                                ..PlayerManager::default()
                            },
                        );
                        world.attach_player_human(
                            entity,
                            PlayerHuman {
                                uuid,
                                gamepad,
                                local: false,
                            },
                        );
                        let entity_ref = world.entity_ref(entity);
                        self.clients[index].players.push(entity_ref);
                    }

                    if self.connected_clients() == self.expected_clients {
                        self.mode = ServerMode::Active;
                        // replicate the world, then the loading barrier
                        let ids: Vec<EntityId> = world.iter_entities().collect();
                        for id in ids {
                            let mut w = msg_new(MessageType::EntityCreate);
                            w.int(id as i64, 0, MAX_ENTITIES as i64 - 1);
                            entity_write(&mut w, world, id);
                            msg_finalize(&mut self.common, world, w);
                        }
                        let w = msg_new(MessageType::InitDone);
                        msg_finalize(&mut self.common, world, w);
                        log::debug!("all clients connected; session active");
                    }
                }
            }
            ClientPacket::Update => {
                let Some(index) = client_index else {
                    log::debug!("discarding packet from unknown client {address}");
                    return Ok(());
                };

                let now = self.common.timestamp;
                let sequence_id = {
                    let client = &mut self.clients[index];
                    msgs_read(&mut r, &mut client.msgs_in_history, &mut client.ack, now)?
                };

                let processed = self.clients[index].processed_sequence_id;
                if processed != NET_SEQUENCE_INVALID
                    && sequence_id != NET_SEQUENCE_INVALID
                    && sequence_relative_to(sequence_id, processed) > NET_ACK_PREVIOUS_SEQUENCES
                {
                    // a frame this client needs fell out of the resend window
                    log::debug!("client {address} dropped: unrecoverable sequence gap");
                    self.drop_client(index, world);
                    return Ok(());
                }

                {
                    let client = &mut self.clients[index];
                    calculate_rtt(now, &client.ack, &self.common.msgs_out_history, &mut client.rtt);
                    client.timeout = 0.0;
                }

                let most_recent = sequence_id
                    == self.clients[index]
                        .msgs_in_history
                        .most_recent_sequence(now);

                // control blocks: accepted only for entities this client owns
                let count = r.int(0, MAX_GAMEPADS as i64)? as usize;
                for _ in 0..count {
                    let slot = r.int(0, MAX_PLAYERS as i64 - 1)? as u16;
                    let control = remote_control_read(&mut r)?;
                    let entity = world.player_controls.entity(slot);
                    if most_recent
                        && entity != crate::entity::ID_NULL
                        && world.alive(entity)
                        && Self::client_owns(world, &self.clients[index], entity)
                    {
                        if let Some(c) = world.player_control_mut(entity) {
                            c.remote_control = control;
                        }
                    }
                }
            }
            ClientPacket::Disconnect => {
                let Some(index) = client_index else {
                    log::debug!("discarding packet from unknown client {address}");
                    return Ok(());
                };
                log::debug!("client {address} disconnected");
                self.drop_client(index, world);
            }
        }
        Ok(())
    }

    /// Process one message from a client's inbound stream.
    fn msg_process(
        &mut self,
        r: &mut BitReader,
        client_index: usize,
        world: &mut World,
    ) -> StreamResult<()> {
        let t = MessageType::from_u8(r.int(0, MESSAGE_TYPE_COUNT as i64 - 1)? as u8)
            .ok_or(StreamError::Range)?;
        match t {
            MessageType::Noop => {}
            MessageType::LoadingDone => {
                self.clients[client_index].loading_done = true;
                log::debug!("client {} finished loading", self.clients[client_index].address);
            }
            MessageType::PlayerControl => {
                // ownership check: a control message for somebody else's
                // entity parses but applies nothing
                let target = r.entity_ref()?;
                let valid = world
                    .resolve(target)
                    .is_some_and(|id| Self::client_owns(world, &self.clients[client_index], id));
                let src = if valid {
                    MessageSource::Remote
                } else {
                    MessageSource::Invalid
                };
                let control = remote_control_read(r)?;
                if src != MessageSource::Invalid {
                    if let Some(id) = world.resolve(target) {
                        if let Some(c) = world.player_control_mut(id) {
                            c.remote_control = control;
                        }
                    }
                }
            }
            _ => {
                log::debug!("unexpected message type {t:?} from client");
                return Err(StreamError::Range);
            }
        }
        r.align()?;
        Ok(())
    }

    /// Queue an `EntityCreate` for a freshly finalized entity (active
    /// sessions replicate spawns immediately).
    pub fn entity_finalize(&mut self, world: &mut World, id: EntityId) {
        if self.mode == ServerMode::Active {
            let mut w = msg_new(MessageType::EntityCreate);
            w.int(id as i64, 0, MAX_ENTITIES as i64 - 1);
            entity_write(&mut w, world, id);
            msg_finalize(&mut self.common, world, w);
        }
    }

    /// Queue an `EntityRemove`; the world slot itself is freed by gameplay.
    pub fn entity_remove(&mut self, world: &mut World, id: EntityId) {
        let mut w = msg_new(MessageType::EntityRemove);
        w.int(id as i64, 0, MAX_ENTITIES as i64 - 1);
        msg_finalize(&mut self.common, world, w);
    }

    /// Send `Disconnect` to every client and reinitialize, keeping the socket.
    pub fn reset(&mut self) {
        let packet = self.build_packet_disconnect();
        for client in &self.clients {
            self.sock.send(client.address, &packet);
        }
        self.common = StateCommon::new();
        self.clients.clear();
        self.mode = ServerMode::Waiting;
    }
}
