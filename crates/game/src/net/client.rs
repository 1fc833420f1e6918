//! Client endpoint: connect handshake, snapshot interpolation, and the
//! reliable message stream back to the server.
//!
//! `Disconnected -> Connecting -> Acking -> Loading -> Connected`, with
//! retransmits on a 0.25 s timer during the handshake and a hard timeout once
//! update packets are expected.

use std::io;
use std::net::SocketAddr;

use crate::entity::{EntityId, World, MAX_ENTITIES, MAX_GAMEPADS, MAX_PLAYERS, MAX_USERNAME};

use super::bitstream::{BitReader, StreamError, StreamResult};
use super::entity_codec::entity_read;
use super::msg::{calculate_rtt, MessageHistory};
use super::packet::{packet_finalize, packet_init, packet_open};
use super::sequence::{
    sequence_more_recent, sequence_relative_to, Ack, SequenceHistory, SequenceId,
    NET_SEQUENCE_INVALID,
};
use super::state::{read_state_frame, state_frame_apply, state_frame_interpolate, TransformState};
use super::transport::Socket;
use super::{
    level_read, msg_finalize, msg_new, msgs_out_consolidate, remote_control_write, ClientPacket,
    LevelDescriptor, MessageSource, MessageType, ServerPacket, StateCommon, GAME_VERSION,
    MESSAGE_TYPE_COUNT, NET_ACK_PREVIOUS_SEQUENCES, NET_INTERPOLATION_DELAY, NET_SEQUENCE_COUNT,
    NET_SEQUENCE_RESEND_BUFFER, NET_TICK_RATE, NET_TIMEOUT,
};

const HANDSHAKE_RETRY: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Disconnected,
    Connecting,
    Acking,
    Loading,
    Connected,
}

/// One local human seat: team choice, input device, persistent identity.
#[derive(Debug, Clone, Copy)]
pub struct LocalPlayer {
    pub team: i8,
    pub gamepad: u8,
    pub uuid: u64,
}

pub struct Client {
    pub common: StateCommon,
    sock: Socket,
    mode: ClientMode,
    timeout: f32,
    tick_timer: f32,
    server_rtt: f32,
    msgs_in_history: MessageHistory,
    server_ack: Ack,
    server_address: Option<SocketAddr>,
    server_recently_resent: SequenceHistory,
    server_processed_sequence_id: SequenceId,
    username: String,
    local_players: Vec<LocalPlayer>,
    level: Option<LevelDescriptor>,
}

impl Client {
    pub fn new(username: &str, local_players: Vec<LocalPlayer>) -> io::Result<Self> {
        let sock = Socket::bind("0.0.0.0:0")?;
        Ok(Self {
            common: StateCommon::new(),
            sock,
            mode: ClientMode::Disconnected,
            timeout: 0.0,
            tick_timer: 0.0,
            server_rtt: 0.5,
            msgs_in_history: MessageHistory::new(),
            server_ack: Ack::default(),
            server_address: None,
            server_recently_resent: SequenceHistory::new(NET_SEQUENCE_RESEND_BUFFER),
            server_processed_sequence_id: NET_SEQUENCE_INVALID,
            username: username.to_owned(),
            local_players,
            level: None,
        })
    }

    pub fn connect(&mut self, address: SocketAddr) {
        self.server_address = Some(address);
        self.mode = ClientMode::Connecting;
        self.timeout = HANDSHAKE_RETRY + 1.0; // fire the first request immediately
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    pub fn rtt(&self) -> f32 {
        self.server_rtt
    }

    pub fn level(&self) -> Option<&LevelDescriptor> {
        self.level.as_ref()
    }

    pub fn local_uuids(&self) -> Vec<u64> {
        self.local_players.iter().map(|p| p.uuid).collect()
    }

    /// No usable inbound frame for several ticks.
    pub fn lagging(&self) -> bool {
        self.mode == ClientMode::Disconnected
            || self.msgs_in_history.current().is_some_and(|frame| {
                self.common.timestamp - frame.timestamp > NET_TICK_RATE * 5.0
            })
    }

    /// Drain the socket, apply the interpolated state frame, and advance the
    /// processed-message cursor. Call every frame before gameplay.
    pub fn update_start(&mut self, world: &mut World, dt: f32) {
        self.common.advance_time(dt);

        loop {
            let datagram = self
                .sock
                .recv()
                .map(|(addr, data)| (addr, data.to_vec()));
            let Some((addr, data)) = datagram else { break };
            if self.server_address != Some(addr) {
                log::debug!("discarding packet from unexpected host {addr}");
                continue;
            }
            self.common.count_inbound(data.len());
            let Some(reader) = packet_open(&data) else {
                continue;
            };
            if self.packet_handle(reader, world).is_err() {
                log::debug!("malformed packet from server; dropped");
            }
        }

        if matches!(self.mode, ClientMode::Loading | ClientMode::Connected) {
            let now = self.common.timestamp;
            let interpolation_time = now - NET_INTERPOLATION_DELAY;

            if let Some((index, frame)) = self
                .common
                .state_history
                .frame_by_timestamp(interpolation_time, now)
            {
                let frame_next = self.common.state_history.frame_next(index);
                match frame_next {
                    Some(next) => {
                        let blended =
                            state_frame_interpolate(frame, next, world, interpolation_time);
                        state_frame_apply(&blended, frame, Some(next), world);
                    }
                    None => {
                        let frame = frame.clone();
                        state_frame_apply(&frame, &frame, None, world);
                    }
                }
            }

            loop {
                let history = &self.msgs_in_history;
                let Some((sequence_id, payload)) = history.advance(
                    &mut self.server_processed_sequence_id,
                    interpolation_time,
                    now,
                ) else {
                    break;
                };
                let mut r = BitReader::new(payload.clone());
                while r.bytes_read() < payload.len() {
                    if self.msg_process(&mut r, world).is_err() {
                        log::debug!("failed to process message in seq {sequence_id}");
                        break;
                    }
                }
            }
        }
    }

    /// Tick at most once per `NET_TICK_RATE`; accumulated lag is clamped to a
    /// single tick so a stall never bursts packets.
    pub fn update_end(&mut self, world: &mut World, dt: f32) {
        self.tick_timer += dt;
        if self.tick_timer > NET_TICK_RATE {
            self.tick_timer -= NET_TICK_RATE;
            self.tick(world, dt);
        }
        self.tick_timer %= NET_TICK_RATE;
    }

    fn tick(&mut self, world: &mut World, dt: f32) {
        self.timeout += dt;
        let Some(server) = self.server_address else {
            return;
        };
        match self.mode {
            ClientMode::Disconnected => {}
            ClientMode::Connecting => {
                if self.timeout > HANDSHAKE_RETRY {
                    self.timeout = 0.0;
                    log::debug!("connecting to {server}...");
                    let packet = self.build_packet_connect();
                    self.send(server, &packet);
                }
            }
            ClientMode::Acking => {
                if self.timeout > HANDSHAKE_RETRY {
                    self.timeout = 0.0;
                    log::debug!("confirming connection to {server}...");
                    let packet = self.build_packet_ack_init();
                    self.send(server, &packet);
                }
            }
            ClientMode::Loading | ClientMode::Connected => {
                if self.timeout > NET_TIMEOUT {
                    log::debug!("lost connection to {server}");
                    self.mode = ClientMode::Disconnected;
                } else {
                    msgs_out_consolidate(&mut self.common);
                    let packet = self.build_packet_update(world);
                    self.send(server, &packet);
                    self.common.sequence_increment();
                }
            }
        }
    }

    fn send(&mut self, addr: SocketAddr, packet: &[u8]) {
        self.sock.send(addr, packet);
        self.common.count_outbound(packet.len());
    }

    fn build_packet_connect(&self) -> Vec<u8> {
        let mut w = packet_init();
        w.int(ClientPacket::Connect as i64, 0, 3);
        w.bits(GAME_VERSION as u32, 16);
        packet_finalize(w)
    }

    fn build_packet_disconnect(&self) -> Vec<u8> {
        let mut w = packet_init();
        w.int(ClientPacket::Disconnect as i64, 0, 3);
        packet_finalize(w)
    }

    fn build_packet_ack_init(&self) -> Vec<u8> {
        let mut w = packet_init();
        w.int(ClientPacket::AckInit as i64, 0, 3);
        let username = self.username.as_bytes();
        let len = username.len().min(MAX_USERNAME);
        w.int(len as i64, 0, MAX_USERNAME as i64);
        w.bytes(&username[..len]);
        w.int(self.local_players.len() as i64, 0, MAX_GAMEPADS as i64);
        for player in &self.local_players {
            w.int(player.team as i64, 0, MAX_PLAYERS as i64 - 1);
            w.int(player.gamepad as i64, 0, MAX_GAMEPADS as i64 - 1);
            w.u64(player.uuid);
        }
        packet_finalize(w)
    }

    fn build_packet_update(&mut self, world: &World) -> Vec<u8> {
        let mut w = packet_init();
        w.int(ClientPacket::Update as i64, 0, 3);

        let ack = self.msgs_in_history.ack(self.common.timestamp);
        w.int(ack.sequence_id as i64, 0, NET_SEQUENCE_COUNT as i64);
        w.u64(ack.previous_sequences);

        super::msg::msgs_write(
            &mut w,
            &self.common.msgs_out_history,
            &self.server_ack,
            &mut self.server_recently_resent,
            self.server_rtt,
            self.common.timestamp,
        );

        // local control blocks: where this client believes its avatars are
        let locals: Vec<(u16, EntityId)> = world
            .player_controls
            .iter()
            .filter(|(_, entity, _)| super::locally_controlled(world, *entity))
            .map(|(slot, entity, _)| (slot, entity))
            .collect();
        w.int(locals.len() as i64, 0, MAX_GAMEPADS as i64);
        for (slot, entity) in locals {
            w.int(slot as i64, 0, MAX_PLAYERS as i64 - 1);
            let mut control = world
                .player_control(entity)
                .map(|c| c.remote_control)
                .unwrap_or_default();
            if let Some(t) = world.transform(entity) {
                control.pos = t.pos;
                control.rot = t.rot;
                control.parent = t.parent;
            }
            remote_control_write(&mut w, &control);
        }

        packet_finalize(w)
    }

    fn packet_handle(&mut self, mut r: BitReader, world: &mut World) -> StreamResult<()> {
        let kind = ServerPacket::from_u8(r.int(0, 3)? as u8).ok_or(StreamError::Range)?;
        match kind {
            ServerPacket::Init => {
                if self.mode == ClientMode::Connecting {
                    self.level = Some(level_read(&mut r)?);
                    self.mode = ClientMode::Acking;
                    self.timeout = HANDSHAKE_RETRY + 1.0;
                }
            }
            ServerPacket::Keepalive => {
                self.timeout = 0.0;
            }
            ServerPacket::Update => {
                if self.mode == ClientMode::Acking {
                    log::debug!("connected; loading level");
                    self.mode = ClientMode::Loading;
                }

                let now = self.common.timestamp;
                let sequence_id = super::msg::msgs_read(
                    &mut r,
                    &mut self.msgs_in_history,
                    &mut self.server_ack,
                    now,
                )?;

                if self.server_processed_sequence_id != NET_SEQUENCE_INVALID
                    && sequence_id != NET_SEQUENCE_INVALID
                    && sequence_relative_to(sequence_id, self.server_processed_sequence_id)
                        > NET_ACK_PREVIOUS_SEQUENCES
                {
                    // a frame fell out of the resend window; unrecoverable
                    log::debug!("lost connection: unrecoverable sequence gap");
                    self.mode = ClientMode::Disconnected;
                    return Ok(());
                }

                calculate_rtt(
                    now,
                    &self.server_ack,
                    &self.common.msgs_out_history,
                    &mut self.server_rtt,
                );

                // the server does not always append a state frame
                if r.bytes_read() < r.bytes_total() {
                    let base_sequence_id =
                        r.int(0, NET_SEQUENCE_COUNT as i64)? as SequenceId;
                    let base = self
                        .common
                        .state_history
                        .frame_by_sequence(base_sequence_id, now);
                    let frame = read_state_frame(&mut r, sequence_id, now, base)?;

                    let newer = self
                        .common
                        .state_history
                        .current()
                        .map_or(true, |current| {
                            sequence_more_recent(frame.sequence_id, current.sequence_id)
                        });
                    if newer {
                        // reconcile local avatars against the fresh server
                        // pose immediately, without interpolation
                        let updates: Vec<(EntityId, TransformState)> = world
                            .player_controls
                            .iter()
                            .filter_map(|(_, entity, _)| {
                                frame.transforms.get(&entity).map(|s| (entity, *s))
                            })
                            .collect();
                        for (entity, s) in updates {
                            if world.alive(entity) && world.slot(entity).revision == s.revision {
                                if let Some(control) = world.player_control_mut(entity) {
                                    control.remote_control.pos = s.pos;
                                    control.remote_control.rot = s.rot;
                                    control.remote_control.parent = s.parent;
                                }
                            }
                        }

                        self.common.state_history.add(frame);
                    }
                }

                self.timeout = 0.0;
            }
            ServerPacket::Disconnect => {
                log::debug!("connection closed by server");
                self.mode = ClientMode::Disconnected;
            }
        }
        Ok(())
    }

    fn msg_process(&mut self, r: &mut BitReader, world: &mut World) -> StreamResult<()> {
        let t = MessageType::from_u8(r.int(0, MESSAGE_TYPE_COUNT as i64 - 1)? as u8)
            .ok_or(StreamError::Range)?;
        match t {
            MessageType::Noop => {}
            MessageType::EntityCreate => {
                let id = r.int(0, MAX_ENTITIES as i64 - 1)? as EntityId;
                let uuids = self.local_uuids();
                entity_read(r, world, id, &uuids)?;
                if self.mode == ClientMode::Connected {
                    world.slot_mut(id).awake = true;
                }
            }
            MessageType::EntityRemove => {
                let id = r.int(0, MAX_ENTITIES as i64 - 1)? as EntityId;
                world.despawn(id);
            }
            MessageType::InitDone => {
                debug_assert_eq!(self.mode, ClientMode::Loading);
                let ids: Vec<EntityId> = world.iter_entities().collect();
                for id in ids {
                    world.slot_mut(id).awake = true;
                }
                // let the server know we are in the game
                let w = msg_new(MessageType::LoadingDone);
                msg_finalize(&mut self.common, world, w);
                self.mode = ClientMode::Connected;
                log::debug!("load complete; session connected");
            }
            _ => {
                // gameplay messages share the loopback dispatcher
                super::msg_process_gameplay(t, r, MessageSource::Remote, world)?;
            }
        }
        r.align()?;
        Ok(())
    }

    /// Send `Disconnect` and reinitialize, keeping the socket.
    pub fn reset(&mut self) {
        if self.mode == ClientMode::Connected {
            if let Some(server) = self.server_address {
                let packet = self.build_packet_disconnect();
                self.send(server, &packet);
            }
        }
        self.common = StateCommon::new();
        self.mode = ClientMode::Disconnected;
        self.timeout = 0.0;
        self.tick_timer = 0.0;
        self.server_rtt = 0.5;
        self.msgs_in_history = MessageHistory::new();
        self.server_ack = Ack::default();
        self.server_address = None;
        self.server_recently_resent = SequenceHistory::new(NET_SEQUENCE_RESEND_BUFFER);
        self.server_processed_sequence_id = NET_SEQUENCE_INVALID;
        self.level = None;
    }
}
