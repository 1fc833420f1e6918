//! Deterministic client-server state replication.
//!
//! Both endpoints run the same core: a reliable-in-order message stream plus
//! delta-compressed state snapshots, layered over unreliable datagrams. The
//! server is authoritative for state-frame builds; clients apply interpolated
//! snapshots and predict their own controls.

pub mod bitstream;
pub mod client;
pub mod entity_codec;
pub mod msg;
pub mod packet;
pub mod sequence;
pub mod server;
pub mod state;
pub mod transport;

use glam::Vec3;

use crate::entity::{EntityId, Family, RemoteControl, World, MAX_PLAYERS};

use bitstream::{BitReader, BitWriter, Resolution, StreamError, StreamResult};
use msg::MessageHistory;
use sequence::{sequence_advance, SequenceId};
use state::StateHistory;

pub const GAME_VERSION: u16 = 1;

pub const NET_TICK_RATE: f32 = 1.0 / 60.0;
pub const NET_INTERPOLATION_DELAY: f32 = NET_TICK_RATE * 4.0 + 0.02;
pub const NET_MAX_PACKET_SIZE: usize = 2000;
pub const NET_SEQUENCE_COUNT: u16 = 512;
pub const NET_ACK_PREVIOUS_SEQUENCES: i32 = 64;
pub const NET_PREVIOUS_SEQUENCES_SEARCH: usize = 100;
pub const NET_MESSAGE_BUFFER: usize = 256;
pub const NET_HISTORY_SIZE: usize = 256;
pub const NET_TIMEOUT: f32 = NET_MESSAGE_BUFFER as f32 * NET_TICK_RATE;
pub const NET_MAX_MESSAGES_SIZE: usize = NET_MAX_PACKET_SIZE / 2;
pub const NET_SEQUENCE_RESEND_BUFFER: usize = 16;
pub const NET_MAX_FRAME_TIME: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientPacket {
    Connect = 0,
    Update,
    AckInit,
    Disconnect,
}

impl ClientPacket {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Connect),
            1 => Some(Self::Update),
            2 => Some(Self::AckInit),
            3 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPacket {
    Init = 0,
    Keepalive,
    Update,
    Disconnect,
}

impl ServerPacket {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Init),
            1 => Some(Self::Keepalive),
            2 => Some(Self::Update),
            3 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Noop = 0,
    EntityCreate,
    EntityRemove,
    InitDone,
    LoadingDone,
    PlayerControl,
    DroneFire,
    HealthChange,
    TeamScore,
}

pub const MESSAGE_TYPE_COUNT: u8 = 9;

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Noop),
            1 => Some(Self::EntityCreate),
            2 => Some(Self::EntityRemove),
            3 => Some(Self::InitDone),
            4 => Some(Self::LoadingDone),
            5 => Some(Self::PlayerControl),
            6 => Some(Self::DroneFire),
            7 => Some(Self::HealthChange),
            8 => Some(Self::TeamScore),
            _ => None,
        }
    }
}

/// Where a message came from. Control messages from a client that does not
/// own the referenced entity are tagged `Invalid` and ignored by dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Loopback,
    Remote,
    Invalid,
}

/// The level descriptor carried by the server's `Init` packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelDescriptor {
    pub id: i16,
    pub far_plane: f32,
    pub ambient: [f32; 3],
}

impl Default for LevelDescriptor {
    fn default() -> Self {
        Self {
            id: 0,
            far_plane: 100.0,
            ambient: [0.1, 0.1, 0.1],
        }
    }
}

pub fn level_write(w: &mut BitWriter, level: &LevelDescriptor) {
    w.bits(level.id as u16 as u32, 16);
    w.f32(level.far_plane);
    for channel in level.ambient {
        w.f32_range(channel, 0.0, 1.0, 8);
    }
}

pub fn level_read(r: &mut BitReader) -> StreamResult<LevelDescriptor> {
    Ok(LevelDescriptor {
        id: r.bits(16)? as u16 as i16,
        far_plane: r.f32()?,
        ambient: [
            r.f32_range(0.0, 1.0, 8)?,
            r.f32_range(0.0, 1.0, 8)?,
            r.f32_range(0.0, 1.0, 8)?,
        ],
    })
}

pub fn remote_control_write(w: &mut BitWriter, control: &RemoteControl) {
    let moving = control.movement.length_squared() > 0.0;
    w.bool(moving);
    if moving {
        w.f32_range(control.movement.x, -1.0, 1.0, 16);
        w.f32_range(control.movement.y, -1.0, 1.0, 16);
        w.f32_range(control.movement.z, -1.0, 1.0, 16);
    }
    w.entity_ref(control.parent);
    w.position(control.pos, Resolution::High);
    w.quat(control.rot, Resolution::High);
}

pub fn remote_control_read(r: &mut BitReader) -> StreamResult<RemoteControl> {
    let movement = if r.bool()? {
        Vec3::new(
            r.f32_range(-1.0, 1.0, 16)?,
            r.f32_range(-1.0, 1.0, 16)?,
            r.f32_range(-1.0, 1.0, 16)?,
        )
    } else {
        Vec3::ZERO
    };
    Ok(RemoteControl {
        movement,
        parent: r.entity_ref()?,
        pos: r.position(Resolution::High)?,
        rot: r.quat(Resolution::High)?,
    })
}

/// State shared by both endpoints: the outbound message machinery, the state
/// frame history, and the clock.
#[derive(Default)]
pub struct StateCommon {
    pub msgs_out_history: MessageHistory,
    pub msgs_out: Vec<Vec<u8>>,
    pub local_sequence_id: SequenceId,
    pub state_history: StateHistory,
    pub timestamp: f32,
    pub bandwidth_in: usize,
    pub bandwidth_out: usize,
    bandwidth_in_counter: usize,
    bandwidth_out_counter: usize,
}

impl StateCommon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock, clamped so a long stall cannot burst the
    /// integrator. Bandwidth counters latch every half second.
    pub fn advance_time(&mut self, dt: f32) -> f32 {
        let dt = dt.min(NET_MAX_FRAME_TIME);
        let previous = self.timestamp;
        self.timestamp += dt;
        if (self.timestamp * 2.0) as i32 > (previous * 2.0) as i32 {
            self.bandwidth_in = self.bandwidth_in_counter;
            self.bandwidth_out = self.bandwidth_out_counter;
            self.bandwidth_in_counter = 0;
            self.bandwidth_out_counter = 0;
        }
        dt
    }

    pub fn count_inbound(&mut self, bytes: usize) {
        self.bandwidth_in_counter += bytes;
    }

    pub fn count_outbound(&mut self, bytes: usize) {
        self.bandwidth_out_counter += bytes;
    }

    pub fn sequence_increment(&mut self) {
        self.local_sequence_id = sequence_advance(self.local_sequence_id, 1);
    }
}

/// Start a message of the given type. Finish with [`msg_finalize`].
pub fn msg_new(t: MessageType) -> BitWriter {
    let mut w = BitWriter::new();
    w.int(t as i64, 0, MESSAGE_TYPE_COUNT as i64 - 1);
    w
}

fn peek_type(bytes: &[u8]) -> Option<MessageType> {
    let mut r = BitReader::new(bytes.to_vec());
    let v = r.int(0, MESSAGE_TYPE_COUNT as i64 - 1).ok()?;
    MessageType::from_u8(v as u8)
}

/// Queue a finished message for the next consolidation. Gameplay messages are
/// also applied locally through the same dispatcher that handles remote ones,
/// so authoritative-side effects take the identical path.
pub fn msg_finalize(common: &mut StateCommon, world: &mut World, w: BitWriter) {
    let bytes = w.finish();
    if let Some(t) = peek_type(&bytes) {
        if !matches!(
            t,
            MessageType::Noop
                | MessageType::EntityCreate
                | MessageType::EntityRemove
                | MessageType::InitDone
                | MessageType::LoadingDone
        ) {
            let mut r = BitReader::new(bytes.clone());
            if msg_process_common(&mut r, MessageSource::Loopback, world).is_err() {
                log::debug!("loopback message failed to apply");
            }
        }
    }
    common.msgs_out.push(bytes);
}

/// Consolidate this tick's queued messages into one outbound frame. A `Noop`
/// is injected when the queue is empty so every tick advances the sequence.
pub fn msgs_out_consolidate(common: &mut StateCommon) {
    if common.msgs_out.is_empty() {
        let w = msg_new(MessageType::Noop);
        common.msgs_out.push(w.finish());
    }
    msg::msgs_out_consolidate(
        &mut common.msgs_out,
        &mut common.msgs_out_history,
        common.local_sequence_id,
        common.timestamp,
    );
}

/// Gameplay message dispatch, shared by loopback and remote paths. Messages
/// tagged `Invalid` are parsed but not applied.
pub fn msg_process_common(
    r: &mut BitReader,
    src: MessageSource,
    world: &mut World,
) -> StreamResult<()> {
    let t = MessageType::from_u8(r.int(0, MESSAGE_TYPE_COUNT as i64 - 1)? as u8)
        .ok_or(StreamError::Range)?;
    msg_process_gameplay(t, r, src, world)
}

/// Dispatch a gameplay message whose type tag has already been consumed.
pub fn msg_process_gameplay(
    t: MessageType,
    r: &mut BitReader,
    src: MessageSource,
    world: &mut World,
) -> StreamResult<()> {
    match t {
        MessageType::PlayerControl => {
            let target = r.entity_ref()?;
            let control = remote_control_read(r)?;
            if src != MessageSource::Invalid {
                if let Some(id) = world.resolve(target) {
                    if let Some(c) = world.player_control_mut(id) {
                        c.remote_control = control;
                    }
                }
            }
        }
        MessageType::DroneFire => {
            let target = r.entity_ref()?;
            let dir = r.position(Resolution::High)?;
            if src != MessageSource::Invalid {
                if let Some(id) = world.resolve(target) {
                    if let Some(drone) = world.drone_mut(id) {
                        if drone.charges > 0 {
                            drone.charges -= 1;
                            drone.cooldown = crate::entity::DRONE_COOLDOWN;
                        }
                    }
                    let _ = dir;
                }
            }
        }
        MessageType::HealthChange => {
            let target = r.entity_ref()?;
            let delta = r.int(-127, 127)? as i8;
            if src != MessageSource::Invalid {
                if let Some(id) = world.resolve(target) {
                    if let Some(health) = world.health_mut(id) {
                        health.hp = (health.hp + delta).clamp(0, health.hp_max);
                    }
                }
            }
        }
        MessageType::TeamScore => {
            let slot = r.int(0, MAX_PLAYERS as i64 - 1)? as u16;
            let kills = r.int(-32767, 32767)? as i16;
            if src != MessageSource::Invalid {
                if let Some(manager) = world.player_managers.get_mut(slot) {
                    manager.kills = kills;
                }
            }
        }
        _ => {
            log::debug!("unknown gameplay message type {t:?}");
            return Err(StreamError::Range);
        }
    }
    Ok(())
}

/// Whether `id` is a local human's avatar (client-side prediction owner).
pub fn locally_controlled(world: &World, id: EntityId) -> bool {
    world.has(id, Family::PlayerControl)
        && world.player_control(id).is_some_and(|control| {
            world
                .resolve(control.player)
                .and_then(|player| world.player_human(player))
                .is_some_and(|human| human.local)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Drone;

    #[test]
    fn test_noop_injected_on_empty_queue() {
        let mut common = StateCommon::new();
        msgs_out_consolidate(&mut common);
        let frame = common.msgs_out_history.current().unwrap();
        assert!(frame.bytes > 0);
        assert!(common.msgs_out.is_empty());
    }

    #[test]
    fn test_loopback_applies_gameplay_message() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_drone(e, Drone::default());
        let target = world.entity_ref(e);

        let mut common = StateCommon::new();
        let mut w = msg_new(MessageType::DroneFire);
        w.entity_ref(target);
        w.position(Vec3::X, Resolution::High);
        msg_finalize(&mut common, &mut world, w);

        assert_eq!(world.drone(e).unwrap().charges, 2);
        assert_eq!(common.msgs_out.len(), 1);
    }

    #[test]
    fn test_invalid_source_parses_but_ignores() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_drone(e, Drone::default());
        let target = world.entity_ref(e);

        let mut w = msg_new(MessageType::DroneFire);
        w.entity_ref(target);
        w.position(Vec3::X, Resolution::High);
        let mut r = BitReader::new(w.finish());
        msg_process_common(&mut r, MessageSource::Invalid, &mut world).unwrap();

        assert_eq!(world.drone(e).unwrap().charges, 3);
    }

    #[test]
    fn test_bandwidth_window_latches() {
        let mut common = StateCommon::new();
        common.count_inbound(100);
        common.advance_time(0.6);
        assert_eq!(common.bandwidth_in, 100);
        common.advance_time(0.1);
        assert_eq!(common.bandwidth_in, 100);
    }

    #[test]
    fn test_advance_time_clamps() {
        let mut common = StateCommon::new();
        let dt = common.advance_time(5.0);
        assert_eq!(dt, NET_MAX_FRAME_TIME);
        assert_eq!(common.timestamp, NET_MAX_FRAME_TIME);
    }

    #[test]
    fn test_level_descriptor_roundtrip() {
        let level = LevelDescriptor {
            id: 12,
            far_plane: 250.0,
            ambient: [0.2, 0.4, 0.6],
        };
        let mut w = BitWriter::new();
        level_write(&mut w, &level);
        let mut r = BitReader::new(w.finish());
        let decoded = level_read(&mut r).unwrap();
        assert_eq!(decoded.id, 12);
        assert_eq!(decoded.far_plane, 250.0);
        for i in 0..3 {
            assert!((decoded.ambient[i] - level.ambient[i]).abs() < 0.01);
        }
    }
}
