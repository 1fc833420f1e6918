//! State frames: per-tick snapshots of replicated world state, delta-encoded
//! against a baseline the peer has acknowledged.
//!
//! The server builds one frame per tick; clients hold a rolling history and
//! render `NET_INTERPOLATION_DELAY` behind realtime, blending between the two
//! frames that bracket the render timestamp.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};

use crate::entity::{
    Ability, AssetId, EntityId, EntityRef, Family, Revision, Upgrade, World, ABILITY_COUNT,
    ASSET_NULL, ID_NULL, MAX_ABILITIES, MAX_ENTITIES, MAX_PLAYERS, MINION_ATTACK_TIME,
    PLAYER_SPAWN_DELAY, UPGRADE_COUNT,
};
use crate::math::{angle_range, closest_angle, lerp};

use super::bitstream::{BitReader, BitWriter, Resolution, StreamResult};
use super::sequence::{sequence_more_recent, SequenceId};
use super::{NET_HISTORY_SIZE, NET_PREVIOUS_SEQUENCES_SEARCH, NET_TICK_RATE, NET_TIMEOUT};

use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformState {
    pub revision: Revision,
    pub resolution: Resolution,
    pub pos: Vec3,
    pub rot: Quat,
    pub parent: EntityRef,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            revision: 0,
            resolution: Resolution::Medium,
            pos: Vec3::ZERO,
            rot: Quat::IDENTITY,
            parent: crate::entity::REF_NULL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerManagerState {
    pub active: bool,
    pub spawn_timer: f32,
    pub state_timer: f32,
    pub upgrades: u32,
    pub abilities: [Ability; MAX_ABILITIES],
    pub current_upgrade: Upgrade,
    pub instance: EntityRef,
    pub credits: i16,
    pub kills: i16,
    pub respawns: i16,
}

impl Default for PlayerManagerState {
    fn default() -> Self {
        Self {
            active: false,
            spawn_timer: 0.0,
            state_timer: 0.0,
            upgrades: 0,
            abilities: [Ability::None; MAX_ABILITIES],
            current_upgrade: Upgrade::None,
            instance: crate::entity::REF_NULL,
            credits: 0,
            kills: 0,
            respawns: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DroneState {
    pub active: bool,
    pub revision: Revision,
    pub charges: i8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinionState {
    pub rotation: f32,
    pub attack_timer: f32,
    pub animation: AssetId,
    pub animation_time: f32,
}

impl Default for MinionState {
    fn default() -> Self {
        Self {
            rotation: 0.0,
            attack_timer: 0.0,
            animation: ASSET_NULL,
            animation_time: 0.0,
        }
    }
}

/// A snapshot of all replicated world state at one tick.
#[derive(Debug, Clone, Default)]
pub struct StateFrame {
    pub timestamp: f32,
    pub sequence_id: SequenceId,
    pub transforms: BTreeMap<EntityId, TransformState>,
    pub players: [PlayerManagerState; MAX_PLAYERS],
    pub drones: [DroneState; MAX_PLAYERS],
    pub minions: BTreeMap<EntityId, MinionState>,
}

/// Entities whose kind is on the whitelist of networked movers.
pub fn transform_filter(world: &World, id: EntityId) -> bool {
    world.has(id, Family::Drone)
        || world.has(id, Family::EnergyPickup)
        || world.has(id, Family::Projectile)
        || world.has(id, Family::Rocket)
        || world.has(id, Family::Minion)
        || world.has(id, Family::Sensor)
        || world.has(id, Family::Grenade)
}

pub fn transform_resolution(world: &World, id: EntityId) -> Resolution {
    if world.has(id, Family::Drone) {
        Resolution::High
    } else {
        Resolution::Medium
    }
}

fn rot_tolerance(a: Resolution, b: Resolution) -> f32 {
    let res = a.max(b);
    match res {
        Resolution::Low => 0.002,
        Resolution::Medium => 0.001,
        Resolution::High => 0.0001,
    }
}

fn pos_tolerance(a: Resolution, b: Resolution) -> f32 {
    let res = a.max(b);
    match res {
        Resolution::Low => 0.008,
        Resolution::Medium => 0.002,
        Resolution::High => 0.001,
    }
}

fn equal_states_quat(a: &TransformState, b: &TransformState) -> bool {
    a.rot.angle_between(b.rot) < rot_tolerance(a.resolution, b.resolution)
}

fn equal_states_transform(a: &TransformState, b: &TransformState) -> bool {
    let tolerance = pos_tolerance(a.resolution, b.resolution);
    a.revision == b.revision
        && a.resolution == b.resolution
        && a.parent == b.parent
        && equal_states_quat(a, b)
        && (a.pos.x / tolerance) as i32 == (b.pos.x / tolerance) as i32
        && (a.pos.y / tolerance) as i32 == (b.pos.y / tolerance) as i32
        && (a.pos.z / tolerance) as i32 == (b.pos.z / tolerance) as i32
}

fn equal_transform_entries(a: Option<&TransformState>, b: Option<&TransformState>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => equal_states_transform(a, b),
        _ => false,
    }
}

fn equal_states_minion(a: &MinionState, b: &MinionState) -> bool {
    (a.rotation - b.rotation).abs() < PI * 2.0 / 256.0
        && (a.animation_time - b.animation_time).abs() < 0.01
        && a.attack_timer == 0.0
        && b.attack_timer == 0.0
        && a.animation == b.animation
}

fn equal_minion_entries(a: Option<&MinionState>, b: Option<&MinionState>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => equal_states_minion(a, b),
        _ => false,
    }
}

fn equal_states_player(a: &PlayerManagerState, b: &PlayerManagerState) -> bool {
    a.spawn_timer == b.spawn_timer
        && a.state_timer == b.state_timer
        && a.upgrades == b.upgrades
        && a.current_upgrade == b.current_upgrade
        && a.instance == b.instance
        && a.credits == b.credits
        && a.kills == b.kills
        && a.respawns == b.respawns
        && a.active == b.active
        && a.abilities == b.abilities
}

fn equal_states_drone(a: &DroneState, b: &DroneState) -> bool {
    a.revision == b.revision && a.active == b.active && a.charges == b.charges
}

fn write_transform(w: &mut BitWriter, t: &TransformState, rot_base: Option<&TransformState>) {
    w.bits(t.resolution as u32, 2);
    w.position(t.pos, t.resolution);
    let rot_changed = rot_base.map_or(true, |base| !equal_states_quat(t, base));
    w.bool(rot_changed);
    if rot_changed {
        w.quat(t.rot, t.resolution);
    }
}

fn read_transform(
    r: &mut BitReader,
    t: &mut TransformState,
    rot_base: Option<&TransformState>,
) -> StreamResult<()> {
    t.resolution = Resolution::from_u8(r.bits(2)? as u8);
    t.pos = r.position(t.resolution)?;
    if r.bool()? {
        t.rot = r.quat(t.resolution)?;
    } else if let Some(base) = rot_base {
        t.rot = base.rot;
    }
    Ok(())
}

fn write_player(w: &mut BitWriter, state: &PlayerManagerState, base: Option<&PlayerManagerState>) {
    let b = base.map_or(true, |b| state.spawn_timer != b.spawn_timer);
    w.bool(b);
    if b {
        w.f32_range(state.spawn_timer, 0.0, PLAYER_SPAWN_DELAY, 8);
    }

    let b = base.map_or(true, |b| state.state_timer != b.state_timer);
    w.bool(b);
    if b {
        w.f32_range(state.state_timer, 0.0, 10.0, 10);
    }

    let b = base.map_or(true, |b| state.upgrades != b.upgrades);
    w.bool(b);
    if b {
        w.bits(state.upgrades, UPGRADE_COUNT as u32);
    }

    for i in 0..MAX_ABILITIES {
        let b = base.map_or(true, |bb| state.abilities[i] != bb.abilities[i]);
        w.bool(b);
        if b {
            w.int(state.abilities[i] as i64, 0, ABILITY_COUNT as i64);
        }
    }

    let b = base.map_or(true, |b| state.current_upgrade != b.current_upgrade);
    w.bool(b);
    if b {
        w.int(state.current_upgrade as i64, 0, UPGRADE_COUNT as i64);
    }

    let b = base.map_or(true, |b| state.instance != b.instance);
    w.bool(b);
    if b {
        w.entity_ref(state.instance);
    }

    let b = base.map_or(true, |b| state.credits != b.credits);
    w.bool(b);
    if b {
        w.bits(state.credits as u16 as u32, 16);
    }

    let b = base.map_or(true, |b| state.kills != b.kills);
    w.bool(b);
    if b {
        w.bits(state.kills as u16 as u32, 16);
    }

    let b = base.map_or(true, |b| state.respawns != b.respawns);
    w.bool(b);
    if b {
        w.bits(state.respawns as u16 as u32, 16);
    }
}

fn read_player(r: &mut BitReader, state: &mut PlayerManagerState) -> StreamResult<()> {
    state.active = true;
    if r.bool()? {
        state.spawn_timer = r.f32_range(0.0, PLAYER_SPAWN_DELAY, 8)?;
    }
    if r.bool()? {
        state.state_timer = r.f32_range(0.0, 10.0, 10)?;
    }
    if r.bool()? {
        state.upgrades = r.bits(UPGRADE_COUNT as u32)?;
    }
    for i in 0..MAX_ABILITIES {
        if r.bool()? {
            state.abilities[i] = Ability::from_u8(r.int(0, ABILITY_COUNT as i64)? as u8);
        }
    }
    if r.bool()? {
        state.current_upgrade = Upgrade::from_u8(r.int(0, UPGRADE_COUNT as i64)? as u8);
    }
    if r.bool()? {
        state.instance = r.entity_ref()?;
    }
    if r.bool()? {
        state.credits = r.bits(16)? as u16 as i16;
    }
    if r.bool()? {
        state.kills = r.bits(16)? as u16 as i16;
    }
    if r.bool()? {
        state.respawns = r.bits(16)? as u16 as i16;
    }
    Ok(())
}

fn write_minion(w: &mut BitWriter, state: &MinionState, base: Option<&MinionState>) {
    let b = base.map_or(true, |b| (state.rotation - b.rotation).abs() > PI * 2.0 / 256.0);
    w.bool(b);
    if b {
        w.f32_range(state.rotation, -PI, PI, 8);
    }

    let b = base.map_or(true, |b| state.animation != b.animation);
    w.bool(b);
    if b {
        w.asset(state.animation);
    }

    let b = base.map_or(true, |_| state.attack_timer > 0.0);
    w.bool(b);
    if b {
        w.f32_range(state.attack_timer, 0.0, MINION_ATTACK_TIME, 8);
    }

    w.f32_range(state.animation_time, 0.0, 20.0, 11);
}

fn read_minion(r: &mut BitReader, state: &mut MinionState) -> StreamResult<()> {
    if r.bool()? {
        state.rotation = r.f32_range(-PI, PI, 8)?;
    }
    if r.bool()? {
        state.animation = r.asset()?;
    }
    if r.bool()? {
        state.attack_timer = r.f32_range(0.0, MINION_ATTACK_TIME, 8)?;
    } else {
        state.attack_timer = 0.0;
    }
    state.animation_time = r.f32_range(0.0, 20.0, 11)?;
    Ok(())
}

fn changed_indices<T, F>(
    frame: &BTreeMap<EntityId, T>,
    base: Option<&BTreeMap<EntityId, T>>,
    equal: F,
) -> Vec<EntityId>
where
    F: Fn(Option<&T>, Option<&T>) -> bool,
{
    let mut indices: Vec<EntityId> = frame.keys().copied().collect();
    if let Some(base) = base {
        for index in base.keys() {
            if !frame.contains_key(index) {
                indices.push(*index);
            }
        }
        indices.sort_unstable();
        indices.dedup();
    }
    indices.retain(|index| {
        !equal(
            frame.get(index),
            base.and_then(|base| base.get(index)),
        )
    });
    indices
}

/// Serialize a frame against a baseline the peer already holds.
pub fn write_state_frame(w: &mut BitWriter, frame: &StateFrame, base: Option<&StateFrame>) {
    // transforms
    {
        let changed = changed_indices(
            &frame.transforms,
            base.map(|b| &b.transforms),
            equal_transform_entries,
        );
        w.int(changed.len() as i64, 0, MAX_ENTITIES as i64);
        for index in changed {
            w.int(index as i64, 0, MAX_ENTITIES as i64 - 1);
            match frame.transforms.get(&index) {
                None => w.bool(false),
                Some(t) => {
                    w.bool(true);
                    let base_t = base.and_then(|b| b.transforms.get(&index));
                    let revision_changed = base_t.map_or(true, |b| b.revision != t.revision);
                    w.bool(revision_changed);
                    if revision_changed {
                        w.bits(t.revision as u32, 16);
                    }
                    let parent_changed =
                        revision_changed || base_t.map_or(true, |b| b.parent != t.parent);
                    w.bool(parent_changed);
                    if parent_changed {
                        w.entity_ref(t.parent);
                    }
                    let rot_base = if revision_changed { None } else { base_t };
                    write_transform(w, t, rot_base);
                }
            }
        }
    }

    // players
    for i in 0..MAX_PLAYERS {
        let state = &frame.players[i];
        let serialize =
            state.active && base.map_or(true, |b| !equal_states_player(state, &b.players[i]));
        w.bool(serialize);
        if serialize {
            write_player(w, state, base.map(|b| &b.players[i]));
        }
    }

    // drones only ever delta against a baseline; initial state rides on the
    // entity create message
    for i in 0..MAX_PLAYERS {
        let state = &frame.drones[i];
        let serialize = state.active
            && base.is_some_and(|b| !equal_states_drone(state, &b.drones[i]));
        w.bool(serialize);
        if serialize {
            let base_drone = base.map(|b| &b.drones[i]);
            let changed = base_drone.is_some_and(|b| state.charges != b.charges);
            w.bool(changed);
            if changed {
                w.int(state.charges as i64, 0, crate::entity::DRONE_CHARGES as i64);
            }
        }
    }

    // minions
    {
        let changed = changed_indices(
            &frame.minions,
            base.map(|b| &b.minions),
            equal_minion_entries,
        );
        w.int(changed.len() as i64, 0, MAX_ENTITIES as i64);
        for index in changed {
            w.int(index as i64, 0, MAX_ENTITIES as i64 - 1);
            match frame.minions.get(&index) {
                None => w.bool(false),
                Some(m) => {
                    w.bool(true);
                    write_minion(w, m, base.and_then(|b| b.minions.get(&index)));
                }
            }
        }
    }
}

/// Deserialize a frame on top of the baseline (cloned first).
pub fn read_state_frame(
    r: &mut BitReader,
    sequence_id: SequenceId,
    timestamp: f32,
    base: Option<&StateFrame>,
) -> StreamResult<StateFrame> {
    let mut frame = base.cloned().unwrap_or_default();
    frame.sequence_id = sequence_id;
    frame.timestamp = timestamp;

    // transforms
    {
        let changed = r.int(0, MAX_ENTITIES as i64)?;
        for _ in 0..changed {
            let index = r.int(0, MAX_ENTITIES as i64 - 1)? as EntityId;
            if !r.bool()? {
                frame.transforms.remove(&index);
                continue;
            }
            let base_t = base.and_then(|b| b.transforms.get(&index)).copied();
            let mut t = base_t.unwrap_or_default();
            let revision_changed = r.bool()?;
            if revision_changed {
                t.revision = r.bits(16)? as Revision;
            }
            if r.bool()? {
                t.parent = r.entity_ref()?;
            }
            let rot_base = if revision_changed {
                None
            } else {
                base_t.as_ref()
            };
            read_transform(r, &mut t, rot_base)?;
            frame.transforms.insert(index, t);
        }
    }

    // players
    for i in 0..MAX_PLAYERS {
        if r.bool()? {
            read_player(r, &mut frame.players[i])?;
        }
    }

    // drones
    for i in 0..MAX_PLAYERS {
        if r.bool()? {
            frame.drones[i].active = true;
            if r.bool()? {
                frame.drones[i].charges =
                    r.int(0, crate::entity::DRONE_CHARGES as i64)? as i8;
            }
        }
    }

    // minions
    {
        let changed = r.int(0, MAX_ENTITIES as i64)?;
        for _ in 0..changed {
            let index = r.int(0, MAX_ENTITIES as i64 - 1)? as EntityId;
            if !r.bool()? {
                frame.minions.remove(&index);
                continue;
            }
            let mut m = base
                .and_then(|b| b.minions.get(&index))
                .copied()
                .unwrap_or_default();
            read_minion(r, &mut m)?;
            frame.minions.insert(index, m);
        }
    }

    Ok(frame)
}

/// Snapshot the live world. Server side; `sequence_id` is the tick's local
/// sequence.
pub fn state_frame_build(world: &World, sequence_id: SequenceId, timestamp: f32) -> StateFrame {
    let mut frame = StateFrame {
        timestamp,
        sequence_id,
        ..StateFrame::default()
    };

    for (_slot, entity, t) in world.transforms.iter() {
        if !world.alive(entity) || !transform_filter(world, entity) {
            continue;
        }
        frame.transforms.insert(
            entity,
            TransformState {
                revision: world.slot(entity).revision,
                resolution: transform_resolution(world, entity),
                pos: t.pos,
                rot: t.rot,
                parent: t.parent,
            },
        );
    }

    for (slot, _entity, manager) in world.player_managers.iter() {
        if (slot as usize) >= MAX_PLAYERS {
            continue;
        }
        frame.players[slot as usize] = PlayerManagerState {
            active: true,
            spawn_timer: manager.spawn_timer,
            state_timer: manager.state_timer,
            upgrades: manager.upgrades,
            abilities: manager.abilities,
            current_upgrade: manager.current_upgrade,
            instance: manager.instance,
            credits: manager.credits,
            kills: manager.kills,
            respawns: manager.respawns,
        };
    }

    for (slot, _entity, drone) in world.drones.iter() {
        if (slot as usize) >= MAX_PLAYERS {
            continue;
        }
        frame.drones[slot as usize] = DroneState {
            active: true,
            revision: world.drones.revision(slot),
            charges: drone.charges,
        };
    }

    for (_slot, entity, minion) in world.minions.iter() {
        if !world.alive(entity) {
            continue;
        }
        let rotation = world
            .walker(entity)
            .map_or(0.0, |walker| angle_range(walker.rotation));
        frame.minions.insert(
            entity,
            MinionState {
                rotation,
                attack_timer: minion.attack_timer,
                animation: minion.animation,
                animation_time: minion.animation_time,
            },
        );
    }

    frame
}

/// Absolute position/rotation of an entity's transform, walking parents
/// through the snapshot where tracked and through the live world otherwise.
pub fn transform_absolute(
    frame: &StateFrame,
    world: &World,
    id: EntityId,
) -> (Vec3, Quat) {
    let mut abs_pos = Vec3::ZERO;
    let mut abs_rot = Quat::IDENTITY;
    let mut index = id;
    for _ in 0..MAX_ENTITIES {
        if index == ID_NULL {
            break;
        }
        if let Some(state) = frame.transforms.get(&index) {
            abs_rot = state.rot * abs_rot;
            abs_pos = state.rot * abs_pos + state.pos;
            index = state.parent.id;
        } else if let Some(t) = world.transform(index) {
            abs_rot = t.rot * abs_rot;
            abs_pos = t.rot * abs_pos + t.pos;
            index = if world.resolve(t.parent).is_some() {
                t.parent.id
            } else {
                ID_NULL
            };
        } else {
            break;
        }
    }
    (abs_pos, abs_rot)
}

/// Convert an absolute pose into the local space of `parent`'s transform.
fn transform_absolute_to_relative(
    frame: &StateFrame,
    world: &World,
    parent: EntityId,
    pos: &mut Vec3,
    rot: &mut Quat,
) {
    let (abs_pos, abs_rot) = transform_absolute(frame, world, parent);
    let inverse = abs_rot.inverse();
    *rot = inverse * *rot;
    *pos = inverse * (*pos - abs_pos);
}

/// Blend between bracketing frames `a` and `b` at `timestamp`.
pub fn state_frame_interpolate(
    a: &StateFrame,
    b: &StateFrame,
    world: &World,
    timestamp: f32,
) -> StateFrame {
    debug_assert!(timestamp >= a.timestamp);
    let blend = ((timestamp - a.timestamp) / (b.timestamp - a.timestamp)).min(1.0);

    let mut result = StateFrame {
        timestamp,
        sequence_id: b.sequence_id,
        ..StateFrame::default()
    };

    // transforms
    for (&index, next) in &b.transforms {
        let mut out = *next;
        if let Some(last) = a.transforms.get(&index) {
            if last.revision == next.revision {
                if last.parent.id == next.parent.id {
                    out.pos = last.pos.lerp(next.pos, blend);
                    out.rot = last.rot.slerp(next.rot, blend);
                } else {
                    // parent changed between frames: bring a's pose into b's
                    // parent space before blending
                    let (mut last_pos, mut last_rot) = transform_absolute(a, world, index);
                    if next.parent.id != ID_NULL {
                        transform_absolute_to_relative(
                            b,
                            world,
                            next.parent.id,
                            &mut last_pos,
                            &mut last_rot,
                        );
                    }
                    out.pos = last_pos.lerp(next.pos, blend);
                    out.rot = last_rot.slerp(next.rot, blend);
                }
            }
        }
        result.transforms.insert(index, out);
    }

    // players
    for i in 0..MAX_PLAYERS {
        let last = &a.players[i];
        let next = &b.players[i];
        let mut player = *last;
        if player.active {
            player.spawn_timer = lerp(blend, last.spawn_timer, next.spawn_timer);
            player.state_timer = lerp(blend, last.state_timer, next.state_timer);
        }
        result.players[i] = player;
    }

    // drone state does not interpolate
    result.drones = a.drones;

    // minions
    for (&index, next) in &b.minions {
        let mut out = *next;
        if let Some(last) = a.minions.get(&index) {
            out.rotation = angle_range(lerp(
                blend,
                last.rotation,
                closest_angle(last.rotation, next.rotation),
            ));
            out.attack_timer = if (next.attack_timer - last.attack_timer).abs()
                < NET_TICK_RATE * 10.0
            {
                lerp(blend, last.attack_timer, next.attack_timer)
            } else {
                next.attack_timer
            };
            out.animation = last.animation;
            out.animation_time = if last.animation == next.animation
                && (next.animation_time - last.animation_time).abs() < NET_TICK_RATE * 10.0
            {
                lerp(blend, last.animation_time, next.animation_time)
            } else {
                last.animation_time + blend * NET_TICK_RATE
            };
        }
        result.minions.insert(index, out);
    }

    result
}

/// Write a blended frame into the live world. Entities owned by a local
/// human keep their predicted transform; everything else snaps to the frame.
pub fn state_frame_apply(
    frame: &StateFrame,
    frame_last: &StateFrame,
    frame_next: Option<&StateFrame>,
    world: &mut World,
) {
    // transforms
    let indices: Vec<EntityId> = frame.transforms.keys().copied().collect();
    for index in indices {
        let s = frame.transforms[&index];
        if !world.alive(index) || world.slot(index).revision != s.revision {
            continue;
        }

        if super::locally_controlled(world, index) {
            // the control layer reconciles this entity against
            // `remote_control`; do not stomp its prediction
            continue;
        }

        if let Some(t) = world.transform_mut(index) {
            t.pos = s.pos;
            t.rot = s.rot;
            t.parent = s.parent;
        }

        if world.has(index, Family::RigidBody) {
            let (abs_pos, abs_rot) = transform_absolute(frame, world, index);
            let moves_next = frame_next.is_some_and(|next| {
                !equal_transform_entries(Some(&s), next.transforms.get(&index))
            });
            if let Some(body) = world.rigid_body_mut(index) {
                body.net_transform = Some((abs_pos, abs_rot));
                if moves_next {
                    body.awake = true;
                }
            }
        }

        if frame_next.is_some() && world.has(index, Family::Target) {
            let (abs_pos_last, _) = transform_absolute(frame_last, world, index);
            let (abs_pos_next, _) =
                transform_absolute(frame_next.unwrap_or(frame), world, index);
            if let Some(target) = world.target_mut(index) {
                target.net_velocity = target.net_velocity * 0.9
                    + ((abs_pos_next - abs_pos_last) / NET_TICK_RATE) * 0.1;
            }
        }
    }

    // players
    for i in 0..MAX_PLAYERS {
        let state = &frame.players[i];
        if !state.active {
            continue;
        }
        if let Some(manager) = world.player_managers.get_mut(i as u16) {
            manager.spawn_timer = state.spawn_timer;
            manager.state_timer = state.state_timer;
            manager.upgrades = state.upgrades;
            manager.abilities = state.abilities;
            manager.current_upgrade = state.current_upgrade;
            manager.instance = state.instance;
            manager.credits = state.credits;
            manager.kills = state.kills;
            manager.respawns = state.respawns;
        }
    }

    // drones
    for i in 0..MAX_PLAYERS {
        let state = &frame.drones[i];
        if !state.active {
            continue;
        }
        if let Some(drone) = world.drones.get_mut(i as u16) {
            drone.charges = state.charges;
        }
    }

    // minions
    let indices: Vec<EntityId> = frame.minions.keys().copied().collect();
    for index in indices {
        let s = frame.minions[&index];
        if !world.alive(index) {
            continue;
        }
        if let Some(walker) = world.walker_mut(index) {
            walker.rotation = s.rotation;
        }
        if let Some(minion) = world.minion_mut(index) {
            minion.attack_timer = s.attack_timer;
            minion.animation = s.animation;
            minion.animation_time = s.animation_time;
        }
    }
}

/// Rolling ring of state frames, newest at `current_index`.
#[derive(Debug, Default)]
pub struct StateHistory {
    frames: Vec<StateFrame>,
    current_index: usize,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current(&self) -> Option<&StateFrame> {
        self.frames.get(self.current_index)
    }

    pub fn add(&mut self, frame: StateFrame) {
        if self.frames.len() < NET_HISTORY_SIZE {
            self.frames.push(frame);
            self.current_index = self.frames.len() - 1;
        } else {
            self.current_index = (self.current_index + 1) % self.frames.len();
            self.frames[self.current_index] = frame;
        }
    }

    fn iter_recent(&self, now: f32) -> impl Iterator<Item = (usize, &StateFrame)> {
        let mut index = self.current_index;
        let mut emitted = 0usize;
        let mut done = self.frames.is_empty();
        std::iter::from_fn(move || {
            if done || emitted >= NET_PREVIOUS_SEQUENCES_SEARCH {
                return None;
            }
            let item = (index, &self.frames[index]);
            emitted += 1;
            let next = if index > 0 {
                index - 1
            } else {
                self.frames.len() - 1
            };
            if next == self.current_index || self.frames[next].timestamp < now - NET_TIMEOUT {
                done = true;
            }
            index = next;
            Some(item)
        })
    }

    pub fn frame_by_sequence(&self, sequence_id: SequenceId, now: f32) -> Option<&StateFrame> {
        self.iter_recent(now)
            .find(|(_, frame)| frame.sequence_id == sequence_id)
            .map(|(_, frame)| frame)
    }

    /// Newest frame older than `timestamp`, with its ring index.
    pub fn frame_by_timestamp(&self, timestamp: f32, now: f32) -> Option<(usize, &StateFrame)> {
        self.iter_recent(now)
            .find(|(_, frame)| frame.timestamp < timestamp)
    }

    /// The frame following the one at `index`, if it is actually newer.
    pub fn frame_next(&self, index: usize) -> Option<&StateFrame> {
        if self.frames.len() < 2 {
            return None;
        }
        let next = if index < self.frames.len() - 1 {
            index + 1
        } else {
            0
        };
        let frame = &self.frames[index];
        let candidate = &self.frames[next];
        sequence_more_recent(candidate.sequence_id, frame.sequence_id).then_some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Drone, Minion, Transform, Walker};

    fn world_with_drone(pos: Vec3) -> (World, EntityId) {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_transform(
            e,
            Transform {
                pos,
                ..Transform::default()
            },
        );
        world.attach_drone(e, Drone::default());
        (world, e)
    }

    #[test]
    fn test_build_respects_whitelist() {
        let mut world = World::new();
        let plain = world.spawn();
        world.attach_transform(plain, Transform::default());
        let (mut drone_world, drone) = world_with_drone(Vec3::ONE);
        let frame = state_frame_build(&drone_world, 0, 0.0);
        assert!(frame.transforms.contains_key(&drone));
        assert_eq!(frame.transforms.len(), 1);

        let frame = state_frame_build(&world, 0, 0.0);
        assert!(frame.transforms.is_empty());

        // minions ride both the transform set and the minion set
        let m = drone_world.spawn();
        drone_world.attach_transform(m, Transform::default());
        drone_world.attach_walker(m, Walker::default());
        drone_world.attach_minion(m, Minion::default());
        let frame = state_frame_build(&drone_world, 0, 0.0);
        assert!(frame.minions.contains_key(&m));
        assert!(frame.transforms.contains_key(&m));
    }

    #[test]
    fn test_delta_roundtrip_against_baseline() {
        let (mut world, drone) = world_with_drone(Vec3::new(1.0, 2.0, 3.0));
        let base = state_frame_build(&world, 0, 0.0);

        world.transform_mut(drone).unwrap().pos = Vec3::new(4.0, 5.0, 6.0);
        let frame = state_frame_build(&world, 1, NET_TICK_RATE);

        let mut w = BitWriter::new();
        write_state_frame(&mut w, &frame, Some(&base));
        let mut r = BitReader::new(w.finish());
        let decoded = read_state_frame(&mut r, 1, NET_TICK_RATE, Some(&base)).unwrap();

        let t = decoded.transforms.get(&drone).unwrap();
        assert!((t.pos - Vec3::new(4.0, 5.0, 6.0)).abs().max_element() < 0.001);
        assert_eq!(t.revision, frame.transforms[&drone].revision);
    }

    #[test]
    fn test_delta_skips_unchanged() {
        let (world, _drone) = world_with_drone(Vec3::ONE);
        let base = state_frame_build(&world, 0, 0.0);
        let frame = state_frame_build(&world, 1, NET_TICK_RATE);

        let mut w = BitWriter::new();
        write_state_frame(&mut w, &frame, Some(&base));
        let delta_bits = w.bits_written();

        let mut w = BitWriter::new();
        write_state_frame(&mut w, &frame, None);
        let full_bits = w.bits_written();

        assert!(delta_bits < full_bits);
    }

    #[test]
    fn test_full_frame_roundtrip_no_baseline() {
        let (world, drone) = world_with_drone(Vec3::new(-3.5, 0.25, 9.0));
        let frame = state_frame_build(&world, 7, 0.5);

        let mut w = BitWriter::new();
        write_state_frame(&mut w, &frame, None);
        let mut r = BitReader::new(w.finish());
        let decoded = read_state_frame(&mut r, 7, 0.5, None).unwrap();

        let t = decoded.transforms.get(&drone).unwrap();
        // High resolution positions carry raw floats
        assert_eq!(t.pos, Vec3::new(-3.5, 0.25, 9.0));
    }

    #[test]
    fn test_interpolation_midpoint() {
        let (world, drone) = world_with_drone(Vec3::ZERO);
        let mut a = state_frame_build(&world, 0, 0.0);
        a.timestamp = 0.0;
        let mut b = a.clone();
        b.sequence_id = 1;
        b.timestamp = 0.10;
        b.transforms.get_mut(&drone).unwrap().pos = Vec3::new(1.0, 0.0, 0.0);

        let result = state_frame_interpolate(&a, &b, &world, 0.04);
        let t = result.transforms.get(&drone).unwrap();
        assert!((t.pos.x - 0.4).abs() < 1e-5);
        assert_eq!(t.pos.y, 0.0);
        assert_eq!(t.pos.z, 0.0);
    }

    #[test]
    fn test_interpolation_stays_in_bounds() {
        let (world, drone) = world_with_drone(Vec3::new(2.0, -1.0, 5.0));
        let mut a = state_frame_build(&world, 0, 0.0);
        a.timestamp = 0.0;
        let mut b = a.clone();
        b.sequence_id = 1;
        b.timestamp = 0.1;
        b.transforms.get_mut(&drone).unwrap().pos = Vec3::new(-4.0, 3.0, 6.0);

        for step in 0..=10 {
            let t = step as f32 * 0.01;
            let result = state_frame_interpolate(&a, &b, &world, t);
            let p = result.transforms.get(&drone).unwrap().pos;
            for axis in 0..3 {
                let lo = a.transforms[&drone].pos[axis].min(b.transforms[&drone].pos[axis]);
                let hi = a.transforms[&drone].pos[axis].max(b.transforms[&drone].pos[axis]);
                assert!(p[axis] >= lo - 1e-4 && p[axis] <= hi + 1e-4);
            }
        }
    }

    #[test]
    fn test_revision_mismatch_snaps() {
        let (world, drone) = world_with_drone(Vec3::ZERO);
        let mut a = state_frame_build(&world, 0, 0.0);
        a.timestamp = 0.0;
        let mut b = a.clone();
        b.timestamp = 0.1;
        {
            let t = b.transforms.get_mut(&drone).unwrap();
            t.pos = Vec3::new(8.0, 0.0, 0.0);
            t.revision = t.revision.wrapping_add(1);
        }
        let result = state_frame_interpolate(&a, &b, &world, 0.05);
        assert_eq!(result.transforms[&drone].pos.x, 8.0);
    }

    #[test]
    fn test_apply_writes_world_and_rigid_body() {
        let (mut world, drone) = world_with_drone(Vec3::ZERO);
        world.attach_rigid_body(drone, crate::entity::RigidBody::default());

        let mut frame = state_frame_build(&world, 1, 0.1);
        frame
            .transforms
            .get_mut(&drone)
            .unwrap()
            .pos = Vec3::new(3.0, 1.0, 0.0);
        let mut next = frame.clone();
        next.transforms.get_mut(&drone).unwrap().pos = Vec3::new(4.0, 1.0, 0.0);

        let last = frame.clone();
        state_frame_apply(&frame, &last, Some(&next), &mut world);

        assert_eq!(world.transform(drone).unwrap().pos, Vec3::new(3.0, 1.0, 0.0));
        let body = world.rigid_body(drone).unwrap();
        assert_eq!(body.net_transform.unwrap().0, Vec3::new(3.0, 1.0, 0.0));
        assert!(body.awake);
    }

    #[test]
    fn test_apply_preserves_local_prediction() {
        let mut world = World::new();
        let player = world.spawn();
        world.attach_player_human(
            player,
            crate::entity::PlayerHuman {
                uuid: 1,
                gamepad: 0,
                local: true,
            },
        );
        let avatar = world.spawn();
        world.attach_transform(
            avatar,
            Transform {
                pos: Vec3::new(10.0, 0.0, 0.0),
                ..Transform::default()
            },
        );
        world.attach_drone(avatar, Drone::default());
        world.attach_player_control(
            avatar,
            crate::entity::PlayerControl {
                player: world.entity_ref(player),
                ..crate::entity::PlayerControl::default()
            },
        );

        let mut frame = state_frame_build(&world, 1, 0.1);
        frame.transforms.get_mut(&avatar).unwrap().pos = Vec3::new(10.5, 0.0, 0.0);

        let last = frame.clone();
        state_frame_apply(&frame, &last, None, &mut world);

        // predicted position survives; reconciliation happens via remote_control
        assert_eq!(world.transform(avatar).unwrap().pos, Vec3::new(10.0, 0.0, 0.0));
    }

    #[test]
    fn test_parent_chain_absolute() {
        let mut world = World::new();
        let parent = world.spawn();
        world.attach_transform(
            parent,
            Transform {
                pos: Vec3::new(5.0, 0.0, 0.0),
                ..Transform::default()
            },
        );
        let (child_pos, parent_ref) = (Vec3::new(1.0, 0.0, 0.0), world.entity_ref(parent));
        let child = world.spawn();
        world.attach_transform(
            child,
            Transform {
                pos: child_pos,
                parent: parent_ref,
                ..Transform::default()
            },
        );
        world.attach_drone(child, Drone::default());

        let frame = state_frame_build(&world, 0, 0.0);
        let (abs, _) = transform_absolute(&frame, &world, child);
        assert!((abs - Vec3::new(6.0, 0.0, 0.0)).abs().max_element() < 1e-5);
    }

    #[test]
    fn test_history_lookup() {
        let mut history = StateHistory::new();
        for seq in 0..5u16 {
            history.add(StateFrame {
                sequence_id: seq,
                timestamp: seq as f32 * 0.1,
                ..StateFrame::default()
            });
        }
        let now = 1.0;
        assert_eq!(history.frame_by_sequence(3, now).unwrap().sequence_id, 3);
        let (index, frame) = history.frame_by_timestamp(0.25, now).unwrap();
        assert_eq!(frame.sequence_id, 2);
        assert_eq!(history.frame_next(index).unwrap().sequence_id, 3);
    }
}
