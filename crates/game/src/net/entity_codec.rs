//! Wire form of a whole entity: component mask, revision, component slots,
//! then one field block per replicated family. Sent once per entity when a
//! client finishes the handshake; per-tick movement rides the state frames
//! instead.

use std::f32::consts::PI;

use glam::Vec3;

use crate::entity::{
    Ability, AiAgent, ComponentMask, Constraint, ConstraintKind, Drone, EnergyPickup, EntityId,
    Family, Grenade, Health, Minion, PlayerControl, PlayerHuman, PlayerManager, Projectile,
    Revision, RigidBody, RigidBodyShape, Rocket, Sensor, Target, Transform, Walker, World,
    ABILITY_COUNT, DRONE_CHARGES, DRONE_COOLDOWN, FAMILIES, MAX_ENTITIES, MAX_USERNAME,
    MINION_ATTACK_TIME, UPGRADE_COUNT,
};
use crate::math::angle_range;

use super::bitstream::{BitReader, BitWriter, Resolution, StreamError, StreamResult};
use super::state::transform_filter;

/// Families that go on the wire; everything else is endpoint-local.
pub fn replicated_mask() -> ComponentMask {
    ComponentMask::all().difference(ComponentMask::AI_PLAYER)
}

fn write_constraint(w: &mut BitWriter, c: &Constraint) {
    w.int(c.kind as i64, 0, 2);
    w.entity_ref(c.peer);
    w.position(c.frame_a.0, Resolution::High);
    w.quat(c.frame_a.1, Resolution::High);
    w.position(c.frame_b.0, Resolution::High);
    w.quat(c.frame_b.1, Resolution::High);
    w.position(c.limits, Resolution::Medium);
}

fn read_constraint(r: &mut BitReader) -> StreamResult<Constraint> {
    Ok(Constraint {
        kind: ConstraintKind::from_u8(r.int(0, 2)? as u8),
        peer: r.entity_ref()?,
        frame_a: (r.position(Resolution::High)?, r.quat(Resolution::High)?),
        frame_b: (r.position(Resolution::High)?, r.quat(Resolution::High)?),
        limits: r.position(Resolution::Medium)?,
    })
}

pub fn entity_write(w: &mut BitWriter, world: &World, id: EntityId) {
    let slot = world.slot(id);
    let mask = slot.mask & replicated_mask();
    w.u64(mask.bits());
    w.bits(slot.revision as u32, 16);

    for family in FAMILIES {
        if mask.contains(family.mask()) {
            let component = world.component_slot(id, family);
            w.int(component as i64, 0, MAX_ENTITIES as i64 - 1);
            let revision = match family {
                Family::Transform => world.transforms.revision(component),
                Family::RigidBody => world.rigid_bodies.revision(component),
                Family::Health => world.healths.revision(component),
                Family::Target => world.targets.revision(component),
                Family::Walker => world.walkers.revision(component),
                Family::AiAgent => world.ai_agents.revision(component),
                Family::Drone => world.drones.revision(component),
                Family::Minion => world.minions.revision(component),
                Family::PlayerHuman => world.player_humans.revision(component),
                Family::PlayerManager => world.player_managers.revision(component),
                Family::PlayerControl => world.player_controls.revision(component),
                Family::Projectile => world.projectiles.revision(component),
                Family::Grenade => world.grenades.revision(component),
                Family::Sensor => world.sensors.revision(component),
                Family::EnergyPickup => world.energy_pickups.revision(component),
                Family::Rocket => world.rockets.revision(component),
                Family::AiPlayer => 0,
            };
            w.bits(revision as u32, 16);
        }
    }

    if let Some(t) = world.transform(id) {
        w.position(t.pos, Resolution::High);
        let is_identity = t.rot.angle_between(glam::Quat::IDENTITY) == 0.0;
        w.bool(is_identity);
        if !is_identity {
            w.quat(t.rot, Resolution::High);
        }
        w.entity_ref(t.parent);
    }

    if let Some(body) = world.rigid_body(id) {
        w.f32_range(body.size.x, 0.0, 5.0, 8);
        w.f32_range(body.size.y, 0.0, 5.0, 8);
        w.f32_range(body.size.z, 0.0, 5.0, 8);
        w.f32_range(body.damping.x, 0.0, 1.0, 2);
        w.f32_range(body.damping.y, 0.0, 1.0, 2);
        w.int(body.shape as i64, 0, 4);
        // whitelisted movers read back zero mass and act kinematic for the
        // physics world
        if !transform_filter(world, id) {
            w.f32_range(body.mass, 0.0, 50.0, 16);
        }
        w.f32_range(body.restitution, 0.0, 1.0, 8);
        w.asset(body.mesh_id);
        w.int(body.collision_group as i64, -32767, 32767);
        w.int(body.collision_filter as i64, -32767, 32767);
        w.bool(body.ccd);
        for constraint in &body.constraints {
            w.bool(true);
            write_constraint(w, constraint);
        }
        w.bool(false);
    }

    if let Some(health) = world.health(id) {
        w.f32_range(health.regen_timer, 0.0, 10.0, 8);
        w.bits(health.shield as u8 as u32, 8);
        w.bits(health.shield_max as u8 as u32, 8);
        w.bits(health.hp as u8 as u32, 8);
        w.bits(health.hp_max as u8 as u32, 8);
    }

    if let Some(target) = world.target(id) {
        w.f32_range(target.local_offset.x, -5.0, 5.0, 16);
        w.f32_range(target.local_offset.y, -5.0, 5.0, 16);
        w.f32_range(target.local_offset.z, -5.0, 5.0, 16);
    }

    if let Some(walker) = world.walker(id) {
        w.f32_range(walker.height, 0.0, 10.0, 16);
        w.f32_range(walker.support_height, 0.0, 10.0, 16);
        w.f32_range(walker.radius, 0.0, 10.0, 16);
        w.f32_range(walker.mass, 0.0, 10.0, 16);
        w.f32_range(angle_range(walker.rotation), -PI, PI, 8);
    }

    if let Some(agent) = world.ai_agent(id) {
        w.bits(agent.team as u8 as u32, 8);
        w.bool(agent.stealth);
    }

    if let Some(drone) = world.drone(id) {
        w.f32_range(drone.cooldown, 0.0, DRONE_COOLDOWN, 8);
        w.int(drone.current_ability as i64, 0, ABILITY_COUNT as i64);
        w.int(drone.charges as i64, 0, DRONE_CHARGES as i64);
    }

    if let Some(minion) = world.minion(id) {
        w.f32_range(minion.attack_timer, 0.0, MINION_ATTACK_TIME, 8);
        w.entity_ref(minion.owner);
        w.asset(minion.animation);
        w.f32(minion.animation_time);
    }

    if let Some(human) = world.player_human(id) {
        w.u64(human.uuid);
        w.bits(human.gamepad as u32, 8);
    }

    if let Some(manager) = world.player_manager(id) {
        w.bits(manager.upgrades, UPGRADE_COUNT as u32);
        for ability in manager.abilities {
            w.int(ability as i64, 0, ABILITY_COUNT as i64);
        }
        w.bits(manager.team as u8 as u32, 8);
        w.entity_ref(manager.instance);
        w.bits(manager.credits as u16 as u32, 16);
        w.bits(manager.kills as u16 as u32, 16);
        w.bits(manager.respawns as u16 as u32, 16);
        let username = manager.username.as_bytes();
        let len = username.len().min(MAX_USERNAME);
        w.int(len as i64, 0, MAX_USERNAME as i64);
        w.bytes(&username[..len]);
    }

    if let Some(control) = world.player_control(id) {
        w.entity_ref(control.player);
    }

    if let Some(projectile) = world.projectile(id) {
        w.entity_ref(projectile.owner);
        w.f32(projectile.velocity.x);
        w.f32(projectile.velocity.y);
        w.f32(projectile.velocity.z);
        w.f32(projectile.lifetime);
    }

    if let Some(grenade) = world.grenade(id) {
        w.entity_ref(grenade.owner);
        w.bool(grenade.active);
    }

    if let Some(sensor) = world.sensor(id) {
        w.bits(sensor.team as u8 as u32, 8);
    }

    if let Some(pickup) = world.energy_pickup(id) {
        w.bits(pickup.team as u8 as u32, 8);
    }

    if let Some(rocket) = world.rocket(id) {
        w.entity_ref(rocket.target);
        w.entity_ref(rocket.owner);
    }
}

/// Materialize an entity at `id` from the wire. `local_uuids` marks which
/// replicated humans are this endpoint's own players.
pub fn entity_read(
    r: &mut BitReader,
    world: &mut World,
    id: EntityId,
    local_uuids: &[u64],
) -> StreamResult<()> {
    let mask = ComponentMask::from_bits_truncate(r.u64()?);
    let revision = r.bits(16)? as Revision;
    world.net_add(id, revision);

    let mut slots = [0u16; crate::entity::FAMILY_COUNT];
    let mut revisions = [0 as Revision; crate::entity::FAMILY_COUNT];
    for family in FAMILIES {
        if mask.contains(family.mask()) {
            slots[family as usize] = r.int(0, MAX_ENTITIES as i64 - 1)? as u16;
            revisions[family as usize] = r.bits(16)? as Revision;
        }
    }

    let component = |family: Family| (slots[family as usize], revisions[family as usize]);

    if mask.contains(ComponentMask::TRANSFORM) {
        let pos = r.position(Resolution::High)?;
        let rot = if r.bool()? {
            glam::Quat::IDENTITY
        } else {
            r.quat(Resolution::High)?
        };
        let parent = r.entity_ref()?;
        let (slot, rev) = component(Family::Transform);
        world.net_attach_transform(id, slot, rev, Transform { pos, rot, parent });
    }

    if mask.contains(ComponentMask::RIGID_BODY) {
        let mut body = RigidBody {
            size: Vec3::new(
                r.f32_range(0.0, 5.0, 8)?,
                r.f32_range(0.0, 5.0, 8)?,
                r.f32_range(0.0, 5.0, 8)?,
            ),
            damping: glam::Vec2::new(r.f32_range(0.0, 1.0, 2)?, r.f32_range(0.0, 1.0, 2)?),
            shape: RigidBodyShape::from_u8(r.int(0, 4)? as u8),
            ..RigidBody::default()
        };
        body.mass = if mask.intersects(
            ComponentMask::DRONE
                | ComponentMask::ENERGY_PICKUP
                | ComponentMask::PROJECTILE
                | ComponentMask::ROCKET
                | ComponentMask::MINION
                | ComponentMask::SENSOR
                | ComponentMask::GRENADE,
        ) {
            0.0
        } else {
            r.f32_range(0.0, 50.0, 16)?
        };
        body.restitution = r.f32_range(0.0, 1.0, 8)?;
        body.mesh_id = r.asset()?;
        body.collision_group = r.int(-32767, 32767)? as i16;
        body.collision_filter = r.int(-32767, 32767)? as i16;
        body.ccd = r.bool()?;
        while r.bool()? {
            if body.constraints.len() >= 16 {
                return Err(StreamError::Range);
            }
            body.constraints.push(read_constraint(r)?);
        }
        let (slot, rev) = component(Family::RigidBody);
        world.net_attach_rigid_body(id, slot, rev, body);
    }

    if mask.contains(ComponentMask::HEALTH) {
        let health = Health {
            regen_timer: r.f32_range(0.0, 10.0, 8)?,
            shield: r.bits(8)? as u8 as i8,
            shield_max: r.bits(8)? as u8 as i8,
            hp: r.bits(8)? as u8 as i8,
            hp_max: r.bits(8)? as u8 as i8,
        };
        let (slot, rev) = component(Family::Health);
        world.net_attach_health(id, slot, rev, health);
    }

    if mask.contains(ComponentMask::TARGET) {
        let target = Target {
            local_offset: Vec3::new(
                r.f32_range(-5.0, 5.0, 16)?,
                r.f32_range(-5.0, 5.0, 16)?,
                r.f32_range(-5.0, 5.0, 16)?,
            ),
            net_velocity: Vec3::ZERO,
        };
        let (slot, rev) = component(Family::Target);
        world.net_attach_target(id, slot, rev, target);
    }

    if mask.contains(ComponentMask::WALKER) {
        let walker = Walker {
            height: r.f32_range(0.0, 10.0, 16)?,
            support_height: r.f32_range(0.0, 10.0, 16)?,
            radius: r.f32_range(0.0, 10.0, 16)?,
            mass: r.f32_range(0.0, 10.0, 16)?,
            rotation: r.f32_range(-PI, PI, 8)?,
        };
        let (slot, rev) = component(Family::Walker);
        world.net_attach_walker(id, slot, rev, walker);
    }

    if mask.contains(ComponentMask::AI_AGENT) {
        let agent = AiAgent {
            team: r.bits(8)? as u8 as i8,
            stealth: r.bool()?,
        };
        let (slot, rev) = component(Family::AiAgent);
        world.net_attach_ai_agent(id, slot, rev, agent);
    }

    if mask.contains(ComponentMask::DRONE) {
        let drone = Drone {
            cooldown: r.f32_range(0.0, DRONE_COOLDOWN, 8)?,
            current_ability: Ability::from_u8(r.int(0, ABILITY_COUNT as i64)? as u8),
            charges: r.int(0, DRONE_CHARGES as i64)? as i8,
        };
        let (slot, rev) = component(Family::Drone);
        world.net_attach_drone(id, slot, rev, drone);
    }

    if mask.contains(ComponentMask::MINION) {
        let minion = Minion {
            attack_timer: r.f32_range(0.0, MINION_ATTACK_TIME, 8)?,
            owner: r.entity_ref()?,
            animation: r.asset()?,
            animation_time: r.f32()?,
        };
        let (slot, rev) = component(Family::Minion);
        world.net_attach_minion(id, slot, rev, minion);
    }

    if mask.contains(ComponentMask::PLAYER_HUMAN) {
        let uuid = r.u64()?;
        let gamepad = r.bits(8)? as u8;
        let human = PlayerHuman {
            uuid,
            gamepad,
            local: local_uuids.contains(&uuid),
        };
        let (slot, rev) = component(Family::PlayerHuman);
        world.net_attach_player_human(id, slot, rev, human);
    }

    if mask.contains(ComponentMask::PLAYER_MANAGER) {
        let upgrades = r.bits(UPGRADE_COUNT as u32)?;
        let mut abilities = [Ability::None; crate::entity::MAX_ABILITIES];
        for ability in &mut abilities {
            *ability = Ability::from_u8(r.int(0, ABILITY_COUNT as i64)? as u8);
        }
        let team = r.bits(8)? as u8 as i8;
        let instance = r.entity_ref()?;
        let credits = r.bits(16)? as u16 as i16;
        let kills = r.bits(16)? as u16 as i16;
        let respawns = r.bits(16)? as u16 as i16;
        let len = r.int(0, MAX_USERNAME as i64)? as usize;
        let mut bytes = vec![0u8; len];
        r.bytes(&mut bytes)?;
        let manager = PlayerManager {
            team,
            credits,
            kills,
            respawns,
            upgrades,
            abilities,
            instance,
            username: String::from_utf8_lossy(&bytes).into_owned(),
            ..PlayerManager::default()
        };
        let (slot, rev) = component(Family::PlayerManager);
        world.net_attach_player_manager(id, slot, rev, manager);
    }

    if mask.contains(ComponentMask::PLAYER_CONTROL) {
        let control = PlayerControl {
            player: r.entity_ref()?,
            ..PlayerControl::default()
        };
        let (slot, rev) = component(Family::PlayerControl);
        world.net_attach_player_control(id, slot, rev, control);
    }

    if mask.contains(ComponentMask::PROJECTILE) {
        let projectile = Projectile {
            owner: r.entity_ref()?,
            velocity: Vec3::new(r.f32()?, r.f32()?, r.f32()?),
            lifetime: r.f32()?,
        };
        let (slot, rev) = component(Family::Projectile);
        world.net_attach_projectile(id, slot, rev, projectile);
    }

    if mask.contains(ComponentMask::GRENADE) {
        let grenade = Grenade {
            owner: r.entity_ref()?,
            active: r.bool()?,
        };
        let (slot, rev) = component(Family::Grenade);
        world.net_attach_grenade(id, slot, rev, grenade);
    }

    if mask.contains(ComponentMask::SENSOR) {
        let sensor = Sensor {
            team: r.bits(8)? as u8 as i8,
        };
        let (slot, rev) = component(Family::Sensor);
        world.net_attach_sensor(id, slot, rev, sensor);
    }

    if mask.contains(ComponentMask::ENERGY_PICKUP) {
        let pickup = EnergyPickup {
            team: r.bits(8)? as u8 as i8,
        };
        let (slot, rev) = component(Family::EnergyPickup);
        world.net_attach_energy_pickup(id, slot, rev, pickup);
    }

    if mask.contains(ComponentMask::ROCKET) {
        let rocket = Rocket {
            target: r.entity_ref()?,
            owner: r.entity_ref()?,
        };
        let (slot, rev) = component(Family::Rocket);
        world.net_attach_rocket(id, slot, rev, rocket);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_roundtrip_full_mask() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_transform(
            e,
            Transform {
                pos: Vec3::new(4.0, 2.0, -7.5),
                ..Transform::default()
            },
        );
        world.attach_drone(
            e,
            Drone {
                charges: 2,
                cooldown: 1.5,
                current_ability: Ability::Rocket,
            },
        );
        world.attach_health(
            e,
            Health {
                hp: 1,
                hp_max: 1,
                shield: 1,
                shield_max: 1,
                regen_timer: 3.0,
            },
        );
        world.attach_ai_agent(e, AiAgent { team: 1, stealth: false });

        let mut w = BitWriter::new();
        entity_write(&mut w, &world, e);

        let mut remote = World::new();
        let mut r = BitReader::new(w.finish());
        entity_read(&mut r, &mut remote, e, &[]).unwrap();

        assert_eq!(remote.slot(e).revision, world.slot(e).revision);
        assert_eq!(remote.drone(e).unwrap().charges, 2);
        assert_eq!(remote.drone(e).unwrap().current_ability, Ability::Rocket);
        assert_eq!(remote.health(e).unwrap().hp_max, 1);
        assert_eq!(remote.ai_agent(e).unwrap().team, 1);
        assert_eq!(remote.transform(e).unwrap().pos, Vec3::new(4.0, 2.0, -7.5));
    }

    #[test]
    fn test_networked_mover_reads_zero_mass() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_transform(e, Transform::default());
        world.attach_drone(e, Drone::default());
        world.attach_rigid_body(
            e,
            RigidBody {
                mass: 12.0,
                ..RigidBody::default()
            },
        );

        let mut w = BitWriter::new();
        entity_write(&mut w, &world, e);

        let mut remote = World::new();
        let mut r = BitReader::new(w.finish());
        entity_read(&mut r, &mut remote, e, &[]).unwrap();
        assert_eq!(remote.rigid_body(e).unwrap().mass, 0.0);
    }

    #[test]
    fn test_constraint_loop_roundtrip() {
        let mut world = World::new();
        let anchor = world.spawn();
        world.attach_transform(anchor, Transform::default());
        let e = world.spawn();
        world.attach_transform(e, Transform::default());
        world.attach_rigid_body(
            e,
            RigidBody {
                constraints: vec![Constraint {
                    kind: ConstraintKind::ConeTwist,
                    peer: world.entity_ref(anchor),
                    frame_a: (Vec3::new(0.0, 1.0, 0.0), glam::Quat::IDENTITY),
                    frame_b: (Vec3::ZERO, glam::Quat::IDENTITY),
                    limits: Vec3::new(0.5, 0.5, 0.1),
                }],
                ..RigidBody::default()
            },
        );

        let mut w = BitWriter::new();
        entity_write(&mut w, &world, e);

        let mut remote = World::new();
        let mut r = BitReader::new(w.finish());
        entity_read(&mut r, &mut remote, e, &[]).unwrap();

        let body = remote.rigid_body(e).unwrap();
        assert_eq!(body.constraints.len(), 1);
        assert_eq!(body.constraints[0].peer.id, anchor);
        assert!((body.constraints[0].limits - Vec3::new(0.5, 0.5, 0.1))
            .abs()
            .max_element()
            < 0.01);
    }

    #[test]
    fn test_local_uuid_marks_player_local() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_player_human(
            e,
            PlayerHuman {
                uuid: 0xdead_beef,
                gamepad: 1,
                local: false,
            },
        );

        let mut w = BitWriter::new();
        entity_write(&mut w, &world, e);
        let bytes = w.finish();

        let mut remote = World::new();
        let mut r = BitReader::new(bytes.clone());
        entity_read(&mut r, &mut remote, e, &[0xdead_beef]).unwrap();
        assert!(remote.player_human(e).unwrap().local);

        let mut other = World::new();
        let mut r = BitReader::new(bytes);
        entity_read(&mut r, &mut other, e, &[7]).unwrap();
        assert!(!other.player_human(e).unwrap().local);
    }

    #[test]
    fn test_ai_player_never_replicates() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_transform(e, Transform::default());
        world.attach_ai_player(e, crate::entity::AiPlayer::default());

        let mut w = BitWriter::new();
        entity_write(&mut w, &world, e);

        let mut remote = World::new();
        let mut r = BitReader::new(w.finish());
        entity_read(&mut r, &mut remote, e, &[]).unwrap();
        assert!(!remote.has(e, Family::AiPlayer));
        assert!(remote.has(e, Family::Transform));
    }
}
