//! Entity slots, component pools, and revision-checked references.
//!
//! Entities are indices into a fixed table of slots. Each slot carries a
//! component mask and a revision counter that increments when the slot is
//! reused; references are `(id, revision)` pairs that resolve to nothing once
//! the slot has moved on. Component data lives in dense per-family pools with
//! their own per-slot revisions, so the network layer can materialize a
//! component at an exact slot on the receiving side.

pub mod components;

use bitflags::bitflags;

pub use components::*;

pub type EntityId = u16;
pub type Revision = u16;

pub const ID_NULL: EntityId = u16::MAX;
pub const MAX_ENTITIES: usize = 2048;
pub const MAX_PLAYERS: usize = 4;
pub const MAX_GAMEPADS: usize = 4;
pub const MAX_ABILITIES: usize = 3;
pub const MAX_USERNAME: usize = 255;

/// Component families, in pool order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Family {
    Transform = 0,
    RigidBody,
    Health,
    Target,
    Walker,
    AiAgent,
    Drone,
    Minion,
    PlayerHuman,
    PlayerManager,
    PlayerControl,
    Projectile,
    Grenade,
    Sensor,
    EnergyPickup,
    Rocket,
    AiPlayer,
}

pub const FAMILY_COUNT: usize = 17;

pub const FAMILIES: [Family; FAMILY_COUNT] = [
    Family::Transform,
    Family::RigidBody,
    Family::Health,
    Family::Target,
    Family::Walker,
    Family::AiAgent,
    Family::Drone,
    Family::Minion,
    Family::PlayerHuman,
    Family::PlayerManager,
    Family::PlayerControl,
    Family::Projectile,
    Family::Grenade,
    Family::Sensor,
    Family::EnergyPickup,
    Family::Rocket,
    Family::AiPlayer,
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ComponentMask: u64 {
        const TRANSFORM = 1 << Family::Transform as u64;
        const RIGID_BODY = 1 << Family::RigidBody as u64;
        const HEALTH = 1 << Family::Health as u64;
        const TARGET = 1 << Family::Target as u64;
        const WALKER = 1 << Family::Walker as u64;
        const AI_AGENT = 1 << Family::AiAgent as u64;
        const DRONE = 1 << Family::Drone as u64;
        const MINION = 1 << Family::Minion as u64;
        const PLAYER_HUMAN = 1 << Family::PlayerHuman as u64;
        const PLAYER_MANAGER = 1 << Family::PlayerManager as u64;
        const PLAYER_CONTROL = 1 << Family::PlayerControl as u64;
        const PROJECTILE = 1 << Family::Projectile as u64;
        const GRENADE = 1 << Family::Grenade as u64;
        const SENSOR = 1 << Family::Sensor as u64;
        const ENERGY_PICKUP = 1 << Family::EnergyPickup as u64;
        const ROCKET = 1 << Family::Rocket as u64;
        const AI_PLAYER = 1 << Family::AiPlayer as u64;
    }
}

impl Family {
    pub fn mask(self) -> ComponentMask {
        ComponentMask::from_bits_truncate(1 << self as u64)
    }
}

/// A revision-checked entity handle. Dangling references resolve to null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityRef {
    pub id: EntityId,
    pub revision: Revision,
}

pub const REF_NULL: EntityRef = EntityRef {
    id: ID_NULL,
    revision: 0,
};

impl EntityRef {
    pub fn new(id: EntityId, revision: Revision) -> Self {
        Self { id, revision }
    }

    pub fn is_null(&self) -> bool {
        self.id == ID_NULL
    }
}

#[derive(Debug, Clone)]
pub struct EntitySlot {
    pub revision: Revision,
    pub mask: ComponentMask,
    pub components: [u16; FAMILY_COUNT],
    pub active: bool,
    pub awake: bool,
}

impl Default for EntitySlot {
    fn default() -> Self {
        Self {
            revision: 0,
            mask: ComponentMask::empty(),
            components: [u16::MAX; FAMILY_COUNT],
            active: false,
            awake: false,
        }
    }
}

struct PoolSlot<T> {
    revision: Revision,
    entity: EntityId,
    data: Option<T>,
}

/// Dense component storage for one family. Slot revisions are independent of
/// entity revisions; the wire replicates both.
pub struct Pool<T> {
    slots: Vec<PoolSlot<T>>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> Pool<T> {
    pub fn add(&mut self, entity: EntityId, data: T) -> u16 {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.data.is_none() {
                slot.revision = slot.revision.wrapping_add(1);
                slot.entity = entity;
                slot.data = Some(data);
                return i as u16;
            }
        }
        self.slots.push(PoolSlot {
            revision: 0,
            entity,
            data: Some(data),
        });
        (self.slots.len() - 1) as u16
    }

    /// Materialize a component at an exact slot with an exact revision,
    /// overwriting whatever stale state occupied it. Receive side only.
    pub fn net_add(&mut self, slot: u16, entity: EntityId, revision: Revision, data: T) {
        let index = slot as usize;
        while self.slots.len() <= index {
            self.slots.push(PoolSlot {
                revision: 0,
                entity: ID_NULL,
                data: None,
            });
        }
        let s = &mut self.slots[index];
        s.revision = revision;
        s.entity = entity;
        s.data = Some(data);
    }

    pub fn remove(&mut self, slot: u16) {
        if let Some(s) = self.slots.get_mut(slot as usize) {
            s.data = None;
            s.entity = ID_NULL;
        }
    }

    pub fn revision(&self, slot: u16) -> Revision {
        self.slots.get(slot as usize).map_or(0, |s| s.revision)
    }

    pub fn entity(&self, slot: u16) -> EntityId {
        self.slots.get(slot as usize).map_or(ID_NULL, |s| s.entity)
    }

    pub fn get(&self, slot: u16) -> Option<&T> {
        self.slots.get(slot as usize).and_then(|s| s.data.as_ref())
    }

    pub fn get_mut(&mut self, slot: u16) -> Option<&mut T> {
        self.slots
            .get_mut(slot as usize)
            .and_then(|s| s.data.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, EntityId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.data.as_ref().map(|d| (i as u16, s.entity, d)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, EntityId, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.data.as_mut().map(|d| (i as u16, s.entity, d)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The world: entity table plus one pool per family. The network layer reads
/// and writes through this; it never owns entities.
#[derive(Default)]
pub struct World {
    entities: Vec<EntitySlot>,
    pub transforms: Pool<Transform>,
    pub rigid_bodies: Pool<RigidBody>,
    pub healths: Pool<Health>,
    pub targets: Pool<Target>,
    pub walkers: Pool<Walker>,
    pub ai_agents: Pool<AiAgent>,
    pub drones: Pool<Drone>,
    pub minions: Pool<Minion>,
    pub player_humans: Pool<PlayerHuman>,
    pub player_managers: Pool<PlayerManager>,
    pub player_controls: Pool<PlayerControl>,
    pub projectiles: Pool<Projectile>,
    pub grenades: Pool<Grenade>,
    pub sensors: Pool<Sensor>,
    pub energy_pickups: Pool<EnergyPickup>,
    pub rockets: Pool<Rocket>,
    pub ai_players: Pool<AiPlayer>,
}

impl World {
    pub fn new() -> Self {
        Self {
            entities: (0..MAX_ENTITIES).map(|_| EntitySlot::default()).collect(),
            ..Self::default()
        }
    }

    pub fn spawn(&mut self) -> EntityId {
        for (id, slot) in self.entities.iter_mut().enumerate() {
            if !slot.active {
                slot.revision = slot.revision.wrapping_add(1);
                slot.mask = ComponentMask::empty();
                slot.components = [u16::MAX; FAMILY_COUNT];
                slot.active = true;
                slot.awake = false;
                return id as EntityId;
            }
        }
        panic!("entity table exhausted");
    }

    /// Materialize an entity at an exact slot with an exact revision,
    /// evicting whatever occupied it. Receive side only.
    pub fn net_add(&mut self, id: EntityId, revision: Revision) {
        if self.entities[id as usize].active {
            self.despawn(id);
        }
        let slot = &mut self.entities[id as usize];
        slot.revision = revision;
        slot.mask = ComponentMask::empty();
        slot.components = [u16::MAX; FAMILY_COUNT];
        slot.active = true;
        slot.awake = false;
    }

    pub fn despawn(&mut self, id: EntityId) {
        let slot = &mut self.entities[id as usize];
        if !slot.active {
            return;
        }
        slot.active = false;
        slot.awake = false;
        let components = slot.components;
        let mask = slot.mask;
        for family in FAMILIES {
            if mask.contains(family.mask()) {
                let c = components[family as usize];
                match family {
                    Family::Transform => self.transforms.remove(c),
                    Family::RigidBody => self.rigid_bodies.remove(c),
                    Family::Health => self.healths.remove(c),
                    Family::Target => self.targets.remove(c),
                    Family::Walker => self.walkers.remove(c),
                    Family::AiAgent => self.ai_agents.remove(c),
                    Family::Drone => self.drones.remove(c),
                    Family::Minion => self.minions.remove(c),
                    Family::PlayerHuman => self.player_humans.remove(c),
                    Family::PlayerManager => self.player_managers.remove(c),
                    Family::PlayerControl => self.player_controls.remove(c),
                    Family::Projectile => self.projectiles.remove(c),
                    Family::Grenade => self.grenades.remove(c),
                    Family::Sensor => self.sensors.remove(c),
                    Family::EnergyPickup => self.energy_pickups.remove(c),
                    Family::Rocket => self.rockets.remove(c),
                    Family::AiPlayer => self.ai_players.remove(c),
                }
            }
        }
        let slot = &mut self.entities[id as usize];
        slot.mask = ComponentMask::empty();
        slot.components = [u16::MAX; FAMILY_COUNT];
    }

    pub fn slot(&self, id: EntityId) -> &EntitySlot {
        &self.entities[id as usize]
    }

    pub fn slot_mut(&mut self, id: EntityId) -> &mut EntitySlot {
        &mut self.entities[id as usize]
    }

    pub fn alive(&self, id: EntityId) -> bool {
        (id as usize) < self.entities.len() && self.entities[id as usize].active
    }

    pub fn entity_ref(&self, id: EntityId) -> EntityRef {
        EntityRef::new(id, self.entities[id as usize].revision)
    }

    /// Resolve a reference; dangling revisions resolve to `None`.
    pub fn resolve(&self, r: EntityRef) -> Option<EntityId> {
        if r.is_null() || (r.id as usize) >= self.entities.len() {
            return None;
        }
        let slot = &self.entities[r.id as usize];
        (slot.active && slot.revision == r.revision).then_some(r.id)
    }

    pub fn has(&self, id: EntityId, family: Family) -> bool {
        self.entities[id as usize].mask.contains(family.mask())
    }

    pub fn component_slot(&self, id: EntityId, family: Family) -> u16 {
        self.entities[id as usize].components[family as usize]
    }

    fn register(&mut self, id: EntityId, family: Family, component: u16) {
        let slot = &mut self.entities[id as usize];
        slot.mask |= family.mask();
        slot.components[family as usize] = component;
    }

    pub fn iter_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active)
            .map(|(id, _)| id as EntityId)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.iter().filter(|s| s.active).count()
    }
}

macro_rules! attach_api {
    ($attach:ident, $net_attach:ident, $get:ident, $get_mut:ident, $pool:ident, $ty:ty, $family:expr) => {
        impl World {
            pub fn $attach(&mut self, id: EntityId, data: $ty) -> u16 {
                let c = self.$pool.add(id, data);
                self.register(id, $family, c);
                c
            }

            /// Receive-side attach at an exact pool slot and revision.
            pub fn $net_attach(&mut self, id: EntityId, slot: u16, revision: Revision, data: $ty) {
                self.$pool.net_add(slot, id, revision, data);
                self.register(id, $family, slot);
            }

            pub fn $get(&self, id: EntityId) -> Option<&$ty> {
                let c = self.component_slot(id, $family);
                if c == u16::MAX {
                    None
                } else {
                    self.$pool.get(c)
                }
            }

            pub fn $get_mut(&mut self, id: EntityId) -> Option<&mut $ty> {
                let c = self.component_slot(id, $family);
                if c == u16::MAX {
                    None
                } else {
                    self.$pool.get_mut(c)
                }
            }
        }
    };
}

attach_api!(attach_transform, net_attach_transform, transform, transform_mut, transforms, Transform, Family::Transform);
attach_api!(attach_rigid_body, net_attach_rigid_body, rigid_body, rigid_body_mut, rigid_bodies, RigidBody, Family::RigidBody);
attach_api!(attach_health, net_attach_health, health, health_mut, healths, Health, Family::Health);
attach_api!(attach_target, net_attach_target, target, target_mut, targets, Target, Family::Target);
attach_api!(attach_walker, net_attach_walker, walker, walker_mut, walkers, Walker, Family::Walker);
attach_api!(attach_ai_agent, net_attach_ai_agent, ai_agent, ai_agent_mut, ai_agents, AiAgent, Family::AiAgent);
attach_api!(attach_drone, net_attach_drone, drone, drone_mut, drones, Drone, Family::Drone);
attach_api!(attach_minion, net_attach_minion, minion, minion_mut, minions, Minion, Family::Minion);
attach_api!(attach_player_human, net_attach_player_human, player_human, player_human_mut, player_humans, PlayerHuman, Family::PlayerHuman);
attach_api!(attach_player_manager, net_attach_player_manager, player_manager, player_manager_mut, player_managers, PlayerManager, Family::PlayerManager);
attach_api!(attach_player_control, net_attach_player_control, player_control, player_control_mut, player_controls, PlayerControl, Family::PlayerControl);
attach_api!(attach_projectile, net_attach_projectile, projectile, projectile_mut, projectiles, Projectile, Family::Projectile);
attach_api!(attach_grenade, net_attach_grenade, grenade, grenade_mut, grenades, Grenade, Family::Grenade);
attach_api!(attach_sensor, net_attach_sensor, sensor, sensor_mut, sensors, Sensor, Family::Sensor);
attach_api!(attach_energy_pickup, net_attach_energy_pickup, energy_pickup, energy_pickup_mut, energy_pickups, EnergyPickup, Family::EnergyPickup);
attach_api!(attach_rocket, net_attach_rocket, rocket, rocket_mut, rockets, Rocket, Family::Rocket);
attach_api!(attach_ai_player, net_attach_ai_player, ai_player, ai_player_mut, ai_players, AiPlayer, Family::AiPlayer);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_despawn_revision() {
        let mut world = World::new();
        let a = world.spawn();
        let ref_a = world.entity_ref(a);
        assert_eq!(world.resolve(ref_a), Some(a));

        world.despawn(a);
        assert_eq!(world.resolve(ref_a), None);

        let b = world.spawn();
        assert_eq!(a, b); // slot reused
        assert_eq!(world.resolve(ref_a), None); // stale revision stays dead
    }

    #[test]
    fn test_component_attach_and_mask() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_transform(e, Transform::default());
        world.attach_drone(e, Drone::default());

        assert!(world.has(e, Family::Transform));
        assert!(world.has(e, Family::Drone));
        assert!(!world.has(e, Family::Minion));
        assert!(world.transform(e).is_some());

        world.despawn(e);
        assert_eq!(world.transforms.len(), 0);
        assert_eq!(world.drones.len(), 0);
    }

    #[test]
    fn test_net_add_overwrites_stale_slot() {
        let mut world = World::new();
        let e = world.spawn();
        world.attach_transform(e, Transform::default());

        // remote tells us slot 0 now holds a different entity at revision 7
        world.net_add(5, 7);
        world.net_attach_transform(5, 0, 3, Transform::default());

        assert_eq!(world.transforms.revision(0), 3);
        assert_eq!(world.transforms.entity(0), 5);
        assert_eq!(world.slot(5).revision, 7);
    }

    #[test]
    fn test_dangling_ref_resolves_null() {
        let mut world = World::new();
        let e = world.spawn();
        let r = EntityRef::new(e, world.slot(e).revision.wrapping_add(1));
        assert_eq!(world.resolve(r), None);
        assert_eq!(world.resolve(REF_NULL), None);
    }
}
