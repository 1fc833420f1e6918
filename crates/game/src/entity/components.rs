//! Component data for every replicated family, plus the server-only bot
//! controller. Field sets mirror what the wire actually carries; anything a
//! receiver can reconstruct locally is omitted.

use glam::{Quat, Vec2, Vec3};

use super::{EntityRef, MAX_ABILITIES, REF_NULL};

pub type AssetId = u16;
pub const ASSET_NULL: AssetId = u16::MAX;

pub const DRONE_MAX_DISTANCE: f32 = 25.0;
pub const DRONE_RADIUS: f32 = 0.2;
pub const DRONE_VERTICAL_DOT_LIMIT: f32 = 0.9998;
pub const DRONE_CHARGES: i8 = 3;
pub const DRONE_COOLDOWN: f32 = 3.0;
pub const MINION_ATTACK_TIME: f32 = 3.0;
pub const PLAYER_SPAWN_DELAY: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub pos: Vec3,
    pub rot: Quat,
    pub parent: EntityRef,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            pos: Vec3::ZERO,
            rot: Quat::IDENTITY,
            parent: REF_NULL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RigidBodyShape {
    #[default]
    Box = 0,
    Sphere,
    CapsuleX,
    CapsuleY,
    CapsuleZ,
}

impl RigidBodyShape {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Sphere,
            2 => Self::CapsuleX,
            3 => Self::CapsuleY,
            4 => Self::CapsuleZ,
            _ => Self::Box,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConstraintKind {
    #[default]
    ConeTwist = 0,
    PointToPoint,
    Fixed,
}

impl ConstraintKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::PointToPoint,
            2 => Self::Fixed,
            _ => Self::ConeTwist,
        }
    }
}

/// A joint anchored on this body, pointing at a peer body. The physics world
/// owns the actual joint object; this is only its replicated description.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub peer: EntityRef,
    pub frame_a: (Vec3, Quat),
    pub frame_b: (Vec3, Quat),
    pub limits: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RigidBody {
    pub shape: RigidBodyShape,
    pub size: Vec3,
    pub damping: Vec2,
    pub mass: f32,
    pub restitution: f32,
    pub mesh_id: AssetId,
    pub collision_group: i16,
    pub collision_filter: i16,
    pub ccd: bool,
    pub constraints: Vec<Constraint>,
}

impl Default for RigidBody {
    fn default() -> Self {
        Self {
            shape: RigidBodyShape::Box,
            size: Vec3::ONE,
            damping: Vec2::ZERO,
            mass: 1.0,
            restitution: 0.0,
            mesh_id: ASSET_NULL,
            collision_group: 1,
            collision_filter: -1,
            ccd: false,
            constraints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Health {
    pub hp: i8,
    pub hp_max: i8,
    pub shield: i8,
    pub shield_max: i8,
    pub regen_timer: f32,
}

/// Aim-assist target point; `net_velocity` is smoothed from snapshot deltas
/// on the client.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Target {
    pub local_offset: Vec3,
    pub net_velocity: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Walker {
    pub height: f32,
    pub support_height: f32,
    pub radius: f32,
    pub mass: f32,
    pub rotation: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AiAgent {
    pub team: i8,
    pub stealth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Ability {
    Sensor = 0,
    Rocket,
    Minion,
    #[default]
    None,
}

pub const ABILITY_COUNT: u8 = 3;

impl Ability {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Sensor,
            1 => Self::Rocket,
            2 => Self::Minion,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Upgrade {
    Sensor = 0,
    Rocket,
    Minion,
    #[default]
    None,
}

pub const UPGRADE_COUNT: u8 = 3;

impl Upgrade {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Sensor,
            1 => Self::Rocket,
            2 => Self::Minion,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drone {
    pub charges: i8,
    pub cooldown: f32,
    pub current_ability: Ability,
}

impl Default for Drone {
    fn default() -> Self {
        Self {
            charges: DRONE_CHARGES,
            cooldown: 0.0,
            current_ability: Ability::None,
        }
    }
}

/// Minion combat and animation state; the walk rotation lives on `Walker`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Minion {
    pub owner: EntityRef,
    pub attack_timer: f32,
    pub animation: AssetId,
    pub animation_time: f32,
}

impl Default for Minion {
    fn default() -> Self {
        Self {
            owner: REF_NULL,
            attack_timer: 0.0,
            animation: ASSET_NULL,
            animation_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerHuman {
    pub uuid: u64,
    pub gamepad: u8,
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerManager {
    pub team: i8,
    pub credits: i16,
    pub kills: i16,
    pub respawns: i16,
    pub spawn_timer: f32,
    pub state_timer: f32,
    pub upgrades: u32,
    pub abilities: [Ability; MAX_ABILITIES],
    pub current_upgrade: Upgrade,
    pub instance: EntityRef,
    pub username: String,
}

impl Default for PlayerManager {
    fn default() -> Self {
        Self {
            team: 0,
            credits: 0,
            kills: 0,
            respawns: 0,
            spawn_timer: PLAYER_SPAWN_DELAY,
            state_timer: 0.0,
            upgrades: 0,
            abilities: [Ability::None; MAX_ABILITIES],
            current_upgrade: Upgrade::None,
            instance: REF_NULL,
            username: String::new(),
        }
    }
}

/// What the client last told us (or the server last told the client) about a
/// controlled entity. The control layer reconciles against this.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteControl {
    pub movement: Vec3,
    pub pos: Vec3,
    pub rot: Quat,
    pub parent: EntityRef,
}

impl Default for RemoteControl {
    fn default() -> Self {
        Self {
            movement: Vec3::ZERO,
            pos: Vec3::ZERO,
            rot: Quat::IDENTITY,
            parent: REF_NULL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerControl {
    pub player: EntityRef,
    pub remote_control: RemoteControl,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projectile {
    pub owner: EntityRef,
    pub velocity: Vec3,
    pub lifetime: f32,
}

impl Default for Projectile {
    fn default() -> Self {
        Self {
            owner: REF_NULL,
            velocity: Vec3::ZERO,
            lifetime: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Grenade {
    pub owner: EntityRef,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sensor {
    pub team: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnergyPickup {
    pub team: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rocket {
    pub owner: EntityRef,
    pub target: EntityRef,
}

/// Server-side bot controller. Never replicated.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AiPlayer {
    pub respawn_timer: f32,
}
