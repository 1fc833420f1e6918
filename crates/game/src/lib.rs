pub mod entity;
pub mod math;
pub mod net;
pub mod swap;

pub use entity::{
    Ability, AiAgent, AiPlayer, AssetId, ComponentMask, Constraint, ConstraintKind, Drone,
    EnergyPickup, EntityId, EntityRef, Family, Grenade, Health, Minion, PlayerControl,
    PlayerHuman, PlayerManager, Pool, Projectile, RemoteControl, Revision, RigidBody,
    RigidBodyShape, Rocket, Sensor, Target, Transform, Upgrade, Walker, World, ID_NULL,
    MAX_ABILITIES, MAX_ENTITIES, MAX_GAMEPADS, MAX_PLAYERS, REF_NULL,
};
pub use net::{
    client::{Client, ClientMode, LocalPlayer},
    sequence::{sequence_advance, sequence_more_recent, sequence_relative_to, Ack, SequenceId},
    server::{Server, ServerClient, ServerMode},
    LevelDescriptor, MessageSource, MessageType, StateCommon, GAME_VERSION,
    NET_INTERPOLATION_DELAY, NET_MAX_PACKET_SIZE, NET_TICK_RATE, NET_TIMEOUT,
};
pub use swap::SyncSwapper;
