//! Level entity manifests: what the server spawns before clients arrive.
//! The geometry side of a level lives in the importer's `.nav` output; this
//! is only the replicated starting population.

use std::path::Path;

use anyhow::{Context, Result};
use glam::{Quat, Vec3};
use serde::Deserialize;

use tether::{
    Drone, EnergyPickup, Health, LevelDescriptor, Minion, Sensor, Target, Transform, Walker, World,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnKind {
    EnergyPickup,
    Sensor,
    Minion,
    Drone,
}

#[derive(Debug, Deserialize)]
pub struct SpawnEntry {
    pub kind: SpawnKind,
    #[serde(default)]
    pub pos: [f32; 3],
    #[serde(default)]
    pub team: i8,
}

#[derive(Debug, Deserialize)]
pub struct LevelFile {
    #[serde(default)]
    pub id: i16,
    #[serde(default)]
    pub far_plane: Option<f32>,
    #[serde(default)]
    pub ambient: Option<[f32; 3]>,
    #[serde(default)]
    pub entities: Vec<SpawnEntry>,
}

impl LevelFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read level {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse level {}", path.display()))
    }

    pub fn descriptor(&self) -> LevelDescriptor {
        let defaults = LevelDescriptor::default();
        LevelDescriptor {
            id: self.id,
            far_plane: self.far_plane.unwrap_or(defaults.far_plane),
            ambient: self.ambient.unwrap_or(defaults.ambient),
        }
    }

    /// Populate the world. Connected clients receive each of these via
    /// `EntityCreate` once the session goes active.
    pub fn spawn_into(&self, world: &mut World) {
        for entry in &self.entities {
            let e = world.spawn();
            world.attach_transform(
                e,
                Transform {
                    pos: Vec3::from_array(entry.pos),
                    rot: Quat::IDENTITY,
                    ..Transform::default()
                },
            );
            match entry.kind {
                SpawnKind::EnergyPickup => {
                    world.attach_energy_pickup(e, EnergyPickup { team: entry.team });
                    world.attach_target(e, Target::default());
                }
                SpawnKind::Sensor => {
                    world.attach_sensor(e, Sensor { team: entry.team });
                    world.attach_health(
                        e,
                        Health {
                            hp: 2,
                            hp_max: 2,
                            ..Health::default()
                        },
                    );
                }
                SpawnKind::Minion => {
                    world.attach_minion(e, Minion::default());
                    world.attach_walker(
                        e,
                        Walker {
                            height: 1.8,
                            support_height: 0.3,
                            radius: 0.4,
                            mass: 2.0,
                            rotation: 0.0,
                        },
                    );
                    world.attach_health(
                        e,
                        Health {
                            hp: 3,
                            hp_max: 3,
                            ..Health::default()
                        },
                    );
                }
                SpawnKind::Drone => {
                    world.attach_drone(e, Drone::default());
                    world.attach_target(e, Target::default());
                    world.attach_health(
                        e,
                        Health {
                            hp: 1,
                            hp_max: 1,
                            shield: 1,
                            shield_max: 1,
                            ..Health::default()
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_population() {
        let level: LevelFile = serde_json::from_str(
            r#"{
                "id": 4,
                "entities": [
                    { "kind": "energy_pickup", "pos": [1, 0, 1] },
                    { "kind": "sensor", "pos": [2, 1, 0], "team": 1 },
                    { "kind": "minion", "pos": [0, 0, 5] }
                ]
            }"#,
        )
        .unwrap();

        let mut world = World::new();
        level.spawn_into(&mut world);
        assert_eq!(world.entity_count(), 3);
        assert_eq!(world.energy_pickups.len(), 1);
        assert_eq!(world.sensors.len(), 1);
        assert_eq!(world.minions.len(), 1);
        assert_eq!(level.descriptor().id, 4);
    }
}
