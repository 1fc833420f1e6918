//! Level scene graphs: a JSON element tree with embedded collision meshes.
//!
//! The navmesh compiler consumes the scene twice, filtered by accessibility:
//! surfaces a drone may attach to carry an opaque alpha, inaccessible
//! blockers a translucent one. A few gameplay fixtures (terminal,
//! interactable, spawn point) contribute implicit collision boxes that are
//! not part of the authored geometry.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec3};
use serde::Deserialize;

use crate::geometry::Mesh;

#[derive(Debug, Deserialize)]
pub struct MeshData {
    pub vertices: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    #[serde(default = "default_color")]
    pub color: [f32; 4],
}

fn default_color() -> [f32; 4] {
    [1.0, 1.0, 1.0, 1.0]
}

fn default_visible() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct SceneElement {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pos: [f32; 3],
    /// xyzw
    #[serde(default = "default_rot")]
    pub rot: [f32; 4],
    #[serde(default)]
    pub parent: Option<usize>,
    #[serde(default)]
    pub static_geom: bool,
    #[serde(default)]
    pub nonav: bool,
    #[serde(default)]
    pub interactable: bool,
    #[serde(default)]
    pub spawn_point: bool,
    #[serde(default = "default_visible")]
    pub visible: i32,
    #[serde(default)]
    pub meshes: Vec<String>,
}

fn default_rot() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

#[derive(Debug, Deserialize)]
pub struct LevelScene {
    #[serde(default)]
    pub id: i16,
    #[serde(default)]
    pub nonav: bool,
    #[serde(default)]
    pub meshes: HashMap<String, MeshData>,
    #[serde(default)]
    pub elements: Vec<SceneElement>,
}

impl LevelScene {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read level {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse level {}", path.display()))
    }

    fn mesh(&self, name: &str) -> Option<Mesh> {
        let data = self.meshes.get(name)?;
        let mut mesh = Mesh::new();
        mesh.color = data.color;
        mesh.vertices = data.vertices.iter().map(|v| Vec3::from_array(*v)).collect();
        mesh.indices = data.indices.clone();
        for v in &mesh.vertices {
            mesh.bounds_min = mesh.bounds_min.min(*v);
            mesh.bounds_max = mesh.bounds_max.max(*v);
        }
        Some(mesh)
    }
}

pub fn is_accessible(mesh: &Mesh) -> bool {
    mesh.color[3] > 0.5
}

pub fn is_inaccessible(mesh: &Mesh) -> bool {
    mesh.color[3] < 0.5
}

pub fn any_mesh(_mesh: &Mesh) -> bool {
    true
}

/// Implicit collision meshes for fixtures the scene references by role.
pub struct StaticMeshes {
    pub terminal: Mesh,
    pub interactable: Mesh,
    pub spawn_collision: Mesh,
}

impl StaticMeshes {
    pub fn build() -> Self {
        Self {
            terminal: Mesh::cube(Vec3::new(0.6, 1.2, 0.4), [0.2, 0.2, 0.2, 0.0]),
            interactable: Mesh::cube(Vec3::new(0.5, 0.5, 0.5), [0.2, 0.2, 0.2, 0.0]),
            spawn_collision: Mesh::cube(Vec3::new(1.5, 0.1, 1.5), [0.5, 0.5, 0.5, 1.0]),
        }
    }
}

/// Assemble the triangle soup the navmesh passes consume: every static
/// element's meshes under its world transform, plus the implicit fixture
/// boxes, filtered by `filter`.
pub fn consolidate_nav_geometry(scene: &LevelScene, filter: fn(&Mesh) -> bool) -> Mesh {
    let statics = StaticMeshes::build();
    let mut result = Mesh::new();

    let mut transforms: Vec<Mat4> = Vec::with_capacity(scene.elements.len());
    for element in &scene.elements {
        let rot = Quat::from_xyzw(
            element.rot[0],
            element.rot[1],
            element.rot[2],
            element.rot[3],
        )
        .normalize();
        let mut mat =
            Mat4::from_rotation_translation(rot, Vec3::from_array(element.pos));
        if let Some(parent) = element.parent {
            if parent < transforms.len() {
                mat = transforms[parent] * mat;
            }
        }
        transforms.push(mat);

        if element.static_geom && !element.nonav {
            for mesh_ref in &element.meshes {
                match scene.mesh(mesh_ref) {
                    Some(mesh) => {
                        if filter(&mesh) {
                            result.append_transformed(&mesh, &mat);
                        }
                    }
                    None => log::warn!("level references unknown mesh {mesh_ref}"),
                }
            }
        } else if element.name == "terminal" {
            if filter(&statics.terminal) {
                result.append_transformed(&statics.terminal, &mat);
            }
        } else if element.interactable {
            if filter(&statics.interactable) {
                result.append_transformed(&statics.interactable, &mat);
            }
        } else if element.spawn_point && element.visible != 0 {
            if filter(&statics.spawn_collision) {
                result.append_transformed(&statics.spawn_collision, &mat);
            }
        }
    }

    result.normalize_bounds();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_scene() -> LevelScene {
        let json = r#"{
            "id": 3,
            "meshes": {
                "floor": {
                    "vertices": [[-5,0,-5],[5,0,-5],[5,0,5],[-5,0,5]],
                    "indices": [0,2,1,0,3,2],
                    "color": [0.5, 0.5, 0.5, 1.0]
                },
                "blocker": {
                    "vertices": [[-1,0,-1],[1,0,-1],[0,2,0]],
                    "indices": [0,1,2],
                    "color": [0.1, 0.1, 0.1, 0.0]
                }
            },
            "elements": [
                { "name": "root", "static_geom": true, "meshes": ["floor", "blocker"] },
                { "name": "lifted", "pos": [0, 3, 0], "parent": 0,
                  "static_geom": true, "meshes": ["floor"] },
                { "name": "terminal", "pos": [2, 0, 2] },
                { "name": "hidden", "static_geom": true, "nonav": true, "meshes": ["floor"] }
            ]
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_accessible_filter_splits_meshes() {
        let scene = test_scene();
        let accessible = consolidate_nav_geometry(&scene, is_accessible);
        let inaccessible = consolidate_nav_geometry(&scene, is_inaccessible);

        // floor twice (root + lifted child) and the spawn-free terminal box
        // is inaccessible; the blocker only shows up inaccessible
        assert!(accessible.triangle_count() >= 4);
        assert!(inaccessible.triangle_count() >= 1);
        let total = consolidate_nav_geometry(&scene, any_mesh).triangle_count();
        assert_eq!(
            total,
            accessible.triangle_count() + inaccessible.triangle_count()
        );
    }

    #[test]
    fn test_nonav_elements_excluded() {
        let scene = test_scene();
        let all = consolidate_nav_geometry(&scene, any_mesh);
        // root floor (2) + blocker (1) + lifted floor (2) + terminal box
        // (12); the nonav element contributes nothing
        assert_eq!(all.triangle_count(), 17);
    }

    #[test]
    fn test_parent_transform_applies() {
        let scene = test_scene();
        let accessible = consolidate_nav_geometry(&scene, is_accessible);
        // the lifted child floor sits at y = 3
        assert!(accessible.bounds_max.y >= 3.0 - 1e-4);
    }
}
