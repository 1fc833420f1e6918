//! Environmental reverb voxel, baked from the same chunked raycast geometry
//! as the drone graph.
//!
//! Every voxel center fires 42 rays along a subdivided icosphere into both
//! meshes; hits are classified into three distance bands around a damped
//! centroid, plus an outdoor fraction for rays that escaped. Cells with no
//! valid hits get filled by two neighbor-smoothing passes, then everything is
//! remapped into `[0, 1]`.

use glam::{IVec3, Vec3};

use crate::geometry::{raycast, ChunkedTris, Chunks};

pub const REVERB_CHUNK_SIZE: f32 = 3.0;
pub const REVERB_BANDS: usize = 3;

const ICOSPHERE_VERTICES: usize = 42;
const RAY_LENGTH: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbCell {
    pub bands: [f32; REVERB_BANDS],
    pub outdoor: f32,
}

impl Default for ReverbCell {
    fn default() -> Self {
        Self {
            bands: [0.0; REVERB_BANDS],
            outdoor: 0.0,
        }
    }
}

impl ReverbCell {
    fn invalid() -> Self {
        Self {
            bands: [-1.0; REVERB_BANDS],
            outdoor: -1.0,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.bands[0] < 0.0
    }
}

pub type ReverbVoxel = Chunks<ReverbCell>;

/// The 42 directions: a unit icosahedron with every edge midpoint projected
/// back onto the sphere.
pub fn icosphere_directions() -> [Vec3; ICOSPHERE_VERTICES] {
    let tao = 1.618_034_f32;
    let icosahedron = [
        Vec3::new(1.0, tao, 0.0),
        Vec3::new(-1.0, tao, 0.0),
        Vec3::new(1.0, -tao, 0.0),
        Vec3::new(-1.0, -tao, 0.0),
        Vec3::new(0.0, 1.0, tao),
        Vec3::new(0.0, -1.0, tao),
        Vec3::new(0.0, 1.0, -tao),
        Vec3::new(0.0, -1.0, -tao),
        Vec3::new(tao, 0.0, 1.0),
        Vec3::new(-tao, 0.0, 1.0),
        Vec3::new(tao, 0.0, -1.0),
        Vec3::new(-tao, 0.0, -1.0),
    ];
    const EDGES: [[usize; 2]; 30] = [
        [0, 1],
        [1, 4],
        [0, 4],
        [1, 9],
        [9, 4],
        [9, 5],
        [4, 5],
        [9, 3],
        [5, 3],
        [2, 3],
        [3, 7],
        [2, 7],
        [2, 5],
        [7, 10],
        [10, 2],
        [0, 8],
        [8, 10],
        [0, 10],
        [4, 8],
        [8, 2],
        [8, 5],
        [0, 6],
        [1, 6],
        [11, 1],
        [11, 6],
        [9, 11],
        [3, 11],
        [6, 10],
        [6, 7],
        [11, 7],
    ];

    let mut directions = [Vec3::ZERO; ICOSPHERE_VERTICES];
    for (i, v) in icosahedron.iter().enumerate() {
        directions[i] = v.normalize();
    }
    for (i, edge) in EDGES.iter().enumerate() {
        let a = icosahedron[edge[0]];
        let b = icosahedron[edge[1]];
        directions[12 + i] = ((a + b) * 0.5).normalize();
    }
    directions
}

/// One cell: raycast the icosphere, find the damped centroid of the hit
/// field, bucket hits by distance from it.
fn reverb_calc(
    accessible: &ChunkedTris,
    inaccessible: &ChunkedTris,
    directions: &[Vec3; ICOSPHERE_VERTICES],
    pos: Vec3,
) -> ReverbCell {
    let mut hit_positions = [Vec3::ZERO; ICOSPHERE_VERTICES];
    let mut hit_normals = [Vec3::ZERO; ICOSPHERE_VERTICES];
    let mut blocked = 0usize;
    let mut hit_valid = false;

    for (i, dir) in directions.iter().enumerate() {
        let end = pos + *dir * RAY_LENGTH;
        let hit_a = raycast(accessible, pos, end);
        let hit_b = raycast(inaccessible, pos, end);
        // closest hit wins between the two meshes
        let hit = match (hit_a, hit_b) {
            (Some(a), Some(b)) => {
                if (b.pos - pos).length_squared() < (a.pos - pos).length_squared() {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (a, b) => a.or(b),
        };

        match hit {
            Some(h) => {
                hit_positions[i] = h.pos;
                hit_normals[i] = h.normal;
                blocked += 1;
            }
            None => {
                hit_positions[i] = end;
                hit_normals[i] = -*dir;
            }
        }
        hit_valid |= hit_normals[i].dot(*dir) < 0.0;
    }

    if !hit_valid {
        return ReverbCell::invalid();
    }

    // damped centroid: hit points pushed back along their normals, averaged,
    // then damped a quarter of the way out from the cell
    let mut center = Vec3::ZERO;
    for i in 0..ICOSPHERE_VERTICES {
        center += hit_positions[i] + hit_normals[i] * 5.0;
    }
    center /= ICOSPHERE_VERTICES as f32;
    center = pos.lerp(center, 0.25);

    let mut bands = [0usize; REVERB_BANDS];
    for hit in &hit_positions {
        let dist_sq = (*hit - center).length_squared();
        if dist_sq < 6.0 * 6.0 {
            bands[0] += 1;
        } else if dist_sq < 12.0 * 12.0 {
            bands[1] += 1;
        } else {
            bands[2] += 1;
        }
    }

    let mut cell = ReverbCell::default();
    for i in 0..REVERB_BANDS {
        cell.bands[i] = bands[i] as f32 / ICOSPHERE_VERTICES as f32;
    }
    cell.outdoor = 1.0 - blocked as f32 / ICOSPHERE_VERTICES as f32;
    cell
}

fn cell_add(accum: &mut ReverbCell, source: &ReverbCell, weight: f32) -> f32 {
    if source.is_invalid() {
        return 0.0;
    }
    for i in 0..REVERB_BANDS {
        accum.bands[i] += source.bands[i] * weight;
    }
    accum.outdoor += source.outdoor * weight;
    weight
}

/// One smoothing pass: every cell pulls an eighth from each axis neighbor;
/// invalid cells renormalize whatever they gathered.
fn smooth(voxel: &mut ReverbVoxel) {
    let copy: Vec<ReverbCell> = voxel.chunks.clone();
    const SUBCELL_WEIGHT: f32 = 0.125;

    for index in 0..voxel.chunks.len() {
        let coord = voxel.coord_of(index);
        let mut cell = ReverbCell::default();
        let mut weight = 0.0;

        for (axis, delta) in [
            (IVec3::X, 1),
            (IVec3::X, -1),
            (IVec3::Y, 1),
            (IVec3::Y, -1),
            (IVec3::Z, 1),
            (IVec3::Z, -1),
        ] {
            let neighbor = coord + axis * delta;
            if voxel.contains(neighbor) {
                weight += cell_add(&mut cell, &copy[voxel.index(neighbor)], SUBCELL_WEIGHT);
            }
        }

        if copy[index].is_invalid() {
            if weight > 0.0 {
                // gathered some valid data; renormalize it
                let scale = 1.0 / weight;
                for i in 0..REVERB_BANDS {
                    cell.bands[i] *= scale;
                }
                cell.outdoor *= scale;
            } else {
                cell = ReverbCell::invalid();
            }
        } else {
            cell_add(&mut cell, &copy[index], 1.0 - weight);
        }

        voxel.chunks[index] = cell;
    }
}

/// Bake the full voxel over the accessible bounds.
pub fn bake(
    accessible: &ChunkedTris,
    inaccessible: &ChunkedTris,
    bounds_min: Vec3,
    bounds_max: Vec3,
) -> ReverbVoxel {
    let mut voxel = ReverbVoxel::default();
    voxel.resize(bounds_min, bounds_max, REVERB_CHUNK_SIZE);

    let directions = icosphere_directions();
    for index in 0..voxel.chunks.len() {
        let pos = voxel.pos(index);
        voxel.chunks[index] = reverb_calc(accessible, inaccessible, &directions, pos);
    }

    smooth(&mut voxel);
    smooth(&mut voxel);

    // remap and clip each band into [0, 1]
    for cell in &mut voxel.chunks {
        cell.bands[0] = ((cell.bands[0] - 0.25) / 0.4).clamp(0.0, 1.0);
        cell.bands[1] = ((cell.bands[1] - 0.1) / 0.4).clamp(0.0, 1.0);
        cell.bands[2] = ((cell.bands[2] - 0.15) / 0.3).clamp(0.0, 1.0);
        cell.outdoor = ((cell.outdoor - 0.1) / 0.25).clamp(0.0, 1.0);
    }

    voxel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{chunk_mesh_tris, Mesh};

    #[test]
    fn test_icosphere_directions_unit_and_distinct() {
        let directions = icosphere_directions();
        for (i, d) in directions.iter().enumerate() {
            assert!((d.length() - 1.0).abs() < 1e-5);
            for other in directions.iter().skip(i + 1) {
                assert!((*d - *other).length() > 1e-3);
            }
        }
    }

    fn closed_room(half: f32) -> ChunkedTris {
        // inward-facing box
        let mut room = Mesh::cube(Vec3::splat(half), [0.5, 0.5, 0.5, 1.0]);
        for tri in room.indices.chunks_exact_mut(3) {
            tri.swap(1, 2);
        }
        let mut chunked = ChunkedTris::default();
        chunk_mesh_tris(&room, &mut chunked, 10.0, 0.2);
        chunked
    }

    #[test]
    fn test_enclosed_cell_not_outdoor() {
        let room = closed_room(4.0);
        let mut empty = ChunkedTris::default();
        empty.resize(Vec3::splat(-4.0), Vec3::splat(4.0), 10.0);

        let voxel = bake(&room, &empty, Vec3::splat(-4.0), Vec3::splat(4.0));
        // the center cell saw every ray blocked inside a small room: fully
        // indoor and dominated by the near band
        let center_index = voxel.index(voxel.clamped_coord(voxel.coord(Vec3::ZERO)));
        let center = &voxel.chunks[center_index];
        assert!(!center.is_invalid());
        assert_eq!(center.outdoor, 0.0);
        assert!(center.bands[0] > 0.5);
    }

    #[test]
    fn test_open_air_is_outdoor() {
        let mut empty_a = ChunkedTris::default();
        empty_a.resize(Vec3::ZERO, Vec3::splat(6.0), 10.0);
        let mut floor = Mesh::new();
        floor.color = [0.5, 0.5, 0.5, 1.0];
        floor.vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(6.0, 0.0, 0.0),
            Vec3::new(6.0, 0.0, 6.0),
            Vec3::new(0.0, 0.0, 6.0),
        ];
        floor.indices = vec![0, 2, 1, 0, 3, 2];
        for v in &floor.vertices {
            floor.bounds_min = floor.bounds_min.min(*v);
            floor.bounds_max = floor.bounds_max.max(*v);
        }
        let mut chunked = ChunkedTris::default();
        chunk_mesh_tris(&floor, &mut chunked, 10.0, 0.2);

        let voxel = bake(&chunked, &empty_a, floor.bounds_min, Vec3::new(6.0, 6.0, 6.0));
        // a cell well above a lone floor sees most rays escape
        let high = voxel.index(voxel.clamped_coord(voxel.coord(Vec3::new(3.0, 4.5, 3.0))));
        assert!(voxel.chunks[high].outdoor > 0.5);
    }

    #[test]
    fn test_smoothing_fills_invalid_cells() {
        let mut voxel = ReverbVoxel::default();
        voxel.resize(Vec3::ZERO, Vec3::splat(8.9), REVERB_CHUNK_SIZE);
        for cell in &mut voxel.chunks {
            *cell = ReverbCell {
                bands: [0.6, 0.3, 0.1],
                outdoor: 0.4,
            };
        }
        let center = voxel.index(IVec3::new(1, 1, 1));
        voxel.chunks[center] = ReverbCell::invalid();

        smooth(&mut voxel);
        let filled = &voxel.chunks[center];
        assert!(!filled.is_invalid());
        // renormalized average of six identical neighbors
        assert!((filled.bands[0] - 0.6).abs() < 1e-4);
        assert!((filled.outdoor - 0.4).abs() < 1e-4);
    }
}
