//! Triangle soup containers, a 3D chunk grid for spatial indexing, and the
//! chunked raycast that the drone-graph and reverb passes lean on.

use glam::{IVec3, Mat4, Vec3};

/// Raycasts accept a hit this far past the segment end, so a grazing surface
/// at the destination still registers.
pub const RAY_PADDING: f32 = tether::entity::DRONE_RADIUS;

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub color: [f32; 4],
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            bounds_min: Vec3::splat(f32::MAX),
            bounds_max: Vec3::splat(f32::MIN),
            ..Self::default()
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Append another mesh under a world transform, growing the bounds.
    pub fn append_transformed(&mut self, other: &Mesh, transform: &Mat4) {
        let base = self.vertices.len() as u32;
        for v in &other.vertices {
            let world = transform.transform_point3(*v);
            self.bounds_min = self.bounds_min.min(world);
            self.bounds_max = self.bounds_max.max(world);
            self.vertices.push(world);
        }
        for i in &other.indices {
            self.indices.push(base + i);
        }
    }

    pub fn normalize_bounds(&mut self) {
        if self.bounds_max.x < self.bounds_min.x
            || self.bounds_max.y < self.bounds_min.y
            || self.bounds_max.z < self.bounds_min.z
        {
            self.bounds_min = Vec3::ZERO;
            self.bounds_max = Vec3::ZERO;
        }
    }

    /// An axis-aligned box centered at the origin; the implicit collision
    /// meshes are built from these.
    pub fn cube(half_extents: Vec3, color: [f32; 4]) -> Self {
        let h = half_extents;
        let corners = [
            Vec3::new(-h.x, -h.y, -h.z),
            Vec3::new(h.x, -h.y, -h.z),
            Vec3::new(h.x, h.y, -h.z),
            Vec3::new(-h.x, h.y, -h.z),
            Vec3::new(-h.x, -h.y, h.z),
            Vec3::new(h.x, -h.y, h.z),
            Vec3::new(h.x, h.y, h.z),
            Vec3::new(-h.x, h.y, h.z),
        ];
        let faces: [[u32; 4]; 6] = [
            [0, 3, 2, 1],
            [4, 5, 6, 7],
            [0, 1, 5, 4],
            [2, 3, 7, 6],
            [1, 2, 6, 5],
            [0, 4, 7, 3],
        ];
        let mut mesh = Mesh::new();
        mesh.color = color;
        mesh.vertices.extend_from_slice(&corners);
        for face in faces {
            mesh.indices.extend_from_slice(&[face[0], face[1], face[2]]);
            mesh.indices.extend_from_slice(&[face[0], face[2], face[3]]);
        }
        for v in &mesh.vertices {
            mesh.bounds_min = mesh.bounds_min.min(*v);
            mesh.bounds_max = mesh.bounds_max.max(*v);
        }
        mesh
    }
}

/// Fixed-size cube subdivision of world space.
#[derive(Debug, Clone, Default)]
pub struct Chunks<T> {
    pub chunk_size: f32,
    pub vmin: Vec3,
    pub size: IVec3,
    pub chunks: Vec<T>,
}

impl<T: Default + Clone> Chunks<T> {
    pub fn resize(&mut self, bounds_min: Vec3, bounds_max: Vec3, chunk_size: f32) {
        self.chunk_size = chunk_size;
        self.vmin = bounds_min;
        let extent = (bounds_max - bounds_min).max(Vec3::ZERO);
        self.size = IVec3::new(
            (extent.x / chunk_size).floor() as i32 + 1,
            (extent.y / chunk_size).floor() as i32 + 1,
            (extent.z / chunk_size).floor() as i32 + 1,
        );
        self.chunks = vec![T::default(); (self.size.x * self.size.y * self.size.z) as usize];
    }
}

impl<T> Chunks<T> {
    pub fn coord(&self, pos: Vec3) -> IVec3 {
        let scaled = (pos - self.vmin) / self.chunk_size;
        IVec3::new(
            scaled.x.floor() as i32,
            scaled.y.floor() as i32,
            scaled.z.floor() as i32,
        )
    }

    pub fn clamped_coord(&self, coord: IVec3) -> IVec3 {
        coord.clamp(IVec3::ZERO, self.size - IVec3::ONE)
    }

    pub fn index(&self, coord: IVec3) -> usize {
        (coord.x + coord.y * self.size.x + coord.z * self.size.x * self.size.y) as usize
    }

    pub fn coord_of(&self, index: usize) -> IVec3 {
        let i = index as i32;
        let xy = self.size.x * self.size.y;
        IVec3::new(i % self.size.x, (i / self.size.x) % self.size.y, i / xy)
    }

    /// World-space center of a chunk.
    pub fn pos(&self, index: usize) -> Vec3 {
        let coord = self.coord_of(index);
        self.vmin
            + (Vec3::new(coord.x as f32, coord.y as f32, coord.z as f32) + Vec3::splat(0.5))
                * self.chunk_size
    }

    pub fn get(&self, coord: IVec3) -> &T {
        &self.chunks[self.index(coord)]
    }

    pub fn get_mut(&mut self, coord: IVec3) -> &mut T {
        let index = self.index(coord);
        &mut self.chunks[index]
    }

    pub fn contains(&self, coord: IVec3) -> bool {
        coord.cmpge(IVec3::ZERO).all() && coord.cmplt(self.size).all()
    }
}

/// Triangles flattened into per-chunk vertex triples.
pub type ChunkedTris = Chunks<Vec<Vec3>>;

/// Drop each triangle into every chunk its padded bounding box overlaps.
pub fn chunk_mesh_tris(mesh: &Mesh, out: &mut ChunkedTris, cell_size: f32, padding: f32) {
    out.resize(mesh.bounds_min, mesh.bounds_max, cell_size);
    for tri in mesh.indices.chunks_exact(3) {
        let a = mesh.vertices[tri[0] as usize];
        let b = mesh.vertices[tri[1] as usize];
        let c = mesh.vertices[tri[2] as usize];
        let vmin = a.min(b).min(c) - Vec3::splat(padding);
        let vmax = a.max(b).max(c) + Vec3::splat(padding);
        let start = out.clamped_coord(out.coord(vmin));
        let end = out.clamped_coord(out.coord(vmax));
        for x in start.x..=end.x {
            for y in start.y..=end.y {
                for z in start.z..=end.z {
                    let chunk = out.get_mut(IVec3::new(x, y, z));
                    chunk.push(a);
                    chunk.push(b);
                    chunk.push(c);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    pub pos: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

fn raycast_chunk(tris: &[Vec3], start: Vec3, dir: Vec3, closest: &mut f32) -> Option<Vec3> {
    let mut hit_normal = None;
    for tri in tris.chunks_exact(3) {
        let (a, b, c) = (tri[0], tri[1], tri[2]);
        let ba = b - a;
        let ca = c - a;

        let h = dir.cross(ca);
        let z = ba.dot(h);
        if z > -0.00001 && z < 0.00001 {
            continue;
        }
        let f = 1.0 / z;
        let s = start - a;
        let u = f * s.dot(h);
        if !(0.0..=1.0).contains(&u) {
            continue;
        }
        let q = s.cross(ba);
        let v = f * dir.dot(q);
        if v < 0.0 || u + v > 1.0 {
            continue;
        }
        let distance = f * ca.dot(q);
        if distance > 0.0 && distance < *closest {
            *closest = distance;
            hit_normal = Some(ba.cross(ca).normalize());
        }
    }
    hit_normal
}

/// Segment raycast through the chunk grid; nearest hit wins. The traversal
/// steps voxels with the usual DDA walk, so each chunk's triangles are only
/// tested when the segment actually crosses it.
pub fn raycast(mesh: &ChunkedTris, start: Vec3, end: Vec3) -> Option<RayHit> {
    if mesh.chunks.is_empty() {
        return None;
    }

    let start_scaled = (start - mesh.vmin) / mesh.chunk_size;
    let end_scaled = (end - mesh.vmin) / mesh.chunk_size;

    let mut dir = end - start;
    let distance = dir.length();
    if distance <= f32::EPSILON {
        return None;
    }
    dir /= distance;

    let mut closest = distance + RAY_PADDING;

    let coord_start = mesh.clamped_coord(mesh.coord(start));
    let coord_end = mesh.clamped_coord(mesh.coord(end));
    let mut coord = coord_start;

    let step = IVec3::new(
        (coord_end.x - coord.x).signum(),
        (coord_end.y - coord.y).signum(),
        (coord_end.z - coord.z).signum(),
    );

    let span = (end_scaled - start_scaled).abs();
    let delta_t = Vec3::ONE / span;
    let mut t = {
        let cell_min = Vec3::new(coord.x as f32, coord.y as f32, coord.z as f32);
        let cell_max = cell_min + Vec3::ONE;
        Vec3::new(
            if start_scaled.x > end_scaled.x {
                start_scaled.x - cell_min.x
            } else {
                cell_max.x - start_scaled.x
            } * delta_t.x,
            if start_scaled.y > end_scaled.y {
                start_scaled.y - cell_min.y
            } else {
                cell_max.y - start_scaled.y
            } * delta_t.y,
            if start_scaled.z > end_scaled.z {
                start_scaled.z - cell_min.z
            } else {
                cell_max.z - start_scaled.z
            } * delta_t.z,
        )
    };

    let mut best: Option<Vec3> = None;
    loop {
        if let Some(normal) = raycast_chunk(mesh.get(coord), start, dir, &mut closest) {
            best = Some(normal);
        }

        if t.x <= t.y && t.x <= t.z {
            if coord.x == coord_end.x {
                break;
            }
            t.x += delta_t.x;
            coord.x += step.x;
        } else if t.y <= t.z {
            if coord.y == coord_end.y {
                break;
            }
            t.y += delta_t.y;
            coord.y += step.y;
        } else {
            if coord.z == coord_end.z {
                break;
            }
            t.z += delta_t.z;
            coord.z += step.z;
        }
    }

    best.map(|normal| RayHit {
        pos: start + dir * closest,
        normal,
        distance: closest,
    })
}

/// Convenience: does anything block the segment?
pub fn raycast_blocked(mesh: &ChunkedTris, start: Vec3, end: Vec3) -> bool {
    raycast(mesh, start, end).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floor_mesh(extent: f32) -> Mesh {
        let mut mesh = Mesh::new();
        mesh.color = [0.5, 0.5, 0.5, 1.0];
        mesh.vertices = vec![
            Vec3::new(-extent, 0.0, -extent),
            Vec3::new(extent, 0.0, -extent),
            Vec3::new(extent, 0.0, extent),
            Vec3::new(-extent, 0.0, extent),
        ];
        mesh.indices = vec![0, 2, 1, 0, 3, 2];
        for v in &mesh.vertices {
            mesh.bounds_min = mesh.bounds_min.min(*v);
            mesh.bounds_max = mesh.bounds_max.max(*v);
        }
        mesh
    }

    #[test]
    fn test_chunk_coord_roundtrip() {
        let mut chunks: Chunks<Vec<u8>> = Chunks::default();
        chunks.resize(Vec3::new(-10.0, 0.0, -10.0), Vec3::new(10.0, 10.0, 10.0), 5.0);
        for index in 0..chunks.chunks.len() {
            let coord = chunks.coord_of(index);
            assert_eq!(chunks.index(coord), index);
            assert!(chunks.contains(coord));
        }
    }

    #[test]
    fn test_chunk_mesh_places_triangles() {
        let mesh = floor_mesh(8.0);
        let mut chunked = ChunkedTris::default();
        chunk_mesh_tris(&mesh, &mut chunked, 5.0, 0.0);
        let total: usize = chunked.chunks.iter().map(|c| c.len()).sum();
        // every chunk overlapping the floor holds copies of both triangles
        assert!(total >= mesh.indices.len());
    }

    #[test]
    fn test_raycast_hits_floor() {
        let mesh = floor_mesh(8.0);
        let mut chunked = ChunkedTris::default();
        chunk_mesh_tris(&mesh, &mut chunked, 5.0, 0.2);

        let hit = raycast(
            &chunked,
            Vec3::new(1.0, 5.0, 1.0),
            Vec3::new(1.0, -5.0, 1.0),
        )
        .expect("ray should hit the floor");
        assert!(hit.pos.y.abs() < 1e-4);
        assert!((hit.normal.y - 1.0).abs() < 1e-4);
        assert!((hit.distance - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_raycast_misses_outside() {
        let mesh = floor_mesh(2.0);
        let mut chunked = ChunkedTris::default();
        chunk_mesh_tris(&mesh, &mut chunked, 5.0, 0.0);

        assert!(raycast(
            &chunked,
            Vec3::new(30.0, 5.0, 30.0),
            Vec3::new(30.0, -5.0, 30.0),
        )
        .is_none());
    }

    #[test]
    fn test_cube_mesh_closed() {
        let cube = Mesh::cube(Vec3::splat(1.0), [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(cube.triangle_count(), 12);
        assert_eq!(cube.bounds_min, Vec3::splat(-1.0));
        assert_eq!(cube.bounds_max, Vec3::splat(1.0));
    }
}
