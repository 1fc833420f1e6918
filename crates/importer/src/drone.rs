//! The 3D surface-point graph for flying agents that attach to surfaces.
//!
//! Accessible triangles are rasterized on a fixed grid in their own plane,
//! samples too close to other geometry are culled, and the survivors get two
//! classes of directed edges: crawl (surface-following short hop, including
//! around a corner) and shoot (ballistic jump to an opposing surface within
//! line of fire). The shuffle before shoot raycasts runs on a fixed-seed
//! stream cipher so identical input yields byte-identical output.

use glam::{IVec3, Vec2, Vec3};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

use tether::entity::{DRONE_MAX_DISTANCE, DRONE_RADIUS, DRONE_VERTICAL_DOT_LIMIT};

use crate::geometry::{chunk_mesh_tris, raycast, raycast_blocked, ChunkedTris, Chunks, Mesh};

/// Spacing of drone nav mesh points.
pub const GRID_SPACING: f32 = 1.25;
const INV_GRID_SPACING: f32 = 1.0 / GRID_SPACING;

pub const CHUNK_SIZE: f32 = 10.0;

/// Per-vertex neighbor budget; overflow truncates and is counted.
pub const ADJACENCY_CAPACITY: usize = 48;

pub const BUILD_SEED: u64 = 0xabad_1dea;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphNode {
    pub chunk: u16,
    pub vertex: u16,
}

/// Neighbor list plus one crawl bit per slot.
#[derive(Debug, Clone, Default)]
pub struct Adjacency {
    pub neighbors: Vec<GraphNode>,
    crawl_bits: u64,
}

impl Adjacency {
    pub fn push(&mut self, node: GraphNode, crawl: bool) {
        debug_assert!(self.neighbors.len() < ADJACENCY_CAPACITY);
        if crawl {
            self.crawl_bits |= 1 << self.neighbors.len();
        }
        self.neighbors.push(node);
    }

    pub fn is_crawl(&self, index: usize) -> bool {
        self.crawl_bits & (1 << index) != 0
    }

    pub fn remove(&mut self, index: usize) {
        // keep the crawl bits aligned with the shifted-down tail
        let tail_mask = !0u64 << (index + 1);
        let head = self.crawl_bits & !(!0u64 << index);
        let tail = (self.crawl_bits & tail_mask) >> 1;
        self.crawl_bits = head | tail;
        self.neighbors.remove(index);
    }

    pub fn is_full(&self) -> bool {
        self.neighbors.len() >= ADJACENCY_CAPACITY
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphChunk {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub adjacency: Vec<Adjacency>,
}

pub type DroneNavMesh = Chunks<GraphChunk>;

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildStats {
    pub removed_vertices: usize,
    pub adjacency_overflows: usize,
    pub orphans: usize,
}

fn point_in_tri(p: Vec2, p0: Vec2, p1: Vec2, p2: Vec2) -> bool {
    let a = 0.5 * (-p1.y * p2.x + p0.y * (-p1.x + p2.x) + p0.x * (p1.y - p2.y) + p1.x * p2.y);
    let sign = if a < 0.0 { -1.0 } else { 1.0 };
    let s = sign * (p0.y * p2.x - p0.x * p2.y + (p2.y - p0.y) * p.x + (p0.x - p2.x) * p.y);
    let t = sign * (p0.x * p1.y - p0.y * p1.x + (p0.y - p1.y) * p.x + (p1.x - p0.x) * p.y);
    s > 0.0 && t > 0.0 && (s + t) < 2.0 * a * sign
}

fn emit(out: &mut DroneNavMesh, normal: Vec3, normal_offset: Vec3, u: Vec3, v: Vec3, p: Vec2) {
    let vertex = normal_offset + u * p.x + v * p.y;
    let coord = out.clamped_coord(out.coord(vertex));
    let index = out.index(coord);
    out.chunks[index].vertices.push(vertex);
    out.chunks[index].normals.push(normal);
}

/// `v1` at the bottom, `v2` and `v3` flush with the top.
#[allow(clippy::too_many_arguments)]
fn rasterize_top_flat(
    out: &mut DroneNavMesh,
    normal: Vec3,
    normal_offset: Vec3,
    u: Vec3,
    v: Vec3,
    v1: Vec2,
    v2: Vec2,
    v3: Vec2,
) {
    let mut invslope1 = GRID_SPACING * (v2.x - v1.x) / (v2.y - v1.y);
    let mut invslope2 = GRID_SPACING * (v3.x - v1.x) / (v3.y - v1.y);
    if invslope1 > invslope2 {
        std::mem::swap(&mut invslope1, &mut invslope2);
    }

    let min_x = (v1.x.min(v2.x).min(v3.x) * INV_GRID_SPACING) as i32;
    let max_x = (v1.x.max(v2.x).max(v3.x) * INV_GRID_SPACING) as i32 + 1;

    let mut curx1 = v1.x;
    let mut curx2 = v1.x;

    let y_start = (v1.y * INV_GRID_SPACING) as i32;
    let y_end = (v2.y * INV_GRID_SPACING) as i32 + 1;
    for y in y_start..=y_end {
        let x_start = min_x.max((curx1 * INV_GRID_SPACING) as i32) - 1;
        let x_end = max_x.min((curx2 * INV_GRID_SPACING) as i32) + 1;
        for x in x_start..=x_end {
            let p = Vec2::new(x as f32 * GRID_SPACING, y as f32 * GRID_SPACING);
            if point_in_tri(p, v1, v2, v3) {
                emit(out, normal, normal_offset, u, v, p);
            }
        }
        curx1 += invslope1;
        curx2 += invslope2;
    }
}

/// `v1` and `v2` flush with the bottom, `v3` at the top.
#[allow(clippy::too_many_arguments)]
fn rasterize_bottom_flat(
    out: &mut DroneNavMesh,
    normal: Vec3,
    normal_offset: Vec3,
    u: Vec3,
    v: Vec3,
    v1: Vec2,
    v2: Vec2,
    v3: Vec2,
) {
    let mut invslope1 = GRID_SPACING * (v3.x - v1.x) / (v3.y - v1.y);
    let mut invslope2 = GRID_SPACING * (v3.x - v2.x) / (v3.y - v2.y);
    if invslope1 < invslope2 {
        std::mem::swap(&mut invslope1, &mut invslope2);
    }

    let min_x = (v1.x.min(v2.x).min(v3.x) * INV_GRID_SPACING) as i32;
    let max_x = (v1.x.max(v2.x).max(v3.x) * INV_GRID_SPACING) as i32 + 1;

    let mut curx1 = v3.x;
    let mut curx2 = v3.x;

    let y_start = (v3.y * INV_GRID_SPACING) as i32;
    let y_end = (v1.y * INV_GRID_SPACING) as i32 - 1;
    let mut y = y_start;
    while y >= y_end {
        curx1 -= invslope1;
        curx2 -= invslope2;
        let x_start = min_x.max((curx1 * INV_GRID_SPACING) as i32) - 1;
        let x_end = max_x.min((curx2 * INV_GRID_SPACING) as i32) + 1;
        for x in x_start..=x_end {
            let p = Vec2::new(x as f32 * GRID_SPACING, y as f32 * GRID_SPACING);
            if point_in_tri(p, v1, v2, v3) {
                emit(out, normal, normal_offset, u, v, p);
            }
        }
        y -= 1;
    }
}

/// Rasterize every accessible triangle on the sample grid in its own plane.
fn rasterize_samples(accessible: &Mesh, out: &mut DroneNavMesh) {
    for tri in accessible.indices.chunks_exact(3) {
        let a = accessible.vertices[tri[0] as usize];
        let b = accessible.vertices[tri[1] as usize];
        let c = accessible.vertices[tri[2] as usize];

        let mut normal = (b - a).cross(c - a);
        let normal_len = normal.length();
        if normal_len < 0.00001 {
            continue; // degenerate triangle
        }
        normal /= normal_len;

        // UV basis in the triangle's plane; canonical axes when the normal
        // is near vertical, otherwise u is forced into the +x/+z half-spaces
        // and v into +y
        let (u, v) = if normal.y > 0.9999999 || normal.y < -0.9999999 {
            (Vec3::X, Vec3::Z)
        } else {
            let mut u = normal.cross(Vec3::Y).normalize();
            if u.x < 0.0 {
                u = -u;
            }
            if u.z < 0.0 {
                u = -u;
            }
            let mut v = u.cross(normal);
            if v.y < 0.0 {
                v = -v;
            }
            (u, v)
        };

        let normal_offset = normal * normal.dot(a);

        // project into UV space and sort by v ascending
        let mut v1 = Vec2::new(u.dot(a), v.dot(a));
        let mut v2 = Vec2::new(u.dot(b), v.dot(b));
        let mut v3 = Vec2::new(u.dot(c), v.dot(c));

        if v1.y <= v2.y && v1.y <= v3.y {
            // already on the bottom
        } else if v2.y <= v3.y {
            std::mem::swap(&mut v1, &mut v2);
        } else {
            std::mem::swap(&mut v1, &mut v3);
        }
        if v2.y > v3.y {
            std::mem::swap(&mut v2, &mut v3);
        }

        if v1.y == v2.y {
            rasterize_bottom_flat(out, normal, normal_offset, u, v, v1, v2, v3);
        } else if v2.y == v3.y {
            rasterize_top_flat(out, normal, normal_offset, u, v, v1, v2, v3);
        } else {
            // split at the middle vertex
            let v4 = Vec2::new(
                v1.x + ((v2.y - v1.y) / (v3.y - v1.y)) * (v3.x - v1.x),
                v2.y,
            );
            rasterize_top_flat(out, normal, normal_offset, u, v, v1, v2, v4);
            rasterize_bottom_flat(out, normal, normal_offset, u, v, v2, v4, v3);
        }
    }
}

/// Cull samples where the drone's body would clip into nearby geometry.
fn clearance_filter(
    out: &mut DroneNavMesh,
    accessible: &ChunkedTris,
    inaccessible: &ChunkedTris,
) -> usize {
    let mut removed = 0;
    for chunk in &mut out.chunks {
        let mut index = 0;
        while index < chunk.vertices.len() {
            let surface = chunk.vertices[index];
            let normal = chunk.normals[index];
            let a = surface + normal * 0.01;
            let b = surface + normal * (DRONE_RADIUS + 0.02);
            if raycast_blocked(inaccessible, a, b) || raycast_blocked(accessible, a, b) {
                chunk.vertices.swap_remove(index);
                chunk.normals.swap_remove(index);
                removed += 1;
            } else {
                index += 1;
            }
        }
    }
    removed
}

/// Decide a crawl edge: same plane, coplanar, or around a corner.
fn crawl_check(
    vertex: Vec3,
    vertex_normal: Vec3,
    neighbor_vertex: Vec3,
    neighbor_normal: Vec3,
    accessible: &ChunkedTris,
    inaccessible: &ChunkedTris,
) -> bool {
    let to_neighbor = neighbor_vertex - vertex;
    let neighbor_dot = to_neighbor.dot(vertex_normal);

    if neighbor_dot > -0.07 {
        // in front of or coplanar with our surface: a straight hop
        return !(raycast_blocked(inaccessible, vertex, neighbor_vertex)
            || raycast_blocked(accessible, vertex, neighbor_vertex));
    }

    // behind our surface: going around a corner
    let normals_dot = neighbor_normal.dot(vertex_normal);
    if normals_dot < -0.495 {
        return false; // angle too sharp
    }

    // a line in the vertex plane pointing toward the neighbor plane, and how
    // far along it that plane sits
    let line_to_neighbor_plane = neighbor_normal + vertex_normal * -normals_dot;
    let line_length =
        to_neighbor.dot(neighbor_normal) / line_to_neighbor_plane.dot(neighbor_normal);

    // the intersection line of the two planes
    let intersection_origin = vertex + line_to_neighbor_plane * line_length;
    let intersection_dir = neighbor_normal.cross(vertex_normal);

    // closest point on the intersection line to the vertex->neighbor line:
    // solve the 2x2 system from requiring the residual to be orthogonal to
    // both direction vectors
    let a = intersection_dir.dot(intersection_dir);
    let b = -to_neighbor.dot(intersection_dir);
    let c = -b;
    let d = -to_neighbor.dot(to_neighbor);
    let inverse_determinant = 1.0 / (a * d - b * c);
    let a0 = inverse_determinant * d;
    let b0 = inverse_determinant * -b;
    let e = vertex.dot(intersection_dir) - intersection_origin.dot(intersection_dir);
    let f = vertex.dot(to_neighbor) - intersection_origin.dot(to_neighbor);
    let s = a0 * e + b0 * f;

    let intersection = intersection_origin + intersection_dir * s;

    // crawling toward the intersection must actually head for the neighbor
    if (intersection - vertex).dot(to_neighbor) < 0.0 {
        return false;
    }

    !(raycast_blocked(inaccessible, vertex, intersection)
        || raycast_blocked(accessible, vertex, intersection)
        || raycast_blocked(inaccessible, intersection, neighbor_vertex)
        || raycast_blocked(accessible, intersection, neighbor_vertex))
}

fn build_adjacency(
    out: &mut DroneNavMesh,
    accessible: &ChunkedTris,
    inaccessible: &ChunkedTris,
    stats: &mut BuildStats,
) {
    let mut rng = ChaCha20Rng::seed_from_u64(BUILD_SEED);

    for chunk in &mut out.chunks {
        chunk.adjacency = vec![Adjacency::default(); chunk.vertices.len()];
    }

    let chunk_radius = (DRONE_MAX_DISTANCE / CHUNK_SIZE).ceil() as i32;
    let chunk_count = out.chunks.len();

    for chunk_index in 0..chunk_count {
        for vertex_index in 0..out.chunks[chunk_index].vertices.len() {
            let vertex_surface = out.chunks[chunk_index].vertices[vertex_index];
            let vertex_normal = out.chunks[chunk_index].normals[vertex_index];
            let vertex = vertex_surface + vertex_normal * DRONE_RADIUS;

            let mut potential_shoot: Vec<GraphNode> = Vec::new();
            let mut potential_crawl: Vec<GraphNode> = Vec::new();

            let chunk_coord = out.coord_of(chunk_index);
            for x in (chunk_coord.x - chunk_radius + 1).max(0)
                ..(chunk_coord.x + chunk_radius).min(out.size.x)
            {
                for y in (chunk_coord.y - chunk_radius + 1).max(0)
                    ..(chunk_coord.y + chunk_radius).min(out.size.y)
                {
                    for z in (chunk_coord.z - chunk_radius + 1).max(0)
                        ..(chunk_coord.z + chunk_radius).min(out.size.z)
                    {
                        let neighbor_chunk_index = out.index(IVec3::new(x, y, z));
                        let neighbor_chunk = &out.chunks[neighbor_chunk_index];
                        for neighbor_index in 0..neighbor_chunk.vertices.len() {
                            if neighbor_chunk_index == chunk_index
                                && neighbor_index == vertex_index
                            {
                                continue; // no self edges
                            }
                            let node = GraphNode {
                                chunk: neighbor_chunk_index as u16,
                                vertex: neighbor_index as u16,
                            };
                            let neighbor = neighbor_chunk.vertices[neighbor_index];

                            let mut to_neighbor = neighbor - vertex;
                            if vertex_normal.dot(to_neighbor) > 0.07 {
                                // in front of our surface: maybe in line of fire
                                let distance_squared = to_neighbor.length_squared();
                                if distance_squared
                                    < (DRONE_MAX_DISTANCE - DRONE_RADIUS)
                                        * (DRONE_MAX_DISTANCE - DRONE_RADIUS)
                                    && distance_squared > (DRONE_RADIUS * 2.0) * (DRONE_RADIUS * 2.0)
                                {
                                    to_neighbor /= distance_squared.sqrt();
                                    // cannot shoot straight up or straight down
                                    if to_neighbor.y.abs() < DRONE_VERTICAL_DOT_LIMIT {
                                        let neighbor_normal =
                                            neighbor_chunk.normals[neighbor_index];
                                        if neighbor_normal.dot(to_neighbor) < 0.0 {
                                            potential_shoot.push(node);
                                        }
                                    }
                                }
                            } else {
                                // coplanar or behind: maybe crawlable
                                let distance_squared = to_neighbor.length_squared();
                                if distance_squared < (GRID_SPACING * 1.5) * (GRID_SPACING * 1.5) {
                                    potential_crawl.push(node);
                                }
                            }
                        }
                    }
                }
            }

            // crawl edges first; they are the drone's bread and butter
            for node in &potential_crawl {
                let neighbor_chunk = &out.chunks[node.chunk as usize];
                let neighbor_normal = neighbor_chunk.normals[node.vertex as usize];
                let neighbor_vertex = neighbor_chunk.vertices[node.vertex as usize]
                    + neighbor_normal * DRONE_RADIUS;

                if crawl_check(
                    vertex,
                    vertex_normal,
                    neighbor_vertex,
                    neighbor_normal,
                    accessible,
                    inaccessible,
                ) {
                    let adjacency = &mut out.chunks[chunk_index].adjacency[vertex_index];
                    adjacency.push(*node, true);
                    if adjacency.is_full() {
                        stats.adjacency_overflows += 1;
                        break;
                    }
                }
            }

            if !out.chunks[chunk_index].adjacency[vertex_index].is_full() {
                // shuffle so truncation does not bias shoot edges toward one
                // corner of the level
                for i in 0..potential_shoot.len().saturating_sub(1) {
                    let j = rng.gen_range(i..potential_shoot.len());
                    potential_shoot.swap(i, j);
                }

                for node in &potential_shoot {
                    let neighbor_chunk = &out.chunks[node.chunk as usize];
                    let neighbor_vertex = neighbor_chunk.vertices[node.vertex as usize];
                    if raycast_blocked(inaccessible, vertex, neighbor_vertex) {
                        continue;
                    }
                    let neighbor_normal = neighbor_chunk.normals[node.vertex as usize];
                    // the shot must land on the neighbor's surface, not some
                    // other face it escaped to
                    let Some(hit) = raycast(accessible, vertex, neighbor_vertex) else {
                        continue;
                    };
                    if neighbor_normal.dot(hit.normal) > 0.8
                        && (neighbor_vertex - hit.pos).length_squared() < DRONE_RADIUS * DRONE_RADIUS
                    {
                        let adjacency = &mut out.chunks[chunk_index].adjacency[vertex_index];
                        adjacency.push(*node, false);
                        if adjacency.is_full() {
                            stats.adjacency_overflows += 1;
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Count orphans; chunks that are nothing but orphans are emptied outright
/// and every incoming reference to them dropped.
fn orphan_pass(out: &mut DroneNavMesh, stats: &mut BuildStats) {
    let chunk_count = out.chunks.len();
    for chunk_index in 0..chunk_count {
        let chunk = &out.chunks[chunk_index];
        let chunk_orphans = chunk
            .adjacency
            .iter()
            .filter(|a| a.neighbors.is_empty())
            .count();
        stats.orphans += chunk_orphans;

        if chunk_orphans > 0 && chunk_orphans == chunk.vertices.len() {
            let chunk = &mut out.chunks[chunk_index];
            chunk.vertices.clear();
            chunk.normals.clear();
            chunk.adjacency.clear();

            for other in &mut out.chunks {
                for adjacency in &mut other.adjacency {
                    let mut i = 0;
                    while i < adjacency.neighbors.len() {
                        if adjacency.neighbors[i].chunk as usize == chunk_index {
                            adjacency.remove(i);
                        } else {
                            i += 1;
                        }
                    }
                }
            }
        }
    }
}

/// Build the full drone graph from the consolidated accessible geometry and
/// the pre-chunked raycast meshes.
pub fn build(
    accessible: &Mesh,
    accessible_chunked: &ChunkedTris,
    inaccessible_chunked: &ChunkedTris,
) -> (DroneNavMesh, BuildStats) {
    let mut out = DroneNavMesh::default();
    out.resize(accessible.bounds_min, accessible.bounds_max, CHUNK_SIZE);

    let mut stats = BuildStats::default();

    rasterize_samples(accessible, &mut out);
    log::info!(
        "rasterized {} drone samples",
        out.chunks.iter().map(|c| c.vertices.len()).sum::<usize>()
    );

    stats.removed_vertices = clearance_filter(&mut out, accessible_chunked, inaccessible_chunked);
    log::info!("removed {} obstructed samples", stats.removed_vertices);

    build_adjacency(&mut out, accessible_chunked, inaccessible_chunked, &mut stats);
    orphan_pass(&mut out, &mut stats);
    log::info!(
        "drone graph: {} overflows, {} orphans",
        stats.adjacency_overflows,
        stats.orphans
    );

    (out, stats)
}

/// Chunk a consolidated mesh for the raycast passes.
pub fn chunk_for_raycast(mesh: &Mesh) -> ChunkedTris {
    let mut chunked = ChunkedTris::default();
    chunk_mesh_tris(mesh, &mut chunked, CHUNK_SIZE, DRONE_RADIUS);
    chunked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(extent: f32, y: f32) -> Mesh {
        let mut mesh = Mesh::new();
        mesh.color = [0.5, 0.5, 0.5, 1.0];
        mesh.vertices = vec![
            Vec3::new(0.0, y, 0.0),
            Vec3::new(extent, y, 0.0),
            Vec3::new(extent, y, extent),
            Vec3::new(0.0, y, extent),
        ];
        mesh.indices = vec![0, 2, 1, 0, 3, 2];
        for v in &mesh.vertices {
            mesh.bounds_min = mesh.bounds_min.min(*v);
            mesh.bounds_max = mesh.bounds_max.max(*v);
        }
        mesh
    }

    fn build_flat(extent: f32) -> (DroneNavMesh, BuildStats) {
        let accessible = square(extent, 0.0);
        let acc_chunked = chunk_for_raycast(&accessible);
        let mut inacc_chunked = ChunkedTris::default();
        inacc_chunked.resize(Vec3::ZERO, Vec3::ONE, CHUNK_SIZE);
        build(&accessible, &acc_chunked, &inacc_chunked)
    }

    #[test]
    fn test_flat_square_sample_count() {
        let (graph, _stats) = build_flat(10.0);
        let total: usize = graph.chunks.iter().map(|c| c.vertices.len()).sum();
        // ceil(10 / 1.25)^2 = 64 samples over the extent; triangle-edge
        // points (including the split diagonal) are excluded by the strict
        // inside test
        assert!(
            (40..=81).contains(&total),
            "expected roughly 64 samples, got {total}"
        );
    }

    #[test]
    fn test_flat_crawl_edges_match_proximity() {
        // on an unobstructed plane, every pair of samples within crawl range
        // must be connected, and only by crawl edges
        let (graph, _stats) = build_flat(10.0);
        let samples: Vec<Vec3> = graph
            .chunks
            .iter()
            .flat_map(|c| c.vertices.iter().copied())
            .collect();

        for chunk in &graph.chunks {
            for (i, vertex) in chunk.vertices.iter().enumerate() {
                let offset = *vertex + chunk.normals[i] * DRONE_RADIUS;
                let expected = samples
                    .iter()
                    .filter(|q| {
                        **q != *vertex
                            && (**q - offset).length_squared()
                                < (GRID_SPACING * 1.5) * (GRID_SPACING * 1.5)
                    })
                    .count();
                let adjacency = &chunk.adjacency[i];
                assert_eq!(
                    adjacency.neighbors.len(),
                    expected,
                    "sample at {vertex:?}"
                );
                for n in 0..adjacency.neighbors.len() {
                    assert!(adjacency.is_crawl(n));
                }
            }
        }
    }

    #[test]
    fn test_determinism_same_input_same_output() {
        let (a, _) = build_flat(10.0);
        let (b, _) = build_flat(10.0);
        assert_eq!(a.chunks.len(), b.chunks.len());
        for (ca, cb) in a.chunks.iter().zip(&b.chunks) {
            assert_eq!(ca.vertices, cb.vertices);
            assert_eq!(ca.normals, cb.normals);
            for (aa, ab) in ca.adjacency.iter().zip(&cb.adjacency) {
                assert_eq!(aa.neighbors, ab.neighbors);
                for i in 0..aa.neighbors.len() {
                    assert_eq!(aa.is_crawl(i), ab.is_crawl(i));
                }
            }
        }
    }

    #[test]
    fn test_shoot_edges_between_facing_floors() {
        // two parallel floors facing each other 8 m apart
        let floor = square(10.0, 0.0);
        let mut ceiling = square(10.0, 8.0);
        // flip winding so the ceiling faces down
        for tri in ceiling.indices.chunks_exact_mut(3) {
            tri.swap(1, 2);
        }
        let mut accessible = Mesh::new();
        accessible.color = [0.5, 0.5, 0.5, 1.0];
        accessible.append_transformed(&floor, &glam::Mat4::IDENTITY);
        accessible.append_transformed(&ceiling, &glam::Mat4::IDENTITY);

        let acc_chunked = chunk_for_raycast(&accessible);
        let mut inacc_chunked = ChunkedTris::default();
        inacc_chunked.resize(Vec3::ZERO, Vec3::ONE, CHUNK_SIZE);

        let (graph, _stats) = build(&accessible, &acc_chunked, &inacc_chunked);

        let mut shoot_edges = 0;
        for chunk in &graph.chunks {
            for adjacency in &chunk.adjacency {
                for i in 0..adjacency.neighbors.len() {
                    if !adjacency.is_crawl(i) {
                        shoot_edges += 1;
                    }
                }
            }
        }
        assert!(shoot_edges > 0, "no shoot edges between facing surfaces");
    }

    #[test]
    fn test_corner_crawl_edges_are_unobstructed() {
        // a box on a floor: top and side faces meet at a convex corner
        let box_mesh = Mesh::cube(Vec3::new(2.0, 2.0, 2.0), [0.5, 0.5, 0.5, 1.0]);
        let mut accessible = Mesh::new();
        accessible.color = [0.5, 0.5, 0.5, 1.0];
        accessible
            .append_transformed(&box_mesh, &glam::Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)));

        let acc_chunked = chunk_for_raycast(&accessible);
        let mut inacc_chunked = ChunkedTris::default();
        inacc_chunked.resize(Vec3::ZERO, Vec3::ONE, CHUNK_SIZE);

        let (graph, _stats) = build(&accessible, &acc_chunked, &inacc_chunked);

        // find corner crawl edges: endpoints on faces with different normals
        let mut corner_edges = 0;
        for chunk in &graph.chunks {
            for (i, adjacency) in chunk.adjacency.iter().enumerate() {
                let from_normal = chunk.normals[i];
                let from = chunk.vertices[i] + from_normal * DRONE_RADIUS;
                for n in 0..adjacency.neighbors.len() {
                    if !adjacency.is_crawl(n) {
                        continue;
                    }
                    let node = adjacency.neighbors[n];
                    let other = &graph.chunks[node.chunk as usize];
                    let to_normal = other.normals[node.vertex as usize];
                    if from_normal.dot(to_normal) > 0.9 {
                        continue; // same plane, not a corner
                    }
                    corner_edges += 1;
                    let to = other.vertices[node.vertex as usize] + to_normal * DRONE_RADIUS;
                    // both legs around the corner must be clear of the mesh
                    assert!(crawl_check(
                        from,
                        from_normal,
                        to,
                        to_normal,
                        &acc_chunked,
                        &inacc_chunked,
                    ));
                }
            }
        }
        assert!(corner_edges > 0, "no corner crawl edges on a box");
    }

    #[test]
    fn test_no_edges_into_emptied_chunks() {
        let (graph, _stats) = build_flat(10.0);
        for chunk in &graph.chunks {
            for adjacency in &chunk.adjacency {
                for node in &adjacency.neighbors {
                    assert!(
                        !graph.chunks[node.chunk as usize].vertices.is_empty(),
                        "edge points into an emptied chunk"
                    );
                }
            }
        }
    }
}
