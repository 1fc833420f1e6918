//! Tiled walker navmesh: heightfield rasterization, span filtering, erosion,
//! regions, and a layered tile cache with deflate-compressed payloads.
//!
//! Tiles are built independently with a border apron so erosion and ledge
//! filtering see the geometry that continues into neighboring tiles; only the
//! core grid is emitted.

use std::io::Read;

use flate2::read::DeflateEncoder;
use flate2::Compression;
use glam::Vec3;

use crate::geometry::Mesh;

#[derive(Debug, Clone, Copy)]
pub struct WalkerConfig {
    pub cell_size: f32,
    pub cell_height: f32,
    pub walkable_slope_deg: f32,
    pub agent_height: f32,
    pub agent_climb: f32,
    pub agent_radius: f32,
    /// Tile edge length in cells.
    pub tile_size: usize,
    pub max_layers: usize,
    /// Regions smaller than this many cells are culled.
    pub min_region_area: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            cell_size: 0.2,
            cell_height: 0.2,
            walkable_slope_deg: 45.0,
            agent_height: 2.0,
            agent_climb: 0.5,
            agent_radius: 0.45,
            tile_size: 32,
            max_layers: 32,
            min_region_area: 8,
        }
    }
}

impl WalkerConfig {
    fn climb_cells(&self) -> i32 {
        (self.agent_climb / self.cell_height).floor() as i32
    }

    fn height_cells(&self) -> i32 {
        (self.agent_height / self.cell_height).ceil() as i32
    }

    fn radius_cells(&self) -> i32 {
        (self.agent_radius / self.cell_size).ceil() as i32
    }

    fn border_cells(&self) -> i32 {
        self.radius_cells() + 3
    }
}

pub const WALKER_EMPTY: u16 = u16::MAX;

#[derive(Debug, Clone, Copy)]
struct Span {
    smin: u16,
    smax: u16,
    walkable: bool,
}

/// One heightfield column: spans sorted by height, merged on insert.
#[derive(Debug, Clone, Default)]
struct Column {
    spans: Vec<Span>,
}

impl Column {
    fn insert(&mut self, mut span: Span) {
        let mut i = 0;
        while i < self.spans.len() {
            let other = self.spans[i];
            if other.smin > span.smax {
                break;
            }
            if other.smax < span.smin {
                i += 1;
                continue;
            }
            // overlap: merge, the higher top's walkability wins
            span.smin = span.smin.min(other.smin);
            if other.smax > span.smax {
                span.smax = other.smax;
                span.walkable = other.walkable;
            } else if other.smax == span.smax {
                span.walkable = span.walkable || other.walkable;
            }
            self.spans.remove(i);
        }
        self.spans.insert(i, span);
    }
}

#[derive(Debug, Clone)]
pub struct LayerHeader {
    pub tx: i32,
    pub ty: i32,
    pub layer: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub width: u8,
    pub height: u8,
    pub hmin: u16,
    pub hmax: u16,
}

/// One compressed heightfield layer: a grid of floor heights and region
/// areas, deflated.
#[derive(Debug, Clone)]
pub struct TileCacheLayer {
    pub header: LayerHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct TileCacheCell {
    pub layers: Vec<TileCacheLayer>,
}

/// The walker navmesh: a tile grid keyed `(tx, ty, layer)`.
#[derive(Debug, Clone, Default)]
pub struct TileCache {
    pub min: Vec3,
    pub width: i32,
    pub height: i32,
    pub cells: Vec<TileCacheCell>,
}

struct OpenCell {
    x: i32,
    z: i32,
    floor: u16,
    distance: u16,
    region: u16,
}

fn point_in_tri_2d(px: f32, pz: f32, a: Vec3, b: Vec3, c: Vec3) -> bool {
    let sign = |ax: f32, az: f32, bx: f32, bz: f32| (px - bx) * (az - bz) - (ax - bx) * (pz - bz);
    let d1 = sign(a.x, a.z, b.x, b.z);
    let d2 = sign(b.x, b.z, c.x, c.z);
    let d3 = sign(c.x, c.z, a.x, a.z);
    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_neg && has_pos)
}

fn plane_height(px: f32, pz: f32, a: Vec3, normal: Vec3) -> f32 {
    if normal.y.abs() < 1e-6 {
        a.y
    } else {
        a.y - ((px - a.x) * normal.x + (pz - a.z) * normal.z) / normal.y
    }
}

/// Rasterize triangles into column spans; walkability comes from the slope.
#[allow(clippy::too_many_arguments)]
fn rasterize(
    mesh: &Mesh,
    config: &WalkerConfig,
    columns: &mut [Column],
    grid_w: i32,
    grid_h: i32,
    origin_x: f32,
    origin_z: f32,
    y_min: f32,
) {
    let walkable_cos = config.walkable_slope_deg.to_radians().cos();
    let inv_cs = 1.0 / config.cell_size;
    let inv_ch = 1.0 / config.cell_height;

    for tri in mesh.indices.chunks_exact(3) {
        let a = mesh.vertices[tri[0] as usize];
        let b = mesh.vertices[tri[1] as usize];
        let c = mesh.vertices[tri[2] as usize];

        let mut normal = (b - a).cross(c - a);
        let len = normal.length();
        if len < 1e-6 {
            continue;
        }
        normal /= len;
        let walkable = normal.y > walkable_cos;

        let min_x = (((a.x.min(b.x).min(c.x)) - origin_x) * inv_cs).floor() as i32;
        let max_x = (((a.x.max(b.x).max(c.x)) - origin_x) * inv_cs).floor() as i32;
        let min_z = (((a.z.min(b.z).min(c.z)) - origin_z) * inv_cs).floor() as i32;
        let max_z = (((a.z.max(b.z).max(c.z)) - origin_z) * inv_cs).floor() as i32;

        if max_x < 0 || min_x >= grid_w || max_z < 0 || min_z >= grid_h {
            continue;
        }

        for z in min_z.max(0)..=max_z.min(grid_h - 1) {
            for x in min_x.max(0)..=max_x.min(grid_w - 1) {
                let x0 = origin_x + x as f32 * config.cell_size;
                let z0 = origin_z + z as f32 * config.cell_size;
                // sample the cell center and corners against the triangle
                let samples = [
                    (x0 + config.cell_size * 0.5, z0 + config.cell_size * 0.5),
                    (x0, z0),
                    (x0 + config.cell_size, z0),
                    (x0, z0 + config.cell_size),
                    (x0 + config.cell_size, z0 + config.cell_size),
                ];
                let mut h_min = f32::MAX;
                let mut h_max = f32::MIN;
                for (px, pz) in samples {
                    if point_in_tri_2d(px, pz, a, b, c) {
                        let h = plane_height(px, pz, a, normal)
                            .clamp(a.y.min(b.y).min(c.y), a.y.max(b.y).max(c.y));
                        h_min = h_min.min(h);
                        h_max = h_max.max(h);
                    }
                }
                if h_min > h_max {
                    continue;
                }

                let smin = (((h_min - y_min) * inv_ch).floor().max(0.0)) as u16;
                let smax = (((h_max - y_min) * inv_ch).floor().max(0.0)) as u16 + 1;
                columns[(x + z * grid_w) as usize].insert(Span {
                    smin,
                    smax,
                    walkable,
                });
            }
        }
    }
}

/// The three span filters: reclaim low-hanging obstacles, knock out ledges,
/// knock out spans without standing room.
fn filter_spans(columns: &mut [Column], config: &WalkerConfig, grid_w: i32, grid_h: i32) {
    let climb = config.climb_cells();
    let height = config.height_cells();

    // low-hanging obstacles become walkable
    for column in columns.iter_mut() {
        for i in 1..column.spans.len() {
            let below = column.spans[i - 1];
            let span = &mut column.spans[i];
            if !span.walkable
                && below.walkable
                && (span.smax as i32 - below.smax as i32) <= climb
            {
                span.walkable = true;
            }
        }
    }

    // ledges: a walkable span whose best neighbor floor drops further than
    // the climb height is not safe to stand on
    let tops: Vec<Vec<u16>> = columns
        .iter()
        .map(|c| c.spans.iter().filter(|s| s.walkable).map(|s| s.smax).collect())
        .collect();
    for z in 0..grid_h {
        for x in 0..grid_w {
            let index = (x + z * grid_w) as usize;
            for span in &mut columns[index].spans {
                if !span.walkable {
                    continue;
                }
                let top = span.smax as i32;
                let mut worst = i32::MAX;
                for (dx, dz) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                    let nx = x + dx;
                    let nz = z + dz;
                    if nx < 0 || nx >= grid_w || nz < 0 || nz >= grid_h {
                        worst = worst.min(-climb - 1);
                        continue;
                    }
                    let neighbor = &tops[(nx + nz * grid_w) as usize];
                    let best = neighbor
                        .iter()
                        .map(|t| *t as i32 - top)
                        .min_by_key(|d| d.abs());
                    match best {
                        Some(d) => worst = worst.min(d),
                        None => worst = worst.min(-climb - 1),
                    }
                }
                if worst < -climb {
                    span.walkable = false;
                }
            }
        }
    }

    // standing room
    for column in columns.iter_mut() {
        for i in 0..column.spans.len() {
            if !column.spans[i].walkable {
                continue;
            }
            let ceiling = column
                .spans
                .get(i + 1)
                .map_or(i32::MAX, |s| s.smin as i32);
            if ceiling - column.spans[i].smax as i32 < height {
                column.spans[i].walkable = false;
            }
        }
    }
}

/// Collect walkable floors, erode by the agent radius, build the distance
/// field, and partition into regions.
fn build_open_cells(
    columns: &[Column],
    config: &WalkerConfig,
    grid_w: i32,
    grid_h: i32,
) -> Vec<OpenCell> {
    let climb = config.climb_cells();

    let mut cells: Vec<OpenCell> = Vec::new();
    for z in 0..grid_h {
        for x in 0..grid_w {
            for span in &columns[(x + z * grid_w) as usize].spans {
                if span.walkable {
                    cells.push(OpenCell {
                        x,
                        z,
                        floor: span.smax,
                        distance: u16::MAX,
                        region: 0,
                    });
                }
            }
        }
    }

    let find = |cells: &[OpenCell], x: i32, z: i32, floor: u16| -> Option<usize> {
        cells.iter().position(|c| {
            c.x == x && c.z == z && (c.floor as i32 - floor as i32).abs() <= climb
        })
    };

    // distance to the nearest boundary, by BFS over connected cells
    let mut queue: Vec<usize> = Vec::new();
    for i in 0..cells.len() {
        let mut connected = 0;
        for (dx, dz) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
            if find(&cells, cells[i].x + dx, cells[i].z + dz, cells[i].floor).is_some() {
                connected += 1;
            }
        }
        if connected < 4 {
            cells[i].distance = 0;
            queue.push(i);
        }
    }
    let mut head = 0;
    while head < queue.len() {
        let current = queue[head];
        head += 1;
        let (cx, cz, cf, cd) = {
            let c = &cells[current];
            (c.x, c.z, c.floor, c.distance)
        };
        for (dx, dz) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
            if let Some(n) = find(&cells, cx + dx, cz + dz, cf) {
                if cells[n].distance > cd + 1 {
                    cells[n].distance = cd + 1;
                    queue.push(n);
                }
            }
        }
    }

    // erode: anything closer to a boundary than the agent radius goes
    let radius = config.radius_cells() as u16;
    cells.retain(|c| c.distance >= radius);

    // regions: grow outward from the most interior cells so each basin of
    // the distance field gets one region
    let mut order: Vec<usize> = (0..cells.len()).collect();
    order.sort_by(|a, b| {
        cells[*b]
            .distance
            .cmp(&cells[*a].distance)
            .then(cells[*a].x.cmp(&cells[*b].x))
            .then(cells[*a].z.cmp(&cells[*b].z))
    });
    let mut next_region: u16 = 1;
    for &i in &order {
        let (cx, cz, cf) = (cells[i].x, cells[i].z, cells[i].floor);
        let mut adopted = 0u16;
        for (dx, dz) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
            if let Some(n) = find(&cells, cx + dx, cz + dz, cf) {
                if cells[n].region != 0 && (adopted == 0 || cells[n].region < adopted) {
                    adopted = cells[n].region;
                }
            }
        }
        cells[i].region = if adopted != 0 {
            adopted
        } else {
            let region = next_region;
            next_region += 1;
            region
        };
    }

    // cull regions under the minimum area
    let mut areas = vec![0usize; next_region as usize];
    for c in &cells {
        areas[c.region as usize] += 1;
    }
    cells.retain(|c| areas[c.region as usize] >= config.min_region_area);

    cells
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(bytes, Compression::default());
    let mut out = Vec::with_capacity(bytes.len() / 2);
    encoder
        .read_to_end(&mut out)
        .expect("deflate of an in-memory buffer cannot fail");
    out
}

/// Serialize one layer grid: heights then regions, row-major, deflated.
pub fn encode_layer_grid(heights: &[u16], regions: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(heights.len() * 3);
    for h in heights {
        bytes.extend_from_slice(&h.to_ne_bytes());
    }
    bytes.extend_from_slice(regions);
    deflate(bytes.as_slice())
}

fn build_tile(
    mesh: &Mesh,
    config: &WalkerConfig,
    tx: i32,
    ty: i32,
    tile_origin: Vec3,
) -> TileCacheCell {
    let border = config.border_cells();
    let grid_w = config.tile_size as i32 + border * 2;
    let grid_h = config.tile_size as i32 + border * 2;
    let origin_x = tile_origin.x - border as f32 * config.cell_size;
    let origin_z = tile_origin.z - border as f32 * config.cell_size;
    let y_min = mesh.bounds_min.y;

    let mut columns = vec![Column::default(); (grid_w * grid_h) as usize];
    rasterize(
        mesh, config, &mut columns, grid_w, grid_h, origin_x, origin_z, y_min,
    );
    filter_spans(&mut columns, config, grid_w, grid_h);
    let cells = build_open_cells(&columns, config, grid_w, grid_h);

    // partition each core column's floors into layers by height ordinal
    let core = config.tile_size as i32;
    let mut cell = TileCacheCell::default();
    for layer_index in 0..config.max_layers as i32 {
        let mut heights = vec![WALKER_EMPTY; (core * core) as usize];
        let mut regions = vec![0u8; (core * core) as usize];
        let mut hmin = u16::MAX;
        let mut hmax = 0u16;
        let mut occupied = false;

        for z in 0..core {
            for x in 0..core {
                let gx = x + border;
                let gz = z + border;
                let mut floors: Vec<&OpenCell> = cells
                    .iter()
                    .filter(|c| c.x == gx && c.z == gz)
                    .collect();
                floors.sort_by_key(|c| c.floor);
                if let Some(c) = floors.get(layer_index as usize) {
                    heights[(x + z * core) as usize] = c.floor;
                    regions[(x + z * core) as usize] = (c.region & 0xff) as u8;
                    hmin = hmin.min(c.floor);
                    hmax = hmax.max(c.floor);
                    occupied = true;
                }
            }
        }

        if !occupied {
            break;
        }

        let header = LayerHeader {
            tx,
            ty,
            layer: layer_index,
            bmin: Vec3::new(
                tile_origin.x,
                y_min + hmin as f32 * config.cell_height,
                tile_origin.z,
            ),
            bmax: Vec3::new(
                tile_origin.x + core as f32 * config.cell_size,
                y_min + (hmax as f32 + 1.0) * config.cell_height,
                tile_origin.z + core as f32 * config.cell_size,
            ),
            width: core as u8,
            height: core as u8,
            hmin,
            hmax,
        };
        cell.layers.push(TileCacheLayer {
            header,
            data: encode_layer_grid(&heights, &regions),
        });
    }

    cell
}

/// Build the full tile cache from consolidated level geometry.
pub fn build(mesh: &Mesh, config: &WalkerConfig) -> TileCache {
    let mut cache = TileCache {
        min: mesh.bounds_min,
        ..TileCache::default()
    };
    if mesh.is_empty() {
        return cache;
    }

    let tile_world = config.tile_size as f32 * config.cell_size;
    let extent = mesh.bounds_max - mesh.bounds_min;
    cache.width = (extent.x / tile_world).floor() as i32 + 1;
    cache.height = (extent.z / tile_world).floor() as i32 + 1;

    for ty in 0..cache.height {
        for tx in 0..cache.width {
            let origin = Vec3::new(
                mesh.bounds_min.x + tx as f32 * tile_world,
                mesh.bounds_min.y,
                mesh.bounds_min.z + ty as f32 * tile_world,
            );
            cache.cells.push(build_tile(mesh, config, tx, ty, origin));
        }
    }

    log::info!(
        "walker navmesh: {}x{} tiles, {} layers",
        cache.width,
        cache.height,
        cache.cells.iter().map(|c| c.layers.len()).sum::<usize>()
    );
    cache
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;

    fn flat_floor(extent: f32, y: f32) -> Mesh {
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

    fn decode(layer: &TileCacheLayer, core: usize) -> (Vec<u16>, Vec<u8>) {
        let mut decoder = DeflateDecoder::new(layer.data.as_slice());
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len(), core * core * 3);
        let heights: Vec<u16> = bytes[..core * core * 2]
            .chunks_exact(2)
            .map(|b| u16::from_ne_bytes([b[0], b[1]]))
            .collect();
        let regions = bytes[core * core * 2..].to_vec();
        (heights, regions)
    }

    #[test]
    fn test_flat_floor_walkable_interior() {
        let mesh = flat_floor(12.8, 0.0);
        let config = WalkerConfig::default();
        let cache = build(&mesh, &config);
        assert_eq!(cache.width, 3);
        assert_eq!(cache.height, 3);

        // the first tile covers [0, 6.4); its interior must be walkable
        let tile = &cache.cells[0];
        assert_eq!(tile.layers.len(), 1);
        let (heights, regions) = decode(&tile.layers[0], config.tile_size);

        let core = config.tile_size;
        let center = core / 2 + (core / 2) * core;
        assert_ne!(heights[center], WALKER_EMPTY);
        assert_ne!(regions[center], 0);
        // the floor sits at the bottom of the heightfield
        assert!(heights[center] <= 2);
    }

    #[test]
    fn test_floor_edges_eroded() {
        let mesh = flat_floor(6.0, 0.0);
        let config = WalkerConfig::default();
        let cache = build(&mesh, &config);

        let tile = &cache.cells[0];
        assert!(!tile.layers.is_empty());
        let (heights, _) = decode(&tile.layers[0], config.tile_size);
        // the cell hugging the level edge is inside the agent radius of the
        // drop and must be gone
        assert_eq!(heights[0], WALKER_EMPTY);
    }

    #[test]
    fn test_steep_wall_not_walkable() {
        let mut mesh = Mesh::new();
        mesh.color = [0.5, 0.5, 0.5, 1.0];
        // vertical wall along x
        mesh.vertices = vec![
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(6.0, 0.0, 1.0),
            Vec3::new(6.0, 6.0, 1.0),
            Vec3::new(0.0, 6.0, 1.0),
        ];
        mesh.indices = vec![0, 1, 2, 0, 2, 3];
        for v in &mesh.vertices {
            mesh.bounds_min = mesh.bounds_min.min(*v);
            mesh.bounds_max = mesh.bounds_max.max(*v);
        }

        let cache = build(&mesh, &WalkerConfig::default());
        let layers: usize = cache.cells.iter().map(|c| c.layers.len()).sum();
        assert_eq!(layers, 0);
    }

    #[test]
    fn test_stacked_floors_make_two_layers() {
        let mut mesh = flat_floor(6.0, 0.0);
        let upper = flat_floor(6.0, 3.0);
        mesh.append_transformed(&upper, &glam::Mat4::IDENTITY);

        let config = WalkerConfig::default();
        let cache = build(&mesh, &config);
        let tile = &cache.cells[0];
        assert_eq!(tile.layers.len(), 2);

        let (lower_heights, _) = decode(&tile.layers[0], config.tile_size);
        let (upper_heights, _) = decode(&tile.layers[1], config.tile_size);
        let core = config.tile_size;
        let center = core / 2 + (core / 2) * core;
        assert!(lower_heights[center] < upper_heights[center]);
    }

    #[test]
    fn test_layer_headers_keyed_by_tile() {
        let mesh = flat_floor(12.8, 0.0);
        let config = WalkerConfig::default();
        let cache = build(&mesh, &config);
        for ty in 0..cache.height {
            for tx in 0..cache.width {
                let cell = &cache.cells[(tx + ty * cache.width) as usize];
                for (i, layer) in cell.layers.iter().enumerate() {
                    assert_eq!(layer.header.tx, tx);
                    assert_eq!(layer.header.ty, ty);
                    assert_eq!(layer.header.layer, i as i32);
                }
            }
        }
    }
}
