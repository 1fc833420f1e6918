//! The `.nav` file: walker tile cache, drone graph, reverb voxel, in that
//! order, native endianness.

use std::io::{self, Write};
use std::path::Path;

use glam::Vec3;

use crate::drone::DroneNavMesh;
use crate::reverb::{ReverbVoxel, REVERB_BANDS};
use crate::walker::TileCache;

fn write_i32(out: &mut impl Write, v: i32) -> io::Result<()> {
    out.write_all(&v.to_ne_bytes())
}

fn write_f32(out: &mut impl Write, v: f32) -> io::Result<()> {
    out.write_all(&v.to_ne_bytes())
}

fn write_vec3(out: &mut impl Write, v: Vec3) -> io::Result<()> {
    write_f32(out, v.x)?;
    write_f32(out, v.y)?;
    write_f32(out, v.z)
}

fn write_walker(out: &mut impl Write, cache: &TileCache) -> io::Result<()> {
    write_vec3(out, cache.min)?;
    write_i32(out, cache.width)?;
    write_i32(out, cache.height)?;
    for cell in &cache.cells {
        write_i32(out, cell.layers.len() as i32)?;
        for layer in &cell.layers {
            // header followed by the compressed grid, as one sized blob
            let mut blob = Vec::with_capacity(48 + layer.data.len());
            blob.extend_from_slice(&layer.header.tx.to_ne_bytes());
            blob.extend_from_slice(&layer.header.ty.to_ne_bytes());
            blob.extend_from_slice(&layer.header.layer.to_ne_bytes());
            for v in [layer.header.bmin, layer.header.bmax] {
                blob.extend_from_slice(&v.x.to_ne_bytes());
                blob.extend_from_slice(&v.y.to_ne_bytes());
                blob.extend_from_slice(&v.z.to_ne_bytes());
            }
            blob.push(layer.header.width);
            blob.push(layer.header.height);
            blob.extend_from_slice(&layer.header.hmin.to_ne_bytes());
            blob.extend_from_slice(&layer.header.hmax.to_ne_bytes());
            blob.extend_from_slice(&layer.data);

            write_i32(out, blob.len() as i32)?;
            out.write_all(&blob)?;
        }
    }
    Ok(())
}

fn write_drone(out: &mut impl Write, graph: &DroneNavMesh) -> io::Result<()> {
    write_f32(out, graph.chunk_size)?;
    write_vec3(out, graph.vmin)?;
    write_i32(out, graph.size.x)?;
    write_i32(out, graph.size.y)?;
    write_i32(out, graph.size.z)?;
    for chunk in &graph.chunks {
        write_i32(out, chunk.vertices.len() as i32)?;
        for v in &chunk.vertices {
            write_vec3(out, *v)?;
        }
        for n in &chunk.normals {
            write_vec3(out, *n)?;
        }
        for adjacency in &chunk.adjacency {
            write_i32(out, adjacency.neighbors.len() as i32)?;
            let mut crawl_bits = 0u64;
            for i in 0..adjacency.neighbors.len() {
                if adjacency.is_crawl(i) {
                    crawl_bits |= 1 << i;
                }
            }
            out.write_all(&crawl_bits.to_ne_bytes())?;
            for node in &adjacency.neighbors {
                out.write_all(&node.chunk.to_ne_bytes())?;
                out.write_all(&node.vertex.to_ne_bytes())?;
            }
        }
    }
    Ok(())
}

fn write_reverb(out: &mut impl Write, voxel: &ReverbVoxel) -> io::Result<()> {
    write_f32(out, voxel.chunk_size)?;
    write_vec3(out, voxel.vmin)?;
    write_i32(out, voxel.size.x)?;
    write_i32(out, voxel.size.y)?;
    write_i32(out, voxel.size.z)?;
    for cell in &voxel.chunks {
        for band in 0..REVERB_BANDS {
            write_f32(out, cell.bands[band])?;
        }
        write_f32(out, cell.outdoor)?;
    }
    Ok(())
}

pub fn write_nav_file(
    path: &Path,
    walker: &TileCache,
    drone: &DroneNavMesh,
    reverb: &ReverbVoxel,
) -> io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut out = io::BufWriter::new(file);
    write_walker(&mut out, walker)?;
    write_drone(&mut out, drone)?;
    write_reverb(&mut out, reverb)?;
    out.flush()
}
