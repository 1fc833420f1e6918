//! Asset importer. Invoked with no arguments; looks at the working
//! directory. A `mod/` folder means mod mode (levels only); otherwise a full
//! build walks every asset class. A `.manifest` file carries the
//! incremental-build cache between runs.

mod drone;
mod geometry;
mod manifest;
mod output;
mod reverb;
mod scene;
mod walker;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};

use manifest::{cached_mtime, file_mtime, AssetRecord, Manifest};
use scene::{consolidate_nav_geometry, is_accessible, is_inaccessible, LevelScene};

const MANIFEST_PATH: &str = ".manifest";
const MOD_FOLDER: &str = "mod";
const ASSET_IN_FOLDER: &str = "assets";
const ASSET_OUT_FOLDER: &str = "build";

const LEVEL_EXTENSION: &str = "json";
const NAV_EXTENSION: &str = "nav";
const LEVEL_OUT_EXTENSION: &str = "lvl";

struct ImporterState {
    cached: Manifest,
    manifest: Manifest,
    rebuild: bool,
    error: bool,
}

fn asset_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn import_level(state: &mut ImporterState, in_path: &Path, out_folder: &Path) {
    let name = asset_name(in_path);
    let out_lvl = out_folder.join(format!("{name}.{LEVEL_OUT_EXTENSION}"));
    let out_nav = out_folder.join(format!("{name}.{NAV_EXTENSION}"));

    let mtime = file_mtime(in_path);
    let rebuild = state.rebuild
        || mtime > cached_mtime(&state.cached.levels, &name)
        || mtime > cached_mtime(&state.cached.nav_meshes, &name);

    state.manifest.levels.insert(
        name.clone(),
        AssetRecord {
            out_path: out_lvl.to_string_lossy().into_owned(),
            mtime,
        },
    );
    state.manifest.nav_meshes.insert(
        name.clone(),
        AssetRecord {
            out_path: out_nav.to_string_lossy().into_owned(),
            mtime,
        },
    );

    if !rebuild {
        return;
    }
    log::info!("building level {name}");

    if let Err(err) = build_level(in_path, &out_lvl, &out_nav) {
        log::error!("level {name} failed: {err:#}");
        state.error = true;
    }
}

fn build_level(in_path: &Path, out_lvl: &Path, out_nav: &Path) -> Result<()> {
    let scene = LevelScene::load(in_path)?;

    if let Some(parent) = out_lvl.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(in_path, out_lvl)
        .with_context(|| format!("failed to write {}", out_lvl.display()))?;

    // walker navmesh from everything; drone graph splits by accessibility
    let walker_cache = if scene.nonav {
        walker::TileCache::default()
    } else {
        let all = consolidate_nav_geometry(&scene, scene::any_mesh);
        walker::build(&all, &walker::WalkerConfig::default())
    };

    let accessible = consolidate_nav_geometry(&scene, is_accessible);
    let inaccessible = consolidate_nav_geometry(&scene, is_inaccessible);
    let accessible_chunked = drone::chunk_for_raycast(&accessible);
    let inaccessible_chunked = drone::chunk_for_raycast(&inaccessible);

    let (graph, stats) = drone::build(&accessible, &accessible_chunked, &inaccessible_chunked);
    let voxel = reverb::bake(
        &accessible_chunked,
        &inaccessible_chunked,
        accessible.bounds_min,
        accessible.bounds_max,
    );

    output::write_nav_file(out_nav, &walker_cache, &graph, &voxel)
        .with_context(|| format!("failed to write {}", out_nav.display()))?;

    let total_vertices: usize = graph.chunks.iter().map(|c| c.vertices.len()).sum();
    log::info!(
        "{} - drone graph: {} chunks, {} vertices, {} overflows, {} orphans",
        out_nav.display(),
        graph.chunks.len(),
        total_vertices,
        stats.adjacency_overflows,
        stats.orphans
    );
    Ok(())
}

/// Pass-through asset classes: copy and record. Conversion pipelines for
/// these formats live outside this tool.
fn import_copies(
    state: &mut ImporterState,
    records: fn(&mut Manifest) -> &mut std::collections::BTreeMap<String, AssetRecord>,
    cached: &std::collections::BTreeMap<String, AssetRecord>,
    in_folder: &Path,
    out_folder: &Path,
    extension: &str,
) {
    let Ok(entries) = std::fs::read_dir(in_folder) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e.to_string_lossy().into_owned())
            != Some(extension.to_owned())
        {
            continue;
        }
        let name = asset_name(&path);
        let out_path = out_folder.join(path.file_name().unwrap_or_default());
        let mtime = file_mtime(&path);

        records(&mut state.manifest).insert(
            name.clone(),
            AssetRecord {
                out_path: out_path.to_string_lossy().into_owned(),
                mtime,
            },
        );

        if !state.rebuild && mtime <= cached_mtime(cached, &name) {
            continue;
        }
        if std::fs::create_dir_all(out_folder).is_err()
            || std::fs::copy(&path, &out_path).is_err()
        {
            log::error!("failed to copy {}", path.display());
            state.error = true;
        }
    }
}

fn levels_in(folder: &Path) -> Vec<PathBuf> {
    let mut levels: Vec<PathBuf> = std::fs::read_dir(folder)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().map(|e| e.to_string_lossy().into_owned())
                    == Some(LEVEL_EXTENSION.to_owned())
        })
        .collect();
    levels.sort();
    levels
}

fn mod_proc(state: &mut ImporterState) {
    log::info!("importing runtime assets...");
    let out_folder = Path::new(ASSET_OUT_FOLDER).join("lvl");
    for level in levels_in(Path::new(MOD_FOLDER)) {
        import_level(state, &level, &out_folder);
        if state.error {
            break;
        }
    }
}

fn full_proc(state: &mut ImporterState) {
    let input = Path::new(ASSET_IN_FOLDER);
    let out = Path::new(ASSET_OUT_FOLDER);

    let cached = state.cached.clone();
    import_copies(state, |m| &mut m.textures, &cached.textures, &input.join("tex"), &out.join("tex"), "png");
    import_copies(state, |m| &mut m.meshes, &cached.meshes, &input.join("msh"), &out.join("msh"), "msh");
    import_copies(state, |m| &mut m.shaders, &cached.shaders, &input.join("shader"), &out.join("shader"), "glsl");
    import_copies(state, |m| &mut m.fonts, &cached.fonts, &input.join("font"), &out.join("font"), "ttf");
    import_copies(state, |m| &mut m.strings, &cached.strings, &input.join("str"), &out.join("str"), "json");
    import_copies(state, |m| &mut m.soundbanks, &cached.soundbanks, &input.join("audio"), &out.join("audio"), "bnk");

    if state.error {
        return;
    }

    let out_folder = out.join("lvl");
    for level in levels_in(&input.join("lvl")) {
        import_level(state, &level, &out_folder);
        if state.error {
            break;
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let manifest_path = Path::new(MANIFEST_PATH);
    let cached = Manifest::load(manifest_path);
    let mut state = ImporterState {
        rebuild: cached.is_none(),
        cached: cached.unwrap_or_default(),
        manifest: Manifest::default(),
        error: false,
    };

    if Path::new(MOD_FOLDER).is_dir() {
        mod_proc(&mut state);
    } else {
        full_proc(&mut state);
    }

    if state.error {
        return ExitCode::FAILURE;
    }

    if state.rebuild || state.manifest.requires_update(&state.cached) {
        if let Err(err) = state.manifest.save(manifest_path) {
            log::error!("{err:#}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_level_json() -> &'static str {
        r#"{
            "id": 1,
            "meshes": {
                "floor": {
                    "vertices": [[0,0,0],[12,0,0],[12,0,12],[0,0,12]],
                    "indices": [0,2,1,0,3,2],
                    "color": [0.5, 0.5, 0.5, 1.0]
                }
            },
            "elements": [
                { "name": "root", "static_geom": true, "meshes": ["floor"] }
            ]
        }"#
    }

    #[test]
    fn test_build_level_writes_outputs() {
        let dir = std::env::temp_dir().join("tether-importer-level-test");
        std::fs::create_dir_all(&dir).unwrap();
        let in_path = dir.join("arena.json");
        std::fs::write(&in_path, demo_level_json()).unwrap();
        let out_lvl = dir.join("arena.lvl");
        let out_nav = dir.join("arena.nav");

        build_level(&in_path, &out_lvl, &out_nav).unwrap();

        assert!(out_lvl.is_file());
        let nav = std::fs::read(&out_nav).unwrap();
        assert!(!nav.is_empty());
    }

    #[test]
    fn test_import_level_skips_when_cached() {
        let dir = std::env::temp_dir().join("tether-importer-skip-test");
        std::fs::create_dir_all(&dir).unwrap();
        let in_path = dir.join("arena.json");
        std::fs::write(&in_path, demo_level_json()).unwrap();

        let mtime = file_mtime(&in_path);
        let mut cached = Manifest::default();
        for map in [&mut cached.levels, &mut cached.nav_meshes] {
            map.insert(
                "arena".into(),
                AssetRecord {
                    out_path: String::new(),
                    mtime,
                },
            );
        }

        let mut state = ImporterState {
            cached,
            manifest: Manifest::default(),
            rebuild: false,
            error: false,
        };
        // cached and up to date: no outputs are produced
        let out_folder = dir.join("out");
        import_level(&mut state, &in_path, &out_folder);
        assert!(!state.error);
        assert!(!out_folder.join("arena.nav").exists());
        assert!(state.manifest.levels.contains_key("arena"));
    }
}
