//! The `.manifest` incremental-build cache: which outputs exist and what
//! source timestamps produced them.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub out_path: String,
    pub mtime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub levels: BTreeMap<String, AssetRecord>,
    pub nav_meshes: BTreeMap<String, AssetRecord>,
    pub textures: BTreeMap<String, AssetRecord>,
    pub meshes: BTreeMap<String, AssetRecord>,
    pub shaders: BTreeMap<String, AssetRecord>,
    pub fonts: BTreeMap<String, AssetRecord>,
    pub strings: BTreeMap<String, AssetRecord>,
    pub soundbanks: BTreeMap<String, AssetRecord>,
}

impl Manifest {
    pub fn load(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("failed to encode manifest")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write manifest {}", path.display()))
    }

    /// Did anything change relative to the cached build?
    pub fn requires_update(&self, cached: &Self) -> bool {
        self != cached
    }
}

/// Source file modification time in seconds, 0 when unreadable.
pub fn file_mtime(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// The cached mtime for an asset, 0 when never built.
pub fn cached_mtime(map: &BTreeMap<String, AssetRecord>, name: &str) -> u64 {
    map.get(name).map_or(0, |r| r.mtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_disk() {
        let mut manifest = Manifest::default();
        manifest.levels.insert(
            "arena".into(),
            AssetRecord {
                out_path: "build/lvl/arena.lvl".into(),
                mtime: 12345,
            },
        );

        let dir = std::env::temp_dir().join("tether-importer-manifest-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(".manifest");
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(cached_mtime(&loaded.levels, "arena"), 12345);
        assert_eq!(cached_mtime(&loaded.levels, "missing"), 0);
    }

    #[test]
    fn test_requires_update_detects_change() {
        let a = Manifest::default();
        let mut b = Manifest::default();
        assert!(!a.requires_update(&b));
        b.nav_meshes.insert(
            "arena".into(),
            AssetRecord {
                out_path: "build/lvl/arena.nav".into(),
                mtime: 1,
            },
        );
        assert!(a.requires_update(&b));
    }
}
