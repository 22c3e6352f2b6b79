//! Persistent compiled-graph cache keyed by every parameter that affects the
//! compiled artifact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::tensor::Precision;

const MANIFEST_FILE: &str = "key.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompiledGraphKey {
    pub model: String,
    pub padded_width: u32,
    pub padded_height: u32,
    pub precision: Precision,
    /// Flow-estimation scale in percent (50 in UHD mode).
    pub internal_scale_pct: u32,
    pub ensemble: bool,
    pub device_name: String,
    pub compiler_version: String,
    pub workspace_size_mb: Option<u64>,
    pub max_aux_streams: Option<u32>,
    pub optimization_level: u8,
}

impl CompiledGraphKey {
    pub fn digest(&self) -> Result<String> {
        let canonical =
            serde_json::to_vec(self).context("failed to serialize compiled graph key")?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }

    /// `<model stem>-<sha256>`; the stem is only there to make the cache
    /// browsable.
    pub fn dir_name(&self) -> Result<String> {
        let stem = Path::new(&self.model)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = self.digest()?;
        if stem.is_empty() {
            Ok(digest)
        } else {
            Ok(format!("{stem}-{digest}"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Manifest present and identical.
    Hit,
    Miss,
    /// Manifest present but different; the directory was cleared.
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub dir: PathBuf,
    pub key: CompiledGraphKey,
    pub lookup: CacheLookup,
}

impl CacheEntry {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Record the key next to the artifact once compilation succeeded.
    pub fn commit(&self) -> Result<()> {
        let manifest = serde_json::to_string_pretty(&self.key)
            .context("failed to serialize compiled graph key")?;
        let path = self.manifest_path();
        std::fs::write(&path, manifest)
            .with_context(|| format!("failed to write cache manifest {}", path.display()))?;
        debug!(manifest = %path.display(), "Compiled graph manifest written");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CompiledGraphCache {
    root: PathBuf,
}

impl CompiledGraphCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the directory for `key`, verifying any existing manifest.
    pub fn prepare(&self, key: &CompiledGraphKey) -> Result<CacheEntry> {
        let dir = self.root.join(key.dir_name()?);
        let manifest_path = dir.join(MANIFEST_FILE);

        let lookup = if manifest_path.is_file() {
            match read_manifest(&manifest_path) {
                Ok(stored) if &stored == key => CacheLookup::Hit,
                Ok(stored) => {
                    warn!(
                        dir = %dir.display(),
                        stored = ?stored,
                        requested = ?key,
                        "Compiled graph manifest does not match; rebuilding"
                    );
                    clear_dir(&dir)?;
                    CacheLookup::Stale
                }
                Err(error) => {
                    warn!(
                        dir = %dir.display(),
                        error = %format!("{error:#}"),
                        "Unreadable compiled graph manifest; rebuilding"
                    );
                    clear_dir(&dir)?;
                    CacheLookup::Stale
                }
            }
        } else {
            CacheLookup::Miss
        };

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

        info!(
            dir = %dir.display(),
            lookup = ?lookup,
            model = %key.model,
            padded = %format!("{}x{}", key.padded_width, key.padded_height),
            "Compiled graph cache resolved"
        );

        Ok(CacheEntry {
            dir,
            key: key.clone(),
            lookup,
        })
    }
}

fn read_manifest(path: &Path) -> Result<CompiledGraphKey> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn clear_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("failed to clear stale cache {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key() -> CompiledGraphKey {
        CompiledGraphKey {
            model: "rife_v4.22.onnx".to_string(),
            padded_width: 1920,
            padded_height: 1088,
            precision: Precision::Float16,
            internal_scale_pct: 100,
            ensemble: false,
            device_name: "NVIDIA GeForce RTX 4090".to_string(),
            compiler_version: "10.7.0".to_string(),
            workspace_size_mb: None,
            max_aux_streams: None,
            optimization_level: 3,
        }
    }

    #[test]
    fn test_identical_keys_share_directory() {
        assert_eq!(
            key().dir_name().expect("dir name"),
            key().dir_name().expect("dir name")
        );
    }

    #[test]
    fn test_any_parameter_change_moves_directory() {
        let base = key();
        let variants = vec![
            CompiledGraphKey {
                padded_width: 1984,
                ..base.clone()
            },
            CompiledGraphKey {
                precision: Precision::Float32,
                ..base.clone()
            },
            CompiledGraphKey {
                internal_scale_pct: 50,
                ..base.clone()
            },
            CompiledGraphKey {
                ensemble: true,
                ..base.clone()
            },
            CompiledGraphKey {
                workspace_size_mb: Some(4096),
                ..base.clone()
            },
            CompiledGraphKey {
                max_aux_streams: Some(1),
                ..base.clone()
            },
            CompiledGraphKey {
                optimization_level: 5,
                ..base.clone()
            },
            CompiledGraphKey {
                compiler_version: "10.8.0".to_string(),
                ..base.clone()
            },
        ];

        let mut names = HashSet::new();
        names.insert(base.dir_name().expect("dir name"));
        for variant in &variants {
            assert!(
                names.insert(variant.dir_name().expect("dir name")),
                "collision for {variant:?}"
            );
        }
    }

    #[test]
    fn test_dir_name_keeps_readable_stem() {
        let name = key().dir_name().expect("dir name");
        assert!(name.starts_with("rife_v4_22-"), "{name}");
        assert_eq!(name.len(), "rife_v4_22-".len() + 64);
    }

    #[test]
    fn test_prepare_miss_then_hit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = CompiledGraphCache::new(temp.path());

        let first = cache.prepare(&key()).expect("prepare");
        assert_eq!(first.lookup, CacheLookup::Miss);
        assert!(first.dir.is_dir());
        first.commit().expect("commit");

        let second = cache.prepare(&key()).expect("prepare");
        assert_eq!(second.lookup, CacheLookup::Hit);
        assert_eq!(second.dir, first.dir);
    }

    #[test]
    fn test_mismatched_manifest_is_rebuilt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = CompiledGraphCache::new(temp.path());
        let entry = cache.prepare(&key()).expect("prepare");

        let other = CompiledGraphKey {
            device_name: "other".to_string(),
            ..key()
        };
        std::fs::write(
            entry.manifest_path(),
            serde_json::to_string(&other).expect("serialize"),
        )
        .expect("write manifest");
        std::fs::write(entry.dir.join("engine.bin"), b"stale").expect("write artifact");

        let again = cache.prepare(&key()).expect("prepare");
        assert_eq!(again.lookup, CacheLookup::Stale);
        assert!(!again.dir.join("engine.bin").exists());
        assert!(again.dir.is_dir());
    }
}
