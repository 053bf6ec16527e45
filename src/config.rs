//! GI core configuration (global tunables).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::Result;

/// Global settings for the sparse voxel octree GI core.
///
/// Sizes are world units. Streaming and update caps are per frame; the
/// `steady_*` values take over once the initial load settles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SvoConfig {
    /// Smallest node size the tree subdivides down to.
    pub min_node_size: f32,
    /// Largest node size that carries voxel data.
    pub max_node_size: f32,
    /// Node size at which a node gathers scene geometry itself
    /// ("area parent"); nodes above it are low-LOD.
    pub max_area_size: f32,
    /// Distance/size ratio steering subdivision depth.
    pub lod_ratio: f32,
    /// Streaming starts per frame during initial load.
    pub max_stream_requests: usize,
    /// Brick render-data updates per frame during initial load.
    pub max_brick_updates: usize,
    /// Streaming starts per frame after the initial load settles.
    pub steady_stream_requests: usize,
    /// Brick updates per frame after the initial load settles.
    pub steady_brick_updates: usize,
    /// Hard cap on simultaneously loaded segments.
    pub max_loaded_bricks: usize,
    /// Brick channel buffer pool capacity (buffers, not segments).
    pub brick_pool_capacity: usize,
    /// Atlas pool extent in blocks along X and Y.
    pub atlas_dim_xy: u32,
    /// Atlas pool extent in blocks along Z.
    pub atlas_dim_z: u32,
    /// Streaming engine worker thread count.
    pub worker_threads: usize,
    /// Streaming engine request queue capacity.
    pub stream_queue_capacity: usize,
    /// Skip subdividing into max-size children until their scene
    /// geometry is fully streamed in.
    pub postpone_voxelization: bool,
    /// Voxelize geometry below the terrain surface.
    pub voxelize_under_terrain: bool,
    /// Objects with a smaller max view distance are not voxelized.
    pub objects_max_view_distance: f32,
    /// Triangles below this opacity are not voxelized.
    pub min_voxel_opacity: f32,
    /// Opacity cap applied to vegetation geometry.
    pub vegetation_max_opacity: f32,
    /// Check one child per frame during traversal instead of all eight.
    pub reduced_update: bool,
}

impl Default for SvoConfig {
    fn default() -> Self {
        Self {
            min_node_size: 4.0,
            max_node_size: 32.0,
            max_area_size: 32.0,
            lod_ratio: 1.0,
            max_stream_requests: 256,
            max_brick_updates: 128,
            steady_stream_requests: 4,
            steady_brick_updates: 4,
            max_loaded_bricks: 4096,
            brick_pool_capacity: 8192,
            atlas_dim_xy: 32,
            atlas_dim_z: 32,
            worker_threads: 2,
            stream_queue_capacity: 512,
            postpone_voxelization: true,
            voxelize_under_terrain: false,
            objects_max_view_distance: 30.0,
            min_voxel_opacity: 0.1,
            vegetation_max_opacity: 0.3,
            reduced_update: false,
        }
    }
}

impl SvoConfig {
    /// Load configuration from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| crate::core::Error::Corrupt(format!("config parse: {}", e)))
    }

    /// Save configuration to a JSON file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| crate::core::Error::Corrupt(format!("config encode: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let cfg = SvoConfig::default();
        assert!(cfg.min_node_size < cfg.max_node_size);
        assert!(cfg.max_area_size <= cfg.max_node_size);
        assert!(cfg.steady_stream_requests <= cfg.max_stream_requests);
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("svo.json");

        let mut cfg = SvoConfig::default();
        cfg.max_node_size = 64.0;
        cfg.save_json(&path).expect("save failed");

        let loaded = SvoConfig::load_json(&path).expect("load failed");
        assert_eq!(loaded.max_node_size, 64.0);
        assert_eq!(loaded.worker_threads, cfg.worker_threads);
    }
}
