//! Read-only scene query boundary consumed by voxelization.
//!
//! The engine hosting this core implements these traits over its own mesh,
//! terrain and vis-area storage. Queries run from streaming worker threads,
//! so implementations must be `Send + Sync` and tolerate concurrent reads.

use std::sync::Arc;

use crate::core::types::{IVec3, Vec2, Vec3};
use crate::math::Aabb;

/// Low-resolution CPU copy of a diffuse texture, used for albedo sampling.
#[derive(Clone, Debug)]
pub struct LowResTexture {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA8 texels, `width * height` entries.
    pub texels: Vec<[u8; 4]>,
}

impl LowResTexture {
    /// Bilinear sample with wrapping, normalized coordinates, 0..1 output.
    pub fn sample_bilinear(&self, u: f32, v: f32) -> [f32; 4] {
        let fx = u * self.width as f32;
        let fy = v * self.height as f32;
        let x = fx.floor();
        let y = fy.floor();
        let rx = fx - x;
        let ry = fy - y;

        let wrap = |v: i64, dim: u32| -> u32 { (v.rem_euclid(dim as i64)) as u32 };
        let fetch = |x: u32, y: u32| -> [f32; 4] {
            let t = self.texels[(y * self.width + x) as usize];
            [
                t[0] as f32 / 255.0,
                t[1] as f32 / 255.0,
                t[2] as f32 / 255.0,
                t[3] as f32 / 255.0,
            ]
        };

        let x0 = wrap(x as i64, self.width);
        let x1 = wrap(x as i64 + 1, self.width);
        let y0 = wrap(y as i64, self.height);
        let y1 = wrap(y as i64 + 1, self.height);

        let lerp = |a: [f32; 4], b: [f32; 4], t: f32| -> [f32; 4] {
            [
                a[0] + (b[0] - a[0]) * t,
                a[1] + (b[1] - a[1]) * t,
                a[2] + (b[2] - a[2]) * t,
                a[3] + (b[3] - a[3]) * t,
            ]
        };

        let top = lerp(fetch(x0, y0), fetch(x1, y0), rx);
        let bot = lerp(fetch(x0, y1), fetch(x1, y1), rx);
        lerp(top, bot, ry)
    }
}

/// Material data shared between the host engine and the voxelizer.
///
/// `key` identifies the material across queries; triangles carrying
/// materials with equal keys deduplicate to one super-mesh material slot.
#[derive(Debug)]
pub struct SceneMaterial {
    pub key: u64,
    /// Linear diffuse multiplier.
    pub diffuse: [f32; 3],
    /// Emissive luminance.
    pub emissive: f32,
    pub texture: Option<LowResTexture>,
}

/// One triangle returned by a geometry query, already in world space.
#[derive(Clone, Debug)]
pub struct SceneTriangle {
    pub positions: [Vec3; 3],
    pub uvs: [Vec2; 3],
    pub colors: [[u8; 4]; 3],
    /// 0-255 source opacity.
    pub opacity: u8,
    pub material: Option<Arc<SceneMaterial>>,
}

/// One renderable object overlapping a queried box.
#[derive(Clone, Debug)]
pub struct MeshObject {
    pub bounds: Aabb,
    pub max_view_distance: f32,
    pub vegetation: bool,
    /// Inside a vis-area (exempt from under-terrain culling).
    pub indoor: bool,
    pub shadow_caster: bool,
    /// Identity used for geometry change checksums.
    pub material_key: u64,
    /// Empty while the host is still streaming the mesh in.
    pub triangles: Vec<SceneTriangle>,
    pub ready: bool,
}

/// Result of a geometry query.
#[derive(Default)]
pub struct MeshQuery {
    pub objects: Vec<MeshObject>,
    /// False when some overlapping mesh is not streamed in yet; voxelization
    /// of the box may be postponed until a later query succeeds.
    pub all_ready: bool,
}

pub trait GeometrySource: Send + Sync {
    fn collect_meshes(&self, bounds: &Aabb) -> MeshQuery;
}

pub trait TerrainSource: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }
    fn height(&self, x: f32, y: f32) -> f32;
    fn is_hole(&self, _x: f32, _y: f32) -> bool {
        false
    }
    /// Dominant surface type id, drives the seam-avoiding triangulation.
    fn surface_type(&self, _x: f32, _y: f32) -> u8 {
        0
    }
    /// Height map cell size in world units.
    fn unit_size(&self) -> f32 {
        1.0
    }
    fn world_size(&self) -> f32;
    fn color_map(&self) -> Option<&LowResTexture> {
        None
    }
}

/// Vis-area or portal prism: a polygon extruded along +Z.
#[derive(Clone, Debug)]
pub struct AreaShape {
    pub points: Vec<Vec3>,
    pub height: f32,
    pub portal: bool,
    pub bounds: Aabb,
}

pub trait VisAreaSource: Send + Sync {
    fn collect_areas(&self, bounds: &Aabb, out: &mut Vec<AreaShape>);
}

/// Bundle of scene collaborators handed to worker threads.
#[derive(Clone)]
pub struct SceneSources {
    pub geometry: Arc<dyn GeometrySource>,
    pub terrain: Option<Arc<dyn TerrainSource>>,
    pub vis_areas: Option<Arc<dyn VisAreaSource>>,
}

impl SceneSources {
    /// Sources with no geometry at all, for tools and tests.
    pub fn empty() -> Self {
        struct Nothing;
        impl GeometrySource for Nothing {
            fn collect_meshes(&self, _bounds: &Aabb) -> MeshQuery {
                MeshQuery {
                    objects: Vec::new(),
                    all_ready: true,
                }
            }
        }
        Self {
            geometry: Arc::new(Nothing),
            terrain: None,
            vis_areas: None,
        }
    }

    /// Position/material checksum of static geometry overlapping `bounds`.
    ///
    /// Compared frame to frame to detect object movement without keeping a
    /// copy of the geometry. Nodes above `max_node_size` always hash to zero.
    pub fn geometry_checksum(&self, bounds: &Aabb, max_node_size: f32, border: f32) -> IVec3 {
        let node_size = bounds.size().x;
        if node_size > max_node_size {
            return IVec3::ZERO;
        }

        let query = self
            .geometry
            .collect_meshes(&bounds.inflate(Vec3::splat(border)));

        let precision = 1000.0;
        let mut sum = IVec3::ZERO;
        for obj in &query.objects {
            if !obj.ready {
                continue;
            }
            sum += (obj.bounds.min * precision).as_ivec3();
            sum += (obj.bounds.max * precision * 2.0).as_ivec3();
            sum.x = sum.x.wrapping_add((obj.material_key / 64) as i32);
        }

        if let Some(vis) = &self.vis_areas {
            let mut areas = Vec::new();
            vis.collect_areas(bounds, &mut areas);
            for area in &areas {
                sum += (area.bounds.min * precision).as_ivec3();
                sum += (area.bounds.max * precision * 2.0).as_ivec3();
            }
        }

        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bilinear_flat_texture() {
        let tex = LowResTexture {
            width: 4,
            height: 4,
            texels: vec![[128, 64, 32, 255]; 16],
        };
        let s = tex.sample_bilinear(0.4, 0.7);
        assert!((s[0] - 128.0 / 255.0).abs() < 1e-4);
        assert!((s[1] - 64.0 / 255.0).abs() < 1e-4);
        assert!((s[3] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_checksum_zero_above_max_size() {
        let sources = SceneSources::empty();
        let big = Aabb::new(Vec3::ZERO, Vec3::splat(128.0));
        assert_eq!(sources.geometry_checksum(&big, 32.0, 1.0), IVec3::ZERO);
    }
}
