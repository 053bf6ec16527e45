//! CPU voxelization: triangle gathering and sub-voxel rasterisation.
//!
//! Runs on streaming worker threads against an immutable snapshot of the
//! scene sources; the result is handed back to the main thread as a
//! [`BuildOutput`] and installed there.

use std::sync::{Arc, RwLock};

use rayon::prelude::*;

use crate::config::SvoConfig;
use crate::core::types::{Vec2, Vec3};
use crate::math::{barycentric, tri_intersects_aabb, Aabb};
use crate::scene::{AreaShape, SceneSources, TerrainSource};
use crate::svo::arena::SegmentId;

use super::brick::{crop_to_bounds, texel_index, BrickChannels, BRICK_DIM, BRICK_VOXELS};
use super::pool::BrickBufferPool;
use super::segment::BrickPayload;
use super::supermesh::{
    HitObjectType, RawTriangle, SuperMesh, OFFSET_MESH, OFFSET_TERRAIN,
};

/// Area triangle store shared between an area parent and its descendants.
pub type MeshShare = Arc<RwLock<SuperMesh>>;

/// Quantization scale for the per-triangle area byte.
const AREA_SCALE: f32 = 200.0;

/// Sub-voxel refinement dimensions.
const SUB_DIM: usize = 2;
const SUBSUB_DIM: usize = 4;

/// Voxelization tunables snapshotted from [`SvoConfig`] at enqueue time.
#[derive(Clone, Debug)]
pub struct VoxelizeConfig {
    pub min_node_size: f32,
    pub max_node_size: f32,
    pub max_area_size: f32,
    pub voxelize_under_terrain: bool,
    pub objects_max_view_distance: f32,
    pub min_voxel_opacity: f32,
    pub vegetation_max_opacity: f32,
    /// Re-filter every area triangle instead of trusting the parent's
    /// gathered subset (reliable while the scene is being edited).
    pub strict_triangle_filter: bool,
}

impl VoxelizeConfig {
    pub fn from_config(cfg: &SvoConfig) -> Self {
        Self {
            min_node_size: cfg.min_node_size,
            max_node_size: cfg.max_node_size,
            max_area_size: cfg.max_area_size,
            voxelize_under_terrain: cfg.voxelize_under_terrain,
            objects_max_view_distance: cfg.objects_max_view_distance,
            min_voxel_opacity: cfg.min_voxel_opacity,
            vegetation_max_opacity: cfg.vegetation_max_opacity,
            strict_triangle_filter: false,
        }
    }
}

/// Everything a worker needs to voxelize one node.
pub struct VoxelizeParams {
    /// World-space node box.
    pub node_bounds: Aabb,
    pub parent_mesh: Option<MeshShare>,
    /// Triangle ids the parent gathered for its own box.
    pub parent_merged: Vec<u32>,
    pub sources: SceneSources,
    pub cfg: VoxelizeConfig,
    pub pool: Arc<BrickBufferPool>,
}

/// A queued build request.
pub struct VoxelizeJob {
    pub segment: SegmentId,
    pub params: VoxelizeParams,
}

/// Result of a build: the brick payload plus the gathered triangle state
/// the owning segment keeps for its children.
pub struct BuildOutput {
    pub payload: BrickPayload,
    pub mesh: MeshShare,
    pub owns_mesh: bool,
    pub merged_tris: Vec<u32>,
    pub child_tris_mask: u8,
    pub tris_bounds: Aabb,
}

impl BuildOutput {
    fn empty() -> Self {
        Self {
            payload: BrickPayload {
                channels: None,
                crop: Default::default(),
                max_alpha: 0.0,
                voxel_count: 0,
            },
            mesh: MeshShare::default(),
            owns_mesh: false,
            merged_tris: Vec::new(),
            child_tris_mask: 0,
            tris_bounds: Aabb::empty(),
        }
    }
}

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() <= b * 1e-3
}

/// True when a node of this size gathers scene geometry itself.
pub fn is_area_parent(node_size: f32, cfg: &VoxelizeConfig) -> bool {
    approx(node_size, cfg.max_area_size)
}

/// True for oversized nodes that voxelize only coarse shadow geometry.
pub fn is_low_lod(node_size: f32, cfg: &VoxelizeConfig) -> bool {
    node_size > cfg.max_area_size && !approx(node_size, cfg.max_area_size)
}

/// Cheap readiness probe for the postpone policy: are all meshes
/// overlapping `bounds` streamed in on the host side?
pub fn probe_scene_ready(sources: &SceneSources, bounds: &Aabb) -> bool {
    sources.geometry.collect_meshes(bounds).all_ready
}

/// Voxelize one node. Never touches shared mutable state; the read lock on
/// an inherited area mesh is the only synchronisation.
pub fn run_job(params: &VoxelizeParams) -> BuildOutput {
    let node_size = params.node_bounds.size().x;
    if node_size > params.cfg.max_node_size && !approx(node_size, params.cfg.max_node_size) {
        return BuildOutput::empty();
    }

    let area_parent = is_area_parent(node_size, &params.cfg);
    let low_lod = is_low_lod(node_size, &params.cfg);

    let (mesh, owns_mesh) = if area_parent || low_lod {
        let mut gathered = SuperMesh::new();
        gather_scene(&mut gathered, params, low_lod);
        (Arc::new(RwLock::new(gathered)), true)
    } else if let Some(parent) = &params.parent_mesh {
        (Arc::clone(parent), false)
    } else {
        return BuildOutput::empty();
    };

    let guard = mesh.read().expect("area mesh lock");

    let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); BRICK_VOXELS];
    let mut merged = Vec::new();
    let mut tris_bounds = Aabb::empty();
    let mut child_mask = 0u8;

    if owns_mesh {
        for id in 0..guard.tris().len() as u32 {
            bucket_triangle(
                &guard,
                id,
                &params.node_bounds,
                &mut buckets,
                &mut merged,
                &mut tris_bounds,
                &mut child_mask,
            );
        }
    } else if params.cfg.strict_triangle_filter {
        for id in 0..guard.tris().len() as u32 {
            let [a, b, c] = tri_positions(&guard, id);
            if tri_intersects_aabb(&params.node_bounds, a, b, c) {
                bucket_triangle(
                    &guard,
                    id,
                    &params.node_bounds,
                    &mut buckets,
                    &mut merged,
                    &mut tris_bounds,
                    &mut child_mask,
                );
            }
        }
    } else {
        for &id in &params.parent_merged {
            if id as usize >= guard.tris().len() {
                log::warn!("stale triangle id {} past area store", id);
                break;
            }
            let [a, b, c] = tri_positions(&guard, id);
            if tri_intersects_aabb(&params.node_bounds, a, b, c) {
                bucket_triangle(
                    &guard,
                    id,
                    &params.node_bounds,
                    &mut buckets,
                    &mut merged,
                    &mut tris_bounds,
                    &mut child_mask,
                );
            }
        }
    }

    let payload = if merged.is_empty() {
        BrickPayload {
            channels: None,
            crop: Default::default(),
            max_alpha: 0.0,
            voxel_count: 0,
        }
    } else {
        let mut portals = Vec::new();
        if let Some(vis) = &params.sources.vis_areas {
            let mut areas: Vec<AreaShape> = Vec::new();
            vis.collect_areas(&params.node_bounds, &mut areas);
            portals.extend(
                areas
                    .into_iter()
                    .filter(|a| a.portal)
                    .map(|a| a.bounds),
            );
        }

        let (mut channels, voxel_count, max_alpha) = rasterize(
            &guard,
            &buckets,
            &params.node_bounds,
            &tris_bounds,
            &portals,
            params.sources.terrain.as_deref(),
            &params.pool,
        );

        let crop = crop_to_bounds(&mut channels);
        BrickPayload {
            channels: if crop.is_empty() { None } else { Some(channels) },
            crop,
            max_alpha,
            voxel_count,
        }
    };

    drop(guard);

    BuildOutput {
        payload,
        mesh,
        owns_mesh,
        merged_tris: merged,
        child_tris_mask: child_mask,
        tris_bounds,
    }
}

fn tri_positions(mesh: &SuperMesh, id: u32) -> [Vec3; 3] {
    let tri = &mesh.tris()[id as usize];
    [
        mesh.verts()[tri.verts[0] as usize].pos,
        mesh.verts()[tri.verts[1] as usize].pos,
        mesh.verts()[tri.verts[2] as usize].pos,
    ]
}

/// Record one gathered triangle: bucket it into every texel cell its
/// (half-voxel inflated) box touches, extend the triangle bounds, and mark
/// the child octants it overlaps.
fn bucket_triangle(
    mesh: &SuperMesh,
    id: u32,
    node_bounds: &Aabb,
    buckets: &mut [Vec<u32>],
    merged: &mut Vec<u32>,
    tris_bounds: &mut Aabb,
    child_mask: &mut u8,
) {
    let [a, b, c] = tri_positions(mesh, id);
    for v in [a, b, c] {
        tris_bounds.expand(v);
    }

    let box_size = node_bounds.size();
    let half_voxel = box_size.x / BRICK_DIM as f32 / 2.0;

    let mut tri_box = Aabb::new(a, a);
    tri_box.expand(b);
    tri_box.expand(c);
    let tri_box = tri_box.inflate(Vec3::splat(half_voxel));

    let dim = BRICK_DIM as i32;
    let cell = |lo: f32, min: f32, size: f32| -> i32 {
        (((lo - min) / size * dim as f32) as i32).clamp(0, dim - 1)
    };
    let x0 = cell(tri_box.min.x, node_bounds.min.x, box_size.x);
    let x1 = cell(tri_box.max.x, node_bounds.min.x, box_size.x);
    let y0 = cell(tri_box.min.y, node_bounds.min.y, box_size.y);
    let y1 = cell(tri_box.max.y, node_bounds.min.y, box_size.y);
    let z0 = cell(tri_box.min.z, node_bounds.min.z, box_size.z);
    let z1 = cell(tri_box.max.z, node_bounds.min.z, box_size.z);

    for z in z0..=z1 {
        for y in y0..=y1 {
            for x in x0..=x1 {
                buckets[texel_index(x as usize, y as usize, z as usize)].push(id);
            }
        }
    }

    merged.push(id);

    let child_pad = box_size.x / BRICK_DIM as f32 / 4.0;
    for octant in 0..8u8 {
        if *child_mask & (1 << octant) != 0 {
            continue;
        }
        let child_box = node_bounds
            .child_octant(octant)
            .inflate(Vec3::splat(child_pad));
        if tri_intersects_aabb(&child_box, a, b, c) {
            *child_mask |= 1 << octant;
        }
    }
}

struct SliceOut {
    opacity: Vec<[u8; 4]>,
    normal: Vec<[u8; 4]>,
    albedo: Vec<[u8; 4]>,
    voxel_count: u32,
    max_alpha: f32,
}

#[allow(clippy::too_many_arguments)]
fn rasterize(
    mesh: &SuperMesh,
    buckets: &[Vec<u32>],
    node_bounds: &Aabb,
    tris_bounds: &Aabb,
    portals: &[Aabb],
    terrain: Option<&dyn TerrainSource>,
    pool: &Arc<BrickBufferPool>,
) -> (BrickChannels, u32, f32) {
    let slices: Vec<SliceOut> = (0..BRICK_DIM)
        .into_par_iter()
        .map(|z| rasterize_slice(mesh, buckets, node_bounds, tris_bounds, portals, terrain, z))
        .collect();

    let mut channels = BrickChannels::allocate(pool);
    let mut voxel_count = 0;
    let mut max_alpha = 0.0f32;
    let slice_len = BRICK_DIM * BRICK_DIM;
    for (z, slice) in slices.into_iter().enumerate() {
        let base = z * slice_len;
        channels.opacity[base..base + slice_len].copy_from_slice(&slice.opacity);
        channels.normal[base..base + slice_len].copy_from_slice(&slice.normal);
        channels.albedo[base..base + slice_len].copy_from_slice(&slice.albedo);
        voxel_count += slice.voxel_count;
        max_alpha = max_alpha.max(slice.max_alpha);
    }

    (channels, voxel_count, max_alpha)
}

fn rasterize_slice(
    mesh: &SuperMesh,
    buckets: &[Vec<u32>],
    node_bounds: &Aabb,
    tris_bounds: &Aabb,
    portals: &[Aabb],
    terrain: Option<&dyn TerrainSource>,
    z: usize,
) -> SliceOut {
    let slice_len = BRICK_DIM * BRICK_DIM;
    let mut out = SliceOut {
        opacity: vec![[0; 4]; slice_len],
        normal: vec![[0; 4]; slice_len],
        albedo: vec![[0; 4]; slice_len],
        voxel_count: 0,
        max_alpha: 0.0,
    };

    let vox_size = node_bounds.size() / BRICK_DIM as f32;

    for y in 0..BRICK_DIM {
        for x in 0..BRICK_DIM {
            let vox_min = node_bounds.min
                + Vec3::new(x as f32, y as f32, z as f32) * vox_size;
            let vox_box = Aabb::new(vox_min, vox_min + vox_size);

            if !vox_box.intersects(tris_bounds) {
                continue;
            }

            let bucket = &buckets[texel_index(x, y, z)];
            if bucket.is_empty() {
                continue;
            }

            let mut candidates: Vec<u32> = Vec::new();
            let mut vis_area_hit = false;
            for &id in bucket {
                let [a, b, c] = tri_positions(mesh, id);
                if tri_intersects_aabb(&vox_box, a, b, c) {
                    if mesh.tris()[id as usize].object_type == HitObjectType::VisArea {
                        vis_area_hit = true;
                    }
                    candidates.push(id);
                }
            }
            if candidates.is_empty() {
                continue;
            }

            let idx = y * BRICK_DIM + x;
            rasterize_voxel(
                mesh,
                &candidates,
                &vox_box,
                portals,
                terrain,
                vis_area_hit,
                &mut out,
                idx,
            );
        }
    }

    out
}

/// World-surface triangles (terrain, vis-area shells) count against a cell
/// extended one meter upward, so the column right under the surface fills in.
fn surface_test_box(mesh: &SuperMesh, id: u32, cell: &Aabb) -> Aabb {
    let tri = &mesh.tris()[id as usize];
    if mesh.material(tri.material).is_none() {
        Aabb::new(cell.min, cell.max + Vec3::new(0.0, 0.0, 1.0))
    } else {
        *cell
    }
}

#[allow(clippy::too_many_arguments)]
fn rasterize_voxel(
    mesh: &SuperMesh,
    candidates: &[u32],
    vox_box: &Aabb,
    portals: &[Aabb],
    terrain: Option<&dyn TerrainSource>,
    vis_area_hit: bool,
    out: &mut SliceOut,
    idx: usize,
) {
    // 2x2x2 pre-filter
    let sub_size = vox_box.size() / SUB_DIM as f32;
    let mut sub: [Vec<u32>; SUB_DIM * SUB_DIM * SUB_DIM] = Default::default();
    for sz in 0..SUB_DIM {
        for sy in 0..SUB_DIM {
            for sx in 0..SUB_DIM {
                let min = vox_box.min + Vec3::new(sx as f32, sy as f32, sz as f32) * sub_size;
                let cell = Aabb::new(min, min + sub_size);
                let list = &mut sub[sz * SUB_DIM * SUB_DIM + sy * SUB_DIM + sx];
                for &id in candidates {
                    let test = surface_test_box(mesh, id, &cell);
                    let [a, b, c] = tri_positions(mesh, id);
                    if tri_intersects_aabb(&test, a, b, c) {
                        list.push(id);
                    }
                }
            }
        }
    }

    // 4x4x4 coverage accumulation
    let n = SUBSUB_DIM;
    let mut opa = [[[0u8; SUBSUB_DIM]; SUBSUB_DIM]; SUBSUB_DIM];
    let mut nor_sum = Vec3::ZERO;
    let mut nor_weight = 0.0f32;
    let mut col_sum = [0.0f32; 3];
    let mut col_weight = 0.0f32;
    let mut emi_sum = 0.0f32;

    let subsub_size = vox_box.size() / n as f32;
    for sz in 0..n {
        for sy in 0..n {
            for sx in 0..n {
                let min =
                    vox_box.min + Vec3::new(sx as f32, sy as f32, sz as f32) * subsub_size;
                let cell = Aabb::new(min, min + subsub_size);

                let padded = cell.inflate(Vec3::splat(0.25));
                if portals.iter().any(|p| p.intersects(&padded)) {
                    continue;
                }

                let parent = &sub[(sz / 2) * SUB_DIM * SUB_DIM + (sy / 2) * SUB_DIM + sx / 2];
                for &id in parent {
                    let test = surface_test_box(mesh, id, &cell);
                    let [a, b, c] = tri_positions(mesh, id);
                    if !tri_intersects_aabb(&test, a, b, c) {
                        continue;
                    }

                    let tri = &mesh.tris()[id as usize];
                    let col = sample_material(mesh, id, cell.center(), terrain);
                    if col[3] > 0.0 {
                        let traced = ((col[3] * 255.0) as i32).clamp(0, 255) as u8;
                        opa[sx][sy][sz] = opa[sx][sy][sz].max(tri.opacity.min(traced));

                        nor_sum += mesh.face_normal(id as usize);
                        nor_weight += 1.0;
                        col_sum[0] += col[0];
                        col_sum[1] += col[1];
                        col_sum[2] += col[2];
                        col_weight += 1.0;
                        if let Some(mat) = mesh.material(tri.material) {
                            emi_sum += mat.emissive;
                        }
                    }
                }
            }
        }
    }

    // tri-planar max coverage per axis
    let mut quad = [[[0u8; SUBSUB_DIM]; SUBSUB_DIM]; 3];
    for sx in 0..n {
        for sy in 0..n {
            for sz in 0..n {
                let o = opa[sx][sy][sz];
                quad[0][sy][sz] = quad[0][sy][sz].max(o);
                quad[1][sx][sz] = quad[1][sx][sz].max(o);
                quad[2][sx][sy] = quad[2][sx][sy].max(o);
            }
        }
    }

    let mut cover = [0u32; 3];
    for axis in 0..3 {
        for k in 0..n {
            for m in 0..n {
                cover[axis] += quad[axis][k][m] as u32;
            }
        }
        cover[axis] /= (n * n) as u32;
    }

    let mut opacity = [
        cover[0].min(255) as u8,
        cover[1].min(255) as u8,
        cover[2].min(255) as u8,
        0,
    ];

    // alpha tags "above terrain"; voxels near or under the surface stay 0
    let above_terrain = match terrain {
        Some(t) if t.enabled() => {
            let c = vox_box.center();
            c.z > t.height(c.x, c.y) + 1.5
        }
        _ => true,
    };
    opacity[3] = if above_terrain { 1 } else { 0 };

    let any = opacity[0] != 0 || opacity[1] != 0 || opacity[2] != 0;

    let mut color = if col_weight > 0.0 {
        [
            col_sum[0] / col_weight,
            col_sum[1] / col_weight,
            col_sum[2] / col_weight,
        ]
    } else {
        [0.0; 3]
    };
    let emissive = if col_weight > 0.0 { emi_sum / col_weight } else { 0.0 };

    if vis_area_hit && any {
        // vis-area shells block light completely
        opacity = [255, 255, 255, opacity[3]];
        color = [0.0; 3];
    }

    let nor = if nor_weight > 0.0 {
        nor_sum / nor_weight
    } else {
        Vec3::ZERO
    };
    let encode = |v: f32| -> u8 { ((v * 127.5 + 127.5) as i32).clamp(0, 255) as u8 };
    out.normal[idx] = [
        encode(nor.x),
        encode(nor.y),
        encode(nor.z),
        if any { 255 } else { 0 },
    ];

    let to_byte = |v: f32| -> u8 { ((v * 255.0) as i32).clamp(0, 255) as u8 };
    out.albedo[idx] = [
        to_byte(color[0]),
        to_byte(color[1]),
        to_byte(color[2]),
        to_byte(emissive),
    ];
    out.opacity[idx] = opacity;

    if any {
        out.voxel_count += 1;
        let peak = opacity[0].max(opacity[1]).max(opacity[2]);
        out.max_alpha = out.max_alpha.max(peak as f32 / 255.0);
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    c.powf(2.2)
}

/// Diffuse sample for a triangle at a hit position: low-res texture (or the
/// terrain color map) x material diffuse x interpolated vertex color.
fn sample_material(
    mesh: &SuperMesh,
    id: u32,
    hit_pos: Vec3,
    terrain: Option<&dyn TerrainSource>,
) -> [f32; 4] {
    let tri = &mesh.tris()[id as usize];
    let [a, b, c] = tri_positions(mesh, id);
    let material = mesh.material(tri.material);

    let (u, v, w, inside) = barycentric(a, b, c, hit_pos, 2.0);

    let mut vert_col = [1.0f32; 4];
    let mut uv = Vec2::ZERO;
    if inside {
        let verts = &mesh.verts();
        let t0 = verts[tri.verts[0] as usize];
        let t1 = verts[tri.verts[1] as usize];
        let t2 = verts[tri.verts[2] as usize];
        uv = t0.uv * u + t1.uv * v + t2.uv * w;
        for ch in 0..4 {
            vert_col[ch] = (t0.color[ch] as f32 * u
                + t1.color[ch] as f32 * v
                + t2.color[ch] as f32 * w)
                / 255.0;
        }
    } else {
        vert_col = [0.41, 0.41, 0.41, 1.0];
    }

    let mut tex_col = [0.5f32, 0.5, 0.5, 1.0];
    match material {
        Some(mat) => {
            if let Some(tex) = &mat.texture {
                let s = tex.sample_bilinear(uv.x, uv.y);
                tex_col = [
                    srgb_to_linear(s[0]),
                    srgb_to_linear(s[1]),
                    srgb_to_linear(s[2]),
                    s[3],
                ];
            }
        }
        None => {
            // terrain texgen from the world-space color map
            if let Some(t) = terrain {
                if let Some(map) = t.color_map() {
                    let ws = t.world_size();
                    let s = map.sample_bilinear(hit_pos.y / ws, hit_pos.x / ws);
                    tex_col = [
                        srgb_to_linear(s[0]).max(0.02),
                        srgb_to_linear(s[1]).max(0.02),
                        srgb_to_linear(s[2]).max(0.02),
                        1.0,
                    ];
                }
            }
        }
    }

    let mat_col = match material {
        Some(m) => [m.diffuse[0], m.diffuse[1], m.diffuse[2], 1.0],
        None => [1.0; 4],
    };

    [
        tex_col[0] * mat_col[0] * vert_col[0],
        tex_col[1] * mat_col[1] * vert_col[1],
        tex_col[2] * mat_col[2] * vert_col[2],
        tex_col[3] * mat_col[3] * vert_col[3],
    ]
}

/// Collect all geometry overlapping the node box into `mesh`.
fn gather_scene(mesh: &mut SuperMesh, params: &VoxelizeParams, low_lod: bool) {
    let bounds = &params.node_bounds;
    let cfg = &params.cfg;

    gather_mesh_objects(mesh, params, low_lod);

    if let Some(terrain) = &params.sources.terrain {
        if terrain.enabled() {
            gather_terrain(mesh, terrain.as_ref(), bounds, low_lod);
        }
    }

    if !low_lod {
        if let Some(vis) = &params.sources.vis_areas {
            let offset = cfg.min_node_size / BRICK_DIM as f32;
            gather_vis_areas(mesh, vis.as_ref(), bounds, offset);
        }
    }
}

fn tri_area_byte(a: Vec3, b: Vec3, c: Vec3) -> u8 {
    let area = AREA_SCALE * 0.5 * (b - a).cross(c - a).length();
    (area as i32).clamp(0, 255) as u8
}

fn gather_mesh_objects(mesh: &mut SuperMesh, params: &VoxelizeParams, low_lod: bool) {
    let bounds = &params.node_bounds;
    let cfg = &params.cfg;
    let query = params.sources.geometry.collect_meshes(bounds);

    let min_opacity = (cfg.min_voxel_opacity * 255.0) as u8;
    let epsilon = if cfg.objects_max_view_distance > 0.0 {
        0.025
    } else {
        0.005
    };
    let mut culled = 0usize;

    for obj in &query.objects {
        if low_lod && !obj.shadow_caster {
            continue;
        }
        if low_lod && obj.bounds.size().z < bounds.size().z * 0.25 {
            continue;
        }

        let mut min_allowed = cfg.objects_max_view_distance
            * if obj.vegetation { 2.0 } else { 1.0 };
        if low_lod {
            min_allowed *= 4.0;
        }
        if obj.max_view_distance < min_allowed {
            culled += 1;
            continue;
        }

        let mut gathered = SuperMesh::new();

        for tri in &obj.triangles {
            let mut opacity = tri.opacity;
            if obj.vegetation {
                let cap = (cfg.vegetation_max_opacity * 255.0).clamp(0.0, 255.0) as u8;
                opacity = opacity.min(cap);
            }
            if opacity < min_opacity {
                continue;
            }

            let [a, b, c] = tri.positions;
            if a.abs_diff_eq(b, epsilon) || b.abs_diff_eq(c, epsilon) || c.abs_diff_eq(a, epsilon)
            {
                continue;
            }

            let area = tri_area_byte(a, b, c);
            if area == 0 && cfg.objects_max_view_distance > 0.0 {
                continue;
            }

            if !tri_intersects_aabb(bounds, a, b, c) {
                continue;
            }

            if under_terrain(params, obj.indoor, bounds, [a, b, c]) {
                continue;
            }

            gathered.add_triangle(RawTriangle {
                positions: tri.positions,
                uvs: tri.uvs,
                colors: tri.colors,
                normal: (b - a).cross(c - a).normalize_or_zero(),
                area,
                opacity,
                object_type: HitObjectType::Mesh,
                material: tri.material.clone(),
            });
        }

        mesh.merge(&mut gathered, OFFSET_MESH);
    }

    if culled > 0 {
        log::trace!("voxelize: {} objects culled by view distance", culled);
    }
}

fn under_terrain(params: &VoxelizeParams, indoor: bool, bounds: &Aabb, verts: [Vec3; 3]) -> bool {
    if params.cfg.voxelize_under_terrain || indoor {
        return false;
    }
    let Some(terrain) = &params.sources.terrain else {
        return false;
    };
    if !terrain.enabled() {
        return false;
    }
    for v in verts {
        let p = v.clamp(bounds.min, bounds.max);
        if p.z > terrain.height(p.x, p.y) - 1.0 || terrain.is_hole(p.x, p.y) {
            return false;
        }
    }
    true
}

fn terrain_tri(terrain: &dyn TerrainSource, corners: [(f32, f32); 3]) -> RawTriangle {
    let mut positions = [Vec3::ZERO; 3];
    for (i, (x, y)) in corners.into_iter().enumerate() {
        positions[i] = Vec3::new(x, y, terrain.height(x, y));
    }
    let [a, b, c] = positions;
    RawTriangle {
        positions,
        uvs: [Vec2::ZERO; 3],
        colors: [[255; 4]; 3],
        normal: (b - a).cross(c - a).normalize_or_zero(),
        area: tri_area_byte(a, b, c),
        opacity: 255,
        object_type: HitObjectType::Terrain,
        material: None,
    }
}

/// Triangulate the height field across the node box, two triangles per
/// cell. When the diagonal's surface types disagree, flip the split so the
/// long interpolated edge stays inside one surface type.
fn gather_terrain(mesh: &mut SuperMesh, terrain: &dyn TerrainSource, bounds: &Aabb, low_lod: bool) {
    let mut step = terrain.unit_size();
    if low_lod {
        step *= 4.0;
    }
    let half = step / 2.0;

    let mut gathered = SuperMesh::new();

    let mut x = bounds.min.x.floor();
    while x < bounds.max.x {
        let mut y = bounds.min.y.floor();
        while y < bounds.max.y {
            if terrain.is_hole(x + half, y + half) {
                y += step;
                continue;
            }

            let t10 = terrain.surface_type(x + step, y);
            let t01 = terrain.surface_type(x, y + step);
            let mut flip = false;
            if t10 != t01 {
                let t00 = terrain.surface_type(x, y);
                let t11 = terrain.surface_type(x + step, y + step);
                if (t10 == t00 && t10 == t11) || (t01 == t00 && t01 == t11) {
                    flip = true;
                }
            }

            let cells: [[(f32, f32); 3]; 2] = if flip {
                [
                    [(x + step, y), (x + step, y + step), (x, y)],
                    [(x, y), (x + step, y + step), (x, y + step)],
                ]
            } else {
                [
                    [(x, y), (x + step, y), (x, y + step)],
                    [(x + step, y), (x + step, y + step), (x, y + step)],
                ]
            };

            for corners in cells {
                let tri = terrain_tri(terrain, corners);
                let [a, b, c] = tri.positions;
                if tri_intersects_aabb(bounds, a, b, c) {
                    gathered.add_triangle(tri);
                }
            }

            y += step;
        }
        x += step;
    }

    mesh.merge(&mut gathered, OFFSET_TERRAIN);
}

/// Voxelize vis-area prisms as extruded polygon shells: side quads plus
/// top and bottom fans. Portals are skipped; they carve instead.
fn gather_vis_areas(
    mesh: &mut SuperMesh,
    vis: &dyn crate::scene::VisAreaSource,
    bounds: &Aabb,
    offset: f32,
) {
    let bounds_ex = bounds.inflate(Vec3::splat(offset));

    let mut areas = Vec::new();
    vis.collect_areas(&bounds_ex, &mut areas);

    for area in &areas {
        if area.portal || !area.bounds.intersects(&bounds_ex) {
            continue;
        }

        let mut gathered = SuperMesh::new();
        let points = &area.points;
        let n = points.len();
        let lift = Vec3::new(0.0, 0.0, area.height);

        let push = |positions: [Vec3; 3], gathered: &mut SuperMesh| {
            let [a, b, c] = positions;
            if tri_intersects_aabb(&bounds_ex, a, b, c) {
                gathered.add_triangle(RawTriangle {
                    positions,
                    uvs: [Vec2::ZERO; 3],
                    colors: [[0, 0, 0, 255]; 3],
                    normal: (b - a).cross(c - a).normalize_or_zero(),
                    area: tri_area_byte(a, b, c),
                    opacity: 255,
                    object_type: HitObjectType::VisArea,
                    material: None,
                });
            }
        };

        // sides
        for i in 0..n {
            let v0 = points[i];
            let v1 = points[(i + 1) % n];
            push([v0, v0 + lift, v1], &mut gathered);
            push([v1, v0 + lift, v1 + lift], &mut gathered);
        }

        // top and bottom fans
        for lift in [Vec3::ZERO, lift] {
            for p in 1..n.saturating_sub(1) {
                push(
                    [points[0] + lift, points[p] + lift, points[p + 1] + lift],
                    &mut gathered,
                );
            }
        }

        mesh.merge(&mut gathered, offset);
    }
}
