//! Deduplicating indexed-triangle accumulator used as voxelization input.
//!
//! Triangle soup from meshes, terrain and vis-area shells funnels through
//! here; vertices deduplicate by near-exact position + UV through a small
//! wrapped spatial hash, materials deduplicate by identity key. Capacity is
//! bounded by the `u16` index width; overflow degrades to "no more detail"
//! instead of erroring.

use std::sync::Arc;

use crate::core::types::{Vec2, Vec3};
use crate::math::Aabb;
use crate::scene::SceneMaterial;

/// Vertex index width; also the hard capacity bound.
pub type VertIndex = u16;

/// Wrapped hash grid dimension per axis.
pub const HASH_DIM: usize = 8;
/// Hash cell size in world units.
const HASH_CELL: f32 = 0.1;
/// Position / UV equivalence tolerance.
const EPSILON: f32 = 0.05;

/// Terrain shell displacement; terrain merges trigger a second, deeper copy.
pub const OFFSET_TERRAIN: f32 = -0.04;
/// Static mesh shell displacement.
pub const OFFSET_MESH: f32 = 0.02;

/// Source class of a triangle, kept per triangle through voxelization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitObjectType {
    Mesh,
    Terrain,
    VisArea,
}

#[derive(Clone, Copy, Debug)]
pub struct HitVertex {
    pub pos: Vec3,
    pub uv: Vec2,
    pub color: [u8; 4],
}

#[derive(Clone, Copy, Debug)]
pub struct HitTriangle {
    pub verts: [VertIndex; 3],
    pub material: u16,
    /// Quantized world-space face area.
    pub area: u8,
    pub opacity: u8,
    pub object_type: HitObjectType,
}

/// Triangle as submitted by a gathering pass, before indexing.
#[derive(Clone, Debug)]
pub struct RawTriangle {
    pub positions: [Vec3; 3],
    pub uvs: [Vec2; 3],
    pub colors: [[u8; 4]; 3],
    pub normal: Vec3,
    pub area: u8,
    pub opacity: u8,
    pub object_type: HitObjectType,
    pub material: Option<Arc<SceneMaterial>>,
}

#[derive(Debug)]
pub struct SuperMesh {
    verts: Vec<HitVertex>,
    tris: Vec<HitTriangle>,
    face_normals: Vec<Vec3>,
    materials: Vec<Option<Arc<SceneMaterial>>>,
    hash: Vec<Vec<VertIndex>>,
    bounds: Aabb,
}

fn material_matches(a: &Option<Arc<SceneMaterial>>, b: &Option<Arc<SceneMaterial>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.key == b.key,
        _ => false,
    }
}

impl SuperMesh {
    pub fn new() -> Self {
        Self {
            verts: Vec::new(),
            tris: Vec::new(),
            face_normals: Vec::new(),
            materials: Vec::new(),
            hash: vec![Vec::new(); HASH_DIM * HASH_DIM * HASH_DIM],
            bounds: Aabb::empty(),
        }
    }

    pub fn verts(&self) -> &[HitVertex] {
        &self.verts
    }

    pub fn tris(&self) -> &[HitTriangle] {
        &self.tris
    }

    pub fn material(&self, index: u16) -> Option<&Arc<SceneMaterial>> {
        self.materials.get(index as usize).and_then(|m| m.as_ref())
    }

    pub fn face_normal(&self, tri_index: usize) -> Vec3 {
        self.face_normals[tri_index]
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Bounding box of all merged (displaced) vertices.
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn is_empty(&self) -> bool {
        self.tris.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.verts.len() * std::mem::size_of::<HitVertex>()
            + self.tris.len() * std::mem::size_of::<HitTriangle>()
    }

    fn hash_bucket(&self, cell: [i64; 3]) -> &Vec<VertIndex> {
        let x = (cell[0].rem_euclid(HASH_DIM as i64)) as usize;
        let y = (cell[1].rem_euclid(HASH_DIM as i64)) as usize;
        let z = (cell[2].rem_euclid(HASH_DIM as i64)) as usize;
        &self.hash[z * HASH_DIM * HASH_DIM + y * HASH_DIM + x]
    }

    fn find_vertex(&self, pos: Vec3, uv: Vec2) -> Option<VertIndex> {
        let lo = ((pos - Vec3::splat(EPSILON)) / HASH_CELL).floor();
        let hi = ((pos + Vec3::splat(EPSILON)) / HASH_CELL).floor();

        for x in lo.x as i64..=hi.x as i64 {
            for y in lo.y as i64..=hi.y as i64 {
                for z in lo.z as i64..=hi.z as i64 {
                    for &idx in self.hash_bucket([x, y, z]) {
                        let v = &self.verts[idx as usize];
                        if v.pos.abs_diff_eq(pos, EPSILON) && v.uv.abs_diff_eq(uv, EPSILON) {
                            return Some(idx);
                        }
                    }
                }
            }
        }
        None
    }

    fn add_vertex(&mut self, vert: HitVertex) -> VertIndex {
        let cell = (vert.pos / HASH_CELL).floor();
        let x = (cell.x as i64).rem_euclid(HASH_DIM as i64) as usize;
        let y = (cell.y as i64).rem_euclid(HASH_DIM as i64) as usize;
        let z = (cell.z as i64).rem_euclid(HASH_DIM as i64) as usize;

        let idx = self.verts.len() as VertIndex;
        self.hash[z * HASH_DIM * HASH_DIM + y * HASH_DIM + x].push(idx);
        self.verts.push(vert);
        idx
    }

    fn find_or_add_material(&mut self, material: &Option<Arc<SceneMaterial>>) -> u16 {
        if let Some(idx) = self
            .materials
            .iter()
            .position(|m| material_matches(m, material))
        {
            return idx as u16;
        }
        self.materials.push(material.clone());
        (self.materials.len() - 1) as u16
    }

    /// Index a triangle into the mesh.
    ///
    /// Degenerate triangles (two vertices within tolerance) are dropped, and
    /// a triangle that would push the vertex count past the index width is
    /// silently ignored.
    pub fn add_triangle(&mut self, tri: RawTriangle) {
        if self.verts.len() + 3 > VertIndex::MAX as usize {
            return;
        }

        let [a, b, c] = tri.positions;
        if a.abs_diff_eq(b, EPSILON) || b.abs_diff_eq(c, EPSILON) || c.abs_diff_eq(a, EPSILON) {
            return;
        }

        let material = self.find_or_add_material(&tri.material);

        let mut verts = [0 as VertIndex; 3];
        for v in 0..3 {
            verts[v] = match self.find_vertex(tri.positions[v], tri.uvs[v]) {
                Some(idx) => idx,
                None => self.add_vertex(HitVertex {
                    pos: tri.positions[v],
                    uv: tri.uvs[v],
                    color: tri.colors[v],
                }),
            };
        }

        self.tris.push(HitTriangle {
            verts,
            material,
            area: tri.area,
            opacity: tri.opacity,
            object_type: tri.object_type,
        });
        self.face_normals.push(tri.normal);
    }

    /// Append another mesh, displacing its vertices along their smoothed
    /// normals by `vertex_offset` first.
    ///
    /// Triangle material indices remap through identity matching; vertex
    /// indices remap by a constant offset. Terrain merges re-enter once with
    /// a one-meter push to produce the thick lower shell. The source is
    /// consumed (cleared) by the outermost call.
    pub fn merge(&mut self, src: &mut SuperMesh, vertex_offset: f32) {
        self.merge_inner(src, vertex_offset);
        if vertex_offset == OFFSET_TERRAIN {
            self.merge_inner(src, -1.0);
        }
        src.clear();
    }

    fn merge_inner(&mut self, src: &mut SuperMesh, vertex_offset: f32) {
        if src.tris.is_empty() {
            return;
        }
        if self.verts.len() + src.verts.len() > VertIndex::MAX as usize {
            return;
        }

        // smoothed vertex normals from incident face normals
        let mut normals = vec![Vec3::ZERO; src.verts.len()];
        for (t, tri) in src.tris.iter().enumerate() {
            for &v in &tri.verts {
                normals[v as usize] += src.face_normals[t];
            }
        }

        for (v, vert) in src.verts.iter_mut().enumerate() {
            vert.pos += normals[v].normalize_or_zero() * vertex_offset;
            self.bounds.expand(vert.pos);
        }

        let vert_base = self.verts.len() as u32;

        let mat_map: Vec<u16> = src
            .materials
            .iter()
            .map(|m| self.find_or_add_material(m))
            .collect();

        for (t, tri) in src.tris.iter().enumerate() {
            let mut out = *tri;
            for v in 0..3 {
                out.verts[v] = (out.verts[v] as u32 + vert_base) as VertIndex;
            }
            out.material = mat_map[tri.material as usize];
            self.tris.push(out);
            self.face_normals.push(src.face_normals[t]);
        }

        self.verts.extend_from_slice(&src.verts);
    }

    pub fn clear(&mut self) {
        self.verts.clear();
        self.tris.clear();
        self.face_normals.clear();
        self.materials.clear();
        for bucket in &mut self.hash {
            bucket.clear();
        }
        self.bounds = Aabb::empty();
    }
}

impl Default for SuperMesh {
    fn default() -> Self {
        Self::new()
    }
}
