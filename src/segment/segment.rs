//! Per-node voxel payload and its streaming / atlas-binding state.

use crate::atlas::BlockId;
use crate::core::types::{IVec3, Vec3};
use crate::math::Aabb;
use crate::svo::arena::{NodeId, SegmentId};

use super::brick::{BrickChannels, CropInfo};
use super::voxelize::MeshShare;

/// Atlas offset sentinel: no slot allocated.
pub const ATLAS_OFFSET_UNALLOCATED: i32 = -2;

/// Streaming state machine. `InProgress -> Ready` is only ever set by the
/// main-thread completion handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamingStatus {
    NotLoaded,
    InProgress,
    Ready,
}

/// Single vertex emitted into the frame's mesh-proxy buffer for a drawn
/// segment. `uv.x` carries the flat atlas offset, `uv.y` the node size;
/// color packs the clipped-box fractions and the brick's max alpha.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProxyVertex {
    pub position: Vec3,
    pub uv: [f32; 2],
    pub color: [u8; 4],
}

/// Completed brick data produced off-thread, installed by the main thread.
#[derive(Debug)]
pub struct BrickPayload {
    pub channels: Option<BrickChannels>,
    pub crop: CropInfo,
    pub max_alpha: f32,
    pub voxel_count: u32,
}

/// Voxel brick owned by one octree node.
#[derive(Debug)]
pub struct Segment {
    pub id: u32,
    pub node: NodeId,
    pub parent: Option<SegmentId>,
    /// Node center; channel data is stored relative to it.
    pub origin: Vec3,
    /// Object-space box (world box translated to the origin).
    pub bounds_os: Aabb,
    /// World-space box of the cropped region, valid while an atlas slot is held.
    pub clipped_bounds: Aabb,
    pub status: StreamingStatus,
    /// Byte offset of the persisted brick record, -1 when none.
    pub file_offset: i64,
    /// Persisted record length; negative means "voxelize on demand".
    pub file_length: i32,
    pub channels: Option<BrickChannels>,
    pub crop: CropInfo,
    /// Flat index of the atlas block min corner, negative when unallocated.
    pub atlas_offset: i32,
    pub block: Option<BlockId>,
    /// Flat atlas offsets of the eight children, -2 when absent.
    pub child_offsets: [i32; 8],
    /// Bit per child: all of that child's own children hold atlas slots.
    pub child_ready_mask: u8,
    /// 0 = clean, 1 = some descendant changed, 2 = rewrite this record.
    pub child_offsets_dirty: u8,
    pub last_rendered_frame: u32,
    pub last_tex_update_frame: u32,
    pub static_lights_changed: bool,
    pub geometry_checksum: IVec3,
    pub lights_checksum: IVec3,
    pub max_alpha: f32,
    pub voxel_count: u32,
    /// Octants of the node box that overlap gathered triangles.
    pub child_tris_mask: u8,
    pub proxy_vertex: ProxyVertex,
    /// Area triangle store; the area parent builds it, descendants share it.
    pub mesh: MeshShare,
    pub owns_mesh: bool,
    /// Triangle ids gathered for this node's box out of the shared store.
    pub merged_tris: Vec<u32>,
    /// Bounds of the gathered triangles.
    pub tris_bounds: Aabb,
}

impl Segment {
    pub fn new(id: u32, node: NodeId, parent: Option<SegmentId>, node_bounds: Aabb) -> Self {
        let origin = node_bounds.center();
        let bounds_os = Aabb::new(node_bounds.min - origin, node_bounds.max - origin);
        Self {
            id,
            node,
            parent,
            origin,
            bounds_os,
            clipped_bounds: Aabb::default(),
            status: StreamingStatus::NotLoaded,
            file_offset: -1,
            file_length: -1,
            channels: None,
            crop: CropInfo::default(),
            atlas_offset: ATLAS_OFFSET_UNALLOCATED,
            block: None,
            child_offsets: [ATLAS_OFFSET_UNALLOCATED; 8],
            child_ready_mask: 0,
            child_offsets_dirty: 0,
            last_rendered_frame: 0,
            last_tex_update_frame: 0,
            static_lights_changed: false,
            geometry_checksum: IVec3::ZERO,
            lights_checksum: IVec3::ZERO,
            max_alpha: 0.0,
            voxel_count: 0,
            child_tris_mask: 0,
            proxy_vertex: ProxyVertex::default(),
            mesh: MeshShare::default(),
            owns_mesh: false,
            merged_tris: Vec::new(),
            tris_bounds: Aabb::empty(),
        }
    }

    /// Node edge length in world units.
    pub fn box_size(&self) -> f32 {
        self.bounds_os.size().x
    }

    /// World-space node box.
    pub fn bounds_ws(&self) -> Aabb {
        Aabb::new(self.bounds_os.min + self.origin, self.bounds_os.max + self.origin)
    }

    pub fn has_atlas_slot(&self) -> bool {
        self.atlas_offset >= 0
    }

    /// Install a completed stream/build result.
    pub fn install_payload(&mut self, payload: BrickPayload) {
        self.channels = payload.channels;
        self.crop = payload.crop;
        self.max_alpha = payload.max_alpha;
        self.voxel_count = payload.voxel_count;
    }

    /// Return channel buffers to the pool and drop gathered triangles.
    ///
    /// A shared area store is released by reference count; a descendant
    /// dropping its handle never frees the owner's data.
    pub fn free_brick_data(&mut self) {
        self.channels = None;
        self.crop = CropInfo::default();
        self.merged_tris = Vec::new();
        self.tris_bounds = Aabb::empty();
        if self.owns_mesh {
            self.mesh.write().expect("area mesh lock").clear();
        }
        self.mesh = MeshShare::default();
        self.owns_mesh = false;
    }
}
