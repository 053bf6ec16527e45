//! Opaque sink for render data produced by this core.
//!
//! The host renderer owns the actual GPU resources; this core only pushes
//! 3D texture region updates and per-node metadata records at atlas
//! coordinates the packer chose.

use crate::core::types::{UVec3, Vec3};
use crate::segment::brick::Texel;

/// Which voxel channel a brick upload targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrickChannelKind {
    Opacity,
    Normal,
    Albedo,
}

/// One child slot in a node metadata record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildRef {
    /// Flat atlas offset of the child's brick, negative when absent.
    pub atlas_offset: i32,
    /// All of the child's own children hold atlas slots.
    pub ready: bool,
}

impl Default for ChildRef {
    fn default() -> Self {
        Self {
            atlas_offset: crate::segment::ATLAS_OFFSET_UNALLOCATED,
            ready: false,
        }
    }
}

/// Per-node record written into the node texture at the segment's atlas
/// position.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeMetadata {
    /// World-space cropped box.
    pub box_min: Vec3,
    pub box_max: Vec3,
    pub node_size: f32,
    /// Parent segment's flat atlas offset, if it holds a slot.
    pub parent_offset: Option<i32>,
    pub children: [ChildRef; 8],
    pub frame: u32,
}

/// Upload sink implemented by the host renderer.
pub trait RenderBackend {
    fn update_node_metadata(&mut self, block_min: UVec3, meta: &NodeMetadata);

    /// Upload a 3D texel region of one channel at a texel offset inside
    /// the atlas texture.
    fn upload_brick(
        &mut self,
        kind: BrickChannelKind,
        texel_offset: UVec3,
        size: UVec3,
        texels: &[Texel],
    );
}

/// Backend that discards everything (tools, headless tests).
pub struct NullBackend;

impl RenderBackend for NullBackend {
    fn update_node_metadata(&mut self, _block_min: UVec3, _meta: &NodeMetadata) {}
    fn upload_brick(
        &mut self,
        _kind: BrickChannelKind,
        _texel_offset: UVec3,
        _size: UVec3,
        _texels: &[Texel],
    ) {
    }
}

/// Backend recording every call, for tests.
#[derive(Default)]
pub struct RecordingBackend {
    pub node_updates: Vec<(UVec3, NodeMetadata)>,
    pub uploads: Vec<(BrickChannelKind, UVec3, UVec3, usize)>,
}

impl RenderBackend for RecordingBackend {
    fn update_node_metadata(&mut self, block_min: UVec3, meta: &NodeMetadata) {
        self.node_updates.push((block_min, *meta));
    }

    fn upload_brick(
        &mut self,
        kind: BrickChannelKind,
        texel_offset: UVec3,
        size: UVec3,
        texels: &[Texel],
    ) {
        self.uploads.push((kind, texel_offset, size, texels.len()));
    }
}

/// 3D atlas block coordinate of a flat atlas offset.
pub fn atlas_coord(offset: i32, dim_xy: u32) -> UVec3 {
    debug_assert!(offset >= 0);
    let offset = offset as u32;
    let z = offset / (dim_xy * dim_xy);
    let y = (offset - z * dim_xy * dim_xy) / dim_xy;
    let x = offset - z * dim_xy * dim_xy - y * dim_xy;
    UVec3::new(x, y, z)
}
